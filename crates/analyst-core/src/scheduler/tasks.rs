use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One periodic task spawned on the runtime.
struct ScheduledTask {
    name: &'static str,
    handle: JoinHandle<()>,
}

/// The periodic tasks belonging to one monitoring run.
///
/// All tasks share a single cancellation token, so one call stops every
/// timer the run started.
pub struct TaskSet {
    cancel: CancellationToken,
    tasks: Vec<ScheduledTask>,
}

impl TaskSet {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    /// Spawn `tick` every `period`, first firing one period from now.
    ///
    /// A tick in progress runs to completion; cancellation is observed
    /// between ticks.
    pub fn spawn_periodic<F, Fut>(&mut self, name: &'static str, period: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                tick().await;
            }
            debug!(task = name, "Periodic task stopped");
        });

        self.tasks.push(ScheduledTask { name, handle });
    }

    /// Signal every task to stop after its current tick.
    ///
    /// Safe to call from inside one of the tasks.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancel and abort every task, including ticks in progress.
    pub fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            debug!(task = task.name, "Aborting periodic task");
            task.handle.abort();
        }
    }

    #[cfg(test)]
    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.tasks.len()
    }
}
