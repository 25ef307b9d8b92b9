use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use futures::future::{BoxFuture, FutureExt, Shared};

struct Flight<T> {
    id: u64,
    key: u64,
    future: Shared<BoxFuture<'static, T>>,
}

/// Coalesces concurrent calls into one in-flight operation per key.
///
/// The first caller starts the operation; anyone arriving with the same key
/// while it runs awaits the same future and receives a clone of its output.
/// A caller with a different key never joins, it replaces the slot.
pub struct SingleFlight<T: Clone> {
    slot: Mutex<Option<Flight<T>>>,
    next_id: AtomicU64,
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            next_id: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Flight<T>>> {
        // The slot holds no invariant a panic could break
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `start()` unless an operation for `key` is already in flight.
    ///
    /// Returns the output and whether this caller joined an existing flight.
    pub async fn run<F, Fut>(&self, key: u64, start: F) -> (T, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (id, future, joined) = {
            let mut slot = self.lock();
            match slot.as_ref() {
                Some(flight) if flight.key == key => (flight.id, flight.future.clone(), true),
                _ => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let future = start().boxed().shared();
                    *slot = Some(Flight {
                        id,
                        key,
                        future: future.clone(),
                    });
                    (id, future, false)
                }
            }
        };

        let output = future.await;

        let mut slot = self.lock();
        if slot.as_ref().map(|flight| flight.id) == Some(id) {
            *slot = None;
        }
        (output, joined)
    }

    #[cfg(test)]
    fn in_flight(&self) -> bool {
        self.lock().is_some()
    }
}
