//! Analyst workspace terminal client.
//!
//! Signs in (or resumes the stored session), keeps the session alive in the
//! background and shows the remaining token lifetime. Ctrl-C quits and keeps
//! the session for next time; `--logout` signs out and forgets it.

use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use analyst_core::{
    ApiClient, Config, CredentialStore, Credentials, FileStore, KeyringStore, SessionController,
    SessionEvent, StorageBackend,
};

// ============================================================================
// Constants
// ============================================================================

/// Directory for rolling log files; logs go to stderr when unset
const LOG_DIR_ENV: &str = "ANALYST_LOG_DIR";

const LOG_FILE_PREFIX: &str = "analyst.log";

/// How often the countdown line is redrawn
const DISPLAY_INTERVAL: Duration = Duration::from_secs(1);

/// Initialize the tracing subscriber for logging.
///
/// The returned guard flushes the file writer and must live until exit.
fn init_tracing() -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    match std::env::var_os(LOG_DIR_ENV) {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .with(filter)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(io::stderr))
                .with(filter)
                .init();
            None
        }
    }
}

fn open_store(config: &Config) -> Result<Arc<dyn CredentialStore>> {
    let store: Arc<dyn CredentialStore> = match config.storage {
        StorageBackend::File => Arc::new(FileStore::new(config.cache_dir()?)),
        StorageBackend::Keyring => Arc::new(KeyringStore::new()),
    };
    Ok(store)
}

fn prompt_username(default: Option<&str>) -> Result<String> {
    match default {
        Some(name) => print!("Username [{}]: ", name),
        None => print!("Username: "),
    }
    io::stdout().flush()?;

    let mut username = String::new();
    io::stdin().read_line(&mut username)?;
    let username = username.trim();
    if username.is_empty() {
        Ok(default.unwrap_or_default().to_string())
    } else {
        Ok(username.to_string())
    }
}

fn prompt_credentials(default_username: Option<String>) -> Result<Credentials> {
    let username = prompt_username(default_username.as_deref())?;
    let password = rpassword::prompt_password("Password: ")?;
    Ok(Credentials::new(username, password))
}

/// Prompt until a login succeeds, remembering the username on success.
async fn sign_in(controller: &SessionController, config: &mut Config) -> Result<()> {
    loop {
        let last_username = config.last_username.clone();
        let credentials = tokio::task::spawn_blocking(move || prompt_credentials(last_username))
            .await
            .context("Credential prompt failed")??;

        if credentials.username.is_empty() || credentials.password.is_empty() {
            eprintln!("Username and password required");
            continue;
        }

        match controller.login(&credentials).await {
            Ok(user) => {
                println!("Signed in as {}", user.display_name());
                config.last_username = Some(credentials.username);
                if let Err(e) = config.save() {
                    warn!(error = %e, "Failed to save config");
                }
                return Ok(());
            }
            Err(e) if e.is_transient() => eprintln!("Could not reach the server: {}", e),
            Err(e) => eprintln!("Sign-in failed: {}", e),
        }
    }
}

fn format_remaining(seconds: i64) -> String {
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}

fn draw_status(controller: &SessionController) -> Result<()> {
    print!(
        "\rSession {:<13} {}   ",
        controller.session_state().label(),
        format_remaining(controller.current_remaining_seconds())
    );
    io::stdout().flush()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    let _log_guard = init_tracing();

    let logout_only = std::env::args().skip(1).any(|arg| arg == "--logout");

    let mut config = Config::load().context("Failed to load config")?;
    config.apply_env();
    info!(api = %config.api_base_url, storage = ?config.storage, "Analyst client starting");

    let store = open_store(&config)?;
    let client = ApiClient::new(&config).context("Failed to build HTTP client")?;
    let controller = SessionController::new(Arc::new(client), store, config.timing.clone());

    if logout_only {
        controller.logout()?;
        println!("Signed out.");
        return Ok(());
    }

    let mut events = controller.subscribe();
    if controller.resume()? {
        match controller.user() {
            Ok(Some(user)) => println!("Welcome back, {}", user.display_name()),
            Ok(None) => println!("Resumed previous session"),
            Err(e) => warn!(error = %e, "Stored user record is unreadable"),
        }
    } else {
        sign_in(&controller, &mut config).await?;
    }

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut display = tokio::time::interval(DISPLAY_INTERVAL);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                println!();
                break;
            }
            event = events.recv() => match event {
                Ok(SessionEvent::Expired { message }) => println!("\n{}", message),
                Ok(SessionEvent::Redirect) => {
                    println!();
                    sign_in(&controller, &mut config).await?;
                }
                Ok(SessionEvent::Refreshed { remaining_seconds }) => {
                    info!(remaining_seconds, "Session renewed");
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Missed session events"),
                Err(RecvError::Closed) => break,
            },
            _ = display.tick() => draw_status(&controller)?,
        }
    }

    Ok(())
}
