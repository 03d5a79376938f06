//! Roomy CLI - manage the local session and worker credentials.
//!
//! Every invocation opens the config directory, performs one session
//! operation and exits.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use roomy_core::api::KeyserverClient;
use roomy_core::auth::{SessionManager, StoredSessionClient};
use roomy_core::{AuthError, CliSession, Config};
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// ============================================================================
// Constants
// ============================================================================

/// Write logs to this file instead of stderr
const LOG_FILE_ENV: &str = "ROOMY_LOG_FILE";

/// Worker secret for non-interactive `worker add`
const WORKER_SECRET_ENV: &str = "ROOMY_WORKER_SECRET";

const USAGE: &str = "\
Usage: roomy <command>

Commands:
  status                        Show the current session
  whoami                        Print the current account, failing if logged out
  logout                        End the current session
  worker add <id> <name>        Register a worker and make it current
  worker list                   List registered workers
  worker remove <id>            Delete a worker's credentials

Environment:
  ROOMY_CONFIG_DIR              Config directory (default ~/.roomy-cli)
  ROOMY_KEYSERVER_URL           Keyserver base URL
  ROOMY_USE_KEYCHAIN            Set to 0 to keep secrets in the config directory
  ROOMY_WORKER_SECRET           Secret for `worker add` (prompted if unset)
  ROOMY_LOG_FILE                Write logs to this file
  RUST_LOG                      Log filter (default warn)";

/// Initialize the tracing subscriber for logging.
/// The returned guard flushes the log file when dropped.
fn init_tracing() -> Result<Option<WorkerGuard>> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    match std::env::var_os(LOG_FILE_ENV) {
        Some(path) if !path.is_empty() => {
            let path = PathBuf::from(path);
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(file);

            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .with(filter)
                .init();
            Ok(Some(guard))
        }
        _ => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(io::stderr))
                .with(filter)
                .init();
            Ok(None)
        }
    }
}

// ============================================================================
// Commands
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Command {
    Status,
    Whoami,
    Logout,
    WorkerAdd { worker_id: String, public_name: String },
    WorkerList,
    WorkerRemove { worker_id: String },
    Help,
}

fn parse_args(args: &[String]) -> Result<Command> {
    let args: Vec<&str> = args.iter().map(String::as_str).collect();

    let command = match args.as_slice() {
        [] | ["status"] => Command::Status,
        ["whoami"] => Command::Whoami,
        ["logout"] => Command::Logout,
        ["worker", "add", worker_id, public_name] => Command::WorkerAdd {
            worker_id: worker_id.to_string(),
            public_name: public_name.to_string(),
        },
        ["worker", "list"] => Command::WorkerList,
        ["worker", "remove", worker_id] => Command::WorkerRemove {
            worker_id: worker_id.to_string(),
        },
        ["help"] | ["-h"] | ["--help"] => Command::Help,
        _ => anyhow::bail!("Unrecognized command: {}\n\n{}", args.join(" "), USAGE),
    };
    Ok(command)
}

/// Worker secret from the environment, or prompted without echo
fn read_worker_secret() -> Result<String> {
    if let Ok(secret) = std::env::var(WORKER_SECRET_ENV) {
        if !secret.is_empty() {
            return Ok(secret);
        }
    }
    rpassword::prompt_password("Worker secret: ").context("Failed to read worker secret")
}

fn describe(session: &CliSession) -> String {
    match session {
        CliSession::OAuth {
            subject_id, handle, ..
        } => format!("Logged in as @{} ({})", handle, subject_id),
        CliSession::Worker(worker) => format!(
            "Running as worker {} ({})",
            worker.public_name, worker.worker_id
        ),
    }
}

async fn run<W, F>(
    manager: &SessionManager,
    command: Command,
    worker_secret: F,
    out: &mut W,
) -> Result<()>
where
    W: Write,
    F: FnOnce() -> Result<String>,
{
    debug!(?command, "Running command");

    match command {
        Command::Status => match manager.load_session() {
            Some(session) => writeln!(out, "{}", describe(&session))?,
            None => writeln!(out, "Not logged in")?,
        },
        Command::Whoami => {
            let session = manager.require_session()?;
            writeln!(out, "{}", session.sync_credentials().account_id)?;
        }
        Command::Logout => {
            if manager.clear_session().await? {
                writeln!(out, "Logged out")?;
            } else {
                writeln!(out, "No active session found")?;
            }
        }
        Command::WorkerAdd {
            worker_id,
            public_name,
        } => {
            let secret = worker_secret()?;
            let session = manager
                .register_worker(&worker_id, &public_name, &secret)
                .await?;
            writeln!(out, "{}", describe(&session))?;
        }
        Command::WorkerList => {
            let workers = manager.list_workers();
            if workers.is_empty() {
                writeln!(out, "No workers registered")?;
            }
            for worker in workers {
                writeln!(
                    out,
                    "{}\t{}\t{}",
                    worker.worker_id,
                    worker.public_name,
                    worker.created_at.format("%Y-%m-%d %H:%M")
                )?;
            }
        }
        Command::WorkerRemove { worker_id } => {
            manager.remove_worker(&worker_id)?;
            writeln!(out, "Removed worker {}", worker_id)?;
        }
        Command::Help => writeln!(out, "{}", USAGE)?,
    }

    Ok(())
}

fn build_manager(config: Config) -> Result<SessionManager> {
    let oauth = Arc::new(StoredSessionClient::new(&config));
    let keyserver = Arc::new(
        KeyserverClient::from_config(&config).context("Failed to create keyserver client")?,
    );
    Ok(SessionManager::new(config, oauth, keyserver))
}

/// Message for errors the user can act on without reading a log
fn user_message(error: &anyhow::Error) -> String {
    let auth_error = error
        .chain()
        .find_map(|cause| cause.downcast_ref::<AuthError>());

    match auth_error {
        Some(AuthError::NoSession) => {
            "Not logged in. Register a worker with `roomy worker add <id> <name>` first.".to_string()
        }
        Some(AuthError::LockHeld { .. }) => {
            "Another roomy command is updating the session. Try again in a moment.".to_string()
        }
        _ => format!("Error: {:#}", error),
    }
}

async fn try_main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = parse_args(&args)?;

    let config = Config::from_env().context("Failed to load configuration")?;
    info!(config_dir = %config.dir().display(), "Roomy CLI starting");

    let manager = build_manager(config)?;
    let mut stdout = io::stdout().lock();
    run(&manager, command, read_worker_secret, &mut stdout).await
}

#[tokio::main]
async fn main() {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let guard = match init_tracing() {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    };

    let code = match try_main().await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("{}", user_message(&e));
            1
        }
    };

    // Flush the log file before exiting
    drop(guard);
    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn args(line: &str) -> Vec<String> {
        line.split_whitespace().map(str::to_string).collect()
    }

    fn test_manager() -> (SessionManager, TempDir) {
        let dir = TempDir::new().unwrap();
        let mut config = Config::with_dir(dir.path());
        // Nothing in these tests reaches the keyserver
        config.keyserver_url = "http://127.0.0.1:9".to_string();
        (build_manager(config).unwrap(), dir)
    }

    async fn run_line(manager: &SessionManager, line: &str) -> Result<String> {
        let mut out = Vec::new();
        let command = parse_args(&args(line))?;
        run(manager, command, || Ok("secret123".to_string()), &mut out).await?;
        Ok(String::from_utf8(out).unwrap())
    }

    #[test]
    fn test_parse_args() {
        assert_eq!(parse_args(&args("")).unwrap(), Command::Status);
        assert_eq!(parse_args(&args("logout")).unwrap(), Command::Logout);
        assert_eq!(
            parse_args(&args("worker add w1 Bot")).unwrap(),
            Command::WorkerAdd {
                worker_id: "w1".to_string(),
                public_name: "Bot".to_string()
            }
        );
        assert!(parse_args(&args("worker add w1")).is_err());
        assert!(parse_args(&args("frobnicate")).is_err());
        // Interactive OAuth login needs a browser flow this binary does not carry
        assert!(parse_args(&args("login alice.bsky.social")).is_err());
    }

    #[tokio::test]
    async fn test_worker_lifecycle() {
        let (manager, _dir) = test_manager();

        assert_eq!(run_line(&manager, "status").await.unwrap(), "Not logged in\n");

        let added = run_line(&manager, "worker add w1 Bot").await.unwrap();
        assert_eq!(added, "Running as worker Bot (w1)\n");
        assert_eq!(run_line(&manager, "whoami").await.unwrap(), "w1\n");

        let listed = run_line(&manager, "worker list").await.unwrap();
        assert!(listed.starts_with("w1\tBot\t"));

        assert_eq!(run_line(&manager, "logout").await.unwrap(), "Logged out\n");
        assert_eq!(
            run_line(&manager, "logout").await.unwrap(),
            "No active session found\n"
        );

        // Logout keeps the worker around until it is removed
        assert!(run_line(&manager, "worker list").await.unwrap().contains("Bot"));
        run_line(&manager, "worker remove w1").await.unwrap();
        assert_eq!(
            run_line(&manager, "worker list").await.unwrap(),
            "No workers registered\n"
        );
    }

    #[tokio::test]
    async fn test_whoami_without_session_asks_for_login() {
        let (manager, _dir) = test_manager();

        let err = run_line(&manager, "whoami").await.unwrap_err();
        assert!(user_message(&err).starts_with("Not logged in."));
    }

    #[tokio::test]
    async fn test_whoami_after_oauth_session_saved() {
        let (manager, _dir) = test_manager();
        let session = CliSession::OAuth {
            subject_id: "did:plc:alice".to_string(),
            handle: "alice.bsky.social".to_string(),
            derived_secret: "pass".to_string(),
        };
        manager.save_session(&session).await.unwrap();

        assert_eq!(
            run_line(&manager, "status").await.unwrap(),
            "Logged in as @alice.bsky.social (did:plc:alice)\n"
        );
        assert_eq!(run_line(&manager, "whoami").await.unwrap(), "did:plc:alice\n");
    }

    #[test]
    fn test_lock_contention_message() {
        let err = anyhow::Error::new(AuthError::LockHeld {
            key: "session".to_string(),
        });
        assert!(user_message(&err).contains("Try again"));
    }
}
