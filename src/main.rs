use color_eyre::Result;
use plantlink::config::LinkConfig;
use plantlink::device::commands::{Command, CommandDispatcher, CommandOutcome, WateringDuration};
use plantlink::mqtt::connection::ConnectionManager;
use plantlink::session::{Anonymous, CredentialProvider, StaticCredentials};
use plantlink::store::StateStore;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

const HELP: &str = "commands: start <secs> | stop | last | ping | status | quit";

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let path = LinkConfig::resolve_path(std::env::args().nth(1).map(PathBuf::from));
    let config = LinkConfig::load(&path).await?;
    info!("Using configuration {}", path.display());

    let credentials: Arc<dyn CredentialProvider> = match &config.credentials {
        Some(credentials) => Arc::new(StaticCredentials::from(credentials)),
        None => Arc::new(Anonymous),
    };

    let store = Arc::new(StateStore::new());
    let _printer = spawn_printer(store.clone());

    let (manager, dispatcher) = ConnectionManager::create(config, store.clone(), credentials).connect();

    println!("{}", HELP);
    run_console(&dispatcher, &store).await?;

    let _stopped = manager.teardown().await;
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}

/// Prints every snapshot change and every notice until the store goes away
fn spawn_printer(store: Arc<StateStore>) -> tokio::task::JoinHandle<()> {
    let mut snapshots = store.subscribe();
    let mut notices = store.notices();
    drop(store);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = snapshots.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let snapshot = snapshots.borrow_and_update().clone();
                    println!("{}", snapshot);
                }
                notice = notices.recv() => match notice {
                    Ok(notice) => println!("! {}", notice),
                    Err(RecvError::Lagged(skipped)) => warn!("Skipped {} notices", skipped),
                    Err(RecvError::Closed) => break,
                }
            }
        }
        debug!("Printer finished");
    })
}

/// Reads commands from stdin until `quit`, EOF or Ctrl-C
async fn run_console(dispatcher: &CommandDispatcher, store: &StateStore) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received");
                None
            }
        };
        let Some(line) = line else {
            break;
        };

        let input = line.trim();
        match input {
            "" => continue,
            "quit" | "exit" => break,
            "status" => println!("{}", store.snapshot()),
            "help" => println!("{}", HELP),
            _ => match parse_console_command(input) {
                Some(command) => match dispatcher.execute(command).await {
                    CommandOutcome::Sent => {}
                    CommandOutcome::NotConnected => println!("not connected, '{}' ignored", command),
                    CommandOutcome::Failed(reason) => debug!("'{}' failed: {}", command, reason),
                },
                None => println!("{}", HELP),
            },
        }
    }

    Ok(())
}

/// Like `Command::from_str`, but pulls out-of-range durations into 1-60 s
fn parse_console_command(input: &str) -> Option<Command> {
    let mut words = input.split_whitespace();
    if words.next() == Some("start") {
        let seconds: i64 = words.next()?.parse().ok()?;
        if words.next().is_some() {
            return None;
        }
        let duration = WateringDuration::clamped(seconds);
        if i64::from(duration.seconds()) != seconds {
            println!("duration clamped to {}", duration);
        }
        return Some(Command::StartWatering(duration));
    }
    input.parse().ok()
}
