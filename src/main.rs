use clap::{Parser, Subcommand};
use sms_relay::broker::SessionEvent;
use sms_relay::config::Config;
use sms_relay::credentials::{CredentialStore, Credentials, FileCredentialStore};
use sms_relay::status::StatusBus;
use sms_relay::supervisor::{StartOutcome, Supervisor};
use sms_relay::{carrier, indicator};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sms-relay")]
#[command(about = "Relays messages from an MQTT topic to SMS")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Connect to the broker and relay until interrupted (default)
    Run {
        /// Started by the host at boot rather than by hand
        #[arg(long)]
        boot: bool,
    },
    /// Save broker credentials for later runs
    Configure {
        /// Broker URI, e.g. tcp://192.168.1.133:1883 or ssl://broker:8883
        #[arg(long)]
        endpoint: String,
        #[arg(long)]
        username: String,
        #[arg(long)]
        password: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load_or_default(&cli.config);
    init_logging(&config.logging.level);

    let store = Arc::new(FileCredentialStore::new(config.credentials.path.clone()));

    match cli.command.unwrap_or(Command::Run { boot: false }) {
        Command::Configure {
            endpoint,
            username,
            password,
        } => {
            store.save(&Credentials::new(endpoint, username, password))?;
            info!("Credentials saved to {:?}", store.path());
            Ok(())
        }
        Command::Run { boot } => run(config, store, boot).await,
    }
}

/// `RUST_LOG` wins over the configured level
fn init_logging(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(config: Config, store: Arc<FileCredentialStore>, boot: bool) -> anyhow::Result<()> {
    info!("SMS Relay v{}", env!("CARGO_PKG_VERSION"));
    info!("===========================================");
    info!("MQTT → SMS relay");
    info!("===========================================");

    let gateway = carrier::from_config(&config.carrier)?;
    let indicator = indicator::from_config(&config.indicator);
    let status = Arc::new(StatusBus::new());

    let _status_log = status.attach(|subscribed: bool| {
        if subscribed {
            info!("Status: subscribed");
        } else {
            info!("Status: not subscribed");
        }
    });

    let supervisor = Arc::new(Supervisor::new(
        config,
        store,
        status,
        gateway,
        indicator,
    ));

    tokio::spawn(log_session_events(supervisor.events()));

    let started = if boot {
        supervisor.on_boot_completed().await
    } else {
        supervisor.start().await
    };
    match started {
        Ok(StartOutcome::Started) => info!("Relay running. Press Ctrl+C to stop."),
        Ok(StartOutcome::AlreadyRunning) => info!("Relay already running"),
        Err(e) => {
            error!("{:#}", e);
            return Err(e);
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    supervisor.shutdown().await;

    Ok(())
}

/// The one-line notices a user would want to see for each session change
async fn log_session_events(mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::Connected { reconnect: false }) => info!("Connected"),
            Ok(SessionEvent::Connected { reconnect: true }) => info!("Reconnected"),
            Ok(SessionEvent::ConnectFailed { cause }) => error!("Failed to connect: {}", cause),
            Ok(SessionEvent::ConnectionLost { cause }) => {
                warn!("The connection was lost ({})", cause)
            }
            Ok(SessionEvent::Subscribed { topic }) => info!("Subscribed to {}", topic),
            Ok(SessionEvent::SubscribeFailed { topic, cause }) => {
                error!("Failed to subscribe to {}: {}", topic, cause)
            }
            Ok(SessionEvent::Disconnected) => info!("Disconnected"),
            Err(broadcast::error::RecvError::Lagged(n)) => warn!("Missed {} session events", n),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
