//! fleetsync - fleet telemetry from the command line
//!
//! `fleetsync watch` logs in, seeds the fleet from the backend roster, and
//! prints the fleet as it changes until interrupted.
//!
//! `fleetsync send` opens the telemetry channel just long enough to deliver
//! one operator message.

use clap::{Args, Parser as ClapParser, Subcommand};
use fleetsync::{
    backend::{BackendClient, BackendError},
    channel::ChannelState,
    config::{ConfigError, FleetConfig},
    dashboard::FleetSync,
    fleet::FleetSnapshot,
    protocol::OutboundMessage,
    session::{Session, SessionContext},
};
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// fleetsync - real-time fleet telemetry
#[derive(ClapParser, Debug)]
#[command(name = "fleetsync", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to $XDG_CONFIG_HOME/fleetsync/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Args, Debug, Default)]
struct ConnectArgs {
    /// Backend REST base URL
    #[arg(long, env = "FLEETSYNC_API_URL")]
    api_url: Option<String>,

    /// Telemetry channel URL (derived from the API URL when unset)
    #[arg(long, env = "FLEETSYNC_CHANNEL_URL")]
    channel_url: Option<String>,

    /// Existing session token; skips the login request
    #[arg(long, env = "FLEETSYNC_TOKEN")]
    token: Option<String>,

    #[arg(long, env = "FLEETSYNC_USERNAME")]
    username: Option<String>,

    #[arg(long, env = "FLEETSYNC_PASSWORD", hide_env_values = true)]
    password: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Follow the fleet until interrupted
    Watch {
        #[command(flatten)]
        connect: ConnectArgs,

        /// Print the event feed as JSON lines instead of fleet summaries
        #[arg(long)]
        json: bool,
    },

    /// Send one operator message over the telemetry channel
    Send {
        #[command(flatten)]
        connect: ConnectArgs,

        /// Message text. Sent as JSON when it parses as a JSON object.
        message: String,
    },
}

#[derive(Error, Debug)]
pub enum CliError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("no credentials: pass --token or --username/--password, or set them in the config file")]
    NoCredentials,

    #[error("channel did not open within {0:?}")]
    ChannelNotOpen(std::time::Duration),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "fleetsync=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let cli = Cli::parse();
    init_tracing();

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Watch { connect, json } => run_watch(config, connect, json).await,
        Commands::Send { connect, message } => run_send(config, connect, message).await,
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<FleetConfig, CliError> {
    let path = match path {
        Some(p) => Some(p.to_path_buf()),
        None => FleetConfig::default_path(),
    };
    let Some(path) = path else {
        return Ok(FleetConfig::default());
    };
    let config = FleetConfig::load(&path)?;
    if config.is_some() {
        tracing::debug!(path = %path.display(), "loaded config");
    }
    Ok(config.unwrap_or_default())
}

fn apply_overrides(config: &mut FleetConfig, args: &ConnectArgs) {
    if let Some(url) = &args.api_url {
        config.backend.api_url = url.clone();
    }
    if let Some(url) = &args.channel_url {
        config.channel.url = Some(url.clone());
    }
}

/// A session plus whether this process created it (and so should end it).
struct Login {
    session: Session,
    owned: bool,
}

async fn login(
    config: &FleetConfig,
    args: &ConnectArgs,
    client: &BackendClient,
) -> Result<Login, CliError> {
    if let Some(token) = &args.token {
        return Ok(Login {
            session: Session::authenticated(token.clone()),
            owned: false,
        });
    }

    let stored = config.credentials.as_ref();
    let username = args
        .username
        .clone()
        .or_else(|| stored.map(|c| c.username.clone()));
    let password = args
        .password
        .clone()
        .or_else(|| stored.map(|c| c.password.clone()));
    let (Some(username), Some(password)) = (username, password) else {
        return Err(CliError::NoCredentials);
    };

    let session = client.create_session(&username, &password).await?;
    Ok(Login {
        session,
        owned: true,
    })
}

async fn logout(client: &BackendClient, login: Login) {
    if !login.owned {
        return;
    }
    if let Err(e) = client.delete_session(&login.session).await {
        tracing::warn!(error = %e, "failed to delete session");
    }
}

// ── watch ──────────────────────────────────────────────────────────

async fn run_watch(mut config: FleetConfig, args: ConnectArgs, json: bool) -> Result<(), CliError> {
    apply_overrides(&mut config, &args);
    let client = BackendClient::new(&config.backend.api_url)?;
    let mut sync = FleetSync::new(&config)?;
    let login = login(&config, &args, &client).await?;

    match client.roster().await {
        Ok(roster) => {
            let added = sync.seed(roster);
            tracing::info!(added, "seeded fleet from roster");
        }
        Err(e) => tracing::warn!(error = %e, "could not fetch robot roster"),
    }

    let sessions = SessionContext::new();
    sync.follow(&sessions);
    sessions.login(login.session.token.clone());

    let mut channel_state = sync.watch_channel_state();
    let mut updates = sync.updates();
    let mut events = sync.subscribe_events();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            res = &mut ctrl_c => {
                res?;
                tracing::info!("interrupted, shutting down");
                break;
            }
            changed = channel_state.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *channel_state.borrow_and_update();
                tracing::info!(?state, "channel state");
            }
            snapshot = updates.next(), if !json => {
                match snapshot {
                    Some(snapshot) => print_snapshot(&snapshot),
                    None => break,
                }
            }
            event = events.recv(), if json => {
                match event {
                    Ok(event) => match serde_json::to_string(&event) {
                        Ok(line) => println!("{}", line),
                        Err(e) => tracing::warn!(error = %e, "failed to encode event"),
                    },
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "event feed lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    sessions.logout();
    sync.shutdown().await;
    logout(&client, login).await;
    Ok(())
}

fn print_snapshot(snapshot: &FleetSnapshot) {
    let counts: Vec<String> = fleetsync::fleet::RobotStatus::ALL
        .iter()
        .map(|status| format!("{}={}", status.wire_name(), snapshot.count(*status)))
        .collect();
    println!("connected={} {}", snapshot.total_connected, counts.join(" "));
    for robot in snapshot.robots.values() {
        let metrics: Vec<String> = robot
            .telemetry
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect();
        println!(
            "  {:<12} {:<24} {:<10} {}",
            robot.id.as_str(),
            robot.display_name,
            robot.status.tone().label(),
            metrics.join(" ")
        );
    }
}

// ── send ───────────────────────────────────────────────────────────

async fn run_send(mut config: FleetConfig, args: ConnectArgs, message: String) -> Result<(), CliError> {
    apply_overrides(&mut config, &args);
    let client = BackendClient::new(&config.backend.api_url)?;
    let mut sync = FleetSync::new(&config)?;
    let login = login(&config, &args, &client).await?;

    sync.connect(&login.session).await;
    let wait = config.channel.connect_timeout();
    let mut state = sync.watch_channel_state();
    let opened = matches!(
        tokio::time::timeout(wait, state.wait_for(|s| *s == ChannelState::Open)).await,
        Ok(Ok(_))
    );

    let result = if opened {
        sync.send(parse_message(message));
        Ok(())
    } else {
        Err(CliError::ChannelNotOpen(wait))
    };

    // Stopping flushes queued outbound frames before the close frame.
    sync.shutdown().await;
    logout(&client, login).await;
    result
}

fn parse_message(message: String) -> OutboundMessage {
    match serde_json::from_str::<serde_json::Value>(&message) {
        Ok(value) if value.is_object() => OutboundMessage::Json(value),
        _ => OutboundMessage::Text(message),
    }
}
