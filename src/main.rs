//! termbridge - shell sessions over WebSocket, with pattern detection.
//!
//! `termbridge serve` hosts the bridge; `termbridge rules` prints the rule set
//! the current configuration would load; `termbridge replay` plays back a
//! session recording.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser as ClapParser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use termbridge::{
    bridge::{self, AppState, BridgeSettings, RouterConfig},
    broker::Broker,
    config::Config,
    event::SessionId,
    monitor::MonitorAggregator,
    recorder::{self, Recorder},
    session::SessionManager,
    shutdown::ShutdownCoordinator,
};

/// How long bridge connections get to send their close frames.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

#[derive(ClapParser, Debug)]
#[command(name = "termbridge", version, about, long_about = None)]
struct Cli {
    /// Path to the TOML config file (defaults to the user config dir)
    #[arg(long, global = true, env = "TERMBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the WebSocket bridge
    Serve {
        /// Address to bind (overrides the config file)
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Authentication token for non-localhost bindings
        #[arg(long, env = "TERMBRIDGE_TOKEN")]
        token: Option<String>,
    },

    /// Print the effective pattern rule set as JSON
    Rules,

    /// Write the output stored in a recording file to stdout
    Replay {
        /// Recording written by `serve` with `[recording] path` set
        file: PathBuf,

        /// Only this session's output
        #[arg(long)]
        session: Option<SessionId>,

        /// Playback speed multiplier; 0 writes everything at once
        #[arg(long, default_value_t = 1.0)]
        speed: f64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config_path = cli.config.or_else(Config::default_path);
    let config = Config::load_or_default(config_path.as_deref())
        .context("failed to load configuration")?;

    match cli.command {
        Commands::Serve { bind, token } => run_server(config, bind, token).await,
        Commands::Rules => {
            let specs = config.patterns.rule_specs();
            println!("{}", serde_json::to_string_pretty(&specs)?);
            Ok(())
        }
        Commands::Replay {
            file,
            session,
            speed,
        } => replay(&file, session, speed).await,
    }
}

async fn replay(file: &std::path::Path, session: Option<SessionId>, speed: f64) -> anyhow::Result<()> {
    use tokio::io::AsyncWriteExt;

    let lines = recorder::read_recording(file)?;
    let chunks = recorder::playback(&lines, session);
    let mut stdout = tokio::io::stdout();
    let mut previous = None;
    for (timestamp, data) in chunks {
        if let Some(previous) = previous.replace(timestamp) {
            if speed > 0.0 {
                let gap = (timestamp - previous).to_std().unwrap_or_default();
                tokio::time::sleep(gap.div_f64(speed)).await;
            }
        }
        stdout.write_all(&data).await?;
        stdout.flush().await?;
    }
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "termbridge=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn resolve_token(bind: &SocketAddr, user_token: Option<String>) -> Option<String> {
    if bind.ip().is_loopback() {
        return None;
    }
    match user_token {
        Some(token) => Some(token),
        None => {
            use rand::Rng;
            let token: String = rand::thread_rng()
                .sample_iter(&rand::distributions::Alphanumeric)
                .take(32)
                .map(char::from)
                .collect();
            eprintln!("termbridge: API token (required for non-localhost): {token}");
            Some(token)
        }
    }
}

async fn run_server(
    config: Config,
    bind: Option<SocketAddr>,
    token: Option<String>,
) -> anyhow::Result<()> {
    let bind = bind.unwrap_or(config.server.bind);
    let token = resolve_token(&bind, token.or_else(|| config.server.token.clone()));
    if token.is_some() {
        tracing::info!("auth token configured");
    }

    let engine = config.patterns.engine().context("invalid pattern rules")?;
    tracing::info!(rules = engine.rules().len(), "pattern rules loaded");

    let broker = Broker::new();
    let monitor = MonitorAggregator::new(&broker, config.monitor.history_capacity);
    let recorder = match config.recording.options() {
        Some(options) => Some(
            Recorder::start(&broker, options)
                .await
                .context("failed to start recording")?,
        ),
        None => None,
    };
    let sessions = SessionManager::new(broker, Arc::new(engine), config.sessions.limits());
    let shutdown = ShutdownCoordinator::new();
    let settings = BridgeSettings {
        queue_capacity: config.bridge.queue_capacity,
        terminate_on_disconnect: config.sessions.terminate_on_disconnect,
    };
    let state = AppState::new(sessions.clone(), monitor.clone(), shutdown.clone(), settings);
    let app = bridge::router(state, RouterConfig { token, bind });

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    tracing::info!(addr = %bind, "bridge listening");

    let coordinator = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(?e, "failed to listen for Ctrl+C");
            }
            tracing::info!("received Ctrl+C");
            // Connections send their close frames and drop out, which lets
            // the graceful shutdown complete.
            coordinator.shutdown();
            if !coordinator.wait_for_all_closed(CLOSE_GRACE).await {
                tracing::warn!(
                    remaining = coordinator.active_connections(),
                    "connections still open after close grace"
                );
            }
        })
        .await
        .context("server error")?;

    if let Some(escalation) = sessions.drain() {
        if let Err(e) = escalation.await {
            tracing::warn!(?e, "session drain task failed");
        }
    }
    monitor.detach();
    if let Some(recorder) = recorder {
        match recorder.stop().await {
            Ok(events) => tracing::info!(events, "recording closed"),
            Err(e) => tracing::error!(error = %e, "recording failed"),
        }
    }

    tracing::info!("termbridge exiting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_needs_no_token() {
        let bind: SocketAddr = "127.0.0.1:7681".parse().unwrap();
        assert_eq!(resolve_token(&bind, Some("x".into())), None);
    }

    #[test]
    fn non_loopback_keeps_or_generates_a_token() {
        let bind: SocketAddr = "0.0.0.0:7681".parse().unwrap();
        assert_eq!(resolve_token(&bind, Some("x".into())).as_deref(), Some("x"));
        let generated = resolve_token(&bind, None).unwrap();
        assert_eq!(generated.len(), 32);
        assert!(generated.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
