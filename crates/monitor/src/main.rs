use std::path::PathBuf;

use clap::Parser;
use tracing::info;

use vigil_dispatch::{DispatchClient, DispatchConfig};
use vigil_monitor::Monitor;
use vigil_telegram::{TelegramClient, TelegramConfig};

/// Vigil domain monitor.
#[derive(Parser, Debug)]
#[command(name = "vigil-monitor", about = "Synthetic domain monitor with debounced alerting")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Path to the persisted state file.
    #[arg(long, env = "SERVICE_MONITOR_STATE_PATH", default_value = "state.json")]
    state: PathBuf,

    /// Run one check cycle and exit.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config_path = std::env::var("SERVICE_MONITOR_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or(cli.config);

    let http = reqwest::Client::new();

    let telegram = match (
        std::env::var("TELEGRAM_BOT_TOKEN"),
        std::env::var("TELEGRAM_CHAT_ID"),
    ) {
        (Ok(token), Ok(chat)) if !token.is_empty() && !chat.is_empty() => Some(
            TelegramClient::new(http.clone(), TelegramConfig::new(token, chat)),
        ),
        _ => {
            info!("TELEGRAM_BOT_TOKEN/TELEGRAM_CHAT_ID not set, alerts will be logged only");
            None
        }
    };

    let dispatch = match (
        std::env::var("PITCHAI_DISPATCH_BASE_URL"),
        std::env::var("PITCHAI_DISPATCH_TOKEN"),
    ) {
        (Ok(base), Ok(token)) if !base.is_empty() && !token.is_empty() => {
            let mut config = DispatchConfig::new(base, token);
            config.model = std::env::var("PITCHAI_DISPATCH_MODEL").ok().filter(|m| !m.is_empty());
            Some(DispatchClient::new(http, config))
        }
        _ => None,
    };

    info!(
        config = %config_path.display(),
        state = %cli.state.display(),
        once = cli.once,
        "starting monitor"
    );

    let mut monitor = Monitor::new(config_path, cli.state, telegram, dispatch);
    monitor.run(cli.once).await?;
    Ok(())
}
