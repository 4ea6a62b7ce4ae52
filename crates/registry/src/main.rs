use clap::Parser;
use tracing::info;

use vigil_registry::{AppState, Settings, Store, router};

/// Vigil E2E registry HTTP server.
#[derive(Parser, Debug)]
#[command(name = "vigil-registry", about = "Multi-tenant E2E test registry")]
struct Cli {
    /// Bind host.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Bind port.
    #[arg(long, default_value_t = 8111)]
    port: u16,
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
    let settings = Settings::from_env();
    info!(db = %settings.db_path, artifacts = %settings.artifacts_dir, "starting registry");

    let store = Store::connect(&settings.db_path).await?;
    let state = AppState::new(store, settings);
    let app = router(state);

    let addr = format!("{}:{}", cli.host, cli.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}
