use clap::Parser;
use selfheal::{create_router, ResilienceConfig, ResilienceCore};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "selfheal")]
#[command(about = "Self-healing resilience core with an HTTP admin API", long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 6780)]
    port: u16,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory for failure events and breaker state (overrides the config file)
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "selfheal=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = match args.config {
        Some(ref path) => {
            tracing::info!("Loading configuration from {}", path.display());
            ResilienceConfig::load(path)?
        }
        None => ResilienceConfig::default(),
    };
    if let Some(dir) = args.data_dir {
        config.data_dir = Some(dir);
    }
    match config.data_dir {
        Some(ref dir) => tracing::info!("Persisting resilience state in {}", dir.display()),
        None => tracing::info!("No data directory configured, state is in-memory only"),
    }

    let core = Arc::new(ResilienceCore::new(config)?);
    core.start();

    let app = create_router(core.clone());

    // Start server with graceful shutdown
    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Admin API listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutdown signal received, flushing failure events...");
    core.shutdown().await?;
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
