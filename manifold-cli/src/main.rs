use anyhow::{Context, Result};
use clap::Parser;
use manifold_config::{ConfigLoader, ManifoldConfig};
use manifold_server::Hub;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod cli;
use cli::{Cli, Commands, ConfigCommands};

fn init_tracing(log_level: Option<&String>) {
    let filter = match log_level {
        Some(level) => EnvFilter::try_new(level).unwrap_or_else(|_| {
            eprintln!("Invalid log level '{}', defaulting to 'info'", level);
            EnvFilter::new("info")
        }),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_ref());

    match cli.command {
        Commands::Serve => serve(cli.config.as_deref()).await,
        Commands::Config { command } => match command {
            ConfigCommands::Validate => {
                let config = load_config(cli.config.as_deref())?;
                println!(
                    "Configuration OK: {} upstream(s), {} group(s)",
                    config.settings.upstreams.len(),
                    config.settings.groups.len()
                );
                Ok(())
            }
            ConfigCommands::Generate => {
                print!("{}", ManifoldConfig::generate_sample());
                Ok(())
            }
        },
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<ManifoldConfig> {
    ConfigLoader::new()
        .load(path)
        .context("Failed to load configuration")
}

async fn serve(config_path: Option<&std::path::Path>) -> Result<()> {
    let config = load_config(config_path)?;
    let bind = config.server.bind_address();

    let hub = Hub::start(config)
        .await
        .context("Failed to start the hub")?;
    let app = hub.router();

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    info!("manifold listening on {}", bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("shutting down");
    hub.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
