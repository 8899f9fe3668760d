use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

mod app;
mod http;
mod update;

/// Messages-API gateway over an out-of-process assistant CLI.
#[derive(Parser)]
#[command(name = "switchboard-gateway", version)]
struct Args {
    /// Config file path (default: ~/.switchboard/switchboard.toml).
    #[arg(long)]
    config: Option<String>,
    /// Override the listening port.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| {
                    "switchboard_gateway=info,switchboard_runner=info,switchboard_sessions=info,tower_http=warn".into()
                }),
        )
        .init();

    let args = Args::parse();

    // load config: explicit path > SWITCHBOARD_CONFIG env > default location
    let config_path = args
        .config
        .or_else(|| std::env::var("SWITCHBOARD_CONFIG").ok());
    let mut config = switchboard_core::config::SwitchboardConfig::load(config_path.as_deref())
        .unwrap_or_else(|e| {
            tracing::warn!("Config load failed ({}), using defaults", e);
            switchboard_core::config::SwitchboardConfig::default()
        });
    if let Some(port) = args.port {
        config.gateway.port = port;
    }

    let bind = config.gateway.bind.clone();
    let port = config.gateway.port;
    let engine = Arc::new(switchboard_runner::Engine::new(config)?);
    let router = app::build_router(engine.clone());

    let addr: SocketAddr = format!("{}:{}", bind, port).parse()?;
    info!("Switchboard gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(engine))
        .await?;

    Ok(())
}

/// Resolve on SIGINT/SIGTERM after tearing the engine down: children get a
/// SIGTERM and a short grace window before the server stops accepting.
async fn shutdown_signal(engine: Arc<switchboard_runner::Engine>) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    engine.begin_shutdown();
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
}
