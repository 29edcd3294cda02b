//! `nodeforged` — the standalone server binary.
//!
//! Loads configuration, wires up the session registry / proxy manager / script
//! registry / dispatcher / broadcast sink, and serves the websocket command
//! transport until a Ctrl-C or SIGTERM asks it to stop.

use std::sync::Arc;

use nodeforge_server::dispatcher::Dispatcher;
use nodeforge_server::proxy_manager::ProxyManager;
use nodeforge_server::registry::SessionRegistry;
use nodeforge_server::script::ScriptRegistry;
use nodeforge_server::transport::{self, AppState, BroadcastSink};
use nodeforge_server::ConfigLoader;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(rust_log).init();

    let config_path = std::env::var("NODEFORGE_CONFIG").unwrap_or_else(|_| "nodeforge.toml".to_string());
    tracing::info!(path = %config_path, "loading server configuration");
    let config = ConfigLoader::new(&config_path).load().await?;
    tracing::info!(
        bind_address = %config.bind_address,
        server_name = %config.server_name,
        "configuration loaded"
    );

    let registry = Arc::new(SessionRegistry::new(config.history_config("default")));
    let proxies = Arc::new(ProxyManager::new(config.proxy.clone()));
    let scripts = Arc::new(ScriptRegistry::new());
    let sink = Arc::new(BroadcastSink::new());
    let config = Arc::new(config);

    let dispatcher = Arc::new(Dispatcher::new(
        registry,
        proxies,
        config.clone(),
        scripts,
        sink.clone(),
    ));

    let app = transport::router(AppState { dispatcher: dispatcher.clone(), events: sink });

    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    tracing::info!(addr = %config.bind_address, "nodeforged listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    for session in dispatcher.registry.get_all_sessions() {
        session.stop_all_nodes().await;
    }
    dispatcher.proxies.shutdown_all().await;

    tracing::info!("nodeforged shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL-C signal handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received CTRL-C, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
