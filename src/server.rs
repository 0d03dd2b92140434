//! Server setup and initialization
//!
//! Wires together the store, the dispatch loops and the HTTP routes, and
//! owns the shutdown sequence: stop accepting requests, then stop every loop
//! within the configured timeout.

use crate::{
    api::{create_flow_routes, AppState},
    config::Config,
    handler::MessageHandler,
    runtime::{
        FlowProcessor, FlowRegistry, HandlerLoopOptions, LoopHandle, MessageHandlerLoop,
        ProcessorOptions,
    },
    store::Store,
};
use anyhow::Result;
use axum::{routing::get, Router};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Tracing target for startup and shutdown.
pub const TRACING_TARGET_SERVER: &str = "flowkeeper::server";

/// Build the HTTP application over an open store
pub fn create_app(store: Store) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .merge(create_flow_routes().with_state(AppState { store }))
}

/// Start the server with an empty flow registry and no message handlers
pub async fn start_server(config: Config) -> Result<()> {
    run_server(config, Arc::new(FlowRegistry::new()), Vec::new()).await
}

/// Start the store, dispatch loops and HTTP server, and block until a
/// shutdown signal has been handled
pub async fn run_server(
    config: Config,
    registry: Arc<FlowRegistry>,
    handlers: Vec<Arc<dyn MessageHandler>>,
) -> Result<()> {
    init_tracing()?;

    tracing::info!(
        target: TRACING_TARGET_SERVER,
        worker_id = %config.worker.id,
        flows = ?registry.flow_names(),
        "Starting flowkeeper"
    );

    let store = Store::connect(&config.database, config.worker.id.clone())
        .await?
        .with_client_message_ttl(config.worker.client_message_ttl);

    let mut loops: Vec<LoopHandle> = Vec::with_capacity(handlers.len() + 1);
    loops.push(FlowProcessor::start(
        store.clone(),
        registry,
        ProcessorOptions::from_config(&config.worker),
    ));
    for handler in handlers {
        loops.push(MessageHandlerLoop::start(
            store.clone(),
            handler,
            HandlerLoopOptions::from_config(&config.worker),
        ));
    }

    let app = create_app(store);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;

    tracing::info!(target: TRACING_TARGET_SERVER, "📡 Server listening on http://{}", bind_addr);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let timeout = config.worker.shutdown_timeout();
    let mut first_failure = None;
    for handle in loops {
        if let Err(e) = handle.stop(timeout).await {
            first_failure.get_or_insert(e);
        }
    }

    match first_failure {
        Some(e) => Err(anyhow::Error::new(e).context("dispatch loops did not shut down cleanly")),
        None => {
            tracing::info!(target: TRACING_TARGET_SERVER, "✅ Shutdown complete");
            Ok(())
        }
    }
}

/// Structured logging filtered by `RUST_LOG`, defaulting to `info`
fn init_tracing() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_thread_ids(true))
        .with(env_filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(target: TRACING_TARGET_SERVER, error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(target: TRACING_TARGET_SERVER, error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!(target: TRACING_TARGET_SERVER, "⏹️ Shutdown signal received");
}

async fn health_check() -> &'static str {
    "ok"
}
