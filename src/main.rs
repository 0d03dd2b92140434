//! Flowkeeper server entry point
//!
//! Serves the inspection API at /api/* and /healthz and runs the flow
//! processor until Ctrl+C or SIGTERM.

use flowkeeper::{config::Config, server::start_server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::default();
    start_server(config).await
}
