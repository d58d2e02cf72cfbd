mod config;
mod controller;
mod demux;
mod error;
mod events;
mod gc;
mod leader_cache;
mod metrics;
mod model;
mod opt_in_index;
mod ports;
mod reconciler;
mod resources;
mod retry;
mod selector;

use crate::controller::run;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    run().await
}
