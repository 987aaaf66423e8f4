use data_head::config::HeadConfig;
use data_head::errors::{HeadError, HeadResult};
use data_head::metrics::initialize_metrics;
use data_head::tracing::{setup_tracing, shutdown_tracing};
use data_head::DataHead;

#[tokio::main]
async fn main() -> HeadResult<()> {
    let config = HeadConfig::from_env()?;
    let tracing_config = config.tracing_config();
    setup_tracing(&tracing_config)?;
    // Must come before the registry creates its instruments.
    initialize_metrics()?;

    let head = DataHead::from_config(&config);
    let res = head.serve(config.addr(), shutdown_signal()).await;

    shutdown_tracing(&tracing_config);
    res
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("{}", HeadError::Server(format!("unable to listen for ctrl-c: {err}")));
        // Without a signal handler, run until killed.
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
