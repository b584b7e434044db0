use anyhow::Result;
use feed_localizer::cms::CmsClient;
use feed_localizer::config::Config;
use feed_localizer::ledger::DeduplicationLedger;
use feed_localizer::pipeline::Pipeline;
use feed_localizer::publisher::MultiLocalePublisher;
use feed_localizer::queue::WorkQueue;
use feed_localizer::translator::Translator;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (ignored in production)
    let _ = dotenvy::dotenv();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("feed_localizer=info".parse()?),
        )
        .init();

    info!("Starting feed localizer pipeline");

    let config = Arc::new(Config::from_env()?);

    if let Some(parent) = std::path::Path::new(&config.database_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let ledger = DeduplicationLedger::new(&config.database_path, config.title_similarity_threshold)?;
    let queue = WorkQueue::new(&config.database_path)?;
    let translator = Translator::new(&config)?;
    let cms = CmsClient::new(&config)?;
    let publisher = MultiLocalePublisher::new(translator, cms, config.locales.clone());

    let pipeline = Pipeline::new(Arc::clone(&config), ledger, queue, publisher);

    // Seed the queue before entering the worker loop
    if let Err(e) = pipeline.ingest_once().await {
        warn!("Initial ingest failed, continuing with existing queue: {:#}", e);
    }

    // Graceful shutdown on ctrl-c
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    pipeline.run_forever(shutdown_rx).await?;

    info!("Pipeline stopped");
    Ok(())
}
