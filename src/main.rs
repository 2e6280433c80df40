use std::sync::Arc;

use catalog_harvester::adapter::{
    CatalogXmlAdapter, FtpAdapter, LocalDirectoryAdapter, SuppaFtpConnector,
};
use catalog_harvester::cache::ExternalCache;
use catalog_harvester::clock::SystemClock;
use catalog_harvester::config::CatalogConfig;
use catalog_harvester::error::Result;
use catalog_harvester::harvest::{HarvesterDeps, HarvesterManager, IngestionPipeline, ReqwestProbe};
use catalog_harvester::logging::init_logging;
use catalog_harvester::thredds::{DocumentFetcher, HttpFetcher};
use catalog_harvester::{EntryTree, HarvesterExecutor, MemoryStore};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let cli_config = std::env::args().nth(1);
    let config = CatalogConfig::from_sources(cli_config.as_deref())?;
    init_logging(&config)?;

    let store = Arc::new(MemoryStore::with_top_group(&config.top_group_name));
    let fetcher: Arc<dyn DocumentFetcher> = Arc::new(HttpFetcher::new(config.http_timeout())?);

    let tree = Arc::new(
        EntryTree::new(store.clone())
            .with_adapter(Arc::new(LocalDirectoryAdapter::new(config.cache_ttl())))
            .with_adapter(Arc::new(FtpAdapter::with_cache(
                Arc::new(SuppaFtpConnector::new(config.http_timeout())),
                ExternalCache::new(config.cache_ttl()),
            )))
            .with_adapter(Arc::new(
                CatalogXmlAdapter::with_cache(
                    fetcher.clone(),
                    ExternalCache::new(config.cache_ttl()),
                )
                .with_depth_limit(config.catalog_depth_limit),
            )),
    );

    let pipeline = Arc::new(
        IngestionPipeline::new(store.clone()).with_flush_threshold(config.flush_threshold),
    );
    let executor =
        HarvesterExecutor::new(config.harvester_concurrency, pipeline, Arc::new(SystemClock));
    let mut deps = HarvesterDeps::new(fetcher, Arc::new(ReqwestProbe::new(config.http_timeout())?));
    deps.catalog_depth_limit = config.catalog_depth_limit;

    let manager = HarvesterManager::new(store.clone(), executor, deps)
        .with_harvesters_active(config.harvesters_active);
    let loaded = manager.init(&config.harvester_files).await?;
    info!(
        harvesters = loaded,
        top = %tree.top_group_id(),
        active = config.harvesters_active,
        "catalogd running"
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "cannot listen for shutdown signal");
    }
    info!("shutting down");
    manager.stop_all().await;
    Ok(())
}
