//! Harvests the datasets of a THREDDS catalog into persisted entries.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use super::definition::HarvesterConfig;
use super::traits::{HarvestContext, Harvester, HarvesterSettings, PassReport};
use crate::error::Result;
use crate::model::{Entry, EntryKind, HarvestedEntry, Metadata, Resource};
use crate::thredds::{CatalogCrawler, CrawledDataset, DocumentFetcher, DEFAULT_DEPTH_LIMIT};

pub const CLASS_NAME: &str = "CatalogHarvester";
pub const IMPORT_LABEL: &str = "Imported from catalog";

pub struct CatalogHarvester {
    settings: HarvesterSettings,
    top_url: String,
    recurse: bool,
    max_depth: usize,
    fetcher: Arc<dyn DocumentFetcher>,
}

impl CatalogHarvester {
    pub fn from_config(
        settings: HarvesterSettings,
        config: &HarvesterConfig,
        fetcher: Arc<dyn DocumentFetcher>,
    ) -> Result<Self> {
        Ok(Self {
            top_url: config.required("topurl")?.to_string(),
            recurse: config.bool_attr("recurse", false)?,
            max_depth: DEFAULT_DEPTH_LIMIT,
            settings,
            fetcher,
        })
    }

    pub fn with_depth_limit(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    fn harvested(
        &self,
        dataset: CrawledDataset,
        now: chrono::DateTime<chrono::Utc>,
    ) -> HarvestedEntry {
        // HTTP file-server access is a downloadable file, anything else a service link
        let (kind, resource) = match dataset.service_type.as_deref() {
            Some(t) if t.eq_ignore_ascii_case("HTTPServer") => (
                EntryKind::File,
                Resource::RemoteFile {
                    url: dataset.access_url.clone(),
                    size: 0,
                },
            ),
            _ => (EntryKind::Link, Resource::Url(dataset.access_url.clone())),
        };
        let import = Metadata::link("", IMPORT_LABEL, dataset.catalog_url.clone());
        HarvestedEntry {
            base_group_id: self.settings.base_group_id.clone(),
            group_path: dataset.group_path.join("/"),
            entry: Entry::new("", dataset.name, kind, now)
                .with_owner(self.settings.user.clone())
                .with_resource(resource)
                .with_metadata(vec![import]),
        }
    }
}

#[async_trait]
impl Harvester for CatalogHarvester {
    fn settings(&self) -> &HarvesterSettings {
        &self.settings
    }

    fn config(&self) -> HarvesterConfig {
        self.settings.apply_to(
            HarvesterConfig::harvester(CLASS_NAME)
                .with_attr("topurl", self.top_url.clone())
                .with_attr("recurse", self.recurse.to_string()),
        )
    }

    #[instrument(skip(self, ctx), fields(harvester = %self.settings.id, top = %self.top_url))]
    async fn run_pass(&self, ctx: &HarvestContext) -> Result<PassReport> {
        let mut sink = ctx.sink();
        let mut crawler = CatalogCrawler::new(
            self.fetcher.as_ref(),
            &self.top_url,
            self.recurse,
            self.max_depth,
            HashSet::new(),
        );

        while let Some(page) = crawler.next_page().await {
            if !ctx.is_active() {
                info!("stop requested, ending crawl early");
                break;
            }
            let page = match page {
                Ok(page) => page,
                Err(e) => {
                    warn!(error = %e, "unreadable catalog, skipping");
                    sink.skipped();
                    continue;
                }
            };
            info!(
                catalog = %page.url,
                depth = page.depth,
                datasets = page.datasets.len(),
                "catalog read"
            );
            for dataset in page.datasets {
                sink.push(self.harvested(dataset, ctx.now())).await?;
            }
        }
        sink.finish().await
    }
}
