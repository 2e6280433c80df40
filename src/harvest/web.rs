//! Harvests a fixed list of web resources as link entries.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use super::definition::HarvesterConfig;
use super::traits::{HarvestContext, Harvester, HarvesterSettings, PassReport};
use crate::error::{CatalogError, Result};
use crate::model::{Entry, EntryKind, HarvestedEntry, Resource};

pub const CLASS_NAME: &str = "WebHarvester";
pub const TAG_URL: &str = "url";

/// Checks whether a URL is reachable.
#[async_trait]
pub trait HttpProbe: Send + Sync {
    /// # Errors
    ///
    /// `SourceUnavailable` when the URL cannot be fetched successfully.
    async fn probe(&self, url: &str) -> Result<()>;
}

pub struct ReqwestProbe {
    client: reqwest::Client,
}

impl ReqwestProbe {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CatalogError::Configuration(format!("cannot build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpProbe for ReqwestProbe {
    async fn probe(&self, url: &str) -> Result<()> {
        self.client
            .get(url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map(|_| ())
            .map_err(|e| CatalogError::unavailable(url, e))
    }
}

/// One `<url href name group description/>` child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlTarget {
    pub href: String,
    pub name: String,
    pub group: String,
    pub description: String,
}

pub struct WebHarvester {
    settings: HarvesterSettings,
    targets: Vec<UrlTarget>,
    probe: Arc<dyn HttpProbe>,
}

impl WebHarvester {
    pub fn from_config(
        settings: HarvesterSettings,
        config: &HarvesterConfig,
        probe: Arc<dyn HttpProbe>,
    ) -> Result<Self> {
        let targets = config
            .children_named(TAG_URL)
            .map(|child| -> Result<UrlTarget> {
                let href = child.required("href")?.to_string();
                Ok(UrlTarget {
                    name: child
                        .attr("name")
                        .filter(|n| !n.trim().is_empty())
                        .map(str::to_string)
                        .unwrap_or_else(|| crate::thredds::url_tail(&href)),
                    group: child.attr("group").unwrap_or_default().to_string(),
                    description: child.attr("description").unwrap_or_default().to_string(),
                    href,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            settings,
            targets,
            probe,
        })
    }

    pub fn targets(&self) -> &[UrlTarget] {
        &self.targets
    }
}

#[async_trait]
impl Harvester for WebHarvester {
    fn settings(&self) -> &HarvesterSettings {
        &self.settings
    }

    fn config(&self) -> HarvesterConfig {
        let config = self.targets.iter().fold(HarvesterConfig::harvester(CLASS_NAME), |config, t| {
            config.with_child(
                HarvesterConfig::new(TAG_URL)
                    .with_attr("href", t.href.clone())
                    .with_attr("name", t.name.clone())
                    .with_attr("group", t.group.clone())
                    .with_attr("description", t.description.clone()),
            )
        });
        self.settings.apply_to(config)
    }

    #[instrument(skip(self, ctx), fields(harvester = %self.settings.id, urls = self.targets.len()))]
    async fn run_pass(&self, ctx: &HarvestContext) -> Result<PassReport> {
        let mut sink = ctx.sink();
        for target in &self.targets {
            if !ctx.is_active() {
                break;
            }
            if let Err(e) = self.probe.probe(&target.href).await {
                warn!(url = %target.href, error = %e, "url unreachable, skipping");
                sink.skipped();
                continue;
            }
            debug!(url = %target.href, "url reachable");
            let entry = Entry::new("", target.name.clone(), EntryKind::Link, ctx.now())
                .with_owner(self.settings.user.clone())
                .with_description(target.description.clone())
                .with_resource(Resource::Url(target.href.clone()));
            sink.push(HarvestedEntry {
                base_group_id: self.settings.base_group_id.clone(),
                group_path: target.group.clone(),
                entry,
            })
            .await?;
        }
        sink.finish().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::harvest::pipeline::IngestionPipeline;
    use crate::harvest::traits::RunSignal;
    use crate::store::MemoryStore;
    use tracing_test::traced_test;

    struct ListProbe {
        reachable: Vec<&'static str>,
    }

    #[async_trait]
    impl HttpProbe for ListProbe {
        async fn probe(&self, url: &str) -> Result<()> {
            if self.reachable.iter().any(|r| *r == url) {
                Ok(())
            } else {
                Err(CatalogError::unavailable(url, "connection refused"))
            }
        }
    }

    fn config() -> HarvesterConfig {
        HarvesterConfig::parse(
            r#"<harvester class="WebHarvester" name="links">
                 <url href="http://up.test/data.csv" name="Data" group="Links/Up"
                      description="daily"/>
                 <url href="http://down.test/gone.csv" group="Links/Down"/>
               </harvester>"#,
        )
        .unwrap()
    }

    #[test]
    fn test_url_without_href_is_a_configuration_error() {
        let config =
            HarvesterConfig::harvester(CLASS_NAME).with_child(HarvesterConfig::new(TAG_URL));
        let settings = HarvesterSettings::from_config("w", &config).unwrap();
        let probe = Arc::new(ListProbe { reachable: vec![] });
        assert!(matches!(
            WebHarvester::from_config(settings, &config, probe),
            Err(CatalogError::Configuration(_))
        ));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_unreachable_urls_are_logged_and_skipped() {
        let config = config();
        let settings = HarvesterSettings::from_config("w", &config).unwrap();
        let probe = Arc::new(ListProbe {
            reachable: vec!["http://up.test/data.csv"],
        });
        let harvester = WebHarvester::from_config(settings, &config, probe).unwrap();
        assert_eq!(harvester.targets()[1].name, "gone.csv");

        let store = Arc::new(MemoryStore::with_top_group("Top"));
        let ctx = HarvestContext::new(
            "w",
            Arc::new(RunSignal::new()),
            Arc::new(IngestionPipeline::new(store.clone())),
            Arc::new(SystemClock),
        );
        let report = harvester.run_pass(&ctx).await.unwrap();

        assert_eq!(report.ingested, 1);
        assert_eq!(report.skipped_sources, 1);
        assert!(logs_contain("url unreachable, skipping"));

        let link = store.find_by_natural_key("http://up.test/data.csv").unwrap();
        assert_eq!(link.kind, EntryKind::Link);
        assert_eq!(link.name, "Data");
        assert_eq!(store.full_name(link.parent_group_id.as_deref().unwrap()).unwrap(), "Links/Up");
    }

    #[test]
    fn test_config_round_trips_targets() {
        let config = config();
        let settings = HarvesterSettings::from_config("w", &config).unwrap();
        let probe = Arc::new(ListProbe { reachable: vec![] });
        let harvester =
            WebHarvester::from_config(settings.clone(), &config, probe.clone()).unwrap();
        let saved = HarvesterConfig::parse(&harvester.config().to_xml()).unwrap();
        let reloaded = WebHarvester::from_config(settings, &saved, probe).unwrap();
        assert_eq!(reloaded.targets(), harvester.targets());
    }
}
