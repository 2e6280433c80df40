//! Supervision of harvester instances.
//!
//! The manager owns every harvester keyed by id. Starting, stopping or
//! removing one never touches the others, and a definition that fails to
//! build is logged and left out without affecting the rest.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use super::catalog::{self, CatalogHarvester};
use super::definition::{short_class_name, HarvesterConfig, ATTR_CLASS, ATTR_ID};
use super::pattern::{self, PatternHarvester};
use super::traits::{Harvester, HarvesterSettings, HarvesterStatus};
use super::web::{self, HttpProbe, WebHarvester};
use crate::error::{CatalogError, Result};
use crate::executor::{HarvesterExecutor, HarvesterHandle};
use crate::thredds::{DocumentFetcher, DEFAULT_DEPTH_LIMIT};
use crate::traits::{DefinitionStore, HarvesterDefinition};

/// Collaborators handed to harvester constructors.
#[derive(Clone)]
pub struct HarvesterDeps {
    pub fetcher: Arc<dyn DocumentFetcher>,
    pub probe: Arc<dyn HttpProbe>,
    pub catalog_depth_limit: usize,
}

impl HarvesterDeps {
    pub fn new(fetcher: Arc<dyn DocumentFetcher>, probe: Arc<dyn HttpProbe>) -> Self {
        Self {
            fetcher,
            probe,
            catalog_depth_limit: DEFAULT_DEPTH_LIMIT,
        }
    }
}

pub type HarvesterFactory = Arc<
    dyn Fn(HarvesterSettings, &HarvesterConfig, &HarvesterDeps) -> Result<Arc<dyn Harvester>>
        + Send
        + Sync,
>;

fn build_pattern(
    settings: HarvesterSettings,
    config: &HarvesterConfig,
    _deps: &HarvesterDeps,
) -> Result<Arc<dyn Harvester>> {
    Ok(Arc::new(PatternHarvester::from_config(settings, config)?))
}

fn build_web(
    settings: HarvesterSettings,
    config: &HarvesterConfig,
    deps: &HarvesterDeps,
) -> Result<Arc<dyn Harvester>> {
    Ok(Arc::new(WebHarvester::from_config(settings, config, deps.probe.clone())?))
}

fn build_catalog(
    settings: HarvesterSettings,
    config: &HarvesterConfig,
    deps: &HarvesterDeps,
) -> Result<Arc<dyn Harvester>> {
    let harvester = CatalogHarvester::from_config(settings, config, deps.fetcher.clone())?
        .with_depth_limit(deps.catalog_depth_limit);
    Ok(Arc::new(harvester))
}

fn builtin_factories() -> HashMap<String, HarvesterFactory> {
    let mut factories: HashMap<String, HarvesterFactory> = HashMap::new();
    factories.insert(pattern::CLASS_NAME.to_string(), Arc::new(build_pattern));
    factories.insert(web::CLASS_NAME.to_string(), Arc::new(build_web));
    factories.insert(catalog::CLASS_NAME.to_string(), Arc::new(build_catalog));
    factories
}

pub struct HarvesterManager {
    definitions: Arc<dyn DefinitionStore>,
    executor: HarvesterExecutor,
    deps: HarvesterDeps,
    factories: HashMap<String, HarvesterFactory>,
    /// Registration order is listing order
    harvesters: RwLock<Vec<Arc<HarvesterHandle>>>,
    harvesters_active: bool,
}

impl HarvesterManager {
    pub fn new(
        definitions: Arc<dyn DefinitionStore>,
        executor: HarvesterExecutor,
        deps: HarvesterDeps,
    ) -> Self {
        Self {
            definitions,
            executor,
            deps,
            factories: builtin_factories(),
            harvesters: RwLock::new(Vec::new()),
            harvesters_active: true,
        }
    }

    /// Global switch; when false nothing is started automatically.
    pub fn with_harvesters_active(mut self, active: bool) -> Self {
        self.harvesters_active = active;
        self
    }

    pub fn register(&mut self, class_name: &str, factory: HarvesterFactory) {
        self.factories.insert(short_class_name(class_name).to_string(), factory);
    }

    /// Constructs a harvester from its configuration.
    ///
    /// # Errors
    ///
    /// `Configuration` for an unknown class or an invalid definition.
    pub fn build(&self, id: &str, config: &HarvesterConfig) -> Result<Arc<dyn Harvester>> {
        let settings = HarvesterSettings::from_config(id, config)?;
        let factory = self.factories.get(&settings.class_name).ok_or_else(|| {
            CatalogError::Configuration(format!(
                "unknown harvester class '{}'",
                settings.class_name
            ))
        })?;
        factory(settings, config, &self.deps)
    }

    fn insert_handle(&self, harvester: Arc<dyn Harvester>) -> Arc<HarvesterHandle> {
        let handle = HarvesterHandle::new(harvester);
        let mut harvesters = self.harvesters.write();
        harvesters.retain(|h| h.id() != handle.id());
        harvesters.push(handle.clone());
        handle
    }

    pub fn handle(&self, id: &str) -> Option<Arc<HarvesterHandle>> {
        self.harvesters.read().iter().find(|h| h.id() == id).cloned()
    }

    fn require(&self, id: &str) -> Result<Arc<HarvesterHandle>> {
        self.handle(id)
            .ok_or_else(|| CatalogError::NotFound(format!("harvester {id}")))
    }

    /// Rebuilds persisted harvesters, loads definition files and starts the
    /// ones marked active on start. Returns how many harvesters loaded.
    ///
    /// # Errors
    ///
    /// Only when the definition store cannot be read.
    #[instrument(skip(self, files), fields(files = files.len()))]
    pub async fn init(&self, files: &[PathBuf]) -> Result<usize> {
        let mut loaded = 0;
        for definition in self.definitions.read_all().await? {
            match self.build_persisted(&definition) {
                Ok(harvester) => {
                    self.insert_handle(harvester);
                    loaded += 1;
                }
                Err(e) => error!(
                    harvester = %definition.id,
                    class = %definition.class_name,
                    error = %e,
                    "could not load harvester"
                ),
            }
        }

        for file in files {
            let xml = match tokio::fs::read_to_string(file).await {
                Ok(xml) => xml,
                Err(e) => {
                    warn!(file = %file.display(), error = %e, "cannot read harvester file");
                    continue;
                }
            };
            let configs = match HarvesterConfig::parse_all(&xml) {
                Ok(configs) => configs,
                Err(e) => {
                    warn!(file = %file.display(), error = %e, "bad harvester file");
                    continue;
                }
            };
            for config in configs {
                let id = config
                    .attr(ATTR_ID)
                    .map(str::to_string)
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                match self.build(&id, &config) {
                    Ok(harvester) => {
                        self.insert_handle(harvester);
                        loaded += 1;
                    }
                    Err(e) => error!(
                        file = %file.display(),
                        harvester = %id,
                        error = %e,
                        "could not load harvester"
                    ),
                }
            }
        }

        if !self.harvesters_active {
            info!(loaded, "harvesters are disabled, none started");
            return Ok(loaded);
        }
        let handles = self.harvesters.read().clone();
        for handle in handles {
            if handle.harvester().settings().active_on_start {
                info!(harvester = %handle.id(), "starting on startup");
                self.executor.start(&handle);
            }
        }
        Ok(loaded)
    }

    fn build_persisted(&self, definition: &HarvesterDefinition) -> Result<Arc<dyn Harvester>> {
        let mut config = HarvesterConfig::parse(&definition.config_xml)?;
        if config.class_name().is_none() {
            config = config.with_attr(ATTR_CLASS, definition.class_name.clone());
        }
        self.build(&definition.id, &config)
    }

    /// Validates, persists and registers a new harvester; returns its id.
    pub async fn add(&self, config: HarvesterConfig) -> Result<String> {
        let id = config
            .attr(ATTR_ID)
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        if self.handle(&id).is_some() {
            return Err(CatalogError::Configuration(format!("harvester {id} already exists")));
        }
        let harvester = self.build(&id, &config)?;
        let definition = HarvesterDefinition {
            id: id.clone(),
            class_name: harvester.settings().class_name.clone(),
            config_xml: harvester.config().to_xml(),
        };
        self.definitions.insert(&definition).await?;
        self.insert_handle(harvester);
        info!(harvester = %id, class = %definition.class_name, "harvester added");
        Ok(id)
    }

    /// Starts one harvester; false when it was already running.
    pub fn start(&self, id: &str) -> Result<bool> {
        let handle = self.require(id)?;
        Ok(self.executor.start(&handle))
    }

    /// Stops one harvester and waits for its current source to finish.
    pub async fn stop(&self, id: &str) -> Result<()> {
        let handle = self.require(id)?;
        if handle.stop() {
            handle.join().await;
        }
        Ok(())
    }

    /// Stops, unregisters and deletes one harvester.
    pub async fn remove(&self, id: &str) -> Result<()> {
        self.stop(id).await?;
        self.harvesters.write().retain(|h| h.id() != id);
        self.definitions.delete(id).await?;
        info!(harvester = %id, "harvester removed");
        Ok(())
    }

    pub fn list(&self) -> Vec<HarvesterStatus> {
        self.harvesters.read().iter().map(|h| h.status()).collect()
    }

    pub fn status(&self, id: &str) -> Option<HarvesterStatus> {
        self.handle(id).map(|h| h.status())
    }

    pub fn status_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.list())
            .map_err(|e| CatalogError::Storage(format!("cannot serialise harvester status: {e}")))
    }

    /// Stops every harvester and waits for their tasks to end.
    pub async fn stop_all(&self) {
        let handles = self.harvesters.read().clone();
        let stopping: Vec<_> = handles.into_iter().filter(|h| h.stop()).collect();
        for handle in stopping {
            handle.join().await;
        }
    }
}
