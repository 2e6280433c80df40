//! Harvest module - background discovery and ingestion of external data.
//!
//! This module provides the harvester side of the catalog:
//! - **Traits**: [`Harvester`], its settings, lifecycle state and status surface
//! - **Definitions**: the XML configuration harvesters are built from
//! - **Pipeline**: batching into the storage [`Ingestor`](crate::traits::Ingestor)
//! - **Harvesters**: pattern-matched local files, web links, THREDDS catalogs
//! - **Manager**: supervision of every harvester instance

pub mod catalog;
pub mod definition;
pub mod manager;
pub mod pattern;
pub mod pipeline;
pub mod traits;
pub mod web;

// Re-export commonly used types
pub use catalog::CatalogHarvester;
pub use definition::{short_class_name, HarvesterConfig};
pub use manager::{HarvesterDeps, HarvesterFactory, HarvesterManager};
pub use pattern::PatternHarvester;
pub use pipeline::{BatchSink, IngestionPipeline, DEFAULT_FLUSH_THRESHOLD};
pub use traits::{
    HarvestContext, Harvester, HarvesterSettings, HarvesterState, HarvesterStatus, PassReport,
    RunSignal,
};
pub use web::{HttpProbe, ReqwestProbe, WebHarvester};
