//! Core traits and types for background harvesters.
//!
//! This module defines what every harvester shares:
//! - The per-instance lifecycle state and status surface
//! - Settings common to every harvester class
//! - The [`Harvester`] trait implemented by each class
//! - The [`HarvestContext`] handed to one pass

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use super::definition::{short_class_name, HarvesterConfig};
use super::pipeline::{BatchSink, IngestionPipeline};
use crate::clock::Clock;
use crate::error::{CatalogError, Result};

// ============================================================================
// Lifecycle
// ============================================================================

/// `Stopped -> Running -> (Sleeping -> Running)* -> Stopped`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HarvesterState {
    Stopped,
    Running,
    Sleeping,
}

/// Cooperative cancellation flag for one run of a harvester.
///
/// Passes poll [`is_active`](Self::is_active) between sources; the loop
/// sleeps through [`sleep`](Self::sleep) so `stop` wakes it at once.
#[derive(Debug)]
pub struct RunSignal {
    active: AtomicBool,
    wake: Notify,
}

impl Default for RunSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl RunSignal {
    pub fn new() -> Self {
        Self {
            active: AtomicBool::new(true),
            wake: Notify::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.wake.notify_one();
    }

    /// Sleeps for `duration` or until stopped; true while still active.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if !self.is_active() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.wake.notified() => {}
        }
        self.is_active()
    }
}

// ============================================================================
// Settings
// ============================================================================

pub const DEFAULT_SLEEP_MINUTES: f64 = 5.0;
pub const DEFAULT_USER: &str = "admin";

/// Settings every harvester class understands.
#[derive(Debug, Clone, PartialEq)]
pub struct HarvesterSettings {
    pub id: String,
    pub name: String,
    /// Short class name, e.g. `PatternHarvester`
    pub class_name: String,
    pub active_on_start: bool,
    /// Poll repeatedly instead of running one pass
    pub monitor: bool,
    pub sleep: Duration,
    /// Group harvested entries are placed under; the top group when `None`
    pub base_group_id: Option<String>,
    /// Owner of harvested entries
    pub user: String,
    /// Stop after this many consecutive passes that ingest nothing
    pub max_empty_polls: Option<u32>,
}

impl HarvesterSettings {
    /// Reads the common attributes of a `<harvester>` element.
    ///
    /// # Errors
    ///
    /// `Configuration` for a missing class or a malformed value.
    pub fn from_config(id: &str, config: &HarvesterConfig) -> Result<Self> {
        let class_name =
            short_class_name(config.required(super::definition::ATTR_CLASS)?).to_string();
        let non_empty = |name: &str| config.attr(name).map(str::trim).filter(|v| !v.is_empty());
        let minutes = match non_empty("sleep") {
            Some(v) => v
                .parse::<f64>()
                .ok()
                .filter(|m| m.is_finite() && *m >= 0.0)
                .ok_or_else(|| {
                    CatalogError::Configuration(format!(
                        "sleep must be a number of minutes, not '{v}'"
                    ))
                })?,
            None => DEFAULT_SLEEP_MINUTES,
        };
        let max_empty_polls = match non_empty("maxemptypolls") {
            Some(v) => Some(v.parse::<u32>().ok().filter(|n| *n > 0).ok_or_else(|| {
                CatalogError::Configuration(format!(
                    "maxemptypolls must be greater than zero, not '{v}'"
                ))
            })?),
            None => None,
        };

        Ok(Self {
            id: id.to_string(),
            name: config.attr("name").unwrap_or(&class_name).to_string(),
            active_on_start: config.bool_attr("activeonstart", false)?,
            monitor: config.bool_attr("monitor", false)?,
            sleep: Duration::from_secs_f64(minutes * 60.0),
            base_group_id: config
                .attr("basegroup")
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string),
            user: config.attr("user").unwrap_or(DEFAULT_USER).to_string(),
            max_empty_polls,
            class_name,
        })
    }

    /// Writes the common settings back onto `config`.
    pub fn apply_to(&self, mut config: HarvesterConfig) -> HarvesterConfig {
        config = config
            .with_attr(super::definition::ATTR_ID, self.id.clone())
            .with_attr("name", self.name.clone())
            .with_attr("activeonstart", self.active_on_start.to_string())
            .with_attr("monitor", self.monitor.to_string())
            .with_attr("sleep", (self.sleep.as_secs_f64() / 60.0).to_string())
            .with_attr("user", self.user.clone());
        if let Some(base) = &self.base_group_id {
            config = config.with_attr("basegroup", base.clone());
        }
        if let Some(n) = self.max_empty_polls {
            config = config.with_attr("maxemptypolls", n.to_string());
        }
        config
    }
}

// ============================================================================
// Reports and status
// ============================================================================

/// Outcome of one harvester pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassReport {
    /// Entries handed to the pipeline
    pub found: usize,
    /// Entries the store inserted
    pub ingested: usize,
    pub duplicates: usize,
    pub ingest_calls: usize,
    /// Sources logged and skipped during the pass
    pub skipped_sources: usize,
}

/// Operational view of one harvester.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarvesterStatus {
    pub id: String,
    pub name: String,
    pub class_name: String,
    pub state: HarvesterState,
    pub active: bool,
    pub passes: u64,
    pub entries_found: u64,
    pub entries_ingested: u64,
    pub last_error: Option<String>,
    pub last_pass: Option<DateTime<Utc>>,
}

impl HarvesterStatus {
    pub fn new(settings: &HarvesterSettings) -> Self {
        Self {
            id: settings.id.clone(),
            name: settings.name.clone(),
            class_name: settings.class_name.clone(),
            state: HarvesterState::Stopped,
            active: false,
            passes: 0,
            entries_found: 0,
            entries_ingested: 0,
            last_error: None,
            last_pass: None,
        }
    }

    pub fn record(&mut self, report: &PassReport, at: DateTime<Utc>) {
        self.passes += 1;
        self.entries_found += report.found as u64;
        self.entries_ingested += report.ingested as u64;
        self.last_pass = Some(at);
        self.last_error = None;
    }

    pub fn record_error(&mut self, error: &CatalogError, at: DateTime<Utc>) {
        self.passes += 1;
        self.last_pass = Some(at);
        self.last_error = Some(error.to_string());
    }
}

// ============================================================================
// Harvester Trait
// ============================================================================

/// One pass's view of the world.
pub struct HarvestContext {
    pub harvester_id: String,
    signal: Arc<RunSignal>,
    pipeline: Arc<IngestionPipeline>,
    clock: Arc<dyn Clock>,
}

impl HarvestContext {
    pub fn new(
        harvester_id: impl Into<String>,
        signal: Arc<RunSignal>,
        pipeline: Arc<IngestionPipeline>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            harvester_id: harvester_id.into(),
            signal,
            pipeline,
            clock,
        }
    }

    /// False once the harvester has been asked to stop.
    pub fn is_active(&self) -> bool {
        self.signal.is_active()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Fresh batch buffer for this pass.
    pub fn sink(&self) -> BatchSink {
        self.pipeline.sink(&self.harvester_id)
    }
}

/// A background worker that discovers external data and ingests it.
///
/// Implementations check [`HarvestContext::is_active`] between sources and
/// log-and-skip individual failures; an `Err` from `run_pass` is recorded
/// on the status surface and the loop goes on.
#[async_trait]
pub trait Harvester: Send + Sync {
    fn settings(&self) -> &HarvesterSettings;

    /// Full configuration, suitable for persisting.
    fn config(&self) -> HarvesterConfig;

    async fn run_pass(&self, ctx: &HarvestContext) -> Result<PassReport>;
}
