//! Ingestion pipeline between harvesters and storage.
//!
//! Harvesters push transient entries into a [`BatchSink`]; the sink hands
//! them to the [`Ingestor`] in discovery order, flushing early whenever the
//! buffer reaches the flush threshold so a large pass never holds more than
//! one batch in memory.

use std::sync::Arc;
use tracing::{debug, info, instrument};

use super::traits::PassReport;
use crate::error::Result;
use crate::model::{HarvestedEntry, HarvesterBatch, IngestReport};
use crate::traits::Ingestor;

pub const DEFAULT_FLUSH_THRESHOLD: usize = 100;

#[derive(Clone)]
pub struct IngestionPipeline {
    ingestor: Arc<dyn Ingestor>,
    flush_threshold: usize,
}

impl IngestionPipeline {
    pub fn new(ingestor: Arc<dyn Ingestor>) -> Self {
        Self {
            ingestor,
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
        }
    }

    pub fn with_flush_threshold(mut self, flush_threshold: usize) -> Self {
        self.flush_threshold = flush_threshold.max(1);
        self
    }

    pub fn flush_threshold(&self) -> usize {
        self.flush_threshold
    }

    pub fn sink(&self, harvester_id: &str) -> BatchSink {
        BatchSink {
            pipeline: self.clone(),
            harvester_id: harvester_id.to_string(),
            buffer: Vec::with_capacity(self.flush_threshold),
            report: PassReport::default(),
        }
    }

    #[instrument(
        skip(self, batch),
        fields(harvester = %batch.harvester_id, size = batch.entries.len())
    )]
    async fn ingest(&self, batch: HarvesterBatch) -> Result<IngestReport> {
        let report = self.ingestor.ingest(batch).await?;
        info!(
            inserted = report.inserted,
            duplicates = report.duplicates,
            groups_created = report.groups_created,
            "batch ingested"
        );
        Ok(report)
    }
}

/// Per-pass buffer of harvested entries.
pub struct BatchSink {
    pipeline: IngestionPipeline,
    harvester_id: String,
    buffer: Vec<HarvestedEntry>,
    report: PassReport,
}

impl BatchSink {
    /// Buffers `entry`, flushing once the threshold is reached.
    pub async fn push(&mut self, entry: HarvestedEntry) -> Result<()> {
        self.buffer.push(entry);
        self.report.found += 1;
        if self.buffer.len() >= self.pipeline.flush_threshold {
            debug!(harvester = %self.harvester_id, "flush threshold reached");
            self.flush().await?;
        }
        Ok(())
    }

    /// Counts a source that was logged and skipped.
    pub fn skipped(&mut self) {
        self.report.skipped_sources += 1;
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub async fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let batch = HarvesterBatch {
            harvester_id: self.harvester_id.clone(),
            entries: std::mem::take(&mut self.buffer),
        };
        let ingested = self.pipeline.ingest(batch).await?;
        self.report.ingested += ingested.inserted;
        self.report.duplicates += ingested.duplicates;
        self.report.ingest_calls += 1;
        Ok(())
    }

    /// Flushes what is left and returns the pass totals.
    pub async fn finish(mut self) -> Result<PassReport> {
        self.flush().await?;
        Ok(self.report)
    }
}
