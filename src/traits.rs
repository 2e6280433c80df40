use crate::error::Result;
use crate::model::{Entry, HarvesterBatch, IngestReport, Metadata, PermissionSet, SourceKind};
use async_trait::async_trait;
use std::sync::Arc;

/// Read side of the persisted catalog.
#[async_trait]
pub trait EntryStore: Send + Sync {
    /// Id of the distinguished top-level group.
    fn top_group_id(&self) -> &str;

    async fn get_entry(&self, id: &str) -> Result<Option<Entry>>;

    /// Ids of persisted entries whose parent is `group_id`.
    async fn child_ids(&self, group_id: &str) -> Result<Vec<String>>;

    async fn load_permissions(&self, entry_id: &str) -> Result<PermissionSet>;

    /// Replaces every permission row of `entry_id`.
    async fn store_permissions(&self, entry_id: &str, permissions: &PermissionSet) -> Result<()>;

    async fn load_metadata(&self, entry_id: &str) -> Result<Vec<Metadata>>;

    async fn insert_metadata(&self, metadata: &Metadata) -> Result<()>;

    async fn delete_metadata(&self, entry_id: &str, metadata_id: &str) -> Result<()>;
}

/// Write side used by harvesters.
///
/// `ingest` is idempotent with respect to each entry's natural key and
/// never fails because of individual duplicates.
#[async_trait]
pub trait Ingestor: Send + Sync {
    async fn ingest(&self, batch: HarvesterBatch) -> Result<IngestReport>;
}

/// A persisted harvester record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarvesterDefinition {
    pub id: String,
    pub class_name: String,
    pub config_xml: String,
}

#[async_trait]
pub trait DefinitionStore: Send + Sync {
    async fn read_all(&self) -> Result<Vec<HarvesterDefinition>>;

    async fn insert(&self, definition: &HarvesterDefinition) -> Result<()>;

    async fn delete(&self, id: &str) -> Result<()>;
}

/// Context for one adapter call: the nearest persisted ancestor plus the
/// template entry it names, if any.
#[derive(Debug, Clone)]
pub struct SourceRoot {
    pub entry: Arc<Entry>,
    pub template: Option<Arc<Entry>>,
}

impl SourceRoot {
    pub fn new(entry: Arc<Entry>) -> Self {
        Self {
            entry,
            template: None,
        }
    }

    pub fn with_template(mut self, template: Option<Arc<Entry>>) -> Self {
        self.template = template;
        self
    }
}

/// Polymorphic view over one external hierarchy.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_kind(&self) -> SourceKind;

    /// Synthetic ids of the children of the node at `sub_path` (empty for
    /// the root itself). Unreachable or missing sources yield an empty list.
    async fn list_children(&self, root: &SourceRoot, sub_path: &str) -> Vec<String>;

    /// Materializes the node at `sub_path` as a synthetic entry.
    ///
    /// # Errors
    ///
    /// `NotFound` when the node no longer exists upstream,
    /// `SourceUnavailable` when the source cannot be reached.
    async fn resolve(&self, root: &SourceRoot, sub_path: &str) -> Result<Entry>;
}
