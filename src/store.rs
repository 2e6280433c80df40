//! In-memory storage collaborator.
//!
//! Implements every storage seam the core talks to: entry reads, permission
//! and metadata rows, harvester ingestion and harvester definitions. The
//! daemon runs on it; tests use it as their fixture.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

use crate::access::root_default_permissions;
use crate::error::{CatalogError, Result};
use crate::model::{
    Entry, EntryKind, HarvesterBatch, IngestReport, LoadCell, Metadata, PermissionSet,
};
use crate::traits::{DefinitionStore, EntryStore, HarvesterDefinition, Ingestor};

pub const TOP_GROUP_ID: &str = "top";

#[derive(Default)]
struct StoreState {
    entries: HashMap<String, Entry>,
    /// Child ids per parent, in insertion order
    children: HashMap<String, Vec<String>>,
    permissions: HashMap<String, PermissionSet>,
    metadata: HashMap<String, Vec<Metadata>>,
    /// Natural key (resource path or URL) to entry id
    natural_keys: HashMap<String, String>,
    definitions: BTreeMap<String, HarvesterDefinition>,
}

impl StoreState {
    fn insert(&mut self, mut entry: Entry) {
        if let Some(metadata) = entry.metadata.peek() {
            let rows = metadata
                .iter()
                .cloned()
                .map(|mut m| {
                    m.entry_id = entry.id.clone();
                    m
                })
                .collect::<Vec<_>>();
            if !rows.is_empty() {
                self.metadata.entry(entry.id.clone()).or_default().extend(rows);
            }
        }
        // Stored rows never carry per-request caches
        entry.metadata = LoadCell::empty();
        entry.permissions = LoadCell::empty();
        entry.is_synthetic = false;

        if let Some(key) = entry.resource.natural_key() {
            self.natural_keys.insert(key, entry.id.clone());
        }
        if let Some(parent) = &entry.parent_group_id {
            self.children.entry(parent.clone()).or_default().push(entry.id.clone());
        }
        self.entries.insert(entry.id.clone(), entry);
    }

    fn child_group_named(&self, parent_id: &str, name: &str) -> Option<String> {
        self.children.get(parent_id).and_then(|ids| {
            ids.iter()
                .find(|id| {
                    self.entries
                        .get(*id)
                        .is_some_and(|e| e.is_group() && e.name == name)
                })
                .cloned()
        })
    }

    /// Walks `path` below `base_id`, creating missing groups.
    fn ensure_group_path(
        &mut self,
        base_id: &str,
        path: &str,
        owner: &str,
        created: &mut usize,
    ) -> String {
        let mut parent = base_id.to_string();
        for name in path.split('/').map(str::trim).filter(|s| !s.is_empty()) {
            parent = match self.child_group_named(&parent, name) {
                Some(id) => id,
                None => {
                    let id = uuid::Uuid::new_v4().to_string();
                    let group = Entry::new(id, name, EntryKind::Group, Utc::now())
                        .with_parent(parent.clone())
                        .with_owner(owner);
                    let id = group.id.clone();
                    self.insert(group);
                    *created += 1;
                    id
                }
            };
        }
        parent
    }
}

pub struct MemoryStore {
    top_group_id: String,
    state: RwLock<StoreState>,
}

impl MemoryStore {
    /// Store holding only a top group with the default root permissions.
    pub fn with_top_group(name: &str) -> Self {
        let store = Self {
            top_group_id: TOP_GROUP_ID.to_string(),
            state: RwLock::new(StoreState::default()),
        };
        {
            let mut state = store.state.write();
            state.insert(Entry::new(TOP_GROUP_ID, name, EntryKind::Group, Utc::now()));
            state
                .permissions
                .insert(TOP_GROUP_ID.to_string(), root_default_permissions());
        }
        store
    }

    /// Persists an entry created by a user action.
    ///
    /// # Errors
    ///
    /// `NotFound` when the parent group does not exist.
    pub fn insert_entry(&self, entry: Entry) -> Result<()> {
        let mut state = self.state.write();
        if let Some(parent) = &entry.parent_group_id {
            if !state.entries.contains_key(parent) {
                return Err(CatalogError::NotFound(parent.clone()));
            }
        }
        state.insert(entry);
        Ok(())
    }

    pub fn entry_count(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn find_by_natural_key(&self, key: &str) -> Option<Entry> {
        let state = self.state.read();
        state
            .natural_keys
            .get(key)
            .and_then(|id| state.entries.get(id))
            .cloned()
    }

    /// Slash-joined names from the top group's child down to `id`.
    pub fn full_name(&self, id: &str) -> Option<String> {
        let state = self.state.read();
        let mut names = Vec::new();
        let mut current = state.entries.get(id)?;
        while let Some(parent) = &current.parent_group_id {
            names.push(current.name.clone());
            current = state.entries.get(parent)?;
        }
        names.reverse();
        Some(names.join("/"))
    }

    /// Persisted entries that are not groups.
    pub fn leaf_entries(&self) -> Vec<Entry> {
        let state = self.state.read();
        let mut leaves: Vec<Entry> =
            state.entries.values().filter(|e| !e.is_group()).cloned().collect();
        leaves.sort_by(|a, b| a.name.cmp(&b.name));
        leaves
    }
}

#[async_trait]
impl EntryStore for MemoryStore {
    fn top_group_id(&self) -> &str {
        &self.top_group_id
    }

    async fn get_entry(&self, id: &str) -> Result<Option<Entry>> {
        Ok(self.state.read().entries.get(id).cloned())
    }

    async fn child_ids(&self, group_id: &str) -> Result<Vec<String>> {
        Ok(self.state.read().children.get(group_id).cloned().unwrap_or_default())
    }

    async fn load_permissions(&self, entry_id: &str) -> Result<PermissionSet> {
        Ok(self.state.read().permissions.get(entry_id).cloned().unwrap_or_default())
    }

    async fn store_permissions(&self, entry_id: &str, permissions: &PermissionSet) -> Result<()> {
        let mut state = self.state.write();
        if !state.entries.contains_key(entry_id) {
            return Err(CatalogError::NotFound(entry_id.to_string()));
        }
        state.permissions.insert(entry_id.to_string(), permissions.clone());
        Ok(())
    }

    async fn load_metadata(&self, entry_id: &str) -> Result<Vec<Metadata>> {
        Ok(self.state.read().metadata.get(entry_id).cloned().unwrap_or_default())
    }

    async fn insert_metadata(&self, metadata: &Metadata) -> Result<()> {
        let mut state = self.state.write();
        if !state.entries.contains_key(&metadata.entry_id) {
            return Err(CatalogError::NotFound(metadata.entry_id.clone()));
        }
        state
            .metadata
            .entry(metadata.entry_id.clone())
            .or_default()
            .push(metadata.clone());
        Ok(())
    }

    async fn delete_metadata(&self, entry_id: &str, metadata_id: &str) -> Result<()> {
        if let Some(rows) = self.state.write().metadata.get_mut(entry_id) {
            rows.retain(|m| m.id != metadata_id);
        }
        Ok(())
    }
}

#[async_trait]
impl Ingestor for MemoryStore {
    async fn ingest(&self, batch: HarvesterBatch) -> Result<IngestReport> {
        let mut report = IngestReport::default();
        let mut state = self.state.write();

        for item in batch.entries {
            let mut entry = item.entry;
            if let Some(key) = entry.resource.natural_key() {
                if state.natural_keys.contains_key(&key) {
                    debug!(harvester = %batch.harvester_id, key, "skipping already ingested entry");
                    report.duplicates += 1;
                    continue;
                }
            }

            let base = item.base_group_id.unwrap_or_else(|| self.top_group_id.clone());
            if !state.entries.contains_key(&base) {
                warn!(
                    harvester = %batch.harvester_id,
                    base_group = %base,
                    "base group missing, entry skipped"
                );
                continue;
            }
            let owner = entry.owner_user_id.clone();
            let parent = state.ensure_group_path(
                &base,
                &item.group_path,
                &owner,
                &mut report.groups_created,
            );

            if entry.id.is_empty() {
                entry.id = uuid::Uuid::new_v4().to_string();
            }
            entry.parent_group_id = Some(parent);
            state.insert(entry);
            report.inserted += 1;
        }

        Ok(report)
    }
}

#[async_trait]
impl DefinitionStore for MemoryStore {
    async fn read_all(&self) -> Result<Vec<HarvesterDefinition>> {
        Ok(self.state.read().definitions.values().cloned().collect())
    }

    async fn insert(&self, definition: &HarvesterDefinition) -> Result<()> {
        self.state
            .write()
            .definitions
            .insert(definition.id.clone(), definition.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.state.write().definitions.remove(id);
        Ok(())
    }
}
