//! The logical node graph: persisted entries plus synthetic subtrees.
//!
//! Resolution never writes to storage. Synthetic sub-paths are always
//! relative to the nearest persisted ancestor embedded in the id.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::codec;
use crate::error::{CatalogError, Result};
use crate::model::{props, Entry, Metadata, PermissionSet, SourceKind};
use crate::traits::{EntryStore, SourceAdapter, SourceRoot};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub struct EntryTree {
    store: Arc<dyn EntryStore>,
    adapters: HashMap<SourceKind, Arc<dyn SourceAdapter>>,
    /// Serializes permission writes
    permission_lock: tokio::sync::Mutex<()>,
    /// Serializes metadata writes so insert-then-read stays consistent
    metadata_lock: tokio::sync::Mutex<()>,
}

impl EntryTree {
    pub fn new(store: Arc<dyn EntryStore>) -> Self {
        Self {
            store,
            adapters: HashMap::new(),
            permission_lock: tokio::sync::Mutex::new(()),
            metadata_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn SourceAdapter>) -> Self {
        self.adapters.insert(adapter.source_kind(), adapter);
        self
    }

    pub fn store(&self) -> &Arc<dyn EntryStore> {
        &self.store
    }

    pub fn top_group_id(&self) -> &str {
        self.store.top_group_id()
    }

    /// Resolves a persisted or synthetic id to an entry.
    ///
    /// # Errors
    ///
    /// `MalformedId` for undecodable synthetic ids, `NotFound` when the
    /// entry (or its upstream source node) does not exist.
    pub fn resolve<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Arc<Entry>>> {
        Box::pin(async move {
            if !codec::is_synthetic(id) {
                return self
                    .store
                    .get_entry(id)
                    .await?
                    .map(Arc::new)
                    .ok_or_else(|| CatalogError::NotFound(id.to_string()));
            }

            let (parent_id, sub_path) = codec::decode(id)?;
            let parent = self.resolve(&parent_id).await?;
            if sub_path.is_empty() {
                return Ok(parent);
            }
            let root = self.persisted_root(parent).await?;
            let adapter = self.adapter_for(&root.entry, id)?;
            debug!(id, root = %root.entry.id, sub_path, "resolving synthetic entry");
            Ok(Arc::new(adapter.resolve(&root, &sub_path).await?))
        })
    }

    /// Ids of the children of `group_id`: persisted rows first, then the
    /// listing of the external source the group is rooted on.
    #[instrument(skip(self))]
    pub async fn children(&self, group_id: &str) -> Result<Vec<String>> {
        let group = self.resolve(group_id).await?;
        if !group.is_group() {
            return Ok(Vec::new());
        }

        if group.is_synthetic {
            let (_, sub_path) = codec::decode(&group.id)?;
            let root = self.persisted_root(Arc::clone(&group)).await?;
            let adapter = self.adapter_for(&root.entry, group_id)?;
            return Ok(adapter.list_children(&root, &sub_path).await);
        }

        let mut ids = self.store.child_ids(&group.id).await?;
        if group.kind.source().is_some() {
            let root = self.source_root(Arc::clone(&group)).await?;
            let adapter = self.adapter_for(&root.entry, group_id)?;
            ids.extend(adapter.list_children(&root, "").await);
        }
        Ok(ids)
    }

    /// Metadata of `entry`, loaded once per entry instance.
    pub async fn metadata(&self, entry: &Entry) -> Result<Arc<Vec<Metadata>>> {
        if entry.is_synthetic {
            return entry.metadata.get_or_load(|| async { Ok(Vec::new()) }).await;
        }
        entry
            .metadata
            .get_or_load(|| self.store.load_metadata(&entry.id))
            .await
    }

    /// Replaces the permission rows of a persisted entry and swaps the
    /// cached list on this instance.
    pub async fn set_permissions(&self, entry: &Entry, permissions: PermissionSet) -> Result<()> {
        reject_synthetic(entry)?;
        let _guard = self.permission_lock.lock().await;
        self.store.store_permissions(&entry.id, &permissions).await?;
        entry.permissions.replace(permissions).await;
        Ok(())
    }

    pub async fn add_metadata(&self, entry: &Entry, mut metadata: Metadata) -> Result<()> {
        reject_synthetic(entry)?;
        metadata.entry_id = entry.id.clone();
        let _guard = self.metadata_lock.lock().await;
        self.store.insert_metadata(&metadata).await?;
        entry.metadata.invalidate().await;
        Ok(())
    }

    pub async fn delete_metadata(&self, entry: &Entry, metadata_id: &str) -> Result<()> {
        reject_synthetic(entry)?;
        let _guard = self.metadata_lock.lock().await;
        self.store.delete_metadata(&entry.id, metadata_id).await?;
        entry.metadata.invalidate().await;
        Ok(())
    }

    /// Walks synthetic ancestors back to the persisted entry whose id
    /// prefixes theirs.
    async fn persisted_root(&self, mut entry: Arc<Entry>) -> Result<SourceRoot> {
        while entry.is_synthetic {
            let (parent_id, _) = codec::decode(&entry.id)?;
            entry = self.resolve(&parent_id).await?;
        }
        self.source_root(entry).await
    }

    async fn source_root(&self, entry: Arc<Entry>) -> Result<SourceRoot> {
        let template = match entry.property(props::TEMPLATE) {
            Some(template_id) => match self.store.get_entry(template_id).await? {
                Some(template) => {
                    template
                        .metadata
                        .get_or_load(|| self.store.load_metadata(template_id))
                        .await?;
                    Some(Arc::new(template))
                }
                None => {
                    debug!(root = %entry.id, template_id, "template entry missing");
                    None
                }
            },
            None => None,
        };
        Ok(SourceRoot::new(entry).with_template(template))
    }

    fn adapter_for(&self, root: &Entry, requested: &str) -> Result<&Arc<dyn SourceAdapter>> {
        root.kind
            .source()
            .and_then(|kind| self.adapters.get(&kind))
            .ok_or_else(|| CatalogError::NotFound(requested.to_string()))
    }
}

fn reject_synthetic(entry: &Entry) -> Result<()> {
    if entry.is_synthetic {
        return Err(CatalogError::Storage(format!(
            "synthetic entry {} cannot be written",
            entry.id
        )));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::{EntryKind, Resource};
    use crate::store::{MemoryStore, TOP_GROUP_ID};
    use async_trait::async_trait;
    use chrono::Utc;

    /// Adapter over a fixed list of `/`-separated paths.
    pub(crate) struct FixedAdapter {
        pub paths: Vec<&'static str>,
    }

    #[async_trait]
    impl SourceAdapter for FixedAdapter {
        fn source_kind(&self) -> SourceKind {
            SourceKind::LocalDirectory
        }

        async fn list_children(&self, root: &SourceRoot, sub_path: &str) -> Vec<String> {
            let prefix = if sub_path.is_empty() {
                String::new()
            } else {
                format!("{sub_path}/")
            };
            self.paths
                .iter()
                .filter(|p| {
                    p.strip_prefix(prefix.as_str())
                        .is_some_and(|rest| !rest.is_empty() && !rest.contains('/'))
                })
                .map(|p| codec::encode(&root.entry.id, p))
                .collect()
        }

        async fn resolve(&self, root: &SourceRoot, sub_path: &str) -> Result<Entry> {
            if !self.paths.iter().any(|p| *p == sub_path) {
                return Err(CatalogError::NotFound(sub_path.to_string()));
            }
            let is_dir = self.paths.iter().any(|p| p.starts_with(&format!("{sub_path}/")));
            let parent = match sub_path.rsplit_once('/') {
                Some((parent, _)) => codec::encode(&root.entry.id, parent),
                None => root.entry.id.clone(),
            };
            let name = sub_path.rsplit('/').next().unwrap_or(sub_path);
            let kind = if is_dir { EntryKind::Group } else { EntryKind::File };
            let metadata = root
                .template
                .as_ref()
                .and_then(|t| t.metadata.peek())
                .map(|m| m.to_vec())
                .unwrap_or_default();
            Ok(
                Entry::new(codec::encode(&root.entry.id, sub_path), name, kind, Utc::now())
                    .with_parent(parent)
                    .with_resource(Resource::LocalFile(sub_path.into()))
                    .with_metadata(metadata)
                    .synthetic(),
            )
        }
    }

    pub(crate) fn tree_with_local_root() -> (Arc<MemoryStore>, EntryTree) {
        let store = Arc::new(MemoryStore::with_top_group("Top"));
        store
            .insert_entry(
                Entry::new("local", "Local files", EntryKind::LocalFileRoot, Utc::now())
                    .with_parent(TOP_GROUP_ID),
            )
            .unwrap();
        let tree = EntryTree::new(store.clone()).with_adapter(Arc::new(FixedAdapter {
            paths: vec!["a", "a/x.txt", "b", "b/y.txt"],
        }));
        (store, tree)
    }

    #[tokio::test]
    async fn test_children_merges_persisted_and_synthetic() {
        let (_store, tree) = tree_with_local_root();
        let top_children = tree.children(TOP_GROUP_ID).await.unwrap();
        assert_eq!(top_children, vec!["local".to_string()]);

        let root_children = tree.children("local").await.unwrap();
        assert_eq!(
            root_children,
            vec![codec::encode("local", "a"), codec::encode("local", "b")]
        );

        let nested = tree.children(&codec::encode("local", "a")).await.unwrap();
        assert_eq!(nested, vec![codec::encode("local", "a/x.txt")]);
    }

    #[tokio::test]
    async fn test_resolve_synthetic_entry() {
        let (store, tree) = tree_with_local_root();
        let id = codec::encode("local", "b/y.txt");
        let entry = tree.resolve(&id).await.unwrap();
        assert!(entry.is_synthetic);
        assert_eq!(entry.name, "y.txt");
        assert_eq!(entry.parent_group_id.as_deref(), Some(codec::encode("local", "b").as_str()));
        // Browsing never writes rows
        assert_eq!(store.entry_count(), 2);
    }

    #[tokio::test]
    async fn test_empty_sub_path_resolves_to_root() {
        let (_store, tree) = tree_with_local_root();
        let entry = tree.resolve(&codec::encode("local", "")).await.unwrap();
        assert_eq!(entry.id, "local");
    }

    #[tokio::test]
    async fn test_resolve_errors() {
        let (_store, tree) = tree_with_local_root();
        assert!(matches!(
            tree.resolve("missing").await.unwrap_err(),
            CatalogError::NotFound(_)
        ));
        assert!(matches!(
            tree.resolve(&codec::encode("local", "c/z.txt")).await.unwrap_err(),
            CatalogError::NotFound(_)
        ));
        assert!(matches!(
            tree.resolve("synth:local").await.unwrap_err(),
            CatalogError::MalformedId { .. }
        ));
        // A plain group has no source behind it
        assert!(matches!(
            tree.resolve(&codec::encode(TOP_GROUP_ID, "a")).await.unwrap_err(),
            CatalogError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_nested_synthetic_id_resolves_through_persisted_root() {
        let (_store, tree) = tree_with_local_root();
        let nested = codec::encode(&codec::encode("local", "a"), "a/x.txt");
        let entry = tree.resolve(&nested).await.unwrap();
        assert_eq!(entry.name, "x.txt");
    }

    #[tokio::test]
    async fn test_template_metadata_reaches_synthetic_children() {
        let store = Arc::new(MemoryStore::with_top_group("Top"));
        store
            .insert_entry(
                Entry::new("tmpl", "Template", EntryKind::File, Utc::now())
                    .with_parent(TOP_GROUP_ID),
            )
            .unwrap();
        store
            .insert_entry(
                Entry::new("local", "Local", EntryKind::LocalFileRoot, Utc::now())
                    .with_parent(TOP_GROUP_ID)
                    .with_property(props::TEMPLATE, "tmpl"),
            )
            .unwrap();
        let tree = EntryTree::new(store.clone())
            .with_adapter(Arc::new(FixedAdapter { paths: vec!["f.nc"] }));
        let template = tree.resolve("tmpl").await.unwrap();
        tree.add_metadata(&template, Metadata::tag("", "ocean")).await.unwrap();

        let child = tree.resolve(&codec::encode("local", "f.nc")).await.unwrap();
        let metadata = tree.metadata(&child).await.unwrap();
        assert_eq!(metadata.len(), 1);
        assert_eq!(metadata[0].attrs, vec!["ocean".to_string()]);
    }

    #[tokio::test]
    async fn test_metadata_write_invalidates_cached_list() {
        let (_store, tree) = tree_with_local_root();
        let root = tree.resolve("local").await.unwrap();
        assert!(tree.metadata(&root).await.unwrap().is_empty());

        tree.add_metadata(&root, Metadata::tag("", "x")).await.unwrap();
        let loaded = tree.metadata(&root).await.unwrap();
        assert_eq!(loaded.len(), 1);

        tree.delete_metadata(&root, &loaded[0].id).await.unwrap();
        assert!(tree.metadata(&root).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_synthetic_entries_reject_metadata_writes() {
        let (_store, tree) = tree_with_local_root();
        let child = tree.resolve(&codec::encode("local", "a")).await.unwrap();
        assert!(tree.add_metadata(&child, Metadata::tag("", "x")).await.is_err());
    }
}
