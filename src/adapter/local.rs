//! Local directory subtrees as synthetic entries.
//!
//! Sub-paths are `/`-separated and relative to the root entry's directory.
//! Raw directory listings are cached; include/exclude and minimum-age
//! filters run on every read so they always see the current clock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use super::{inherited_metadata, parent_id, FileFilter};
use crate::cache::{ExternalCache, DEFAULT_TTL};
use crate::clock::{Clock, SystemClock};
use crate::codec;
use crate::error::{CatalogError, Result};
use crate::model::{props, Entry, EntryKind, Resource, SourceKind};
use crate::traits::{SourceAdapter, SourceRoot};

/// One directory member as last read from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirItem {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// Resolves `relative` below `root`, rejecting anything that would
/// escape it.
pub fn safe_child(root: &Path, relative: &str) -> Result<PathBuf> {
    let relative = Path::new(relative);
    for component in relative.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(CatalogError::malformed_id(
                    relative.display().to_string(),
                    "path escapes the root directory",
                ));
            }
        }
    }
    Ok(root.join(relative))
}

/// Sorted listing of `dir`; members whose metadata cannot be read are skipped.
pub(crate) fn read_dir_blocking(dir: &Path) -> std::io::Result<Vec<DirItem>> {
    let mut items = Vec::new();
    for dirent in std::fs::read_dir(dir)? {
        let dirent = dirent?;
        let metadata = match dirent.metadata() {
            Ok(m) => m,
            Err(e) => {
                debug!(path = %dirent.path().display(), error = %e, "unreadable directory member");
                continue;
            }
        };
        items.push(DirItem {
            name: dirent.file_name().to_string_lossy().into_owned(),
            is_dir: metadata.is_dir(),
            size: metadata.len(),
            modified: metadata.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now()),
        });
    }
    items.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(items)
}

pub struct LocalDirectoryAdapter {
    cache: ExternalCache<Vec<DirItem>>,
    clock: Arc<dyn Clock>,
}

impl Default for LocalDirectoryAdapter {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl LocalDirectoryAdapter {
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            cache: ExternalCache::with_clock(ttl, clock.clone()),
            clock,
        }
    }

    fn root_dir(root: &SourceRoot) -> Result<PathBuf> {
        match (&root.entry.resource, root.entry.property(props::PATH)) {
            (_, Some(path)) => Ok(PathBuf::from(path)),
            (Resource::LocalDirectory(path), None) => Ok(path.clone()),
            _ => Err(CatalogError::Configuration(format!(
                "local-file root {} has no directory",
                root.entry.id
            ))),
        }
    }

    async fn listing(&self, dir: PathBuf) -> Result<Arc<Vec<DirItem>>> {
        let key = dir.to_string_lossy().into_owned();
        self.cache
            .get_or_fetch(&key, || async move {
                tokio::task::spawn_blocking(move || read_dir_blocking(&dir))
                    .await
                    .map_err(|e| CatalogError::Storage(format!("listing task failed: {e}")))?
                    .map_err(CatalogError::from)
            })
            .await
    }

    fn accepts(&self, filter: &FileFilter, item: &DirItem) -> bool {
        if item.is_dir {
            filter.accepts_dir(&item.name)
        } else {
            filter.accepts_file(&item.name, item.modified, self.clock.now())
        }
    }

    async fn try_list(&self, root: &SourceRoot, sub_path: &str) -> Result<Vec<String>> {
        let base = Self::root_dir(root)?;
        let filter = FileFilter::from_properties(&root.entry)?;
        let dir = safe_child(&base, sub_path)?;
        let items = self.listing(dir).await?;
        Ok(items
            .iter()
            .filter(|item| self.accepts(&filter, item))
            .map(|item| {
                let child = if sub_path.is_empty() {
                    item.name.clone()
                } else {
                    format!("{sub_path}/{}", item.name)
                };
                codec::encode(&root.entry.id, &child)
            })
            .collect())
    }
}

#[async_trait]
impl SourceAdapter for LocalDirectoryAdapter {
    fn source_kind(&self) -> SourceKind {
        SourceKind::LocalDirectory
    }

    #[instrument(skip(self, root), fields(root = %root.entry.id))]
    async fn list_children(&self, root: &SourceRoot, sub_path: &str) -> Vec<String> {
        match self.try_list(root, sub_path).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "cannot list local directory");
                Vec::new()
            }
        }
    }

    async fn resolve(&self, root: &SourceRoot, sub_path: &str) -> Result<Entry> {
        let base = Self::root_dir(root)?;
        let path = safe_child(&base, sub_path)?;
        let (parent_sub, name) = sub_path.rsplit_once('/').unwrap_or(("", sub_path));

        let metadata = match tokio::fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CatalogError::NotFound(path.display().to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let item = DirItem {
            name: name.to_string(),
            is_dir: metadata.is_dir(),
            size: metadata.len(),
            modified: metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| self.clock.now()),
        };
        let filter = FileFilter::from_properties(&root.entry)?;
        if !self.accepts(&filter, &item) {
            return Err(CatalogError::NotFound(path.display().to_string()));
        }

        let id = codec::encode(&root.entry.id, sub_path);
        let (kind, resource) = if item.is_dir {
            (EntryKind::Group, Resource::LocalDirectory(path))
        } else {
            (EntryKind::File, Resource::LocalFile(path))
        };
        let metadata = inherited_metadata(root, &id);
        Ok(Entry::new(id, item.name, kind, item.modified)
            .with_parent(parent_id(root, parent_sub))
            .with_owner(root.entry.owner_user_id.clone())
            .with_resource(resource)
            .with_metadata(metadata)
            .synthetic())
    }
}
