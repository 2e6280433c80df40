use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{CatalogError, Result};

/// Kind-specific property names stored in [`Entry::properties`].
pub mod props {
    /// Root directory of a local-file root
    pub const PATH: &str = "path";
    /// Comma-separated glob (or `regex:`) patterns a file must match
    pub const INCLUDES: &str = "includes";
    /// Comma-separated glob (or `regex:`) patterns that hide a file
    pub const EXCLUDES: &str = "excludes";
    /// Minimum file age in seconds before a file is listed
    pub const MIN_AGE: &str = "min_age";
    pub const SERVER: &str = "server";
    pub const BASEDIR: &str = "basedir";
    pub const USER: &str = "user";
    pub const PASSWORD: &str = "password";
    /// Largest downloadable file, in megabytes
    pub const MAXSIZE: &str = "maxsize";
    /// Catalog document URL of a catalog root
    pub const URL: &str = "url";
    /// Id of the entry whose metadata synthetic children inherit
    pub const TEMPLATE: &str = "template";
}

/// External source families an adapter can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceKind {
    LocalDirectory,
    Ftp,
    Catalog,
}

// ============================================================================
// Entry kinds
// ============================================================================

/// Discriminator selecting per-kind behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Group,
    Link,
    LocalFileRoot,
    FtpRoot,
    CatalogRoot,
}

/// Per-kind behavior table.
pub struct KindHandler {
    pub name: &'static str,
    pub icon: &'static str,
    /// Adapter family backing the synthetic subtree under this kind
    pub source: Option<SourceKind>,
    pub can_download: fn(&Entry) -> bool,
}

impl fmt::Debug for KindHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KindHandler")
            .field("name", &self.name)
            .field("source", &self.source)
            .finish()
    }
}

fn never_downloadable(_entry: &Entry) -> bool {
    false
}

fn file_downloadable(entry: &Entry) -> bool {
    match &entry.resource {
        Resource::LocalFile(_) => true,
        Resource::RemoteFile { size, .. } => {
            let max_megabytes = entry
                .properties
                .get(props::MAXSIZE)
                .and_then(|v| v.trim().parse::<f64>().ok())
                .unwrap_or(0.0);
            (*size as f64) < 1_000_000.0 * max_megabytes
        }
        _ => false,
    }
}

static FILE_HANDLER: KindHandler = KindHandler {
    name: "file",
    icon: "/icons/file.png",
    source: None,
    can_download: file_downloadable,
};

static GROUP_HANDLER: KindHandler = KindHandler {
    name: "group",
    icon: "/icons/folder.png",
    source: None,
    can_download: never_downloadable,
};

static LINK_HANDLER: KindHandler = KindHandler {
    name: "link",
    icon: "/icons/link.png",
    source: None,
    can_download: never_downloadable,
};

static LOCAL_ROOT_HANDLER: KindHandler = KindHandler {
    name: "localfiles",
    icon: "/icons/folder-local.png",
    source: Some(SourceKind::LocalDirectory),
    can_download: never_downloadable,
};

static FTP_ROOT_HANDLER: KindHandler = KindHandler {
    name: "ftp",
    icon: "/icons/ftp.png",
    source: Some(SourceKind::Ftp),
    can_download: never_downloadable,
};

static CATALOG_ROOT_HANDLER: KindHandler = KindHandler {
    name: "catalog",
    icon: "/icons/catalog.png",
    source: Some(SourceKind::Catalog),
    can_download: never_downloadable,
};

impl EntryKind {
    pub fn handler(self) -> &'static KindHandler {
        match self {
            Self::File => &FILE_HANDLER,
            Self::Group => &GROUP_HANDLER,
            Self::Link => &LINK_HANDLER,
            Self::LocalFileRoot => &LOCAL_ROOT_HANDLER,
            Self::FtpRoot => &FTP_ROOT_HANDLER,
            Self::CatalogRoot => &CATALOG_ROOT_HANDLER,
        }
    }

    pub fn is_group(self) -> bool {
        !matches!(self, Self::File | Self::Link)
    }

    /// Adapter family that materializes this kind's children, if any.
    pub fn source(self) -> Option<SourceKind> {
        self.handler().source
    }
}

// ============================================================================
// Resources and metadata
// ============================================================================

/// What an entry points at.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "location", rename_all = "snake_case")]
pub enum Resource {
    #[default]
    None,
    LocalFile(PathBuf),
    LocalDirectory(PathBuf),
    RemoteFile { url: String, size: u64 },
    Url(String),
}

impl Resource {
    /// Key used to deduplicate harvested entries.
    pub fn natural_key(&self) -> Option<String> {
        match self {
            Self::None => None,
            Self::LocalFile(path) | Self::LocalDirectory(path) => {
                Some(path.to_string_lossy().replace('\\', "/"))
            }
            Self::RemoteFile { url, .. } | Self::Url(url) => Some(url.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub id: String,
    pub entry_id: String,
    pub metadata_type: String,
    /// Whether descendants see this metadata as their own
    pub inherited: bool,
    pub attrs: Vec<String>,
}

impl Metadata {
    pub const TYPE_TAG: &'static str = "tag";
    pub const TYPE_LINK: &'static str = "link";

    pub fn new(entry_id: impl Into<String>, metadata_type: &str, attrs: Vec<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            entry_id: entry_id.into(),
            metadata_type: metadata_type.to_string(),
            inherited: false,
            attrs,
        }
    }

    pub fn tag(entry_id: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(entry_id, Self::TYPE_TAG, vec![value.into()])
    }

    pub fn link(entry_id: impl Into<String>, label: &str, url: impl Into<String>) -> Self {
        Self::new(entry_id, Self::TYPE_LINK, vec![label.to_string(), url.into()])
    }
}

// ============================================================================
// Permissions and principals
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    View,
    ViewChildren,
    Edit,
    New,
    Delete,
    Comment,
    File,
}

impl Action {
    pub const ALL: [Action; 7] = [
        Action::View,
        Action::ViewChildren,
        Action::Edit,
        Action::New,
        Action::Delete,
        Action::Comment,
        Action::File,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::View => "view",
            Self::ViewChildren => "viewchildren",
            Self::Edit => "edit",
            Self::New => "new",
            Self::Delete => "delete",
            Self::Comment => "comment",
            Self::File => "file",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self> {
        Action::ALL
            .into_iter()
            .find(|a| a.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| CatalogError::Configuration(format!("unknown action '{s}'")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub action: Action,
    /// Role tokens in priority order; `!role` denies
    pub roles: Vec<String>,
}

/// Ordered permission rows of one entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSet {
    permissions: Vec<Permission>,
}

impl PermissionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends the roles for `action`, merging with an existing row.
    pub fn with<S: Into<String>>(
        mut self,
        action: Action,
        roles: impl IntoIterator<Item = S>,
    ) -> Self {
        self.push(action, roles);
        self
    }

    pub fn push<S: Into<String>>(&mut self, action: Action, roles: impl IntoIterator<Item = S>) {
        let roles: Vec<String> = roles.into_iter().map(Into::into).collect();
        match self.permissions.iter_mut().find(|p| p.action == action) {
            Some(existing) => existing.roles.extend(roles),
            None => self.permissions.push(Permission { action, roles }),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.permissions.is_empty()
    }

    /// Roles declared for `action`; `None` when the action has no row.
    pub fn roles_for(&self, action: Action) -> Option<&[String]> {
        self.permissions
            .iter()
            .find(|p| p.action == action)
            .map(|p| p.roles.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Permission> {
        self.permissions.iter()
    }
}

pub const ROLE_ANY: &str = "any";
pub const ROLE_NONE: &str = "none";
pub const ROLE_USER: &str = "user";
pub const ROLE_ANONYMOUS: &str = "anonymous";

/// The party asking for access.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Principal {
    /// `None` for anonymous requests
    pub user_id: Option<String>,
    pub roles: BTreeSet<String>,
    pub admin: bool,
    /// Request address, matched by `ip:` role tokens
    pub ip: Option<String>,
}

impl Principal {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self {
            user_id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn admin(id: impl Into<String>) -> Self {
        Self {
            admin: true,
            ..Self::user(id)
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.insert(role.into());
        self
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    pub fn is_anonymous(&self) -> bool {
        self.user_id.is_none()
    }

    pub fn holds_role(&self, role: &str) -> bool {
        match role {
            ROLE_ANY => true,
            ROLE_NONE => false,
            ROLE_USER => !self.is_anonymous(),
            ROLE_ANONYMOUS => self.is_anonymous(),
            other => self.roles.contains(other),
        }
    }
}

// ============================================================================
// Lazily loaded per-entry lists
// ============================================================================

/// Load-once slot shared by every holder of an entry.
///
/// The value is computed under the slot's lock and handed out as an
/// immutable `Arc`; writers replace or clear the slot, never mutate the
/// shared value.
pub struct LoadCell<T> {
    slot: tokio::sync::Mutex<Option<Arc<T>>>,
}

impl<T> LoadCell<T> {
    pub fn empty() -> Self {
        Self {
            slot: tokio::sync::Mutex::new(None),
        }
    }

    pub fn loaded(value: T) -> Self {
        Self {
            slot: tokio::sync::Mutex::new(Some(Arc::new(value))),
        }
    }

    pub async fn get_or_load<F, Fut>(&self, load: F) -> Result<Arc<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut slot = self.slot.lock().await;
        if let Some(value) = slot.as_ref() {
            return Ok(Arc::clone(value));
        }
        let value = Arc::new(load().await?);
        *slot = Some(Arc::clone(&value));
        Ok(value)
    }

    pub async fn replace(&self, value: T) {
        *self.slot.lock().await = Some(Arc::new(value));
    }

    pub async fn invalidate(&self) {
        *self.slot.lock().await = None;
    }

    /// Current value without waiting for an in-flight load.
    pub fn peek(&self) -> Option<Arc<T>> {
        self.slot.try_lock().ok().and_then(|slot| slot.clone())
    }
}

impl<T> Default for LoadCell<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> Clone for LoadCell<T> {
    fn clone(&self) -> Self {
        Self {
            slot: tokio::sync::Mutex::new(self.peek()),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for LoadCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.peek() {
            Some(value) => f.debug_tuple("Loaded").field(&value).finish(),
            None => f.write_str("NotLoaded"),
        }
    }
}

// ============================================================================
// Entries
// ============================================================================

/// A node of the catalog: persisted row or synthetic materialization.
#[derive(Debug, Clone)]
pub struct Entry {
    pub id: String,
    pub name: String,
    pub description: String,
    pub parent_group_id: Option<String>,
    pub owner_user_id: String,
    pub resource: Resource,
    pub create_time: DateTime<Utc>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub kind: EntryKind,
    pub is_synthetic: bool,
    pub properties: BTreeMap<String, String>,
    pub metadata: LoadCell<Vec<Metadata>>,
    pub permissions: LoadCell<PermissionSet>,
}

impl Entry {
    /// New entry whose coverage interval collapses onto `create_time`.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        kind: EntryKind,
        create_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            parent_group_id: None,
            owner_user_id: String::new(),
            resource: Resource::None,
            create_time,
            start_time: create_time,
            end_time: create_time,
            kind,
            is_synthetic: false,
            properties: BTreeMap::new(),
            metadata: LoadCell::empty(),
            permissions: LoadCell::empty(),
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_group_id = Some(parent_id.into());
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner_user_id = owner.into();
        self
    }

    pub fn with_resource(mut self, resource: Resource) -> Self {
        self.resource = resource;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_times(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.start_time = start;
        self.end_time = end;
        self
    }

    pub fn with_property(mut self, key: &str, value: impl Into<String>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Vec<Metadata>) -> Self {
        self.metadata = LoadCell::loaded(metadata);
        self
    }

    /// Marks the entry as transient; synthetic entries have no stored
    /// permission rows, so the list starts out loaded and empty.
    pub fn synthetic(mut self) -> Self {
        self.is_synthetic = true;
        self.permissions = LoadCell::loaded(PermissionSet::new());
        self
    }

    pub fn is_group(&self) -> bool {
        self.kind.is_group()
    }

    pub fn is_root(&self) -> bool {
        self.parent_group_id.is_none()
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Synthetic view of a file living in a local directory or on FTP.
    pub fn is_external_file(&self) -> bool {
        self.is_synthetic
            && matches!(
                self.resource,
                Resource::LocalFile(_) | Resource::LocalDirectory(_) | Resource::RemoteFile { .. }
            )
    }

    pub fn icon(&self) -> &'static str {
        self.kind.handler().icon
    }
}

// ============================================================================
// Harvest batches
// ============================================================================

/// A transient entry produced by a harvester, placed by group path.
#[derive(Debug, Clone)]
pub struct HarvestedEntry {
    /// Group the path is relative to; the top group when `None`
    pub base_group_id: Option<String>,
    /// `/`-separated group names below the base group
    pub group_path: String,
    pub entry: Entry,
}

/// One ingestion call's worth of harvested entries, in discovery order.
#[derive(Debug, Clone)]
pub struct HarvesterBatch {
    pub harvester_id: String,
    pub entries: Vec<HarvestedEntry>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    pub inserted: usize,
    pub duplicates: usize,
    pub groups_created: usize,
}
