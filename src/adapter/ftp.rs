//! FTP server subtrees as synthetic entries.
//!
//! Sub-paths are absolute server paths; the root's `basedir` is the empty
//! sub-path. Every listing opens its own control connection, logs in,
//! lists and quits. Listings are cached per `ftp://server/path`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use super::{inherited_metadata, parent_id};
use crate::cache::{ExternalCache, DEFAULT_TTL};
use crate::codec;
use crate::error::{CatalogError, Result};
use crate::model::{props, Entry, EntryKind, Resource, SourceKind};
use crate::traits::{SourceAdapter, SourceRoot};

const DEFAULT_PORT: u16 = 21;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtpItem {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

/// Connection settings read from an FTP root entry.
#[derive(Clone, PartialEq, Eq)]
pub struct FtpLogin {
    pub server: String,
    pub user: Option<String>,
    pub password: String,
}

impl std::fmt::Debug for FtpLogin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FtpLogin")
            .field("server", &self.server)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

impl FtpLogin {
    pub fn from_entry(entry: &Entry) -> Result<Self> {
        let server = entry
            .property(props::SERVER)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                CatalogError::Configuration(format!("FTP root {} has no server", entry.id))
            })?;
        Ok(Self {
            server: server.to_string(),
            user: entry
                .property(props::USER)
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(str::to_string),
            password: entry.property(props::PASSWORD).unwrap_or_default().to_string(),
        })
    }

    /// `host:port`, defaulting the port.
    pub fn address(&self) -> String {
        if self.server.contains(':') {
            self.server.clone()
        } else {
            format!("{}:{DEFAULT_PORT}", self.server)
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("ftp://{}{}", self.server, path)
    }
}

/// Lists one directory on one server.
#[async_trait]
pub trait FtpConnector: Send + Sync {
    /// # Errors
    ///
    /// `SourceUnavailable` when the server cannot be reached, refuses the
    /// login or the listing.
    async fn list(&self, login: &FtpLogin, path: &str) -> Result<Vec<FtpItem>>;
}

/// Connector over `suppaftp`, binary mode, passive transfers.
pub struct SuppaFtpConnector {
    timeout: Duration,
}

impl SuppaFtpConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for SuppaFtpConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

fn list_blocking(login: &FtpLogin, path: &str, timeout: Duration) -> Result<Vec<FtpItem>> {
    use std::net::ToSocketAddrs;
    use suppaftp::types::FileType;
    use suppaftp::{FtpStream, Mode};

    let locator = login.url(path);
    let unavailable = |e: suppaftp::FtpError| CatalogError::unavailable(locator.clone(), e);

    let addr = login
        .address()
        .to_socket_addrs()
        .map_err(|e| CatalogError::unavailable(locator.clone(), e))?
        .next()
        .ok_or_else(|| CatalogError::unavailable(locator.clone(), "no address for server"))?;
    let mut stream = FtpStream::connect_timeout(addr, timeout).map_err(unavailable)?;
    match &login.user {
        Some(user) => stream.login(user.as_str(), login.password.as_str()),
        None => stream.login("anonymous", "anonymous@"),
    }
    .map_err(unavailable)?;
    stream.transfer_type(FileType::Binary).map_err(unavailable)?;
    stream.set_mode(Mode::Passive);

    let lines = stream.list(Some(path));
    if let Err(e) = stream.quit() {
        debug!(server = %login.server, error = %e, "FTP quit failed");
    }

    Ok(lines
        .map_err(unavailable)?
        .iter()
        .filter_map(|line| suppaftp::list::File::from_str(line).ok())
        .filter(|f| f.name() != "." && f.name() != "..")
        .map(|f| FtpItem {
            name: f.name().to_string(),
            is_dir: f.is_directory(),
            size: f.size() as u64,
            modified: Some(DateTime::<Utc>::from(f.modified())),
        })
        .collect())
}

#[async_trait]
impl FtpConnector for SuppaFtpConnector {
    #[instrument(skip(self))]
    async fn list(&self, login: &FtpLogin, path: &str) -> Result<Vec<FtpItem>> {
        let login = login.clone();
        let path = path.to_string();
        let timeout = self.timeout;
        let locator = login.url(&path);
        tokio::task::spawn_blocking(move || list_blocking(&login, &path, timeout))
            .await
            .map_err(|e| CatalogError::unavailable(locator, e))?
    }
}

fn join_path(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

pub struct FtpAdapter {
    connector: Arc<dyn FtpConnector>,
    cache: ExternalCache<Vec<FtpItem>>,
}

impl FtpAdapter {
    pub fn new(connector: Arc<dyn FtpConnector>) -> Self {
        Self::with_cache(connector, ExternalCache::new(DEFAULT_TTL))
    }

    pub fn with_cache(
        connector: Arc<dyn FtpConnector>,
        cache: ExternalCache<Vec<FtpItem>>,
    ) -> Self {
        Self { connector, cache }
    }

    fn base_dir(root: &SourceRoot) -> String {
        let dir = root
            .entry
            .property(props::BASEDIR)
            .unwrap_or_default()
            .trim()
            .trim_end_matches('/');
        if dir.is_empty() {
            "/".to_string()
        } else if dir.starts_with('/') {
            dir.to_string()
        } else {
            format!("/{dir}")
        }
    }

    /// Server path of a sub-path; the empty sub-path is the base directory.
    ///
    /// # Errors
    ///
    /// `MalformedId` for relative paths, `.`/`..` segments, or paths outside
    /// the base directory.
    fn server_path(root: &SourceRoot, sub_path: &str) -> Result<String> {
        let base = Self::base_dir(root);
        if sub_path.is_empty() {
            return Ok(base);
        }
        if !sub_path.starts_with('/') {
            return Err(CatalogError::malformed_id(sub_path, "FTP paths are absolute"));
        }
        let path = match sub_path.trim_end_matches('/') {
            "" => "/",
            trimmed => trimmed,
        };
        if path.split('/').any(|segment| segment == "." || segment == "..") {
            return Err(CatalogError::malformed_id(sub_path, "path escapes the base directory"));
        }
        let inside = base == "/" || path == base || path.starts_with(&format!("{base}/"));
        if !inside {
            return Err(CatalogError::malformed_id(sub_path, "path is outside the base directory"));
        }
        Ok(path.to_string())
    }

    async fn listing(&self, login: &FtpLogin, path: &str) -> Result<Arc<Vec<FtpItem>>> {
        self.cache
            .get_or_fetch(&login.url(path), || self.connector.list(login, path))
            .await
    }
}

#[async_trait]
impl SourceAdapter for FtpAdapter {
    fn source_kind(&self) -> SourceKind {
        SourceKind::Ftp
    }

    #[instrument(skip(self, root), fields(root = %root.entry.id))]
    async fn list_children(&self, root: &SourceRoot, sub_path: &str) -> Vec<String> {
        let login = match FtpLogin::from_entry(&root.entry) {
            Ok(login) => login,
            Err(e) => {
                warn!(error = %e, "FTP root misconfigured");
                return Vec::new();
            }
        };
        let dir = match Self::server_path(root, sub_path) {
            Ok(dir) => dir,
            Err(e) => {
                warn!(error = %e, "rejected FTP path");
                return Vec::new();
            }
        };
        match self.listing(&login, &dir).await {
            Ok(items) => items
                .iter()
                .map(|item| codec::encode(&root.entry.id, &join_path(&dir, &item.name)))
                .collect(),
            Err(e) => {
                warn!(error = %e, "cannot list FTP directory");
                Vec::new()
            }
        }
    }

    async fn resolve(&self, root: &SourceRoot, sub_path: &str) -> Result<Entry> {
        let login = FtpLogin::from_entry(&root.entry)?;
        let path = Self::server_path(root, sub_path)?;
        let base = Self::base_dir(root);
        if sub_path.is_empty() || path == base {
            return Err(CatalogError::malformed_id(sub_path, "base directory is the root entry"));
        }
        let path = path.as_str();
        let (dir, name) = match path.rsplit_once('/') {
            Some(("", name)) => ("/", name),
            Some((dir, name)) => (dir, name),
            None => return Err(CatalogError::malformed_id(sub_path, "FTP paths are absolute")),
        };

        let items = self.listing(&login, dir).await?;
        let item = items
            .iter()
            .find(|item| item.name == name)
            .ok_or_else(|| CatalogError::NotFound(login.url(path)))?;

        let parent_sub = if dir == base { "" } else { dir };
        let id = codec::encode(&root.entry.id, path);
        let created = item.modified.unwrap_or(root.entry.create_time);
        let mut entry = if item.is_dir {
            Entry::new(id.clone(), &item.name, EntryKind::Group, created)
        } else {
            Entry::new(id.clone(), &item.name, EntryKind::File, created).with_resource(
                Resource::RemoteFile {
                    url: login.url(path),
                    size: item.size,
                },
            )
        };
        if let Some(maxsize) = root.entry.property(props::MAXSIZE) {
            entry = entry.with_property(props::MAXSIZE, maxsize);
        }
        Ok(entry
            .with_parent(parent_id(root, parent_sub))
            .with_owner(root.entry.owner_user_id.clone())
            .with_metadata(inherited_metadata(root, &id))
            .synthetic())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Default)]
    struct MockConnector {
        dirs: HashMap<String, Vec<FtpItem>>,
        calls: Mutex<Vec<String>>,
        down: bool,
    }

    impl MockConnector {
        fn with_dir(mut self, path: &str, items: Vec<FtpItem>) -> Self {
            self.dirs.insert(path.to_string(), items);
            self
        }
    }

    #[async_trait]
    impl FtpConnector for MockConnector {
        async fn list(&self, login: &FtpLogin, path: &str) -> Result<Vec<FtpItem>> {
            self.calls.lock().push(path.to_string());
            if self.down {
                return Err(CatalogError::unavailable(login.url(path), "connection refused"));
            }
            self.dirs
                .get(path)
                .cloned()
                .ok_or_else(|| CatalogError::unavailable(login.url(path), "550 no such directory"))
        }
    }

    fn item(name: &str, is_dir: bool, size: u64) -> FtpItem {
        FtpItem {
            name: name.to_string(),
            is_dir,
            size,
            modified: None,
        }
    }

    fn ftp_root() -> SourceRoot {
        SourceRoot::new(Arc::new(
            Entry::new("ftp1", "Data server", EntryKind::FtpRoot, Utc::now())
                .with_parent("top")
                .with_property(props::SERVER, "ftp.example.org")
                .with_property(props::BASEDIR, "/pub")
                .with_property(props::MAXSIZE, "2"),
        ))
    }

    fn connector() -> MockConnector {
        MockConnector::default()
            .with_dir("/pub", vec![item("data", true, 0), item("README", false, 120)])
            .with_dir(
                "/pub/data",
                vec![item("big.nc", false, 5_000_000), item("small.nc", false, 10)],
            )
    }

    #[tokio::test]
    async fn test_lists_base_dir_then_subdir() {
        let adapter = FtpAdapter::new(Arc::new(connector()));
        let root = ftp_root();

        let top = adapter.list_children(&root, "").await;
        assert_eq!(
            top,
            vec![codec::encode("ftp1", "/pub/data"), codec::encode("ftp1", "/pub/README")]
        );

        let data = adapter.list_children(&root, "/pub/data").await;
        assert_eq!(data.len(), 2);
    }

    #[tokio::test]
    async fn test_listing_is_cached_per_path() {
        let mock = Arc::new(connector());
        let adapter = FtpAdapter::new(mock.clone());
        let root = ftp_root();

        adapter.list_children(&root, "").await;
        adapter.list_children(&root, "").await;
        adapter.resolve(&root, "/pub/README").await.unwrap();
        assert_eq!(*mock.calls.lock(), vec!["/pub".to_string()]);
    }

    #[tokio::test]
    async fn test_resolve_carries_size_and_maxsize() {
        let adapter = FtpAdapter::new(Arc::new(connector()));
        let root = ftp_root();

        let dir = adapter.resolve(&root, "/pub/data").await.unwrap();
        assert_eq!(dir.kind, EntryKind::Group);
        assert_eq!(dir.parent_group_id.as_deref(), Some("ftp1"));

        let small = adapter.resolve(&root, "/pub/data/small.nc").await.unwrap();
        assert_eq!(small.parent_group_id, Some(codec::encode("ftp1", "/pub/data")));
        assert_eq!(
            small.resource,
            Resource::RemoteFile {
                url: "ftp://ftp.example.org/pub/data/small.nc".into(),
                size: 10
            }
        );
        assert!((small.kind.handler().can_download)(&small));

        let big = adapter.resolve(&root, "/pub/data/big.nc").await.unwrap();
        assert!(!(big.kind.handler().can_download)(&big));
    }

    #[tokio::test]
    async fn test_unreachable_server() {
        let adapter = FtpAdapter::new(Arc::new(MockConnector {
            down: true,
            ..MockConnector::default()
        }));
        let root = ftp_root();

        assert!(adapter.list_children(&root, "").await.is_empty());
        let err = adapter.resolve(&root, "/pub/README").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_vanished_file_is_not_found() {
        let adapter = FtpAdapter::new(Arc::new(connector()));
        let err = adapter.resolve(&ftp_root(), "/pub/data/gone.nc").await.unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn test_paths_outside_base_dir_are_rejected() {
        let mock = Arc::new(connector().with_dir("/etc", vec![item("passwd", false, 10)]));
        let adapter = FtpAdapter::new(mock.clone());
        let root = ftp_root();

        let outside = [
            "/etc/passwd",
            "/pub/../etc/passwd",
            "/pub/./README",
            "/public/x",
            "pub/README",
            "/pub",
        ];
        for sub_path in outside {
            let err = adapter.resolve(&root, sub_path).await.unwrap_err();
            assert_eq!(err.status_code(), 400, "{sub_path}");
        }
        assert!(adapter.list_children(&root, "/etc").await.is_empty());
        assert!(adapter.list_children(&root, "/pub/data/..").await.is_empty());
        assert!(mock.calls.lock().is_empty());

        assert!(adapter.resolve(&root, "/pub/data/").await.is_ok());
    }

    #[test]
    fn test_login_requires_server() {
        let entry = Entry::new("f", "f", EntryKind::FtpRoot, Utc::now());
        assert!(matches!(FtpLogin::from_entry(&entry), Err(CatalogError::Configuration(_))));
        let login = FtpLogin::from_entry(&entry.with_property(props::SERVER, "host")).unwrap();
        assert_eq!(login.address(), "host:21");
        assert!(login.user.is_none());
    }
}
