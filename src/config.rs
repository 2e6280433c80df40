use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{CatalogError, Result};
use crate::harvest::pipeline::DEFAULT_FLUSH_THRESHOLD;
use crate::thredds::DEFAULT_DEPTH_LIMIT;

const DEFAULT_CONFIG_ENV: &str = "CATALOG_HARVESTER_CONFIG";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub log_level: Option<String>,
    /// Kill switch for automatic harvester start
    pub harvesters_active: bool,
    pub download_ok: bool,
    pub cache_ttl_secs: u64,
    pub flush_threshold: usize,
    pub harvester_concurrency: usize,
    pub catalog_depth_limit: usize,
    pub http_timeout_secs: u64,
    pub top_group_name: String,
    pub harvester_files: Vec<PathBuf>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            log_level: Some(String::from("info")),
            harvesters_active: true,
            download_ok: false,
            cache_ttl_secs: 300,
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            harvester_concurrency: 4,
            catalog_depth_limit: DEFAULT_DEPTH_LIMIT,
            http_timeout_secs: 30,
            top_group_name: String::from("Top"),
            harvester_files: Vec::new(),
        }
    }
}

impl CatalogConfig {
    pub fn from_sources(cli_path: Option<&str>) -> Result<Self> {
        let env_path = std::env::var(DEFAULT_CONFIG_ENV).ok();

        if let Some(path) = cli_path {
            if path.is_empty() {
                return Err(CatalogError::Configuration(
                    "configuration path must not be empty".into(),
                ));
            }
        }

        let config = if let Some(path) = cli_path {
            Self::load_from_path(path)?
        } else if let Some(path) = env_path.as_deref().filter(|p| !p.is_empty()) {
            Self::load_from_path(path)?
        } else {
            Self::default()
        };

        config.validate()?;
        Ok(config)
    }

    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let absolute_path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()?.join(path)
        };

        let raw = fs::read_to_string(&absolute_path)?;
        let mut config: CatalogConfig = toml::from_str(&raw).map_err(|err| {
            CatalogError::Configuration(format!(
                "invalid configuration {}: {err}",
                absolute_path.display()
            ))
        })?;
        let base = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        config.normalize_paths(&base);
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache_ttl_secs == 0 {
            return Err(CatalogError::Configuration(
                "cache_ttl_secs must be greater than zero".into(),
            ));
        }
        if self.flush_threshold == 0 {
            return Err(CatalogError::Configuration(
                "flush_threshold must be greater than zero".into(),
            ));
        }
        if self.harvester_concurrency == 0 {
            return Err(CatalogError::Configuration(
                "harvester_concurrency must be greater than zero".into(),
            ));
        }
        if self.http_timeout_secs == 0 {
            return Err(CatalogError::Configuration(
                "http_timeout_secs must be greater than zero".into(),
            ));
        }
        if self.top_group_name.trim().is_empty() {
            return Err(CatalogError::Configuration(
                "top_group_name must not be empty".into(),
            ));
        }
        Ok(())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    fn normalize_paths(&mut self, base: &Path) {
        for file in &mut self.harvester_files {
            if file.is_relative() {
                *file = base.join(&*file);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = CatalogConfig::default();
        config.validate().unwrap();
        assert!(config.harvesters_active);
        assert!(!config.download_ok);
        assert_eq!(config.cache_ttl(), Duration::from_secs(300));
        assert_eq!(config.flush_threshold, 100);
        assert_eq!(config.catalog_depth_limit, 10);
    }

    #[test]
    fn test_load_from_path_fills_defaults_and_resolves_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalogd.toml");
        std::fs::write(
            &path,
            r#"
log_level = "debug,catalog_harvester=trace"
harvesters_active = false
flush_threshold = 25
harvester_files = ["harvesters.xml", "/etc/catalogd/more.xml"]
"#,
        )
        .unwrap();

        let config = CatalogConfig::from_sources(path.to_str()).unwrap();
        assert!(!config.harvesters_active);
        assert_eq!(config.flush_threshold, 25);
        assert_eq!(config.harvester_concurrency, 4);
        assert_eq!(config.harvester_files[0], dir.path().join("harvesters.xml"));
        assert_eq!(config.harvester_files[1], PathBuf::from("/etc/catalogd/more.xml"));
    }

    #[test]
    fn test_rejects_bad_sources() {
        assert!(matches!(
            CatalogConfig::from_sources(Some("")),
            Err(CatalogError::Configuration(_))
        ));
        assert!(matches!(
            CatalogConfig::from_sources(Some("/no/such/catalogd.toml")),
            Err(CatalogError::Io(_))
        ));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zero.toml");
        std::fs::write(&path, "harvester_concurrency = 0\n").unwrap();
        assert!(matches!(
            CatalogConfig::from_sources(path.to_str()),
            Err(CatalogError::Configuration(_))
        ));
        std::fs::write(&path, "flush_threshold = \"many\"\n").unwrap();
        assert!(matches!(
            CatalogConfig::load_from_path(&path),
            Err(CatalogError::Configuration(_))
        ));
    }
}
