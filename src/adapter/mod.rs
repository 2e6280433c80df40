//! Source adapters: external hierarchies materialized as synthetic entries.

pub mod catalog;
pub mod ftp;
pub mod local;

pub use catalog::CatalogXmlAdapter;
pub use ftp::{FtpAdapter, FtpConnector, FtpItem, FtpLogin, SuppaFtpConnector};
pub use local::LocalDirectoryAdapter;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;

use crate::codec;
use crate::error::{CatalogError, Result};
use crate::model::{props, Entry, Metadata};
use crate::traits::SourceRoot;

// ============================================================================
// Name filters
// ============================================================================

/// One include/exclude pattern: a glob, or a regex when prefixed `regex:`.
#[derive(Debug, Clone)]
pub enum NamePattern {
    Glob(glob::Pattern),
    Regex(Regex),
}

impl NamePattern {
    pub fn parse(pattern: &str) -> Result<Self> {
        match pattern.strip_prefix("regex:") {
            Some(re) => Regex::new(re)
                .map(Self::Regex)
                .map_err(|e| CatalogError::Configuration(format!("bad regex '{re}': {e}"))),
            None => glob::Pattern::new(pattern)
                .map(Self::Glob)
                .map_err(|e| CatalogError::Configuration(format!("bad glob '{pattern}': {e}"))),
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        match self {
            Self::Glob(glob) => glob.matches(name),
            Self::Regex(re) => re.is_match(name),
        }
    }
}

fn parse_patterns(list: &str) -> Result<Vec<NamePattern>> {
    list.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(NamePattern::parse)
        .collect()
}

/// File selection shared by the local adapter and the pattern harvester.
///
/// Hidden names (leading `.`) are always rejected. Includes and the minimum
/// age only constrain files; excludes apply to directories too.
#[derive(Debug, Clone, Default)]
pub struct FileFilter {
    includes: Vec<NamePattern>,
    excludes: Vec<NamePattern>,
    min_age: Option<Duration>,
}

impl FileFilter {
    /// Builds a filter from comma-separated pattern lists.
    ///
    /// # Errors
    ///
    /// `Configuration` when a pattern does not compile.
    pub fn parse(includes: &str, excludes: &str) -> Result<Self> {
        Ok(Self {
            includes: parse_patterns(includes)?,
            excludes: parse_patterns(excludes)?,
            min_age: None,
        })
    }

    pub fn with_min_age(mut self, min_age: Option<Duration>) -> Self {
        self.min_age = min_age.filter(|age| *age > Duration::zero());
        self
    }

    /// Filter configured on a local-file root entry.
    pub fn from_properties(entry: &Entry) -> Result<Self> {
        let min_age = match entry.property(props::MIN_AGE) {
            Some(secs) => Some(parse_seconds(secs)?),
            None => None,
        };
        Ok(Self::parse(
            entry.property(props::INCLUDES).unwrap_or_default(),
            entry.property(props::EXCLUDES).unwrap_or_default(),
        )?
        .with_min_age(min_age))
    }

    pub fn is_hidden(name: &str) -> bool {
        name.starts_with('.')
    }

    pub fn accepts_dir(&self, name: &str) -> bool {
        !Self::is_hidden(name) && !self.excludes.iter().any(|p| p.matches(name))
    }

    /// Name checks only; see [`accepts_file`](Self::accepts_file).
    pub fn accepts_name(&self, name: &str) -> bool {
        self.accepts_dir(name)
            && (self.includes.is_empty() || self.includes.iter().any(|p| p.matches(name)))
    }

    pub fn old_enough(&self, modified: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self.min_age {
            Some(min_age) => now - modified >= min_age,
            None => true,
        }
    }

    pub fn accepts_file(&self, name: &str, modified: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.accepts_name(name) && self.old_enough(modified, now)
    }
}

/// Whole or fractional seconds.
pub(crate) fn parse_seconds(value: &str) -> Result<Duration> {
    let secs: f64 = value
        .trim()
        .parse()
        .map_err(|_| CatalogError::Configuration(format!("'{value}' is not a number of seconds")))?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(CatalogError::Configuration(format!("'{value}' is not a duration")));
    }
    Ok(Duration::milliseconds((secs * 1000.0) as i64))
}

// ============================================================================
// Shared helpers
// ============================================================================

/// Id of the node at `parent_sub_path`, the root itself when empty.
pub(crate) fn parent_id(root: &SourceRoot, parent_sub_path: &str) -> String {
    if parent_sub_path.is_empty() {
        root.entry.id.clone()
    } else {
        codec::encode(&root.entry.id, parent_sub_path)
    }
}

/// Copies of the template entry's metadata for a synthetic child.
pub(crate) fn inherited_metadata(root: &SourceRoot, entry_id: &str) -> Vec<Metadata> {
    root.template
        .as_ref()
        .and_then(|template| template.metadata.peek())
        .map(|rows| {
            rows.iter()
                .map(|m| Metadata {
                    id: uuid::Uuid::new_v4().to_string(),
                    entry_id: entry_id.to_string(),
                    inherited: true,
                    ..m.clone()
                })
                .collect()
        })
        .unwrap_or_default()
}
