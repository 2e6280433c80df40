//! Harvests files below a local root directory whose paths match a pattern.
//!
//! `filepattern` is a regex over the full `/`-separated path. Groups written
//! `(name:regex)` capture named values: `fromdate` and `todate` become the
//! entry's time range, anything else is substituted into the templates as
//! `${name}`.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use parking_lot::Mutex;
use regex::Regex;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

use super::definition::HarvesterConfig;
use super::traits::{HarvestContext, Harvester, HarvesterSettings, PassReport};
use crate::adapter::local::{read_dir_blocking, DirItem};
use crate::adapter::{parse_seconds, FileFilter};
use crate::error::{CatalogError, Result};
use crate::model::{Entry, EntryKind, HarvestedEntry, Metadata, Resource};

pub const CLASS_NAME: &str = "PatternHarvester";
pub const DEFAULT_DATE_FORMAT: &str = "%Y%m%d_%H%M";
pub const DEFAULT_NAME_TEMPLATE: &str = "${filename}";
pub const DEFAULT_GROUP_TEMPLATE: &str = "${dirgroup}";
pub const DEFAULT_TAG_TEMPLATE: &str = "${extension}";
const MACRO_DATE_FORMAT: &str = "%Y-%m-%d %H:%M";

/// Rewrites `(name:regex)` groups to `(?P<name>regex)`.
fn compile_file_pattern(pattern: &str) -> Result<Regex> {
    let named = Regex::new(r"(^|[^\\])\(([A-Za-z_][A-Za-z0-9_]*):")
        .map_err(|e| CatalogError::Configuration(e.to_string()))?;
    // Twice, so adjacent groups such as "((a:x)(b:y))" both rewrite
    let once = named.replace_all(pattern, "${1}(?P<${2}>");
    let rewritten = named.replace_all(&once, "${1}(?P<${2}>");
    Regex::new(&rewritten)
        .map_err(|e| CatalogError::Configuration(format!("bad filepattern '{pattern}': {e}")))
}

fn parse_date(value: &str, formats: &[String]) -> Option<DateTime<Utc>> {
    formats.iter().find_map(|format| {
        NaiveDateTime::parse_from_str(value, format)
            .ok()
            .or_else(|| {
                NaiveDate::parse_from_str(value, format)
                    .ok()
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
            })
            .map(|dt| dt.and_utc())
    })
}

/// Replaces `${key}` and `${key:format}` with `date`.
fn replace_date(template: &str, key: &str, date: DateTime<Utc>) -> String {
    let plain = format!("${{{key}}}");
    let mut out = template.replace(&plain, &date.format(MACRO_DATE_FORMAT).to_string());
    let open = format!("${{{key}:");
    while let Some(start) = out.find(&open) {
        let Some(len) = out[start..].find('}') else {
            break;
        };
        let format = &out[start + open.len()..start + len];
        let mut formatted = String::new();
        if write!(formatted, "{}", date.format(format)).is_err() {
            formatted = format.to_string();
        }
        out.replace_range(start..=start + len, &formatted);
    }
    out
}

fn extension(file_name: &str) -> &str {
    match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => ext,
        _ => "",
    }
}

/// Directory state carried between passes.
#[derive(Debug, Clone, Default)]
struct ScanState {
    /// Modification time per known directory; `None` forces a rescan
    dirs: BTreeMap<PathBuf, Option<DateTime<Utc>>>,
    /// Files seen while still younger than the minimum age
    deferred: HashSet<PathBuf>,
    last_pass: Option<DateTime<Utc>>,
}

pub struct PatternHarvester {
    settings: HarvesterSettings,
    root_dir: PathBuf,
    file_pattern: Option<(String, Regex)>,
    date_formats: Vec<String>,
    filter: FileFilter,
    raw_filter: (String, String, Option<String>),
    name_template: String,
    desc_template: String,
    group_template: String,
    tag_template: String,
    state: Mutex<ScanState>,
}

impl std::fmt::Debug for PatternHarvester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatternHarvester")
            .field("id", &self.settings.id)
            .field("root_dir", &self.root_dir)
            .finish()
    }
}

impl PatternHarvester {
    /// # Errors
    ///
    /// `Configuration` when `rootdir` is missing or a pattern does not compile.
    pub fn from_config(settings: HarvesterSettings, config: &HarvesterConfig) -> Result<Self> {
        let root_dir = PathBuf::from(config.required("rootdir")?);
        let pattern = config.attr("filepattern").map(str::trim).filter(|p| !p.is_empty());
        let file_pattern = match pattern {
            Some(p) => Some((p.to_string(), compile_file_pattern(p)?)),
            None => None,
        };
        let date_formats: Vec<String> = config
            .attr("dateformat")
            .unwrap_or(DEFAULT_DATE_FORMAT)
            .split(',')
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(str::to_string)
            .collect();

        let includes = config.attr("includes").unwrap_or_default().to_string();
        let excludes = config.attr("excludes").unwrap_or_default().to_string();
        let min_age = config.attr("minage").map(str::to_string);
        let filter = FileFilter::parse(&includes, &excludes)?.with_min_age(match &min_age {
            Some(secs) => Some(parse_seconds(secs)?),
            None => None,
        });
        let template = |name: &str, default: &str| config.attr(name).unwrap_or(default).to_string();

        Ok(Self {
            settings,
            root_dir,
            file_pattern,
            date_formats,
            filter,
            raw_filter: (includes, excludes, min_age),
            name_template: template("nametemplate", DEFAULT_NAME_TEMPLATE),
            desc_template: template("desctemplate", ""),
            group_template: template("grouptemplate", DEFAULT_GROUP_TEMPLATE),
            tag_template: template("tagtemplate", DEFAULT_TAG_TEMPLATE),
            state: Mutex::new(ScanState::default()),
        })
    }

    /// Forgets directory timestamps so the next pass rescans everything.
    pub fn clear_cache(&self) {
        *self.state.lock() = ScanState::default();
    }

    /// Root directory name followed by the file's directory below the root.
    fn dir_group(&self, dir: &Path) -> String {
        let mut parts: Vec<String> = self
            .root_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .into_iter()
            .collect();
        if let Ok(relative) = dir.strip_prefix(&self.root_dir) {
            let names = relative.components().map(|c| c.as_os_str().to_string_lossy().into_owned());
            parts.extend(names);
        }
        parts.join("/")
    }

    /// Builds the entry for one file, `None` when it does not match.
    fn process_file(&self, dir: &Path, item: &DirItem) -> Option<HarvestedEntry> {
        let path = dir.join(&item.name);
        let full = path.to_string_lossy().replace('\\', "/");

        let mut values: Vec<(String, String)> = Vec::new();
        let mut from_date = None;
        let mut to_date = None;
        if let Some((source, pattern)) = &self.file_pattern {
            let Some(captures) = pattern.captures(&full) else {
                debug!(file = %full, pattern = %source, "file does not match pattern");
                return None;
            };
            for name in pattern.capture_names().flatten() {
                let Some(value) = captures.name(name).map(|m| m.as_str()) else {
                    continue;
                };
                match name {
                    "fromdate" | "todate" => {
                        let Some(date) = parse_date(value, &self.date_formats) else {
                            warn!(file = %full, value, "unparseable date in file name, skipping");
                            return None;
                        };
                        if name == "fromdate" {
                            from_date = Some(date);
                        } else {
                            to_date = Some(date);
                        }
                    }
                    _ => values.push((name.to_string(), value.to_string())),
                }
            }
        }

        let create_date = item.modified;
        let from_date = from_date.or(to_date).unwrap_or(create_date);
        let to_date = to_date.unwrap_or(from_date);
        let ext = extension(&item.name);

        let expand = |template: &str| {
            let mut out = template
                .replace("${filename}", &item.name)
                .replace("${extension}", ext)
                .replace("${dirgroup}", &self.dir_group(dir));
            for (name, value) in &values {
                out = out.replace(&format!("${{{name}}}"), value);
            }
            out = replace_date(&out, "createdate", create_date);
            out = replace_date(&out, "fromdate", from_date);
            replace_date(&out, "todate", to_date)
        };

        let name = expand(&self.name_template);
        let description = expand(&self.desc_template).replace("${name}", &name);
        let group_path = expand(&self.group_template);
        let tags = expand(&self.tag_template)
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(|t| Metadata::tag("", t))
            .collect();

        Some(HarvestedEntry {
            base_group_id: self.settings.base_group_id.clone(),
            group_path,
            entry: Entry::new("", name, EntryKind::File, create_date)
                .with_owner(self.settings.user.clone())
                .with_description(description)
                .with_times(from_date, to_date)
                .with_resource(Resource::LocalFile(path))
                .with_metadata(tags),
        })
    }
}

async fn list_dir(dir: PathBuf) -> Result<Vec<DirItem>> {
    tokio::task::spawn_blocking(move || read_dir_blocking(&dir))
        .await
        .map_err(|e| CatalogError::Storage(format!("listing task failed: {e}")))?
        .map_err(CatalogError::from)
}

#[async_trait]
impl Harvester for PatternHarvester {
    fn settings(&self) -> &HarvesterSettings {
        &self.settings
    }

    fn config(&self) -> HarvesterConfig {
        let mut config = HarvesterConfig::harvester(CLASS_NAME)
            .with_attr("rootdir", self.root_dir.to_string_lossy())
            .with_attr("dateformat", self.date_formats.join(","))
            .with_attr("nametemplate", self.name_template.clone())
            .with_attr("desctemplate", self.desc_template.clone())
            .with_attr("grouptemplate", self.group_template.clone())
            .with_attr("tagtemplate", self.tag_template.clone())
            .with_attr("includes", self.raw_filter.0.clone())
            .with_attr("excludes", self.raw_filter.1.clone());
        if let Some((source, _)) = &self.file_pattern {
            config = config.with_attr("filepattern", source.clone());
        }
        if let Some(min_age) = &self.raw_filter.2 {
            config = config.with_attr("minage", min_age.clone());
        }
        self.settings.apply_to(config)
    }

    #[instrument(
        skip(self, ctx),
        fields(harvester = %self.settings.id, root = %self.root_dir.display())
    )]
    async fn run_pass(&self, ctx: &HarvestContext) -> Result<PassReport> {
        let mut sink = ctx.sink();
        let pass_start = ctx.now();
        let mut state = self.state.lock().clone();

        if !tokio::fs::try_exists(&self.root_dir).await.unwrap_or(false) {
            warn!("root directory does not exist");
            sink.skipped();
            return sink.finish().await;
        }

        let mut queue: VecDeque<PathBuf> = VecDeque::from([self.root_dir.clone()]);
        queue.extend(state.dirs.keys().cloned());
        let mut seen = HashSet::new();
        let mut completed = true;

        while let Some(dir) = queue.pop_front() {
            if !ctx.is_active() {
                info!(pending = queue.len() + 1, "stop requested, ending pass early");
                queue.push_front(dir);
                completed = false;
                break;
            }
            if !seen.insert(dir.clone()) {
                continue;
            }
            let dir_modified = tokio::fs::metadata(&dir).await.and_then(|m| m.modified());
            let modified: DateTime<Utc> = match dir_modified {
                Ok(t) => t.into(),
                Err(_) => {
                    debug!(dir = %dir.display(), "directory vanished");
                    state.dirs.remove(&dir);
                    continue;
                }
            };
            if state.dirs.get(&dir) == Some(&Some(modified)) {
                continue;
            }

            let items = match list_dir(dir.clone()).await {
                Ok(items) => items,
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "cannot list directory, skipping");
                    sink.skipped();
                    continue;
                }
            };

            let mut rescan = false;
            for item in &items {
                if item.is_dir {
                    if self.filter.accepts_dir(&item.name) {
                        queue.push_back(dir.join(&item.name));
                    }
                    continue;
                }
                if !self.filter.accepts_name(&item.name) {
                    continue;
                }
                let path = dir.join(&item.name);
                if !self.filter.old_enough(item.modified, pass_start) {
                    state.deferred.insert(path);
                    rescan = true;
                    continue;
                }
                let deferred = state.deferred.remove(&path);
                if !deferred && state.last_pass.is_some_and(|last| item.modified < last) {
                    continue;
                }
                if let Some(entry) = self.process_file(&dir, item) {
                    sink.push(entry).await?;
                }
            }
            state.dirs.insert(dir, if rescan { None } else { Some(modified) });
        }

        if completed {
            state.last_pass = Some(pass_start);
        } else {
            // Unvisited directories are scanned in full next pass.
            for dir in queue {
                if !seen.contains(&dir) {
                    state.dirs.insert(dir, None);
                }
            }
        }
        *self.state.lock() = state;
        sink.finish().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock, SystemClock};
    use crate::harvest::pipeline::IngestionPipeline;
    use crate::harvest::traits::RunSignal;
    use crate::store::MemoryStore;
    use crate::traits::EntryStore;
    use std::sync::Arc;

    fn harvester(config: HarvesterConfig) -> PatternHarvester {
        let settings = HarvesterSettings::from_config("p1", &config).unwrap();
        PatternHarvester::from_config(settings, &config).unwrap()
    }

    fn context(store: Arc<MemoryStore>, clock: Arc<dyn Clock>) -> HarvestContext {
        let pipeline = Arc::new(IngestionPipeline::new(store));
        HarvestContext::new("p1", Arc::new(RunSignal::new()), pipeline, clock)
    }

    #[test]
    fn test_named_captures_are_rewritten() {
        let re = compile_file_pattern(r"(model:[a-z]+)_(fromdate:\d{8}_\d{4})\.nc$").unwrap();
        let caps = re.captures("/data/gfs_20240102_0600.nc").unwrap();
        assert_eq!(&caps["model"], "gfs");
        assert_eq!(&caps["fromdate"], "20240102_0600");
        assert!(compile_file_pattern("(?:x)(a:(").is_err());
    }

    #[test]
    fn test_date_macros() {
        let date = parse_date("20240102_0600", &[DEFAULT_DATE_FORMAT.to_string()]).unwrap();
        assert_eq!(replace_date("${fromdate:%Y/%m}", "fromdate", date), "2024/01");
        assert_eq!(replace_date("at ${fromdate}", "fromdate", date), "at 2024-01-02 06:00");
        let day = parse_date("2024-01-02", &["%Y%m%d".into(), "%Y-%m-%d".into()]).unwrap();
        assert_eq!(day.format("%H").to_string(), "00");
        assert_eq!(extension("a.tar.gz"), "gz");
        assert_eq!(extension(".profile"), "");
    }

    #[test]
    fn test_requires_rootdir() {
        let config = HarvesterConfig::harvester(CLASS_NAME);
        let settings = HarvesterSettings::from_config("p", &config).unwrap();
        assert!(matches!(
            PatternHarvester::from_config(settings, &config),
            Err(CatalogError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_harvests_tree_into_directory_groups() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("root");
        std::fs::create_dir_all(root.join("a")).unwrap();
        std::fs::create_dir_all(root.join("b")).unwrap();
        std::fs::write(root.join("a/x.txt"), b"x").unwrap();
        std::fs::write(root.join("b/y.txt"), b"y").unwrap();
        std::fs::write(root.join("b/skip.csv"), b"s").unwrap();

        let store = Arc::new(MemoryStore::with_top_group("Top"));
        let harvester = harvester(
            HarvesterConfig::harvester(CLASS_NAME)
                .with_attr("rootdir", root.to_string_lossy())
                .with_attr("includes", "*.txt"),
        );
        let ctx = context(store.clone(), Arc::new(SystemClock));
        let report = harvester.run_pass(&ctx).await.unwrap();
        assert_eq!(report.found, 2);
        assert_eq!(report.ingested, 2);

        let leaves = store.leaf_entries();
        assert_eq!(leaves.len(), 2);
        for (leaf, group) in leaves.iter().zip(["root/a", "root/b"]) {
            let parent = leaf.parent_group_id.clone().unwrap();
            assert_eq!(store.full_name(&parent).unwrap(), group);
            let tags = store.load_metadata(&leaf.id).await.unwrap();
            assert_eq!(tags.len(), 1);
            assert_eq!(tags[0].metadata_type, Metadata::TYPE_TAG);
            assert_eq!(tags[0].attrs, vec!["txt".to_string()]);
        }
    }

    #[tokio::test]
    async fn test_templates_use_captures_and_dates() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("runs");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("gfs_20240102_0600.nc"), b"g").unwrap();
        std::fs::write(root.join("readme.txt"), b"r").unwrap();

        let store = Arc::new(MemoryStore::with_top_group("Top"));
        let harvester = harvester(
            HarvesterConfig::harvester(CLASS_NAME)
                .with_attr("rootdir", root.to_string_lossy())
                .with_attr("filepattern", r"(model:[a-z]+)_(fromdate:\d{8}_\d{4})\.nc$")
                .with_attr("nametemplate", "${model} ${fromdate:%Y-%m-%d}")
                .with_attr("desctemplate", "Run ${name}")
                .with_attr("grouptemplate", "Models/${model}")
                .with_attr("tagtemplate", "${model},${extension}"),
        );
        let ctx = context(store.clone(), Arc::new(SystemClock));
        let report = harvester.run_pass(&ctx).await.unwrap();
        assert_eq!(report.found, 1);

        let entry = store.leaf_entries().remove(0);
        assert_eq!(entry.name, "gfs 2024-01-02");
        assert_eq!(entry.description, "Run gfs 2024-01-02");
        assert_eq!(entry.start_time.format("%H%M").to_string(), "0600");
        assert_eq!(entry.end_time, entry.start_time);
        let group = entry.parent_group_id.as_deref().unwrap();
        assert_eq!(store.full_name(group).unwrap(), "Models/gfs");
        let tags: Vec<String> = store
            .load_metadata(&entry.id)
            .await
            .unwrap()
            .into_iter()
            .flat_map(|m| m.attrs)
            .collect();
        assert_eq!(tags, vec!["gfs".to_string(), "nc".to_string()]);
    }

    #[tokio::test]
    async fn test_unchanged_directories_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("root");
        std::fs::create_dir_all(root.join("a")).unwrap();
        std::fs::write(root.join("a/x.txt"), b"x").unwrap();

        let store = Arc::new(MemoryStore::with_top_group("Top"));
        let config =
            HarvesterConfig::harvester(CLASS_NAME).with_attr("rootdir", root.to_string_lossy());
        let harvester = harvester(config);
        let ctx = context(store.clone(), Arc::new(SystemClock));

        assert_eq!(harvester.run_pass(&ctx).await.unwrap().found, 1);
        assert_eq!(harvester.run_pass(&ctx).await.unwrap().found, 0);

        harvester.clear_cache();
        let report = harvester.run_pass(&ctx).await.unwrap();
        assert_eq!(report.found, 1);
        assert_eq!(report.duplicates, 1);
    }

    #[tokio::test]
    async fn test_young_files_wait_for_min_age() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("root");
        std::fs::create_dir_all(&root).unwrap();
        let file = root.join("fresh.dat");
        std::fs::write(&file, b"partial").unwrap();
        let modified: DateTime<Utc> = std::fs::metadata(&file).unwrap().modified().unwrap().into();

        let clock = Arc::new(ManualClock::new(modified + chrono::Duration::seconds(10)));
        let store = Arc::new(MemoryStore::with_top_group("Top"));
        let harvester = harvester(
            HarvesterConfig::harvester(CLASS_NAME)
                .with_attr("rootdir", root.to_string_lossy())
                .with_attr("minage", "60"),
        );
        let ctx = context(store.clone(), clock.clone());

        assert_eq!(harvester.run_pass(&ctx).await.unwrap().found, 0);
        clock.advance(chrono::Duration::seconds(51));
        assert_eq!(harvester.run_pass(&ctx).await.unwrap().found, 1);
    }

    #[tokio::test]
    async fn test_interrupted_pass_keeps_previous_cutoff() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("root");
        std::fs::create_dir_all(&root).unwrap();

        let clock = Arc::new(ManualClock::new(Utc::now() - chrono::Duration::days(1)));
        let store = Arc::new(MemoryStore::with_top_group("Top"));
        let pipeline = Arc::new(IngestionPipeline::new(store.clone()));
        let config =
            HarvesterConfig::harvester(CLASS_NAME).with_attr("rootdir", root.to_string_lossy());
        let harvester = harvester(config);
        let signal = Arc::new(RunSignal::new());
        let ctx = HarvestContext::new("p1", signal, pipeline.clone(), clock.clone());
        assert_eq!(harvester.run_pass(&ctx).await.unwrap().found, 0);

        std::fs::create_dir_all(root.join("a")).unwrap();
        std::fs::write(root.join("a/x.txt"), b"x").unwrap();
        clock.advance(chrono::Duration::days(2));

        let stopped = Arc::new(RunSignal::new());
        stopped.stop();
        let stopped_ctx = HarvestContext::new("p1", stopped, pipeline.clone(), clock.clone());
        assert_eq!(harvester.run_pass(&stopped_ctx).await.unwrap().found, 0);

        let report = harvester.run_pass(&ctx).await.unwrap();
        assert_eq!(report.found, 1);
        assert_eq!(store.leaf_entries().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_root_is_skipped() {
        let store = Arc::new(MemoryStore::with_top_group("Top"));
        let config = HarvesterConfig::harvester(CLASS_NAME).with_attr("rootdir", "/no/such/root");
        let ctx = context(store, Arc::new(SystemClock));
        let report = harvester(config).run_pass(&ctx).await.unwrap();
        assert_eq!(report.skipped_sources, 1);
        assert_eq!(report.found, 0);
    }
}
