//! Remote THREDDS catalogs as synthetic entries.
//!
//! A sub-path is the `/`-joined list of child indexes leading from the
//! root catalog to a node. Stepping through a `catalogRef` continues in the
//! referenced document, so a path stays valid across documents without
//! naming their URLs.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use super::{inherited_metadata, parent_id};
use crate::cache::{ExternalCache, DEFAULT_TTL};
use crate::codec;
use crate::error::{CatalogError, Result};
use crate::model::{props, Entry, EntryKind, Resource, SourceKind};
use crate::thredds::{
    load_catalog, url_tail, CatalogDocument, CatalogNode, DocumentFetcher, NodeKind,
    DEFAULT_DEPTH_LIMIT,
};
use crate::traits::{SourceAdapter, SourceRoot};

pub struct CatalogXmlAdapter {
    fetcher: Arc<dyn DocumentFetcher>,
    cache: ExternalCache<CatalogDocument>,
    max_depth: usize,
}

impl CatalogXmlAdapter {
    pub fn new(fetcher: Arc<dyn DocumentFetcher>) -> Self {
        Self::with_cache(fetcher, ExternalCache::new(DEFAULT_TTL))
    }

    pub fn with_cache(
        fetcher: Arc<dyn DocumentFetcher>,
        cache: ExternalCache<CatalogDocument>,
    ) -> Self {
        Self {
            fetcher,
            cache,
            max_depth: DEFAULT_DEPTH_LIMIT,
        }
    }

    pub fn with_depth_limit(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    fn root_url(root: &SourceRoot) -> Result<String> {
        match (root.entry.property(props::URL), &root.entry.resource) {
            (Some(url), _) => Ok(url.trim().to_string()),
            (None, Resource::Url(url)) => Ok(url.clone()),
            _ => Err(CatalogError::Configuration(format!(
                "catalog root {} has no catalog URL",
                root.entry.id
            ))),
        }
    }

    async fn document(&self, url: &str) -> Result<Arc<CatalogDocument>> {
        self.cache
            .get_or_fetch(url, || load_catalog(self.fetcher.as_ref(), url))
            .await
    }

    /// Loads `url`, passing through documents whose only child is a
    /// `catalogRef`. Stops after `max_depth` hops or at a URL already in
    /// `visited`, returning the last document read.
    pub async fn load_followed(
        &self,
        url: &str,
        max_depth: usize,
        visited: &mut HashSet<String>,
    ) -> Result<Arc<CatalogDocument>> {
        let mut url = url.to_string();
        let mut depth = 0;
        loop {
            visited.insert(url.clone());
            let doc = self.document(&url).await?;
            let next = match doc.root.children.as_slice() {
                [only] if only.kind == NodeKind::CatalogRef => {
                    only.href.as_deref().and_then(|href| doc.resolve_href(href).ok())
                }
                _ => None,
            };
            match next {
                Some(next) if depth < max_depth && !visited.contains(&next) => {
                    debug!(from = %url, to = %next, "following sole catalogRef");
                    url = next;
                    depth += 1;
                }
                _ => return Ok(doc),
            }
        }
    }

    fn parse_steps(sub_path: &str) -> Result<Vec<usize>> {
        sub_path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<usize>().map_err(|_| {
                    CatalogError::malformed_id(sub_path, "catalog paths are child indexes")
                })
            })
            .collect()
    }

    /// Children of `node` with the document they belong to; a reference's
    /// children are those of the catalog it points at.
    async fn expand(
        &self,
        doc: Arc<CatalogDocument>,
        node: CatalogNode,
    ) -> Result<(Arc<CatalogDocument>, Vec<CatalogNode>)> {
        if node.kind != NodeKind::CatalogRef {
            return Ok((doc, node.children));
        }
        let href = node
            .href
            .as_deref()
            .ok_or_else(|| CatalogError::parse(&doc.url, "catalogRef without href"))?;
        let url = doc.resolve_href(href)?;
        let target = self.load_followed(&url, self.max_depth, &mut HashSet::new()).await?;
        let children = target.root.children.clone();
        Ok((target, children))
    }

    /// The node at `steps` and the document it lives in.
    async fn locate(
        &self,
        root_url: &str,
        steps: &[usize],
    ) -> Result<(Arc<CatalogDocument>, CatalogNode)> {
        let not_found = || CatalogError::NotFound(format!("{root_url}#{}", join_steps(steps)));
        let mut doc = self.load_followed(root_url, self.max_depth, &mut HashSet::new()).await?;
        let mut node = doc.root.clone();
        let mut hops = 0;
        for step in steps {
            if node.kind == NodeKind::CatalogRef {
                hops += 1;
                if hops > self.max_depth {
                    return Err(not_found());
                }
            }
            let (next_doc, children) = self.expand(doc, node).await?;
            doc = next_doc;
            node = children.into_iter().nth(*step).ok_or_else(not_found)?;
        }
        Ok((doc, node))
    }

    async fn try_list(&self, root: &SourceRoot, sub_path: &str) -> Result<Vec<String>> {
        let url = Self::root_url(root)?;
        let steps = Self::parse_steps(sub_path)?;
        let (doc, node) = self.locate(&url, &steps).await?;
        let (_, children) = self.expand(doc, node).await?;
        Ok(children
            .iter()
            .enumerate()
            .filter(|(_, child)| !child.is_latest_opendap())
            .map(|(i, _)| {
                let mut path = steps.clone();
                path.push(i);
                codec::encode(&root.entry.id, &join_steps(&path))
            })
            .collect())
    }
}

fn join_steps(steps: &[usize]) -> String {
    steps.iter().map(usize::to_string).collect::<Vec<_>>().join("/")
}

#[async_trait]
impl SourceAdapter for CatalogXmlAdapter {
    fn source_kind(&self) -> SourceKind {
        SourceKind::Catalog
    }

    #[instrument(skip(self, root), fields(root = %root.entry.id))]
    async fn list_children(&self, root: &SourceRoot, sub_path: &str) -> Vec<String> {
        match self.try_list(root, sub_path).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "cannot list catalog");
                Vec::new()
            }
        }
    }

    async fn resolve(&self, root: &SourceRoot, sub_path: &str) -> Result<Entry> {
        let url = Self::root_url(root)?;
        let steps = Self::parse_steps(sub_path)?;
        let Some((_, parent_steps)) = steps.split_last() else {
            return Err(CatalogError::malformed_id(sub_path, "empty catalog path"));
        };
        let (doc, node) = self.locate(&url, &steps).await?;
        let id = codec::encode(&root.entry.id, &join_steps(&steps));

        let access_url = match node.kind {
            NodeKind::Dataset if node.children.is_empty() => doc.access_url(&node),
            _ => None,
        };
        let name = if !node.name.is_empty() {
            node.name.clone()
        } else if let Some(access) = &access_url {
            url_tail(access)
        } else {
            url_tail(&doc.url)
        };
        let entry = match (node.kind, access_url) {
            (NodeKind::CatalogRef, _) => {
                let target = node
                    .href
                    .as_deref()
                    .map(|href| doc.resolve_href(href))
                    .transpose()?;
                let entry = Entry::new(id.clone(), name, EntryKind::Group, root.entry.create_time);
                match target {
                    Some(url) => entry.with_resource(Resource::Url(url)),
                    None => entry,
                }
            }
            (_, Some(access)) => {
                Entry::new(id.clone(), name, EntryKind::Link, root.entry.create_time)
                    .with_resource(Resource::Url(access))
            }
            (_, None) => Entry::new(id.clone(), name, EntryKind::Group, root.entry.create_time),
        };

        Ok(entry
            .with_parent(parent_id(root, &join_steps(parent_steps)))
            .with_owner(root.entry.owner_user_id.clone())
            .with_metadata(inherited_metadata(root, &id))
            .synthetic())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thredds::tests::{MapFetcher, MODEL_CATALOG};
    use chrono::Utc;

    const TOP: &str = "http://data.test/thredds/catalog.xml";

    fn catalog_root(url: &str) -> SourceRoot {
        SourceRoot::new(Arc::new(
            Entry::new("cat", "Remote catalog", EntryKind::CatalogRoot, Utc::now())
                .with_parent("top")
                .with_property(props::URL, url),
        ))
    }

    fn fetcher() -> Arc<MapFetcher> {
        Arc::new(MapFetcher::default().with(TOP, MODEL_CATALOG).with(
            "http://data.test/thredds/gfs/catalog.xml",
            r#"<catalog name="GFS">
                 <service name="http" serviceType="HTTPServer" base="/files/"/>
                 <dataset name="gfs_00.grib2" urlPath="gfs/00.grib2" serviceName="http"/>
               </catalog>"#,
        ))
    }

    fn decoded(ids: &[String]) -> Vec<String> {
        ids.iter().map(|id| codec::decode(id).unwrap().1).collect()
    }

    #[tokio::test]
    async fn test_lists_nested_datasets_skipping_latest() {
        let adapter = CatalogXmlAdapter::new(fetcher());
        let root = catalog_root(TOP);

        assert_eq!(decoded(&adapter.list_children(&root, "").await), vec!["0"]);
        assert_eq!(decoded(&adapter.list_children(&root, "0").await), vec!["0/0", "0/1", "0/3"]);
    }

    #[tokio::test]
    async fn test_resolve_leaf_and_reference() {
        let adapter = CatalogXmlAdapter::new(fetcher());
        let root = catalog_root(TOP);

        let nam = adapter.resolve(&root, "0").await.unwrap();
        assert_eq!(nam.kind, EntryKind::Group);
        assert_eq!(nam.parent_group_id.as_deref(), Some("cat"));

        let leaf = adapter.resolve(&root, "0/0").await.unwrap();
        assert_eq!(leaf.kind, EntryKind::Link);
        assert_eq!(
            leaf.resource,
            Resource::Url("http://data.test/thredds/fileServer/nam/20240101.nc".into())
        );
        assert_eq!(leaf.parent_group_id, Some(codec::encode("cat", "0")));

        let gfs = adapter.resolve(&root, "0/3").await.unwrap();
        assert_eq!(gfs.name, "GFS");
        assert!(gfs.is_group());
    }

    #[tokio::test]
    async fn test_paths_continue_through_references() {
        let adapter = CatalogXmlAdapter::new(fetcher());
        let root = catalog_root(TOP);

        assert_eq!(decoded(&adapter.list_children(&root, "0/3").await), vec!["0/3/0"]);
        let grib = adapter.resolve(&root, "0/3/0").await.unwrap();
        assert_eq!(grib.resource, Resource::Url("http://data.test/files/gfs/00.grib2".into()));
        assert_eq!(grib.parent_group_id, Some(codec::encode("cat", "0/3")));
    }

    #[tokio::test]
    async fn test_documents_are_cached() {
        let fetcher = fetcher();
        let adapter = CatalogXmlAdapter::new(fetcher.clone());
        let root = catalog_root(TOP);

        adapter.list_children(&root, "0").await;
        adapter.resolve(&root, "0/1").await.unwrap();
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_sole_reference_cycle_terminates() {
        let fetcher = Arc::new(
            MapFetcher::default()
                .with("http://t/a.xml", r#"<catalog><catalogRef href="b.xml"/></catalog>"#)
                .with("http://t/b.xml", r#"<catalog><catalogRef href="a.xml"/></catalog>"#),
        );
        let adapter = CatalogXmlAdapter::new(fetcher.clone());
        let root = catalog_root("http://t/a.xml");

        let children = adapter.list_children(&root, "").await;
        assert_eq!(decoded(&children), vec!["0"]);
        assert_eq!(fetcher.calls(), 2);

        let mut visited = HashSet::new();
        let doc = adapter.load_followed("http://t/a.xml", 10, &mut visited).await.unwrap();
        assert_eq!(doc.url, "http://t/b.xml");
        assert_eq!(visited.len(), 2);
    }

    #[tokio::test]
    async fn test_bad_paths() {
        let adapter = CatalogXmlAdapter::new(fetcher());
        let root = catalog_root(TOP);

        assert_eq!(adapter.resolve(&root, "0/9").await.unwrap_err().status_code(), 404);
        assert_eq!(adapter.resolve(&root, "zero").await.unwrap_err().status_code(), 400);
        assert!(adapter.list_children(&catalog_root("http://nowhere/x.xml"), "").await.is_empty());
    }
}
