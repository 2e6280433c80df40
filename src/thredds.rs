//! THREDDS InvCatalog 1.0 consumption.
//!
//! Documents are parsed once into an owned tree so they can sit in the
//! external cache and be shared between requests. Only the subset needed
//! to navigate and locate data is kept: nested `dataset` and `catalogRef`
//! elements, the `service` table (compound services included) and the
//! `urlPath` / `serviceName` pair of each dataset, with `serviceName`
//! inherited through `<metadata inherited="true">`.

use async_trait::async_trait;
use reqwest::Url;
use roxmltree::Node;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::error::{CatalogError, Result};

/// Maximum number of `catalogRef` hops followed from a starting document.
pub const DEFAULT_DEPTH_LIMIT: usize = 10;

/// Marker of the auto-generated "latest" dataset some servers publish.
const LATEST_OPENDAP: &str = "latestopendap=true";

// ============================================================================
// Document model
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub name: String,
    pub service_type: String,
    pub base: String,
    /// Members of a compound service
    pub children: Vec<Service>,
}

impl Service {
    fn find<'a>(services: &'a [Service], name: &str) -> Option<&'a Service> {
        services.iter().find_map(|service| {
            if service.name == name {
                Some(service)
            } else {
                Self::find(&service.children, name)
            }
        })
    }

    /// The member that serves files: a compound service delegates to its
    /// HTTP member, or its first member when it has none.
    fn leaf(&self) -> &Service {
        self.children
            .iter()
            .find(|s| s.service_type.eq_ignore_ascii_case("HTTPServer"))
            .or_else(|| self.children.first())
            .map_or(self, Service::leaf)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Catalog,
    Dataset,
    CatalogRef,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogNode {
    pub kind: NodeKind,
    pub name: String,
    pub url_path: Option<String>,
    /// Effective service, own or inherited
    pub service_name: Option<String>,
    /// Raw `xlink:href` of a catalog reference
    pub href: Option<String>,
    pub children: Vec<CatalogNode>,
}

impl CatalogNode {
    pub fn has_child_datasets(&self) -> bool {
        self.children.iter().any(|c| c.kind == NodeKind::Dataset)
    }

    pub fn is_latest_opendap(&self) -> bool {
        self.url_path.as_deref().is_some_and(|p| p.contains(LATEST_OPENDAP))
    }
}

#[derive(Debug, Clone)]
pub struct CatalogDocument {
    /// Location the document was fetched from; relative references
    /// resolve against it
    pub url: String,
    pub services: Vec<Service>,
    pub root: CatalogNode,
}

impl CatalogDocument {
    pub fn service(&self, name: &str) -> Option<&Service> {
        Service::find(&self.services, name)
    }

    /// Absolute data URL of `node`: service base plus `urlPath`, resolved
    /// against the document location.
    pub fn access_url(&self, node: &CatalogNode) -> Option<String> {
        let url_path = node.url_path.as_deref()?;
        let base = Url::parse(&self.url).ok()?;
        let target = match self.node_service(node) {
            Some(service) => format!("{}{}", service.base, url_path),
            None => url_path.to_string(),
        };
        base.join(&target).ok().map(|u| u.to_string())
    }

    pub fn service_type(&self, node: &CatalogNode) -> Option<&str> {
        self.node_service(node).map(|s| s.service_type.as_str())
    }

    fn node_service(&self, node: &CatalogNode) -> Option<&Service> {
        node.service_name
            .as_deref()
            .and_then(|name| self.service(name))
            .map(Service::leaf)
    }

    /// Absolute URL of a `catalogRef` target.
    pub fn resolve_href(&self, href: &str) -> Result<String> {
        let base = Url::parse(&self.url).map_err(|e| CatalogError::parse(&self.url, e))?;
        base.join(href)
            .map(|u| u.to_string())
            .map_err(|e| CatalogError::parse(href, e))
    }

    /// Node a crawl starts from: a lone top-level dataset stands in for the
    /// catalog itself.
    pub fn entry_node(&self) -> &CatalogNode {
        match self.root.children.as_slice() {
            [only] if only.kind == NodeKind::Dataset => only,
            _ => &self.root,
        }
    }
}

// ============================================================================
// Parsing
// ============================================================================

fn is_tag(node: &Node<'_, '_>, name: &str) -> bool {
    node.is_element() && node.tag_name().name() == name
}

fn child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.children().find(|c| is_tag(c, name))
}

fn child_text(node: Node<'_, '_>, name: &str) -> Option<String> {
    child(node, name)
        .and_then(|c| c.text())
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

/// Attribute by local name, whatever its namespace (`xlink:href`).
fn local_attribute<'a>(node: Node<'a, '_>, name: &str) -> Option<&'a str> {
    node.attributes().find(|a| a.name() == name).map(|a| a.value())
}

fn metadata_service(node: Node<'_, '_>, inherited_only: bool) -> Option<String> {
    node.children()
        .filter(|n| is_tag(n, "metadata"))
        .filter(|m| !inherited_only || m.attribute("inherited") == Some("true"))
        .find_map(|m| child_text(m, "serviceName"))
}

fn parse_service(node: Node<'_, '_>) -> Service {
    Service {
        name: node.attribute("name").unwrap_or_default().to_string(),
        service_type: node.attribute("serviceType").unwrap_or_default().to_string(),
        base: node.attribute("base").unwrap_or_default().to_string(),
        children: node
            .children()
            .filter(|c| is_tag(c, "service"))
            .map(parse_service)
            .collect(),
    }
}

fn parse_children(node: Node<'_, '_>, inherited: Option<&str>) -> Vec<CatalogNode> {
    node.children()
        .filter_map(|c| {
            if is_tag(&c, "dataset") {
                Some(parse_dataset(c, inherited))
            } else if is_tag(&c, "catalogRef") {
                Some(parse_ref(c))
            } else {
                None
            }
        })
        .collect()
}

fn parse_dataset(node: Node<'_, '_>, inherited: Option<&str>) -> CatalogNode {
    let declared = metadata_service(node, true);
    let passed_down = declared.as_deref().or(inherited);
    let access = child(node, "access");

    let service_name = access
        .and_then(|a| a.attribute("serviceName"))
        .or_else(|| node.attribute("serviceName"))
        .map(str::to_string)
        .or_else(|| child_text(node, "serviceName"))
        .or_else(|| metadata_service(node, false))
        .or_else(|| passed_down.map(str::to_string));
    let url_path = node
        .attribute("urlPath")
        .or_else(|| access.and_then(|a| a.attribute("urlPath")))
        .map(str::to_string);

    CatalogNode {
        kind: NodeKind::Dataset,
        name: node.attribute("name").unwrap_or_default().to_string(),
        url_path,
        service_name,
        href: None,
        children: parse_children(node, passed_down),
    }
}

fn parse_ref(node: Node<'_, '_>) -> CatalogNode {
    let name = local_attribute(node, "title")
        .or_else(|| node.attribute("name"))
        .unwrap_or_default();
    CatalogNode {
        kind: NodeKind::CatalogRef,
        name: name.to_string(),
        url_path: None,
        service_name: None,
        href: local_attribute(node, "href").map(str::to_string),
        children: Vec::new(),
    }
}

pub(crate) fn url_tail(url: &str) -> String {
    let trimmed = url.split(['?', '#']).next().unwrap_or(url).trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed).to_string()
}

/// Parses a catalog document fetched from `url`.
///
/// # Errors
///
/// `Parse` when the text is not XML or its root is not `<catalog>`.
pub fn parse_catalog(url: &str, xml: &str) -> Result<CatalogDocument> {
    let doc = roxmltree::Document::parse(xml).map_err(|e| CatalogError::parse(url, e))?;
    let root = doc.root_element();
    if root.tag_name().name() != "catalog" {
        return Err(CatalogError::parse(
            url,
            format!("expected <catalog>, found <{}>", root.tag_name().name()),
        ));
    }

    let services = root
        .children()
        .filter(|c| is_tag(c, "service"))
        .map(parse_service)
        .collect();
    let name = root
        .attribute("name")
        .map(str::to_string)
        .unwrap_or_else(|| url_tail(url));

    Ok(CatalogDocument {
        url: url.to_string(),
        services,
        root: CatalogNode {
            kind: NodeKind::Catalog,
            name,
            url_path: None,
            service_name: None,
            href: None,
            children: parse_children(root, metadata_service(root, true).as_deref()),
        },
    })
}

// ============================================================================
// Fetching
// ============================================================================

#[async_trait]
pub trait DocumentFetcher: Send + Sync {
    /// Raw text of the document at `url`.
    ///
    /// # Errors
    ///
    /// `SourceUnavailable` when the location cannot be read.
    async fn fetch(&self, url: &str) -> Result<String>;
}

/// Fetches over HTTP(S); `file://` URLs are read from disk.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CatalogError::Configuration(format!("HTTP client: {e}")))?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DocumentFetcher for HttpFetcher {
    #[instrument(skip(self))]
    async fn fetch(&self, url: &str) -> Result<String> {
        let parsed = Url::parse(url).map_err(|e| CatalogError::parse(url, e))?;
        if parsed.scheme() == "file" {
            let path = parsed
                .to_file_path()
                .map_err(|_| CatalogError::parse(url, "not a local path"))?;
            return tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| CatalogError::unavailable(url, e));
        }

        let response = self
            .client
            .get(parsed)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| CatalogError::unavailable(url, e))?;
        response.text().await.map_err(|e| CatalogError::unavailable(url, e))
    }
}

pub async fn load_catalog(fetcher: &dyn DocumentFetcher, url: &str) -> Result<CatalogDocument> {
    let xml = fetcher.fetch(url).await?;
    parse_catalog(url, &xml)
}

// ============================================================================
// Crawling
// ============================================================================

/// A data-bearing dataset found during a crawl.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawledDataset {
    /// Group names from the crawl's base down to the containing dataset
    pub group_path: Vec<String>,
    pub name: String,
    pub access_url: String,
    pub service_type: Option<String>,
    pub catalog_url: String,
}

/// Datasets contributed by one fetched catalog document.
#[derive(Debug, Clone)]
pub struct CatalogPage {
    pub url: String,
    pub depth: usize,
    pub datasets: Vec<CrawledDataset>,
}

struct PendingCatalog {
    url: String,
    depth: usize,
    group_path: Vec<String>,
}

/// Depth-first crawl over a catalog and the catalogs it references.
///
/// One document is fetched per [`next_page`](Self::next_page) call so the
/// caller can stop, flush or log between documents. A URL is fetched at
/// most once per crawl and references nested deeper than `max_depth` are
/// dropped, which bounds the crawl even over reference cycles.
pub struct CatalogCrawler<'a> {
    fetcher: &'a dyn DocumentFetcher,
    follow_refs: bool,
    max_depth: usize,
    visited: HashSet<String>,
    pending: Vec<PendingCatalog>,
}

impl<'a> CatalogCrawler<'a> {
    pub fn new(
        fetcher: &'a dyn DocumentFetcher,
        top_url: &str,
        follow_refs: bool,
        max_depth: usize,
        visited: HashSet<String>,
    ) -> Self {
        Self {
            fetcher,
            follow_refs,
            max_depth,
            visited,
            pending: vec![PendingCatalog {
                url: top_url.to_string(),
                depth: 0,
                group_path: Vec::new(),
            }],
        }
    }

    pub fn visited(&self) -> &HashSet<String> {
        &self.visited
    }

    /// Fetches and flattens the next catalog; `None` once the crawl is done.
    /// An `Err` item reports one unreadable document, the crawl goes on.
    pub async fn next_page(&mut self) -> Option<Result<CatalogPage>> {
        while let Some(next) = self.pending.pop() {
            if self.visited.contains(&next.url) {
                debug!(url = %next.url, "catalog already visited");
                continue;
            }
            if next.depth > self.max_depth {
                warn!(url = %next.url, depth = next.depth, "catalogs nest too deep, skipping");
                continue;
            }
            self.visited.insert(next.url.clone());

            let doc = match load_catalog(self.fetcher, &next.url).await {
                Ok(doc) => doc,
                Err(e) => return Some(Err(e)),
            };

            let mut datasets = Vec::new();
            let mut refs = Vec::new();
            flatten(&doc, doc.entry_node(), &next.group_path, 0, &mut datasets, &mut refs);

            if self.follow_refs {
                // Reversed so references pop in document order
                for (url, group_path) in refs.into_iter().rev() {
                    self.pending.push(PendingCatalog {
                        url,
                        depth: next.depth + 1,
                        group_path,
                    });
                }
            }
            return Some(Ok(CatalogPage {
                url: next.url,
                depth: next.depth,
                datasets,
            }));
        }
        None
    }
}

fn group_name(name: &str) -> String {
    name.replace(':', "--").replace('/', "-").replace('\'', "")
}

fn flatten(
    doc: &CatalogDocument,
    node: &CatalogNode,
    parent_path: &[String],
    xml_depth: usize,
    datasets: &mut Vec<CrawledDataset>,
    refs: &mut Vec<(String, Vec<String>)>,
) {
    if node.is_latest_opendap() {
        return;
    }
    if xml_depth > 0 && !node.has_child_datasets() {
        if let Some(access_url) = doc.access_url(node) {
            let name = if node.name.is_empty() {
                url_tail(&access_url)
            } else {
                node.name.clone()
            };
            datasets.push(CrawledDataset {
                group_path: parent_path.to_vec(),
                name,
                access_url,
                service_type: doc.service_type(node).map(str::to_string),
                catalog_url: doc.url.clone(),
            });
            return;
        }
    }

    let name = if node.name.is_empty() {
        url_tail(&doc.url)
    } else {
        node.name.clone()
    };
    let mut path = parent_path.to_vec();
    path.push(group_name(&name));

    for child in &node.children {
        match child.kind {
            NodeKind::Dataset => flatten(doc, child, &path, xml_depth + 1, datasets, refs),
            NodeKind::CatalogRef => match child.href.as_deref().map(|h| doc.resolve_href(h)) {
                Some(Ok(url)) => refs.push((url, path.clone())),
                Some(Err(e)) => debug!(catalog = %doc.url, error = %e, "unusable catalogRef"),
                None => debug!(catalog = %doc.url, "catalogRef without href"),
            },
            NodeKind::Catalog => {}
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fetcher over an in-memory URL → document map.
    #[derive(Default)]
    pub(crate) struct MapFetcher {
        pub docs: HashMap<String, String>,
        pub calls: AtomicUsize,
    }

    impl MapFetcher {
        pub fn with(mut self, url: &str, xml: &str) -> Self {
            self.docs.insert(url.to_string(), xml.to_string());
            self
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DocumentFetcher for MapFetcher {
        async fn fetch(&self, url: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.docs
                .get(url)
                .cloned()
                .ok_or_else(|| CatalogError::unavailable(url, "no such document"))
        }
    }

    pub(crate) const MODEL_CATALOG: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<catalog name="Model Output"
         xmlns="http://www.unidata.ucar.edu/namespaces/thredds/InvCatalog/v1.0"
         xmlns:xlink="http://www.w3.org/1999/xlink">
  <service name="all" serviceType="Compound" base="">
    <service name="odap" serviceType="OPENDAP" base="/thredds/dodsC/"/>
    <service name="http" serviceType="HTTPServer" base="/thredds/fileServer/"/>
  </service>
  <service name="wms" serviceType="WMS" base="/thredds/wms/"/>
  <dataset name="NAM">
    <metadata inherited="true"><serviceName>all</serviceName></metadata>
    <dataset name="nam_20240101.nc" urlPath="nam/20240101.nc"/>
    <dataset name="nam_wms.nc"><access serviceName="wms" urlPath="nam/wms.nc"/></dataset>
    <dataset name="latest" urlPath="latest.xml?latestopendap=true"/>
    <catalogRef xlink:href="gfs/catalog.xml" xlink:title="GFS"/>
  </dataset>
</catalog>"#;

    const BASE: &str = "http://data.test/thredds/catalog.xml";

    #[test]
    fn test_parse_structure() {
        let doc = parse_catalog(BASE, MODEL_CATALOG).unwrap();
        assert_eq!(doc.root.name, "Model Output");
        assert_eq!(doc.services.len(), 2);

        let nam = doc.entry_node();
        assert_eq!(nam.name, "NAM");
        assert_eq!(nam.children.len(), 4);
        assert_eq!(nam.children[3].kind, NodeKind::CatalogRef);
        assert_eq!(nam.children[3].name, "GFS");
        assert!(nam.children[2].is_latest_opendap());
    }

    #[test]
    fn test_access_urls_use_inherited_and_explicit_services() {
        let doc = parse_catalog(BASE, MODEL_CATALOG).unwrap();
        let nam = doc.entry_node();

        assert_eq!(
            doc.access_url(&nam.children[0]).as_deref(),
            Some("http://data.test/thredds/fileServer/nam/20240101.nc")
        );
        assert_eq!(doc.service_type(&nam.children[0]), Some("HTTPServer"));
        assert_eq!(
            doc.access_url(&nam.children[1]).as_deref(),
            Some("http://data.test/thredds/wms/nam/wms.nc")
        );
        assert_eq!(
            doc.resolve_href(nam.children[3].href.as_deref().unwrap()).unwrap(),
            "http://data.test/thredds/gfs/catalog.xml"
        );
    }

    #[test]
    fn test_rejects_non_catalog_documents() {
        assert!(matches!(
            parse_catalog(BASE, "<html><body/></html>"),
            Err(CatalogError::Parse { .. })
        ));
        assert!(matches!(parse_catalog(BASE, "<catalog"), Err(CatalogError::Parse { .. })));
    }

    fn cyclic_fetcher() -> MapFetcher {
        MapFetcher::default()
            .with(
                "http://t/a.xml",
                r#"<catalog name="A" xmlns:xlink="http://www.w3.org/1999/xlink">
                     <service name="http" serviceType="HTTPServer" base="/files/"/>
                     <dataset name="Root">
                       <dataset name="x.nc" urlPath="x.nc" serviceName="http"/>
                       <catalogRef xlink:href="b.xml" xlink:title="B"/>
                     </dataset>
                   </catalog>"#,
            )
            .with(
                "http://t/b.xml",
                r#"<catalog name="B" xmlns:xlink="http://www.w3.org/1999/xlink">
                     <service name="http" serviceType="HTTPServer" base="/files/"/>
                     <dataset name="y.nc" urlPath="y.nc" serviceName="http"/>
                     <catalogRef xlink:href="a.xml" xlink:title="Back to A"/>
                   </catalog>"#,
            )
    }

    #[tokio::test]
    async fn test_crawl_terminates_on_reference_cycle() {
        let fetcher = cyclic_fetcher();
        let mut crawler = CatalogCrawler::new(
            &fetcher,
            "http://t/a.xml",
            true,
            DEFAULT_DEPTH_LIMIT,
            HashSet::new(),
        );

        let mut datasets = Vec::new();
        while let Some(page) = crawler.next_page().await {
            datasets.extend(page.unwrap().datasets);
        }

        assert_eq!(fetcher.calls(), 2);
        assert_eq!(datasets.len(), 2);
        assert_eq!(datasets[0].group_path, vec!["Root".to_string()]);
        assert_eq!(datasets[0].access_url, "http://t/files/x.nc");
        assert_eq!(datasets[1].group_path, vec!["Root".to_string(), "B".to_string()]);
    }

    #[tokio::test]
    async fn test_crawl_respects_depth_bound() {
        let mut fetcher = MapFetcher::default();
        for i in 0..6 {
            fetcher = fetcher.with(
                &format!("http://t/c{i}.xml"),
                &format!(
                    r#"<catalog name="c{i}"><catalogRef href="c{}.xml" title="next"/></catalog>"#,
                    i + 1
                ),
            );
        }
        let mut crawler = CatalogCrawler::new(&fetcher, "http://t/c0.xml", true, 2, HashSet::new());
        let mut pages = 0;
        while let Some(page) = crawler.next_page().await {
            page.unwrap();
            pages += 1;
        }
        assert_eq!(pages, 3);
        assert_eq!(fetcher.calls(), 3);
    }

    #[tokio::test]
    async fn test_crawl_reports_bad_documents_and_continues() {
        let fetcher = MapFetcher::default()
            .with(
                "http://t/top.xml",
                r#"<catalog name="top">
                     <catalogRef href="missing.xml" title="gone"/>
                     <catalogRef href="broken.xml" title="broken"/>
                   </catalog>"#,
            )
            .with("http://t/broken.xml", "<catalog><dataset></catalog>");
        let mut crawler = CatalogCrawler::new(
            &fetcher,
            "http://t/top.xml",
            true,
            DEFAULT_DEPTH_LIMIT,
            HashSet::new(),
        );
        let mut results = Vec::new();
        while let Some(page) = crawler.next_page().await {
            results.push(page.is_ok());
        }
        assert_eq!(results, vec![true, false, false]);
    }

    #[tokio::test]
    async fn test_crawl_without_recursion_reads_one_document() {
        let fetcher = cyclic_fetcher();
        let mut crawler = CatalogCrawler::new(
            &fetcher,
            "http://t/a.xml",
            false,
            DEFAULT_DEPTH_LIMIT,
            HashSet::new(),
        );
        let mut pages = 0;
        while let Some(page) = crawler.next_page().await {
            page.unwrap();
            pages += 1;
        }
        assert_eq!(pages, 1);
    }
}
