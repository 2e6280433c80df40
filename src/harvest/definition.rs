//! Harvester configuration documents.
//!
//! A harvester is described by a `<harvester class="..." .../>` element whose
//! attributes and child elements are its settings. Definition files may hold
//! several of them under a `<harvesters>` root.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::error::{CatalogError, Result};

pub const TAG_HARVESTER: &str = "harvester";
pub const TAG_HARVESTERS: &str = "harvesters";
pub const ATTR_CLASS: &str = "class";
pub const ATTR_ID: &str = "id";

/// Owned copy of one XML element: tag, attributes and child elements.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HarvesterConfig {
    pub tag: String,
    pub attrs: BTreeMap<String, String>,
    pub children: Vec<HarvesterConfig>,
}

impl HarvesterConfig {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Self::default()
        }
    }

    /// A bare `<harvester class="...">` element.
    pub fn harvester(class_name: &str) -> Self {
        Self::new(TAG_HARVESTER).with_attr(ATTR_CLASS, class_name)
    }

    pub fn with_attr(mut self, name: &str, value: impl Into<String>) -> Self {
        self.attrs.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_child(mut self, child: HarvesterConfig) -> Self {
        self.children.push(child);
        self
    }

    /// Parses a document into its root element.
    ///
    /// # Errors
    ///
    /// `Parse` when the text is not well-formed XML.
    pub fn parse(xml: &str) -> Result<Self> {
        let doc = roxmltree::Document::parse(xml)
            .map_err(|e| CatalogError::parse("harvester definition", e))?;
        Ok(Self::from_node(doc.root_element()))
    }

    /// Every `<harvester>` element of a definition document, whose root is
    /// either `<harvesters>` or a single `<harvester>`.
    pub fn parse_all(xml: &str) -> Result<Vec<Self>> {
        let root = Self::parse(xml)?;
        if root.tag.eq_ignore_ascii_case(TAG_HARVESTER) {
            return Ok(vec![root]);
        }
        if !root.tag.eq_ignore_ascii_case(TAG_HARVESTERS) {
            return Err(CatalogError::parse(
                "harvester definition",
                format!("unexpected root element <{}>", root.tag),
            ));
        }
        Ok(root
            .children
            .into_iter()
            .filter(|c| c.tag.eq_ignore_ascii_case(TAG_HARVESTER))
            .collect())
    }

    fn from_node(node: roxmltree::Node<'_, '_>) -> Self {
        Self {
            tag: node.tag_name().name().to_string(),
            attrs: node
                .attributes()
                .map(|a| (a.name().to_ascii_lowercase(), a.value().to_string()))
                .collect(),
            children: node.children().filter(|c| c.is_element()).map(Self::from_node).collect(),
        }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Attribute value, or `Configuration` naming the missing attribute.
    pub fn required(&self, name: &str) -> Result<&str> {
        self.attr(name)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                CatalogError::Configuration(format!(
                    "<{}> is missing required attribute '{name}'",
                    self.tag
                ))
            })
    }

    pub fn bool_attr(&self, name: &str, default: bool) -> Result<bool> {
        match self.attr(name).map(str::trim) {
            None | Some("") => Ok(default),
            Some(v) if v.eq_ignore_ascii_case("true") => Ok(true),
            Some(v) if v.eq_ignore_ascii_case("false") => Ok(false),
            Some(v) => Err(CatalogError::Configuration(format!(
                "'{name}' must be true or false, not '{v}'"
            ))),
        }
    }

    pub fn children_named<'a>(
        &'a self,
        tag: &'a str,
    ) -> impl Iterator<Item = &'a HarvesterConfig> + 'a {
        self.children.iter().filter(move |c| c.tag.eq_ignore_ascii_case(tag))
    }

    pub fn class_name(&self) -> Option<&str> {
        self.attr(ATTR_CLASS)
    }

    /// Serialises the element back to XML, attributes in name order.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_xml(&mut out, 0);
        out
    }

    fn write_xml(&self, out: &mut String, indent: usize) {
        let pad = "  ".repeat(indent);
        let _ = write!(out, "{pad}<{}", self.tag);
        for (name, value) in &self.attrs {
            let _ = write!(out, " {name}=\"{}\"", escape(value));
        }
        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        for child in &self.children {
            out.push('\n');
            child.write_xml(out, indent + 1);
        }
        let _ = write!(out, "\n{pad}</{}>", self.tag);
    }
}

fn escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// `org.catalog.harvest.PatternHarvester` and `PatternHarvester` name the same class.
pub fn short_class_name(class_name: &str) -> &str {
    class_name.rsplit('.').next().unwrap_or(class_name).trim()
}
