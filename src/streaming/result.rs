//! Evaluation result tree
//!
//! The service returns its scores as an XML document. The document is kept as
//! a generic element tree (attributes without prefixes, text content trimmed)
//! rooted at the `xml_result` element, with a few accessors for the values
//! callers ask for most.

use std::collections::BTreeMap;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::Serialize;

use crate::error::IseError;

const RESULT_ROOT: &str = "xml_result";

/// One XML element
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct XmlNode {
    pub name: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<XmlNode>,
}

impl XmlNode {
    fn from_start(start: &BytesStart<'_>) -> Result<Self, IseError> {
        let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
        let mut attributes = BTreeMap::new();
        for attr in start.attributes() {
            let attr = attr.map_err(|e| IseError::Protocol(format!("bad XML attribute: {}", e)))?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr
                .unescape_value()
                .map_err(|e| IseError::Protocol(format!("bad XML attribute value: {}", e)))?;
            attributes.insert(key, value.into_owned());
        }
        Ok(Self {
            name,
            attributes,
            text: None,
            children: Vec::new(),
        })
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// Attribute parsed as a number
    pub fn attr_f64(&self, name: &str) -> Option<f64> {
        self.attr(name)?.trim().parse().ok()
    }

    /// First direct child with this name
    pub fn child(&self, name: &str) -> Option<&XmlNode> {
        self.children.iter().find(|c| c.name == name)
    }

    /// First element with this name in document order, including `self`
    pub fn find(&self, name: &str) -> Option<&XmlNode> {
        self.find_where(&|node| node.name == name)
    }

    /// All elements with this name in document order, including `self`
    pub fn find_all<'a>(&'a self, name: &str) -> Vec<&'a XmlNode> {
        let mut found = Vec::new();
        self.collect(name, &mut found);
        found
    }

    fn find_where(&self, pred: &dyn Fn(&XmlNode) -> bool) -> Option<&XmlNode> {
        if pred(self) {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find_where(pred))
    }

    fn collect<'a>(&'a self, name: &str, found: &mut Vec<&'a XmlNode>) {
        if self.name == name {
            found.push(self);
        }
        for child in &self.children {
            child.collect(name, found);
        }
    }
}

/// Parse a complete XML document into its root element.
pub fn parse_document(xml: &str) -> Result<XmlNode, IseError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<XmlNode> = Vec::new();
    let mut root: Option<XmlNode> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => stack.push(XmlNode::from_start(&start)?),
            Ok(Event::Empty(start)) => {
                let node = XmlNode::from_start(&start)?;
                attach(&mut stack, &mut root, node)?;
            }
            Ok(Event::End(_)) => {
                let node = stack
                    .pop()
                    .ok_or_else(|| IseError::Protocol("unbalanced XML end tag".to_string()))?;
                attach(&mut stack, &mut root, node)?;
            }
            Ok(Event::Text(text)) => {
                let text = text
                    .unescape()
                    .map_err(|e| IseError::Protocol(format!("bad XML text: {}", e)))?;
                append_text(&mut stack, &text);
            }
            Ok(Event::CData(data)) => {
                let bytes = data.into_inner();
                append_text(&mut stack, &String::from_utf8_lossy(&bytes));
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(IseError::Protocol(format!(
                    "malformed XML at byte {}: {}",
                    reader.buffer_position(),
                    e
                )))
            }
        }
    }

    if !stack.is_empty() {
        return Err(IseError::Protocol("unclosed XML element".to_string()));
    }
    root.ok_or_else(|| IseError::Protocol("empty XML document".to_string()))
}

fn attach(
    stack: &mut [XmlNode],
    root: &mut Option<XmlNode>,
    node: XmlNode,
) -> Result<(), IseError> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(node),
        None if root.is_none() => *root = Some(node),
        None => {
            return Err(IseError::Protocol(
                "XML document has more than one root".to_string(),
            ))
        }
    }
    Ok(())
}

fn append_text(stack: &mut [XmlNode], text: &str) {
    if text.is_empty() {
        return;
    }
    if let Some(node) = stack.last_mut() {
        node.text.get_or_insert_with(String::new).push_str(text);
    }
}

/// Structured score tree for one evaluation
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct EvaluationResult {
    root: XmlNode,
}

impl EvaluationResult {
    /// Parse a result document; the returned tree is rooted at `xml_result`.
    pub fn from_xml(xml: &str) -> Result<Self, IseError> {
        let document = parse_document(xml)?;
        let root = if document.name == RESULT_ROOT {
            document
        } else {
            document.find(RESULT_ROOT).cloned().ok_or_else(|| {
                IseError::Protocol(format!("result has no <{}> element", RESULT_ROOT))
            })?
        };
        Ok(Self { root })
    }

    pub fn root(&self) -> &XmlNode {
        &self.root
    }

    pub fn into_root(self) -> XmlNode {
        self.root
    }

    pub fn find(&self, name: &str) -> Option<&XmlNode> {
        self.root.find(name)
    }

    /// The outermost element that carries a score summary
    fn summary(&self) -> Option<&XmlNode> {
        self.root
            .find_where(&|node| node.attributes.contains_key("total_score"))
    }

    /// Overall score of the paper
    pub fn total_score(&self) -> Option<f64> {
        self.summary()?.attr_f64("total_score")
    }

    /// Text the service recognized against the reference
    pub fn content(&self) -> Option<&str> {
        self.summary()?.attr("content")
    }

    /// Whether the service rejected the reading (e.g. wrong text or noise)
    pub fn is_rejected(&self) -> bool {
        self.summary()
            .and_then(|node| node.attr("is_rejected"))
            .map(|v| v == "true")
            .unwrap_or(false)
    }
}
