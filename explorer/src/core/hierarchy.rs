//! Parsing of uiautomator view-hierarchy dumps into [`Element`]s.

use anyhow::{Context, Result};
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;

use crate::core::types::{Bounds, Element};

/// Extract every `<node>` with usable bounds, in document order.
///
/// A node is interactable when it is enabled and clickable, long-clickable or
/// checkable. Nodes with empty or unparsable bounds are dropped: they cannot be
/// tapped and would only add noise to the screen fingerprint.
pub fn parse_hierarchy(xml: &str) -> Result<Vec<Element>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut elements = Vec::new();
    loop {
        match reader
            .read_event()
            .with_context(|| format!("parse hierarchy at byte {}", reader.buffer_position()))?
        {
            Event::Start(node) | Event::Empty(node) if node.name().as_ref() == b"node" => {
                if let Some(element) = element_from_node(&node)? {
                    elements.push(element);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(elements)
}

fn element_from_node(node: &BytesStart<'_>) -> Result<Option<Element>> {
    let mut attrs = NodeAttributes::default();
    for attr in node.attributes() {
        let attr = attr.context("read node attribute")?;
        let value = attr
            .unescape_value()
            .context("unescape node attribute")?
            .into_owned();
        match attr.key.as_ref() {
            b"class" => attrs.class = value,
            b"text" => attrs.text = Some(value),
            b"resource-id" => attrs.resource_id = Some(value),
            b"content-desc" => attrs.content_desc = Some(value),
            b"bounds" => attrs.bounds = Bounds::parse(&value),
            b"clickable" => attrs.clickable = value == "true",
            b"long-clickable" => attrs.long_clickable = value == "true",
            b"checkable" => attrs.checkable = value == "true",
            b"enabled" => attrs.enabled = value != "false",
            _ => {}
        }
    }

    let Some(bounds) = attrs.bounds.filter(|b| !b.is_empty()) else {
        return Ok(None);
    };
    let interactable =
        attrs.enabled && (attrs.clickable || attrs.long_clickable || attrs.checkable);
    Ok(Some(
        Element::new(
            bounds,
            attrs.class,
            attrs.text,
            attrs.resource_id,
            interactable,
        )
        .with_content_desc(attrs.content_desc),
    ))
}

struct NodeAttributes {
    class: String,
    text: Option<String>,
    resource_id: Option<String>,
    content_desc: Option<String>,
    bounds: Option<Bounds>,
    clickable: bool,
    long_clickable: bool,
    checkable: bool,
    enabled: bool,
}

impl Default for NodeAttributes {
    fn default() -> Self {
        Self {
            class: String::new(),
            text: None,
            resource_id: None,
            content_desc: None,
            bounds: None,
            clickable: false,
            long_clickable: false,
            checkable: false,
            enabled: true,
        }
    }
}
