//! Minimal namespace-aware XML element tree
//!
//! Stanzas are small, so they are handled as owned trees rather than as event
//! streams. Parsing resolves `xmlns` / `xmlns:prefix` declarations into a
//! per-element namespace; writing emits a default `xmlns` only where an
//! element's namespace differs from its parent's.

use std::io::Cursor;

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::error::{XmppError, XmppResult};

/// A node inside an element
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
}

/// An XML element with a resolved namespace
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Element {
    name: String,
    namespace: Option<String>,
    attributes: Vec<(String, String)>,
    children: Vec<Node>,
}

impl Element {
    /// Create an element without a namespace
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Create an element in `namespace`
    pub fn with_namespace(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: Some(namespace.into()),
            ..Default::default()
        }
    }

    /// Builder form of [`Element::set_attr`]
    pub fn attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(key, value);
        self
    }

    /// Builder form of [`Element::push_child`]
    pub fn child(mut self, child: Element) -> Self {
        self.children.push(Node::Element(child));
        self
    }

    /// Builder form of [`Element::push_text`]
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.push_text(text);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Whether this element is `name` in `namespace`
    pub fn is(&self, name: &str, namespace: &str) -> bool {
        self.name == name && self.namespace.as_deref() == Some(namespace)
    }

    /// Set or replace an attribute
    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.attributes.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.attributes.push((key, value)),
        }
    }

    pub fn get_attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn remove_attr(&mut self, key: &str) -> Option<String> {
        let idx = self.attributes.iter().position(|(k, _)| k == key)?;
        Some(self.attributes.remove(idx).1)
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attributes.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Append a child element and return a handle to it
    pub fn push_child(&mut self, child: Element) -> &mut Element {
        self.children.push(Node::Element(child));
        match self.children.last_mut() {
            Some(Node::Element(el)) => el,
            _ => unreachable!("just pushed an element"),
        }
    }

    pub fn push_text(&mut self, text: impl Into<String>) {
        let text = text.into();
        if text.is_empty() {
            return;
        }
        if let Some(Node::Text(last)) = self.children.last_mut() {
            last.push_str(&text);
        } else {
            self.children.push(Node::Text(text));
        }
    }

    pub fn nodes(&self) -> &[Node] {
        &self.children
    }

    /// Child elements, in document order
    pub fn children(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(el) => Some(el),
            Node::Text(_) => None,
        })
    }

    /// First child element with the given local name
    pub fn get_child(&self, name: &str) -> Option<&Element> {
        self.children().find(|el| el.name == name)
    }

    /// First child element with the given name and namespace
    pub fn get_child_ns(&self, name: &str, namespace: &str) -> Option<&Element> {
        self.children().find(|el| el.is(name, namespace))
    }

    pub fn first_child(&self) -> Option<&Element> {
        self.children().next()
    }

    /// Concatenation of the direct text children
    pub fn text_content(&self) -> String {
        self.children
            .iter()
            .filter_map(|node| match node {
                Node::Text(text) => Some(text.as_str()),
                Node::Element(_) => None,
            })
            .collect()
    }

    /// Parse a single root element
    pub fn parse(xml: &str) -> XmppResult<Element> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(false);

        // Each frame: element under construction + the prefixes it declared
        let mut stack: Vec<(Element, Vec<(Option<String>, String)>)> = Vec::new();
        let mut root: Option<Element> = None;

        loop {
            match reader.read_event()? {
                Event::Start(start) => {
                    let frame = open_element(&start, &stack)?;
                    stack.push(frame);
                }
                Event::Empty(start) => {
                    let (element, _) = open_element(&start, &stack)?;
                    attach(&mut stack, &mut root, element)?;
                }
                Event::End(_) => {
                    let (element, _) = stack
                        .pop()
                        .ok_or_else(|| XmppError::xml("unexpected closing tag"))?;
                    attach(&mut stack, &mut root, element)?;
                }
                Event::Text(text) => {
                    let text = text.unescape()?;
                    match stack.last_mut() {
                        Some((parent, _)) => parent.push_text(text.into_owned()),
                        None if text.trim().is_empty() => {}
                        None => return Err(XmppError::xml("text outside of the root element")),
                    }
                }
                Event::CData(data) => {
                    let text = String::from_utf8(data.into_inner().into_owned())
                        .map_err(|e| XmppError::xml(e.to_string()))?;
                    if let Some((parent, _)) = stack.last_mut() {
                        parent.push_text(text);
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if !stack.is_empty() {
            return Err(XmppError::xml("unclosed element"));
        }
        root.ok_or_else(|| XmppError::xml("document has no root element"))
    }

    /// Serialize to a string
    pub fn to_xml(&self) -> XmppResult<String> {
        let mut writer = Writer::new(Cursor::new(Vec::new()));
        write_element(&mut writer, self, None)?;
        String::from_utf8(writer.into_inner().into_inner()).map_err(|e| XmppError::xml(e.to_string()))
    }
}

fn open_element(
    start: &BytesStart<'_>,
    stack: &[(Element, Vec<(Option<String>, String)>)],
) -> XmppResult<(Element, Vec<(Option<String>, String)>)> {
    let qname = start.name();
    let local = String::from_utf8_lossy(qname.local_name().as_ref()).into_owned();
    let prefix = qname
        .prefix()
        .map(|p| String::from_utf8_lossy(p.as_ref()).into_owned());

    let mut declared = Vec::new();
    let mut attributes = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| XmppError::xml(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value()?.into_owned();
        if key == "xmlns" {
            declared.push((None, value));
        } else if let Some(p) = key.strip_prefix("xmlns:") {
            declared.push((Some(p.to_string()), value));
        } else {
            attributes.push((key, value));
        }
    }

    let namespace = declared
        .iter()
        .find(|(p, _)| *p == prefix)
        .map(|(_, ns)| ns.clone())
        .or_else(|| {
            stack.iter().rev().find_map(|(_, decls)| {
                decls
                    .iter()
                    .find(|(p, _)| *p == prefix)
                    .map(|(_, ns)| ns.clone())
            })
        });

    if prefix.is_some() && namespace.is_none() {
        return Err(XmppError::xml(format!("undeclared prefix on <{}>", local)));
    }

    let element = Element {
        name: local,
        namespace,
        attributes,
        children: Vec::new(),
    };
    Ok((element, declared))
}

fn attach(
    stack: &mut [(Element, Vec<(Option<String>, String)>)],
    root: &mut Option<Element>,
    element: Element,
) -> XmppResult<()> {
    match stack.last_mut() {
        Some((parent, _)) => {
            parent.children.push(Node::Element(element));
            Ok(())
        }
        None if root.is_none() => {
            *root = Some(element);
            Ok(())
        }
        None => Err(XmppError::xml("multiple root elements")),
    }
}

fn write_element<W: std::io::Write>(
    writer: &mut Writer<W>,
    element: &Element,
    parent_ns: Option<&str>,
) -> XmppResult<()> {
    let mut start = BytesStart::new(element.name.as_str());
    if element.namespace.as_deref() != parent_ns {
        start.push_attribute(("xmlns", element.namespace.as_deref().unwrap_or("")));
    }
    for (key, value) in &element.attributes {
        start.push_attribute((key.as_str(), value.as_str()));
    }

    if element.children.is_empty() {
        writer
            .write_event(Event::Empty(start))
            .map_err(|e| XmppError::xml(e.to_string()))?;
        return Ok(());
    }

    writer
        .write_event(Event::Start(start))
        .map_err(|e| XmppError::xml(e.to_string()))?;
    for node in &element.children {
        match node {
            Node::Element(child) => {
                write_element(writer, child, element.namespace.as_deref())?
            }
            Node::Text(text) => writer
                .write_event(Event::Text(BytesText::new(text)))
                .map_err(|e| XmppError::xml(e.to_string()))?,
        }
    }
    writer
        .write_event(Event::End(BytesEnd::new(element.name.as_str())))
        .map_err(|e| XmppError::xml(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_resolves_default_namespace() {
        let el = Element::parse(
            r#"<iq type="set" id="1"><webrtc xmlns="urn:x" id="c1"><sdp type="offer"/></webrtc></iq>"#,
        )
        .unwrap();
        assert_eq!(el.name(), "iq");
        assert_eq!(el.namespace(), None);
        let payload = el.first_child().unwrap();
        assert!(payload.is("webrtc", "urn:x"));
        assert_eq!(payload.get_attr("id"), Some("c1"));
        // Namespace inherited by unqualified children
        assert_eq!(payload.get_child("sdp").unwrap().namespace(), Some("urn:x"));
    }

    #[test]
    fn test_parse_resolves_prefixed_namespace() {
        let el = Element::parse(r#"<a xmlns:p="urn:p"><p:b/></a>"#).unwrap();
        assert!(el.first_child().unwrap().is("b", "urn:p"));
    }

    #[test]
    fn test_parse_rejects_undeclared_prefix() {
        assert!(Element::parse("<a><p:b/></a>").is_err());
    }

    #[test]
    fn test_text_preserves_whitespace_and_escapes() {
        let el = Element::parse("<line>  a=x &amp; y </line>").unwrap();
        assert_eq!(el.text_content(), "  a=x & y ");
    }

    #[test]
    fn test_write_only_declares_changed_namespaces() {
        let el = Element::new("iq").attr("type", "set").child(
            Element::with_namespace("webrtc", "urn:x")
                .attr("id", "c&1")
                .child(Element::with_namespace("sdp", "urn:x").child(
                    Element::with_namespace("line", "urn:x").text("v=0 <x>"),
                )),
        );
        let xml = el.to_xml().unwrap();
        assert_eq!(
            xml,
            r#"<iq type="set"><webrtc xmlns="urn:x" id="c&amp;1"><sdp><line>v=0 &lt;x&gt;</line></sdp></webrtc></iq>"#
        );
        assert_eq!(Element::parse(&xml).unwrap(), el);
    }

    #[test]
    fn test_set_attr_replaces() {
        let mut el = Element::new("a").attr("k", "1");
        el.set_attr("k", "2");
        assert_eq!(el.get_attr("k"), Some("2"));
        assert_eq!(el.attributes().count(), 1);
        assert_eq!(el.remove_attr("k"), Some("2".to_string()));
        assert_eq!(el.get_attr("k"), None);
    }
}
