//! XML plumbing for EBICS envelopes and ISO 20022 documents.
//!
//! Two halves: [`XmlBuilder`] assembles a document tree and serializes it
//! deterministically (the same byte stream is used for wire output and for
//! signature digests), and [`XmlNode`] is a small owned DOM with the scoped
//! navigation primitives the response parsers are written against.
//!
//! Element and attribute lookups match *local* names, so H004 and H005
//! namespace prefixes never leak into parsing call sites.

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::io::{Cursor, Read, Write};

#[derive(thiserror::Error, Debug)]
pub enum XmlError {
    #[error("XML is not well-formed: {0}")]
    Parse(#[from] quick_xml::Error),
    #[error("expected exactly one <{name}> under <{parent}>, found {count}")]
    Cardinality {
        parent: String,
        name: String,
        count: usize,
    },
    #[error("missing attribute '{0}'")]
    MissingAttribute(String),
    #[error("invalid Base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("compressed payload is corrupt: {0}")]
    Compression(std::io::Error),
    #[error("document has no root element")]
    NoRoot,
}

/// One element of a document under construction. Children keep insertion
/// order, which doubles as the canonical serialization order.
#[derive(Debug, Clone)]
pub struct XmlBuilder {
    name: String,
    attrs: Vec<(String, String)>,
    children: Vec<Content>,
}

#[derive(Debug, Clone)]
enum Content {
    Element(XmlBuilder),
    Text(String),
}

impl XmlBuilder {
    pub fn new(name: &str) -> Self {
        XmlBuilder {
            name: name.to_string(),
            attrs: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Declares the default namespace of this element.
    pub fn ns(&mut self, uri: &str) -> &mut Self {
        self.attr("xmlns", uri)
    }

    /// Declares a prefixed namespace, e.g. `ns_prefix("ds", ...)`.
    pub fn ns_prefix(&mut self, prefix: &str, uri: &str) -> &mut Self {
        self.attrs
            .push((format!("xmlns:{prefix}"), uri.to_string()));
        self
    }

    pub fn attr(&mut self, key: &str, value: &str) -> &mut Self {
        self.attrs.push((key.to_string(), value.to_string()));
        self
    }

    /// Appends a child element and descends into it via the closure.
    pub fn el(&mut self, name: &str, f: impl FnOnce(&mut XmlBuilder)) -> &mut Self {
        let mut child = XmlBuilder::new(name);
        f(&mut child);
        self.children.push(Content::Element(child));
        self
    }

    /// Appends an empty child element.
    pub fn empty(&mut self, name: &str) -> &mut Self {
        self.children.push(Content::Element(XmlBuilder::new(name)));
        self
    }

    /// Appends a child element holding only text.
    pub fn leaf(&mut self, name: &str, text: &str) -> &mut Self {
        let mut child = XmlBuilder::new(name);
        child.children.push(Content::Text(text.to_string()));
        self.children.push(Content::Element(child));
        self
    }

    /// Appends a child element holding the Base64 rendering of `bytes`.
    pub fn leaf_base64(&mut self, name: &str, bytes: &[u8]) -> &mut Self {
        self.leaf(name, &to_base64(bytes))
    }

    pub fn text(&mut self, text: &str) -> &mut Self {
        self.children.push(Content::Text(text.to_string()));
        self
    }

    /// Appends a prebuilt element as a child.
    pub fn push(&mut self, element: XmlBuilder) -> &mut Self {
        self.children.push(Content::Element(element));
        self
    }

    /// Concatenated canonical bytes of every subtree marked
    /// `authenticate="true"`, in document order. This is the input of the
    /// envelope signature.
    pub fn authenticated_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.collect_authenticated(&mut out);
        out
    }

    fn collect_authenticated(&self, out: &mut Vec<u8>) {
        let marked = self
            .attrs
            .iter()
            .any(|(key, value)| key == "authenticate" && value == "true");
        if marked {
            out.extend_from_slice(&self.canonical_bytes());
        } else {
            for child in &self.children {
                if let Content::Element(element) = child {
                    element.collect_authenticated(out);
                }
            }
        }
    }

    /// Serializes the subtree rooted here, without an XML declaration.
    /// This is the canonical byte form signatures are computed over.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut writer = Writer::new(Cursor::new(Vec::new()));
        self.write_into(&mut writer);
        writer.into_inner().into_inner()
    }

    /// Serializes the whole document with the `<?xml?>` declaration.
    pub fn to_document(&self) -> Vec<u8> {
        let mut writer = Writer::new(Cursor::new(Vec::new()));
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .expect("writing to a Vec cannot fail");
        self.write_into(&mut writer);
        writer.into_inner().into_inner()
    }

    fn write_into(&self, writer: &mut Writer<Cursor<Vec<u8>>>) {
        let mut start = BytesStart::new(self.name.as_str());
        for (key, value) in &self.attrs {
            start.push_attribute((key.as_str(), value.as_str()));
        }
        // Always expand to a start/end pair, never `<a/>`; canonical XML
        // requires the expanded form and digests must be reproducible.
        writer
            .write_event(Event::Start(start))
            .expect("writing to a Vec cannot fail");
        for child in &self.children {
            match child {
                Content::Element(element) => element.write_into(writer),
                Content::Text(text) => {
                    writer
                        .write_event(Event::Text(BytesText::new(text)))
                        .expect("writing to a Vec cannot fail");
                }
            }
        }
        writer
            .write_event(Event::End(BytesEnd::new(self.name.as_str())))
            .expect("writing to a Vec cannot fail");
    }
}

/// An owned DOM element as parsed off the wire. Names and attribute keys are
/// stored without their namespace prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlNode {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<XmlNode>,
    pub text: String,
}

impl XmlNode {
    /// Parses a full document and returns its root element.
    pub fn parse(bytes: &[u8]) -> Result<XmlNode, XmlError> {
        let mut reader = Reader::from_reader(bytes);
        reader.config_mut().trim_text_start = true;
        reader.config_mut().trim_text_end = true;
        let mut stack: Vec<XmlNode> = Vec::new();
        let mut buf = Vec::new();
        loop {
            match reader.read_event_into(&mut buf)? {
                Event::Start(start) => {
                    stack.push(node_from_start(&start)?);
                }
                Event::Empty(start) => {
                    let node = node_from_start(&start)?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(node),
                        None => return Ok(node),
                    }
                }
                Event::End(_) => {
                    let node = stack.pop().ok_or(XmlError::NoRoot)?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(node),
                        None => return Ok(node),
                    }
                }
                Event::Text(text) => {
                    if let Some(parent) = stack.last_mut() {
                        let unescaped = text.unescape().map_err(quick_xml::Error::from)?;
                        parent.text.push_str(&unescaped);
                    }
                }
                Event::CData(cdata) => {
                    if let Some(parent) = stack.last_mut() {
                        parent.text.push_str(&String::from_utf8_lossy(&cdata));
                    }
                }
                Event::Eof => return Err(XmlError::NoRoot),
                _ => {}
            }
            buf.clear();
        }
    }

    /// Exactly one child with the given local name.
    pub fn one(&self, name: &str) -> Result<&XmlNode, XmlError> {
        let mut found = None;
        let mut count = 0;
        for child in &self.children {
            if child.name == name {
                count += 1;
                found.get_or_insert(child);
            }
        }
        match (found, count) {
            (Some(node), 1) => Ok(node),
            _ => Err(XmlError::Cardinality {
                parent: self.name.clone(),
                name: name.to_string(),
                count,
            }),
        }
    }

    /// At most one child with the given local name.
    pub fn opt(&self, name: &str) -> Option<&XmlNode> {
        self.children.iter().find(|child| child.name == name)
    }

    /// All children with the given local name, in document order.
    pub fn iter<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlNode> + 'a {
        self.children.iter().filter(move |child| child.name == name)
    }

    /// Maps every child with the given local name through `f`, failing fast.
    pub fn map<T, E: From<XmlError>>(
        &self,
        name: &str,
        mut f: impl FnMut(&XmlNode) -> Result<T, E>,
    ) -> Result<Vec<T>, E> {
        let mut out = Vec::new();
        for child in &self.children {
            if child.name == name {
                out.push(f(child)?);
            }
        }
        Ok(out)
    }

    pub fn text(&self) -> &str {
        self.text.trim()
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn require_attr(&self, key: &str) -> Result<&str, XmlError> {
        self.attr(key)
            .ok_or_else(|| XmlError::MissingAttribute(key.to_string()))
    }

    /// Text content decoded from Base64.
    pub fn text_base64(&self) -> Result<Vec<u8>, XmlError> {
        Ok(from_base64(self.text())?)
    }

    /// Depth-first search for the first descendant carrying the attribute,
    /// used to locate `authenticate="true"` subtrees.
    pub fn find_with_attr<'a>(&'a self, key: &str, value: &str) -> Vec<&'a XmlNode> {
        let mut found = Vec::new();
        self.collect_with_attr(key, value, &mut found);
        found
    }

    fn collect_with_attr<'a>(&'a self, key: &str, value: &str, out: &mut Vec<&'a XmlNode>) {
        if self.attr(key) == Some(value) {
            out.push(self);
        } else {
            for child in &self.children {
                child.collect_with_attr(key, value, out);
            }
        }
    }

    /// Re-serializes this subtree through the canonical writer, producing
    /// the same bytes [`XmlBuilder::canonical_bytes`] would for an
    /// equivalent tree.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        self.to_builder().canonical_bytes()
    }

    fn to_builder(&self) -> XmlBuilder {
        let mut builder = XmlBuilder::new(&self.name);
        for (key, value) in &self.attrs {
            builder.attr(key, value);
        }
        if !self.text.trim().is_empty() {
            builder.text(self.text.trim());
        }
        for child in &self.children {
            builder.children.push(Content::Element(child.to_builder()));
        }
        builder
    }
}

fn node_from_start(start: &BytesStart<'_>) -> Result<XmlNode, XmlError> {
    let raw_name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut attrs = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = String::from_utf8_lossy(&attr.value).into_owned();
        // Namespace declarations keep their full name so re-serialization
        // stays faithful; everything else is matched by local name.
        if key.starts_with("xmlns") {
            attrs.push((key, value));
        } else {
            attrs.push((local_name(&key).to_string(), value));
        }
    }
    Ok(XmlNode {
        name: local_name(&raw_name).to_string(),
        attrs,
        children: Vec::new(),
        text: String::new(),
    })
}

fn local_name(qname: &str) -> &str {
    match qname.rsplit_once(':') {
        Some((_, local)) => local,
        None => qname,
    }
}

pub fn to_base64(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

pub fn from_base64(text: &str) -> Result<Vec<u8>, base64::DecodeError> {
    use base64::Engine;
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    base64::engine::general_purpose::STANDARD.decode(compact)
}

/// Compresses order data the way EBICS order payloads travel.
pub fn deflate(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(bytes)
        .and_then(|_| encoder.finish())
        .expect("writing to a Vec cannot fail")
}

pub fn inflate(bytes: &[u8]) -> Result<Vec<u8>, XmlError> {
    let mut decoder = ZlibDecoder::new(bytes);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(XmlError::Compression)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_response() -> Vec<u8> {
        let mut root = XmlBuilder::new("ebicsResponse");
        root.ns("urn:org:ebics:H004").attr("Version", "H004");
        root.el("header", |header| {
            header.attr("authenticate", "true");
            header.el("static", |fixed| {
                fixed.leaf("TransactionID", "A1B2");
                fixed.leaf("NumSegments", "2");
            });
            header.el("mutable", |mutable| {
                mutable.leaf("TransactionPhase", "Initialisation");
                mutable.leaf("ReturnCode", "000000");
            });
        });
        root.el("body", |body| {
            body.el("DataTransfer", |dt| {
                dt.leaf_base64("OrderData", b"hello");
            });
        });
        root.to_document()
    }

    #[test]
    fn builder_emits_declaration_and_nesting() {
        let document = String::from_utf8(sample_response()).unwrap();
        assert!(document.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(document.contains("<ebicsResponse xmlns=\"urn:org:ebics:H004\" Version=\"H004\">"));
        assert!(document.contains("<TransactionID>A1B2</TransactionID>"));
    }

    #[test]
    fn builder_escapes_text_and_attributes() {
        let mut root = XmlBuilder::new("Ustrd");
        root.text("a<b & \"c\"");
        let bytes = root.canonical_bytes();
        let s = String::from_utf8(bytes).unwrap();
        assert!(s.contains("a&lt;b &amp;"));
    }

    #[test]
    fn empty_elements_serialize_expanded() {
        let mut root = XmlBuilder::new("Outer");
        root.empty("Inner");
        let s = String::from_utf8(root.canonical_bytes()).unwrap();
        assert_eq!(s, "<Outer><Inner></Inner></Outer>");
    }

    #[test]
    fn dom_scope_navigation() {
        let root = XmlNode::parse(&sample_response()).unwrap();
        assert_eq!(root.name, "ebicsResponse");
        let header = root.one("header").unwrap();
        assert_eq!(
            header.one("static").unwrap().one("NumSegments").unwrap().text(),
            "2"
        );
        assert!(header.opt("DataTransfer").is_none());
        let order_data = root
            .one("body")
            .unwrap()
            .one("DataTransfer")
            .unwrap()
            .one("OrderData")
            .unwrap();
        assert_eq!(order_data.text_base64().unwrap(), b"hello");
    }

    #[test]
    fn one_rejects_zero_and_many() {
        let root = XmlNode::parse(&sample_response()).unwrap();
        assert!(root.one("nothing").is_err());
        let mut doubled = XmlBuilder::new("r");
        doubled.leaf("x", "1").leaf("x", "2");
        let parsed = XmlNode::parse(&doubled.to_document()).unwrap();
        assert!(parsed.one("x").is_err());
        assert_eq!(parsed.iter("x").count(), 2);
    }

    #[test]
    fn lookup_ignores_namespace_prefixes() {
        let raw = br#"<?xml version="1.0"?>
            <ns2:ebicsResponse xmlns:ns2="urn:org:ebics:H005">
              <ns2:header authenticate="true"><ns2:mutable>
                <ns2:ReturnCode>000000</ns2:ReturnCode>
              </ns2:mutable></ns2:header>
            </ns2:ebicsResponse>"#;
        let root = XmlNode::parse(raw).unwrap();
        assert_eq!(root.name, "ebicsResponse");
        let code = root
            .one("header")
            .unwrap()
            .one("mutable")
            .unwrap()
            .one("ReturnCode")
            .unwrap();
        assert_eq!(code.text(), "000000");
        assert_eq!(root.one("header").unwrap().attr("authenticate"), Some("true"));
    }

    #[test]
    fn authenticated_subtree_lookup() {
        let root = XmlNode::parse(&sample_response()).unwrap();
        let marked = root.find_with_attr("authenticate", "true");
        assert_eq!(marked.len(), 1);
        assert_eq!(marked[0].name, "header");
    }

    #[test]
    fn reserialization_is_stable() {
        let root = XmlNode::parse(&sample_response()).unwrap();
        let first = root.canonical_bytes();
        let reparsed = XmlNode::parse(&first).unwrap();
        assert_eq!(first, reparsed.canonical_bytes());
    }

    #[test]
    fn deflate_round_trip() {
        let payload = vec![7u8; 4096];
        let packed = deflate(&payload);
        assert!(packed.len() < payload.len());
        assert_eq!(inflate(&packed).unwrap(), payload);
    }

    #[test]
    fn base64_tolerates_line_breaks() {
        let encoded = "aGVs\nbG8=";
        assert_eq!(from_base64(encoded).unwrap(), b"hello");
    }
}
