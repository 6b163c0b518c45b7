//! Minimal owned XML tree over `quick_xml` events.
//!
//! Presets must be edited in place without losing elements this crate
//! does not know about, so they are loaded into a tree rather than
//! deserialized into fixed structs. Whitespace-only text is dropped on
//! read and re-created by the indenting writer, which makes
//! parse → write → parse → write a fixpoint.

use quick_xml::events::{BytesCData, BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlError(pub String);

impl std::fmt::Display for XmlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for XmlError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
    CData(String),
    Comment(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Declaration {
    pub version: String,
    pub encoding: Option<String>,
    pub standalone: Option<String>,
}

impl Default for Declaration {
    fn default() -> Self {
        Self {
            version: "1.0".into(),
            encoding: Some("utf-8".into()),
            standalone: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub declaration: Option<Declaration>,
    pub root: Element,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|n| match n {
            Node::Element(e) => Some(e),
            _ => None,
        })
    }

    pub fn child(&self, name: &str) -> Option<&Element> {
        self.elements().find(|e| e.name == name)
    }

    /// Returns the first child called `name`, appending one if absent.
    pub fn ensure_child(&mut self, name: &str) -> &mut Element {
        let idx = match self
            .children
            .iter()
            .position(|n| matches!(n, Node::Element(e) if e.name == name))
        {
            Some(i) => i,
            None => {
                self.children.push(Node::Element(Element::new(name)));
                self.children.len() - 1
            }
        };
        match &mut self.children[idx] {
            Node::Element(e) => e,
            _ => unreachable!("index points at an element"),
        }
    }

    /// Walks `path` from this element, creating missing intermediates.
    pub fn ensure_path(&mut self, path: &[&str]) -> &mut Element {
        path.iter().fold(self, |el, name| el.ensure_child(name))
    }

    /// Depth-first search for the first descendant called `name`.
    pub fn find(&self, name: &str) -> Option<&Element> {
        for e in self.elements() {
            if e.name == name {
                return Some(e);
            }
            if let Some(found) = e.find(name) {
                return Some(found);
            }
        }
        None
    }

    /// Path from this element's children to the first descendant called
    /// `name`, as child indices.
    fn find_index_path(&self, name: &str) -> Option<Vec<usize>> {
        for (i, node) in self.children.iter().enumerate() {
            if let Node::Element(e) = node {
                if e.name == name {
                    return Some(vec![i]);
                }
                if let Some(mut rest) = e.find_index_path(name) {
                    rest.insert(0, i);
                    return Some(rest);
                }
            }
        }
        None
    }

    fn walk_mut(&mut self, path: &[usize]) -> &mut Element {
        let mut cur = self;
        for &i in path {
            cur = match &mut cur.children[i] {
                Node::Element(e) => e,
                _ => unreachable!("index path only visits elements"),
            };
        }
        cur
    }

    pub fn find_mut(&mut self, name: &str) -> Option<&mut Element> {
        let path = self.find_index_path(name)?;
        Some(self.walk_mut(&path))
    }

    /// The first descendant called `name`, or a new `name` element created
    /// at `fallback` (relative to this element) when there is none.
    pub fn find_or_create(&mut self, name: &str, fallback: &[&str]) -> &mut Element {
        match self.find_index_path(name) {
            Some(path) => self.walk_mut(&path),
            None => self.ensure_path(fallback).ensure_child(name),
        }
    }

    /// Concatenated text content of direct text children.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|n| match n {
                Node::Text(t) | Node::CData(t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Replaces all children with a single text node.
    pub fn set_text(&mut self, text: impl Into<String>) {
        self.children = vec![Node::Text(text.into())];
    }

    pub fn set_bool(&mut self, value: bool) {
        self.set_text(if value { "true" } else { "false" });
    }

    pub fn push(&mut self, child: Element) {
        self.children.push(Node::Element(child));
    }
}

impl Document {
    pub fn new(root: Element) -> Self {
        Self {
            declaration: Some(Declaration::default()),
            root,
        }
    }

    pub fn parse(text: &str) -> Result<Self, XmlError> {
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        let mut reader = Reader::from_str(text);
        reader.config_mut().trim_text(true);

        let mut declaration = None;
        let mut stack: Vec<Element> = Vec::new();
        let mut root: Option<Element> = None;

        loop {
            let event = reader.read_event().map_err(|e| {
                XmlError(format!("at byte {}: {}", reader.buffer_position(), e))
            })?;
            match event {
                Event::Decl(d) => declaration = Some(read_decl(&d)?),
                Event::Start(s) => stack.push(read_start(&s)?),
                Event::Empty(s) => {
                    let el = read_start(&s)?;
                    attach(&mut stack, &mut root, el)?;
                }
                Event::End(_) => {
                    let el = stack
                        .pop()
                        .ok_or_else(|| XmlError("unbalanced end tag".into()))?;
                    attach(&mut stack, &mut root, el)?;
                }
                Event::Text(t) => {
                    let value = t.unescape().map_err(|e| XmlError(e.to_string()))?;
                    if let Some(top) = stack.last_mut() {
                        top.children.push(Node::Text(value.into_owned()));
                    }
                }
                Event::CData(c) => {
                    if let Some(top) = stack.last_mut() {
                        top.children
                            .push(Node::CData(String::from_utf8_lossy(&c).into_owned()));
                    }
                }
                Event::Comment(c) => {
                    if let Some(top) = stack.last_mut() {
                        top.children
                            .push(Node::Comment(String::from_utf8_lossy(&c).into_owned()));
                    }
                }
                Event::PI(_) | Event::DocType(_) => {}
                Event::Eof => break,
            }
        }

        if !stack.is_empty() {
            return Err(XmlError(format!("unclosed element <{}>", stack[stack.len() - 1].name)));
        }
        let root = root.ok_or_else(|| XmlError("document has no root element".into()))?;
        Ok(Self { declaration, root })
    }

    /// Serializes with two-space indentation and a trailing newline.
    pub fn to_xml_string(&self) -> Result<String, XmlError> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        if let Some(d) = &self.declaration {
            writer
                .write_event(Event::Decl(BytesDecl::new(
                    &d.version,
                    d.encoding.as_deref(),
                    d.standalone.as_deref(),
                )))
                .map_err(write_error)?;
        }
        write_element(&mut writer, &self.root)?;
        let mut out =
            String::from_utf8(writer.into_inner()).map_err(|e| XmlError(e.to_string()))?;
        out.push('\n');
        Ok(out)
    }
}

fn write_error<E: std::fmt::Display>(e: E) -> XmlError {
    XmlError(e.to_string())
}

fn text(bytes: std::borrow::Cow<'_, [u8]>) -> String {
    String::from_utf8_lossy(&bytes).into_owned()
}

fn read_decl(d: &BytesDecl<'_>) -> Result<Declaration, XmlError> {
    let version = d.version().map_err(|e| XmlError(e.to_string()))?;
    let encoding = d
        .encoding()
        .transpose()
        .map_err(|e| XmlError(e.to_string()))?;
    let standalone = d
        .standalone()
        .transpose()
        .map_err(|e| XmlError(e.to_string()))?;
    Ok(Declaration {
        version: text(version),
        encoding: encoding.map(text),
        standalone: standalone.map(text),
    })
}

fn read_start(s: &BytesStart<'_>) -> Result<Element, XmlError> {
    let mut el = Element::new(String::from_utf8_lossy(s.name().as_ref()).into_owned());
    for attr in s.attributes() {
        let attr = attr.map_err(|e| XmlError(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| XmlError(e.to_string()))?
            .into_owned();
        el.attributes.push((key, value));
    }
    Ok(el)
}

fn attach(stack: &mut [Element], root: &mut Option<Element>, el: Element) -> Result<(), XmlError> {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(Node::Element(el));
        Ok(())
    } else if root.is_none() {
        *root = Some(el);
        Ok(())
    } else {
        Err(XmlError(format!("second root element <{}>", el.name)))
    }
}

fn write_element(writer: &mut Writer<Vec<u8>>, el: &Element) -> Result<(), XmlError> {
    let map = write_error;
    let mut start = BytesStart::new(el.name.as_str());
    for (k, v) in &el.attributes {
        start.push_attribute((k.as_str(), v.as_str()));
    }
    if el.children.is_empty() {
        return writer.write_event(Event::Empty(start)).map_err(map);
    }
    writer.write_event(Event::Start(start)).map_err(map)?;
    for child in &el.children {
        match child {
            Node::Element(e) => write_element(writer, e)?,
            Node::Text(t) => writer
                .write_event(Event::Text(BytesText::new(t)))
                .map_err(map)?,
            Node::CData(c) => writer
                .write_event(Event::CData(BytesCData::new(c.as_str())))
                .map_err(map)?,
            Node::Comment(c) => writer
                .write_event(Event::Comment(BytesText::from_escaped(c.as_str())))
                .map_err(map)?,
        }
    }
    writer
        .write_event(Event::End(BytesEnd::new(el.name.as_str())))
        .map_err(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<BuildParametersPreset xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">
  <PresetName>Custom &amp; Co</PresetName>
  <!-- keep me -->
  <BuildParameters>
    <Unknown attr="1"/>
    <OutputFormats>
      <string>3DML</string>
    </OutputFormats>
  </BuildParameters>
</BuildParametersPreset>
"#;

    #[test]
    fn parse_preserves_declaration_and_unknown_elements() {
        let doc = Document::parse(SAMPLE).unwrap();
        assert_eq!(doc.declaration.as_ref().unwrap().encoding.as_deref(), Some("utf-8"));
        assert_eq!(doc.root.child("PresetName").unwrap().text(), "Custom & Co");
        let unknown = doc.root.find("Unknown").unwrap();
        assert_eq!(unknown.attributes, vec![("attr".to_string(), "1".to_string())]);
        assert!(doc.root.children.iter().any(|n| matches!(n, Node::Comment(c) if c.contains("keep me"))));
    }

    #[test]
    fn write_parse_write_is_fixpoint() {
        let once = Document::parse(SAMPLE).unwrap().to_xml_string().unwrap();
        let twice = Document::parse(&once).unwrap().to_xml_string().unwrap();
        assert_eq!(once, twice);
        assert!(once.starts_with("<?xml version=\"1.0\" encoding=\"utf-8\"?>"));
        assert!(once.contains("<PresetName>Custom &amp; Co</PresetName>"));
    }

    #[test]
    fn ensure_path_creates_intermediates() {
        let mut root = Element::new("BuildParametersPreset");
        root.ensure_path(&["BuildParameters", "OutputProducts", "Model3D"])
            .set_bool(true);
        root.ensure_path(&["BuildParameters", "OutputProducts", "Ortho"])
            .set_bool(false);
        let products = root.find("OutputProducts").unwrap();
        assert_eq!(products.elements().count(), 2);
        assert_eq!(products.child("Model3D").unwrap().text(), "true");
    }

    #[test]
    fn find_mut_reaches_nested() {
        let mut doc = Document::parse(SAMPLE).unwrap();
        doc.root.find_mut("Unknown").unwrap().set_text("x");
        assert_eq!(doc.root.find("Unknown").unwrap().text(), "x");
        assert!(doc.root.find_mut("Missing").is_none());
    }

    #[test]
    fn rejects_garbage() {
        assert!(Document::parse("<a><b></a>").is_err());
        assert!(Document::parse("").is_err());
    }
}
