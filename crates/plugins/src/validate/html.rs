// Lenient HTML tree built from quick-xml events.
//
// Void elements never take children, `<script>`/`<style>` bodies are kept
// as raw text, and unmatched end tags close up to the nearest open element
// with the same name. Parsing stops quietly at the first hard syntax error.

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::QName;
use tracing::debug;

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source",
    "track", "wbr",
];

const RAW_TEXT_ELEMENTS: &[&str] = &["script", "style"];

pub type ElementId = usize;

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Element(ElementId),
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub tag: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Node>,
    pub parent: Option<ElementId>,
}

/// An element arena rooted at a synthetic `#document` element.
#[derive(Debug, Clone)]
pub struct HtmlDocument {
    elements: Vec<Element>,
}

impl HtmlDocument {
    pub fn parse(html: &str) -> Self {
        let mut doc = Self {
            elements: vec![Element {
                tag: "#document".to_string(),
                attributes: Vec::new(),
                children: Vec::new(),
                parent: None,
            }],
        };

        let mut reader = Reader::from_str(html);
        let config = reader.config_mut();
        config.check_end_names = false;
        config.allow_unmatched_ends = true;

        let mut stack: Vec<ElementId> = vec![0];

        loop {
            let parent = stack.last().copied().unwrap_or(0);
            match reader.read_event() {
                Ok(Event::Start(start)) => {
                    let id = doc.push_element(parent, &start);
                    let tag = doc.elements[id].tag.clone();
                    if VOID_ELEMENTS.contains(&tag.as_str()) {
                        continue;
                    }
                    if RAW_TEXT_ELEMENTS.contains(&tag.as_str()) {
                        let end = start.name().as_ref().to_vec();
                        match reader.read_text(QName(&end)) {
                            Ok(text) => doc.push_text(id, text.into_owned()),
                            Err(e) => {
                                debug!(error = %e, tag, "Unterminated raw text element");
                                break;
                            }
                        }
                        continue;
                    }
                    stack.push(id);
                }
                Ok(Event::Empty(start)) => {
                    doc.push_element(parent, &start);
                }
                Ok(Event::End(end)) => {
                    let tag = lowercase_name(end.name().as_ref());
                    if let Some(pos) = stack
                        .iter()
                        .rposition(|id| *id != 0 && doc.elements[*id].tag == tag)
                    {
                        stack.truncate(pos);
                    }
                }
                Ok(Event::Text(text)) => {
                    let decoded = text
                        .unescape()
                        .map(|t| t.into_owned())
                        .unwrap_or_else(|_| String::from_utf8_lossy(&text).into_owned());
                    doc.push_text(parent, decoded);
                }
                Ok(Event::CData(data)) => {
                    doc.push_text(parent, String::from_utf8_lossy(&data).into_owned());
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, position = reader.buffer_position(), "Stopping at malformed HTML");
                    break;
                }
            }
        }

        doc
    }

    fn push_element(&mut self, parent: ElementId, start: &BytesStart<'_>) -> ElementId {
        let attributes = start
            .html_attributes()
            .filter_map(Result::ok)
            .map(|attr| {
                let key = lowercase_name(attr.key.as_ref());
                let value = attr
                    .unescape_value()
                    .map(|v| v.into_owned())
                    .unwrap_or_else(|_| String::from_utf8_lossy(&attr.value).into_owned());
                (key, value)
            })
            .collect();

        let id = self.elements.len();
        self.elements.push(Element {
            tag: lowercase_name(start.name().as_ref()),
            attributes,
            children: Vec::new(),
            parent: Some(parent),
        });
        self.elements[parent].children.push(Node::Element(id));
        id
    }

    fn push_text(&mut self, parent: ElementId, text: String) {
        if text.trim().is_empty() {
            return;
        }
        self.elements[parent].children.push(Node::Text(text));
    }

    pub fn root(&self) -> ElementId {
        0
    }

    pub fn element(&self, id: ElementId) -> &Element {
        &self.elements[id]
    }

    pub fn parent(&self, id: ElementId) -> Option<ElementId> {
        self.elements[id].parent
    }

    pub fn attribute(&self, id: ElementId, name: &str) -> Option<&str> {
        self.elements[id]
            .attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn children(&self, id: ElementId) -> impl Iterator<Item = ElementId> + '_ {
        self.elements[id].children.iter().filter_map(|node| match node {
            Node::Element(child) => Some(*child),
            Node::Text(_) => None,
        })
    }

    /// Direct text children.
    pub fn texts(&self, id: ElementId) -> impl Iterator<Item = &str> + '_ {
        self.elements[id].children.iter().filter_map(|node| match node {
            Node::Text(text) => Some(text.as_str()),
            Node::Element(_) => None,
        })
    }

    /// All elements below `id` in document order.
    pub fn descendants(&self, id: ElementId) -> Vec<ElementId> {
        let mut out = Vec::new();
        let mut pending: Vec<ElementId> = self.children(id).collect();
        pending.reverse();
        while let Some(next) = pending.pop() {
            out.push(next);
            let mut children: Vec<ElementId> = self.children(next).collect();
            children.reverse();
            pending.extend(children);
        }
        out
    }

    /// Concatenated text of `id` and everything below it.
    pub fn text_content(&self, id: ElementId) -> String {
        let mut out = String::new();
        self.collect_text(id, &mut out);
        out
    }

    fn collect_text(&self, id: ElementId, out: &mut String) {
        for node in &self.elements[id].children {
            match node {
                Node::Text(text) => out.push_str(text),
                Node::Element(child) => self.collect_text(*child, out),
            }
        }
    }
}

fn lowercase_name(name: &[u8]) -> String {
    String::from_utf8_lossy(name).to_ascii_lowercase()
}
