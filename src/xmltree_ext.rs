use std::borrow::Cow;
use std::io::{Read, Write};

use bytes::Bytes;
use xml::common::XmlVersion;
use xml::writer::EventWriter;
use xml::writer::XmlEvent as XmlWEvent;
use xml::EmitterConfig;
use xmltree::{Element, XMLNode};

use crate::util::MemBuffer;
use crate::{DavError, DavResult};

pub(crate) const NS_DAV_URI: &str = "DAV:";

pub(crate) type Emitter = EventWriter<MemBuffer>;

pub(crate) trait ElementExt {
    /// Builder.
    fn new2<'a, E: Into<&'a str>>(e: E) -> Self;
    /// Builder.
    fn text<T: Into<String>>(self, t: T) -> Self;
    /// Like parse, but returns DavError.
    fn parse2<R: Read>(r: R) -> Result<Element, DavError>;
    /// Add a child element.
    fn push_elem(&mut self, e: Element);
    /// Iterator over the children that are elements.
    fn child_elems(&self) -> Box<dyn Iterator<Item = &Element> + '_>;
    /// Find a child element in the DAV: namespace.
    fn dav_child(&self, name: &str) -> Option<&Element>;
    /// Is this a DAV: element with this name.
    fn is_dav(&self, name: &str) -> bool;
    /// Concatenated text of this element, trimmed.
    fn text_content(&self) -> String;
    /// Write this element and its children to an event writer.
    fn write_ev<W: Write>(&self, emitter: &mut EventWriter<W>) -> xml::writer::Result<()>;
}

impl ElementExt for Element {
    fn new2<'a, N: Into<&'a str>>(n: N) -> Element {
        let v = n.into().splitn(2, ':').collect::<Vec<&str>>();
        if v.len() == 1 {
            Element::new(v[0])
        } else {
            let mut e = Element::new(v[1]);
            e.prefix = Some(v[0].to_string());
            if v[0] == "D" {
                e.namespace = Some(NS_DAV_URI.to_string());
            }
            e
        }
    }

    fn text<S: Into<String>>(self, t: S) -> Element {
        let mut this = self;
        let t = t.into();
        if !t.is_empty() {
            this.children.push(XMLNode::Text(t));
        }
        this
    }

    fn parse2<R: Read>(r: R) -> Result<Element, DavError> {
        let res = Element::parse(r);
        match res {
            Ok(elem) => Ok(elem),
            Err(xmltree::ParseError::MalformedXml(_)) => Err(DavError::XmlReadError),
            Err(_) => Err(DavError::XmlParseError),
        }
    }

    fn push_elem(&mut self, e: Element) {
        self.children.push(XMLNode::Element(e));
    }

    fn child_elems(&self) -> Box<dyn Iterator<Item = &Element> + '_> {
        Box::new(self.children.iter().filter_map(|n| n.as_element()))
    }

    fn dav_child(&self, name: &str) -> Option<&Element> {
        self.child_elems().find(|e| e.is_dav(name))
    }

    fn is_dav(&self, name: &str) -> bool {
        self.name == name && self.namespace.as_deref() == Some(NS_DAV_URI)
    }

    fn text_content(&self) -> String {
        let mut s = String::new();
        for n in &self.children {
            match n {
                XMLNode::Text(t) | XMLNode::CData(t) => s.push_str(t),
                XMLNode::Element(e) => s.push_str(&e.text_content()),
                _ => {}
            }
        }
        s.trim().to_string()
    }

    fn write_ev<W: Write>(&self, emitter: &mut EventWriter<W>) -> xml::writer::Result<()> {
        // DAV: elements always go out as "D:", which the envelope declares.
        let is_dav = self.namespace.as_deref() == Some(NS_DAV_URI);
        let name = match (is_dav, &self.prefix) {
            (true, _) => format!("D:{}", self.name),
            (false, Some(p)) => format!("{}:{}", p, self.name),
            (false, None) => self.name.clone(),
        };
        let mut start = XmlWEvent::start_element(name.as_str());
        if let (false, Some(ns)) = (is_dav, self.namespace.as_deref()) {
            start = match &self.prefix {
                Some(p) => start.ns(p.as_str(), ns),
                None => start.default_ns(ns),
            };
        }
        for (k, v) in &self.attributes {
            start = start.attr(k.as_str(), v.as_str());
        }
        emitter.write(start)?;
        for n in &self.children {
            match n {
                XMLNode::Element(e) => e.write_ev(emitter)?,
                XMLNode::Text(t) => emitter.write(XmlWEvent::characters(t))?,
                XMLNode::CData(t) => emitter.write(XmlWEvent::cdata(t))?,
                _ => {}
            }
        }
        emitter.write(XmlWEvent::end_element())?;
        Ok(())
    }
}

/// Start an xml document in memory.
pub(crate) fn new_emitter() -> DavResult<Emitter> {
    let mut emitter = EventWriter::new_with_config(
        MemBuffer::new(),
        EmitterConfig {
            normalize_empty_elements: false,
            perform_indent: false,
            indent_string: Cow::Borrowed(""),
            ..Default::default()
        },
    );
    emitter.write(XmlWEvent::StartDocument {
        version: XmlVersion::Version10,
        encoding: Some("utf-8"),
        standalone: None,
    })?;
    Ok(emitter)
}

/// Get the document out of the emitter.
pub(crate) fn finish(emitter: Emitter) -> Bytes {
    emitter.into_inner().take()
}

/// Write a complete document with `elem` as the root element, which
/// declares the DAV: namespace as "D".
pub(crate) fn write_document(elem: &Element) -> DavResult<Bytes> {
    let mut emitter = new_emitter()?;
    let mut root = elem.clone();
    let children = std::mem::take(&mut root.children);
    emitter.write(XmlWEvent::start_element(format!("D:{}", root.name).as_str()).ns("D", NS_DAV_URI))?;
    for n in &children {
        match n {
            XMLNode::Element(e) => e.write_ev(&mut emitter)?,
            XMLNode::Text(t) => emitter.write(XmlWEvent::characters(t))?,
            _ => {}
        }
    }
    emitter.write(XmlWEvent::end_element())?;
    Ok(finish(emitter))
}
