//! Per-path error reports of recursive operations.
//!
use http::{Response, StatusCode};
use xml::writer::XmlEvent as XmlWEvent;
use xmltree::Element;

use crate::body::Body;
use crate::davpath::DavPath;
use crate::xmltree_ext::{self, ElementExt, NS_DAV_URI};
use crate::DavResult;

pub(crate) const XML_CONTENT_TYPE: &str = "text/xml; charset=UTF-8";

/// `HTTP/1.1 423 Locked`
pub(crate) fn status_line(status: StatusCode) -> String {
    format!("HTTP/1.1 {}", status)
}

/// Map of path to status, in the order the errors happened.
#[derive(Debug, Default)]
pub(crate) struct MultiError {
    entries: Vec<(DavPath, StatusCode)>,
}

impl MultiError {
    pub fn new() -> MultiError {
        MultiError::default()
    }

    /// Record `status` for `path`. A later entry for the same path replaces the earlier one.
    pub fn add(&mut self, path: &DavPath, status: StatusCode) {
        debug!("multierror: {} {}", path, status);
        match self.entries.iter_mut().find(|(p, _)| p.as_str() == path.as_str()) {
            Some(entry) => entry.1 = status,
            None => self.entries.push((path.clone(), status)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, path: &str) -> Option<StatusCode> {
        self.entries
            .iter()
            .find(|(p, _)| p.as_str() == path)
            .map(|(_, s)| *s)
    }

    /// Merge another report into this one.
    pub fn extend(&mut self, other: MultiError) {
        for (p, s) in other.entries {
            self.add(&p, s);
        }
    }

    /// The body of a 207 Multi-Status response.
    pub fn to_xml(&self) -> DavResult<bytes::Bytes> {
        let mut emitter = xmltree_ext::new_emitter()?;
        emitter.write(XmlWEvent::start_element("D:multistatus").ns("D", NS_DAV_URI))?;
        for (path, status) in &self.entries {
            emitter.write(XmlWEvent::start_element("D:response"))?;
            Element::new2("D:href")
                .text(path.as_url_string())
                .write_ev(&mut emitter)?;
            Element::new2("D:status")
                .text(status_line(*status))
                .write_ev(&mut emitter)?;
            emitter.write(XmlWEvent::end_element())?;
        }
        emitter.write(XmlWEvent::end_element())?;
        Ok(xmltree_ext::finish(emitter))
    }

    /// Turn the report into a response.
    ///
    /// A single entry becomes a plain status response unless
    /// `always_multistatus` is set.
    pub fn into_response(self, always_multistatus: bool) -> DavResult<Response<Body>> {
        if self.entries.len() == 1 && !always_multistatus {
            let mut res = Response::new(Body::empty());
            *res.status_mut() = self.entries[0].1;
            return Ok(res);
        }
        multistatus_response(self.to_xml()?)
    }
}

/// A 207 response with an xml body.
pub(crate) fn multistatus_response(body: bytes::Bytes) -> DavResult<Response<Body>> {
    let mut res = Response::new(Body::from(body));
    *res.status_mut() = StatusCode::MULTI_STATUS;
    res.headers_mut().insert(
        "content-type",
        http::HeaderValue::from_static(XML_CONTENT_TYPE),
    );
    Ok(res)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multistatus_document() {
        let mut me = MultiError::new();
        me.add(&DavPath::new("/a/b c").unwrap(), StatusCode::FORBIDDEN);
        me.add(&DavPath::new("/a/d").unwrap(), StatusCode::LOCKED);
        let xml = String::from_utf8(me.to_xml().unwrap().to_vec()).unwrap();
        assert!(xml.contains("<D:multistatus xmlns:D=\"DAV:\">"));
        assert!(xml.contains(
            "<D:response><D:href>/a/b%20c</D:href><D:status>HTTP/1.1 403 Forbidden</D:status></D:response>"
        ));
        assert!(xml.contains("<D:status>HTTP/1.1 423 Locked</D:status>"));
    }

    #[test]
    fn single_entry_is_plain_status() {
        let mut me = MultiError::new();
        me.add(&DavPath::new("/x").unwrap(), StatusCode::NOT_FOUND);
        let res = me.into_response(false).unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);

        let mut me = MultiError::new();
        me.add(&DavPath::new("/x").unwrap(), StatusCode::NOT_FOUND);
        let res = me.into_response(true).unwrap();
        assert_eq!(res.status(), StatusCode::MULTI_STATUS);
    }

    #[test]
    fn later_status_wins() {
        let mut me = MultiError::new();
        let p = DavPath::new("/x").unwrap();
        me.add(&p, StatusCode::NOT_FOUND);
        me.add(&p, StatusCode::FORBIDDEN);
        assert_eq!(me.get("/x"), Some(StatusCode::FORBIDDEN));
        let xml = String::from_utf8(me.to_xml().unwrap().to_vec()).unwrap();
        assert_eq!(xml.matches("<D:response>").count(), 1);
    }
}
