use std::io::Cursor;

use headers::HeaderMapExt;
use http::{Request, Response, StatusCode};
use xml::writer::XmlEvent as XmlWEvent;
use xmltree::{Element, XMLNode};

use crate::body::Body;
use crate::davhandler::handle_delete::child_status;
use crate::davhandler::handle_lock::{lockdiscovery_elem, supportedlock_elem};
use crate::davhandler::templock::TempLockSet;
use crate::davheaders::Depth;
use crate::davpath::DavPath;
use crate::errors::DavError;
use crate::locks::LockDepth;
use crate::multierror::{multistatus_response, status_line};
use crate::store::{DavTransaction, StoredObject};
use crate::util::{systemtime_to_httpdate, systemtime_to_rfc3339, DavMethod};
use crate::xmltree_ext::{self, ElementExt, Emitter, NS_DAV_URI};
use crate::DavResult;

// Properties of every object.
const PROPS_COMMON: &[&str] = &[
    "creationdate",
    "displayname",
    "resourcetype",
    "supportedlock",
    "lockdiscovery",
    "source",
];

// Properties that only resources have.
const PROPS_RESOURCE: &[&str] = &[
    "getlastmodified",
    "getcontentlength",
    "getcontenttype",
    "getetag",
];

/// What a PROPFIND asks for.
#[derive(Debug, Clone)]
pub(crate) enum PropFind {
    AllProp,
    PropName,
    Prop(Vec<Element>),
}

/// Parse a `propfind` document. An empty body means allprop.
pub(crate) fn parse_propfind(body: &[u8]) -> DavResult<PropFind> {
    if body.is_empty() {
        return Ok(PropFind::AllProp);
    }
    let tree = Element::parse2(Cursor::new(body))?;
    if !tree.is_dav("propfind") {
        return Err(DavError::XmlParseError);
    }
    let query = match tree.child_elems().next() {
        Some(e) if e.is_dav("allprop") => Ok(PropFind::AllProp),
        Some(e) if e.is_dav("propname") => Ok(PropFind::PropName),
        Some(e) if e.is_dav("prop") => Ok(PropFind::Prop(
            e.child_elems().map(bare_elem).collect(),
        )),
        _ => Err(DavError::XmlParseError),
    };
    query
}

/// Names of the properties a `propertyupdate` document sets or removes.
pub(crate) fn parse_propertyupdate(body: &[u8]) -> DavResult<Vec<Element>> {
    let tree = Element::parse2(Cursor::new(body))?;
    if !tree.is_dav("propertyupdate") {
        return Err(DavError::XmlParseError);
    }
    let mut names = Vec::new();
    for op in tree.child_elems() {
        if !op.is_dav("set") && !op.is_dav("remove") {
            return Err(DavError::XmlParseError);
        }
        for prop in op.child_elems().filter(|e| e.is_dav("prop")) {
            names.extend(prop.child_elems().map(bare_elem));
        }
    }
    Ok(names)
}

// The element without its value.
fn bare_elem(e: &Element) -> Element {
    let mut b = e.clone();
    b.children.clear();
    b.attributes.clear();
    b
}

fn propstat(props: Vec<Element>, status: StatusCode) -> Element {
    let mut prop = Element::new2("D:prop");
    prop.children = props.into_iter().map(XMLNode::Element).collect();
    let mut ps = Element::new2("D:propstat");
    ps.push_elem(prop);
    ps.push_elem(Element::new2("D:status").text(status_line(status)));
    ps
}

fn write_response(
    emitter: &mut Emitter,
    path: &DavPath,
    found: Vec<Element>,
    missing: Vec<Element>,
) -> DavResult<()> {
    let mut resp = Element::new2("D:response");
    resp.push_elem(Element::new2("D:href").text(path.as_url_string()));
    if !found.is_empty() || missing.is_empty() {
        resp.push_elem(propstat(found, StatusCode::OK));
    }
    if !missing.is_empty() {
        resp.push_elem(propstat(missing, StatusCode::NOT_FOUND));
    }
    resp.write_ev(emitter)?;
    Ok(())
}

// A <response> with a status instead of properties.
fn write_status_response(
    emitter: &mut Emitter,
    path: &DavPath,
    status: StatusCode,
) -> DavResult<()> {
    let mut resp = Element::new2("D:response");
    resp.push_elem(Element::new2("D:href").text(path.as_url_string()));
    resp.push_elem(Element::new2("D:status").text(status_line(status)));
    resp.write_ev(emitter)?;
    Ok(())
}

fn start_multistatus() -> DavResult<Emitter> {
    let mut emitter = xmltree_ext::new_emitter()?;
    emitter.write(XmlWEvent::start_element("D:multistatus").ns("D", NS_DAV_URI))?;
    Ok(emitter)
}

fn finish_multistatus(mut emitter: Emitter) -> DavResult<Response<Body>> {
    emitter.write(XmlWEvent::end_element())?;
    multistatus_response(xmltree_ext::finish(emitter))
}

impl crate::DavHandler {
    pub(crate) async fn handle_propfind(
        &self,
        req: &Request<()>,
        tx: &DavTransaction,
        body: &[u8],
    ) -> DavResult<Response<Body>> {
        let path = self.path(req)?;
        let depth = match req.headers().typed_get::<Depth>() {
            Some(Depth::Zero) => LockDepth::Zero,
            Some(Depth::One) => LockDepth::One,
            _ => LockDepth::Infinity,
        };
        let query = parse_propfind(body)?;

        let _guard = self
            .temp_lock(TempLockSet::new(DavMethod::PropFind).path(path.as_str(), depth))
            .await?;

        let so = match self.stored_object(tx, &path).await? {
            Some(so) => so,
            None => return Err(DavError::Status(StatusCode::NOT_FOUND)),
        };

        let mut emitter = start_multistatus()?;

        // depth-first, children in the order the store gives them.
        let mut todo: Vec<(DavPath, StoredObject, usize)> = vec![(path, so, 0)];
        while let Some((mut path, so, level)) = todo.pop() {
            if so.is_folder {
                path.add_slash();
            }
            if !so.is_folder || !depth.covers(level + 1) {
                self.propfind_one(&mut emitter, tx, &path, &so, &query)?;
                continue;
            }
            // a folder whose children cannot be listed is reported with
            // the error instead of its properties.
            let names = match self.store.get_children_names(tx, &path).await {
                Ok(names) => names.unwrap_or_default(),
                Err(e) => {
                    debug!("PROPFIND {}: {}", path, e);
                    write_status_response(&mut emitter, &path, child_status(e))?;
                    continue;
                }
            };
            self.propfind_one(&mut emitter, tx, &path, &so, &query)?;
            let mut children = Vec::with_capacity(names.len());
            for name in names {
                let child = path.push_segment(&name);
                match self.stored_object(tx, &child).await {
                    Ok(Some(cso)) => children.push((child, cso, level + 1)),
                    Ok(None) => {}
                    Err(e) => debug!("PROPFIND {}: {}", child, e),
                }
            }
            todo.extend(children.into_iter().rev());
        }

        finish_multistatus(emitter)
    }

    // One <response> for one object.
    fn propfind_one(
        &self,
        emitter: &mut Emitter,
        tx: &DavTransaction,
        path: &DavPath,
        so: &StoredObject,
        query: &PropFind,
    ) -> DavResult<()> {
        let mut found = Vec::new();
        let mut missing = Vec::new();
        let available = PROPS_COMMON
            .iter()
            .chain(PROPS_RESOURCE.iter().filter(|_| !so.is_folder));

        match query {
            PropFind::PropName => {
                for name in available {
                    found.push(Element::new2(format!("D:{}", name).as_str()));
                }
            }
            PropFind::AllProp => {
                for name in available {
                    if let Some(e) = self.build_prop(tx, path, so, name) {
                        found.push(e);
                    }
                }
            }
            PropFind::Prop(props) => {
                for p in props {
                    let value = if p.namespace.as_deref() == Some(NS_DAV_URI) {
                        self.build_prop(tx, path, so, &p.name)
                    } else {
                        None
                    };
                    match value {
                        Some(e) => found.push(e),
                        None => missing.push(p.clone()),
                    }
                }
            }
        }
        write_response(emitter, path, found, missing)
    }

    // Value of a live DAV: property, `None` if this object does not have it.
    fn build_prop(
        &self,
        tx: &DavTransaction,
        path: &DavPath,
        so: &StoredObject,
        name: &str,
    ) -> Option<Element> {
        let mut elem = Element::new2(format!("D:{}", name).as_str());
        match name {
            "creationdate" => {
                elem = elem.text(systemtime_to_rfc3339(so.creation_date));
            }
            "displayname" => {
                elem = elem.text(path.file_name());
            }
            "resourcetype" => {
                if so.is_folder {
                    elem.push_elem(Element::new2("D:collection"));
                }
            }
            "source" => {}
            "supportedlock" => {
                let lock = self.locks.get_by_path(path.as_str());
                return Some(supportedlock_elem(lock.as_ref()));
            }
            "lockdiscovery" => {
                let lock = self.locks.get_by_path(path.as_str());
                return Some(lockdiscovery_elem(lock.as_ref()));
            }
            _ if so.is_folder => return None,
            "getlastmodified" => {
                elem = elem.text(systemtime_to_httpdate(so.last_modified));
            }
            "getcontentlength" => {
                elem = elem.text(so.resource_length.to_string());
            }
            "getcontenttype" => {
                elem = elem.text(self.content_type(tx, path, so)?);
            }
            "getetag" => {
                elem = elem.text(so.etag());
            }
            _ => return None,
        }
        Some(elem)
    }

    pub(crate) async fn handle_proppatch(
        &self,
        req: &Request<()>,
        tx: &DavTransaction,
        body: &[u8],
    ) -> DavResult<Response<Body>> {
        let path = self.path(req)?;
        let parent = path.parent();

        let _guard = self
            .temp_lock(TempLockSet::new(DavMethod::PropPatch).path(path.as_str(), LockDepth::Zero))
            .await?;

        if !self.check_locks(req, &parent) || !self.check_locks(req, &path) {
            return Err(DavError::Status(StatusCode::LOCKED));
        }

        let mut path = path;
        match self.stored_object(tx, &path).await? {
            Some(so) if so.is_folder => path.add_slash(),
            Some(_) => {}
            None => return Err(DavError::Status(StatusCode::NOT_FOUND)),
        }

        if body.is_empty() {
            return Err(DavError::Status(StatusCode::INTERNAL_SERVER_ERROR));
        }
        let names = match parse_propertyupdate(body) {
            Ok(names) => names,
            Err(e) => {
                debug!("PROPPATCH {}: {}", path, e);
                return Err(DavError::Status(StatusCode::INTERNAL_SERVER_ERROR));
            }
        };

        // Properties are acknowledged, not stored.
        let mut emitter = start_multistatus()?;
        write_response(&mut emitter, &path, names, Vec::new())?;
        finish_multistatus(emitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn propfind_modes() {
        assert!(matches!(parse_propfind(b"").unwrap(), PropFind::AllProp));
        let body = br#"<D:propfind xmlns:D="DAV:"><D:propname/></D:propfind>"#;
        assert!(matches!(parse_propfind(body).unwrap(), PropFind::PropName));
        let body = br#"<propfind xmlns="DAV:" xmlns:Z="urn:z"><prop><getetag/><Z:color>red</Z:color></prop></propfind>"#;
        match parse_propfind(body).unwrap() {
            PropFind::Prop(props) => {
                assert_eq!(props.len(), 2);
                assert!(props[0].is_dav("getetag"));
                assert_eq!(props[1].name, "color");
                assert!(props[1].children.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn propfind_malformed() {
        let err = parse_propfind(b"<D:propfind xmlns:D=\"DAV:\">").unwrap_err();
        assert_eq!(err.statuscode(), StatusCode::BAD_REQUEST);
        let err = parse_propfind(br#"<D:other xmlns:D="DAV:"/>"#).unwrap_err();
        assert_eq!(err.statuscode(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn propertyupdate_names() {
        let body = br#"<?xml version="1.0" encoding="utf-8" ?>
            <D:propertyupdate xmlns:D="DAV:" xmlns:Z="http://ns.example.com/z/">
              <D:set><D:prop><Z:Authors><Z:Author>Jim</Z:Author></Z:Authors></D:prop></D:set>
              <D:remove><D:prop><Z:Copyright-Owner/></D:prop></D:remove>
            </D:propertyupdate>"#;
        let names = parse_propertyupdate(body).unwrap();
        let names: Vec<&str> = names.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["Authors", "Copyright-Owner"]);
    }
}
