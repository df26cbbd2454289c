use std::fmt::Write;

use futures_util::StreamExt;
use headers::HeaderMapExt;
use http::{status::StatusCode, HeaderValue, Request, Response};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};

use crate::body::Body;
use crate::davhandler::handle_options::allowed_methods;
use crate::davhandler::templock::TempLockSet;
use crate::davheaders;
use crate::davpath::DavPath;
use crate::errors::DavError;
use crate::locks::LockDepth;
use crate::store::{DavTransaction, StoredObject};
use crate::util::{systemtime_to_listing, DavMethod};
use crate::DavResult;

// Characters escaped in the hrefs of the listing.
const HREF_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

const LISTING_CSS: &str = "body { font-family: Arial, Helvetica, sans-serif; }
h1 { font-size: 1.5em; }
th { background-color: #9DACBF; }
table { border-style: solid; }
td { margin: 0px; padding: 2px 5px; }
tr.even { background-color: #CCCCCC; }
tr.odd { background-color: #FFFFFF; }";

impl crate::DavHandler {
    pub(crate) async fn handle_get(
        &self,
        req: &Request<()>,
        tx: &DavTransaction,
        method: DavMethod,
    ) -> DavResult<Response<Body>> {
        let head = method == DavMethod::Head;
        let mut path = self.path(req)?;

        // Missing? Maybe there's something to serve instead.
        let mut found = true;
        let mut so = self.stored_object(tx, &path).await?;
        if so.is_none() {
            found = false;
            if let Some(ref alt) = self.instead_of_404 {
                let alt = DavPath::from_str_and_prefix(alt.as_str(), "")?;
                debug!("{} not found, serving {} instead", path, alt);
                so = self.stored_object(tx, &alt).await?;
                path = path.with_path(alt.as_str());
            }
        }
        let so = match so {
            Some(so) => so,
            None => return Err(DavError::Status(StatusCode::NOT_FOUND)),
        };

        if so.is_null_resource {
            let mut res = Response::new(Body::empty());
            *res.status_mut() = StatusCode::METHOD_NOT_ALLOWED;
            Self::allow_header(&mut res, allowed_methods(Some(&so)));
            return Ok(res);
        }

        if so.is_folder {
            if let Some(ref index) = self.default_index_file {
                let mut dir = path.clone();
                dir.add_slash();
                let location = format!(
                    "{}{}",
                    dir.as_url_string(),
                    utf8_percent_encode(index, HREF_ENCODE_SET)
                );
                let mut res = Response::new(Body::empty());
                *res.status_mut() = StatusCode::FOUND;
                res.headers_mut().insert(
                    "location",
                    HeaderValue::from_str(&location).map_err(|_| DavError::InvalidPath)?,
                );
                return Ok(res);
            }
        }

        let guard = self
            .temp_lock(TempLockSet::new(method).path(path.as_str(), LockDepth::Zero))
            .await?;

        let etag = so.etag();
        if let Some(inm) = req.headers().get("if-none-match") {
            if inm.to_str().map(|s| s.trim() == etag).unwrap_or(false) {
                let mut res = Response::new(Body::empty());
                *res.status_mut() = StatusCode::NOT_MODIFIED;
                return Ok(res);
            }
        }

        let mut res = if so.is_folder {
            self.handle_dirlist(tx, &path, head).await?
        } else {
            // a resource addressed as a collection.
            if path.is_collection() {
                return Err(DavError::Status(StatusCode::NOT_FOUND));
            }
            let mut res = Response::new(Body::empty());
            let h = res.headers_mut();
            h.typed_insert(headers::LastModified::from(so.last_modified));
            if let Ok(v) = HeaderValue::from_str(&etag) {
                h.insert("etag", v);
            }
            if self.content_length_headers && so.resource_length > 0 {
                h.typed_insert(headers::ContentLength(so.resource_length));
            }
            if let Some(ct) = self.content_type(tx, &path, &so) {
                if let Ok(v) = HeaderValue::from_str(&ct) {
                    h.insert("content-type", v);
                }
            }
            if !head {
                let content = self.store.get_resource_content(tx, &path).await?;
                // the reader keeps the path locked until the body is sent.
                let content = content.map(move |chunk| {
                    let _held = &guard;
                    chunk
                });
                *res.body_mut() = Body::stream(content);
            }
            res
        };

        if !found {
            *res.status_mut() = StatusCode::NOT_FOUND;
            res.headers_mut()
                .typed_insert(davheaders::ContentLocation(path.as_url_string()));
        }
        Ok(res)
    }

    /// Content type of a resource: what the store recorded, then the mime
    /// typer, then text/html for names without an extension.
    pub(crate) fn content_type(
        &self,
        tx: &DavTransaction,
        path: &DavPath,
        so: &StoredObject,
    ) -> Option<String> {
        if let Some(ref m) = so.mime_type {
            return Some(m.clone());
        }
        if let Some(m) = self.mime_typer.mime_type(tx, path) {
            return Some(m);
        }
        if !path.file_name().contains('.') {
            return Some("text/html".to_string());
        }
        None
    }

    async fn handle_dirlist(
        &self,
        tx: &DavTransaction,
        path: &DavPath,
        head: bool,
    ) -> DavResult<Response<Body>> {
        let mut res = Response::new(Body::empty());
        res.headers_mut().insert(
            "content-type",
            HeaderValue::from_static("text/html; charset=utf-8"),
        );
        if head {
            return Ok(res);
        }

        let mut names = self
            .store
            .get_children_names(tx, path)
            .await?
            .unwrap_or_default();
        names.sort();

        let title = htmlescape::encode_minimal(&path.with_prefix());
        let mut w = String::new();
        let _ = write!(
            w,
            "<html><head><title>Content of folder {}</title><style type=\"text/css\">{}</style></head><body>",
            title, LISTING_CSS
        );
        let _ = write!(w, "<h1>Content of folder {}</h1>", title);
        w.push_str("<table><tr><th>Name</th><th>Size</th><th>Created</th><th>Modified</th></tr>");
        w.push_str("<tr><td colspan=\"4\"><a href=\"../\">Parent</a></td></tr>");

        for (idx, name) in names.iter().enumerate() {
            let child = path.push_segment(name);
            let obj = match self.store.get_stored_object(tx, &child).await {
                Ok(obj) => obj,
                Err(e) => {
                    debug!("listing {}: {}: {}", path, name, e);
                    None
                }
            };
            let is_folder = obj.as_ref().map(|o| o.is_folder).unwrap_or(false);
            let mut href = utf8_percent_encode(name, HREF_ENCODE_SET).to_string();
            if is_folder {
                href.push('/');
            }
            let size = match obj {
                Some(ref o) if o.is_folder => "Folder".to_string(),
                Some(ref o) => format!("{} Bytes", o.resource_length),
                None => "Unknown".to_string(),
            };
            let (created, modified) = match obj {
                Some(ref o) => (
                    systemtime_to_listing(o.creation_date),
                    systemtime_to_listing(o.last_modified),
                ),
                None => (String::new(), String::new()),
            };
            let _ = write!(
                w,
                "<tr class=\"{}\"><td><a href=\"{}\">{}</a></td><td>{}</td><td>{}</td><td>{}</td></tr>",
                if idx % 2 == 0 { "even" } else { "odd" },
                href,
                htmlescape::encode_minimal(name),
                size,
                created,
                modified
            );
        }
        w.push_str("</table></body></html>");

        *res.body_mut() = Body::from(w);
        Ok(res)
    }
}
