use headers::HeaderMapExt;
use http::{HeaderValue, Request, Response};

use crate::body::Body;
use crate::store::{DavTransaction, StoredObject};
use crate::DavResult;

const ALLOW_ABSENT: &str = "OPTIONS, MKCOL, PUT";
const ALLOW_NULL: &str = "OPTIONS, MKCOL, PUT, PROPFIND, LOCK, UNLOCK";
const ALLOW_RESOURCE: &str =
    "OPTIONS, GET, HEAD, POST, DELETE, TRACE, PROPPATCH, COPY, MOVE, LOCK, UNLOCK, PROPFIND";
const ALLOW_FOLDER: &str =
    "OPTIONS, GET, HEAD, POST, DELETE, TRACE, PROPPATCH, COPY, MOVE, LOCK, UNLOCK, PROPFIND, PUT";

/// Methods that make sense on whatever is stored at a path.
pub(crate) fn allowed_methods(so: Option<&StoredObject>) -> &'static str {
    match so {
        None => ALLOW_ABSENT,
        Some(so) if so.is_null_resource => ALLOW_NULL,
        Some(so) if so.is_folder => ALLOW_FOLDER,
        Some(_) => ALLOW_RESOURCE,
    }
}

impl crate::DavHandler {
    pub(crate) async fn handle_options(
        &self,
        req: &Request<()>,
        tx: &DavTransaction,
    ) -> DavResult<Response<Body>> {
        let mut res = Response::new(Body::empty());

        let h = res.headers_mut();
        h.insert("DAV", HeaderValue::from_static("1, 2"));
        h.insert("MS-Author-Via", HeaderValue::from_static("DAV"));
        h.typed_insert(headers::ContentLength(0));

        let path = self.path(req)?;
        let allow = if path.is_star() {
            ALLOW_FOLDER
        } else {
            let so = self.stored_object(tx, &path).await?;
            allowed_methods(so.as_ref())
        };
        Self::allow_header(&mut res, allow);

        Ok(res)
    }
}
