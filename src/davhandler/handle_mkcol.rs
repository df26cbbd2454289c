use headers::HeaderMapExt;
use http::{Request, Response, StatusCode};

use crate::body::Body;
use crate::davhandler::handle_options::allowed_methods;
use crate::davhandler::templock::TempLockSet;
use crate::errors::DavError;
use crate::locks::LockDepth;
use crate::store::DavTransaction;
use crate::util::DavMethod;
use crate::DavResult;

impl crate::DavHandler {
    pub(crate) async fn handle_mkcol(
        &self,
        req: &Request<()>,
        tx: &DavTransaction,
    ) -> DavResult<Response<Body>> {
        let mut path = self.path(req)?;
        let parent = path.parent();

        let _guard = self
            .temp_lock(
                TempLockSet::new(DavMethod::MkCol)
                    .path(path.as_str(), LockDepth::Zero)
                    .path(parent.as_str(), LockDepth::Zero),
            )
            .await?;

        if !self.check_locks(req, &parent) {
            return Err(DavError::Status(StatusCode::LOCKED));
        }

        match self.stored_object_for_write(tx, &parent).await? {
            None => return Err(DavError::Status(StatusCode::CONFLICT)),
            Some(so) if !so.is_folder => {
                let mut res = Response::new(Body::empty());
                *res.status_mut() = StatusCode::METHOD_NOT_ALLOWED;
                Self::allow_header(&mut res, allowed_methods(Some(&so)));
                return Ok(res);
            }
            Some(_) => {}
        }

        match self.stored_object_for_write(tx, &path).await? {
            None => {
                if !self.check_locks(req, &path) {
                    return Err(DavError::Status(StatusCode::LOCKED));
                }
                self.store.create_folder(tx, &path).await?;
            }
            Some(so) if so.is_null_resource => {
                self.promote_null_resource(req, tx, &path, true, StatusCode::LOCKED)
                    .await?;
            }
            Some(so) => {
                let mut res = Response::new(Body::empty());
                *res.status_mut() = StatusCode::METHOD_NOT_ALLOWED;
                Self::allow_header(&mut res, allowed_methods(Some(&so)));
                return Ok(res);
            }
        }

        let mut res = Response::new(Body::empty());
        *res.status_mut() = StatusCode::CREATED;
        res.headers_mut().typed_insert(headers::ContentLength(0));
        path.add_slash();
        if let Ok(loc) = http::HeaderValue::from_str(&path.as_url_string()) {
            res.headers_mut().insert("location", loc);
        }
        Ok(res)
    }
}
