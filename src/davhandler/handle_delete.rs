use futures_util::future::{BoxFuture, FutureExt};
use headers::HeaderMapExt;
use http::{Request, Response, StatusCode};

use crate::body::Body;
use crate::davhandler::templock::TempLockSet;
use crate::davpath::DavPath;
use crate::errors::DavError;
use crate::locks::LockDepth;
use crate::multierror::MultiError;
use crate::store::{DavTransaction, StoreError};
use crate::util::DavMethod;
use crate::DavResult;

// Status of a child that could not be removed or copied.
pub(crate) fn child_status(e: StoreError) -> StatusCode {
    match e {
        StoreError::AccessDenied => StatusCode::FORBIDDEN,
        StoreError::ObjectNotFound => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl crate::DavHandler {
    // Remove `path` and everything below it, children before their folder.
    // Failures are recorded in `errors`; a folder with a failed child is
    // left alone.
    pub(crate) fn delete_tree<'a>(
        &'a self,
        tx: &'a DavTransaction,
        path: &'a DavPath,
        errors: &'a mut MultiError,
    ) -> BoxFuture<'a, bool> {
        async move {
            let children = match self.store.get_children_names(tx, path).await {
                Ok(c) => c,
                Err(e) => {
                    errors.add(path, child_status(e));
                    return false;
                }
            };
            let mut ok = true;
            if let Some(names) = children {
                for name in names {
                    let child = path.push_segment(&name);
                    ok &= self.delete_tree(tx, &child, errors).await;
                }
            }
            if !ok {
                return false;
            }
            trace!("STORE: remove_object {}", path);
            match self.store.remove_object(tx, path).await {
                Ok(()) => true,
                Err(e) => {
                    errors.add(path, child_status(e));
                    false
                }
            }
        }
        .boxed()
    }

    pub(crate) async fn handle_delete(
        &self,
        req: &Request<()>,
        tx: &DavTransaction,
    ) -> DavResult<Response<Body>> {
        let path = self.path(req)?;
        if path.is_root() {
            return Err(DavError::Status(StatusCode::FORBIDDEN));
        }
        let parent = path.parent();

        let _guard = self
            .temp_lock(
                TempLockSet::new(DavMethod::Delete)
                    .path(path.as_str(), LockDepth::Infinity)
                    .path(parent.as_str(), LockDepth::Zero),
            )
            .await?;

        if !self.check_locks(req, &parent) || !self.check_locks(req, &path) {
            return Err(DavError::Status(StatusCode::LOCKED));
        }
        let locked = self.check_locks_below(req, &path);
        if !locked.is_empty() {
            return locked.into_response(true);
        }

        if self.stored_object_for_write(tx, &path).await?.is_none() {
            return Err(DavError::Status(StatusCode::NOT_FOUND));
        }

        let mut errors = MultiError::new();
        if self.delete_tree(tx, &path, &mut errors).await {
            self.locks.remove_locks(path.as_str());
        }
        if !errors.is_empty() {
            return errors.into_response(true);
        }

        let mut res = Response::new(Body::empty());
        *res.status_mut() = StatusCode::NO_CONTENT;
        res.headers_mut().typed_insert(headers::ContentLength(0));
        Ok(res)
    }
}
