use futures_util::future::{BoxFuture, FutureExt};
use headers::HeaderMapExt;
use http::{Request, Response, StatusCode};

use crate::body::Body;
use crate::davhandler::handle_delete::child_status;
use crate::davhandler::handle_options::allowed_methods;
use crate::davhandler::templock::TempLockSet;
use crate::davheaders::{self, Depth};
use crate::davpath::DavPath;
use crate::errors::DavError;
use crate::locks::LockDepth;
use crate::multierror::MultiError;
use crate::store::{DavTransaction, StoreResult};
use crate::util::DavMethod;
use crate::DavResult;

impl crate::DavHandler {
    // Copy `src` to `dst`, which does not exist yet. Folders are copied
    // with their children unless `shallow` is set. A failing child is
    // recorded in `errors` under its destination path; its siblings are
    // still copied.
    pub(crate) fn copy_tree<'a>(
        &'a self,
        tx: &'a DavTransaction,
        src: &'a DavPath,
        dst: &'a DavPath,
        shallow: bool,
        errors: &'a mut MultiError,
    ) -> BoxFuture<'a, ()> {
        async move {
            let so = match self.store.get_stored_object(tx, src).await {
                Ok(Some(so)) => so,
                Ok(None) => {
                    errors.add(dst, StatusCode::NOT_FOUND);
                    return;
                }
                Err(e) => {
                    errors.add(dst, child_status(e));
                    return;
                }
            };

            if !so.is_folder {
                trace!("STORE: copy {} -> {}", src, dst);
                let ct = so.mime_type.as_deref();
                if let Err(e) = self.copy_resource(tx, src, dst, ct).await {
                    errors.add(dst, child_status(e));
                }
                return;
            }

            if let Err(e) = self.store.create_folder(tx, dst).await {
                errors.add(dst, child_status(e));
                return;
            }
            if shallow {
                return;
            }
            let names = match self.store.get_children_names(tx, src).await {
                Ok(names) => names.unwrap_or_default(),
                Err(e) => {
                    errors.add(dst, child_status(e));
                    return;
                }
            };
            for name in names {
                let s = src.push_segment(&name);
                let d = dst.push_segment(&name);
                self.copy_tree(tx, &s, &d, false, errors).await;
            }
        }
        .boxed()
    }

    async fn copy_resource(
        &self,
        tx: &DavTransaction,
        src: &DavPath,
        dst: &DavPath,
        content_type: Option<&str>,
    ) -> StoreResult<u64> {
        self.store.create_resource(tx, dst).await?;
        let content = self.store.get_resource_content(tx, src).await?;
        self.store
            .set_resource_content(tx, dst, content, content_type, None)
            .await
    }

    pub(crate) async fn handle_copymove(
        &self,
        req: &Request<()>,
        tx: &DavTransaction,
        method: DavMethod,
    ) -> DavResult<Response<Body>> {
        let src = self.path(req)?;

        let dest = match req.headers().typed_get::<davheaders::Destination>() {
            Some(d) => d.0,
            None => return Err(DavError::Status(StatusCode::BAD_REQUEST)),
        };
        let dst = DavPath::from_destination(&dest, &self.prefix)?;

        if src.as_str() == dst.as_str() || dst.is_ancestor_of(&src) || src.is_ancestor_of(&dst)
        {
            debug!("{:?} {} -> {}: overlapping paths", method, src, dst);
            return Err(DavError::Status(StatusCode::FORBIDDEN));
        }
        if method == DavMethod::Move && src.is_root() {
            return Err(DavError::Status(StatusCode::FORBIDDEN));
        }

        let overwrite = req
            .headers()
            .typed_get::<davheaders::Overwrite>()
            .map(|o| o.0)
            .unwrap_or(true);
        let shallow = method == DavMethod::Copy
            && req.headers().typed_get::<Depth>() == Some(Depth::Zero);

        let dst_parent = dst.parent();
        let src_parent = src.parent();
        let set = TempLockSet::new(method)
            .path(dst.as_str(), LockDepth::Infinity)
            .path(dst_parent.as_str(), LockDepth::Zero);
        let set = match method {
            DavMethod::Move => set
                .path(src.as_str(), LockDepth::Infinity)
                .path(src_parent.as_str(), LockDepth::Zero),
            _ => set.with(src.as_str(), false, LockDepth::Infinity),
        };
        let _guard = self.temp_lock(set).await?;

        if !self.check_locks(req, &dst) || !self.check_locks(req, &dst_parent) {
            return Err(DavError::Status(StatusCode::LOCKED));
        }
        let mut locked = self.check_locks_below(req, &dst);
        if method == DavMethod::Move {
            if !self.check_locks(req, &src) || !self.check_locks(req, &src_parent) {
                return Err(DavError::Status(StatusCode::LOCKED));
            }
            locked.extend(self.check_locks_below(req, &src));
        }
        if !locked.is_empty() {
            return locked.into_response(true);
        }

        let src_so = match self.stored_object_for_write(tx, &src).await? {
            Some(so) => so,
            None => return Err(DavError::Status(StatusCode::NOT_FOUND)),
        };
        if src_so.is_null_resource {
            let mut res = Response::new(Body::empty());
            *res.status_mut() = StatusCode::METHOD_NOT_ALLOWED;
            Self::allow_header(&mut res, allowed_methods(Some(&src_so)));
            return Ok(res);
        }

        match self.stored_object_for_write(tx, &dst_parent).await? {
            Some(p) if p.is_folder => {}
            _ => return Err(DavError::Status(StatusCode::CONFLICT)),
        }

        // Overwrite: the destination goes first.
        let existed = self.stored_object_for_write(tx, &dst).await?.is_some();
        if existed {
            if !overwrite {
                return Err(DavError::Status(StatusCode::PRECONDITION_FAILED));
            }
            let mut errors = MultiError::new();
            if !self.delete_tree(tx, &dst, &mut errors).await {
                return errors.into_response(true);
            }
            self.locks.remove_locks(dst.as_str());
        }

        let mut errors = MultiError::new();
        self.copy_tree(tx, &src, &dst, shallow, &mut errors).await;
        if !errors.is_empty() {
            // a failure on the destination itself is a plain status.
            if let Some(status) = errors.get(dst.as_str()) {
                return Err(DavError::Status(status));
            }
            return errors.into_response(true);
        }

        if method == DavMethod::Move {
            debug!("MOVE {} -> {}: removing source", src, dst);
            if !self.delete_tree(tx, &src, &mut errors).await {
                return errors.into_response(true);
            }
            self.locks.remove_locks(src.as_str());
        }

        let mut res = Response::new(Body::empty());
        *res.status_mut() = if existed {
            StatusCode::NO_CONTENT
        } else {
            StatusCode::CREATED
        };
        res.headers_mut().typed_insert(headers::ContentLength(0));
        Ok(res)
    }
}
