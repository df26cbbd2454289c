use headers::HeaderMapExt;
use http::{Request, Response, StatusCode};

use crate::body::Body;
use crate::davhandler::handle_options::allowed_methods;
use crate::davhandler::templock::TempLockSet;
use crate::davheaders;
use crate::davpath::DavPath;
use crate::errors::DavError;
use crate::locks::LockDepth;
use crate::multierror::MultiError;
use crate::store::{ContentStream, DavTransaction};
use crate::util::DavMethod;
use crate::DavResult;

// Status of a successful PUT, after the client workarounds.
fn put_status(user_agent: &str, created: bool) -> StatusCode {
    if user_agent.contains("Transmit") {
        StatusCode::NO_CONTENT
    } else if user_agent.contains("WebDAVFS") || created {
        StatusCode::CREATED
    } else {
        StatusCode::NO_CONTENT
    }
}

impl crate::DavHandler {
    pub(crate) async fn handle_put(
        &self,
        req: &Request<()>,
        tx: &DavTransaction,
        body: ContentStream,
    ) -> DavResult<Response<Body>> {
        let path = self.path(req)?;
        if path.is_root() {
            return Err(DavError::Status(StatusCode::METHOD_NOT_ALLOWED));
        }
        let parent = path.parent();

        let _guard = self
            .temp_lock(
                TempLockSet::new(DavMethod::Put)
                    .path(path.as_str(), LockDepth::Zero)
                    .path(parent.as_str(), LockDepth::Zero),
            )
            .await?;

        if !self.check_locks(req, &parent) {
            return Err(DavError::Status(StatusCode::LOCKED));
        }

        match self.stored_object_for_write(tx, &parent).await? {
            Some(p) if !p.is_folder => {
                debug!("PUT {}: parent is a resource", path);
                return Err(DavError::Status(StatusCode::FORBIDDEN));
            }
            Some(_) => {}
            None if self.lazy_folder_creation_on_put => {
                self.create_folders(tx, &parent).await?;
            }
            None => {
                let mut errors = MultiError::new();
                errors.add(&parent, StatusCode::NOT_FOUND);
                return errors.into_response(false);
            }
        }

        let created = match self.stored_object_for_write(tx, &path).await? {
            None => {
                if !self.check_locks(req, &path) {
                    return Err(DavError::Status(StatusCode::LOCKED));
                }
                self.store.create_resource(tx, &path).await?;
                true
            }
            Some(so) if so.is_null_resource => {
                self.promote_null_resource(req, tx, &path, false, StatusCode::NOT_FOUND)
                    .await?;
                true
            }
            Some(so) if so.is_folder => {
                let mut res = Response::new(Body::empty());
                *res.status_mut() = StatusCode::METHOD_NOT_ALLOWED;
                Self::allow_header(&mut res, allowed_methods(Some(&so)));
                return Ok(res);
            }
            Some(_) => {
                if !self.check_locks(req, &path) {
                    return Err(DavError::Status(StatusCode::LOCKED));
                }
                false
            }
        };

        let content_type = req
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok());
        let encoding = req
            .headers()
            .get("content-encoding")
            .and_then(|v| v.to_str().ok());
        let len = self
            .store
            .set_resource_content(tx, &path, body, content_type, encoding)
            .await?;
        debug!("PUT {}: stored {} bytes", path, len);

        let mut res = Response::new(Body::empty());
        *res.status_mut() = put_status(davheaders::user_agent(req.headers()), created);
        res.headers_mut().typed_insert(headers::ContentLength(0));
        Ok(res)
    }

    // Turn the lock-null placeholder at `path` into a real resource or
    // folder. The request must present the placeholder's lock token,
    // whose lock is released afterwards. A wrong token fails with `mismatch`.
    pub(crate) async fn promote_null_resource(
        &self,
        req: &Request<()>,
        tx: &DavTransaction,
        path: &DavPath,
        folder: bool,
        mismatch: StatusCode,
    ) -> DavResult<()> {
        let lock = match self.locks.get_by_path(path.as_str()) {
            Some(lock) => lock,
            None => return Err(DavError::Status(StatusCode::INTERNAL_SERVER_ERROR)),
        };
        let tokens = davheaders::if_tokens(req.headers());
        let token = match tokens.first() {
            Some(t) => t,
            None => return Err(DavError::Status(StatusCode::BAD_REQUEST)),
        };
        if *token != lock.token {
            debug!("{}: token {} does not match the placeholder", path, token);
            return Err(DavError::Status(mismatch));
        }
        if folder {
            self.store.remove_object(tx, path).await?;
            self.store.create_folder(tx, path).await?;
        } else {
            self.store.set_null_resource(tx, path, false).await?;
        }
        self.locks.strip_owners(&lock.token);
        if !self.locks.unlock(&lock.token, None) {
            return Err(DavError::Status(StatusCode::INTERNAL_SERVER_ERROR));
        }
        Ok(())
    }

    // mkdir -p
    async fn create_folders(&self, tx: &DavTransaction, path: &DavPath) -> DavResult<()> {
        let mut missing = Vec::new();
        let mut cur = path.clone();
        while !cur.is_root() {
            match self.stored_object_for_write(tx, &cur).await? {
                Some(so) if so.is_folder => break,
                Some(_) => return Err(DavError::Status(StatusCode::FORBIDDEN)),
                None => {
                    let parent = cur.parent();
                    missing.push(cur);
                    cur = parent;
                }
            }
        }
        for dir in missing.iter().rev() {
            debug!("PUT: creating folder {}", dir);
            self.store.create_folder(tx, dir).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_workarounds() {
        assert_eq!(put_status("", true), StatusCode::CREATED);
        assert_eq!(put_status("", false), StatusCode::NO_CONTENT);
        assert_eq!(put_status("WebDAVFS/1.4", false), StatusCode::CREATED);
        assert_eq!(put_status("Transmit/4 WebDAVFS/1.4", true), StatusCode::NO_CONTENT);
    }
}
