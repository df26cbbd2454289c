use std::io::Cursor;
use std::time::SystemTime;

use headers::HeaderMapExt;
use http::{HeaderValue, Request, Response, StatusCode};
use xmltree::Element;

use crate::body::Body;
use crate::davhandler::templock::TempLockSet;
use crate::davheaders::{self, Depth};
use crate::davpath::DavPath;
use crate::errors::DavError;
use crate::locks::{ActiveLock, LockDepth, LockError};
use crate::multierror::{MultiError, XML_CONTENT_TYPE};
use crate::store::DavTransaction;
use crate::util::{systemtime_to_millis, DavMethod};
use crate::xmltree_ext::{self, ElementExt};
use crate::DavResult;

/// What a LOCK request body asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LockInfo {
    pub exclusive: bool,
    pub owner: Option<String>,
}

/// Parse a `lockinfo` document. Scope and type are required.
pub(crate) fn parse_lockinfo(body: &[u8]) -> DavResult<LockInfo> {
    let tree = Element::parse2(Cursor::new(body))?;
    if !tree.is_dav("lockinfo") {
        return Err(DavError::XmlParseError);
    }

    let exclusive = match tree
        .dav_child("lockscope")
        .and_then(|s| s.child_elems().next())
    {
        Some(e) if e.is_dav("exclusive") => true,
        Some(e) if e.is_dav("shared") => false,
        _ => return Err(DavError::XmlParseError),
    };

    if tree
        .dav_child("locktype")
        .and_then(|t| t.child_elems().next())
        .is_none()
    {
        return Err(DavError::XmlParseError);
    }

    let owner = tree
        .dav_child("owner")
        .map(|o| o.text_content())
        .filter(|o| !o.is_empty());

    Ok(LockInfo { exclusive, owner })
}

// Seconds left, rounded up.
fn timeout_secs(lock: &ActiveLock) -> u64 {
    let ms = lock.remaining().as_millis() as u64;
    (ms + 999) / 1000
}

fn scope_elem(exclusive: bool) -> Element {
    let mut scope = Element::new2("D:lockscope");
    scope.push_elem(Element::new2(if exclusive {
        "D:exclusive"
    } else {
        "D:shared"
    }));
    scope
}

fn type_elem(kind: &str) -> Element {
    let mut t = Element::new2("D:locktype");
    t.push_elem(Element::new2(format!("D:{}", kind).as_str()));
    t
}

fn owner_elem(owner: &str) -> Element {
    let mut o = Element::new2("D:owner");
    o.push_elem(Element::new2("D:href").text(owner));
    o
}

/// `activelock` element. With `owner` set only that owner is listed,
/// otherwise all owners of the lock.
pub(crate) fn activelock_elem(lock: &ActiveLock, owner: Option<&str>) -> Element {
    let mut actlock = Element::new2("D:activelock");
    actlock.push_elem(type_elem(&lock.kind.to_string()));
    actlock.push_elem(scope_elem(lock.exclusive));
    actlock.push_elem(Element::new2("D:depth").text(lock.depth.to_string()));
    match owner {
        Some(o) => actlock.push_elem(owner_elem(o)),
        None if lock.owners.is_empty() => actlock.push_elem(Element::new2("D:owner")),
        None => {
            for o in &lock.owners {
                actlock.push_elem(owner_elem(o));
            }
        }
    }
    let timeout = format!("Second-{}", timeout_secs(lock));
    actlock.push_elem(Element::new2("D:timeout").text(timeout));
    let mut tok = Element::new2("D:locktoken");
    tok.push_elem(Element::new2("D:href").text(davheaders::token_href(&lock.token)));
    actlock.push_elem(tok);
    actlock
}

/// `lockdiscovery` property: the lock on exactly this path, if any.
pub(crate) fn lockdiscovery_elem(lock: Option<&ActiveLock>) -> Element {
    let mut elem = Element::new2("D:lockdiscovery");
    if let Some(lock) = lock {
        elem.push_elem(activelock_elem(lock, None));
    }
    elem
}

/// `supportedlock` property: what could still be granted on this path.
pub(crate) fn supportedlock_elem(lock: Option<&ActiveLock>) -> Element {
    let mut elem = Element::new2("D:supportedlock");
    let entry = |exclusive: bool| {
        let mut e = Element::new2("D:lockentry");
        e.push_elem(scope_elem(exclusive));
        e.push_elem(type_elem("write"));
        e
    };
    match lock {
        None => {
            elem.push_elem(entry(true));
            elem.push_elem(entry(false));
        }
        Some(l) if l.is_shared() => elem.push_elem(entry(false)),
        Some(_) => {}
    }
    elem
}

// The lock discovery document, with the Lock-Token header.
fn lock_response(
    lock: &ActiveLock,
    owner: Option<&str>,
    status: StatusCode,
) -> DavResult<Response<Body>> {
    let mut prop = Element::new2("D:prop");
    let mut disc = Element::new2("D:lockdiscovery");
    disc.push_elem(activelock_elem(lock, owner));
    prop.push_elem(disc);

    let mut res = Response::new(Body::empty());
    *res.status_mut() = status;
    res.headers_mut()
        .typed_insert(davheaders::LockToken(lock.token.clone()));
    if status != StatusCode::NO_CONTENT {
        res.headers_mut()
            .insert("content-type", HeaderValue::from_static(XML_CONTENT_TYPE));
        *res.body_mut() = Body::from(xmltree_ext::write_document(&prop)?);
    }
    Ok(res)
}

// The LOCK failed: a multistatus with the path as 423.
fn lock_failed(path: &DavPath) -> DavResult<Response<Body>> {
    let mut errors = MultiError::new();
    errors.add(path, StatusCode::LOCKED);
    errors.into_response(true)
}

impl crate::DavHandler {
    pub(crate) async fn handle_lock(
        &self,
        req: &Request<()>,
        tx: &DavTransaction,
        body: &[u8],
    ) -> DavResult<Response<Body>> {
        let path = self.path(req)?;
        let parent = path.parent();

        let _guard = self
            .temp_lock(TempLockSet::new(DavMethod::Lock).path(path.as_str(), LockDepth::Zero))
            .await?;

        if !self.check_locks(req, &path) || !self.check_locks(req, &parent) {
            return Err(DavError::Status(StatusCode::LOCKED));
        }

        let timeout = davheaders::lock_timeout(req.headers());

        // refresh.
        if req.headers().contains_key("if") {
            let tokens = davheaders::if_tokens(req.headers());
            let token = match tokens.first() {
                Some(t) => t,
                None => return Err(DavError::Status(StatusCode::PRECONDITION_FAILED)),
            };
            return match self.locks.refresh(token, timeout) {
                Some(lock) => {
                    debug!("LOCK: refreshed {} on {} for {}s", lock.token, lock.path, timeout);
                    lock_response(&lock, None, StatusCode::OK)
                }
                None => Err(DavError::Status(StatusCode::PRECONDITION_FAILED)),
            };
        }

        let depth = req
            .headers()
            .typed_get::<Depth>()
            .map(LockDepth::from)
            .unwrap_or(LockDepth::Infinity);

        // Finder sends LOCK without a body.
        let user_agent = davheaders::user_agent(req.headers());
        let info = if user_agent.contains("Darwin") {
            LockInfo {
                exclusive: true,
                owner: Some(format!(
                    "{}{}",
                    user_agent,
                    systemtime_to_millis(SystemTime::now())
                )),
            }
        } else {
            if body.is_empty() {
                return Err(DavError::Status(StatusCode::BAD_REQUEST));
            }
            parse_lockinfo(body)?
        };
        let owner = match info.owner {
            Some(o) => o,
            None => match tx.principal() {
                Some(p) => p.to_string(),
                None => format!("anonymous-{}", uuid::Uuid::new_v4()),
            },
        };

        match self.stored_object_for_write(tx, &path).await? {
            Some(_) => {
                if let Some(lo) = self.locks.get_by_path(path.as_str()) {
                    if lo.exclusive {
                        return lock_failed(&path);
                    }
                }
                match self.try_lock(&path, &owner, info.exclusive, depth, timeout)? {
                    Some(lock) => lock_response(&lock, Some(&owner), StatusCode::OK),
                    None => lock_failed(&path),
                }
            }
            None => {
                self.null_resource_lock(
                    tx,
                    &path,
                    &owner,
                    info.exclusive,
                    depth,
                    timeout,
                    user_agent,
                )
                .await
            }
        }
    }

    // Take the persistent lock. `None` if it conflicts.
    fn try_lock(
        &self,
        path: &DavPath,
        owner: &str,
        exclusive: bool,
        depth: LockDepth,
        timeout: u64,
    ) -> DavResult<Option<ActiveLock>> {
        let granted = if exclusive {
            self.locks.exclusive_lock(path.as_str(), owner, depth, timeout)
        } else {
            self.locks.shared_lock(path.as_str(), owner, depth, timeout)
        };
        match granted {
            Ok(true) => match self.locks.get_by_path(path.as_str()) {
                Some(lock) => Ok(Some(lock)),
                None => Err(DavError::Status(StatusCode::INTERNAL_SERVER_ERROR)),
            },
            Ok(false) => Ok(None),
            Err(LockError::DuplicateOwner(o)) => {
                debug!("LOCK: {} already holds {}", o, path);
                Ok(None)
            }
            Err(e) => {
                error!("LOCK: {}: {}", path, e);
                Err(DavError::Status(StatusCode::INTERNAL_SERVER_ERROR))
            }
        }
    }

    // Lock a path that does not exist yet: create a placeholder resource
    // and lock that.
    #[allow(clippy::too_many_arguments)]
    async fn null_resource_lock(
        &self,
        tx: &DavTransaction,
        path: &DavPath,
        owner: &str,
        exclusive: bool,
        depth: LockDepth,
        timeout: u64,
        user_agent: &str,
    ) -> DavResult<Response<Body>> {
        let parent = path.parent();
        match self.stored_object_for_write(tx, &parent).await? {
            None => {
                debug!("LOCK: creating parent folder {}", parent);
                self.store.create_folder(tx, &parent).await?;
            }
            Some(p) if !p.is_folder => {
                return Err(DavError::Status(StatusCode::PRECONDITION_FAILED));
            }
            Some(_) => {}
        }

        self.store.create_resource(tx, path).await?;
        self.store.set_null_resource(tx, path, true).await?;

        match self.try_lock(path, owner, exclusive, depth, timeout) {
            Ok(Some(lock)) => {
                let status = if user_agent.contains("Transmit") {
                    StatusCode::NO_CONTENT
                } else {
                    StatusCode::CREATED
                };
                lock_response(&lock, Some(owner), status)
            }
            other => {
                self.store.remove_object(tx, path).await?;
                match other {
                    Err(e) => Err(e),
                    _ => lock_failed(path),
                }
            }
        }
    }

    pub(crate) async fn handle_unlock(
        &self,
        req: &Request<()>,
        tx: &DavTransaction,
    ) -> DavResult<Response<Body>> {
        let path = self.path(req)?;

        let _guard = self
            .temp_lock(TempLockSet::new(DavMethod::Unlock).path(path.as_str(), LockDepth::Zero))
            .await?;

        let token = match req.headers().typed_get::<davheaders::LockToken>() {
            Some(t) => t.0,
            None => return Err(DavError::Status(StatusCode::BAD_REQUEST)),
        };
        let lock = match self.locks.get_by_id(&token) {
            Some(lock) => lock,
            None => return Err(DavError::Status(StatusCode::BAD_REQUEST)),
        };

        // the token stands for the lock: every owner goes.
        self.locks.strip_owners(&token);
        if !self.locks.unlock(&token, None) {
            debug!("UNLOCK: failed on {}", lock.path);
            return Err(DavError::Status(StatusCode::FAILED_DEPENDENCY));
        }

        let lock_path = path.with_path(&lock.path);
        if let Some(so) = self.store.get_stored_object(tx, &lock_path).await? {
            if so.is_null_resource {
                debug!("UNLOCK: removing lock-null resource {}", lock_path);
                self.store.remove_object(tx, &lock_path).await?;
            }
        }

        let mut res = Response::new(Body::empty());
        *res.status_mut() = StatusCode::NO_CONTENT;
        Ok(res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lockinfo_exclusive_with_owner() {
        let body = br#"<?xml version="1.0" encoding="utf-8" ?>
            <D:lockinfo xmlns:D="DAV:">
              <D:lockscope><D:exclusive/></D:lockscope>
              <D:locktype><D:write/></D:locktype>
              <D:owner><D:href>http://example.org/~ejw/contact.html</D:href></D:owner>
            </D:lockinfo>"#;
        let info = parse_lockinfo(body).unwrap();
        assert!(info.exclusive);
        assert_eq!(info.owner.as_deref(), Some("http://example.org/~ejw/contact.html"));
    }

    #[test]
    fn lockinfo_shared_without_owner() {
        let body = br#"<lockinfo xmlns="DAV:"><lockscope><shared/></lockscope><locktype><write/></locktype></lockinfo>"#;
        let info = parse_lockinfo(body).unwrap();
        assert!(!info.exclusive);
        assert_eq!(info.owner, None);
    }

    #[test]
    fn lockinfo_needs_scope_and_type() {
        let no_scope = br#"<D:lockinfo xmlns:D="DAV:"><D:locktype><D:write/></D:locktype></D:lockinfo>"#;
        assert_eq!(
            parse_lockinfo(no_scope).unwrap_err().statuscode(),
            StatusCode::BAD_REQUEST
        );
        let no_type = br#"<D:lockinfo xmlns:D="DAV:"><D:lockscope><D:shared/></D:lockscope></D:lockinfo>"#;
        assert!(parse_lockinfo(no_type).is_err());
        assert!(parse_lockinfo(b"<D:lockinfo").is_err());
    }

    #[test]
    fn supportedlock_follows_lock_state() {
        let reg = crate::locks::LockRegistry::new();
        assert_eq!(supportedlock_elem(None).child_elems().count(), 2);

        reg.shared_lock("/s", "a", LockDepth::Zero, 60).unwrap();
        let shared = reg.get_by_path("/s").unwrap();
        assert_eq!(supportedlock_elem(Some(&shared)).child_elems().count(), 1);

        reg.exclusive_lock("/x", "a", LockDepth::Zero, 60).unwrap();
        let excl = reg.get_by_path("/x").unwrap();
        assert_eq!(supportedlock_elem(Some(&excl)).child_elems().count(), 0);
    }

    #[test]
    fn activelock_lists_all_owners() {
        let reg = crate::locks::LockRegistry::new();
        reg.shared_lock("/s", "alice", LockDepth::Infinity, 60).unwrap();
        reg.shared_lock("/s", "bob", LockDepth::Infinity, 60).unwrap();
        let lock = reg.get_by_path("/s").unwrap();
        let elem = activelock_elem(&lock, None);
        let owners: Vec<String> = elem
            .child_elems()
            .filter(|e| e.is_dav("owner"))
            .map(|e| e.text_content())
            .collect();
        assert_eq!(owners, vec!["alice".to_string(), "bob".to_string()]);
        let timeout = elem.dav_child("timeout").unwrap().text_content();
        assert_eq!(timeout, "Second-60");
        let depth = elem.dav_child("depth").unwrap().text_content();
        assert_eq!(depth, "Infinity");
    }
}
