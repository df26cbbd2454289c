//
// Short-lived locks that a request holds on the paths it works on.
//
use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;
use uuid::Uuid;

use crate::errors::DavError;
use crate::locks::{LockDepth, LockRegistry, LockRequest};
use crate::util::DavMethod;
use crate::DavResult;

const FIRST_BACKOFF: Duration = Duration::from_millis(5);
const MAX_BACKOFF: Duration = Duration::from_millis(100);

/// Temporary locks of one request. They are released when this is dropped,
/// also when the handler returns early or panics.
pub(crate) struct TempLock {
    registry: Arc<LockRegistry>,
    owner: String,
    paths: Vec<String>,
}

impl Drop for TempLock {
    fn drop(&mut self) {
        for path in &self.paths {
            if !self.registry.unlock_by_path(path, &self.owner) {
                trace!("TEMPLOCK: {} on {} was already gone", self.owner, path);
            }
        }
    }
}

/// Paths a request wants to hold, in the order they are taken.
pub(crate) struct TempLockSet {
    exclusive: bool,
    reqs: Vec<LockRequest>,
}

impl TempLockSet {
    /// Exclusive for methods that change the store, shared otherwise.
    pub fn new(method: DavMethod) -> TempLockSet {
        TempLockSet {
            exclusive: method.is_mutating(),
            reqs: Vec::new(),
        }
    }

    /// Add a path with the default mode of the method.
    pub fn path(self, path: &str, depth: LockDepth) -> Self {
        let exclusive = self.exclusive;
        self.with(path, exclusive, depth)
    }

    /// Add a path with an explicit mode.
    pub fn with(self, path: &str, exclusive: bool, depth: LockDepth) -> Self {
        let mut this = self;
        this.reqs.push(LockRequest::new(path, exclusive, depth));
        this
    }
}

impl crate::DavHandler {
    /// Take all paths of `set` at once, waiting for other requests to let go.
    /// Gives up with 503 after the temporary lock timeout.
    pub(crate) async fn temp_lock(&self, set: TempLockSet) -> DavResult<TempLock> {
        let owner = format!("templock-{}", Uuid::new_v4());
        let timeout = self.temp_lock_timeout;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout + 1);
        let mut backoff = FIRST_BACKOFF;
        loop {
            match self.locks.lock_all(&set.reqs, &owner, timeout, true) {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => {
                    error!("TEMPLOCK: {}", e);
                    return Err(StatusCode::INTERNAL_SERVER_ERROR.into());
                }
            }
            if tokio::time::Instant::now() + backoff > deadline {
                debug!("TEMPLOCK: gave up waiting for {:?}", set.reqs);
                return Err(DavError::Status(StatusCode::SERVICE_UNAVAILABLE));
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
        let mut paths: Vec<String> = Vec::with_capacity(set.reqs.len());
        for r in set.reqs {
            if !paths.contains(&r.path) {
                paths.push(r.path);
            }
        }
        Ok(TempLock {
            registry: self.locks.clone(),
            owner,
            paths,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DavHandler, StoreBackend};

    #[tokio::test]
    async fn released_on_drop() {
        let dav = DavHandler::builder(StoreBackend::Mem).build();
        let set = TempLockSet::new(DavMethod::Delete)
            .path("/a", LockDepth::Infinity)
            .path("/", LockDepth::Zero);
        let guard = dav.temp_lock(set).await.unwrap();
        assert!(dav.locks.get_temp_by_path("/a").is_some());
        drop(guard);
        assert!(dav.locks.get_temp_by_path("/a").is_none());
    }

    #[tokio::test]
    async fn readers_share() {
        let dav = DavHandler::builder(StoreBackend::Mem).build();
        let r1 = dav
            .temp_lock(TempLockSet::new(DavMethod::Get).path("/a", LockDepth::Zero))
            .await
            .unwrap();
        let r2 = dav
            .temp_lock(TempLockSet::new(DavMethod::PropFind).path("/a", LockDepth::Zero))
            .await
            .unwrap();
        drop(r1);
        drop(r2);
    }

    #[tokio::test]
    async fn writer_waits_then_gives_up() {
        let dav = DavHandler::builder(StoreBackend::Mem)
            .temp_lock_timeout(1)
            .build();
        // a slow writer that holds /a well past the waiter's deadline.
        assert_eq!(
            dav.locks.lock("/a", "slow-writer", true, LockDepth::Zero, 60, true),
            Ok(true)
        );
        let started = tokio::time::Instant::now();
        let res = dav
            .temp_lock(TempLockSet::new(DavMethod::Put).path("/a", LockDepth::Zero))
            .await;
        match res {
            Err(e) => assert_eq!(e.statuscode(), StatusCode::SERVICE_UNAVAILABLE),
            Ok(_) => panic!("second writer got the lock"),
        }
        assert!(started.elapsed() >= Duration::from_millis(1500));
        assert!(dav.locks.get_temp_by_path("/a").is_some());
    }

    #[tokio::test]
    async fn writer_gets_lock_after_release() {
        let dav = DavHandler::builder(StoreBackend::Mem).build();
        let held = dav
            .temp_lock(TempLockSet::new(DavMethod::Put).path("/a", LockDepth::Zero))
            .await
            .unwrap();
        let dav2 = dav.clone();
        let waiter = tokio::spawn(async move {
            dav2.temp_lock(TempLockSet::new(DavMethod::Delete).path("/a", LockDepth::Infinity))
                .await
                .is_ok()
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        drop(held);
        assert!(waiter.await.unwrap());
    }
}
