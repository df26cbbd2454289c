//! Lock registry.
//!
//! The registry keeps two independent lock trees: one for the
//! persistent locks that clients take with LOCK, and one for the
//! short-lived locks the handlers take to serialize work on a path.
//!
//! Every operation runs under one mutex, so a conflict check and
//! the grant that follows it are atomic with respect to all other
//! lock operations. Expiry is lazy: a tree is swept at the start of
//! `lock`/`unlock`, and lookups never report an expired lock as held.
//!
use std::error::Error;
use std::fmt;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;

use crate::davheaders::Depth;

mod node;

use self::node::{LockTree, NodeId};

/// Lock timeout when the client does not ask for one, in seconds.
pub const DEFAULT_TIMEOUT: u64 = 3600;
/// Longest lock timeout handed out, in seconds.
pub const MAX_TIMEOUT: u64 = 604800;
/// Lifetime of a temporary lock, in seconds.
pub const TEMP_TIMEOUT: u64 = 10;
/// Lock operations between two full cleanup passes.
pub const CLEANUP_THRESHOLD: usize = 100_000;

/// How far down the tree a lock reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockDepth {
    Zero,
    One,
    Infinity,
}

impl LockDepth {
    /// Does a lock with this depth reach a path `distance` levels below it.
    pub fn covers(&self, distance: usize) -> bool {
        match self {
            LockDepth::Zero => distance == 0,
            LockDepth::One => distance <= 1,
            LockDepth::Infinity => true,
        }
    }
}

impl fmt::Display for LockDepth {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LockDepth::Zero => write!(f, "0"),
            LockDepth::One => write!(f, "1"),
            LockDepth::Infinity => write!(f, "Infinity"),
        }
    }
}

impl From<Depth> for LockDepth {
    fn from(d: Depth) -> LockDepth {
        match d {
            Depth::Zero => LockDepth::Zero,
            Depth::One => LockDepth::One,
            Depth::Infinity => LockDepth::Infinity,
        }
    }
}

/// Which tree a lock lives in. Persistent locks are reported as
/// `write` locks, temporary ones as `read` locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Write,
    Read,
}

impl fmt::Display for LockKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LockKind::Write => write!(f, "write"),
            LockKind::Read => write!(f, "read"),
        }
    }
}

/// A snapshot of a held lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveLock {
    pub token: String,
    pub path: String,
    pub owners: Vec<String>,
    pub exclusive: bool,
    pub depth: LockDepth,
    pub kind: LockKind,
    pub timeout: Duration,
    pub expires_at: SystemTime,
}

impl ActiveLock {
    pub fn is_shared(&self) -> bool {
        !self.exclusive
    }

    /// Time left before the lock expires.
    pub fn remaining(&self) -> Duration {
        self.expires_at
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO)
    }
}

/// Internal failure of the registry. Conflicts are not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// The owner already holds a lock on this node.
    DuplicateOwner(String),
    /// The node went away while it was being locked.
    NoSuchNode,
}

impl Error for LockError {}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LockError::DuplicateOwner(o) => write!(f, "owner {} already registered", o),
            LockError::NoSuchNode => write!(f, "lock node vanished"),
        }
    }
}

/// One path of a multi-path lock request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRequest {
    pub path: String,
    pub exclusive: bool,
    pub depth: LockDepth,
}

impl LockRequest {
    pub fn new(path: impl Into<String>, exclusive: bool, depth: LockDepth) -> LockRequest {
        LockRequest {
            path: path.into(),
            exclusive,
            depth,
        }
    }
}

#[derive(Debug)]
struct Trees {
    persistent: LockTree,
    temporary: LockTree,
}

impl Trees {
    fn get(&mut self, temporary: bool) -> &mut LockTree {
        if temporary {
            &mut self.temporary
        } else {
            &mut self.persistent
        }
    }
}

/// Registry of persistent and temporary locks.
#[derive(Debug)]
pub struct LockRegistry {
    trees: Mutex<Trees>,
    cleanup_threshold: usize,
}

impl Default for LockRegistry {
    fn default() -> Self {
        LockRegistry::new()
    }
}

impl LockRegistry {
    /// Create an empty registry.
    pub fn new() -> LockRegistry {
        LockRegistry::with_cleanup_threshold(CLEANUP_THRESHOLD)
    }

    /// Create an empty registry that runs a full cleanup pass after
    /// `threshold` lock operations.
    pub fn with_cleanup_threshold(threshold: usize) -> LockRegistry {
        LockRegistry {
            trees: Mutex::new(Trees {
                persistent: LockTree::new(LockKind::Write),
                temporary: LockTree::new(LockKind::Read),
            }),
            cleanup_threshold: threshold,
        }
    }

    /// Try to lock `path` for `owner`.
    ///
    /// Returns `Ok(false)` if a conflicting lock is held on the path,
    /// on an ancestor whose depth reaches it, or on a descendant within
    /// `depth`.
    pub fn lock(
        &self,
        path: &str,
        owner: &str,
        exclusive: bool,
        depth: LockDepth,
        timeout: u64,
        temporary: bool,
    ) -> Result<bool, LockError> {
        let req = LockRequest::new(path, exclusive, depth);
        self.lock_all(std::slice::from_ref(&req), owner, timeout, temporary)
    }

    /// Lock several paths for `owner`, all or nothing.
    ///
    /// A path that appears more than once is locked once, with the
    /// strongest scope asked for.
    pub fn lock_all(
        &self,
        reqs: &[LockRequest],
        owner: &str,
        timeout: u64,
        temporary: bool,
    ) -> Result<bool, LockError> {
        let now = SystemTime::now();
        let timeout = Duration::from_secs(timeout);
        let mut trees = self.trees.lock();
        let tree = trees.get(temporary);
        tree.check_timeouts(now);
        tree.ops += reqs.len();

        let mut merged: Vec<LockRequest> = Vec::with_capacity(reqs.len());
        for r in reqs {
            match merged.iter_mut().find(|m| m.path == r.path) {
                Some(m) => {
                    m.exclusive |= r.exclusive;
                    m.depth = m.depth.max(r.depth);
                }
                None => merged.push(r.clone()),
            }
        }

        let mut granted: Vec<NodeId> = Vec::new();
        for r in &merged {
            let id = tree.ensure(&r.path);
            let result = if tree.conflicts(id, r.exclusive, r.depth, now) {
                Ok(false)
            } else {
                tree.grant(id, owner, r.exclusive, r.depth, timeout, now)
                    .map(|_| true)
            };
            match result {
                Ok(true) => granted.push(id),
                other => {
                    trace!(
                        "LOCK: {} {} lock on {} for {} refused",
                        if r.exclusive { "exclusive" } else { "shared" },
                        if temporary { "temporary" } else { "persistent" },
                        r.path,
                        owner
                    );
                    tree.prune(id);
                    for g in granted {
                        tree.remove_owner(g, owner);
                        tree.prune(g);
                    }
                    return other;
                }
            }
        }
        for r in &merged {
            trace!(
                "LOCK: {} {} lock on {} (depth {}) for {}",
                if r.exclusive { "exclusive" } else { "shared" },
                if temporary { "temporary" } else { "persistent" },
                r.path,
                r.depth,
                owner
            );
        }
        Ok(true)
    }

    /// Persistent exclusive lock.
    pub fn exclusive_lock(
        &self,
        path: &str,
        owner: &str,
        depth: LockDepth,
        timeout: u64,
    ) -> Result<bool, LockError> {
        self.lock(path, owner, true, depth, timeout, false)
    }

    /// Persistent shared lock.
    pub fn shared_lock(
        &self,
        path: &str,
        owner: &str,
        depth: LockDepth,
        timeout: u64,
    ) -> Result<bool, LockError> {
        self.lock(path, owner, false, depth, timeout, false)
    }

    /// Remove `owner` from the lock identified by `token`.
    ///
    /// With `owner` set to `None` no owner is removed, but the node is
    /// released if nothing holds it anymore. Returns false if there is
    /// no lock with this token, or `owner` did not hold it.
    pub fn unlock(&self, token: &str, owner: Option<&str>) -> bool {
        let now = SystemTime::now();
        let mut trees = self.trees.lock();
        let temporary = trees.persistent.id_by_token(token).is_none();
        let tree = trees.get(temporary);
        let id = match tree.id_by_token(token) {
            Some(id) => id,
            None => return false,
        };
        let done = match owner {
            Some(owner) => tree.remove_owner(id, owner),
            None => true,
        };
        if done {
            tree.prune(id);
        }
        self.maybe_clean_up(tree);
        tree.check_timeouts(now);
        done
    }

    /// Release the temporary lock that `owner` holds on `path`.
    pub fn unlock_by_path(&self, path: &str, owner: &str) -> bool {
        let now = SystemTime::now();
        let mut trees = self.trees.lock();
        let tree = trees.get(true);
        let done = match tree.id_by_path(path) {
            Some(id) => {
                let done = tree.remove_owner(id, owner);
                tree.prune(id);
                done
            }
            None => false,
        };
        self.maybe_clean_up(tree);
        tree.check_timeouts(now);
        done
    }

    fn maybe_clean_up(&self, tree: &mut LockTree) {
        if tree.ops > self.cleanup_threshold {
            let root = tree.root();
            tree.clean_up(root);
            tree.ops = 0;
        }
    }

    /// Drop the expired locks of one tree.
    pub fn check_timeouts(&self, temporary: bool) {
        let now = SystemTime::now();
        self.trees.lock().get(temporary).check_timeouts(now);
    }

    /// Full cleanup pass over one tree.
    pub fn clean_up(&self, temporary: bool) {
        let mut trees = self.trees.lock();
        let tree = trees.get(temporary);
        let root = tree.root();
        tree.clean_up(root);
        tree.ops = 0;
    }

    fn get(&self, temporary: bool, token: Option<&str>, path: Option<&str>) -> Option<ActiveLock> {
        let now = SystemTime::now();
        let mut trees = self.trees.lock();
        let tree = trees.get(temporary);
        let id = match (token, path) {
            (Some(t), _) => tree.id_by_token(t)?,
            (None, Some(p)) => tree.id_by_path(p)?,
            (None, None) => return None,
        };
        tree.node(id)
            .filter(|n| n.is_held(now))
            .map(|n| n.snapshot())
    }

    /// The persistent lock with this token.
    pub fn get_by_id(&self, token: &str) -> Option<ActiveLock> {
        self.get(false, Some(token), None)
    }

    /// The persistent lock on exactly this path.
    pub fn get_by_path(&self, path: &str) -> Option<ActiveLock> {
        self.get(false, None, Some(path))
    }

    /// The temporary lock with this token.
    pub fn get_temp_by_id(&self, token: &str) -> Option<ActiveLock> {
        self.get(true, Some(token), None)
    }

    /// The temporary lock on exactly this path.
    pub fn get_temp_by_path(&self, path: &str) -> Option<ActiveLock> {
        self.get(true, None, Some(path))
    }

    /// Give the persistent lock with this token a new timeout.
    pub fn refresh(&self, token: &str, timeout: u64) -> Option<ActiveLock> {
        let now = SystemTime::now();
        let mut trees = self.trees.lock();
        let tree = trees.get(false);
        let id = tree.id_by_token(token)?;
        if !tree.node(id)?.is_held(now) {
            return None;
        }
        tree.touch(id, Duration::from_secs(timeout), now);
        tree.node(id).map(|n| n.snapshot())
    }

    /// Remove every owner of the persistent lock with this token.
    /// The node itself stays until it is unlocked or cleaned up.
    pub fn strip_owners(&self, token: &str) -> Vec<String> {
        let mut trees = self.trees.lock();
        let tree = trees.get(false);
        match tree.id_by_token(token).and_then(|id| tree.node_mut(id)) {
            Some(node) => std::mem::take(&mut node.owners),
            None => Vec::new(),
        }
    }

    /// Persistent locks that apply to `path`: the lock on the path
    /// itself and the locks on ancestors whose depth reaches it.
    pub fn covering(&self, path: &str) -> Vec<ActiveLock> {
        let now = SystemTime::now();
        self.trees.lock().persistent.covering(path, now)
    }

    /// Persistent locks held strictly below `path`.
    pub fn below(&self, path: &str) -> Vec<ActiveLock> {
        let now = SystemTime::now();
        self.trees.lock().persistent.below(path, now)
    }

    /// Forget all persistent locks on and below `path`.
    pub fn remove_locks(&self, path: &str) {
        debug!("LOCK: removing locks on and below {}", path);
        self.trees.lock().persistent.remove_subtree(path);
    }

    /// Number of nodes in one of the trees, including waypoints and the root.
    pub fn node_count(&self, temporary: bool) -> usize {
        self.trees.lock().get(temporary).len()
    }
}
