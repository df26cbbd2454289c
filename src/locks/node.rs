//! Arena of lock nodes, one per path that is locked or lies on the
//! way from a locked path to the root.
//!
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use uuid::Uuid;

use super::{ActiveLock, LockDepth, LockError, LockKind};
use crate::davpath::parent_of;

pub(crate) type NodeId = u64;

#[derive(Debug)]
pub(crate) struct LockNode {
    pub id: NodeId,
    pub path: String,
    pub token: String,
    pub owners: Vec<String>,
    pub exclusive: bool,
    pub depth: LockDepth,
    pub expires_at: SystemTime,
    pub timeout: Duration,
    pub kind: LockKind,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
}

impl LockNode {
    // A node holds a lock while it has owners and has not expired.
    pub fn is_held(&self, now: SystemTime) -> bool {
        !self.owners.is_empty() && self.expires_at > now
    }

    pub fn snapshot(&self) -> ActiveLock {
        ActiveLock {
            token: self.token.clone(),
            path: self.path.clone(),
            owners: self.owners.clone(),
            exclusive: self.exclusive,
            depth: self.depth,
            kind: self.kind,
            timeout: self.timeout,
            expires_at: self.expires_at,
        }
    }
}

/// One lock tree, rooted at "/".
#[derive(Debug)]
pub(crate) struct LockTree {
    kind: LockKind,
    root: NodeId,
    next_id: NodeId,
    nodes: HashMap<NodeId, LockNode>,
    by_path: HashMap<String, NodeId>,
    by_token: HashMap<String, NodeId>,
    // lock operations since the last full cleanup.
    pub ops: usize,
}

// Number of path segments between `ancestor` and `path`.
fn distance(ancestor: &str, path: &str) -> usize {
    let count = |p: &str| p.split('/').filter(|s| !s.is_empty()).count();
    count(path).saturating_sub(count(ancestor))
}

impl LockTree {
    pub fn new(kind: LockKind) -> LockTree {
        let mut tree = LockTree {
            kind,
            root: 0,
            next_id: 0,
            nodes: HashMap::new(),
            by_path: HashMap::new(),
            by_token: HashMap::new(),
            ops: 0,
        };
        tree.root = tree.insert("/", None);
        tree
    }

    fn insert(&mut self, path: &str, parent: Option<NodeId>) -> NodeId {
        let id = self.next_id;
        self.next_id += 1;
        let token = Uuid::new_v4().to_string();
        let node = LockNode {
            id,
            path: path.to_string(),
            token: token.clone(),
            owners: Vec::new(),
            exclusive: false,
            depth: LockDepth::Infinity,
            expires_at: UNIX_EPOCH,
            timeout: Duration::ZERO,
            kind: self.kind,
            parent,
            children: Vec::new(),
        };
        self.nodes.insert(id, node);
        self.by_path.insert(path.to_string(), id);
        self.by_token.insert(token, id);
        if let Some(p) = parent.and_then(|p| self.nodes.get_mut(&p)) {
            p.children.push(id);
        }
        id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, id: NodeId) -> Option<&LockNode> {
        self.nodes.get(&id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut LockNode> {
        self.nodes.get_mut(&id)
    }

    pub fn id_by_path(&self, path: &str) -> Option<NodeId> {
        self.by_path.get(path).copied()
    }

    pub fn id_by_token(&self, token: &str) -> Option<NodeId> {
        self.by_token.get(token).copied()
    }

    /// Find or create the node for `path`, and every missing ancestor.
    pub fn ensure(&mut self, path: &str) -> NodeId {
        if let Some(id) = self.id_by_path(path) {
            return id;
        }
        // collect the missing part of the chain, deepest first.
        let mut missing = vec![path];
        let mut cur = path;
        let mut parent_id = self.root;
        while cur != "/" {
            cur = parent_of(cur);
            match self.id_by_path(cur) {
                Some(id) => {
                    parent_id = id;
                    break;
                }
                None => missing.push(cur),
            }
        }
        for p in missing.into_iter().rev() {
            parent_id = self.insert(p, Some(parent_id));
        }
        parent_id
    }

    /// Would granting a lock on node `id` conflict with a lock that is held.
    pub fn conflicts(
        &self,
        id: NodeId,
        exclusive: bool,
        depth: LockDepth,
        now: SystemTime,
    ) -> bool {
        let node = match self.node(id) {
            Some(n) => n,
            None => return false,
        };
        let clash = |other: &LockNode| other.is_held(now) && (other.exclusive || exclusive);

        if clash(node) {
            return true;
        }

        // ancestors, as far as their depth reaches down to us.
        let mut cur = node.parent;
        let mut dist = 1;
        while let Some(pid) = cur {
            let p = match self.node(pid) {
                Some(p) => p,
                None => break,
            };
            if p.depth.covers(dist) && clash(p) {
                return true;
            }
            cur = p.parent;
            dist += 1;
        }

        // descendants, as far as our depth reaches.
        let mut todo: Vec<(NodeId, usize)> = node.children.iter().map(|c| (*c, 1)).collect();
        while let Some((cid, dist)) = todo.pop() {
            if !depth.covers(dist) {
                continue;
            }
            if let Some(c) = self.node(cid) {
                if clash(c) {
                    return true;
                }
                todo.extend(c.children.iter().map(|cc| (*cc, dist + 1)));
            }
        }
        false
    }

    /// Record a granted lock on node `id`.
    pub fn grant(
        &mut self,
        id: NodeId,
        owner: &str,
        exclusive: bool,
        depth: LockDepth,
        timeout: Duration,
        now: SystemTime,
    ) -> Result<(), LockError> {
        {
            let node = self.node_mut(id).ok_or(LockError::NoSuchNode)?;
            if node.owners.iter().any(|o| o == owner) {
                return Err(LockError::DuplicateOwner(owner.to_string()));
            }
            let held = !node.owners.is_empty();
            if held {
                // a joining owner may widen the lock, never narrow it.
                node.exclusive |= exclusive;
                node.depth = node.depth.max(depth);
            } else {
                node.exclusive = exclusive;
                node.depth = depth;
            }
            node.owners.push(owner.to_string());
            if held && node.expires_at >= now + timeout {
                return Ok(());
            }
        }
        self.touch(id, timeout, now);
        Ok(())
    }

    /// Set a new timeout on node `id`, counting from `now`.
    pub fn touch(&mut self, id: NodeId, timeout: Duration, now: SystemTime) {
        let expires_at = now + timeout;
        let parent = match self.node_mut(id) {
            Some(node) => {
                node.expires_at = expires_at;
                node.timeout = timeout;
                node.parent
            }
            None => return,
        };
        // a parent that is only a waypoint inherits the expiry, so that it
        // is swept together with its last locked child.
        if let Some(p) = parent.and_then(|p| self.node_mut(p)) {
            if p.owners.is_empty() && p.expires_at < expires_at {
                p.expires_at = expires_at;
            }
        }
    }

    /// Remove `owner` from node `id`. Returns false if it was not an owner.
    pub fn remove_owner(&mut self, id: NodeId, owner: &str) -> bool {
        match self.node_mut(id) {
            Some(node) => {
                let before = node.owners.len();
                node.owners.retain(|o| o != owner);
                node.owners.len() != before
            }
            None => false,
        }
    }

    /// Drop node `id` if it has neither owners nor children.
    pub fn prune(&mut self, id: NodeId) -> bool {
        let removable = matches!(
            self.node(id),
            Some(n) if id != self.root && n.owners.is_empty() && n.children.is_empty()
        );
        if removable {
            self.detach(id);
        }
        removable
    }

    // Unregister a node and everything below it, and unlink it from its parent.
    fn detach(&mut self, id: NodeId) {
        if id == self.root {
            return;
        }
        let parent = self.node(id).and_then(|n| n.parent);
        if let Some(p) = parent.and_then(|p| self.node_mut(p)) {
            p.children.retain(|c| *c != id);
        }
        let mut todo = vec![id];
        while let Some(id) = todo.pop() {
            if let Some(node) = self.nodes.remove(&id) {
                self.by_path.remove(&node.path);
                self.by_token.remove(&node.token);
                todo.extend(node.children);
            }
        }
    }

    /// Expire every node whose time has passed. Owners of an expired
    /// node are dropped; the node goes away once it has no children.
    pub fn check_timeouts(&mut self, now: SystemTime) {
        let mut expired: Vec<(usize, NodeId)> = self
            .nodes
            .values()
            .filter(|n| n.expires_at <= now)
            .map(|n| (n.path.len(), n.id))
            .collect();
        // deepest first, so a waypoint can go right after its last child.
        expired.sort_by(|a, b| b.0.cmp(&a.0));
        for (_, id) in expired {
            if let Some(node) = self.node_mut(id) {
                if !node.owners.is_empty() {
                    trace!("LOCK: {:?} lock on {} expired", node.kind, node.path);
                    node.owners.clear();
                }
            }
            self.prune(id);
        }
    }

    /// Remove every node below `id` (inclusive) that holds no owner and
    /// whose children are all removable as well. Returns true if `id`
    /// itself was removable.
    pub fn clean_up(&mut self, id: NodeId) -> bool {
        let children = match self.node(id) {
            Some(n) => n.children.clone(),
            None => return true,
        };
        let mut all_gone = true;
        for c in children {
            if self.clean_up(c) {
                self.detach(c);
            } else {
                all_gone = false;
            }
        }
        all_gone && self.node(id).map(|n| n.owners.is_empty()).unwrap_or(true)
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Held locks on `path` and on ancestors whose depth reaches it.
    pub fn covering(&self, path: &str, now: SystemTime) -> Vec<ActiveLock> {
        let mut res = Vec::new();
        let mut cur = path;
        loop {
            if let Some(node) = self.id_by_path(cur).and_then(|id| self.node(id)) {
                if node.is_held(now) && node.depth.covers(distance(cur, path)) {
                    res.push(node.snapshot());
                }
            }
            if cur == "/" {
                break;
            }
            cur = parent_of(cur);
        }
        res
    }

    /// Held locks strictly below `path`.
    pub fn below(&self, path: &str, now: SystemTime) -> Vec<ActiveLock> {
        let mut res = Vec::new();
        let mut todo = match self.id_by_path(path).and_then(|id| self.node(id)) {
            Some(n) => n.children.clone(),
            None => return res,
        };
        while let Some(id) = todo.pop() {
            if let Some(n) = self.node(id) {
                if n.is_held(now) {
                    res.push(n.snapshot());
                }
                todo.extend(n.children.iter().copied());
            }
        }
        res
    }

    /// Unregister `path` and its whole subtree.
    pub fn remove_subtree(&mut self, path: &str) {
        if let Some(id) = self.id_by_path(path) {
            if id == self.root {
                let children = self.node(id).map(|n| n.children.clone()).unwrap_or_default();
                for c in children {
                    self.detach(c);
                }
                if let Some(root) = self.node_mut(id) {
                    root.owners.clear();
                }
            } else {
                self.detach(id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_is_built_to_the_root() {
        let mut tree = LockTree::new(LockKind::Write);
        let id = tree.ensure("/a/b/c");
        assert_eq!(tree.len(), 4);
        assert!(tree.id_by_path("/a").is_some());
        assert!(tree.id_by_path("/a/b").is_some());
        let node = tree.node(id).unwrap();
        let parent = tree.node(node.parent.unwrap()).unwrap();
        assert_eq!(parent.path, "/a/b");
        assert!(parent.children.contains(&id));
        assert_eq!(tree.ensure("/a/b/c"), id);
    }

    #[test]
    fn distance_counts_segments() {
        assert_eq!(distance("/", "/a/b"), 2);
        assert_eq!(distance("/a", "/a"), 0);
        assert_eq!(distance("/a", "/a/b"), 1);
    }

    #[test]
    fn clean_up_removes_ownerless_branches() {
        let now = SystemTime::now();
        let mut tree = LockTree::new(LockKind::Write);
        let keep = tree.ensure("/x/keep");
        tree.ensure("/x/drop/deep");
        tree.grant(keep, "me", true, LockDepth::Zero, Duration::from_secs(60), now)
            .unwrap();
        let root = tree.root();
        assert!(!tree.clean_up(root));
        assert!(tree.id_by_path("/x/drop").is_none());
        assert!(tree.id_by_path("/x/drop/deep").is_none());
        assert!(tree.id_by_path("/x/keep").is_some());
        assert_eq!(tree.len(), 3);
    }

    #[test]
    fn expired_owner_is_dropped() {
        let now = SystemTime::now();
        let mut tree = LockTree::new(LockKind::Write);
        let id = tree.ensure("/a/b");
        tree.grant(id, "me", true, LockDepth::Zero, Duration::from_secs(1), now)
            .unwrap();
        tree.check_timeouts(now);
        assert!(tree.node(id).unwrap().is_held(now));
        tree.check_timeouts(now + Duration::from_secs(2));
        assert!(tree.id_by_path("/a/b").is_none());
        assert!(tree.id_by_path("/a").is_none());
        assert_eq!(tree.len(), 1);
    }
}
