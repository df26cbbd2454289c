//! Simple in-memory store.
//!
//! This implementation has state, so if you create a
//! new instance in a handler(), it will be empty every time.
//!
//! This means you have to create the instance once, and use
//! `StoreBackend::Custom` with a clone of the `Arc` if you want to
//! look at its contents from outside the handler.
//!
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::{Bytes, BytesMut};
use futures_util::{stream, FutureExt, StreamExt};
use parking_lot::Mutex;

use crate::davpath::{parent_of, DavPath};
use crate::store::*;

#[derive(Debug, Clone)]
struct MemNode {
    is_folder: bool,
    is_null: bool,
    created: SystemTime,
    modified: SystemTime,
    data: Bytes,
    mime_type: Option<String>,
}

impl MemNode {
    fn new(is_folder: bool) -> MemNode {
        let now = SystemTime::now();
        MemNode {
            is_folder,
            is_null: false,
            created: now,
            modified: now,
            data: Bytes::new(),
            mime_type: None,
        }
    }

    fn stored_object(&self) -> StoredObject {
        StoredObject {
            is_folder: self.is_folder,
            is_null_resource: self.is_null,
            creation_date: self.created,
            last_modified: self.modified,
            resource_length: self.data.len() as u64,
            mime_type: self.mime_type.clone(),
        }
    }
}

/// Ephemeral in-memory store.
#[derive(Debug)]
pub struct MemStore {
    tree: Mutex<BTreeMap<String, MemNode>>,
}

// "/a/b" -> "/a/b/", "/" stays "/".
fn child_prefix(path: &str) -> String {
    if path == "/" {
        path.to_string()
    } else {
        format!("{}/", path)
    }
}

impl MemStore {
    /// Create a new, empty, MemStore.
    pub fn new() -> Arc<MemStore> {
        let mut tree = BTreeMap::new();
        tree.insert("/".to_string(), MemNode::new(true));
        Arc::new(MemStore {
            tree: Mutex::new(tree),
        })
    }

    fn create(&self, path: &DavPath, is_folder: bool) -> StoreResult<()> {
        let mut tree = self.tree.lock();
        let p = path.as_str();
        if tree.contains_key(p) {
            return Err(StoreError::ObjectAlreadyExists);
        }
        match tree.get(parent_of(p)) {
            Some(parent) if parent.is_folder => {}
            Some(_) => return Err(StoreError::GeneralFailure),
            None => return Err(StoreError::ObjectNotFound),
        }
        tree.insert(p.to_string(), MemNode::new(is_folder));
        Ok(())
    }

    fn children(tree: &BTreeMap<String, MemNode>, path: &str) -> Vec<String> {
        let prefix = child_prefix(path);
        tree.range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, _)| &k[prefix.len()..])
            .filter(|name| !name.is_empty() && !name.contains('/'))
            .map(|name| name.to_string())
            .collect()
    }
}

impl DavStore for MemStore {
    fn create_folder<'a>(&'a self, _tx: &'a DavTransaction, path: &'a DavPath) -> StoreFuture<'a, ()> {
        async move {
            trace!("STORE: create_folder {:?}", path);
            self.create(path, true)
        }
        .boxed()
    }

    fn create_resource<'a>(
        &'a self,
        _tx: &'a DavTransaction,
        path: &'a DavPath,
    ) -> StoreFuture<'a, ()> {
        async move {
            trace!("STORE: create_resource {:?}", path);
            self.create(path, false)
        }
        .boxed()
    }

    fn get_resource_content<'a>(
        &'a self,
        _tx: &'a DavTransaction,
        path: &'a DavPath,
    ) -> StoreFuture<'a, ContentStream> {
        async move {
            let tree = self.tree.lock();
            match tree.get(path.as_str()) {
                Some(node) if !node.is_folder => {
                    let data = node.data.clone();
                    Ok(stream::once(async move { Ok(data) }).boxed())
                }
                Some(_) => Err(StoreError::GeneralFailure),
                None => Err(StoreError::ObjectNotFound),
            }
        }
        .boxed()
    }

    fn set_resource_content<'a>(
        &'a self,
        _tx: &'a DavTransaction,
        path: &'a DavPath,
        mut content: ContentStream,
        content_type: Option<&'a str>,
        _encoding: Option<&'a str>,
    ) -> StoreFuture<'a, u64> {
        async move {
            trace!("STORE: set_resource_content {:?}", path);
            let mut buf = BytesMut::new();
            while let Some(chunk) = content.next().await {
                buf.extend_from_slice(&chunk?);
            }
            let mut tree = self.tree.lock();
            let node = match tree.get_mut(path.as_str()) {
                Some(node) if !node.is_folder => node,
                Some(_) => return Err(StoreError::GeneralFailure),
                None => return Err(StoreError::ObjectNotFound),
            };
            node.data = buf.freeze();
            node.modified = SystemTime::now();
            if let Some(ct) = content_type {
                node.mime_type = Some(ct.to_string());
            }
            Ok(node.data.len() as u64)
        }
        .boxed()
    }

    fn get_children_names<'a>(
        &'a self,
        _tx: &'a DavTransaction,
        path: &'a DavPath,
    ) -> StoreFuture<'a, Option<Vec<String>>> {
        async move {
            let tree = self.tree.lock();
            match tree.get(path.as_str()) {
                Some(node) if node.is_folder => Ok(Some(MemStore::children(&tree, path.as_str()))),
                Some(_) => Ok(None),
                None => Err(StoreError::ObjectNotFound),
            }
        }
        .boxed()
    }

    fn get_resource_length<'a>(
        &'a self,
        _tx: &'a DavTransaction,
        path: &'a DavPath,
    ) -> StoreFuture<'a, u64> {
        async move {
            let tree = self.tree.lock();
            tree.get(path.as_str())
                .map(|node| node.data.len() as u64)
                .ok_or(StoreError::ObjectNotFound)
        }
        .boxed()
    }

    fn remove_object<'a>(&'a self, _tx: &'a DavTransaction, path: &'a DavPath) -> StoreFuture<'a, ()> {
        async move {
            trace!("STORE: remove_object {:?}", path);
            if path.is_root() {
                return Err(StoreError::AccessDenied);
            }
            let mut tree = self.tree.lock();
            let is_folder = match tree.get(path.as_str()) {
                Some(node) => node.is_folder,
                None => return Err(StoreError::ObjectNotFound),
            };
            if is_folder && !MemStore::children(&tree, path.as_str()).is_empty() {
                return Err(StoreError::GeneralFailure);
            }
            tree.remove(path.as_str());
            Ok(())
        }
        .boxed()
    }

    fn get_stored_object<'a>(
        &'a self,
        _tx: &'a DavTransaction,
        path: &'a DavPath,
    ) -> StoreFuture<'a, Option<StoredObject>> {
        async move {
            let tree = self.tree.lock();
            Ok(tree.get(path.as_str()).map(|node| node.stored_object()))
        }
        .boxed()
    }

    fn set_null_resource<'a>(
        &'a self,
        _tx: &'a DavTransaction,
        path: &'a DavPath,
        null: bool,
    ) -> StoreFuture<'a, ()> {
        async move {
            let mut tree = self.tree.lock();
            match tree.get_mut(path.as_str()) {
                Some(node) => {
                    node.is_null = null;
                    Ok(())
                }
                None => Err(StoreError::ObjectNotFound),
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> DavPath {
        DavPath::new(s).unwrap()
    }

    fn content(s: &'static str) -> ContentStream {
        stream::once(async move { Ok(Bytes::from_static(s.as_bytes())) }).boxed()
    }

    #[tokio::test]
    async fn create_and_list() {
        let store = MemStore::new();
        let tx = store.begin(None).await.unwrap();
        store.create_folder(&tx, &p("/b")).await.unwrap();
        store.create_folder(&tx, &p("/a")).await.unwrap();
        store.create_resource(&tx, &p("/a/x.txt")).await.unwrap();
        store.create_resource(&tx, &p("/a/sub")).await.unwrap();

        let names = store.get_children_names(&tx, &p("/")).await.unwrap();
        assert_eq!(names, Some(vec!["a".to_string(), "b".to_string()]));
        let names = store.get_children_names(&tx, &p("/a")).await.unwrap();
        assert_eq!(names, Some(vec!["sub".to_string(), "x.txt".to_string()]));
        let names = store.get_children_names(&tx, &p("/a/x.txt")).await.unwrap();
        assert_eq!(names, None);
    }

    #[tokio::test]
    async fn parent_must_be_a_folder() {
        let store = MemStore::new();
        let tx = store.begin(None).await.unwrap();
        assert_eq!(
            store.create_resource(&tx, &p("/no/such")).await,
            Err(StoreError::ObjectNotFound)
        );
        store.create_resource(&tx, &p("/f")).await.unwrap();
        assert_eq!(
            store.create_folder(&tx, &p("/f/g")).await,
            Err(StoreError::GeneralFailure)
        );
        assert_eq!(
            store.create_resource(&tx, &p("/f")).await,
            Err(StoreError::ObjectAlreadyExists)
        );
    }

    #[tokio::test]
    async fn content_roundtrip() {
        let store = MemStore::new();
        let tx = store.begin(None).await.unwrap();
        store.create_resource(&tx, &p("/f")).await.unwrap();
        let len = store
            .set_resource_content(&tx, &p("/f"), content("hello"), Some("text/plain"), None)
            .await
            .unwrap();
        assert_eq!(len, 5);
        assert_eq!(store.get_resource_length(&tx, &p("/f")).await.unwrap(), 5);

        let body: Vec<_> = store
            .get_resource_content(&tx, &p("/f"))
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(&body[0].as_ref().unwrap()[..], b"hello");

        let obj = store.get_stored_object(&tx, &p("/f")).await.unwrap().unwrap();
        assert_eq!(obj.resource_length, 5);
        assert_eq!(obj.mime_type.as_deref(), Some("text/plain"));
    }

    #[tokio::test]
    async fn remove_needs_empty_folder() {
        let store = MemStore::new();
        let tx = store.begin(None).await.unwrap();
        store.create_folder(&tx, &p("/d")).await.unwrap();
        store.create_resource(&tx, &p("/d/f")).await.unwrap();
        assert_eq!(
            store.remove_object(&tx, &p("/d")).await,
            Err(StoreError::GeneralFailure)
        );
        store.remove_object(&tx, &p("/d/f")).await.unwrap();
        store.remove_object(&tx, &p("/d")).await.unwrap();
        assert!(store.get_stored_object(&tx, &p("/d")).await.unwrap().is_none());
        assert_eq!(
            store.remove_object(&tx, &p("/d")).await,
            Err(StoreError::ObjectNotFound)
        );
    }

    #[tokio::test]
    async fn null_resource_flag() {
        let store = MemStore::new();
        let tx = store.begin(None).await.unwrap();
        store.create_resource(&tx, &p("/n")).await.unwrap();
        store.set_null_resource(&tx, &p("/n"), true).await.unwrap();
        let obj = store.get_stored_object(&tx, &p("/n")).await.unwrap().unwrap();
        assert!(obj.is_null_resource);
        store.set_null_resource(&tx, &p("/n"), false).await.unwrap();
        let obj = store.get_stored_object(&tx, &p("/n")).await.unwrap().unwrap();
        assert!(!obj.is_null_resource);
    }
}
