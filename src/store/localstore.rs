//! Local filesystem store.
//!
//! Serves a directory on the local filesystem. The lock-null flag of
//! placeholders has no on-disk representation, so it is kept in memory:
//! a placeholder is an empty file that the store remembers as "null".
//!
use std::collections::HashSet;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use async_stream::stream;
use bytes::BytesMut;
use futures_util::{FutureExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::davpath::DavPath;
use crate::store::*;

const BUF_SIZE: usize = 65536;

/// Local Filesystem store.
#[derive(Debug)]
pub struct LocalStore {
    basedir: PathBuf,
    public: bool,
    nulls: Mutex<HashSet<String>>,
}

impl LocalStore {
    /// Create a new LocalStore, serving "base".
    ///
    /// If "public" is set to true, all files and directories created will be
    /// publically readable (mode 644/755), otherwise they will be private
    /// (mode 600/700). Umask still overrides this.
    pub fn new(base: impl Into<PathBuf>, public: bool) -> Arc<LocalStore> {
        Arc::new(LocalStore {
            basedir: base.into(),
            public,
            nulls: Mutex::new(HashSet::new()),
        })
    }

    fn abs_path(&self, path: &DavPath) -> PathBuf {
        let mut pathbuf = self.basedir.clone();
        pathbuf.push(path.as_rel_path());
        pathbuf
    }

    fn is_null(&self, path: &DavPath) -> bool {
        self.nulls.lock().contains(path.as_str())
    }

    // parent has to be an existing directory.
    async fn check_parent(&self, path: &DavPath) -> StoreResult<()> {
        let meta = tokio::fs::metadata(self.abs_path(&path.parent())).await?;
        if meta.is_dir() {
            Ok(())
        } else {
            Err(StoreError::GeneralFailure)
        }
    }
}

impl DavStore for LocalStore {
    fn create_folder<'a>(&'a self, _tx: &'a DavTransaction, path: &'a DavPath) -> StoreFuture<'a, ()> {
        async move {
            trace!("STORE: create_folder {:?}", path);
            self.check_parent(path).await?;
            #[allow(unused_mut)]
            let mut dir = tokio::fs::DirBuilder::new();
            #[cfg(unix)]
            dir.mode(if self.public { 0o755 } else { 0o700 });
            Ok(dir.create(self.abs_path(path)).await?)
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
            self.check_parent(path).await?;
            let mut opt = tokio::fs::OpenOptions::new();
            opt.write(true).create_new(true);
            #[cfg(unix)]
            if self.public {
                opt.mode(0o644);
            } else {
                opt.mode(0o600);
            }
            opt.open(self.abs_path(path)).await?;
            Ok(())
        }
        .boxed()
    }

    fn get_resource_content<'a>(
        &'a self,
        _tx: &'a DavTransaction,
        path: &'a DavPath,
    ) -> StoreFuture<'a, ContentStream> {
        async move {
            trace!("STORE: get_resource_content {:?}", path);
            let mut file = tokio::fs::File::open(self.abs_path(path)).await?;
            if file.metadata().await?.is_dir() {
                return Err(StoreError::GeneralFailure);
            }
            Ok(Box::pin(stream! {
                loop {
                    let mut buf = BytesMut::with_capacity(BUF_SIZE);
                    match file.read_buf(&mut buf).await {
                        Ok(0) => break,
                        Ok(_) => {
                            yield Ok(buf.freeze());
                        }
                        Err(e) => {
                            debug!("read failed {}", e);
                            yield Err(e);
                            break;
                        }
                    }
                }
            }) as ContentStream)
        }
        .boxed()
    }

    fn set_resource_content<'a>(
        &'a self,
        _tx: &'a DavTransaction,
        path: &'a DavPath,
        mut content: ContentStream,
        _content_type: Option<&'a str>,
        _encoding: Option<&'a str>,
    ) -> StoreFuture<'a, u64> {
        async move {
            trace!("STORE: set_resource_content {:?}", path);
            let abs = self.abs_path(path);
            if tokio::fs::metadata(&abs).await?.is_dir() {
                return Err(StoreError::GeneralFailure);
            }
            let mut file = tokio::fs::OpenOptions::new()
                .write(true)
                .truncate(true)
                .open(abs)
                .await?;
            let mut len = 0u64;
            while let Some(chunk) = content.next().await {
                let chunk = chunk?;
                file.write_all(&chunk).await?;
                len += chunk.len() as u64;
            }
            file.flush().await?;
            Ok(len)
        }
        .boxed()
    }

    fn get_children_names<'a>(
        &'a self,
        _tx: &'a DavTransaction,
        path: &'a DavPath,
    ) -> StoreFuture<'a, Option<Vec<String>>> {
        async move {
            trace!("STORE: get_children_names {:?}", path);
            let abs = self.abs_path(path);
            if !tokio::fs::metadata(&abs).await?.is_dir() {
                return Ok(None);
            }
            let mut read_dir = tokio::fs::read_dir(&abs).await?;
            let mut names = Vec::new();
            while let Some(entry) = read_dir.next_entry().await? {
                match entry.file_name().into_string() {
                    Ok(name) => names.push(name),
                    Err(name) => debug!("skipping non-utf8 name {:?}", name),
                }
            }
            names.sort();
            Ok(Some(names))
        }
        .boxed()
    }

    fn get_resource_length<'a>(
        &'a self,
        _tx: &'a DavTransaction,
        path: &'a DavPath,
    ) -> StoreFuture<'a, u64> {
        async move {
            let meta = tokio::fs::metadata(self.abs_path(path)).await?;
            Ok(if meta.is_dir() { 0 } else { meta.len() })
        }
        .boxed()
    }

    fn remove_object<'a>(&'a self, _tx: &'a DavTransaction, path: &'a DavPath) -> StoreFuture<'a, ()> {
        async move {
            trace!("STORE: remove_object {:?}", path);
            if path.is_root() {
                return Err(StoreError::AccessDenied);
            }
            let abs = self.abs_path(path);
            let meta = tokio::fs::symlink_metadata(&abs).await?;
            let res = if meta.is_dir() {
                tokio::fs::remove_dir(&abs).await
            } else {
                tokio::fs::remove_file(&abs).await
            };
            match res {
                Ok(()) => {
                    self.nulls.lock().remove(path.as_str());
                    Ok(())
                }
                Err(e) => {
                    debug!("remove {:?} failed: {}", abs, e);
                    Err(e.into())
                }
            }
        }
        .boxed()
    }

    fn get_stored_object<'a>(
        &'a self,
        _tx: &'a DavTransaction,
        path: &'a DavPath,
    ) -> StoreFuture<'a, Option<StoredObject>> {
        async move {
            let meta = match tokio::fs::metadata(self.abs_path(path)).await {
                Ok(meta) => meta,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            let modified = meta.modified().unwrap_or_else(|_| SystemTime::now());
            Ok(Some(StoredObject {
                is_folder: meta.is_dir(),
                is_null_resource: !meta.is_dir() && self.is_null(path),
                creation_date: meta.created().unwrap_or(modified),
                last_modified: modified,
                resource_length: if meta.is_dir() { 0 } else { meta.len() },
                mime_type: None,
            }))
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
            tokio::fs::metadata(self.abs_path(path)).await?;
            let mut nulls = self.nulls.lock();
            if null {
                nulls.insert(path.as_str().to_string());
            } else {
                nulls.remove(path.as_str());
            }
            Ok(())
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures_util::stream;

    fn p(s: &str) -> DavPath {
        DavPath::new(s).unwrap()
    }

    fn tempdir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("localstore-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn files_and_folders() {
        let dir = tempdir();
        let store = LocalStore::new(&dir, false);
        let tx = store.begin(Some("me")).await.unwrap();

        store.create_folder(&tx, &p("/docs")).await.unwrap();
        store.create_resource(&tx, &p("/docs/a.txt")).await.unwrap();
        let body = stream::iter(vec![Ok(Bytes::from_static(b"abc")), Ok(Bytes::from_static(b"de"))]);
        let len = store
            .set_resource_content(&tx, &p("/docs/a.txt"), Box::pin(body), None, None)
            .await
            .unwrap();
        assert_eq!(len, 5);
        assert_eq!(std::fs::read(dir.join("docs/a.txt")).unwrap(), b"abcde");

        let obj = store.get_stored_object(&tx, &p("/docs/a.txt")).await.unwrap().unwrap();
        assert!(obj.is_resource());
        assert_eq!(obj.resource_length, 5);
        let names = store.get_children_names(&tx, &p("/docs")).await.unwrap();
        assert_eq!(names, Some(vec!["a.txt".to_string()]));
        assert_eq!(
            store.create_folder(&tx, &p("/docs/a.txt/x")).await,
            Err(StoreError::GeneralFailure)
        );

        let chunks: Vec<_> = store
            .get_resource_content(&tx, &p("/docs/a.txt"))
            .await
            .unwrap()
            .collect()
            .await;
        let data: Vec<u8> = chunks.into_iter().flat_map(|c| c.unwrap().to_vec()).collect();
        assert_eq!(data, b"abcde");

        assert_eq!(
            store.remove_object(&tx, &p("/docs")).await,
            Err(StoreError::GeneralFailure)
        );
        store.remove_object(&tx, &p("/docs/a.txt")).await.unwrap();
        store.remove_object(&tx, &p("/docs")).await.unwrap();
        assert!(store.get_stored_object(&tx, &p("/docs")).await.unwrap().is_none());
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn null_flag_lives_in_memory() {
        let dir = tempdir();
        let store = LocalStore::new(&dir, true);
        let tx = store.begin(None).await.unwrap();
        store.create_resource(&tx, &p("/n")).await.unwrap();
        store.set_null_resource(&tx, &p("/n"), true).await.unwrap();
        assert!(store.get_stored_object(&tx, &p("/n")).await.unwrap().unwrap().is_null_resource);
        store.remove_object(&tx, &p("/n")).await.unwrap();
        store.create_resource(&tx, &p("/n")).await.unwrap();
        assert!(!store.get_stored_object(&tx, &p("/n")).await.unwrap().unwrap().is_null_resource);
        std::fs::remove_dir_all(dir).unwrap();
    }
}
