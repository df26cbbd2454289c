//! Contains the structs and traits that define a store backend.
//!
//! You only need this if you are going to implement your own
//! store backend. Otherwise, just use `StoreBackend::Mem` or
//! `StoreBackend::Local` when building the handler.
//!
use std::error::Error;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures_util::future::{self, BoxFuture, FutureExt};
use futures_util::stream::BoxStream;

use crate::davpath::DavPath;

#[cfg(any(docsrs, feature = "localstore"))]
pub(crate) mod localstore;
#[cfg(any(docsrs, feature = "memstore"))]
pub(crate) mod memstore;

#[cfg(any(docsrs, feature = "localstore"))]
pub use localstore::LocalStore;
#[cfg(any(docsrs, feature = "memstore"))]
pub use memstore::MemStore;

/// Errors generated by a store backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    /// The principal may not do this.
    AccessDenied,
    /// The object does not exist.
    ObjectNotFound,
    /// The object exists already.
    ObjectAlreadyExists,
    /// Anything else.
    GeneralFailure,
}

/// The Result type.
pub type StoreResult<T> = Result<T, StoreError>;

/// Future returned by almost all of the DavStore methods.
pub type StoreFuture<'a, T> = BoxFuture<'a, StoreResult<T>>;

/// Content of a resource, as a stream of chunks.
pub type ContentStream = BoxStream<'static, io::Result<Bytes>>;

impl Error for StoreError {}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StoreError::AccessDenied => write!(f, "access denied"),
            StoreError::ObjectNotFound => write!(f, "object not found"),
            StoreError::ObjectAlreadyExists => write!(f, "object already exists"),
            StoreError::GeneralFailure => write!(f, "store failure"),
        }
    }
}

impl From<io::Error> for StoreError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::NotFound => StoreError::ObjectNotFound,
            io::ErrorKind::PermissionDenied => StoreError::AccessDenied,
            io::ErrorKind::AlreadyExists => StoreError::ObjectAlreadyExists,
            _ => StoreError::GeneralFailure,
        }
    }
}

/// What the store knows about one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub is_folder: bool,
    /// A lock-null placeholder: locked, but never written.
    pub is_null_resource: bool,
    pub creation_date: SystemTime,
    pub last_modified: SystemTime,
    pub resource_length: u64,
    /// Mime type recorded when the content was written, if any.
    pub mime_type: Option<String>,
}

impl StoredObject {
    pub fn is_resource(&self) -> bool {
        !self.is_folder
    }

    /// Weak ETag made of length and modification time.
    pub fn etag(&self) -> String {
        if self.is_folder || self.is_null_resource {
            return "W/\"-\"".to_string();
        }
        let millis = self
            .last_modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        format!("W/\"{}-{}\"", self.resource_length, millis)
    }
}

static NEXT_TX: AtomicU64 = AtomicU64::new(1);

/// One unit of work against the store. Every request runs in its own
/// transaction, which is committed or rolled back when the handler is done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DavTransaction {
    id: u64,
    principal: Option<String>,
}

impl DavTransaction {
    pub fn new(principal: Option<&str>) -> DavTransaction {
        DavTransaction {
            id: NEXT_TX.fetch_add(1, Ordering::Relaxed),
            principal: principal.map(|p| p.to_string()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The principal ("user") the transaction was started for.
    pub fn principal(&self) -> Option<&str> {
        self.principal.as_deref()
    }
}

/// The store trait.
///
/// Paths are clean store paths (see `DavPath::as_str`). The parent of
/// an object must exist and be a folder before the object can be created.
pub trait DavStore: Send + Sync {
    /// Start a transaction.
    fn begin<'a>(&'a self, principal: Option<&'a str>) -> StoreFuture<'a, DavTransaction> {
        future::ok(DavTransaction::new(principal)).boxed()
    }

    /// Is the principal of this transaction allowed in at all.
    fn check_authentication<'a>(&'a self, _tx: &'a DavTransaction) -> StoreFuture<'a, ()> {
        future::ok(()).boxed()
    }

    /// Make the changes of the transaction permanent.
    fn commit<'a>(&'a self, _tx: &'a DavTransaction) -> StoreFuture<'a, ()> {
        future::ok(()).boxed()
    }

    /// Undo the changes of the transaction, as far as the backend is able to.
    fn rollback<'a>(&'a self, _tx: &'a DavTransaction) -> StoreFuture<'a, ()> {
        future::ok(()).boxed()
    }

    /// Create a folder.
    fn create_folder<'a>(&'a self, tx: &'a DavTransaction, path: &'a DavPath)
        -> StoreFuture<'a, ()>;

    /// Create an empty resource.
    fn create_resource<'a>(
        &'a self,
        tx: &'a DavTransaction,
        path: &'a DavPath,
    ) -> StoreFuture<'a, ()>;

    /// Content of a resource.
    fn get_resource_content<'a>(
        &'a self,
        tx: &'a DavTransaction,
        path: &'a DavPath,
    ) -> StoreFuture<'a, ContentStream>;

    /// Replace the content of an existing resource. Returns the new length.
    fn set_resource_content<'a>(
        &'a self,
        tx: &'a DavTransaction,
        path: &'a DavPath,
        content: ContentStream,
        content_type: Option<&'a str>,
        encoding: Option<&'a str>,
    ) -> StoreFuture<'a, u64>;

    /// Sorted names of the children of a folder, `None` if the path is a resource.
    fn get_children_names<'a>(
        &'a self,
        tx: &'a DavTransaction,
        path: &'a DavPath,
    ) -> StoreFuture<'a, Option<Vec<String>>>;

    /// Length of a resource in bytes.
    fn get_resource_length<'a>(
        &'a self,
        tx: &'a DavTransaction,
        path: &'a DavPath,
    ) -> StoreFuture<'a, u64>;

    /// Remove a resource or an empty folder.
    fn remove_object<'a>(&'a self, tx: &'a DavTransaction, path: &'a DavPath)
        -> StoreFuture<'a, ()>;

    /// Metadata of a path, `None` if nothing is stored there.
    fn get_stored_object<'a>(
        &'a self,
        tx: &'a DavTransaction,
        path: &'a DavPath,
    ) -> StoreFuture<'a, Option<StoredObject>>;

    /// Mark a resource as a lock-null placeholder, or promote it to a real resource.
    fn set_null_resource<'a>(
        &'a self,
        tx: &'a DavTransaction,
        path: &'a DavPath,
        null: bool,
    ) -> StoreFuture<'a, ()>;
}

/// Works out the mime type of a resource.
pub trait MimeTyper: Send + Sync {
    fn mime_type(&self, tx: &DavTransaction, path: &DavPath) -> Option<String>;
}

/// Guesses the mime type from the file extension.
#[derive(Debug, Clone, Copy, Default)]
pub struct GuessMimeTyper;

impl MimeTyper for GuessMimeTyper {
    fn mime_type(&self, _tx: &DavTransaction, path: &DavPath) -> Option<String> {
        let name = path.file_name();
        if !name.contains('.') {
            return None;
        }
        mime_guess::from_path(name).first().map(|m| m.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn etag_of_resource_and_folder() {
        let mut obj = StoredObject {
            is_folder: false,
            is_null_resource: false,
            creation_date: UNIX_EPOCH,
            last_modified: UNIX_EPOCH + Duration::from_millis(1500),
            resource_length: 42,
            mime_type: None,
        };
        assert_eq!(obj.etag(), "W/\"42-1500\"");
        obj.is_folder = true;
        assert_eq!(obj.etag(), "W/\"-\"");
    }

    #[test]
    fn guess_mime_type() {
        let tx = DavTransaction::new(None);
        let typer = GuessMimeTyper;
        let p = DavPath::new("/a/b.html").unwrap();
        assert_eq!(typer.mime_type(&tx, &p).as_deref(), Some("text/html"));
        let p = DavPath::new("/a/README").unwrap();
        assert_eq!(typer.mime_type(&tx, &p), None);
    }

    #[test]
    fn transactions_get_their_own_id() {
        let a = DavTransaction::new(Some("alice"));
        let b = DavTransaction::new(None);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.principal(), Some("alice"));
        assert_eq!(b.principal(), None);
    }
}
