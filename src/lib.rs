//! ## Async WebDAV method handlers over a pluggable store
//!
//! [`Webdav`] (RFC4918) is defined as
//! HTTP (GET/HEAD/PUT/DELETE) plus a bunch of extension methods (PROPFIND, etc).
//! These extension methods are used to manage collections (like unix directories),
//! get information on collections (like unix `ls` or `readdir`), rename and
//! copy items, lock/unlock items, etc.
//!
//! A `handler` is a piece of code that takes a `http::Request`, processes it in some
//! way, and then generates a `http::Response`. This library is a `handler` that maps
//! the HTTP/Webdav protocol to a [store][DavStore]: a narrow, transactional
//! create/read/update/delete interface over a tree of folders and resources.
//! Included are a store for a directory on the local filesystem ([`LocalStore`]) and
//! an in-memory store ([`MemStore`]).
//!
//! ## Locking.
//!
//! The handler keeps a [`LockRegistry`] with two lock trees. The persistent tree
//! holds the locks clients take with LOCK: exclusive or shared, with a depth of
//! 0, 1 or infinity, and a timeout. Locking a path that does not exist yet creates
//! a "lock-null" placeholder that becomes a real resource or folder when the lock
//! owner PUTs or MKCOLs it with the lock token.
//!
//! The temporary tree is used by the handlers themselves: every request holds a
//! short-lived lock on the paths it works on, so that concurrent requests on the
//! same path do not interleave.
//!
//! ## Transactions.
//!
//! Every request runs in a store transaction. It is committed when the handler
//! is done, and rolled back when the handler fails hard or panics.
//!
//! ## Example.
//!
//! Example server using [hyper] that serves the /tmp directory in r/w mode.
//!
//! ```no_run
//! use std::convert::Infallible;
//! use dav_store_server::{DavHandler, StoreBackend};
//!
//! #[tokio::main]
//! async fn main() {
//!     let dir = "/tmp";
//!     let addr = ([127, 0, 0, 1], 4918).into();
//!
//!     let dav_server = DavHandler::builder(StoreBackend::local(dir, false))
//!         .lazy_folder_creation_on_put(true)
//!         .build();
//!
//!     let make_service = hyper::service::make_service_fn(move |_| {
//!         let dav_server = dav_server.clone();
//!         async move {
//!             let func = move |req| {
//!                 let dav_server = dav_server.clone();
//!                 async move {
//!                     Ok::<_, Infallible>(dav_server.handle(req).await)
//!                 }
//!             };
//!             Ok::<_, Infallible>(hyper::service::service_fn(func))
//!         }
//!     });
//!
//!     println!("Serving {} on {}", dir, addr);
//!     let _ = hyper::Server::bind(&addr)
//!         .serve(make_service)
//!         .await
//!         .map_err(|e| eprintln!("server error: {}", e));
//! }
//! ```
//!
//! [`Webdav`]: https://tools.ietf.org/html/rfc4918
//! [hyper]: https://hyper.rs/

#![cfg_attr(docsrs, feature(doc_cfg))]

#[macro_use]
extern crate log;
#[macro_use]
extern crate lazy_static;

mod davhandler;
mod davheaders;
mod errors;
mod multierror;
mod util;
mod xmltree_ext;

pub mod body;
pub mod davpath;
pub mod locks;
pub mod store;

use crate::errors::{DavError, DavResult};

pub use crate::davhandler::{DavBuilder, DavHandler, StoreBackend};
pub use crate::locks::{ActiveLock, LockDepth, LockRegistry};
#[cfg(any(docsrs, feature = "localstore"))]
pub use crate::store::LocalStore;
#[cfg(any(docsrs, feature = "memstore"))]
pub use crate::store::MemStore;
pub use crate::store::{DavStore, MimeTyper, StoreError, StoredObject};
pub use crate::util::{DavMethod, DavMethodSet};
