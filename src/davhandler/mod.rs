//
// This module contains the main entry point of the library,
// DavHandler.
//
use std::error::Error as StdError;
use std::io;
use std::panic::AssertUnwindSafe;
#[cfg(any(docsrs, feature = "localstore"))]
use std::path::PathBuf;
use std::sync::Arc;

use bytes::{self, buf::Buf};
use futures_util::{stream, FutureExt};
use headers::HeaderMapExt;
use http::{Request, Response, StatusCode};
use http_body::Body as HttpBody;

use crate::body::{request_stream, Body};
use crate::davheaders;
use crate::davpath::DavPath;
use crate::locks::{LockRegistry, CLEANUP_THRESHOLD, TEMP_TIMEOUT};
use crate::multierror::MultiError;
use crate::store::{ContentStream, DavStore, DavTransaction, GuessMimeTyper, MimeTyper, StoredObject};
use crate::util::{dav_method, DavMethod, DavMethodSet};

use crate::errors::DavError;
use crate::DavResult;

mod handle_copymove;
mod handle_delete;
mod handle_gethead;
mod handle_lock;
mod handle_mkcol;
mod handle_options;
mod handle_props;
mod handle_put;
mod templock;


/// Largest request body that is read into memory (all methods except PUT).
const MAX_XML_BODY: usize = 65536;

/// Configuration of the handler.
#[derive(Clone)]
pub struct DavBuilder {
    /// Prefix to be stripped off when handling request.
    prefix: String,
    /// Store backend.
    store: StoreBackend,
    /// Set of allowed methods (Defaults to "all methods")
    allow: DavMethodSet,
    /// Principal is webdav speak for "user". It is handed to the store
    /// when a transaction is started.
    principal: Option<String>,
    /// Refuse everything that would change the store.
    read_only: bool,
    /// GET on a folder redirects here.
    default_index_file: Option<String>,
    /// Served instead of a missing resource.
    instead_of_404: Option<String>,
    /// PUT creates missing parent folders.
    lazy_folder_creation_on_put: bool,
    /// Send Content-Length on GET/HEAD.
    content_length_headers: bool,
    mime_typer: Option<Arc<dyn MimeTyper>>,
    lock_registry: Option<Arc<LockRegistry>>,
    /// Lifetime of the locks the handlers take themselves, in seconds.
    temp_lock_timeout: u64,
    lock_cleanup_threshold: usize,
}

/// Store backend.
#[derive(Clone)]
pub enum StoreBackend {
    #[cfg(any(docsrs, feature = "memstore"))]
    Mem,
    #[cfg(any(docsrs, feature = "localstore"))]
    Local {
        /// Path to the root directory.
        base: PathBuf,
        public: bool,
    },
    /// Any other implementation of the store trait.
    Custom(Arc<dyn DavStore>),
}

impl StoreBackend {
    /// Serve a local directory
    #[cfg(any(docsrs, feature = "localstore"))]
    pub fn local(path: impl Into<PathBuf>, public: bool) -> Self {
        StoreBackend::Local {
            base: path.into(),
            public,
        }
    }

    fn build(self) -> Arc<dyn DavStore> {
        match self {
            #[cfg(any(docsrs, feature = "memstore"))]
            StoreBackend::Mem => crate::store::MemStore::new(),
            #[cfg(any(docsrs, feature = "localstore"))]
            StoreBackend::Local { base, public } => crate::store::LocalStore::new(base, public),
            StoreBackend::Custom(store) => store,
        }
    }
}

impl DavBuilder {
    /// Create a new configuration builder.
    pub fn new(store: StoreBackend) -> DavBuilder {
        Self {
            prefix: String::new(),
            store,
            allow: DavMethodSet::all(),
            principal: None,
            read_only: false,
            default_index_file: None,
            instead_of_404: None,
            lazy_folder_creation_on_put: false,
            content_length_headers: true,
            mime_typer: None,
            lock_registry: None,
            temp_lock_timeout: TEMP_TIMEOUT,
            lock_cleanup_threshold: CLEANUP_THRESHOLD,
        }
    }

    /// Use the configuration that was built to generate a DavHandler.
    pub fn build(self) -> DavHandler {
        self.into()
    }

    /// Prefix to be stripped off before translating the rest of
    /// the request path to a store path.
    pub fn strip_prefix(self, prefix: impl Into<String>) -> Self {
        let mut this = self;
        this.prefix = prefix.into();
        this
    }

    /// Which methods to allow (default is all methods).
    pub fn methods(self, allow: DavMethodSet) -> Self {
        let mut this = self;
        this.allow = allow;
        this
    }

    /// Set the name of the "webdav principal". It is passed to the store
    /// when a transaction is started.
    pub fn principal(self, principal: impl Into<String>) -> Self {
        let mut this = self;
        this.principal = Some(principal.into());
        this
    }

    /// Refuse all methods that change the store (default false).
    pub fn read_only(self, read_only: bool) -> Self {
        let mut this = self;
        this.read_only = read_only;
        this
    }

    /// GET or HEAD on a folder redirects to this file in the folder.
    pub fn default_index_file(self, name: impl Into<String>) -> Self {
        let mut this = self;
        this.default_index_file = Some(name.into());
        this
    }

    /// Path that is served (with status 404) when a GET or HEAD target does not exist.
    pub fn instead_of_404(self, path: impl Into<String>) -> Self {
        let mut this = self;
        this.instead_of_404 = Some(path.into());
        this
    }

    /// Let PUT create missing parent folders (default false).
    pub fn lazy_folder_creation_on_put(self, lazy: bool) -> Self {
        let mut this = self;
        this.lazy_folder_creation_on_put = lazy;
        this
    }

    /// Send a Content-Length header with GET and HEAD (default true).
    pub fn content_length_headers(self, send: bool) -> Self {
        let mut this = self;
        this.content_length_headers = send;
        this
    }

    /// Set the mime typer (default guesses by extension).
    pub fn mime_typer(self, typer: Arc<dyn MimeTyper>) -> Self {
        let mut this = self;
        this.mime_typer = Some(typer);
        this
    }

    /// Share a lock registry between handlers. The cleanup threshold
    /// of the builder does not apply to a shared registry.
    pub fn lock_registry(self, registry: Arc<LockRegistry>) -> Self {
        let mut this = self;
        this.lock_registry = Some(registry);
        this
    }

    /// Lifetime of the locks that requests take on the paths they work on,
    /// in seconds (default 10).
    pub fn temp_lock_timeout(self, secs: u64) -> Self {
        let mut this = self;
        this.temp_lock_timeout = secs.max(1);
        this
    }

    /// Number of lock operations between two cleanups of the lock trees.
    pub fn lock_cleanup_threshold(self, ops: usize) -> Self {
        let mut this = self;
        this.lock_cleanup_threshold = ops;
        this
    }
}

/// The webdav handler struct.
///
/// The `builder` and `build` methods are used to instantiate a handler.
///
/// The `handle` and `handle_with` methods are the methods that do the actual work.
#[derive(Clone)]
pub struct DavHandler {
    pub(crate) prefix: Arc<String>,
    pub(crate) store: Arc<dyn DavStore>,
    pub(crate) locks: Arc<LockRegistry>,
    pub(crate) mime_typer: Arc<dyn MimeTyper>,
    pub(crate) allow: DavMethodSet,
    pub(crate) principal: Option<Arc<String>>,
    pub(crate) read_only: bool,
    pub(crate) default_index_file: Option<Arc<String>>,
    pub(crate) instead_of_404: Option<Arc<String>>,
    pub(crate) lazy_folder_creation_on_put: bool,
    pub(crate) content_length_headers: bool,
    pub(crate) temp_lock_timeout: u64,
}

impl From<DavBuilder> for DavHandler {
    fn from(cfg: DavBuilder) -> Self {
        let threshold = cfg.lock_cleanup_threshold;
        Self {
            prefix: Arc::new(cfg.prefix),
            store: cfg.store.build(),
            locks: cfg
                .lock_registry
                .unwrap_or_else(|| Arc::new(LockRegistry::with_cleanup_threshold(threshold))),
            mime_typer: cfg.mime_typer.unwrap_or_else(|| Arc::new(GuessMimeTyper)),
            allow: cfg.allow,
            principal: cfg.principal.map(Arc::new),
            read_only: cfg.read_only,
            default_index_file: cfg.default_index_file.map(Arc::new),
            instead_of_404: cfg.instead_of_404.map(Arc::new),
            lazy_folder_creation_on_put: cfg.lazy_folder_creation_on_put,
            content_length_headers: cfg.content_length_headers,
            temp_lock_timeout: cfg.temp_lock_timeout,
        }
    }
}

impl DavHandler {
    /// Return a configuration builder.
    pub fn builder(store: StoreBackend) -> DavBuilder {
        DavBuilder::new(store)
    }

    /// The lock registry of this handler.
    pub fn lock_registry(&self) -> &Arc<LockRegistry> {
        &self.locks
    }

    /// Handle a webdav request.
    pub async fn handle<ReqBody, ReqData, ReqError>(&self, req: Request<ReqBody>) -> Response<Body>
    where
        ReqData: Buf + Send + 'static,
        ReqError: StdError + Send + Sync + 'static,
        ReqBody: HttpBody<Data = ReqData, Error = ReqError> + Send + 'static,
    {
        self.handle_inner(req).await
    }

    /// Handle a webdav request, overriding parts of the config.
    ///
    /// For example, the `principal` can be set for this request
    /// after the server has authenticated the user.
    pub async fn handle_with<ReqBody, ReqData, ReqError>(
        &self,
        req: Request<ReqBody>,
        prefix: Option<String>,
        principal: Option<String>,
    ) -> Response<Body>
    where
        ReqData: Buf + Send + 'static,
        ReqError: StdError + Send + Sync + 'static,
        ReqBody: HttpBody<Data = ReqData, Error = ReqError> + Send + 'static,
    {
        let mut this = self.clone();
        if let Some(prefix) = prefix {
            this.prefix = Arc::new(format!(
                "{}/{}",
                this.prefix.strip_suffix('/').unwrap_or(&this.prefix),
                prefix.strip_prefix('/').unwrap_or(&prefix)
            ));
        }
        if let Some(principal) = principal {
            this.principal = Some(Arc::new(principal));
        }
        this.handle_inner(req).await
    }
}

impl DavHandler {
    // helper.
    pub(crate) fn path(&self, req: &Request<()>) -> DavResult<DavPath> {
        Ok(DavPath::from_uri_and_prefix(req.uri(), &self.prefix)?)
    }

    // The stored object at `path`. A lock-null placeholder whose lock
    // has gone away counts as absent.
    pub(crate) async fn stored_object(
        &self,
        tx: &DavTransaction,
        path: &DavPath,
    ) -> DavResult<Option<StoredObject>> {
        match self.store.get_stored_object(tx, path).await? {
            Some(so) if so.is_null_resource && self.locks.get_by_path(path.as_str()).is_none() => {
                Ok(None)
            }
            other => Ok(other),
        }
    }

    // Like stored_object, but also removes a stale placeholder from
    // the store, so that the path can be written.
    pub(crate) async fn stored_object_for_write(
        &self,
        tx: &DavTransaction,
        path: &DavPath,
    ) -> DavResult<Option<StoredObject>> {
        match self.store.get_stored_object(tx, path).await? {
            Some(so) if so.is_null_resource && self.locks.get_by_path(path.as_str()).is_none() => {
                debug!("removing stale lock-null resource {}", path);
                self.store.remove_object(tx, path).await?;
                Ok(None)
            }
            other => Ok(other),
        }
    }

    // Is `path` free of persistent locks that this request does not hold
    // the token for. Shared locks never block.
    pub(crate) fn check_locks(&self, req: &Request<()>, path: &DavPath) -> bool {
        let tokens = davheaders::if_tokens(req.headers());
        self.locks
            .covering(path.as_str())
            .iter()
            .all(|l| !l.exclusive || tokens.iter().any(|t| *t == l.token))
    }

    // Exclusive locks below `path` that the request does not hold the
    // token for, each reported as 423.
    pub(crate) fn check_locks_below(&self, req: &Request<()>, path: &DavPath) -> MultiError {
        let tokens = davheaders::if_tokens(req.headers());
        let mut errors = MultiError::new();
        for l in self.locks.below(path.as_str()) {
            if l.exclusive && !tokens.iter().any(|t| *t == l.token) {
                errors.add(&path.with_path(&l.path), StatusCode::LOCKED);
            }
        }
        errors
    }

    // Allow header for a response.
    pub(crate) fn allow_header(res: &mut Response<Body>, allow: &'static str) {
        res.headers_mut()
            .insert("allow", http::HeaderValue::from_static(allow));
    }

    // drain request body and return length.
    pub(crate) async fn read_request<ReqBody, ReqData, ReqError>(
        &self,
        body: ReqBody,
        max_size: usize,
    ) -> DavResult<Vec<u8>>
    where
        ReqBody: HttpBody<Data = ReqData, Error = ReqError>,
        ReqData: Buf + Send + 'static,
        ReqError: StdError + Send + Sync + 'static,
    {
        let mut data = Vec::new();
        pin_utils::pin_mut!(body);
        while let Some(res) = body.data().await {
            let mut buf = res.map_err(|_| {
                DavError::IoError(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "UnexpectedEof",
                ))
            })?;
            while buf.has_remaining() {
                if data.len() + buf.remaining() > max_size {
                    return Err(StatusCode::PAYLOAD_TOO_LARGE.into());
                }
                let b = buf.chunk();
                let l = b.len();
                data.extend_from_slice(b);
                buf.advance(l);
            }
        }
        Ok(data)
    }

    // internal dispatcher.
    async fn handle_inner<ReqBody, ReqData, ReqError>(
        &self,
        req: Request<ReqBody>,
    ) -> Response<Body>
    where
        ReqBody: HttpBody<Data = ReqData, Error = ReqError> + Send + 'static,
        ReqData: Buf + Send + 'static,
        ReqError: StdError + Send + Sync + 'static,
    {
        // Turn any DavError results into a HTTP error response.
        match self.handle2(req).await {
            Ok(resp) => {
                debug!("== END REQUEST result {}", resp.status());
                resp
            }
            Err(err) => {
                debug!("== END REQUEST result {:?}", err);
                let mut resp = Response::new(Body::empty());
                *resp.status_mut() = err.statuscode();
                resp.headers_mut().typed_insert(headers::ContentLength(0));
                if err.must_close() {
                    resp.headers_mut()
                        .insert("connection", http::HeaderValue::from_static("close"));
                }
                resp
            }
        }
    }

    // internal dispatcher part 2.
    async fn handle2<ReqBody, ReqData, ReqError>(
        &self,
        req: Request<ReqBody>,
    ) -> DavResult<Response<Body>>
    where
        ReqBody: HttpBody<Data = ReqData, Error = ReqError> + Send + 'static,
        ReqData: Buf + Send + 'static,
        ReqError: StdError + Send + Sync + 'static,
    {
        let (req, body) = {
            let (parts, body) = req.into_parts();
            (Request::from_parts(parts, ()), body)
        };

        // debug when running the webdav litmus tests.
        if log_enabled!(log::Level::Debug) {
            if let Some(t) = req.headers().typed_get::<davheaders::XLitmus>() {
                debug!("X-Litmus: {:?}", t);
            }
        }

        // translate HTTP method to Webdav method.
        let method = match dav_method(req.method()) {
            Ok(m) => m,
            Err(e) => {
                debug!("refusing method {} request {}", req.method(), req.uri());
                if self.read_only {
                    return Err(StatusCode::FORBIDDEN.into());
                }
                return Err(e);
            }
        };

        // see if method is allowed.
        if !self.allow.contains_method(method) {
            debug!(
                "method {} not allowed on request {}",
                req.method(),
                req.uri()
            );
            return Err(DavError::StatusClose(StatusCode::METHOD_NOT_ALLOWED));
        }

        if self.read_only && method.is_mutating() {
            debug!("read-only: refusing {:?} {}", method, req.uri());
            return Err(StatusCode::FORBIDDEN.into());
        }

        // make sure the request path is valid.
        let path = DavPath::from_uri_and_prefix(req.uri(), &self.prefix)?;

        // PUT is the only handler that reads the body itself. All the
        // other handlers either expected no body, or a pre-read Vec<u8>.
        let (body_strm, body_data) = match method {
            DavMethod::Put => (Some(request_stream(body)), Vec::new()),
            _ => (None, self.read_request(body, MAX_XML_BODY).await?),
        };

        // Not all methods accept a body.
        match method {
            DavMethod::Put | DavMethod::PropFind | DavMethod::PropPatch | DavMethod::Lock => {}
            _ => {
                if !body_data.is_empty() {
                    return Err(StatusCode::UNSUPPORTED_MEDIA_TYPE.into());
                }
            }
        }

        debug!("== START REQUEST {:?} {}", method, path);

        let principal = self.principal.as_ref().map(|p| p.as_str());
        let tx = self.store.begin(principal).await?;
        if let Err(e) = self.store.check_authentication(&tx).await {
            debug!("authentication failed for {:?}: {}", principal, e);
            let _ = self.store.rollback(&tx).await;
            return Err(StatusCode::FORBIDDEN.into());
        }

        let fut = self.dispatch(method, &req, &tx, body_strm, &body_data);
        let res = match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(res) => res,
            Err(_) => {
                error!("panic while handling {:?} {}", method, path);
                Err(DavError::Panic)
            }
        };

        match res {
            Err(e) if e.is_fatal() => {
                debug!("rollback transaction {}: {}", tx.id(), e);
                if let Err(re) = self.store.rollback(&tx).await {
                    error!("rollback of transaction {} failed: {}", tx.id(), re);
                }
                Err(e)
            }
            res => {
                if let Err(ce) = self.store.commit(&tx).await {
                    error!("commit of transaction {} failed: {}", tx.id(), ce);
                    return Err(ce.into());
                }
                res
            }
        }
    }

    // the method router.
    async fn dispatch(
        &self,
        method: DavMethod,
        req: &Request<()>,
        tx: &DavTransaction,
        body_strm: Option<ContentStream>,
        body_data: &[u8],
    ) -> DavResult<Response<Body>> {
        match method {
            DavMethod::Options => self.handle_options(req, tx).await,
            DavMethod::PropFind => self.handle_propfind(req, tx, body_data).await,
            DavMethod::PropPatch => self.handle_proppatch(req, tx, body_data).await,
            DavMethod::MkCol => self.handle_mkcol(req, tx).await,
            DavMethod::Delete => self.handle_delete(req, tx).await,
            DavMethod::Lock => self.handle_lock(req, tx, body_data).await,
            DavMethod::Unlock => self.handle_unlock(req, tx).await,
            DavMethod::Head | DavMethod::Get => self.handle_get(req, tx, method).await,
            DavMethod::Copy | DavMethod::Move => self.handle_copymove(req, tx, method).await,
            DavMethod::Put => {
                let body = body_strm.unwrap_or_else(|| Box::pin(stream::empty()));
                self.handle_put(req, tx, body).await
            }
        }
    }
}
