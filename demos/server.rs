//
//  Sample application.
//
//  Listens on localhost:4918, plain http, no ssl.
//  Connect to http://localhost:4918/
//

use std::convert::Infallible;
use std::error::Error;
use std::net::SocketAddr;
use std::str::FromStr;

use clap::Parser;
use futures_util::future::TryFutureExt;
use headers::{authorization::Basic, Authorization, HeaderMapExt};

use dav_store_server::{body::Body, DavHandler, StoreBackend};

#[derive(Clone)]
struct Server {
    dh: DavHandler,
    auth: bool,
}

impl Server {
    pub fn new(cli: &Cli) -> Self {
        let store = match cli.dir {
            Some(ref dir) if !cli.memfs => StoreBackend::local(dir, true),
            _ => StoreBackend::Mem,
        };
        let mut config = DavHandler::builder(store)
            .read_only(cli.read_only)
            .lazy_folder_creation_on_put(cli.lazy_put);
        if let Some(ref prefix) = cli.prefix {
            config = config.strip_prefix(prefix.as_str());
        }
        if let Some(ref index) = cli.index {
            config = config.default_index_file(index.as_str());
        }

        Server {
            dh: config.build(),
            auth: cli.auth,
        }
    }

    async fn handle(
        &self,
        req: hyper::Request<hyper::Body>,
    ) -> Result<hyper::Response<Body>, Infallible> {
        let user = if self.auth {
            // we want the client to authenticate.
            match req.headers().typed_get::<Authorization<Basic>>() {
                Some(Authorization(basic)) => Some(basic.username().to_string()),
                None => {
                    // return a 401 reply.
                    let mut response = hyper::Response::new(Body::from("please auth".to_string()));
                    *response.status_mut() = hyper::StatusCode::UNAUTHORIZED;
                    response.headers_mut().insert(
                        "WWW-Authenticate",
                        hyper::header::HeaderValue::from_static("Basic realm=\"dav\""),
                    );
                    return Ok(response);
                }
            }
        } else {
            None
        };

        if let Some(user) = user {
            Ok(self.dh.handle_with(req, None, Some(user)).await)
        } else {
            Ok(self.dh.handle(req).await)
        }
    }
}

#[derive(Debug, clap::Parser)]
#[command(about, version)]
struct Cli {
    /// port to listen on
    #[arg(short, long, default_value = "4918")]
    port: u16,
    /// local directory to serve
    #[arg(short, long)]
    dir: Option<String>,
    /// serve from the in-memory store
    #[arg(short, long)]
    memfs: bool,
    /// url prefix to strip
    #[arg(long)]
    prefix: Option<String>,
    /// redirect GET on a folder to this file
    #[arg(long)]
    index: Option<String>,
    /// refuse all changes
    #[arg(short, long)]
    read_only: bool,
    /// let PUT create missing folders
    #[arg(short, long)]
    lazy_put: bool,
    /// require basic authentication, the user becomes the principal
    #[arg(short, long)]
    auth: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    serve(cli).await
}

async fn serve(cli: Cli) -> Result<(), Box<dyn Error>> {
    let name = match cli.dir {
        Some(ref dir) if !cli.memfs => dir.clone(),
        _ => "memory store".to_string(),
    };

    let dav_server = Server::new(&cli);
    let make_service = hyper::service::make_service_fn(|_| {
        let dav_server = dav_server.clone();
        async move {
            let func = move |req| {
                let dav_server = dav_server.clone();
                async move { dav_server.handle(req).await }
            };
            Ok::<_, hyper::Error>(hyper::service::service_fn(func))
        }
    });

    let addr = format!("0.0.0.0:{}", cli.port);
    let addr = SocketAddr::from_str(&addr)?;

    let server = hyper::Server::try_bind(&addr)?
        .serve(make_service)
        .map_err(|e| eprintln!("server error: {}", e));

    println!("Serving {} on {}", name, cli.port);
    let _ = server.await;
    Ok(())
}
