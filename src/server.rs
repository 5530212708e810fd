//! HTTP server for streaming paced bodies.
//!
//! Routes:
//! - `GET /` returns `hello`
//! - `POST /:id` streams a paced body configured by the JSON request body
//!
//! `Server::start` binds and returns a `ServerHandle`; `ServerHandle::stop`
//! stops accepting, drains open connections and always completes.

use crate::body::{self, PacedBody, ResponseBody};
use crate::config::Config;
use crate::payload::StreamRequest;
use crate::stream::{as_millis_u64, PacedSource};
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, trace, warn};

/// Listen backlog
const BACKLOG: i32 = 1024;

/// Server instance
pub struct Server {
    listen: String,
    body_limit: usize,
    shutdown_timeout: Duration,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: &Config) -> Self {
        Server {
            listen: config.listen.clone(),
            body_limit: config.body_limit,
            shutdown_timeout: config.shutdown_timeout,
        }
    }

    /// Bind the listener and begin accepting connections
    pub async fn start(&self) -> io::Result<ServerHandle> {
        let addr = tokio::net::lookup_host(&self.listen)
            .await?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("no address for '{}'", self.listen),
                )
            })?;

        let listener = TcpListener::from_std(create_listener(addr)?)?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, "Server listening");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept = tokio::spawn(accept_loop(listener, self.body_limit, shutdown_rx));

        Ok(ServerHandle {
            local_addr,
            shutdown: shutdown_tx,
            accept,
            shutdown_timeout: self.shutdown_timeout,
        })
    }
}

/// A running server
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    accept: JoinHandle<JoinSet<()>>,
    shutdown_timeout: Duration,
}

impl ServerHandle {
    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, let open connections finish, then abort stragglers
    /// once the shutdown timeout elapses.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);

        let mut connections = match self.accept.await {
            Ok(connections) => connections,
            Err(e) => {
                error!(error = %e, "Accept loop failed");
                return;
            }
        };

        debug!(open = connections.len(), "Waiting for connections to close");
        let drained = tokio::time::timeout(self.shutdown_timeout, async {
            while connections.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = connections.len(),
                "Shutdown timeout elapsed, aborting connections"
            );
            connections.shutdown().await;
        }

        info!("Server stopped");
    }
}

/// Accept connections until shutdown is signalled
async fn accept_loop(
    listener: TcpListener,
    body_limit: usize,
    mut shutdown: watch::Receiver<bool>,
) -> JoinSet<()> {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "New connection");
                    connections.spawn(handle_connection(
                        stream,
                        peer,
                        body_limit,
                        shutdown.clone(),
                    ));
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            },

            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    connections
}

/// Serve a single HTTP/1.1 connection
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    body_limit: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let service = service_fn(move |req| route(req, body_limit));
    let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = shutdown.changed() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };

    match result {
        Ok(()) => trace!(peer = %peer, "Connection closed"),
        Err(e) => debug!(peer = %peer, error = %e, "Connection error"),
    }
}

/// Dispatch a request to its route
async fn route(
    req: Request<Incoming>,
    body_limit: usize,
) -> Result<Response<ResponseBody>, Infallible> {
    let started = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    info!(method = %method, path = %path, "Incoming request");

    let response = match (&method, path.as_str()) {
        (&Method::GET, "/") => text_response("hello"),
        (&Method::POST, path) if route_id(path).is_some() => {
            stream_response(req, body_limit).await
        }
        _ => error_response(
            StatusCode::NOT_FOUND,
            &format!("Route {}:{} not found", method, path),
        ),
    };

    info!(
        status = response.status().as_u16(),
        elapsed_ms = as_millis_u64(started.elapsed()),
        "Request handled"
    );
    Ok(response)
}

/// The `:id` segment of `/:id`, if the path has that shape
fn route_id(path: &str) -> Option<&str> {
    path.strip_prefix('/')
        .filter(|id| !id.is_empty() && !id.contains('/'))
}

/// Build a paced body from the request payload
async fn stream_response(req: Request<Incoming>, body_limit: usize) -> Response<ResponseBody> {
    let payload = match Limited::new(req.into_body(), body_limit).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            return error_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                &format!("Request body is larger than {} bytes", body_limit),
            );
        }
        Err(e) => {
            debug!(error = %e, "Failed to read request body");
            return error_response(StatusCode::BAD_REQUEST, "Failed to read request body");
        }
    };

    let config = match StreamRequest::from_slice(&payload).and_then(StreamRequest::into_config) {
        Ok(config) => config,
        Err(e) => {
            warn!(error = %e, "Rejected stream request");
            return error_response(StatusCode::BAD_REQUEST, &e.to_string());
        }
    };

    debug!(
        size = config.size,
        rate = ?config.rate,
        startup_delay = ?config.startup_delay,
        stalls = config.stalls.len(),
        "Streaming paced body"
    );

    let body = PacedBody::new(PacedSource::new(config)).into_response_body();
    with_content_type(Response::new(body), "application/octet-stream")
}

fn text_response(text: &'static str) -> Response<ResponseBody> {
    with_content_type(Response::new(body::full(text)), "text/plain; charset=utf-8")
}

/// JSON error body: `{"statusCode":404,"error":"Not Found","message":"..."}`
fn error_response(status: StatusCode, message: &str) -> Response<ResponseBody> {
    let payload = serde_json::json!({
        "statusCode": status.as_u16(),
        "error": status.canonical_reason().unwrap_or("Error"),
        "message": message,
    });

    let mut response = with_content_type(
        Response::new(body::full(payload.to_string())),
        "application/json; charset=utf-8",
    );
    *response.status_mut() = status;
    response
}

fn with_content_type(
    mut response: Response<ResponseBody>,
    content_type: &'static str,
) -> Response<ResponseBody> {
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

/// Create a non-blocking TCP listener with SO_REUSEADDR.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    Ok(socket.into())
}
