//! Request driver.
//!
//! Starts the server, POSTs a stream request to it, aborts that request
//! once the cancel timer fires and always shuts the server down. Progress
//! and failures are reported through the log; nothing is retried.

use crate::cancel::CancelToken;
use crate::config::Config;
use crate::payload::StreamRequest;
use crate::server::Server;
use bytes::Bytes;
use http::header::{CONTENT_TYPE, HOST};
use http::Request;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// A single request/abort exchange
#[derive(Debug, Clone)]
pub struct Scenario {
    path: String,
    request: StreamRequest,
    cancel_after: Duration,
}

impl Scenario {
    pub fn new(config: &Config) -> Self {
        Scenario {
            path: config.path.clone(),
            request: config.request.clone(),
            cancel_after: config.cancel_after,
        }
    }

    /// Cancel `token` once the abort delay has elapsed
    pub fn arm(&self, token: CancelToken) -> JoinHandle<()> {
        let delay = self.cancel_after;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if token.cancel() {
                info!("aborted");
            }
        })
    }

    /// POST the stream request to `addr` and read the whole response body.
    ///
    /// Returns the number of body bytes received. If `cancel` fires first
    /// the exchange is dropped, which closes the connection, and the error
    /// records whether the response headers had already arrived.
    pub async fn exchange(
        &self,
        addr: SocketAddr,
        cancel: &CancelToken,
    ) -> Result<u64, ScenarioError> {
        let payload = serde_json::to_vec(&self.request).map_err(ScenarioError::Encode)?;
        let headers_received = AtomicBool::new(false);

        let transfer = async {
            let stream = TcpStream::connect(addr)
                .await
                .map_err(ScenarioError::Connect)?;
            let (mut sender, conn) = http1::handshake(TokioIo::new(stream))
                .await
                .map_err(ScenarioError::Handshake)?;
            let conn = ConnectionGuard(tokio::spawn(async move {
                if let Err(e) = conn.await {
                    debug!(error = %e, "Client connection closed with error");
                }
            }));

            let request = Request::post(self.path.as_str())
                .header(HOST, addr.to_string())
                .header(CONTENT_TYPE, "application/json")
                .body(Full::new(Bytes::from(payload)))
                .map_err(ScenarioError::Build)?;

            let response = sender
                .send_request(request)
                .await
                .map_err(ScenarioError::Request)?;
            headers_received.store(true, Ordering::Release);
            info!(
                status = response.status().as_u16(),
                "request completed, fetching body..."
            );

            let body = response
                .into_body()
                .collect()
                .await
                .map_err(ScenarioError::Body)?
                .to_bytes();
            info!(bytes = body.len(), "fetching body completed");

            drop(conn);
            Ok::<u64, ScenarioError>(body.len() as u64)
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ScenarioError::Aborted {
                headers_received: headers_received.load(Ordering::Acquire),
            }),
            result = transfer => result,
        }
    }
}

/// Aborts the client connection task when the exchange ends, however it ends
struct ConnectionGuard(JoinHandle<()>);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Start the server, run one exchange against it and shut it down.
///
/// Only a failure to start the server is returned as `Err`; the outcome of
/// the exchange itself is logged and handed back for inspection.
pub async fn run(config: &Config) -> io::Result<Result<u64, ScenarioError>> {
    let handle = Server::new(config).start().await?;

    let scenario = Scenario::new(config);
    let cancel = CancelToken::new();
    let timer = scenario.arm(cancel.clone());

    let outcome = scenario.exchange(handle.local_addr(), &cancel).await;
    timer.abort();

    if let Err(ref e) = outcome {
        error!(error = %e, "Request failed");
    }

    info!("shutting down...");
    handle.stop().await;

    Ok(outcome)
}

/// Failures of the client side of a scenario
#[derive(Debug)]
pub enum ScenarioError {
    Encode(serde_json::Error),
    Connect(io::Error),
    Handshake(hyper::Error),
    Build(http::Error),
    Request(hyper::Error),
    Body(hyper::Error),
    /// Cancelled by the abort timer
    Aborted { headers_received: bool },
}

impl std::fmt::Display for ScenarioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScenarioError::Encode(e) => write!(f, "Failed to encode request body: {}", e),
            ScenarioError::Connect(e) => write!(f, "Failed to connect: {}", e),
            ScenarioError::Handshake(e) => write!(f, "HTTP handshake failed: {}", e),
            ScenarioError::Build(e) => write!(f, "Failed to build request: {}", e),
            ScenarioError::Request(e) => write!(f, "Request failed: {}", e),
            ScenarioError::Body(e) => write!(f, "Failed to read response body: {}", e),
            ScenarioError::Aborted {
                headers_received: true,
            } => write!(f, "The operation was aborted while fetching the body"),
            ScenarioError::Aborted {
                headers_received: false,
            } => write!(f, "The operation was aborted"),
        }
    }
}

impl std::error::Error for ScenarioError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ScenarioError::Encode(e) => Some(e),
            ScenarioError::Connect(e) => Some(e),
            ScenarioError::Handshake(e) | ScenarioError::Request(e) | ScenarioError::Body(e) => {
                Some(e)
            }
            ScenarioError::Build(e) => Some(e),
            ScenarioError::Aborted { .. } => None,
        }
    }
}
