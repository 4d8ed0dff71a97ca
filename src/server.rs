//! WebSocket accept path.
//!
//! One endpoint per instance: the document name comes from the first path
//! segment of the upgrade URL or from a `doc` query parameter, and the
//! configured auth strategy gates the handshake. Everything after the
//! upgrade is the peer session's job.

use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{StatusCode, Uri};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_util::sync::CancellationToken;

use crate::auth::AuthStrategy;
use crate::context::RelayContext;
use crate::registry::DocRegistry;
use crate::session;

/// Server failures (startup only; per-connection errors never escape).
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind listener: {0}")]
    Bind(#[from] std::io::Error),
}

pub struct RelayServer {
    ctx: RelayContext,
    registry: Arc<DocRegistry>,
    auth: Arc<dyn AuthStrategy>,
}

impl RelayServer {
    pub fn new(ctx: RelayContext, registry: Arc<DocRegistry>, auth: Arc<dyn AuthStrategy>) -> Self {
        Self {
            ctx,
            registry,
            auth,
        }
    }

    /// Bind the configured port and serve until shutdown.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), ServerError> {
        let listener = TcpListener::bind(("0.0.0.0", self.ctx.config.port)).await?;
        info!("relay listening on port {}", self.ctx.config.port);
        self.run_on(listener, shutdown).await
    }

    /// Serve on a pre-bound listener (tests bind port 0 themselves).
    pub async fn run_on(
        &self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), ServerError> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let ctx = self.ctx.clone();
                        let registry = self.registry.clone();
                        let auth = self.auth.clone();
                        tokio::spawn(handle_socket(stream, addr, ctx, registry, auth));
                    }
                    Err(e) => warn!("accept failed: {e}"),
                }
            }
        }
        info!("relay listener stopped");
        Ok(())
    }
}

async fn handle_socket(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: RelayContext,
    registry: Arc<DocRegistry>,
    auth: Arc<dyn AuthStrategy>,
) {
    let mut doc_name: Option<String> = None;
    let callback = |request: &Request, response: Response| {
        if !auth.authorize(request) {
            debug!("rejected unauthorized upgrade from {addr}");
            return Err(reject(StatusCode::UNAUTHORIZED));
        }
        match doc_name_from_uri(request.uri()) {
            Some(name) => {
                doc_name = Some(name);
                Ok(response)
            }
            None => {
                debug!("rejected upgrade without document name from {addr}");
                Err(reject(StatusCode::BAD_REQUEST))
            }
        }
    };

    let ws = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("handshake with {addr} failed: {e}");
            return;
        }
    };
    let Some(name) = doc_name else { return };

    let handle = match registry.get(&ctx, &name).await {
        Ok(handle) => handle,
        Err(e) => {
            warn!("doc {name}: actor unavailable for {addr}: {e}");
            let mut ws = ws;
            let _ = ws
                .close(Some(CloseFrame {
                    code: CloseCode::Error,
                    reason: "internal error".into(),
                }))
                .await;
            return;
        }
    };

    session::run(ws, handle, ctx.config.timing.ping_interval()).await;
}

fn reject(status: StatusCode) -> ErrorResponse {
    let mut response = ErrorResponse::new(None);
    *response.status_mut() = status;
    response
}

/// Document name: first path segment, else the `doc` query parameter.
fn doc_name_from_uri(uri: &Uri) -> Option<String> {
    let segment = uri
        .path()
        .trim_start_matches('/')
        .split('/')
        .next()
        .unwrap_or("");
    if !segment.is_empty() {
        return Some(segment.to_string());
    }

    for pair in uri.query()?.split('&') {
        let mut parts = pair.splitn(2, '=');
        if parts.next() == Some("doc") {
            let value = parts.next().unwrap_or("");
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}
