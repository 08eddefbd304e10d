//! WebSocket entry point.
//!
//! Accepts TCP connections, upgrades requests on the connect path and hands
//! each upgraded socket to the [`RelayEngine`] as one session task. The
//! destination comes from the `host` and `port` query parameters.
//!
//! ```text
//! TcpListener ──accept──> handshake (path check, query parse)
//!                              │
//!                              └── tokio::spawn ──> WebSocketChannel ──> RelayEngine::relay
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;

use crate::channel::websocket::WebSocketChannel;
use crate::config::Config;
use crate::destination::Destination;
use crate::relay::RelayEngine;

/// Per-connection server settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Request path that is upgraded.
    pub connect_path: String,
    /// Client event queue capacity.
    pub event_queue_capacity: usize,
}

impl From<&Config> for ServerSettings {
    fn from(config: &Config) -> Self {
        Self {
            connect_path: config.connect_path.clone(),
            event_queue_capacity: config.event_queue_capacity,
        }
    }
}

/// Bind `config.listen_addr` and serve until the listener fails.
pub async fn serve(config: &Config, engine: Arc<RelayEngine>) -> Result<()> {
    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    serve_listener(listener, engine, ServerSettings::from(config)).await
}

/// Accept loop over an already bound listener.
pub async fn serve_listener(
    listener: TcpListener,
    engine: Arc<RelayEngine>,
    settings: ServerSettings,
) -> Result<()> {
    let local = listener
        .local_addr()
        .context("Listener has no local address")?;
    info!(
        "[Server] listening on {} (connect path {}, fallback egress {})",
        local,
        settings.connect_path,
        engine.connector().fallback_host()
    );
    let settings = Arc::new(settings);

    loop {
        let (stream, peer) = listener.accept().await.context("Accept failed")?;
        let engine = Arc::clone(&engine);
        let settings = Arc::clone(&settings);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer, &engine, &settings).await {
                warn!("[Server] connection from {} dropped: {:#}", peer, e);
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    engine: &RelayEngine,
    settings: &ServerSettings,
) -> Result<()> {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("[Server] set_nodelay failed for {}: {}", peer, e);
    }

    let mut requested = None;
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        if req.uri().path() != settings.connect_path {
            debug!(
                "[Server] {} asked for {}, rejecting",
                peer,
                req.uri().path()
            );
            let mut not_found = ErrorResponse::new(Some("Not found".to_string()));
            *not_found.status_mut() = StatusCode::NOT_FOUND;
            return Err(not_found);
        }
        requested = Some(parse_destination(req.uri().query().unwrap_or_default()));
        Ok(resp)
    };
    let socket = accept_hdr_async(stream, callback)
        .await
        .context("WebSocket handshake failed")?;

    let Some(destination) = requested else {
        bail!("handshake completed without a destination");
    };
    debug!("[Server] {} upgraded for {}", peer, destination);

    let (channel, events) = WebSocketChannel::spawn(socket, settings.event_queue_capacity);
    engine.relay(channel, events, destination).await;
    Ok(())
}

/// Extract `host` and `port` from a query string.
///
/// A missing host becomes `""` and a missing or invalid port becomes `0`;
/// the transport rejects both when the session connects.
pub fn parse_destination(query: &str) -> Destination {
    let mut host = String::new();
    let mut port = 0;
    for pair in query.split('&') {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        match key {
            "host" => host = value.to_string(),
            "port" => port = value.parse().unwrap_or(0),
            _ => {}
        }
    }
    Destination::new(host, port)
}
