//! The operator-facing WebSocket hub: envelope framing, the single hub
//! owning the client set, per-connection reader/writer tasks, and command
//! dispatch. See spec.md §4.7/§6.

pub mod client;
pub mod commands;
pub mod envelope;
pub mod hub;

pub use commands::CommandContext;
pub use envelope::Envelope;
pub use hub::WSHub;

use crate::logstream::LogStreamManager;
use anyhow::Result;
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper::{Request, Response};
use std::sync::Arc;

type BoxBody = http_body_util::combinators::BoxBody<bytes::Bytes, hyper::Error>;

fn empty_body() -> BoxBody {
    Empty::new().map_err(|never| match never {}).boxed()
}

/// Upgrade an inbound `GET /ws` request to a WebSocket connection and spawn
/// its serving task. Returns the upgrade response hyper must send back.
pub fn try_upgrade(
    req: &mut Request<Incoming>,
    hub: Arc<WSHub>,
    logs: Arc<LogStreamManager>,
    commands: Arc<CommandContext>,
) -> Result<Response<BoxBody>> {
    let (response, websocket) = hyper_tungstenite::upgrade(req, None)?;

    tokio::spawn(async move {
        match websocket.await {
            Ok(ws) => client::serve(ws, hub, logs, commands).await,
            Err(e) => tracing::warn!(error = %e, "websocket upgrade handshake failed"),
        }
    });

    Ok(response.map(|_| empty_body()))
}
