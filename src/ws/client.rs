//! Per-connection reader/writer tasks. Each client runs two cooperative
//! tasks on top of the shared `WSHub` state: a reader that parses inbound
//! envelopes, and a writer that coalesces queued outbound envelopes into one
//! frame and emits periodic pings (spec.md §4.7).

use crate::logstream::LogStreamManager;
use crate::ws::commands::{run_command, CommandContext};
use crate::ws::envelope::{CommandPayload, Envelope, SubscribePayload, UnsubscribePayload};
use crate::ws::hub::WSHub;
use futures_util::{SinkExt, StreamExt};
use hyper_tungstenite::tungstenite::Message;
use hyper_tungstenite::WebSocketStream;
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, Duration};
use tracing::{debug, warn};

const READ_DEADLINE: Duration = Duration::from_secs(60);
const PING_INTERVAL: Duration = Duration::from_secs(54);
const MAX_INBOUND_BYTES: usize = 4 * 1024;

pub async fn serve(
    ws: WebSocketStream<TokioIo<hyper::upgrade::Upgraded>>,
    hub: Arc<WSHub>,
    logs: Arc<LogStreamManager>,
    commands: Arc<CommandContext>,
) {
    let (sender, receiver) = ws.split();
    let (client_id, outbound_rx) = hub.register().await;

    let writer = tokio::spawn(run_writer(sender, outbound_rx));
    run_reader(client_id, receiver, &hub, &logs, &commands).await;

    writer.abort();
    hub.unregister(client_id).await;
    logs.unsubscribe_all(client_id).await;
}

async fn run_reader(
    client_id: u64,
    mut receiver: futures_util::stream::SplitStream<
        WebSocketStream<TokioIo<hyper::upgrade::Upgraded>>,
    >,
    hub: &Arc<WSHub>,
    logs: &Arc<LogStreamManager>,
    commands: &Arc<CommandContext>,
) {
    loop {
        let message = match timeout(READ_DEADLINE, receiver.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(e))) => {
                debug!(client_id, error = %e, "websocket read error, closing");
                break;
            }
            Ok(None) => break,
            Err(_) => {
                debug!(client_id, "read deadline exceeded, closing");
                break;
            }
        };

        match message {
            Message::Text(text) => {
                let text = text.to_string();
                if text.len() > MAX_INBOUND_BYTES {
                    warn!(client_id, size = text.len(), "oversized inbound message, closing");
                    break;
                }
                handle_envelope(client_id, &text, hub, logs, commands).await;
            }
            Message::Binary(data) => {
                if data.len() > MAX_INBOUND_BYTES {
                    warn!(client_id, size = data.len(), "oversized inbound message, closing");
                    break;
                }
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
        }
    }
}

async fn handle_envelope(
    client_id: u64,
    text: &str,
    hub: &Arc<WSHub>,
    logs: &Arc<LogStreamManager>,
    commands: &Arc<CommandContext>,
) {
    for line in text.split('\n') {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let envelope: Envelope = match serde_json::from_str(line) {
            Ok(e) => e,
            Err(e) => {
                debug!(client_id, error = %e, "failed to parse inbound envelope");
                continue;
            }
        };

        match envelope.kind.as_str() {
            "subscribe" => {
                if let Ok(p) = serde_json::from_value::<SubscribePayload>(envelope.payload) {
                    if let Some(agent_id) = p.channel.strip_prefix("logs:") {
                        let sink: Arc<dyn crate::logstream::LogSink> = hub.clone();
                        logs.subscribe(agent_id, client_id, sink).await;
                    }
                    hub.subscribe(client_id, &p.channel).await;
                }
            }
            "unsubscribe" => {
                if let Ok(p) = serde_json::from_value::<UnsubscribePayload>(envelope.payload) {
                    if let Some(agent_id) = p.channel.strip_prefix("logs:") {
                        logs.unsubscribe(agent_id, client_id).await;
                    }
                    hub.unsubscribe(client_id, &p.channel).await;
                }
            }
            "command" => {
                if let Ok(p) = serde_json::from_value::<CommandPayload>(envelope.payload) {
                    let commands = commands.clone();
                    let hub = hub.clone();
                    tokio::spawn(async move {
                        let result = run_command(&commands, p.id, &p.action, p.args).await;
                        hub.reply_to(client_id, Envelope::new("command.result", result))
                            .await;
                    });
                }
            }
            other => debug!(client_id, kind = other, "unrecognized envelope type"),
        }
    }
}

async fn run_writer(
    mut sender: futures_util::stream::SplitSink<
        WebSocketStream<TokioIo<hyper::upgrade::Upgraded>>,
        Message,
    >,
    mut rx: mpsc::Receiver<String>,
) {
    let mut ping_timer = interval(PING_INTERVAL);
    loop {
        tokio::select! {
            first = rx.recv() => {
                let Some(first) = first else { break };
                let mut batch = vec![first];
                while let Ok(next) = rx.try_recv() {
                    batch.push(next);
                }
                if sender.send(Message::Text(batch.join("\n").into())).await.is_err() {
                    break;
                }
            }
            _ = ping_timer.tick() => {
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }
}
