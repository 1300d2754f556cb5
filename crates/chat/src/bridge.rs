//! Upstream Chat Bridge: a single socket to a fixed host/port, correlating
//! `chat.send`/`chat.abort` requests to inbound streaming events by a
//! bridge-assigned correlation id.
//!
//! Grounded on `tui::connection::ConnectionManager`'s `connection_loop`:
//! a single managed upstream connection, spawned once and driven from a
//! background task, reconnecting on drop. Unlike that manager (which
//! forwards every inbound frame to one operator UI), this bridge keys
//! inbound events by a correlation map so each event reaches only the
//! relay session whose `chat.send` requested it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use relay_protocol::{CONNECT_ATTEMPT_TIMEOUT_MS, RELAY_RECONNECT_DELAY_MS};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Result;

/// An event routed out of the bridge to the gateway for delivery to a session.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    Delta { request_id: String, text: String },
    Tool { request_id: String, tool: Value },
    Final { request_id: String, text: String },
    Error { request_id: String, message: String },
    /// Republished unchanged on the Change Bus as `trace:progress`.
    TraceProgress(Value),
}

struct PendingRequest {
    session_token: String,
    request_id: String,
    thread_id: Option<String>,
}

/// Client handle to the bridge; cheap to clone, shares the connection.
#[derive(Clone)]
pub struct UpstreamChatBridge {
    outbound_tx: mpsc::UnboundedSender<OutboundRequest>,
    connected: Arc<std::sync::atomic::AtomicBool>,
}

struct OutboundRequest {
    method: &'static str,
    session_token: String,
    request_id: String,
    thread_id: Option<String>,
    text: Option<String>,
    correlation_id: String,
}

impl UpstreamChatBridge {
    /// Connect to `host:port`, spawning the background run loop. Returns
    /// the bridge handle and a receiver of routed events.
    pub fn connect(host: &str, port: u16) -> (Self, mpsc::UnboundedReceiver<BridgeEvent>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let url = format!("ws://{host}:{port}/ws");
        tokio::spawn(run_loop(url, outbound_rx, events_tx, connected.clone()));

        (Self { outbound_tx, connected }, events_rx)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Send a chat message upstream, allocating a correlation id and
    /// recording `{sessionToken, requestId, threadId}` against it.
    pub fn send_chat_message(
        &self,
        text: String,
        session_token: String,
        request_id: String,
        thread_id: Option<String>,
    ) -> Result<()> {
        self.dispatch("chat.send", session_token, request_id, thread_id, Some(text))
    }

    pub fn abort(&self, session_token: String, request_id: String) -> Result<()> {
        self.dispatch("chat.abort", session_token, request_id, None, None)
    }

    fn dispatch(
        &self,
        method: &'static str,
        session_token: String,
        request_id: String,
        thread_id: Option<String>,
        text: Option<String>,
    ) -> Result<()> {
        let correlation_id = uuid_like_id();
        self.outbound_tx
            .send(OutboundRequest { method, session_token, request_id, thread_id, text, correlation_id })
            .map_err(|_| crate::error::Error::message("upstream chat bridge is shut down"))
    }
}

fn uuid_like_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let t = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos();
    format!("{t:x}-{n:x}")
}

async fn run_loop(
    url: String,
    mut outbound_rx: mpsc::UnboundedReceiver<OutboundRequest>,
    events_tx: mpsc::UnboundedSender<BridgeEvent>,
    connected: Arc<std::sync::atomic::AtomicBool>,
) {
    let pending: Arc<RwLock<HashMap<String, PendingRequest>>> = Arc::new(RwLock::new(HashMap::new()));

    loop {
        let attempt = tokio::time::timeout(
            Duration::from_millis(CONNECT_ATTEMPT_TIMEOUT_MS),
            tokio_tungstenite::connect_async(&url),
        )
        .await;

        match attempt {
            Ok(Ok((ws_stream, _))) => {
                debug!(%url, "upstream chat bridge connected");
                connected.store(true, Ordering::Relaxed);
                let (mut write, mut read) = ws_stream.split();

                loop {
                    tokio::select! {
                        msg = read.next() => {
                            match msg {
                                Some(Ok(Message::Text(text))) => {
                                    handle_inbound(&text, &pending, &events_tx).await;
                                }
                                Some(Ok(Message::Close(_))) | None => {
                                    debug!("upstream chat bridge closed");
                                    break;
                                }
                                Some(Err(e)) => {
                                    warn!(error = %e, "upstream chat bridge read error");
                                    break;
                                }
                                _ => {}
                            }
                        }
                        outbound = outbound_rx.recv() => {
                            match outbound {
                                Some(req) => {
                                    let payload = serde_json::json!({
                                        "type": "req",
                                        "id": req.correlation_id,
                                        "method": req.method,
                                        "params": {
                                            "text": req.text,
                                            "threadId": req.thread_id,
                                        },
                                    });
                                    pending.write().await.insert(
                                        req.correlation_id.clone(),
                                        PendingRequest {
                                            session_token: req.session_token,
                                            request_id: req.request_id,
                                            thread_id: req.thread_id,
                                        },
                                    );
                                    if write.send(Message::Text(payload.to_string().into())).await.is_err() {
                                        warn!("upstream chat bridge write failed");
                                        break;
                                    }
                                }
                                None => return, // bridge handle dropped
                            }
                        }
                    }
                }
                connected.store(false, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                debug!(error = %e, %url, "upstream chat bridge connect failed");
            }
            Err(_) => {
                debug!(%url, "upstream chat bridge connect attempt timed out");
            }
        }

        tokio::time::sleep(Duration::from_millis(RELAY_RECONNECT_DELAY_MS)).await;
    }
}

#[derive(Deserialize)]
struct InboundFrame {
    #[serde(rename = "type")]
    frame_type: String,
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    id: Option<String>,
}

async fn handle_inbound(
    text: &str,
    pending: &Arc<RwLock<HashMap<String, PendingRequest>>>,
    events_tx: &mpsc::UnboundedSender<BridgeEvent>,
) {
    let Ok(frame) = serde_json::from_str::<InboundFrame>(text) else {
        warn!("upstream chat bridge received malformed frame");
        return;
    };
    if frame.frame_type != "event" {
        return;
    }
    let Some(event) = frame.event.as_deref() else { return };

    if event == "trace.progress" {
        let _ = events_tx.send(BridgeEvent::TraceProgress(frame.payload));
        return;
    }

    let correlation_id = frame.id.unwrap_or_default();
    let is_terminal = matches!(event, "chat.final" | "chat.error");

    let request_id = {
        let guard = pending.read().await;
        match guard.get(&correlation_id) {
            Some(req) => req.request_id.clone(),
            None => return,
        }
    };

    match event {
        "chat.delta" => {
            let text = frame.payload.get("text").and_then(Value::as_str).unwrap_or_default().to_string();
            let _ = events_tx.send(BridgeEvent::Delta { request_id, text });
        },
        "chat.tool" => {
            let _ = events_tx.send(BridgeEvent::Tool { request_id, tool: frame.payload });
        },
        "chat.final" => {
            let text = frame.payload.get("text").and_then(Value::as_str).unwrap_or_default().to_string();
            let _ = events_tx.send(BridgeEvent::Final { request_id, text });
        },
        "chat.error" => {
            let message = frame.payload.get("message").and_then(Value::as_str).unwrap_or("upstream chat error").to_string();
            let _ = events_tx.send(BridgeEvent::Error { request_id, message });
        },
        _ => {},
    }

    if is_terminal {
        pending.write().await.remove(&correlation_id);
    }
}
