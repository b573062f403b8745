// =============================================================================
// Hub client — telemetry uplink and control channel over WebSocket
// =============================================================================
//
// Publishes telemetry and per-bar signals to the operations hub and
// receives control commands. Commands are forwarded on an mpsc channel and
// acknowledged by correlation id once the orchestrator has produced a
// result — the hub never calls back into the orchestrator directly.
//
// Reconnection is driven from the orchestrator's 15 s loop; this client
// only reports its connected state.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::stream::{SplitSink, StreamExt};
use futures_util::SinkExt;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{error, info, warn};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// A control command received from the hub.
#[derive(Debug, Clone)]
pub struct HubCommand {
    /// Correlation id to acknowledge.
    pub id: String,
    pub action: String,
    pub params: serde_json::Value,
}

pub struct HubClient {
    me: Weak<HubClient>,
    url: String,
    token: String,
    instance_id: String,
    sink: tokio::sync::Mutex<Option<WsSink>>,
    connected: AtomicBool,
    authenticated: AtomicBool,
    command_tx: mpsc::Sender<HubCommand>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

impl HubClient {
    pub fn new(
        url: impl Into<String>,
        token: impl Into<String>,
        instance_id: impl Into<String>,
        command_tx: mpsc::Sender<HubCommand>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            url: url.into(),
            token: token.into(),
            instance_id: instance_id.into(),
            sink: tokio::sync::Mutex::new(None),
            connected: AtomicBool::new(false),
            authenticated: AtomicBool::new(false),
            command_tx,
            recv_task: Mutex::new(None),
        })
    }

    fn arc(&self) -> Arc<Self> {
        self.me.upgrade().expect("hub client outlives its methods")
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.authenticated.load(Ordering::SeqCst)
    }

    // -------------------------------------------------------------------------
    // Connection
    // -------------------------------------------------------------------------

    /// Connect and run the token auth handshake. Returns `true` on success.
    pub async fn connect(&self) -> bool {
        let (stream, _response) = match connect_async(&self.url).await {
            Ok(ok) => ok,
            Err(e) => {
                warn!(url = %self.url, error = %e, "hub connect failed");
                return false;
            }
        };
        self.connected.store(true, Ordering::SeqCst);
        info!(url = %self.url, "connected to hub");

        let (mut sink, mut stream) = stream.split();

        let auth = serde_json::json!({
            "type": "auth",
            "id": format!("auth-{}", self.instance_id),
            "payload": {
                "token": self.token,
                "role": "bot",
                "instance_id": self.instance_id,
            }
        });
        if sink.send(Message::Text(auth.to_string())).await.is_err() {
            self.connected.store(false, Ordering::SeqCst);
            return false;
        }

        // Wait for the auth reply.
        let reply = tokio::time::timeout(Duration::from_secs(5), stream.next()).await;
        let authenticated = match reply {
            Ok(Some(Ok(Message::Text(text)))) => {
                serde_json::from_str::<serde_json::Value>(&text)
                    .ok()
                    .and_then(|v| {
                        v.get("payload")
                            .and_then(|p| p.get("status"))
                            .and_then(|s| s.as_str())
                            .map(|s| s == "authenticated")
                    })
                    .unwrap_or(false)
            }
            _ => false,
        };

        if !authenticated {
            error!("hub auth failed");
            self.connected.store(false, Ordering::SeqCst);
            return false;
        }

        self.authenticated.store(true, Ordering::SeqCst);
        *self.sink.lock().await = Some(sink);
        info!("hub auth ok");

        // Command listener.
        let client = self.arc();
        let task = tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(Message::Text(text)) => client.handle_incoming(&text).await,
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            client.connected.store(false, Ordering::SeqCst);
            client.authenticated.store(false, Ordering::SeqCst);
            warn!("hub stream ended");
        });
        *self.recv_task.lock() = Some(task);

        true
    }

    pub async fn disconnect(&self) {
        if let Some(task) = self.recv_task.lock().take() {
            task.abort();
        }
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.close().await;
        }
        self.connected.store(false, Ordering::SeqCst);
        self.authenticated.store(false, Ordering::SeqCst);
        info!("disconnected from hub");
    }

    async fn handle_incoming(&self, text: &str) {
        let Ok(data) = serde_json::from_str::<serde_json::Value>(text) else {
            return;
        };

        match data.get("type").and_then(|t| t.as_str()) {
            Some("command") => {
                let id = data
                    .get("id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let payload = data.get("payload").cloned().unwrap_or_default();
                let action = payload
                    .get("action")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let params = payload
                    .get("params")
                    .cloned()
                    .unwrap_or(serde_json::Value::Null);

                info!(%action, %id, "hub command received");
                if self
                    .command_tx
                    .send(HubCommand { id, action, params })
                    .await
                    .is_err()
                {
                    warn!("command channel closed — hub command dropped");
                }
            }
            // Telemetry/signal acks and anything else are noise.
            _ => {}
        }
    }

    // -------------------------------------------------------------------------
    // Outbound
    // -------------------------------------------------------------------------

    pub async fn send_telemetry(&self, data: serde_json::Value) -> bool {
        self.send(serde_json::json!({
            "type": "telemetry",
            "id": format!("tel-{}", chrono::Utc::now().timestamp()),
            "payload": data,
        }))
        .await
    }

    pub async fn send_signal(&self, data: serde_json::Value) -> bool {
        self.send(serde_json::json!({
            "type": "signal",
            "id": format!("sig-{}", chrono::Utc::now().timestamp()),
            "payload": data,
        }))
        .await
    }

    /// Acknowledge a command by its correlation id.
    pub async fn send_ack(&self, ref_id: &str, status: &str, result: serde_json::Value) -> bool {
        self.send(serde_json::json!({
            "type": "ack",
            "payload": {
                "ref_id": ref_id,
                "status": status,
                "result": result,
            }
        }))
        .await
    }

    async fn send(&self, data: serde_json::Value) -> bool {
        if !self.is_connected() {
            return false;
        }
        let mut guard = self.sink.lock().await;
        let Some(sink) = guard.as_mut() else {
            return false;
        };
        match sink.send(Message::Text(data.to_string())).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "hub send failed");
                self.connected.store(false, Ordering::SeqCst);
                false
            }
        }
    }
}

impl std::fmt::Debug for HubClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubClient")
            .field("url", &self.url)
            .field("token", &"<redacted>")
            .field("instance_id", &self.instance_id)
            .field("connected", &self.is_connected())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_before_connect_returns_false() {
        let (tx, _rx) = mpsc::channel(4);
        let hub = HubClient::new("ws://localhost:1/ws", "t", "bot-test", tx);
        assert!(!hub.is_connected());
        assert!(!hub.send_telemetry(serde_json::json!({})).await);
    }

    #[tokio::test]
    async fn incoming_command_is_forwarded_with_id() {
        let (tx, mut rx) = mpsc::channel(4);
        let hub = HubClient::new("ws://localhost:1/ws", "t", "bot-test", tx);

        hub.handle_incoming(
            r#"{"type":"command","id":"cmd-9","payload":{"action":"pause","params":{"a":1}}}"#,
        )
        .await;

        let cmd = rx.recv().await.unwrap();
        assert_eq!(cmd.id, "cmd-9");
        assert_eq!(cmd.action, "pause");
        assert_eq!(cmd.params["a"], 1);
    }

    #[tokio::test]
    async fn non_command_messages_are_ignored() {
        let (tx, mut rx) = mpsc::channel(4);
        let hub = HubClient::new("ws://localhost:1/ws", "t", "bot-test", tx);

        hub.handle_incoming(r#"{"type":"ack","payload":{}}"#).await;
        hub.handle_incoming("not json").await;

        assert!(rx.try_recv().is_err());
    }
}
