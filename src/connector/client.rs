// =============================================================================
// Broker client — one TLS connection, request correlation, event fan-out
// =============================================================================
//
// Owns the transport. Outbound requests carry a generated correlation id
// and suspend on a oneshot until the matching response frame arrives or the
// 10-second deadline elapses. Frames without a matching correlation id are
// unsolicited events and are forwarded, in arrival order, to the event
// channel wired up by the adapter — higher-level caches are never touched
// from the reader task itself.
//
// A liveness ping goes out every 10 seconds while connected. On stream
// end or I/O error the reader task fails all in-flight requests, flips the
// connected flag and reports the reason; reconnection policy lives above.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use prost::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_native_tls::TlsStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::connector::frame::{encode_frame, FrameCodec};
use crate::connector::proto::{payload_type, PingReq, ProtoMessage};
use crate::error::{ConnectorError, ConnectorResult};

/// Deadline for a correlated request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Liveness ping cadence.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

type Writer = WriteHalf<TlsStream<TcpStream>>;
type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<(u32, Vec<u8>)>>>>;

/// Events delivered to the adapter: unsolicited frames and disconnects.
#[derive(Debug)]
pub enum ClientEvent {
    Message { payload_type: u32, payload: Vec<u8> },
    Disconnected { reason: String },
}

pub struct BrokerClient {
    me: Weak<BrokerClient>,
    host: String,
    port: u16,
    writer: tokio::sync::Mutex<Option<Writer>>,
    pending: Pending,
    event_tx: Mutex<Option<mpsc::Sender<ClientEvent>>>,
    connected: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BrokerClient {
    pub fn new(host: impl Into<String>, port: u16) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            host: host.into(),
            port,
            writer: tokio::sync::Mutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            event_tx: Mutex::new(None),
            connected: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    fn arc(&self) -> Arc<Self> {
        self.me.upgrade().expect("client outlives its methods")
    }

    /// Wire the event channel. Must be called once before `connect`.
    pub fn set_event_channel(&self, tx: mpsc::Sender<ClientEvent>) {
        *self.event_tx.lock() = Some(tx);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Open the TLS transport and start the reader and heartbeat tasks.
    /// Authentication is the adapter's job. Safe to call again after a
    /// connection loss; stale tasks are torn down first.
    pub async fn connect(&self) -> ConnectorResult<()> {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        info!(host = %self.host, port = self.port, "connecting to broker");

        let tcp = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| ConnectorError::Connection(format!("tcp connect: {e}")))?;

        let tls = native_tls_connector()?;
        let stream = tls
            .connect(&self.host, tcp)
            .await
            .map_err(|e| ConnectorError::Connection(format!("tls handshake: {e}")))?;

        let (read_half, write_half) = tokio::io::split(stream);
        *self.writer.lock().await = Some(write_half);
        self.connected.store(true, Ordering::SeqCst);

        let reader = {
            let client = self.arc();
            tokio::spawn(async move {
                let reason = client.read_loop(read_half).await;
                client.on_stream_down(reason).await;
            })
        };

        let heartbeat = {
            let client = self.arc();
            tokio::spawn(async move {
                client.heartbeat_loop().await;
            })
        };

        let mut tasks = self.tasks.lock();
        tasks.push(reader);
        tasks.push(heartbeat);

        info!("broker transport established");
        Ok(())
    }

    /// Tear down the transport. Idempotent.
    pub async fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }

        self.fail_pending();
        info!("broker transport closed");
    }

    // -------------------------------------------------------------------------
    // Requests
    // -------------------------------------------------------------------------

    /// Send a request and await the correlated response.
    pub async fn send_request<M: Message>(
        &self,
        msg: &M,
        payload_type: u32,
    ) -> ConnectorResult<(u32, Vec<u8>)> {
        if !self.is_connected() {
            return Err(ConnectorError::Connection("not connected".into()));
        }

        let client_msg_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(client_msg_id.clone(), tx);

        let envelope = ProtoMessage::new(
            payload_type,
            msg.encode_to_vec(),
            Some(client_msg_id.clone()),
        );

        if let Err(e) = self.write_frame(&envelope).await {
            self.pending.lock().remove(&client_msg_id);
            return Err(e);
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(ConnectorError::Shutdown),
            Err(_) => {
                self.pending.lock().remove(&client_msg_id);
                Err(ConnectorError::Timeout(client_msg_id))
            }
        }
    }

    /// Fire-and-forget command; no correlation id, no waiter.
    pub async fn send_command<M: Message>(
        &self,
        msg: &M,
        payload_type: u32,
    ) -> ConnectorResult<()> {
        if !self.is_connected() {
            return Err(ConnectorError::Connection("not connected".into()));
        }
        let envelope = ProtoMessage::new(payload_type, msg.encode_to_vec(), None);
        self.write_frame(&envelope).await
    }

    async fn write_frame(&self, envelope: &ProtoMessage) -> ConnectorResult<()> {
        let framed = encode_frame(&envelope.encode_to_vec());

        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| ConnectorError::Connection("transport down".into()))?;

        writer
            .write_all(&framed)
            .await
            .map_err(|e| ConnectorError::Connection(format!("write: {e}")))
    }

    // -------------------------------------------------------------------------
    // Reader
    // -------------------------------------------------------------------------

    async fn read_loop(&self, mut reader: ReadHalf<TlsStream<TcpStream>>) -> String {
        let mut codec = FrameCodec::new();
        let mut buf = vec![0u8; 16 * 1024];

        loop {
            match reader.read(&mut buf).await {
                Ok(0) => return "stream closed by peer".to_string(),
                Ok(n) => {
                    codec.extend(&buf[..n]);
                    loop {
                        match codec.next_frame() {
                            Ok(Some(frame)) => self.dispatch_frame(&frame).await,
                            Ok(None) => break,
                            Err(e) => return format!("framing error: {e}"),
                        }
                    }
                }
                Err(e) => return format!("read error: {e}"),
            }
        }
    }

    async fn dispatch_frame(&self, frame: &[u8]) {
        let envelope = match ProtoMessage::decode_frame(frame) {
            Ok(env) => env,
            Err(e) => {
                error!(error = %e, "failed to decode envelope — frame dropped");
                return;
            }
        };

        // 1. Correlated response for a pending request?
        if let Some(id) = &envelope.client_msg_id {
            if let Some(waiter) = self.pending.lock().remove(id) {
                let _ = waiter.send((envelope.payload_type, envelope.payload));
                return;
            }
        }

        // 2. Heartbeat replies are noise.
        if envelope.payload_type == payload_type::PING_RES {
            return;
        }

        // 3. Unsolicited event — forward in arrival order.
        let tx = self.event_tx.lock().clone();
        if let Some(tx) = tx {
            if tx
                .send(ClientEvent::Message {
                    payload_type: envelope.payload_type,
                    payload: envelope.payload,
                })
                .await
                .is_err()
            {
                warn!("event channel closed — dropping broker event");
            }
        }
    }

    async fn heartbeat_loop(&self) {
        let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        interval.tick().await; // first tick fires immediately; skip it
        loop {
            interval.tick().await;
            if !self.is_connected() {
                return;
            }
            let ping = PingReq {
                timestamp: chrono::Utc::now().timestamp_millis() as u64,
            };
            if let Err(e) = self.send_command(&ping, payload_type::PING_REQ).await {
                debug!(error = %e, "heartbeat send failed");
            }
        }
    }

    async fn on_stream_down(&self, reason: String) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return; // already disconnected deliberately
        }
        warn!(reason = %reason, "broker connection lost");
        self.fail_pending();

        let tx = self.event_tx.lock().clone();
        if let Some(tx) = tx {
            let _ = tx.send(ClientEvent::Disconnected { reason }).await;
        }
    }

    fn fail_pending(&self) {
        // Dropping the senders wakes every waiter with a channel-closed
        // error, which send_request maps to Shutdown.
        self.pending.lock().clear();
    }
}

fn native_tls_connector() -> ConnectorResult<tokio_native_tls::TlsConnector> {
    let inner = tokio_native_tls::native_tls::TlsConnector::new()
        .map_err(|e| ConnectorError::Connection(format!("tls init: {e}")))?;
    Ok(tokio_native_tls::TlsConnector::from(inner))
}

impl std::fmt::Debug for BrokerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerClient")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("connected", &self.is_connected())
            .field("pending", &self.pending.lock().len())
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
    async fn send_request_fails_when_disconnected() {
        let client = BrokerClient::new("localhost", 5035);
        let ping = PingReq { timestamp: 0 };
        let err = client
            .send_request(&ping, payload_type::PING_REQ)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::Connection(_)));
    }

    #[tokio::test]
    async fn send_command_fails_when_disconnected() {
        let client = BrokerClient::new("localhost", 5035);
        let ping = PingReq { timestamp: 0 };
        assert!(client
            .send_command(&ping, payload_type::PING_REQ)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let client = BrokerClient::new("localhost", 5035);
        client.disconnect().await;
        client.disconnect().await;
        assert!(!client.is_connected());
    }
}
