//! Client message protocol.
//!
//! Clients exchange JSON objects tagged with a `type` field. A
//! [`ClientSession`] turns requests into catalog/broker calls and forwards the
//! broker's events for its subscriber id as [`ServerMessage`]s.
//!
//! | Request       | Fields              | Answered by                     |
//! |---------------|---------------------|---------------------------------|
//! | `list_ports`  |                     | `ports`                         |
//! | `connect`     | `port`, `baudRate`? | `connected` / `connection_error`|
//! | `disconnect`  | `port`              | `disconnected`                  |
//! | `send_data`   | `port`, `data`      | (nothing) / `error`             |
//! | `ping`        |                     | `pong`                          |

use std::fmt::Write as _;
use std::sync::Arc;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::broker::{DEFAULT_BAUD, SerialBroker, SerialEvent, SubscriberId, timestamp_millis};
use crate::catalog::PortCatalog;
use crate::device::DetectedPort;

/// Request sent by a client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    /// Enumerate ports.
    ListPorts,
    /// Subscribe to a port.
    Connect {
        /// Port name.
        port: String,
        /// Requested rate; the broker default when absent.
        #[serde(rename = "baudRate", default)]
        baud_rate: Option<u32>,
    },
    /// Unsubscribe from a port.
    Disconnect {
        /// Port name.
        port: String,
    },
    /// Write text to a port.
    SendData {
        /// Port name.
        port: String,
        /// Text written as-is.
        data: String,
    },
    /// Liveness check.
    Ping,
}

impl ClientRequest {
    /// Parse one JSON message.
    pub fn parse(text: &str) -> Result<Self, String> {
        serde_json::from_str(text).map_err(|e| format!("Invalid message: {e}"))
    }
}

/// Message sent to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Port listing.
    Ports {
        /// Ports found, sorted.
        list: Vec<DetectedPort>,
        /// Discovery failure, when the list is empty because of it.
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Subscription is live at the effective rate.
    Connected {
        /// Port name.
        port: String,
        /// Rate the port actually runs at.
        #[serde(rename = "baudRate")]
        baud_rate: u32,
    },
    /// Subscription ended.
    Disconnected {
        /// Port name.
        port: String,
    },
    /// One line of serial output.
    SerialData {
        /// Port name.
        port: String,
        /// Line without its terminator.
        data: String,
        /// Read time in milliseconds since the Unix epoch.
        timestamp: u64,
    },
    /// One raw chunk of serial output.
    SerialDataRaw {
        /// Port name.
        port: String,
        /// Chunk decoded as lossy UTF-8.
        data: String,
        /// Chunk as lowercase hex.
        #[serde(rename = "dataHex")]
        data_hex: String,
        /// Read time in milliseconds since the Unix epoch.
        timestamp: u64,
    },
    /// Open, read or write failure on a port.
    ConnectionError {
        /// Port name.
        port: String,
        /// Error text.
        error: String,
    },
    /// The port was taken over for programming.
    ForcedDisconnect {
        /// Port name.
        port: String,
    },
    /// Reply to `ping`.
    Pong {
        /// Server time in milliseconds since the Unix epoch.
        timestamp: u64,
    },
    /// Malformed or failed request.
    Error {
        /// Human-readable reason.
        message: String,
    },
}

impl ServerMessage {
    /// Build an `error` message.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Serialize to one JSON line.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"type":"error","message":"serialization failed: {e}"}}"#)
        })
    }
}

/// Lowercase hex of `bytes`.
pub fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

impl From<SerialEvent> for ServerMessage {
    fn from(event: SerialEvent) -> Self {
        match event {
            SerialEvent::Connected { port, baud_rate } => Self::Connected { port, baud_rate },
            SerialEvent::Line {
                port,
                text,
                timestamp,
            } => Self::SerialData {
                port,
                data: text,
                timestamp,
            },
            SerialEvent::Raw {
                port,
                bytes,
                timestamp,
            } => Self::SerialDataRaw {
                port,
                data: String::from_utf8_lossy(&bytes).into_owned(),
                data_hex: to_hex(&bytes),
                timestamp,
            },
            SerialEvent::ConnectionError { port, error } => Self::ConnectionError { port, error },
            SerialEvent::Preempted { port } => Self::ForcedDisconnect { port },
            SerialEvent::Disconnected { port } => Self::Disconnected { port },
        }
    }
}

/// One connected client.
pub struct ClientSession {
    id: SubscriberId,
    broker: Arc<SerialBroker>,
    catalog: PortCatalog,
    outbound: mpsc::UnboundedSender<ServerMessage>,
    events: Option<mpsc::UnboundedSender<SerialEvent>>,
    forwarder: JoinHandle<()>,
}

impl ClientSession {
    /// Open a session whose replies and events go to `outbound`.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(
        broker: Arc<SerialBroker>,
        catalog: PortCatalog,
        outbound: mpsc::UnboundedSender<ServerMessage>,
    ) -> Self {
        let (events, mut rx) = mpsc::unbounded_channel::<SerialEvent>();
        let out = outbound.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if out.send(ServerMessage::from(event)).is_err() {
                    break;
                }
            }
        });
        let id = broker.next_subscriber_id();
        debug!("Client session {id} opened");
        Self {
            id,
            broker,
            catalog,
            outbound,
            events: Some(events),
            forwarder,
        }
    }

    /// Subscriber id used with the broker.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    fn reply(&self, message: ServerMessage) {
        let _ = self.outbound.send(message);
    }

    /// Handle one raw message line.
    pub async fn handle_text(&self, text: &str) {
        match ClientRequest::parse(text) {
            Ok(request) => self.handle(request).await,
            Err(message) => {
                debug!("Session {}: {message}", self.id);
                self.reply(ServerMessage::error(message));
            },
        }
    }

    /// Handle one request.
    pub async fn handle(&self, request: ClientRequest) {
        match request {
            ClientRequest::ListPorts => {
                let listing = self.catalog.list_ports().await;
                self.reply(ServerMessage::Ports {
                    list: listing.ports,
                    error: listing.error,
                });
            },
            ClientRequest::Connect { port, baud_rate } => {
                let Some(events) = self.events.clone() else {
                    return;
                };
                let baud = baud_rate.unwrap_or(DEFAULT_BAUD);
                if let Err(e) = self.broker.subscribe(&port, baud, self.id, events).await {
                    warn!("Session {}: connect {port} failed: {e}", self.id);
                    self.reply(ServerMessage::ConnectionError {
                        port,
                        error: e.to_string(),
                    });
                }
            },
            ClientRequest::Disconnect { port } => {
                if let Err(e) = self.broker.unsubscribe(&port, self.id).await {
                    debug!("Session {}: disconnect {port}: {e}", self.id);
                    // already gone; the client still expects a confirmation
                    self.reply(ServerMessage::Disconnected { port });
                }
            },
            ClientRequest::SendData { port, data } => {
                if let Err(e) = self.broker.send(&port, data.as_bytes()) {
                    self.reply(ServerMessage::error(format!(
                        "Failed to send to {port}: {e}"
                    )));
                }
            },
            ClientRequest::Ping => self.reply(ServerMessage::Pong {
                timestamp: timestamp_millis(),
            }),
        }
    }

    /// Leave every port and flush pending events.
    pub async fn close(mut self) {
        self.broker.unsubscribe_all(self.id).await;
        self.events.take();
        if self.forwarder.await.is_err() {
            warn!("Session {} event forwarder panicked", self.id);
        }
        debug!("Client session {} closed", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::PortOpener;
    use crate::port::testing::FakeOpener;
    use crate::tool::testing::ScriptedRunner;
    use crate::tool::{ToolAdapter, ToolConfig, ToolOutput, ToolRunner};
    use std::time::Duration;

    const PORT: &str = "/dev/ttyUSB0";

    struct Harness {
        opener: Arc<FakeOpener>,
        runner: Arc<ScriptedRunner>,
        broker: Arc<SerialBroker>,
    }

    impl Harness {
        fn new() -> Self {
            let opener = Arc::new(FakeOpener::default());
            let broker = Arc::new(SerialBroker::new(
                Arc::clone(&opener) as Arc<dyn PortOpener>
            ));
            Self {
                opener,
                runner: Arc::new(ScriptedRunner::default()),
                broker,
            }
        }

        fn session(&self) -> (ClientSession, mpsc::UnboundedReceiver<ServerMessage>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let catalog = PortCatalog::new(ToolAdapter::new(
                Arc::clone(&self.runner) as Arc<dyn ToolRunner>,
                ToolConfig::default(),
            ));
            (ClientSession::new(Arc::clone(&self.broker), catalog, tx), rx)
        }
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("message timed out")
            .expect("channel closed")
    }

    #[test]
    fn test_parse_requests() {
        assert_eq!(
            ClientRequest::parse(r#"{"type":"connect","port":"COM3","baudRate":9600}"#).unwrap(),
            ClientRequest::Connect {
                port: "COM3".into(),
                baud_rate: Some(9600)
            }
        );
        assert_eq!(
            ClientRequest::parse(r#"{"type":"connect","port":"COM3"}"#).unwrap(),
            ClientRequest::Connect {
                port: "COM3".into(),
                baud_rate: None
            }
        );
        assert_eq!(
            ClientRequest::parse(r#"{"type":"ping"}"#).unwrap(),
            ClientRequest::Ping
        );
    }

    #[test]
    fn test_parse_errors_are_messages() {
        assert!(ClientRequest::parse("{").is_err());
        assert!(
            ClientRequest::parse(r#"{"type":"disconnect"}"#)
                .unwrap_err()
                .contains("port")
        );
        assert!(ClientRequest::parse(r#"{"type":"reboot"}"#).is_err());
    }

    #[test]
    fn test_server_message_json_shape() {
        let raw = ServerMessage::from(SerialEvent::Raw {
            port: PORT.into(),
            bytes: b"ok\n".to_vec(),
            timestamp: 7,
        });
        let json: serde_json::Value = serde_json::from_str(&raw.to_json()).unwrap();
        assert_eq!(json["type"], "serial_data_raw");
        assert_eq!(json["dataHex"], "6f6b0a");
        assert_eq!(json["data"], "ok\n");
        assert_eq!(json["timestamp"], 7);

        let connected = ServerMessage::Connected {
            port: PORT.into(),
            baud_rate: 9600,
        };
        let json: serde_json::Value = serde_json::from_str(&connected.to_json()).unwrap();
        assert_eq!(json["baudRate"], 9600);

        let preempted = ServerMessage::from(SerialEvent::Preempted { port: PORT.into() });
        assert!(preempted.to_json().contains(r#""type":"forced_disconnect""#));
    }

    #[tokio::test]
    async fn test_bad_input_yields_error_message() {
        let h = Harness::new();
        let (session, mut rx) = h.session();
        session.handle_text("not json").await;
        session.handle_text(r#"{"type":"send_data","port":"COM1"}"#).await;

        assert!(matches!(next(&mut rx).await, ServerMessage::Error { .. }));
        match next(&mut rx).await {
            ServerMessage::Error { message } => assert!(message.contains("data")),
            other => panic!("unexpected {other:?}"),
        }
        session.close().await;
    }

    #[tokio::test]
    async fn test_connect_defaults_baud_and_streams_data() {
        let h = Harness::new();
        let (session, mut rx) = h.session();
        session
            .handle_text(&format!(r#"{{"type":"connect","port":"{PORT}"}}"#))
            .await;
        assert_eq!(
            next(&mut rx).await,
            ServerMessage::Connected {
                port: PORT.into(),
                baud_rate: DEFAULT_BAUD
            }
        );

        h.opener.wire(PORT).push(b"hello\n");
        assert!(matches!(
            next(&mut rx).await,
            ServerMessage::SerialDataRaw { .. }
        ));
        match next(&mut rx).await {
            ServerMessage::SerialData { data, .. } => assert_eq!(data, "hello"),
            other => panic!("unexpected {other:?}"),
        }

        session
            .handle(ClientRequest::SendData {
                port: PORT.into(),
                data: "reset\n".into(),
            })
            .await;
        assert_eq!(
            h.opener.wire(PORT).written.lock().unwrap().as_slice(),
            b"reset\n"
        );

        session
            .handle(ClientRequest::Disconnect { port: PORT.into() })
            .await;
        assert_eq!(
            next(&mut rx).await,
            ServerMessage::Disconnected { port: PORT.into() }
        );
        assert!(h.broker.open_ports().is_empty());
        session.close().await;
    }

    #[tokio::test]
    async fn test_two_sessions_share_port_and_get_preempted() {
        let h = Harness::new();
        let (a, mut rx_a) = h.session();
        let (b, mut rx_b) = h.session();
        for session in [&a, &b] {
            session
                .handle(ClientRequest::Connect {
                    port: PORT.into(),
                    baud_rate: Some(9600),
                })
                .await;
        }
        assert_eq!(h.opener.opens.load(std::sync::atomic::Ordering::SeqCst), 1);

        h.broker.force_close(PORT).await;
        for rx in [&mut rx_a, &mut rx_b] {
            assert!(matches!(next(rx).await, ServerMessage::Connected { .. }));
            assert_eq!(
                next(rx).await,
                ServerMessage::ForcedDisconnect { port: PORT.into() }
            );
        }
        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn test_reconnect_during_programming_is_refused() {
        let h = Harness::new();
        let (session, mut rx) = h.session();
        let lease = h.broker.claim_for_programming(PORT).await.unwrap();

        session
            .handle(ClientRequest::Connect {
                port: PORT.into(),
                baud_rate: None,
            })
            .await;
        match next(&mut rx).await {
            ServerMessage::ConnectionError { port, error } => {
                assert_eq!(port, PORT);
                assert!(error.contains("busy"), "{error}");
            },
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(h.opener.opens.load(std::sync::atomic::Ordering::SeqCst), 0);

        drop(lease);
        session
            .handle(ClientRequest::Connect {
                port: PORT.into(),
                baud_rate: None,
            })
            .await;
        assert!(matches!(next(&mut rx).await, ServerMessage::Connected { .. }));
        session.close().await;
    }

    #[tokio::test]
    async fn test_close_leaves_all_ports() {
        let h = Harness::new();
        let (session, _rx) = h.session();
        for port in ["/dev/ttyUSB0", "/dev/ttyUSB1"] {
            session
                .handle(ClientRequest::Connect {
                    port: port.into(),
                    baud_rate: None,
                })
                .await;
        }
        assert_eq!(h.broker.open_ports().len(), 2);

        session.close().await;
        assert!(h.broker.open_ports().is_empty());
        assert_eq!(h.opener.open_now.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_list_ports_and_ping() {
        let h = Harness::new();
        h.runner.on_board_list(Ok(ToolOutput::ok(
            r#"{"detected_ports":[{"port":{"address":"COM4","protocol":"serial","properties":{"vid":"0x303A","pid":"0x1001"}}}]}"#,
        )));
        let (session, mut rx) = h.session();

        session.handle(ClientRequest::ListPorts).await;
        match next(&mut rx).await {
            ServerMessage::Ports { list, error } => {
                assert_eq!(list.len(), 1);
                assert_eq!(list[0].address, "COM4");
                assert!(error.is_none());
            },
            other => panic!("unexpected {other:?}"),
        }

        session.handle(ClientRequest::Ping).await;
        assert!(matches!(next(&mut rx).await, ServerMessage::Pong { .. }));
        session.close().await;
    }
}
