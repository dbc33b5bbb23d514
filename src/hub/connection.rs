// ============================================
// Hub connections
// ============================================
//
// Registry of live hub connections on this node, the per-connection actor
// loop, and server-initiated pushes. Each connection runs its methods
// serially; different connections run in parallel. Outbound frames go
// through an unbounded channel into a dedicated writer task, so a slow
// reader never blocks the pipeline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use crate::crypto::EncryptionService;

use super::pipeline::HubPipeline;
use super::{HubContext, HubInvocation, HubPush};

/// Debounce window for config-change pushes to metric subscribers.
const CONFIG_PUSH_DEBOUNCE_MS: u64 = 500;

pub struct ConnectedHub {
    pub conn_id: Uuid,
    pub user_id: String,
    pub hub_path: String,
    sender: mpsc::UnboundedSender<String>,
}

impl ConnectedHub {
    fn send(&self, frame: &str) -> bool {
        self.sender.send(frame.to_string()).is_ok()
    }
}

#[derive(Default)]
pub struct HubConnections {
    inner: RwLock<HashMap<Uuid, ConnectedHub>>,
}

impl HubConnections {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, connection: ConnectedHub) {
        tracing::debug!(
            conn_id = %connection.conn_id,
            user_id = %connection.user_id,
            hub = %connection.hub_path,
            "hub connection registered"
        );
        self.inner
            .write()
            .await
            .insert(connection.conn_id, connection);
    }

    pub async fn deregister(&self, conn_id: Uuid) -> Option<ConnectedHub> {
        self.inner.write().await.remove(&conn_id)
    }

    pub async fn user_connection_count(&self, user_id: &str) -> usize {
        self.inner
            .read()
            .await
            .values()
            .filter(|c| c.user_id == user_id)
            .count()
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Push a raw (control) frame to every connection of one user.
    /// Key-rotation requests travel this way: they carry only public
    /// material and must be readable before the new key exists.
    pub async fn push_to_user(&self, user_id: &str, method: &str, args: Vec<Value>) -> usize {
        let frame = match serde_json::to_string(&HubPush {
            method: method.to_string(),
            args,
        }) {
            Ok(frame) => frame,
            Err(_) => return 0,
        };

        let connections = self.inner.read().await;
        connections
            .values()
            .filter(|c| c.user_id == user_id && c.send(&frame))
            .count()
    }

    /// Push a raw frame to every connection on one hub path.
    pub async fn push_to_hub(&self, hub_path: &str, method: &str, args: Vec<Value>) -> usize {
        let frame = match serde_json::to_string(&HubPush {
            method: method.to_string(),
            args,
        }) {
            Ok(frame) => frame,
            Err(_) => return 0,
        };

        let connections = self.inner.read().await;
        connections
            .values()
            .filter(|c| c.hub_path == hub_path && c.send(&frame))
            .count()
    }

    /// Broadcast an application payload to every connection on a hub path,
    /// sealed per recipient with that recipient's current key. Recipients
    /// without encryption state receive the raw object. Payloads are
    /// serialised as UTF-8 JSON before sealing.
    pub async fn broadcast(
        &self,
        hub_path: &str,
        method: &str,
        payload: &Value,
        encryption: &EncryptionService,
    ) -> usize {
        let recipients: Vec<(Uuid, String)> = {
            let connections = self.inner.read().await;
            connections
                .values()
                .filter(|c| c.hub_path == hub_path)
                .map(|c| (c.conn_id, c.user_id.clone()))
                .collect()
        };

        let raw_json = payload.to_string();
        let mut delivered = 0;

        for (conn_id, user_id) in recipients {
            let arg = if encryption.has_state(&user_id).await {
                match encryption
                    .encrypt_and_sign(&user_id, raw_json.as_bytes(), None)
                    .await
                {
                    Ok(envelope) => match serde_json::to_value(envelope) {
                        Ok(value) => value,
                        Err(_) => continue,
                    },
                    Err(err) => {
                        tracing::warn!(%user_id, error = %err, "broadcast sealing failed");
                        continue;
                    }
                }
            } else {
                payload.clone()
            };

            let frame = match serde_json::to_string(&HubPush {
                method: method.to_string(),
                args: vec![arg],
            }) {
                Ok(frame) => frame,
                Err(_) => continue,
            };

            let connections = self.inner.read().await;
            if let Some(connection) = connections.get(&conn_id) {
                if connection.send(&frame) {
                    delivered += 1;
                }
            }
        }

        delivered
    }
}

// ============================================
// Per-connection actor
// ============================================

/// Drive one accepted WebSocket until it closes. Methods run serially in
/// arrival order; the writer task drains outbound frames concurrently.
/// When the user's last connection goes away, their encryption state goes
/// with it — key material never outlives the connections it protects.
pub async fn run_connection(
    socket: WebSocket,
    ctx: HubContext,
    pipeline: Arc<HubPipeline>,
    connections: Arc<HubConnections>,
    encryption: Arc<EncryptionService>,
) {
    let conn_id = Uuid::new_v4();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    connections
        .register(ConnectedHub {
            conn_id,
            user_id: ctx.user_id.clone(),
            hub_path: ctx.hub_path.clone(),
            sender: tx.clone(),
        })
        .await;

    let (mut sink, mut stream) = socket.split();
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sink.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => {
                let frame = match serde_json::from_str::<HubInvocation>(&text) {
                    Ok(invocation) => pipeline.handle(&ctx, invocation).await,
                    Err(_) => {
                        tracing::debug!(user_id = %ctx.user_id, "unparseable hub frame");
                        continue;
                    }
                };
                match serde_json::to_string(&frame) {
                    Ok(serialised) => {
                        if tx.send(serialised).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "failed to serialise hub frame");
                    }
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    drop(tx);
    let _ = writer.await;
    connections.deregister(conn_id).await;

    if connections.user_connection_count(&ctx.user_id).await == 0 {
        encryption.remove(&ctx.user_id).await;
        tracing::debug!(user_id = %ctx.user_id, "last connection closed, encryption state dropped");
    }
}

// ============================================
// Config-change notifier
// ============================================

/// Coalesces admin config mutations into one debounced `ConfigChanged` push
/// to the admin-metrics hub.
#[derive(Clone)]
pub struct ConfigNotifier {
    tx: mpsc::UnboundedSender<&'static str>,
}

impl ConfigNotifier {
    pub fn spawn(connections: Arc<HubConnections>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<&'static str>();

        tokio::spawn(async move {
            while let Some(first) = rx.recv().await {
                let mut kinds = vec![first];
                let deadline = tokio::time::sleep(Duration::from_millis(CONFIG_PUSH_DEBOUNCE_MS));
                tokio::pin!(deadline);

                loop {
                    tokio::select! {
                        _ = &mut deadline => break,
                        more = rx.recv() => match more {
                            Some(kind) => {
                                if !kinds.contains(&kind) {
                                    kinds.push(kind);
                                }
                            }
                            None => break,
                        },
                    }
                }

                connections
                    .push_to_hub(
                        "/hubs/admin-metrics",
                        "ConfigChanged",
                        vec![serde_json::json!({ "kinds": kinds })],
                    )
                    .await;
            }
        });

        Self { tx }
    }

    pub fn notify(&self, kind: &'static str) {
        let _ = self.tx.send(kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::testutil::TestClient;
    use crate::crypto::{EncryptionSettings, SecureEnvelope};
    use crate::utils::test_clock::ManualClock;

    fn connected(user: &str, hub_path: &str) -> (ConnectedHub, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ConnectedHub {
                conn_id: Uuid::new_v4(),
                user_id: user.to_string(),
                hub_path: hub_path.to_string(),
                sender: tx,
            },
            rx,
        )
    }

    #[tokio::test]
    async fn push_to_user_hits_every_connection_of_that_user() {
        let connections = HubConnections::new();
        let (a, mut rx_a) = connected("u1", "/accountHub");
        let (b, mut rx_b) = connected("u1", "/encryptionHub");
        let (c, mut rx_c) = connected("u2", "/accountHub");
        connections.register(a).await;
        connections.register(b).await;
        connections.register(c).await;

        let sent = connections
            .push_to_user("u1", "KeyRotation", vec![Value::from("req")])
            .await;
        assert_eq!(sent, 2);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_seals_per_recipient() {
        let clock = Arc::new(ManualClock::at_epoch());
        let encryption = EncryptionService::new(
            clock.clone(),
            Arc::new(EncryptionSettings::default()),
        );

        // u1 has exchanged keys; u2 has not.
        let mut client = TestClient::new();
        let response = encryption
            .key_exchange("u1", &client.exchange_request())
            .await
            .unwrap();
        client.complete_exchange(&response);

        let connections = HubConnections::new();
        let (a, mut rx_a) = connected("u1", "/accountHub");
        let (b, mut rx_b) = connected("u2", "/accountHub");
        connections.register(a).await;
        connections.register(b).await;

        let payload = serde_json::json!({"season": "winter", "day": 12});
        let delivered = connections
            .broadcast("/accountHub", "SeasonTick", &payload, &encryption)
            .await;
        assert_eq!(delivered, 2);

        // Encrypted recipient gets an envelope that opens to the JSON text.
        let frame_a: Value = serde_json::from_str(&rx_a.try_recv().unwrap()).unwrap();
        let envelope: SecureEnvelope =
            serde_json::from_value(frame_a["args"][0].clone()).unwrap();
        let opened = client.open(&envelope).unwrap();
        let decoded: Value = serde_json::from_slice(&opened).unwrap();
        assert_eq!(decoded, payload);

        // Plaintext recipient gets the raw object.
        let frame_b: Value = serde_json::from_str(&rx_b.try_recv().unwrap()).unwrap();
        assert_eq!(frame_b["args"][0], payload);
        assert_eq!(frame_b["method"], "SeasonTick");
    }

    #[tokio::test]
    async fn deregister_removes_only_that_connection() {
        let connections = HubConnections::new();
        let (a, _rx_a) = connected("u1", "/accountHub");
        let (b, _rx_b) = connected("u1", "/accountHub");
        let a_id = a.conn_id;
        connections.register(a).await;
        connections.register(b).await;

        assert_eq!(connections.user_connection_count("u1").await, 2);
        connections.deregister(a_id).await;
        assert_eq!(connections.user_connection_count("u1").await, 1);
    }

    #[tokio::test]
    async fn config_notifier_coalesces_bursts() {
        let connections = Arc::new(HubConnections::new());
        let (admin, mut rx) = connected("ops", "/hubs/admin-metrics");
        connections.register(admin).await;

        let notifier = ConfigNotifier::spawn(connections.clone());
        notifier.notify("rate-limiting");
        notifier.notify("encryption");
        notifier.notify("rate-limiting");

        let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["method"], "ConfigChanged");
        let kinds = value["args"][0]["kinds"].as_array().unwrap();
        assert_eq!(kinds.len(), 2);

        // One push for the whole burst.
        assert!(rx.try_recv().is_err());
    }
}
