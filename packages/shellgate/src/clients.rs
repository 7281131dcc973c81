//! Client connection table with reconnect-tolerant cleanup.
//!
//! Clients are identified by a durable token that survives reconnects. A
//! disconnect does not tear sessions down; it starts a grace timer, and a
//! reconnect within the grace period cancels the timer and swaps the
//! delivery sink. Only an expired timer evicts the client and its sessions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::registry::SessionRegistry;
use crate::ws::protocol::ServerMessage;

pub type ClientId = String;

/// Outbound queue depth per connection. A client that stays this far behind
/// starts losing messages rather than stalling session pumps.
const SINK_CAPACITY: usize = 256;

struct ClientState {
    /// Sink of the active connection, if any.
    sink: Option<mpsc::Sender<ServerMessage>>,
    /// Bumped on every connection. A close carrying an older number is a
    /// leftover from a connection that was already replaced.
    connection_seq: u64,
    /// Pending grace-period teardown, armed while disconnected.
    cleanup: Option<JoinHandle<()>>,
}

pub struct ClientRegistry {
    clients: RwLock<HashMap<ClientId, ClientState>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Bind a new connection, minting a client id when the caller brings no
    /// durable token. Returns the id, the connection sequence number and the
    /// receiving end of the delivery sink.
    pub async fn connect(
        &self,
        token: Option<String>,
    ) -> (ClientId, u64, mpsc::Receiver<ServerMessage>) {
        let id = match token {
            Some(t) if !t.is_empty() => t,
            _ => Uuid::new_v4().to_string(),
        };
        let (tx, rx) = mpsc::channel(SINK_CAPACITY);

        let mut clients = self.clients.write().await;
        let state = clients.entry(id.clone()).or_insert_with(|| ClientState {
            sink: None,
            connection_seq: 0,
            cleanup: None,
        });
        state.connection_seq += 1;
        state.sink = Some(tx);
        if let Some(timer) = state.cleanup.take() {
            info!("Client {} reconnected within the grace period", id);
            timer.abort();
        }
        (id, state.connection_seq, rx)
    }

    /// Send a message to a client's active connection. Best-effort: no sink
    /// or a saturated sink drops the message instead of blocking the caller.
    pub async fn deliver(&self, client: &str, message: ServerMessage) {
        let sink = {
            let clients = self.clients.read().await;
            clients.get(client).and_then(|state| state.sink.clone())
        };
        let Some(sink) = sink else {
            return;
        };
        match sink.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Client {} cannot keep up, dropping a message", client);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Client {} sink already closed", client);
            }
        }
    }

    /// Handle a connection close. A close for a superseded connection is
    /// ignored (a rapid reload has already rebound the client); otherwise
    /// the grace timer starts, and on expiry the client's sessions are torn
    /// down and the entry evicted.
    pub async fn connection_closed(
        self: &Arc<Self>,
        client: &str,
        seq: u64,
        registry: Arc<SessionRegistry>,
        grace: Duration,
    ) {
        let mut clients = self.clients.write().await;
        let Some(state) = clients.get_mut(client) else {
            return;
        };
        if state.connection_seq != seq {
            debug!(
                "Ignoring stale close for client {} (seq {}, active {})",
                client, seq, state.connection_seq
            );
            return;
        }
        state.sink = None;
        info!(
            "Client {} disconnected, {}s grace period started",
            client,
            grace.as_secs()
        );

        let broker = Arc::clone(self);
        let client_id = client.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            broker.expire(&client_id, seq, registry).await;
        });
        if let Some(old) = state.cleanup.replace(timer) {
            old.abort();
        }
    }

    async fn expire(&self, client: &str, seq: u64, registry: Arc<SessionRegistry>) {
        {
            let mut clients = self.clients.write().await;
            match clients.get(client) {
                // Reconnected while the timer was sleeping.
                Some(state) if state.connection_seq != seq || state.sink.is_some() => return,
                Some(_) => {
                    clients.remove(client);
                }
                None => return,
            }
        }
        let torn_down = registry.teardown_client(client).await;
        info!(
            "Client {} grace period expired, tore down {} sessions",
            client, torn_down
        );
    }

    /// Whether the client currently has an active connection.
    pub async fn is_connected(&self, client: &str) -> bool {
        let clients = self.clients.read().await;
        clients.get(client).is_some_and(|state| state.sink.is_some())
    }

    /// Whether the client is still tracked (connected or within grace).
    pub async fn is_known(&self, client: &str) -> bool {
        self.clients.read().await.contains_key(client)
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}
