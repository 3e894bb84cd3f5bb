//! Peer registry: the candidates known to this process

use crate::error::{ClusterError, Result};
use crate::message::Envelope;
use crate::node::{Node, NodeId};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

/// Handle to one established, handshaken connection.
///
/// Cloning the handle does not duplicate the connection; all clones feed the
/// same writer task and share one cancellation token.
#[derive(Debug, Clone)]
pub struct PeerConnection {
    id: u64,
    initiator: NodeId,
    outbound: mpsc::Sender<Envelope>,
    cancel: CancellationToken,
}

impl PeerConnection {
    pub(crate) fn new(
        id: u64,
        initiator: NodeId,
        outbound: mpsc::Sender<Envelope>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            initiator,
            outbound,
            cancel,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Identifier of the node that dialed this connection
    pub fn initiator(&self) -> NodeId {
        self.initiator
    }

    pub fn is_open(&self) -> bool {
        !self.cancel.is_cancelled() && !self.outbound.is_closed()
    }

    /// Queue one envelope for the connection's writer task.
    pub(crate) async fn send(&self, envelope: Envelope, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.outbound.send(envelope)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ClusterError::connectivity(format!(
                "connection {} is closed",
                self.id
            ))),
            Err(_) => Err(ClusterError::timeout(format!(
                "connection {} write queue is full",
                self.id
            ))),
        }
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

/// A known peer
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Identity as announced in the peer's handshake
    pub node: Node,

    /// Address this process dialed, when it differs from the announced one
    pub dial_address: Option<String>,

    /// Established connection, absent until a handshake completes
    pub connection: Option<PeerConnection>,

    /// Last time a frame arrived from this peer
    pub last_seen: DateTime<Utc>,

    /// Consecutive failed dials
    pub failures: u32,
}

impl Candidate {
    pub fn is_live(&self) -> bool {
        self.connection.as_ref().is_some_and(PeerConnection::is_open)
    }

    fn answers_to(&self, address: &str) -> bool {
        self.node.address == address || self.dial_address.as_deref() == Some(address)
    }

    pub fn dial_target(&self) -> &str {
        self.dial_address.as_deref().unwrap_or(&self.node.address)
    }
}

/// Result of handing a freshly handshaken connection to the registry
#[derive(Debug)]
pub struct Registration {
    /// Whether the offered connection became the peer's connection
    pub kept: bool,

    /// Connection that lost out and must be closed by the caller
    pub displaced: Option<PeerConnection>,

    /// Whether the peer was unknown before
    pub new_peer: bool,
}

#[derive(Debug, Default)]
struct RegistryInner {
    candidates: HashMap<NodeId, Candidate>,
    /// Addresses never handshaken, with their consecutive dial failures
    pending: HashMap<String, u32>,
}

/// Set of known candidates, keyed uniquely by identifier.
///
/// Every method holds the lock only for in-memory bookkeeping. Callers
/// that need to talk to peers take a [`snapshot`](Self::snapshot) or clone a
/// connection handle first.
#[derive(Debug)]
pub struct PeerRegistry {
    self_id: NodeId,
    inner: RwLock<RegistryInner>,
}

impl PeerRegistry {
    pub fn new(self_id: NodeId) -> Self {
        Self {
            self_id,
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    /// Register a connection whose handshake announced `node`.
    ///
    /// When the peer already holds a live connection the two are compared and
    /// the one dialed by the higher identifier survives, so both ends of a
    /// simultaneous dial settle on the same socket. A newer connection from
    /// the same initiator replaces the old one; outbound dials to one address
    /// never overlap, so both ends see such connections in the same order.
    pub async fn register(
        &self,
        node: Node,
        dial_address: Option<&str>,
        connection: PeerConnection,
    ) -> Result<Registration> {
        if node.id == self.self_id {
            return Err(ClusterError::duplicate_identifier(format!(
                "peer at {} claims our own identifier {}",
                node.address, node.id
            )));
        }

        let mut guard = self.inner.write().await;
        let inner = &mut *guard;
        let now = Utc::now();
        inner.pending.remove(&node.address);
        if let Some(address) = dial_address {
            inner.pending.remove(address);
        }

        let registration = match inner.candidates.get_mut(&node.id) {
            Some(existing) => {
                if existing.is_live() && existing.node.address != node.address {
                    return Err(ClusterError::duplicate_identifier(format!(
                        "identifier {} announced by {} is already held by {}",
                        node.id, node.address, existing.node.address
                    )));
                }

                let keep_new = match &existing.connection {
                    Some(current) if current.is_open() => {
                        current.initiator() == connection.initiator()
                            || connection.initiator() == self.self_id.max(node.id)
                    }
                    _ => true,
                };

                existing.node = node;
                if let Some(address) = dial_address {
                    existing.dial_address = Some(address.to_string());
                }
                existing.last_seen = now;
                existing.failures = 0;

                if keep_new {
                    let displaced = existing.connection.replace(connection);
                    Registration {
                        kept: true,
                        displaced,
                        new_peer: false,
                    }
                } else {
                    Registration {
                        kept: false,
                        displaced: Some(connection),
                        new_peer: false,
                    }
                }
            }
            None => {
                let candidate = Candidate {
                    dial_address: dial_address
                        .filter(|address| *address != node.address)
                        .map(str::to_string),
                    node: node.clone(),
                    connection: Some(connection),
                    last_seen: now,
                    failures: 0,
                };
                inner.candidates.insert(node.id, candidate);
                Registration {
                    kept: true,
                    displaced: None,
                    new_peer: true,
                }
            }
        };

        Ok(registration)
    }

    /// Remember an address that has not completed a handshake yet.
    ///
    /// Returns `false` if the address already belongs to a known candidate.
    pub async fn add_pending(&self, address: &str) -> bool {
        let mut inner = self.inner.write().await;
        if inner.candidates.values().any(|c| c.answers_to(address)) {
            return false;
        }
        inner.pending.insert(address.to_string(), 0);
        true
    }

    /// Count a failed dial to a pending address. Returns the new streak.
    pub async fn record_pending_failure(&self, address: &str) -> u32 {
        let mut inner = self.inner.write().await;
        match inner.pending.get_mut(address) {
            Some(attempts) => {
                *attempts += 1;
                *attempts
            }
            None => 0,
        }
    }

    pub async fn remove_pending(&self, address: &str) -> bool {
        self.inner.write().await.pending.remove(address).is_some()
    }

    pub async fn pending_addresses(&self) -> Vec<String> {
        let inner = self.inner.read().await;
        let mut addresses: Vec<String> = inner.pending.keys().cloned().collect();
        addresses.sort();
        addresses
    }

    /// Count a failed dial to a known candidate. Returns the new streak.
    pub async fn record_failure(&self, id: NodeId) -> u32 {
        let mut inner = self.inner.write().await;
        match inner.candidates.get_mut(&id) {
            Some(candidate) => {
                candidate.failures += 1;
                candidate.failures
            }
            None => 0,
        }
    }

    /// Note that a frame arrived from `id`.
    pub async fn touch(&self, id: NodeId) {
        let mut inner = self.inner.write().await;
        if let Some(candidate) = inner.candidates.get_mut(&id) {
            candidate.last_seen = Utc::now();
            candidate.failures = 0;
        }
    }

    /// Drop a candidate and close its connection.
    pub async fn remove(&self, id: NodeId) -> Option<Candidate> {
        let removed = self.inner.write().await.candidates.remove(&id);
        if let Some(connection) = removed.as_ref().and_then(|c| c.connection.as_ref()) {
            connection.close();
        }
        removed
    }

    /// Forget `connection_id` if it is still the peer's current connection.
    pub async fn connection_lost(&self, id: NodeId, connection_id: u64) -> bool {
        let mut inner = self.inner.write().await;
        match inner.candidates.get_mut(&id) {
            Some(candidate)
                if candidate.connection.as_ref().map(PeerConnection::id) == Some(connection_id) =>
            {
                candidate.connection = None;
                true
            }
            _ => false,
        }
    }

    /// Open connection to `id`, if any.
    pub async fn connection(&self, id: NodeId) -> Option<PeerConnection> {
        let inner = self.inner.read().await;
        inner
            .candidates
            .get(&id)
            .and_then(|c| c.connection.clone())
            .filter(PeerConnection::is_open)
    }

    pub async fn get(&self, id: NodeId) -> Option<Candidate> {
        self.inner.read().await.candidates.get(&id).cloned()
    }

    /// Point-in-time copy of every known candidate, ordered by identifier.
    pub async fn snapshot(&self) -> Vec<Node> {
        let inner = self.inner.read().await;
        let mut nodes: Vec<Node> = inner.candidates.values().map(|c| c.node.clone()).collect();
        nodes.sort_by_key(|node| node.id);
        nodes
    }

    /// Identifiers of candidates with an open connection
    pub async fn live_ids(&self) -> Vec<NodeId> {
        let inner = self.inner.read().await;
        let mut ids: Vec<NodeId> = inner
            .candidates
            .values()
            .filter(|c| c.is_live())
            .map(|c| c.node.id)
            .collect();
        ids.sort();
        ids
    }

    pub async fn is_live(&self, id: NodeId) -> bool {
        let inner = self.inner.read().await;
        inner.candidates.get(&id).is_some_and(Candidate::is_live)
    }

    /// Candidates without an open connection, with the address to dial
    pub async fn disconnected(&self) -> Vec<(NodeId, String)> {
        let inner = self.inner.read().await;
        inner
            .candidates
            .values()
            .filter(|c| !c.is_live())
            .map(|c| (c.node.id, c.dial_target().to_string()))
            .collect()
    }

    /// Live candidate answering at `address`, if any
    pub async fn live_at(&self, address: &str) -> Option<Node> {
        let inner = self.inner.read().await;
        inner
            .candidates
            .values()
            .find(|c| c.is_live() && c.answers_to(address))
            .map(|c| c.node.clone())
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.candidates.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop every candidate and pending address, closing all connections.
    pub async fn clear(&self) -> usize {
        let mut inner = self.inner.write().await;
        inner.pending.clear();
        let closed = inner.candidates.len();
        for (_, candidate) in inner.candidates.drain() {
            if let Some(connection) = candidate.connection {
                connection.close();
            }
        }
        closed
    }
}
