//! Peer-to-peer transport
//!
//! Turns registry entries into live TCP connections and moves election
//! messages across them. Each connection gets one reader task and one writer
//! task; losing one connection never affects another.

use crate::config::ElectionConfig;
use crate::error::{ClusterError, Result};
use crate::leader_election::Event;
use crate::membership::{PeerConnection, PeerRegistry};
use crate::message::{frame_codec, Envelope, Message};
use crate::node::{validate_address, Identity, Node, NodeId};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, OwnedMutexGuard};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

type PeerFramed = Framed<TcpStream, LengthDelimitedCodec>;

/// Outbound queue depth per connection
const OUTBOUND_QUEUE: usize = 64;

/// One lock per address with an outbound dial in flight
type DialSlots = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// TCP transport shared by the listener, the state machine and the detector
pub struct Transport {
    identity: Identity,
    config: ElectionConfig,
    registry: Arc<PeerRegistry>,
    events: mpsc::Sender<Event>,
    shutdown: CancellationToken,
    next_connection_id: AtomicU64,
    next_nonce: AtomicU64,
    probes: Mutex<HashMap<u64, oneshot::Sender<()>>>,
    dials: DialSlots,
}

impl Transport {
    pub(crate) fn new(
        identity: Identity,
        config: ElectionConfig,
        registry: Arc<PeerRegistry>,
        events: mpsc::Sender<Event>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            identity,
            config,
            registry,
            events,
            shutdown,
            next_connection_id: AtomicU64::new(1),
            next_nonce: AtomicU64::new(1),
            probes: Mutex::new(HashMap::new()),
            dials: Mutex::new(HashMap::new()),
        }
    }

    /// Start accepting peer connections until shutdown.
    pub(crate) fn spawn_listener(self: &Arc<Self>, listener: TcpListener) {
        let transport = self.clone();
        tokio::spawn(async move { transport.accept_loop(listener).await });
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        tracing::info!(
            "Node {} accepting peers on {:?}",
            self.identity.id(),
            listener.local_addr().ok()
        );

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::debug!("Listener of node {} stopped", self.identity.id());
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        let transport = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = transport.accept_peer(stream, remote).await {
                                tracing::warn!("Rejected inbound connection from {}: {}", remote, e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!("Failed to accept connection: {}", e);
                    }
                }
            }
        }
    }

    async fn accept_peer(self: Arc<Self>, stream: TcpStream, remote: SocketAddr) -> Result<()> {
        let mut framed = Framed::new(stream, frame_codec(self.config.max_frame_length));

        let announced = self
            .guarded(self.config.dial_timeout, "handshake", read_hello(&mut framed))
            .await?;

        // Reply even to a clashing identifier so the dialer can see the clash.
        let hello = self.envelope(Message::Hello {
            node: self.identity.node().clone(),
        });
        self.guarded(self.config.dial_timeout, "handshake", async {
            framed.send(hello.encode()?).await?;
            Ok::<(), ClusterError>(())
        })
        .await?;

        if announced.id == self.identity.id() {
            return Err(ClusterError::duplicate_identifier(format!(
                "{} claims our own identifier {}",
                remote, announced.id
            )));
        }

        let peer = Node::new(announced.id, effective_address(&announced.address, remote));
        tracing::debug!("Accepted peer {} from {}", peer, remote);
        self.establish(framed, peer, announced.id, None).await
    }

    /// Dial `address` (or adopt `existing`), run the handshake and register
    /// the peer. Returns the peer's announced identity.
    ///
    /// Dials to one address never overlap. A dial that finds a live peer
    /// already answering at the address returns that peer instead.
    pub(crate) async fn connect(
        self: &Arc<Self>,
        address: &str,
        existing: Option<TcpStream>,
        timeout: Duration,
    ) -> Result<Node> {
        validate_address(address)?;

        let (stream, _slot) = match existing {
            Some(stream) => (stream, None),
            None => {
                let slot = self
                    .guarded(timeout, address, async { Ok(self.dial_slot(address).await) })
                    .await?;
                if let Some(peer) = self.registry.live_at(address).await {
                    tracing::trace!("{} already connected as peer {}", address, peer.id);
                    self.registry.remove_pending(address).await;
                    return Ok(peer);
                }

                let stream = self
                    .guarded(timeout, address, async {
                        TcpStream::connect(address).await.map_err(|e| {
                            ClusterError::connectivity(format!("dial {} failed: {}", address, e))
                        })
                    })
                    .await?;
                (stream, Some(slot))
            }
        };
        let remote = stream.peer_addr()?;
        let mut framed = Framed::new(stream, frame_codec(self.config.max_frame_length));

        let hello = self.envelope(Message::Hello {
            node: self.identity.node().clone(),
        });
        let announced = self
            .guarded(timeout, address, async {
                framed.send(hello.encode()?).await?;
                read_hello(&mut framed).await
            })
            .await?;

        if announced.id == self.identity.id() {
            return Err(ClusterError::duplicate_identifier(format!(
                "{} answers with our own identifier {}",
                address, announced.id
            )));
        }

        let peer = Node::new(announced.id, effective_address(&announced.address, remote));
        self.establish(framed, peer.clone(), self.identity.id(), Some(address))
            .await?;
        Ok(peer)
    }

    /// Register a handshaken connection and start its reader and writer.
    async fn establish(
        self: &Arc<Self>,
        framed: PeerFramed,
        peer: Node,
        initiator: NodeId,
        dial_address: Option<&str>,
    ) -> Result<()> {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let cancel = self.shutdown.child_token();
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let connection = PeerConnection::new(connection_id, initiator, tx, cancel.clone());

        let registration = self
            .registry
            .register(peer.clone(), dial_address, connection.clone())
            .await?;

        if let Some(displaced) = registration.displaced {
            tracing::debug!(
                "Closing duplicate connection {} to peer {}",
                displaced.id(),
                peer.id
            );
            displaced.close();
        }

        if !registration.kept {
            return Ok(());
        }

        let (sink, stream): (SplitSink<PeerFramed, Bytes>, SplitStream<PeerFramed>) =
            framed.split();

        tokio::spawn(write_loop(
            sink,
            rx,
            cancel.clone(),
            self.config.write_timeout,
            peer.id,
        ));
        tokio::spawn(self.clone().read_loop(stream, peer.clone(), connection, cancel));

        if registration.new_peer {
            tracing::info!("Node {} connected to new peer {}", self.identity.id(), peer);
        }
        let _ = self.events.send(Event::PeerConnected(peer)).await;
        Ok(())
    }

    async fn read_loop(
        self: Arc<Self>,
        mut stream: SplitStream<PeerFramed>,
        peer: Node,
        connection: PeerConnection,
        cancel: CancellationToken,
    ) {
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = stream.next() => frame,
            };

            let bytes = match frame {
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => {
                    tracing::debug!("Read from peer {} failed: {}", peer.id, e);
                    break;
                }
                None => {
                    tracing::debug!("Peer {} closed connection {}", peer.id, connection.id());
                    break;
                }
            };

            let envelope = match Envelope::decode(&bytes) {
                Ok(envelope) => envelope,
                Err(e) => {
                    tracing::warn!("Dropping connection to peer {}: {}", peer.id, e);
                    break;
                }
            };

            if envelope.from != peer.id {
                tracing::warn!(
                    "Peer {} sent a frame claiming to be {}; closing connection",
                    peer.id,
                    envelope.from
                );
                break;
            }

            self.registry.touch(peer.id).await;

            match envelope.message {
                Message::Ping { nonce } => {
                    let pong = self.envelope(Message::Pong { nonce });
                    if let Err(e) = connection.send(pong, self.config.write_timeout).await {
                        tracing::debug!("Failed to answer ping from {}: {}", peer.id, e);
                    }
                }
                Message::Pong { nonce } => self.complete_probe(nonce),
                Message::Hello { .. } => {
                    tracing::debug!("Ignoring repeated hello from peer {}", peer.id);
                }
                message => {
                    let event = Event::MessageArrived {
                        from: peer.clone(),
                        message,
                    };
                    if self.events.send(event).await.is_err() {
                        break;
                    }
                }
            }
        }

        cancel.cancel();
        if self.registry.connection_lost(peer.id, connection.id()).await {
            tracing::info!("Lost connection to peer {}", peer);
        }
    }

    /// Send one message to a registered peer, dialing it if needed.
    ///
    /// Connection problems come back as `Connectivity`/`Timeout` errors; the
    /// caller decides whether to log and move on.
    pub async fn send(self: &Arc<Self>, id: NodeId, message: Message) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(ClusterError::ShutdownInProgress);
        }

        let connection = match self.registry.connection(id).await {
            Some(connection) => connection,
            None => self.redial(id).await?,
        };

        let kind = message.kind();
        connection
            .send(self.envelope(message), self.config.write_timeout)
            .await?;
        tracing::trace!("Sent {} to peer {}", kind, id);
        Ok(())
    }

    /// Send `message` to every peer in `peers` concurrently. Failures are
    /// logged and never abort the other sends.
    pub fn broadcast(self: &Arc<Self>, peers: Vec<NodeId>, message: Message) {
        for id in peers {
            let transport = self.clone();
            let message = message.clone();
            tokio::spawn(async move {
                let kind = message.kind();
                if let Err(e) = transport.send(id, message).await {
                    tracing::warn!("Failed to send {} to peer {}: {}", kind, id, e);
                }
            });
        }
    }

    /// Send `messages` to `id` one after another from a single task, keeping
    /// their order on the wire.
    pub fn send_in_order(self: &Arc<Self>, id: NodeId, messages: Vec<Message>) {
        let transport = self.clone();
        tokio::spawn(async move {
            for message in messages {
                let kind = message.kind();
                if let Err(e) = transport.send(id, message).await {
                    tracing::warn!("Failed to send {} to peer {}: {}", kind, id, e);
                    break;
                }
            }
        });
    }

    /// Round-trip a ping to `id`, bounded by the probe timeout.
    pub async fn probe(self: &Arc<Self>, id: NodeId) -> Result<()> {
        let nonce = self.next_nonce.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.lock_probes().insert(nonce, tx);

        let outcome = tokio::time::timeout(self.config.probe_timeout, async {
            self.send(id, Message::Ping { nonce }).await?;
            rx.await
                .map_err(|_| ClusterError::connectivity(format!("probe to {} abandoned", id)))
        })
        .await;

        self.lock_probes().remove(&nonce);
        match outcome {
            Ok(result) => result,
            Err(_) => Err(ClusterError::timeout(format!("probe to {} timed out", id))),
        }
    }

    /// Re-dial pending addresses and disconnected candidates, dropping the
    /// ones that exhausted their retry budget.
    pub(crate) async fn reconnect_sweep(self: &Arc<Self>) {
        let pending = self.registry.pending_addresses().await;
        let disconnected = self.registry.disconnected().await;

        let pending_dials = pending.into_iter().map(|address| async move {
            if let Err(e) = self.connect(&address, None, self.config.dial_timeout).await {
                let attempts = self.registry.record_pending_failure(&address).await;
                tracing::debug!("Dial to pending {} failed ({}): {}", address, attempts, e);
                if attempts >= self.config.reconnect_attempts {
                    tracing::warn!("Giving up on {} after {} attempts", address, attempts);
                    self.registry.remove_pending(&address).await;
                }
            }
        });
        let candidate_dials = disconnected.into_iter().map(|(id, address)| async move {
            match self.connect(&address, None, self.config.dial_timeout).await {
                Ok(node) if node.id == id => {}
                Ok(node) => {
                    tracing::debug!("{} now answers as {} instead of peer {}", address, node.id, id);
                    self.note_failure(id).await;
                }
                Err(e) => {
                    tracing::debug!("Reconnect to peer {} at {} failed: {}", id, address, e);
                    self.note_failure(id).await;
                }
            }
        });

        futures::future::join_all(pending_dials).await;
        futures::future::join_all(candidate_dials).await;
    }

    async fn redial(self: &Arc<Self>, id: NodeId) -> Result<PeerConnection> {
        let target = self
            .registry
            .get(id)
            .await
            .map(|candidate| candidate.dial_target().to_string())
            .ok_or_else(|| ClusterError::connectivity(format!("peer {} is not registered", id)))?;

        match self.connect(&target, None, self.config.dial_timeout).await {
            Ok(node) if node.id == id => self.registry.connection(id).await.ok_or_else(|| {
                ClusterError::connectivity(format!("connection to {} closed right away", id))
            }),
            Ok(node) => {
                self.note_failure(id).await;
                Err(ClusterError::connectivity(format!(
                    "{} now answers as {} instead of {}",
                    target, node.id, id
                )))
            }
            Err(e) => {
                self.note_failure(id).await;
                Err(e)
            }
        }
    }

    async fn note_failure(&self, id: NodeId) {
        let failures = self.registry.record_failure(id).await;
        if failures >= self.config.reconnect_attempts && self.registry.remove(id).await.is_some() {
            tracing::warn!(
                "Removed peer {} after {} failed reconnects",
                id,
                failures
            );
            let _ = self.events.send(Event::PeerRemoved(id)).await;
        }
    }

    fn complete_probe(&self, nonce: u64) {
        if let Some(tx) = self.lock_probes().remove(&nonce) {
            let _ = tx.send(());
        }
    }

    fn lock_probes(&self) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<()>>> {
        unpoisoned(&self.probes)
    }

    /// Wait for exclusive use of `address` for an outbound dial.
    async fn dial_slot(&self, address: &str) -> DialSlot<'_> {
        let lock = unpoisoned(&self.dials)
            .entry(address.to_string())
            .or_default()
            .clone();
        DialSlot {
            dials: &self.dials,
            address: address.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    fn envelope(&self, message: Message) -> Envelope {
        Envelope::new(self.identity.id(), message)
    }

    /// Run `fut` bounded by `timeout` (zero means no deadline) and by shutdown.
    async fn guarded<T, F>(&self, timeout: Duration, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let bounded = async {
            if timeout.is_zero() {
                fut.await
            } else {
                match tokio::time::timeout(timeout, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(ClusterError::connectivity(format!(
                        "{} timed out after {:?}",
                        what, timeout
                    ))),
                }
            }
        };

        tokio::select! {
            _ = self.shutdown.cancelled() => Err(ClusterError::ShutdownInProgress),
            result = bounded => result,
        }
    }
}

/// Exclusive right to dial one address, released on drop
struct DialSlot<'a> {
    dials: &'a DialSlots,
    address: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for DialSlot<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut dials = unpoisoned(self.dials);
        if dials
            .get(&self.address)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            dials.remove(&self.address);
        }
    }
}

fn unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn write_loop(
    mut sink: SplitSink<PeerFramed, Bytes>,
    mut outbound: mpsc::Receiver<Envelope>,
    cancel: CancellationToken,
    write_timeout: Duration,
    peer: NodeId,
) {
    loop {
        let envelope = tokio::select! {
            _ = cancel.cancelled() => break,
            next = outbound.recv() => match next {
                Some(envelope) => envelope,
                None => break,
            },
        };

        let frame = match envelope.encode() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!("Failed to encode {} for {}: {}", envelope.message.kind(), peer, e);
                continue;
            }
        };

        match tokio::time::timeout(write_timeout, sink.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!("Write to peer {} failed: {}", peer, e);
                break;
            }
            Err(_) => {
                tracing::debug!("Write to peer {} timed out", peer);
                break;
            }
        }
    }

    cancel.cancel();
    let _ = tokio::time::timeout(write_timeout, sink.close()).await;
}

/// Read the peer's `hello` frame.
async fn read_hello(framed: &mut PeerFramed) -> Result<Node> {
    let frame = framed
        .next()
        .await
        .ok_or_else(|| ClusterError::connectivity("connection closed during handshake"))??;

    let envelope = Envelope::decode(&frame)?;
    match envelope.message {
        Message::Hello { node } if node.id == envelope.from => Ok(node),
        Message::Hello { node } => Err(ClusterError::protocol(format!(
            "hello from {} announces {}",
            envelope.from, node.id
        ))),
        other => Err(ClusterError::protocol(format!(
            "expected hello, got {}",
            other.kind()
        ))),
    }
}

/// Replace an unspecified announced host (`0.0.0.0`, `::`) with the address
/// the connection actually came from.
fn effective_address(announced: &str, remote: SocketAddr) -> String {
    match announced.parse::<SocketAddr>() {
        Ok(addr) if addr.ip().is_unspecified() => SocketAddr::new(remote.ip(), addr.port()).to_string(),
        _ => announced.to_string(),
    }
}
