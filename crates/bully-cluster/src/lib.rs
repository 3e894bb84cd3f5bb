//! Bully Leader Election
//!
//! This crate elects a single leader among a dynamic set of peer processes
//! using the Bully algorithm: the live node with the highest identifier wins.
//! Peers talk over plain TCP; every process runs one [`ElectionEngine`].
//!
//! ```no_run
//! use bully_cluster::{ElectionConfig, ElectionEngine, LoggingObserver};
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//!
//! # async fn run() -> bully_cluster::Result<()> {
//! let listener = TcpListener::bind("0.0.0.0:8117").await?;
//! let engine = ElectionEngine::new(
//!     listener,
//!     vec!["10.0.0.2:8117".to_string()],
//!     Arc::new(LoggingObserver),
//!     ElectionConfig::default(),
//! )
//! .await?;
//!
//! if let Ok(record) = engine.leader().await {
//!     println!("{} leads since {}", record.leader, record.elected_at);
//! }
//! engine.finalize().await;
//! # Ok(())
//! # }
//! ```

pub mod communication;
pub mod config;
pub mod error;
mod failure_detector;
pub mod leader_election;
pub mod membership;
pub mod message;
pub mod node;
pub mod observer;
pub mod state;

pub use communication::Transport;
pub use config::ElectionConfig;
pub use error::{ClusterError, Result};
pub use leader_election::{ElectionEvent, Phase, TriggerReason};
pub use membership::PeerRegistry;
pub use message::{Envelope, Message};
pub use node::{Identity, IdentityStrategy, Node, NodeId};
pub use observer::{ElectionObserver, LoggingObserver, NoopObserver};
pub use state::{LeaderRecord, LeaderView};

use failure_detector::FailureDetector;
use leader_election::{ElectionStateMachine, Event};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Depth of the state machine's input queue
const EVENT_QUEUE: usize = 1024;

/// Capacity of the [`ElectionEvent`] broadcast channel
const NOTIFICATION_CAPACITY: usize = 256;

/// One participant in the election.
///
/// Owns the listener, the peer registry, the state machine task and the
/// failure detector. Every method is safe to call concurrently with ongoing
/// election rounds.
pub struct ElectionEngine {
    identity: Identity,
    config: ElectionConfig,
    registry: Arc<PeerRegistry>,
    transport: Arc<Transport>,
    leader_view: Arc<LeaderView>,
    events: mpsc::Sender<Event>,
    notifications: broadcast::Sender<ElectionEvent>,
    phase: watch::Receiver<Phase>,
    shutdown: CancellationToken,
    finalized: AtomicBool,
}

impl ElectionEngine {
    /// Start an engine on an already bound listener.
    ///
    /// The initial candidates are dialed in the background with the
    /// configured dial timeout; the first election runs once every dial has
    /// either succeeded or failed. Unreachable addresses stay pending and are
    /// retried.
    pub async fn new(
        listener: TcpListener,
        candidates: Vec<String>,
        observer: Arc<dyn ElectionObserver>,
        config: ElectionConfig,
    ) -> Result<Self> {
        config.validate()?;

        let id = config.identity.generate();
        let address = match &config.advertise_address {
            Some(address) => address.clone(),
            None => listener.local_addr()?.to_string(),
        };
        let identity = Identity::new(id, address);

        let shutdown = CancellationToken::new();
        let registry = Arc::new(PeerRegistry::new(id));
        let leader_view = Arc::new(LeaderView::new());
        let (events, events_rx) = mpsc::channel(EVENT_QUEUE);
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let (phase_tx, phase) = watch::channel(Phase::Idle);

        let transport = Arc::new(Transport::new(
            identity.clone(),
            config.clone(),
            registry.clone(),
            events.clone(),
            shutdown.clone(),
        ));
        transport.spawn_listener(listener);

        let machine = ElectionStateMachine::new(
            identity.clone(),
            config.clone(),
            registry.clone(),
            transport.clone(),
            leader_view.clone(),
            observer,
            events.clone(),
            notifications.clone(),
            phase_tx,
            shutdown.clone(),
        );
        tokio::spawn(machine.run(events_rx));

        let detector = FailureDetector::new(
            id,
            transport.clone(),
            leader_view.clone(),
            events.clone(),
            config.probe_interval,
            config.probe_failure_threshold,
            shutdown.clone(),
        );
        tokio::spawn(detector.run());
        tokio::spawn(failure_detector::run_reconnector(
            transport.clone(),
            config.probe_interval,
            shutdown.clone(),
        ));

        tracing::info!(
            "Election engine started: node {} at {}, {} initial candidate(s)",
            identity.id(),
            identity.address(),
            candidates.len()
        );

        {
            let transport = transport.clone();
            let registry = registry.clone();
            let events = events.clone();
            let dial_timeout = config.dial_timeout;
            tokio::spawn(async move {
                let dials = candidates.iter().map(|address| {
                    dial_candidate(&transport, &registry, address, None, dial_timeout)
                });
                for (address, outcome) in candidates
                    .iter()
                    .zip(futures::future::join_all(dials).await)
                {
                    if let Err(e) = outcome {
                        tracing::warn!("Initial candidate {} not reachable yet: {}", address, e);
                    }
                }
                let _ = events.send(Event::Trigger(TriggerReason::Startup)).await;
            });
        }

        Ok(Self {
            identity,
            config,
            registry,
            transport,
            leader_view,
            events,
            notifications,
            phase,
            shutdown,
            finalized: AtomicBool::new(false),
        })
    }

    /// Register a peer by address, dialing it unless `existing` already holds
    /// a connection to it.
    ///
    /// Re-adding a known address with a live connection is a no-op. A failed
    /// dial returns the connectivity error but keeps the address for retry.
    pub async fn add_candidate(
        &self,
        address: &str,
        existing: Option<TcpStream>,
        dial_timeout: Duration,
    ) -> Result<()> {
        self.ensure_running()?;
        node::validate_address(address)?;
        dial_candidate(&self.transport, &self.registry, address, existing, dial_timeout).await
    }

    pub fn my_id(&self) -> NodeId {
        self.identity.id()
    }

    pub fn my_addr(&self) -> &str {
        self.identity.address()
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn config(&self) -> &ElectionConfig {
        &self.config
    }

    /// Current leader and the time it was elected; `NoLeaderYet` before the
    /// first election completes.
    pub async fn leader(&self) -> Result<LeaderRecord> {
        self.leader_view.get().await
    }

    pub async fn is_leader(&self) -> bool {
        self.leader_view.leader_id().await == Some(self.identity.id())
            && self.phase() == Phase::Leader
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Receiver of election notifications from this point on
    pub fn subscribe(&self) -> broadcast::Receiver<ElectionEvent> {
        self.notifications.subscribe()
    }

    /// Known candidates, ordered by identifier
    pub async fn candidates(&self) -> Vec<Node> {
        self.registry.snapshot().await
    }

    /// Start an election round now, unless one is already underway.
    pub async fn trigger_election(&self) -> Result<()> {
        self.ensure_running()?;
        self.events
            .send(Event::Trigger(TriggerReason::Manual))
            .await
            .map_err(|_| ClusterError::ShutdownInProgress)
    }

    /// Stop the listener, timers and detector and close every connection.
    ///
    /// Safe to call repeatedly and while an election is running.
    pub async fn finalize(&self) {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return;
        }

        self.shutdown.cancel();
        let closed = self.registry.clear().await;
        tracing::info!(
            "Election engine of node {} finalized, closed {} peer connection(s)",
            self.identity.id(),
            closed
        );
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_finalized() || self.shutdown.is_cancelled() {
            return Err(ClusterError::ShutdownInProgress);
        }
        Ok(())
    }
}

impl Drop for ElectionEngine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn dial_candidate(
    transport: &Arc<Transport>,
    registry: &PeerRegistry,
    address: &str,
    existing: Option<TcpStream>,
    dial_timeout: Duration,
) -> Result<()> {
    match transport.connect(address, existing, dial_timeout).await {
        Ok(node) => {
            tracing::debug!("Candidate {} identified as {}", address, node.id);
            Ok(())
        }
        Err(e) if e.is_peer_local() => {
            if registry.add_pending(address).await {
                tracing::debug!("Keeping {} for retry", address);
            }
            Err(e)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config(id: u128) -> ElectionConfig {
        ElectionConfig {
            identity: IdentityStrategy::Fixed { id: NodeId::from(id) },
            answer_timeout: Duration::from_millis(200),
            coordinator_timeout: Duration::from_millis(400),
            probe_interval: Duration::from_millis(100),
            probe_timeout: Duration::from_millis(100),
            ..Default::default()
        }
    }

    async fn engine(id: u128) -> ElectionEngine {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        ElectionEngine::new(listener, Vec::new(), Arc::new(NoopObserver), fast_config(id))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_accessors() {
        let engine = engine(42).await;
        assert_eq!(engine.my_id(), NodeId::from(42));
        assert!(engine.my_addr().starts_with("127.0.0.1:"));
        assert!(engine.candidates().await.is_empty());
        engine.finalize().await;
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = ElectionConfig {
            answer_timeout: Duration::ZERO,
            ..Default::default()
        };

        let result = ElectionEngine::new(listener, Vec::new(), Arc::new(NoopObserver), config).await;
        assert!(matches!(result, Err(ClusterError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_malformed_candidate_address() {
        let engine = engine(1).await;
        let err = engine
            .add_candidate("no-port", None, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::Configuration(_)));
        engine.finalize().await;
    }

    #[tokio::test]
    async fn test_operations_after_finalize() {
        let engine = engine(7).await;
        engine.finalize().await;
        engine.finalize().await;

        assert!(engine.is_finalized());
        assert!(matches!(
            engine.trigger_election().await,
            Err(ClusterError::ShutdownInProgress)
        ));
        assert!(matches!(
            engine
                .add_candidate("127.0.0.1:1", None, Duration::from_millis(100))
                .await,
            Err(ClusterError::ShutdownInProgress)
        ));
    }
}
