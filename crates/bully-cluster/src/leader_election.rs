//! Bully election state machine
//!
//! A single task owns the round state and consumes [`Event`]s from the
//! transport, the failure detector and its own timers. All transitions are
//! therefore serialized; nothing else reads or writes the round state.
//!
//! Rules, for a node `n`:
//! - An election sends `Election` to every known peer above `n`. With no such
//!   peer, `n` declares itself leader straight away.
//! - An `Answer` from a higher peer means `n` stands down and waits for that
//!   peer's `Coordinator`; silence until the answer timer fires means the
//!   higher peers are presumed dead and `n` wins.
//! - A missing `Coordinator` after an `Answer` restarts the election.
//! - An `Election` from a lower peer is always answered, and `n` runs its own
//!   election unless one is already underway.
//! - A `Coordinator` is only taken from the highest live identifier known.

use crate::communication::Transport;
use crate::config::ElectionConfig;
use crate::membership::PeerRegistry;
use crate::message::Message;
use crate::node::{Identity, Node, NodeId};
use crate::observer::ElectionObserver;
use crate::state::LeaderView;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Phase of the local state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// No election has run yet
    Idle,

    /// `Election` sent to higher peers, waiting for an `Answer`
    ElectionInProgress,

    /// A higher peer answered, waiting for its `Coordinator`
    WaitingForCoordinator,

    Leader,

    Follower,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::ElectionInProgress => write!(f, "election-in-progress"),
            Self::WaitingForCoordinator => write!(f, "waiting-for-coordinator"),
            Self::Leader => write!(f, "leader"),
            Self::Follower => write!(f, "follower"),
        }
    }
}

/// Why an election round was started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    Startup,
    Manual,
    LeaderUnreachable,
    LowerPeerElection,
    PeerJoined,
    CoordinatorTimeout,
    VerifyCoordinator,
}

/// Notifications published to [`ElectionEngine::subscribe`](crate::ElectionEngine::subscribe)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ElectionEvent {
    ElectionStarted {
        node_id: NodeId,
        round: u64,
        reason: TriggerReason,
    },
    LeaderElected {
        leader: Node,
        elected_at: DateTime<Utc>,
    },
    PeerConnected {
        node: Node,
    },
    PeerRemoved {
        node_id: NodeId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Timer {
    Answer,
    Coordinator,
}

/// Inputs of the state machine
#[derive(Debug)]
pub(crate) enum Event {
    Trigger(TriggerReason),
    MessageArrived { from: Node, message: Message },
    TimerExpired { round: u64, timer: Timer },
    ProbeFailed { leader: NodeId },
    PeerConnected(Node),
    PeerRemoved(NodeId),
}

/// What to do with an incoming `Coordinator`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CoordinatorVerdict {
    Accept,
    /// Stale claim, but nothing better is known: take it and re-verify
    Provisional,
    Ignore,
}

/// A `Coordinator` is authoritative only from the highest live identifier,
/// counting ourselves.
pub(crate) fn judge_coordinator(
    sender: NodeId,
    self_id: NodeId,
    live: &[NodeId],
    has_fresh_leader: bool,
) -> CoordinatorVerdict {
    let max_live = live.iter().copied().fold(self_id, NodeId::max);
    if sender >= max_live {
        CoordinatorVerdict::Accept
    } else if !has_fresh_leader {
        CoordinatorVerdict::Provisional
    } else {
        CoordinatorVerdict::Ignore
    }
}

pub(crate) struct ElectionStateMachine {
    identity: Identity,
    config: ElectionConfig,
    registry: Arc<PeerRegistry>,
    transport: Arc<Transport>,
    leader_view: Arc<LeaderView>,
    observer: Arc<dyn ElectionObserver>,
    timers: mpsc::Sender<Event>,
    notifications: broadcast::Sender<ElectionEvent>,
    phase_tx: watch::Sender<Phase>,
    shutdown: CancellationToken,

    phase: Phase,
    round: u64,
    round_started: Option<Instant>,
    pending_answers: HashSet<NodeId>,
    /// Set from winning an election until another leader is accepted
    leading: bool,
}

impl ElectionStateMachine {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        identity: Identity,
        config: ElectionConfig,
        registry: Arc<PeerRegistry>,
        transport: Arc<Transport>,
        leader_view: Arc<LeaderView>,
        observer: Arc<dyn ElectionObserver>,
        timers: mpsc::Sender<Event>,
        notifications: broadcast::Sender<ElectionEvent>,
        phase_tx: watch::Sender<Phase>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            identity,
            config,
            registry,
            transport,
            leader_view,
            observer,
            timers,
            notifications,
            phase_tx,
            shutdown,
            phase: Phase::Idle,
            round: 0,
            round_started: None,
            pending_answers: HashSet::new(),
            leading: false,
        }
    }

    pub(crate) async fn run(mut self, mut events: mpsc::Receiver<Event>) {
        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.handle(event).await;
        }

        tracing::debug!(
            "Election state machine of node {} stopped in phase {}",
            self.identity.id(),
            self.phase
        );
    }

    async fn handle(&mut self, event: Event) {
        match event {
            Event::Trigger(reason) => {
                if reason == TriggerReason::Startup && self.phase != Phase::Idle {
                    return;
                }
                if self.in_election() {
                    tracing::debug!("Election already underway, ignoring {:?} trigger", reason);
                    return;
                }
                self.start_election(reason).await;
            }
            Event::TimerExpired { round, timer } => self.on_timer(round, timer).await,
            Event::MessageArrived { from, message } => match message {
                Message::Election => self.on_election(from).await,
                Message::Answer => self.on_answer(from),
                Message::Coordinator { leader } => self.on_coordinator(from, leader).await,
                other => {
                    tracing::trace!("Ignoring {} from {} in state machine", other.kind(), from.id);
                }
            },
            Event::ProbeFailed { leader } => {
                if self.leader_view.leader_id().await == Some(leader) && !self.in_election() {
                    tracing::warn!("Leader {} is unreachable, starting election", leader);
                    self.start_election(TriggerReason::LeaderUnreachable).await;
                }
            }
            Event::PeerConnected(node) => self.on_peer_connected(node).await,
            Event::PeerRemoved(id) => {
                self.publish(ElectionEvent::PeerRemoved { node_id: id });
                self.pending_answers.remove(&id);
                if !self.leading
                    && self.leader_view.leader_id().await == Some(id)
                    && !self.in_election()
                {
                    tracing::warn!("Leader {} was removed, starting election", id);
                    self.start_election(TriggerReason::LeaderUnreachable).await;
                }
            }
        }
    }

    fn in_election(&self) -> bool {
        matches!(
            self.phase,
            Phase::ElectionInProgress | Phase::WaitingForCoordinator
        )
    }

    async fn start_election(&mut self, reason: TriggerReason) {
        if self.shutdown.is_cancelled() {
            return;
        }

        let me = self.identity.id();
        self.round += 1;
        self.round_started = Some(Instant::now());
        self.set_phase(Phase::ElectionInProgress);

        let higher: Vec<NodeId> = self
            .registry
            .snapshot()
            .await
            .into_iter()
            .map(|node| node.id)
            .filter(|id| *id > me)
            .collect();

        tracing::info!(
            "Node {} starts election round {} ({:?}), {} higher peer(s)",
            me,
            self.round,
            reason,
            higher.len()
        );
        self.publish(ElectionEvent::ElectionStarted {
            node_id: me,
            round: self.round,
            reason,
        });

        if higher.is_empty() {
            self.become_leader().await;
            return;
        }

        self.pending_answers = higher.iter().copied().collect();
        self.transport.broadcast(higher, Message::Election);
        self.schedule(Timer::Answer, self.config.answer_timeout);
    }

    async fn on_timer(&mut self, round: u64, timer: Timer) {
        if round != self.round {
            tracing::trace!("Dropping {:?} timer of superseded round {}", timer, round);
            return;
        }

        match (timer, self.phase) {
            (Timer::Answer, Phase::ElectionInProgress) => {
                tracing::info!(
                    "No answer from {} higher peer(s) in round {}, presuming them dead",
                    self.pending_answers.len(),
                    round
                );
                self.become_leader().await;
            }
            (Timer::Coordinator, Phase::WaitingForCoordinator) => {
                tracing::warn!(
                    "No coordinator announced within {:?} in round {}, restarting election",
                    self.config.coordinator_timeout,
                    round
                );
                self.start_election(TriggerReason::CoordinatorTimeout).await;
            }
            _ => {}
        }
    }

    fn on_answer(&mut self, from: Node) {
        if from.id <= self.identity.id() {
            tracing::debug!("Ignoring answer from lower peer {}", from.id);
            return;
        }
        if self.phase != Phase::ElectionInProgress {
            tracing::trace!("Late answer from {} in phase {}", from.id, self.phase);
            return;
        }

        tracing::debug!("Peer {} answered, waiting for its coordinator", from.id);
        self.pending_answers.remove(&from.id);
        self.set_phase(Phase::WaitingForCoordinator);
        self.schedule(Timer::Coordinator, self.config.coordinator_timeout);
    }

    async fn on_election(&mut self, from: Node) {
        let me = self.identity.id();
        if from.id > me {
            tracing::debug!("Ignoring election from higher peer {}", from.id);
            return;
        }

        if self.in_election() {
            self.transport.send_in_order(from.id, vec![Message::Answer]);
            return;
        }

        if self.leading && !self.has_live_higher_peer().await {
            // Still the rightful leader: stop the lower peer's round and tell
            // it who leads.
            self.transport.send_in_order(
                from.id,
                vec![
                    Message::Answer,
                    Message::Coordinator {
                        leader: self.identity.node().clone(),
                    },
                ],
            );
            return;
        }

        self.transport.send_in_order(from.id, vec![Message::Answer]);
        self.start_election(TriggerReason::LowerPeerElection).await;
    }

    async fn on_coordinator(&mut self, from: Node, leader: Node) {
        if leader.id != from.id {
            tracing::warn!(
                "Peer {} announced {} as coordinator on its behalf, ignoring",
                from.id,
                leader.id
            );
            return;
        }

        let live = self.registry.live_ids().await;
        let has_fresh_leader = self.has_fresh_leader().await;
        match judge_coordinator(from.id, self.identity.id(), &live, has_fresh_leader) {
            CoordinatorVerdict::Accept => self.accept_leader(from).await,
            CoordinatorVerdict::Provisional => {
                tracing::info!("Provisionally accepting stale coordinator {}", from.id);
                self.accept_leader(from).await;
                self.start_election(TriggerReason::VerifyCoordinator).await;
            }
            CoordinatorVerdict::Ignore => {
                tracing::debug!("Ignoring stale coordinator claim from {}", from.id);
                if self.leading {
                    self.transport.send_in_order(
                        from.id,
                        vec![Message::Coordinator {
                            leader: self.identity.node().clone(),
                        }],
                    );
                }
            }
        }
    }

    async fn on_peer_connected(&mut self, node: Node) {
        self.publish(ElectionEvent::PeerConnected { node: node.clone() });
        let me = self.identity.id();

        match self.phase {
            Phase::ElectionInProgress if node.id > me => {
                if self.pending_answers.insert(node.id) {
                    self.transport.send_in_order(node.id, vec![Message::Election]);
                }
            }
            Phase::ElectionInProgress | Phase::WaitingForCoordinator => {}
            Phase::Idle | Phase::Leader | Phase::Follower => {
                let current = self.leader_view.leader_id().await;
                let outranks_leader = current.map_or(true, |leader| node.id > leader);
                if node.id > me && outranks_leader && self.phase != Phase::Idle {
                    self.start_election(TriggerReason::PeerJoined).await;
                } else if self.leading && node.id < me {
                    self.transport.send_in_order(
                        node.id,
                        vec![Message::Coordinator {
                            leader: self.identity.node().clone(),
                        }],
                    );
                }
            }
        }
    }

    async fn become_leader(&mut self) {
        self.round += 1;
        self.pending_answers.clear();
        self.set_phase(Phase::Leader);

        let me = self.identity.node().clone();
        if !self.leading {
            self.leading = true;
            let record = self.leader_view.replace(me.clone(), Utc::now()).await;
            tracing::info!(
                "Node {} elected leader at {} after {:?}",
                me,
                record.elected_at,
                self.round_started.map(|t| t.elapsed()).unwrap_or_default()
            );
            self.publish(ElectionEvent::LeaderElected {
                leader: record.leader,
                elected_at: record.elected_at,
            });

            let observer = self.observer.clone();
            tokio::spawn(async move { observer.on_being_elected().await });
        }

        let peers: Vec<NodeId> = self
            .registry
            .snapshot()
            .await
            .into_iter()
            .map(|node| node.id)
            .collect();
        self.transport
            .broadcast(peers, Message::Coordinator { leader: me });
    }

    async fn accept_leader(&mut self, leader: Node) {
        // Re-confirming the recorded leader keeps its tenure, whatever round
        // led here.
        let unchanged = !self.leading
            && self
                .leader_view
                .current()
                .await
                .is_some_and(|record| record.leader == leader);

        self.round += 1;
        self.pending_answers.clear();
        self.leading = false;
        self.set_phase(Phase::Follower);

        if unchanged {
            return;
        }

        let record = self.leader_view.replace(leader, Utc::now()).await;
        tracing::info!(
            "Node {} follows leader {} since {}",
            self.identity.id(),
            record.leader,
            record.elected_at
        );
        self.publish(ElectionEvent::LeaderElected {
            leader: record.leader,
            elected_at: record.elected_at,
        });
    }

    /// Whether the current leader record still names a reachable leader
    async fn has_fresh_leader(&self) -> bool {
        match self.leader_view.leader_id().await {
            None => false,
            Some(id) if id == self.identity.id() => self.leading,
            Some(id) => self.registry.is_live(id).await,
        }
    }

    async fn has_live_higher_peer(&self) -> bool {
        let me = self.identity.id();
        self.registry.live_ids().await.into_iter().any(|id| id > me)
    }

    fn schedule(&self, timer: Timer, after: Duration) {
        let round = self.round;
        let events = self.timers.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(after) => {
                    let _ = events.send(Event::TimerExpired { round, timer }).await;
                }
            }
        });
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.phase != phase {
            tracing::debug!(
                "Node {} phase {} -> {}",
                self.identity.id(),
                self.phase,
                phase
            );
        }
        self.phase = phase;
        self.phase_tx.send_replace(phase);
    }

    fn publish(&self, event: ElectionEvent) {
        let _ = self.notifications.send(event);
    }
}
