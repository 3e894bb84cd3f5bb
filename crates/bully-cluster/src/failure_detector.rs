//! Leader liveness probing and background reconnects

use crate::communication::Transport;
use crate::leader_election::Event;
use crate::node::NodeId;
use crate::state::LeaderView;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Consecutive probe failures against one leader
#[derive(Debug, Default)]
struct FailureStreak {
    leader: Option<NodeId>,
    failures: u32,
}

impl FailureStreak {
    /// Record one probe outcome against `leader`. Returns `true` once the
    /// streak reaches `threshold`; the streak then starts over.
    fn record(&mut self, leader: NodeId, succeeded: bool, threshold: u32) -> bool {
        if self.leader != Some(leader) {
            self.leader = Some(leader);
            self.failures = 0;
        }

        if succeeded {
            self.failures = 0;
            return false;
        }

        self.failures += 1;
        if self.failures >= threshold {
            self.failures = 0;
            return true;
        }
        false
    }

    fn reset(&mut self) {
        self.leader = None;
        self.failures = 0;
    }
}

/// Periodically ping the current leader and report it once it stops
/// answering.
pub(crate) struct FailureDetector {
    self_id: NodeId,
    transport: Arc<Transport>,
    leader_view: Arc<LeaderView>,
    events: mpsc::Sender<Event>,
    interval: Duration,
    threshold: u32,
    shutdown: CancellationToken,
}

impl FailureDetector {
    pub(crate) fn new(
        self_id: NodeId,
        transport: Arc<Transport>,
        leader_view: Arc<LeaderView>,
        events: mpsc::Sender<Event>,
        interval: Duration,
        threshold: u32,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            self_id,
            transport,
            leader_view,
            events,
            interval,
            threshold,
            shutdown,
        }
    }

    pub(crate) async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut streak = FailureStreak::default();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let leader = match self.leader_view.leader_id().await {
                Some(leader) if leader != self.self_id => leader,
                _ => {
                    streak.reset();
                    continue;
                }
            };

            let outcome = self.transport.probe(leader).await;
            if let Err(e) = &outcome {
                tracing::debug!("Probe of leader {} failed: {}", leader, e);
            }

            if streak.record(leader, outcome.is_ok(), self.threshold) {
                tracing::warn!(
                    "Leader {} missed {} consecutive probes",
                    leader,
                    self.threshold
                );
                if self.events.send(Event::ProbeFailed { leader }).await.is_err() {
                    break;
                }
            }
        }

        tracing::debug!("Failure detector of node {} stopped", self.self_id);
    }
}

/// Re-dial lost peers and pending addresses every `interval` until shutdown.
pub(crate) async fn run_reconnector(
    transport: Arc<Transport>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately; initial dials are already underway.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => transport.reconnect_sweep().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_streak_fires_at_threshold() {
        let mut streak = FailureStreak::default();
        let leader = NodeId::from(30);

        assert!(!streak.record(leader, false, 3));
        assert!(!streak.record(leader, false, 3));
        assert!(streak.record(leader, false, 3));
        // Starts over after firing
        assert!(!streak.record(leader, false, 3));
    }

    #[test]
    fn test_success_resets_streak() {
        let mut streak = FailureStreak::default();
        let leader = NodeId::from(30);

        assert!(!streak.record(leader, false, 2));
        assert!(!streak.record(leader, true, 2));
        assert!(!streak.record(leader, false, 2));
        assert!(streak.record(leader, false, 2));
    }

    #[test]
    fn test_new_leader_starts_fresh() {
        let mut streak = FailureStreak::default();

        assert!(!streak.record(NodeId::from(30), false, 2));
        assert!(!streak.record(NodeId::from(20), false, 2));
        assert!(streak.record(NodeId::from(20), false, 2));
    }
}
