//! Leader view: the single record of who leads and since when

use crate::error::{ClusterError, Result};
use crate::node::{Node, NodeId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Outcome of the latest election observed by this process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderRecord {
    pub leader: Node,
    pub elected_at: DateTime<Utc>,
}

/// Lock-guarded leader record.
///
/// Only the election state machine writes it. The record is replaced as a
/// whole, so readers never see a leader paired with another election's
/// timestamp.
#[derive(Debug, Default)]
pub struct LeaderView {
    record: RwLock<Option<LeaderRecord>>,
}

impl LeaderView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current leader, or `NoLeaderYet` before the first election completes.
    pub async fn get(&self) -> Result<LeaderRecord> {
        self.record.read().await.clone().ok_or(ClusterError::NoLeaderYet)
    }

    /// Current leader, if any, without the error wrapping of [`get`](Self::get).
    pub async fn current(&self) -> Option<LeaderRecord> {
        self.record.read().await.clone()
    }

    pub async fn leader_id(&self) -> Option<NodeId> {
        self.record.read().await.as_ref().map(|r| r.leader.id)
    }

    /// Replace the record. `elected_at` is clamped so that it never moves
    /// backwards, even if the wall clock does.
    pub(crate) async fn replace(&self, leader: Node, elected_at: DateTime<Utc>) -> LeaderRecord {
        let mut record = self.record.write().await;
        let elected_at = match record.as_ref() {
            Some(previous) if previous.elected_at > elected_at => previous.elected_at,
            _ => elected_at,
        };

        let next = LeaderRecord { leader, elected_at };
        *record = Some(next.clone());
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn node(id: u128) -> Node {
        Node::new(NodeId::from(id), format!("127.0.0.1:{}", 9000 + id))
    }

    #[tokio::test]
    async fn test_no_leader_before_first_election() {
        let view = LeaderView::new();
        assert!(matches!(view.get().await, Err(ClusterError::NoLeaderYet)));
        assert!(view.leader_id().await.is_none());
    }

    #[tokio::test]
    async fn test_current_tracks_latest_record() {
        let view = LeaderView::new();
        assert!(view.current().await.is_none());

        let written = view.replace(node(10), Utc::now()).await;
        assert_eq!(view.current().await, Some(written));
    }

    #[tokio::test]
    async fn test_replace_is_whole_record() {
        let view = LeaderView::new();
        let now = Utc::now();

        view.replace(node(10), now).await;
        view.replace(node(30), now + Duration::seconds(1)).await;

        let record = view.get().await.unwrap();
        assert_eq!(record.leader, node(30));
        assert_eq!(record.elected_at, now + Duration::seconds(1));
    }

    #[tokio::test]
    async fn test_elected_at_never_decreases() {
        let view = LeaderView::new();
        let now = Utc::now();

        view.replace(node(20), now).await;
        let record = view.replace(node(10), now - Duration::seconds(30)).await;

        assert_eq!(record.leader, node(10));
        assert_eq!(record.elected_at, now);
    }
}
