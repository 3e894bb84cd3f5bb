//! Hook invoked when this node wins an election

use async_trait::async_trait;

/// Capability notified once per transition of the local node into leadership.
///
/// The engine runs the hook on its own task after the leader record is
/// written. Whatever the hook does, and however long it takes, has no effect
/// on the election itself.
#[async_trait]
pub trait ElectionObserver: Send + Sync {
    async fn on_being_elected(&self);
}

/// Observer that does nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

#[async_trait]
impl ElectionObserver for NoopObserver {
    async fn on_being_elected(&self) {}
}

/// Observer that only logs the win
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

#[async_trait]
impl ElectionObserver for LoggingObserver {
    async fn on_being_elected(&self) {
        tracing::info!("This node has been elected leader");
    }
}
