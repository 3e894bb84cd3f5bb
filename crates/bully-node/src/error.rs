use thiserror::Error;

pub type Result<T> = std::result::Result<T, NodeError>;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Election error: {0}")]
    Election(#[from] bully_cluster::ClusterError),

    #[error("Webhook error: {0}")]
    Webhook(#[from] reqwest::Error),

    #[error("Webhook rejected notification with status {0}")]
    WebhookStatus(u16),
}

#[cfg(test)]
mod tests {
    use super::*;
    use bully_cluster::ClusterError;

    #[test]
    fn test_election_errors_convert() {
        let err = NodeError::from(ClusterError::NoLeaderYet);
        assert!(matches!(err, NodeError::Election(ClusterError::NoLeaderYet)));
        assert_eq!(err.to_string(), "Election error: No leader elected yet");
    }

    #[test]
    fn test_webhook_status_message() {
        assert_eq!(
            NodeError::WebhookStatus(502).to_string(),
            "Webhook rejected notification with status 502"
        );
    }
}
