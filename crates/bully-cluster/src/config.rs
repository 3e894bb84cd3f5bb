//! Election engine configuration

use crate::error::{ClusterError, Result};
use crate::node::IdentityStrategy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Smallest frame limit that still fits every protocol message.
const MIN_FRAME_LENGTH: usize = 1024;

/// Timers, retry budgets and identity settings of one engine instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectionConfig {
    /// How the local identifier is chosen
    pub identity: IdentityStrategy,

    /// Address announced to peers during the handshake. Defaults to the
    /// listener's local address.
    pub advertise_address: Option<String>,

    /// How long to wait for an `Answer` from a higher peer
    pub answer_timeout: Duration,

    /// How long to wait for the `Coordinator` after an `Answer`
    pub coordinator_timeout: Duration,

    /// Interval between leader liveness probes and reconnect sweeps
    pub probe_interval: Duration,

    /// How long a single probe may take
    pub probe_timeout: Duration,

    /// Consecutive probe failures before the leader is presumed dead
    pub probe_failure_threshold: u32,

    /// Dial and handshake timeout for outbound connections
    pub dial_timeout: Duration,

    /// Timeout for writing a single frame
    pub write_timeout: Duration,

    /// Consecutive dial failures before a peer is dropped from the registry
    pub reconnect_attempts: u32,

    /// Maximum accepted frame length in bytes
    pub max_frame_length: usize,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            identity: IdentityStrategy::Random,
            advertise_address: None,
            answer_timeout: Duration::from_secs(2),
            coordinator_timeout: Duration::from_secs(4),
            probe_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(1),
            probe_failure_threshold: 3,
            dial_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(3),
            reconnect_attempts: 5,
            max_frame_length: 64 * 1024, // 64KB
        }
    }
}

impl ElectionConfig {
    /// Load configuration from file
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ClusterError::configuration(format!("Failed to read config file: {}", e)))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| ClusterError::configuration(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ClusterError::configuration(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| ClusterError::configuration(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let timers = [
            ("answer_timeout", self.answer_timeout),
            ("coordinator_timeout", self.coordinator_timeout),
            ("probe_interval", self.probe_interval),
            ("probe_timeout", self.probe_timeout),
            ("write_timeout", self.write_timeout),
        ];
        for (name, value) in timers {
            if value.is_zero() {
                return Err(ClusterError::configuration(format!("{} must be non-zero", name)));
            }
        }

        if self.probe_failure_threshold == 0 {
            return Err(ClusterError::configuration(
                "probe_failure_threshold must be at least 1",
            ));
        }

        if self.reconnect_attempts == 0 {
            return Err(ClusterError::configuration(
                "reconnect_attempts must be at least 1",
            ));
        }

        if self.max_frame_length < MIN_FRAME_LENGTH {
            return Err(ClusterError::configuration(format!(
                "max_frame_length must be at least {} bytes",
                MIN_FRAME_LENGTH
            )));
        }

        if let Some(address) = &self.advertise_address {
            crate::node::validate_address(address)?;
        }

        Ok(())
    }

    /// Upper bound for one uncontested election round to settle.
    pub fn round_budget(&self) -> Duration {
        self.answer_timeout + self.coordinator_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeId;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = ElectionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.identity, IdentityStrategy::Random);
        assert_eq!(config.round_budget(), Duration::from_secs(6));
    }

    #[test]
    fn test_config_validation() {
        let mut config = ElectionConfig::default();

        config.answer_timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        config = ElectionConfig::default();
        config.probe_failure_threshold = 0;
        assert!(config.validate().is_err());

        config = ElectionConfig::default();
        config.max_frame_length = 16;
        assert!(config.validate().is_err());

        config = ElectionConfig::default();
        config.advertise_address = Some("no-port".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: ElectionConfig = toml::from_str(
            r#"
            probe_failure_threshold = 5

            [identity]
            type = "fixed"
            id = "30"
            "#,
        )
        .unwrap();

        assert_eq!(config.probe_failure_threshold, 5);
        assert_eq!(config.identity.generate(), NodeId::from(30));
        assert_eq!(config.dial_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_config_file_operations() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("election.toml");

        let config = ElectionConfig {
            identity: IdentityStrategy::Fixed {
                id: NodeId::from(u128::MAX),
            },
            advertise_address: Some("10.0.0.7:8117".to_string()),
            ..Default::default()
        };

        config.to_file(&config_path).unwrap();
        assert!(config_path.exists());

        let loaded = ElectionConfig::from_file(&config_path).unwrap();
        assert_eq!(loaded.identity, config.identity);
        assert_eq!(loaded.advertise_address, config.advertise_address);
        assert_eq!(loaded.answer_timeout, config.answer_timeout);
    }
}
