//! Node identity

use crate::error::{ClusterError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Unique, totally ordered identifier of an election participant.
///
/// The numeric value is the only thing compared during an election: the live
/// node with the largest identifier wins. On the wire and in configuration
/// files it is written as a decimal string so the full 128 bits survive
/// formats without native 128-bit integers.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct NodeId(u128);

impl NodeId {
    /// Create a new random node ID
    pub fn random() -> Self {
        Self(rand::random::<u128>())
    }

    pub const fn from_u128(value: u128) -> Self {
        Self(value)
    }

    pub fn as_u128(&self) -> u128 {
        self.0
    }
}

impl From<u128> for NodeId {
    fn from(value: u128) -> Self {
        Self(value)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .parse::<u128>()
            .map(Self)
            .map_err(|e| ClusterError::configuration(format!("Invalid node ID '{}': {}", s, e)))
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A participant: identifier plus the address peers use to reach it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub address: String,
}

impl Node {
    pub fn new(id: NodeId, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.address)
    }
}

/// How the local identifier is chosen at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum IdentityStrategy {
    /// 128 bits from the thread-local random generator
    Random,

    /// Externally supplied identifier, e.g. from an orchestrator
    Fixed { id: NodeId },
}

impl Default for IdentityStrategy {
    fn default() -> Self {
        Self::Random
    }
}

impl IdentityStrategy {
    pub fn generate(&self) -> NodeId {
        match self {
            Self::Random => NodeId::random(),
            Self::Fixed { id } => *id,
        }
    }
}

/// The local process's identity. Fixed for the lifetime of the engine.
#[derive(Debug, Clone)]
pub struct Identity {
    node: Node,
}

impl Identity {
    pub fn new(id: NodeId, address: impl Into<String>) -> Self {
        Self {
            node: Node::new(id, address),
        }
    }

    pub fn id(&self) -> NodeId {
        self.node.id
    }

    pub fn address(&self) -> &str {
        &self.node.address
    }

    pub fn node(&self) -> &Node {
        &self.node
    }
}

/// Validate a `host:port` peer address.
pub fn validate_address(address: &str) -> Result<()> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| ClusterError::configuration(format!("Address '{}' lacks a port", address)))?;

    if host.is_empty() {
        return Err(ClusterError::configuration(format!(
            "Address '{}' lacks a host",
            address
        )));
    }

    port.parse::<u16>().map_err(|e| {
        ClusterError::configuration(format!("Address '{}' has an invalid port: {}", address, e))
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_ordering() {
        let low = NodeId::from(10);
        let high = NodeId::from(u128::MAX);
        assert!(low < high);
        assert_eq!(low.max(high), high);
    }

    #[test]
    fn test_node_id_serializes_as_decimal_string() {
        let id = NodeId::from(u128::MAX);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", u128::MAX));

        let parsed: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_node_id_rejects_garbage() {
        assert!("not-a-number".parse::<NodeId>().is_err());
        assert!(serde_json::from_str::<NodeId>("\"-1\"").is_err());
    }

    #[test]
    fn test_identity_strategy() {
        let fixed = IdentityStrategy::Fixed {
            id: NodeId::from(42),
        };
        assert_eq!(fixed.generate(), NodeId::from(42));
        assert_eq!(fixed.generate(), fixed.generate());

        // Two random draws colliding in 128 bits would indicate a broken RNG.
        assert_ne!(IdentityStrategy::Random.generate(), IdentityStrategy::Random.generate());
    }

    #[test]
    fn test_validate_address() {
        assert!(validate_address("127.0.0.1:8117").is_ok());
        assert!(validate_address("example.com:80").is_ok());
        assert!(validate_address("[::1]:8117").is_ok());
        assert!(validate_address("127.0.0.1").is_err());
        assert!(validate_address(":8117").is_err());
        assert!(validate_address("host:99999").is_err());
    }
}
