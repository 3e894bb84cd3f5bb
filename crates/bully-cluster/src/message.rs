//! Election wire messages
//!
//! Every TCP connection carries length-delimited frames. Each frame holds one
//! JSON [`Envelope`]. The first frame in each direction is a `hello` carrying
//! the sender's [`Node`]; every later frame must name the same sender.

use crate::error::{ClusterError, Result};
use crate::node::{Node, NodeId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_util::codec::LengthDelimitedCodec;

/// Protocol message kinds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Handshake announcing the sender's identity and address
    Hello { node: Node },

    /// Sent to every higher peer when an election starts
    Election,

    /// Reply to `Election`: a higher peer is alive and takes over
    Answer,

    /// Announcement of the winner, sent by the winner itself
    Coordinator { leader: Node },

    /// Liveness probe
    Ping { nonce: u64 },

    /// Probe reply echoing the nonce
    Pong { nonce: u64 },
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::Election => "election",
            Self::Answer => "answer",
            Self::Coordinator { .. } => "coordinator",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
        }
    }
}

/// A message tagged with the identifier of its sender
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: NodeId,
    pub message: Message,
}

impl Envelope {
    pub fn new(from: NodeId, message: Message) -> Self {
        Self { from, message }
    }

    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(frame: &[u8]) -> Result<Self> {
        serde_json::from_slice(frame)
            .map_err(|e| ClusterError::protocol(format!("Malformed frame: {}", e)))
    }
}

/// Build the frame codec shared by both ends of a connection.
pub fn frame_codec(max_frame_length: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(max_frame_length)
        .new_codec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_layout() {
        let envelope = Envelope::new(
            NodeId::from(30),
            Message::Coordinator {
                leader: Node::new(NodeId::from(30), "127.0.0.1:8117"),
            },
        );

        let value: serde_json::Value = serde_json::from_slice(&envelope.encode().unwrap()).unwrap();
        assert_eq!(value["from"], "30");
        assert_eq!(value["message"]["type"], "coordinator");
        assert_eq!(value["message"]["leader"]["address"], "127.0.0.1:8117");
    }

    #[test]
    fn test_unit_variants_decode() {
        let envelope = Envelope::decode(br#"{"from":"7","message":{"type":"election"}}"#).unwrap();
        assert_eq!(envelope.from, NodeId::from(7));
        assert_eq!(envelope.message, Message::Election);
    }

    #[test]
    fn test_malformed_frame_is_protocol_error() {
        let err = Envelope::decode(b"\x00garbage").unwrap_err();
        assert!(matches!(err, ClusterError::Protocol(_)));

        let err = Envelope::decode(br#"{"from":"7","message":{"type":"surrender"}}"#).unwrap_err();
        assert!(matches!(err, ClusterError::Protocol(_)));
    }
}
