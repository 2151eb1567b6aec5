//! Wire envelope and the internal cluster protocol messages
//!
//! Every frame on the wire is one JSON array `[topic, payload, origin]`.
//! Six reserved topics carry the cluster's own protocol; their payloads are
//! modelled by [`ClusterMessage`].

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::types::PeerKey;

pub const TOPIC_ADD_PEERS: &str = "_clusterAddPeers";
pub const TOPIC_REMOVE_PEER: &str = "_clusterRemovePeer";
pub const TOPIC_TOPIC_ADD: &str = "_clusterTopicAdd";
pub const TOPIC_TOPIC_REMOVE: &str = "_clusterTopicRemove";
pub const TOPIC_REQUEST_STATE: &str = "_clusterRequestState";
pub const TOPIC_STATE: &str = "_clusterState";

/// Topics owned by the cluster protocol
pub const RESERVED_TOPICS: [&str; 6] = [
    TOPIC_ADD_PEERS,
    TOPIC_REMOVE_PEER,
    TOPIC_TOPIC_ADD,
    TOPIC_TOPIC_REMOVE,
    TOPIC_REQUEST_STATE,
    TOPIC_STATE,
];

pub fn is_reserved_topic(topic: &str) -> bool {
    RESERVED_TOPICS.contains(&topic)
}

/// One message on the wire
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub topic: String,
    pub payload: Value,
    pub origin: String,
}

impl Envelope {
    pub fn new(topic: impl Into<String>, payload: Value, origin: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload,
            origin: origin.into(),
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        let bytes = serde_json::to_vec(&(&self.topic, &self.payload, &self.origin))?;
        Ok(Bytes::from(bytes))
    }

    pub fn decode(frame: &[u8]) -> Result<Self> {
        let (topic, payload, origin): (String, Value, String) = serde_json::from_slice(frame)
            .map_err(|e| Error::MalformedEnvelope(e.to_string()))?;
        Ok(Self {
            topic,
            payload,
            origin,
        })
    }
}

/// `_clusterAddPeers` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddPeers {
    pub self_hash: PeerKey,
    pub known_hashes: Vec<PeerKey>,
}

/// `_clusterRemovePeer` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovePeer {
    pub hash: PeerKey,
}

/// `_clusterTopicAdd` / `_clusterTopicRemove` payload, `[serverName, topic, name]` on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(String, String, String)", into = "(String, String, String)")]
pub struct TopicChange {
    pub server_name: String,
    pub topic: String,
    pub name: String,
}

impl From<(String, String, String)> for TopicChange {
    fn from((server_name, topic, name): (String, String, String)) -> Self {
        Self {
            server_name,
            topic,
            name,
        }
    }
}

impl From<TopicChange> for (String, String, String) {
    fn from(change: TopicChange) -> Self {
        (change.server_name, change.topic, change.name)
    }
}

/// `_clusterRequestState` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestState {
    pub server_name: String,
}

/// `_clusterState` payload: the owners of one name in one registry topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub topic: String,
    pub name: String,
    pub server_names: Vec<String>,
}

/// The cluster's own protocol messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterMessage {
    AddPeers(AddPeers),
    RemovePeer(RemovePeer),
    TopicAdd(TopicChange),
    TopicRemove(TopicChange),
    RequestState(RequestState),
    State(StateSnapshot),
}

impl ClusterMessage {
    pub fn topic(&self) -> &'static str {
        match self {
            ClusterMessage::AddPeers(_) => TOPIC_ADD_PEERS,
            ClusterMessage::RemovePeer(_) => TOPIC_REMOVE_PEER,
            ClusterMessage::TopicAdd(_) => TOPIC_TOPIC_ADD,
            ClusterMessage::TopicRemove(_) => TOPIC_TOPIC_REMOVE,
            ClusterMessage::RequestState(_) => TOPIC_REQUEST_STATE,
            ClusterMessage::State(_) => TOPIC_STATE,
        }
    }

    pub fn to_payload(&self) -> Result<Value> {
        let value = match self {
            ClusterMessage::AddPeers(m) => serde_json::to_value(m)?,
            ClusterMessage::RemovePeer(m) => serde_json::to_value(m)?,
            ClusterMessage::TopicAdd(m) | ClusterMessage::TopicRemove(m) => {
                serde_json::to_value(m)?
            }
            ClusterMessage::RequestState(m) => serde_json::to_value(m)?,
            ClusterMessage::State(m) => serde_json::to_value(m)?,
        };
        Ok(value)
    }

    pub fn to_envelope(&self, origin: &str) -> Result<Envelope> {
        Ok(Envelope::new(self.topic(), self.to_payload()?, origin))
    }

    /// `None` when `topic` is not a reserved topic.
    pub fn from_parts(topic: &str, payload: Value) -> Option<Result<Self>> {
        let message = match topic {
            TOPIC_ADD_PEERS => serde_json::from_value(payload).map(ClusterMessage::AddPeers),
            TOPIC_REMOVE_PEER => serde_json::from_value(payload).map(ClusterMessage::RemovePeer),
            TOPIC_TOPIC_ADD => serde_json::from_value(payload).map(ClusterMessage::TopicAdd),
            TOPIC_TOPIC_REMOVE => serde_json::from_value(payload).map(ClusterMessage::TopicRemove),
            TOPIC_REQUEST_STATE => {
                serde_json::from_value(payload).map(ClusterMessage::RequestState)
            }
            TOPIC_STATE => serde_json::from_value(payload).map(ClusterMessage::State),
            _ => return None,
        };
        Some(message.map_err(Error::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_wire_format() {
        let envelope = Envelope::new("topic1", json!({"val": "x"}), "node-A");
        let bytes = envelope.encode().unwrap();
        assert_eq!(&bytes[..], br#"["topic1",{"val":"x"},"node-A"]"#);
        assert_eq!(Envelope::decode(&bytes).unwrap(), envelope);
    }

    #[test]
    fn test_envelope_rejects_malformed() {
        assert!(Envelope::decode(b"").is_err());
        assert!(Envelope::decode(b"not json").is_err());
        assert!(Envelope::decode(br#"["topic", 1]"#).is_err());
        assert!(Envelope::decode(br#"{"topic":"t"}"#).is_err());
        assert!(Envelope::decode(br#"[1, 2, 3]"#).is_err());
    }

    #[test]
    fn test_topic_change_is_array() {
        let message = ClusterMessage::TopicAdd(TopicChange {
            server_name: "node-A".to_string(),
            topic: "presence".to_string(),
            name: "alice".to_string(),
        });
        assert_eq!(
            message.to_payload().unwrap(),
            json!(["node-A", "presence", "alice"])
        );
    }

    #[test]
    fn test_add_peers_payload_shape() {
        let payload = json!({
            "selfHash": "node-B/127.0.0.1/7021/7022",
            "knownHashes": ["node-A/127.0.0.1/6021/6022"],
        });
        let message = ClusterMessage::from_parts(TOPIC_ADD_PEERS, payload.clone())
            .unwrap()
            .unwrap();

        match &message {
            ClusterMessage::AddPeers(m) => {
                assert_eq!(m.self_hash.server_name(), "node-B");
                assert_eq!(m.known_hashes.len(), 1);
            }
            other => panic!("Wrong message type: {:?}", other),
        }
        assert_eq!(message.to_payload().unwrap(), payload);
    }

    #[test]
    fn test_state_payload_shape() {
        let payload = json!({"topic": "presence", "name": "alice", "serverNames": ["a", "b"]});
        let message = ClusterMessage::from_parts(TOPIC_STATE, payload).unwrap().unwrap();
        assert_eq!(
            message,
            ClusterMessage::State(StateSnapshot {
                topic: "presence".to_string(),
                name: "alice".to_string(),
                server_names: vec!["a".to_string(), "b".to_string()],
            })
        );
    }

    #[test]
    fn test_from_parts_ignores_application_topics() {
        assert!(ClusterMessage::from_parts("topic1", json!({})).is_none());
        assert!(!is_reserved_topic("topic1"));
        assert!(is_reserved_topic(TOPIC_REQUEST_STATE));
    }

    #[test]
    fn test_from_parts_rejects_bad_payload() {
        let result = ClusterMessage::from_parts(TOPIC_REMOVE_PEER, json!({"hash": "nope"}));
        assert!(matches!(result, Some(Err(_))));

        let result = ClusterMessage::from_parts(TOPIC_TOPIC_REMOVE, json!(["only", "two"]));
        assert!(matches!(result, Some(Err(_))));
    }
}
