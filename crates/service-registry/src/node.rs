//! Node records.

use crate::error::RegistryError;
use serde::{Deserialize, Serialize};

/// Well-known service names.
pub mod service {
    /// Session coordinators that hold peer connections.
    pub const COORDINATOR: &str = "coordinator";
    /// Media-location registry nodes.
    pub const LOCATION: &str = "location";
    /// Media relay nodes.
    pub const RELAY: &str = "relay";
}

/// Whether a watched node appeared or disappeared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Up,
    Down,
}

/// A self-describing node record. Every field travels as a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    #[serde(rename = "Ndc")]
    pub region: String,
    #[serde(rename = "Nid")]
    pub node_id: String,
    #[serde(rename = "Name")]
    pub service: String,
    /// Load metric, a string-encoded unsigned integer.
    #[serde(rename = "Npay")]
    pub load: String,
}

impl Node {
    /// A record with zero load.
    pub fn new(
        region: impl Into<String>,
        node_id: impl Into<String>,
        service: impl Into<String>,
    ) -> Self {
        Self {
            region: region.into(),
            node_id: node_id.into(),
            service: service.into(),
            load: "0".to_string(),
        }
    }

    #[must_use]
    pub fn with_load(mut self, load: u64) -> Self {
        self.load = load.to_string();
        self
    }

    /// Parsed load metric; `None` if the record carries garbage.
    #[must_use]
    pub fn load_value(&self) -> Option<u64> {
        self.load.trim().parse().ok()
    }

    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidRecord`] if serialization fails.
    pub fn encode(&self) -> Result<String, RegistryError> {
        serde_json::to_string(self).map_err(|e| RegistryError::InvalidRecord(e.to_string()))
    }

    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidRecord`] for anything that is not a
    /// complete node record.
    pub fn decode(raw: &str) -> Result<Self, RegistryError> {
        serde_json::from_str(raw).map_err(|e| RegistryError::InvalidRecord(e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_is_identity() {
        let nodes = [
            Node::new("sz", "relay-sz-1", service::RELAY).with_load(12),
            Node::new("us-east", "sc-7f3a", service::COORDINATOR),
            Node {
                region: "eu west \"quoted\"".to_string(),
                node_id: "node/with/slashes".to_string(),
                service: "location".to_string(),
                load: "not-a-number".to_string(),
            },
        ];

        for node in nodes {
            let decoded = Node::decode(&node.encode().unwrap()).unwrap();
            assert_eq!(decoded, node);
        }
    }

    #[test]
    fn test_wire_field_names() {
        let json = Node::new("sz", "relay-1", service::RELAY)
            .with_load(3)
            .encode()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["Ndc"], "sz");
        assert_eq!(value["Nid"], "relay-1");
        assert_eq!(value["Name"], "relay");
        assert_eq!(value["Npay"], "3");
    }

    #[test]
    fn test_decode_rejects_incomplete_record() {
        assert!(Node::decode(r#"{"Ndc":"sz","Nid":"a"}"#).is_err());
        assert!(Node::decode("garbage").is_err());
    }

    #[test]
    fn test_load_value() {
        assert_eq!(Node::new("sz", "a", "relay").with_load(7).load_value(), Some(7));
        let mut node = Node::new("sz", "a", "relay");
        node.load = "-1".to_string();
        assert_eq!(node.load_value(), None);
    }
}
