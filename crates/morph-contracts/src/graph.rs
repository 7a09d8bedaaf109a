use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("node '{node_id}' not found in graph")]
    MissingNode { node_id: String },
    #[error("node '{node_id}' has no input '{input}'")]
    MissingInput { node_id: String, input: String },
    #[error("input '{input}' on node '{node_id}' is not text")]
    NotText { node_id: String, input: String },
}

/// One step of the computation graph, in the engine's API format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub class_type: String,
    #[serde(default)]
    pub inputs: IndexMap<String, Value>,
    /// Pass-through keys such as `_meta`.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeReference {
    pub node_id: String,
    pub input: String,
    pub target: String,
    pub slot: u64,
}

/// Node-id keyed graph. Insertion order is preserved so serializing the same
/// document twice yields identical bytes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GraphDocument {
    nodes: IndexMap<String, NodeRecord>,
}

impl GraphDocument {
    pub fn new(nodes: IndexMap<String, NodeRecord>) -> Self {
        Self { nodes }
    }

    pub fn from_json_str(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeRecord> {
        self.nodes.get(node_id)
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn input(&self, node_id: &str, input: &str) -> Option<&Value> {
        self.nodes.get(node_id)?.inputs.get(input)
    }

    pub fn text_input(&self, node_id: &str, input: &str) -> Result<&str, GraphError> {
        let node = self.nodes.get(node_id).ok_or_else(|| GraphError::MissingNode {
            node_id: node_id.to_string(),
        })?;
        let value = node.inputs.get(input).ok_or_else(|| GraphError::MissingInput {
            node_id: node_id.to_string(),
            input: input.to_string(),
        })?;
        value.as_str().ok_or_else(|| GraphError::NotText {
            node_id: node_id.to_string(),
            input: input.to_string(),
        })
    }

    /// Overwrites (or adds) a literal input on an existing node.
    pub fn set_input(
        &mut self,
        node_id: &str,
        input: &str,
        value: impl Into<Value>,
    ) -> Result<(), GraphError> {
        let node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| GraphError::MissingNode {
                node_id: node_id.to_string(),
            })?;
        node.inputs.insert(input.to_string(), value.into());
        Ok(())
    }

    pub fn references(&self) -> Vec<NodeReference> {
        let mut out = Vec::new();
        for (node_id, node) in &self.nodes {
            for (input, value) in &node.inputs {
                if let Some((target, slot)) = as_reference(value) {
                    out.push(NodeReference {
                        node_id: node_id.clone(),
                        input: input.clone(),
                        target: target.to_string(),
                        slot,
                    });
                }
            }
        }
        out
    }

    /// References whose target node is absent from this document.
    pub fn dangling_references(&self) -> Vec<NodeReference> {
        self.references()
            .into_iter()
            .filter(|reference| !self.nodes.contains_key(&reference.target))
            .collect()
    }

    /// SHA-256 hex digest of the serialized document.
    pub fn fingerprint(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// A two-element `[nodeId, outputSlot]` link to another node's output.
pub fn as_reference(value: &Value) -> Option<(&str, u64)> {
    let rows = value.as_array()?;
    if rows.len() != 2 {
        return None;
    }
    let target = rows[0].as_str()?;
    let slot = rows[1].as_u64()?;
    Some((target, slot))
}
