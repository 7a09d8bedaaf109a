//! Workflow variants and the node-role table that binds each variant to the
//! node ids of its template.
//!
//! The table is versioned per template: changing a template's node layout
//! requires bumping `revision` and updating the ids here in the same change.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::graph::GraphDocument;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowVariant {
    Face,
    BodyFromFace,
    BodyWithDetailer,
}

impl WorkflowVariant {
    pub const ALL: [WorkflowVariant; 3] = [Self::Face, Self::BodyFromFace, Self::BodyWithDetailer];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Face => "face",
            Self::BodyFromFace => "body_from_face",
            Self::BodyWithDetailer => "body_with_detailer",
        }
    }

    pub fn is_body(self) -> bool {
        matches!(self, Self::BodyFromFace | Self::BodyWithDetailer)
    }

    /// Image kind used in output names (`face` or `body`).
    pub fn image_kind(self) -> &'static str {
        if self.is_body() {
            "body"
        } else {
            "face"
        }
    }

    pub fn roles(self) -> &'static NodeRoles {
        match self {
            Self::Face => &FACE_ROLES,
            Self::BodyFromFace => &BODY_FROM_FACE_ROLES,
            Self::BodyWithDetailer => &BODY_WITH_DETAILER_ROLES,
        }
    }
}

impl fmt::Display for WorkflowVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fixed literal written onto a companion node when a conditioning image
/// is bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuxiliaryModel {
    pub node: &'static str,
    pub input: &'static str,
    pub value: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeRoles {
    pub template: &'static str,
    pub revision: u32,
    pub positive_prompt: &'static str,
    pub negative_prompt: &'static str,
    pub seed: &'static str,
    pub conditioning_image: Option<&'static str>,
    pub auxiliary_model: Option<AuxiliaryModel>,
    pub secondary_prompt: Option<&'static str>,
    /// Second sampler that receives the same seed as `seed`.
    pub detailer_seed: Option<&'static str>,
    pub output: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    PositivePrompt,
    NegativePrompt,
    Seed,
    ConditioningImage,
    AuxiliaryModel,
    SecondaryPrompt,
    DetailerSeed,
    Output,
}

impl NodeRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PositivePrompt => "positive_prompt",
            Self::NegativePrompt => "negative_prompt",
            Self::Seed => "seed",
            Self::ConditioningImage => "conditioning_image",
            Self::AuxiliaryModel => "auxiliary_model",
            Self::SecondaryPrompt => "secondary_prompt",
            Self::DetailerSeed => "detailer_seed",
            Self::Output => "output",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const PROMPT_TEXT_INPUT: &str = "text";
pub const SEED_INPUT: &str = "seed";
pub const IMAGE_INPUT: &str = "image";
pub const FILENAME_PREFIX_INPUT: &str = "filename_prefix";

pub const FACE_ROLES: NodeRoles = NodeRoles {
    template: "face",
    revision: 1,
    positive_prompt: "6",
    negative_prompt: "7",
    seed: "3",
    conditioning_image: None,
    auxiliary_model: None,
    secondary_prompt: None,
    detailer_seed: None,
    output: "9",
};

pub const BODY_FROM_FACE_ROLES: NodeRoles = NodeRoles {
    template: "body_from_face",
    revision: 1,
    positive_prompt: "16",
    negative_prompt: "17",
    seed: "13",
    conditioning_image: Some("20"),
    auxiliary_model: Some(AuxiliaryModel {
        node: "21",
        input: "ipadapter_file",
        value: "ip-adapter-plus-face_sdxl_vit-h.safetensors",
    }),
    secondary_prompt: None,
    detailer_seed: None,
    output: "19",
};

pub const BODY_WITH_DETAILER_ROLES: NodeRoles = NodeRoles {
    template: "body_with_detailer",
    revision: 1,
    positive_prompt: "16",
    negative_prompt: "17",
    seed: "13",
    conditioning_image: Some("20"),
    auxiliary_model: Some(AuxiliaryModel {
        node: "21",
        input: "ipadapter_file",
        value: "ip-adapter-plus-face_sdxl_vit-h.safetensors",
    }),
    secondary_prompt: Some("31"),
    detailer_seed: Some("32"),
    output: "39",
};

impl NodeRoles {
    /// Every `(role, node id)` this mapping expects to find in its template.
    pub fn required_nodes(&self) -> Vec<(NodeRole, &'static str)> {
        let mut nodes = vec![
            (NodeRole::PositivePrompt, self.positive_prompt),
            (NodeRole::NegativePrompt, self.negative_prompt),
            (NodeRole::Seed, self.seed),
        ];
        if let Some(node) = self.conditioning_image {
            nodes.push((NodeRole::ConditioningImage, node));
        }
        if let Some(aux) = self.auxiliary_model {
            nodes.push((NodeRole::AuxiliaryModel, aux.node));
        }
        if let Some(node) = self.secondary_prompt {
            nodes.push((NodeRole::SecondaryPrompt, node));
        }
        if let Some(node) = self.detailer_seed {
            nodes.push((NodeRole::DetailerSeed, node));
        }
        nodes.push((NodeRole::Output, self.output));
        nodes
    }

    /// First role whose node id is absent from `graph`.
    pub fn first_missing(&self, graph: &GraphDocument) -> Option<(NodeRole, &'static str)> {
        self.required_nodes()
            .into_iter()
            .find(|(_, node_id)| !graph.contains(node_id))
    }
}
