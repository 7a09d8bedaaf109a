//! Writes character attributes, ranked tags, seed and conditioning image into
//! a resolved template, addressing nodes through the variant's role table.

use morph_contracts::artifacts::ArtifactReference;
use morph_contracts::graph::{GraphDocument, GraphError};
use morph_contracts::workflow::{
    WorkflowVariant, FILENAME_PREFIX_INPUT, IMAGE_INPUT, PROMPT_TEXT_INPUT, SEED_INPUT,
};
use rand::Rng;

use crate::error::GenerationError;

pub const DYNAMIC_PROMPT_MARKER: &str = "__DYNAMIC_PROMPT__";
pub const BACKGROUND_PROMPT_MARKER: &str = "__BACKGROUND_PROMPT__";

/// Largest seed handed to the engine (2^53 - 1), so seeds survive a round
/// trip through JSON number parsers that use doubles.
pub const MAX_SAFE_SEED: u64 = (1 << 53) - 1;

pub const NEGATIVE_PROMPT: &str = "lowres, worst quality, low quality, normal quality, jpeg artifacts, \
blurry, bad anatomy, bad hands, missing fingers, extra digit, fewer digits, extra limbs, \
deformed, disfigured, mutated, cropped, out of frame, text, signature, watermark, username";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anatomy {
    Male,
    Female,
    Other,
}

impl Anatomy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "male" | "m" => Some(Self::Male),
            "female" | "f" => Some(Self::Female),
            "other" | "intersex" | "x" => Some(Self::Other),
            _ => None,
        }
    }

    fn subject_token(self) -> &'static str {
        match self {
            Self::Male => "1boy",
            Self::Female => "1girl",
            Self::Other => "1person",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacterAttributes {
    pub anatomy: Anatomy,
    /// 0 = fully masculine, 100 = fully feminine.
    pub gender_expression: u8,
    pub ethnicity: String,
    pub hair_color: String,
    pub eye_color: String,
    pub body_type: Option<String>,
}

impl CharacterAttributes {
    pub fn expression_token(&self) -> &'static str {
        match self.gender_expression.min(100) {
            0..=33 => "masculine",
            34..=66 => "androgynous",
            _ => "feminine",
        }
    }

    fn hair_token(&self) -> Option<String> {
        non_blank(&self.hair_color).map(|color| format!("{color} hair"))
    }

    fn eye_token(&self) -> Option<String> {
        non_blank(&self.eye_color).map(|color| format!("{color} eyes"))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PromptContext {
    CharacterCreation,
    #[default]
    General,
}

impl PromptContext {
    pub fn background(self) -> &'static str {
        match self {
            Self::CharacterCreation => "simple gradient background, vignetting",
            Self::General => "simple gradient background",
        }
    }
}

/// Names the designated output file after the character it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputName {
    pub character_id: String,
    pub stamp: String,
}

impl OutputName {
    pub fn now(character_id: impl Into<String>) -> Self {
        Self {
            character_id: character_id.into(),
            stamp: chrono::Utc::now().format("%Y%m%d_%H%M%S").to_string(),
        }
    }

    pub fn prefix(&self, kind: &str, seed: u64) -> String {
        let id = &self.character_id;
        format!("characters/{id}/{kind}/{id}_{kind}_{seed}_{}", self.stamp)
    }
}

#[derive(Debug, Clone)]
pub struct InjectionInput<'a> {
    pub variant: WorkflowVariant,
    pub attributes: &'a CharacterAttributes,
    pub ranked_tags: &'a [String],
    pub conditioning_image: Option<&'a ArtifactReference>,
    /// Explicit seed, at most `MAX_SAFE_SEED`; a random one is drawn when
    /// absent.
    pub seed: Option<u64>,
    pub output_name: Option<&'a OutputName>,
    pub context: PromptContext,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InjectedGraph {
    pub graph: GraphDocument,
    pub variant: WorkflowVariant,
    pub seed: u64,
    pub output_node_id: String,
    pub positive_prompt: String,
}

#[derive(Debug, Clone)]
pub struct PromptInjector {
    negative_prompt: String,
}

impl Default for PromptInjector {
    fn default() -> Self {
        Self {
            negative_prompt: NEGATIVE_PROMPT.to_string(),
        }
    }
}

impl PromptInjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inject(
        &self,
        mut graph: GraphDocument,
        input: &InjectionInput<'_>,
    ) -> Result<InjectedGraph, GenerationError> {
        let variant = input.variant;
        let roles = variant.roles();
        if let Some((role, node_id)) = roles.first_missing(&graph) {
            return Err(GenerationError::NodeMapping {
                variant,
                role,
                node_id: node_id.to_string(),
            });
        }
        let graph_err = |err: GraphError| GenerationError::TemplateParse {
            name: roles.template.to_string(),
            message: err.to_string(),
        };

        let tokens = dynamic_tokens(variant, input.attributes, input.ranked_tags);
        let joined = tokens.join(", ");
        let background = input.context.background();

        let existing = graph
            .text_input(roles.positive_prompt, PROMPT_TEXT_INPUT)
            .map_err(graph_err)?;
        let positive = if existing.contains(DYNAMIC_PROMPT_MARKER) {
            fill_marker(existing, DYNAMIC_PROMPT_MARKER, &joined)
        } else {
            append_tokens(existing, &joined)
        };
        let positive = fill_background(&positive, background);
        graph
            .set_input(roles.positive_prompt, PROMPT_TEXT_INPUT, positive.clone())
            .map_err(graph_err)?;

        if let Some(node_id) = roles.secondary_prompt {
            let detail_tokens = [input.attributes.hair_token(), input.attributes.eye_token()]
                .into_iter()
                .flatten()
                .collect::<Vec<String>>()
                .join(", ");
            let existing = graph
                .text_input(node_id, PROMPT_TEXT_INPUT)
                .map_err(graph_err)?;
            let secondary = fill_background(&append_tokens(existing, &detail_tokens), background);
            graph
                .set_input(node_id, PROMPT_TEXT_INPUT, secondary)
                .map_err(graph_err)?;
        }

        graph
            .set_input(
                roles.negative_prompt,
                PROMPT_TEXT_INPUT,
                self.negative_prompt.clone(),
            )
            .map_err(graph_err)?;

        let seed = match input.seed {
            Some(seed) if seed > MAX_SAFE_SEED => {
                return Err(GenerationError::SeedOutOfRange {
                    seed,
                    max: MAX_SAFE_SEED,
                })
            }
            Some(seed) => seed,
            None => random_seed(),
        };
        graph
            .set_input(roles.seed, SEED_INPUT, seed)
            .map_err(graph_err)?;
        if let Some(node_id) = roles.detailer_seed {
            graph
                .set_input(node_id, SEED_INPUT, seed)
                .map_err(graph_err)?;
        }

        if let (Some(node_id), Some(image)) = (roles.conditioning_image, input.conditioning_image) {
            graph
                .set_input(node_id, IMAGE_INPUT, image.relative_path())
                .map_err(graph_err)?;
            if variant.is_body() {
                if let Some(aux) = roles.auxiliary_model {
                    graph
                        .set_input(aux.node, aux.input, aux.value)
                        .map_err(graph_err)?;
                }
            }
        }

        if let Some(name) = input.output_name {
            graph
                .set_input(
                    roles.output,
                    FILENAME_PREFIX_INPUT,
                    name.prefix(variant.image_kind(), seed),
                )
                .map_err(graph_err)?;
        }

        Ok(InjectedGraph {
            graph,
            variant,
            seed,
            output_node_id: roles.output.to_string(),
            positive_prompt: positive,
        })
    }
}

/// Ordered, blank-free token list: subject and expression, ethnicity, hair,
/// eyes, body type (body variants only), then the ranked tags as supplied.
pub fn dynamic_tokens(
    variant: WorkflowVariant,
    attributes: &CharacterAttributes,
    ranked_tags: &[String],
) -> Vec<String> {
    let mut tokens = vec![
        Some(attributes.anatomy.subject_token().to_string()),
        Some(attributes.expression_token().to_string()),
        non_blank(&attributes.ethnicity).map(str::to_string),
        attributes.hair_token(),
        attributes.eye_token(),
    ];
    if variant.is_body() {
        tokens.push(
            attributes
                .body_type
                .as_deref()
                .and_then(non_blank)
                .map(str::to_string),
        );
    }
    tokens.extend(
        ranked_tags
            .iter()
            .map(|tag| non_blank(tag).map(str::to_string)),
    );
    tokens.into_iter().flatten().collect()
}

/// Appends `addition` to `existing`, adding a `, ` separator only when
/// `existing` has text and does not already end with a comma.
pub fn append_tokens(existing: &str, addition: &str) -> String {
    let addition = addition.trim();
    let base = existing.trim_end();
    if addition.is_empty() {
        return existing.to_string();
    }
    if base.is_empty() {
        return addition.to_string();
    }
    if base.ends_with(',') {
        return format!("{base} {addition}");
    }
    format!("{base}, {addition}")
}

/// Replaces the first `marker` with `replacement`, drops any later copies,
/// then collapses empty comma segments.
pub fn fill_marker(text: &str, marker: &str, replacement: &str) -> String {
    let replaced = text.replacen(marker, replacement, 1).replace(marker, "");
    tidy_commas(&replaced)
}

fn fill_background(text: &str, background: &str) -> String {
    if text.contains(BACKGROUND_PROMPT_MARKER) {
        fill_marker(text, BACKGROUND_PROMPT_MARKER, background)
    } else {
        text.to_string()
    }
}

fn tidy_commas(text: &str) -> String {
    text.split(',')
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<&str>>()
        .join(", ")
}

fn non_blank(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn random_seed() -> u64 {
    rand::thread_rng().gen_range(0..=MAX_SAFE_SEED)
}
