use morph_contracts::workflow::{NodeRole, WorkflowVariant};

/// Error taxonomy surfaced to callers of the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Template or node-mapping mismatch; a deployment bug, never retried.
    Configuration,
    /// HTTP non-2xx or connection failure.
    Transport,
    /// The graph failed on a specific node, or was stopped by the engine.
    EngineExecution,
    /// The engine answered with something this client cannot interpret.
    Protocol,
}

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("workflow template '{name}' not found")]
    TemplateNotFound { name: String },
    #[error("workflow template '{name}' is not a valid graph: {message}")]
    TemplateParse { name: String, message: String },
    #[error("{variant} mapping expects {role} node '{node_id}' but the graph has none")]
    NodeMapping {
        variant: WorkflowVariant,
        role: NodeRole,
        node_id: String,
    },
    #[error("seed {seed} exceeds the largest supported seed {max}")]
    SeedOutOfRange { seed: u64, max: u64 },
    #[error("engine rejected the graph ({status}): {body}")]
    EngineRejected { status: u16, body: String },
    #[error("conditioning image upload failed ({status}): {body}")]
    UploadFailed { status: u16, body: String },
    #[error("artifact fetch failed ({status}): {body}")]
    FetchFailed { status: u16, body: String },
    #[error("{context}")]
    Http {
        context: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{context}: {message}")]
    MalformedResponse { context: String, message: String },
    #[error("event stream error: {message}")]
    Stream { message: String },
    #[error("generation failed{}: {message}", node_suffix(.node_id))]
    Execution {
        node_id: Option<String>,
        message: String,
    },
    #[error("generation was interrupted")]
    Interrupted,
    #[error("event stream disconnected: {message}")]
    Disconnected { message: String },
}

fn node_suffix(node_id: &Option<String>) -> String {
    node_id
        .as_deref()
        .map(|node| format!(" on node '{node}'"))
        .unwrap_or_default()
}

impl GenerationError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::TemplateNotFound { .. }
            | Self::TemplateParse { .. }
            | Self::NodeMapping { .. }
            | Self::SeedOutOfRange { .. } => ErrorCategory::Configuration,
            Self::EngineRejected { .. }
            | Self::UploadFailed { .. }
            | Self::FetchFailed { .. }
            | Self::Http { .. }
            | Self::Stream { .. }
            | Self::Disconnected { .. } => ErrorCategory::Transport,
            Self::Execution { .. } | Self::Interrupted => ErrorCategory::EngineExecution,
            Self::MalformedResponse { .. } => ErrorCategory::Protocol,
        }
    }

    pub(crate) fn http(context: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Http {
            context: context.into(),
            source,
        }
    }
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

#[cfg(test)]
mod tests {
    use morph_contracts::workflow::{NodeRole, WorkflowVariant};

    use super::{truncate_text, ErrorCategory, GenerationError};

    #[test]
    fn mapping_error_names_variant_role_and_node() {
        let err = GenerationError::NodeMapping {
            variant: WorkflowVariant::BodyWithDetailer,
            role: NodeRole::SecondaryPrompt,
            node_id: "31".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "body_with_detailer mapping expects secondary_prompt node '31' but the graph has none"
        );
        assert_eq!(err.category(), ErrorCategory::Configuration);
    }

    #[test]
    fn execution_error_mentions_node_when_known() {
        let with_node = GenerationError::Execution {
            node_id: Some("6".to_string()),
            message: "CUDA OOM".to_string(),
        };
        assert_eq!(with_node.to_string(), "generation failed on node '6': CUDA OOM");
        let without = GenerationError::Execution {
            node_id: None,
            message: "connection reset".to_string(),
        };
        assert_eq!(without.to_string(), "generation failed: connection reset");
        assert_eq!(without.category(), ErrorCategory::EngineExecution);
    }

    #[test]
    fn transport_and_protocol_categories() {
        assert_eq!(
            GenerationError::EngineRejected {
                status: 400,
                body: "{}".to_string()
            }
            .category(),
            ErrorCategory::Transport
        );
        assert_eq!(
            GenerationError::MalformedResponse {
                context: "enqueue".to_string(),
                message: "missing prompt_id".to_string()
            }
            .category(),
            ErrorCategory::Protocol
        );
    }

    #[test]
    fn truncate_appends_ellipsis() {
        assert_eq!(truncate_text("abcdef", 3), "abc…");
        assert_eq!(truncate_text("abc", 3), "abc");
    }
}
