//! Boundary parser for the engine's `{type, data}` event frames.
//!
//! Every frame is turned into one variant of the closed [`EngineEvent`] union
//! or rejected with a [`ProtocolAnomaly`]. Unknown event types are a distinct,
//! non-fatal variant rather than an error.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Status {
        queue_remaining: Option<u32>,
    },
    ExecutionStart {
        prompt_id: Option<String>,
    },
    /// `node == None` marks the end of the graph.
    Executing {
        prompt_id: Option<String>,
        node: Option<String>,
    },
    Progress {
        prompt_id: Option<String>,
        node: Option<String>,
        value: u32,
        max: u32,
    },
    Executed {
        prompt_id: Option<String>,
        node: String,
        output: Value,
    },
    ExecutionError {
        prompt_id: Option<String>,
        node_id: Option<String>,
        node_type: Option<String>,
        exception_type: Option<String>,
        exception_message: String,
    },
    ExecutionCached {
        prompt_id: Option<String>,
        nodes: Vec<String>,
    },
    ExecutionInterrupted {
        prompt_id: Option<String>,
        node_id: Option<String>,
    },
    ExecutionSuccess {
        prompt_id: Option<String>,
    },
    Unknown {
        event_type: String,
    },
}

impl EngineEvent {
    pub fn event_type(&self) -> &str {
        match self {
            Self::Status { .. } => "status",
            Self::ExecutionStart { .. } => "execution_start",
            Self::Executing { .. } => "executing",
            Self::Progress { .. } => "progress",
            Self::Executed { .. } => "executed",
            Self::ExecutionError { .. } => "execution_error",
            Self::ExecutionCached { .. } => "execution_cached",
            Self::ExecutionInterrupted { .. } => "execution_interrupted",
            Self::ExecutionSuccess { .. } => "execution_success",
            Self::Unknown { event_type } => event_type.as_str(),
        }
    }

    /// Correlation id carried by the event, if the engine included one.
    pub fn prompt_id(&self) -> Option<&str> {
        match self {
            Self::ExecutionStart { prompt_id }
            | Self::Executing { prompt_id, .. }
            | Self::Progress { prompt_id, .. }
            | Self::Executed { prompt_id, .. }
            | Self::ExecutionError { prompt_id, .. }
            | Self::ExecutionCached { prompt_id, .. }
            | Self::ExecutionInterrupted { prompt_id, .. }
            | Self::ExecutionSuccess { prompt_id } => prompt_id.as_deref(),
            Self::Status { .. } | Self::Unknown { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolAnomaly {
    #[error("frame is not valid JSON: {reason}")]
    InvalidJson { reason: String },
    #[error("frame has no string `type` field")]
    MissingType,
    #[error("`{event_type}` payload is malformed: {reason}")]
    MalformedPayload { event_type: String, reason: String },
    #[error("unrecognized event type `{event_type}`")]
    UnknownType { event_type: String },
    #[error("binary frame of {len} bytes ignored")]
    BinaryFrame { len: usize },
}

impl ProtocolAnomaly {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidJson { .. } => "invalid_json",
            Self::MissingType => "missing_type",
            Self::MalformedPayload { .. } => "malformed_payload",
            Self::UnknownType { .. } => "unknown_type",
            Self::BinaryFrame { .. } => "binary_frame",
        }
    }
}

#[derive(Deserialize)]
struct StatusData {
    #[serde(default)]
    status: Option<StatusBody>,
}

#[derive(Deserialize)]
struct StatusBody {
    #[serde(default)]
    exec_info: Option<ExecInfo>,
}

#[derive(Deserialize)]
struct ExecInfo {
    #[serde(default)]
    queue_remaining: Option<u32>,
}

#[derive(Deserialize)]
struct PromptOnly {
    #[serde(default)]
    prompt_id: Option<String>,
}

#[derive(Deserialize)]
struct ExecutingData {
    #[serde(default)]
    prompt_id: Option<String>,
    #[serde(default)]
    node: Option<String>,
}

#[derive(Deserialize)]
struct ProgressData {
    #[serde(default)]
    prompt_id: Option<String>,
    #[serde(default)]
    node: Option<String>,
    value: f64,
    max: f64,
}

#[derive(Deserialize)]
struct ExecutedData {
    #[serde(default)]
    prompt_id: Option<String>,
    node: String,
    #[serde(default)]
    output: Value,
}

#[derive(Deserialize)]
struct ExecutionErrorData {
    #[serde(default)]
    prompt_id: Option<String>,
    #[serde(default, alias = "node")]
    node_id: Option<String>,
    #[serde(default)]
    node_type: Option<String>,
    #[serde(default)]
    exception_type: Option<String>,
    #[serde(default)]
    exception_message: Option<String>,
}

#[derive(Deserialize)]
struct ExecutionCachedData {
    #[serde(default)]
    prompt_id: Option<String>,
    #[serde(default)]
    nodes: Vec<String>,
}

#[derive(Deserialize)]
struct ExecutionInterruptedData {
    #[serde(default)]
    prompt_id: Option<String>,
    #[serde(default, alias = "node")]
    node_id: Option<String>,
}

pub fn parse_event(raw: &str) -> Result<EngineEvent, ProtocolAnomaly> {
    let frame: Value = serde_json::from_str(raw).map_err(|err| ProtocolAnomaly::InvalidJson {
        reason: err.to_string(),
    })?;
    parse_event_value(frame)
}

pub fn parse_event_value(frame: Value) -> Result<EngineEvent, ProtocolAnomaly> {
    let Value::Object(mut frame) = frame else {
        return Err(ProtocolAnomaly::MissingType);
    };
    let event_type = frame
        .get("type")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(ProtocolAnomaly::MissingType)?;
    let data = match frame.remove("data") {
        Some(Value::Null) | None => Value::Object(Map::new()),
        Some(data) => data,
    };

    let event = match event_type.as_str() {
        "status" => {
            let parsed: StatusData = decode(&event_type, data)?;
            EngineEvent::Status {
                queue_remaining: parsed
                    .status
                    .and_then(|status| status.exec_info)
                    .and_then(|info| info.queue_remaining),
            }
        }
        "execution_start" => {
            let parsed: PromptOnly = decode(&event_type, data)?;
            EngineEvent::ExecutionStart {
                prompt_id: parsed.prompt_id,
            }
        }
        "executing" => {
            let parsed: ExecutingData = decode(&event_type, data)?;
            EngineEvent::Executing {
                prompt_id: parsed.prompt_id,
                node: parsed.node,
            }
        }
        "progress" => {
            let parsed: ProgressData = decode(&event_type, data)?;
            EngineEvent::Progress {
                prompt_id: parsed.prompt_id,
                node: parsed.node,
                value: clamp_step(parsed.value),
                max: clamp_step(parsed.max),
            }
        }
        "executed" => {
            let parsed: ExecutedData = decode(&event_type, data)?;
            EngineEvent::Executed {
                prompt_id: parsed.prompt_id,
                node: parsed.node,
                output: parsed.output,
            }
        }
        "execution_error" => {
            let parsed: ExecutionErrorData = decode(&event_type, data)?;
            EngineEvent::ExecutionError {
                prompt_id: parsed.prompt_id,
                node_id: parsed.node_id,
                node_type: parsed.node_type,
                exception_type: parsed.exception_type,
                exception_message: parsed
                    .exception_message
                    .filter(|message| !message.trim().is_empty())
                    .unwrap_or_else(|| "engine reported an execution error".to_string()),
            }
        }
        "execution_cached" => {
            let parsed: ExecutionCachedData = decode(&event_type, data)?;
            EngineEvent::ExecutionCached {
                prompt_id: parsed.prompt_id,
                nodes: parsed.nodes,
            }
        }
        "execution_interrupted" => {
            let parsed: ExecutionInterruptedData = decode(&event_type, data)?;
            EngineEvent::ExecutionInterrupted {
                prompt_id: parsed.prompt_id,
                node_id: parsed.node_id,
            }
        }
        "execution_success" => {
            let parsed: PromptOnly = decode(&event_type, data)?;
            EngineEvent::ExecutionSuccess {
                prompt_id: parsed.prompt_id,
            }
        }
        _ => EngineEvent::Unknown { event_type },
    };
    Ok(event)
}

fn decode<T: DeserializeOwned>(event_type: &str, data: Value) -> Result<T, ProtocolAnomaly> {
    serde_json::from_value(data).map_err(|err| ProtocolAnomaly::MalformedPayload {
        event_type: event_type.to_string(),
        reason: err.to_string(),
    })
}

fn clamp_step(value: f64) -> u32 {
    if !value.is_finite() || value <= 0.0 {
        return 0;
    }
    value.round().min(f64::from(u32::MAX)) as u32
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{parse_event, EngineEvent, ProtocolAnomaly};

    #[test]
    fn status_reads_nested_queue_remaining() {
        let raw = json!({
            "type": "status",
            "data": {"status": {"exec_info": {"queue_remaining": 1}}, "sid": "client-1"}
        })
        .to_string();
        assert_eq!(
            parse_event(&raw),
            Ok(EngineEvent::Status {
                queue_remaining: Some(1)
            })
        );
    }

    #[test]
    fn executing_null_node_is_end_of_graph() {
        let raw = json!({"type": "executing", "data": {"node": null, "prompt_id": "abc"}}).to_string();
        let event = parse_event(&raw);
        assert_eq!(
            event,
            Ok(EngineEvent::Executing {
                prompt_id: Some("abc".to_string()),
                node: None
            })
        );
        assert_eq!(event.map(|e| e.prompt_id().map(str::to_string)), Ok(Some("abc".to_string())));
    }

    #[test]
    fn progress_values_are_rounded_and_clamped() {
        let raw = json!({"type": "progress", "data": {"value": 5.4, "max": 20, "prompt_id": "abc"}}).to_string();
        assert_eq!(
            parse_event(&raw),
            Ok(EngineEvent::Progress {
                prompt_id: Some("abc".to_string()),
                node: None,
                value: 5,
                max: 20
            })
        );
        let negative = json!({"type": "progress", "data": {"value": -3, "max": 20}}).to_string();
        assert!(matches!(
            parse_event(&negative),
            Ok(EngineEvent::Progress { value: 0, .. })
        ));
    }

    #[test]
    fn execution_error_accepts_node_alias_and_defaults_message() {
        let raw = json!({
            "type": "execution_error",
            "data": {"prompt_id": "abc", "node": "6", "exception_message": "CUDA OOM"}
        })
        .to_string();
        assert!(matches!(
            parse_event(&raw),
            Ok(EngineEvent::ExecutionError { node_id: Some(ref node), ref exception_message, .. })
                if node == "6" && exception_message == "CUDA OOM"
        ));

        let blank = json!({"type": "execution_error", "data": {"prompt_id": "abc"}}).to_string();
        assert!(matches!(
            parse_event(&blank),
            Ok(EngineEvent::ExecutionError { ref exception_message, .. })
                if exception_message == "engine reported an execution error"
        ));
    }

    #[test]
    fn unknown_type_is_not_an_error() {
        let raw = json!({"type": "crystools.monitor", "data": {"cpu": 12}}).to_string();
        let event = parse_event(&raw);
        assert_eq!(
            event,
            Ok(EngineEvent::Unknown {
                event_type: "crystools.monitor".to_string()
            })
        );
    }

    #[test]
    fn malformed_frames_become_anomalies() {
        assert!(matches!(
            parse_event("not json"),
            Err(ProtocolAnomaly::InvalidJson { .. })
        ));
        assert_eq!(parse_event("[1, 2]"), Err(ProtocolAnomaly::MissingType));
        assert_eq!(parse_event(r#"{"data": {}}"#), Err(ProtocolAnomaly::MissingType));

        let missing_node = json!({"type": "executed", "data": {"prompt_id": "abc"}}).to_string();
        let err = parse_event(&missing_node);
        assert!(matches!(
            err,
            Err(ProtocolAnomaly::MalformedPayload { ref event_type, .. }) if event_type == "executed"
        ));
        assert_eq!(err.err().map(|anomaly| anomaly.code()), Some("malformed_payload"));
    }

    #[test]
    fn status_without_prompt_id_is_unscoped() {
        let raw = json!({"type": "status", "data": {"status": {}}}).to_string();
        let event = parse_event(&raw);
        assert_eq!(event.as_ref().map(|e| e.prompt_id()), Ok(None));
        assert_eq!(event.as_ref().map(|e| e.event_type()), Ok("status"));
    }
}
