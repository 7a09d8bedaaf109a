//! One generation session: consumes the event stream of a single submission
//! and reports exactly one terminal outcome.
//!
//! Events carrying a different `prompt_id` belong to another submission on
//! shared engine infrastructure and are dropped without touching state.
//! Completion is gated on the request's designated output node; images from
//! any other node are previews and never end the session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use morph_contracts::artifacts::{ArtifactReference, GeneratedArtifact};
use morph_contracts::events::{EventPayload, EventWriter};
use morph_contracts::graph::GraphDocument;
use morph_contracts::protocol::{parse_event, EngineEvent, ProtocolAnomaly};
use morph_contracts::session::{ProgressState, SessionOutcome, SessionState};
use morph_contracts::workflow::WorkflowVariant;
use serde_json::{json, Value};

use crate::stream::{EventStream, StreamFrame};

pub const CONNECTION_ERROR_PREFIX: &str = "connection error";

/// Immutable description of one submission, owned by its session.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub correlation_id: String,
    pub client_id: String,
    pub graph: GraphDocument,
    pub variant: WorkflowVariant,
    pub seed: u64,
    pub output_node_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    Progress(ProgressState),
    Preview(Vec<GeneratedArtifact>),
    Anomaly(ProtocolAnomaly),
    Terminal(SessionOutcome),
}

/// Receives session updates at the UI boundary.
pub trait SessionObserver {
    fn on_progress(&mut self, _progress: &ProgressState) {}
    fn on_preview(&mut self, _artifacts: &[GeneratedArtifact]) {}
    fn on_anomaly(&mut self, _anomaly: &ProtocolAnomaly) {}
    fn on_outcome(&mut self, _outcome: &SessionOutcome) {}
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl SessionObserver for NullObserver {}

#[derive(Debug)]
pub struct GenerationSession {
    request: GenerationRequest,
    state: SessionState,
    progress: Option<ProgressState>,
    last_executed: Option<String>,
    outcome: Option<SessionOutcome>,
}

impl GenerationSession {
    pub fn new(request: GenerationRequest) -> Self {
        let mut progress = ProgressState::new(request.correlation_id.clone());
        progress.message = "connecting".to_string();
        Self {
            request,
            state: SessionState::Connecting,
            progress: Some(progress),
            last_executed: None,
            outcome: None,
        }
    }

    pub fn request(&self) -> &GenerationRequest {
        &self.request
    }

    pub fn correlation_id(&self) -> &str {
        &self.request.correlation_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// `None` once the session is terminal.
    pub fn progress(&self) -> Option<&ProgressState> {
        self.progress.as_ref()
    }

    pub fn outcome(&self) -> Option<&SessionOutcome> {
        self.outcome.as_ref()
    }

    pub fn last_executed_node(&self) -> Option<&str> {
        self.last_executed.as_deref()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// The stream is open and the graph is on the engine's queue.
    pub fn connected(&mut self) -> Vec<SessionUpdate> {
        if self.state != SessionState::Connecting {
            return Vec::new();
        }
        self.state = SessionState::Queued;
        self.replace_progress(|progress| progress.message = "queued".to_string())
    }

    pub fn handle_text(&mut self, raw: &str) -> Vec<SessionUpdate> {
        if self.is_terminal() {
            return Vec::new();
        }
        match parse_event(raw) {
            Ok(event) => self.handle_event(event),
            Err(anomaly) => vec![SessionUpdate::Anomaly(anomaly)],
        }
    }

    pub fn handle_binary(&mut self, len: usize) -> Vec<SessionUpdate> {
        if self.is_terminal() {
            return Vec::new();
        }
        vec![SessionUpdate::Anomaly(ProtocolAnomaly::BinaryFrame { len })]
    }

    pub fn handle_event(&mut self, event: EngineEvent) -> Vec<SessionUpdate> {
        if self.is_terminal() {
            return Vec::new();
        }
        if let Some(prompt_id) = event.prompt_id() {
            if prompt_id != self.request.correlation_id {
                return Vec::new();
            }
        }

        match event {
            EngineEvent::Status { queue_remaining } => self.replace_progress(|progress| {
                progress.queue_position = queue_remaining;
                if let Some(remaining) = queue_remaining {
                    progress.message = format!("queue remaining: {remaining}");
                }
            }),
            EngineEvent::ExecutionStart { .. } => {
                self.begin_executing();
                self.replace_progress(|progress| {
                    progress.queue_position = None;
                    progress.message = "execution started".to_string();
                })
            }
            EngineEvent::Executing {
                node: Some(node), ..
            } => {
                self.begin_executing();
                self.replace_progress(|progress| {
                    progress.message = format!("executing node {node}");
                    progress.current_node_id = Some(node);
                    progress.step = 0;
                    progress.max_steps = 0;
                })
            }
            EngineEvent::Executing { node: None, .. } | EngineEvent::ExecutionSuccess { .. } => {
                self.state = SessionState::Finalizing;
                self.replace_progress(|progress| {
                    progress.current_node_id = None;
                    progress.message = "finalizing".to_string();
                })
            }
            EngineEvent::Progress {
                node, value, max, ..
            } => {
                self.begin_executing();
                self.replace_progress(|progress| {
                    if let Some(node) = node {
                        progress.current_node_id = Some(node);
                    }
                    progress.step = value;
                    progress.max_steps = max;
                    progress.message = format!("step {value}/{max}");
                })
            }
            EngineEvent::ExecutionCached { nodes, .. } => self.replace_progress(|progress| {
                progress.message = format!("{} cached nodes", nodes.len());
            }),
            EngineEvent::Executed { node, output, .. } => self.handle_executed(node, &output),
            EngineEvent::ExecutionError {
                node_id,
                exception_message,
                ..
            } => self.finish(SessionOutcome::Failed {
                node_id,
                message: exception_message,
            }),
            EngineEvent::ExecutionInterrupted { .. } => self.finish(SessionOutcome::Interrupted),
            EngineEvent::Unknown { event_type } => {
                vec![SessionUpdate::Anomaly(ProtocolAnomaly::UnknownType {
                    event_type,
                })]
            }
        }
    }

    /// Transport-level failure of the stream.
    pub fn handle_transport_error(&mut self, message: &str) -> Vec<SessionUpdate> {
        if self.is_terminal() {
            return Vec::new();
        }
        self.finish(SessionOutcome::Failed {
            node_id: None,
            message: format!("{CONNECTION_ERROR_PREFIX}: {message}"),
        })
    }

    /// The stream closed. A no-op once a terminal event has been processed.
    pub fn handle_close(&mut self, clean: bool, reason: &str) -> Vec<SessionUpdate> {
        if self.is_terminal() {
            return Vec::new();
        }
        let kind = if clean { "closed" } else { "unexpected close" };
        let message = if reason.trim().is_empty() {
            format!("{kind} before the generation finished")
        } else {
            format!("{kind} before the generation finished: {}", reason.trim())
        };
        self.finish(SessionOutcome::Disconnected { message })
    }

    fn handle_executed(&mut self, node: String, output: &Value) -> Vec<SessionUpdate> {
        let references = ArtifactReference::list_from_output(output);
        let artifacts = references
            .into_iter()
            .map(|reference| GeneratedArtifact {
                reference,
                correlation_id: self.request.correlation_id.clone(),
                node_id: node.clone(),
                seed: self.request.seed,
            })
            .collect::<Vec<GeneratedArtifact>>();
        let is_output = node == self.request.output_node_id;
        self.last_executed = Some(node);

        if artifacts.is_empty() {
            return Vec::new();
        }
        if is_output {
            return self.finish(SessionOutcome::Completed { artifacts });
        }
        vec![SessionUpdate::Preview(artifacts)]
    }

    fn begin_executing(&mut self) {
        if matches!(self.state, SessionState::Connecting | SessionState::Queued) {
            self.state = SessionState::Executing;
        }
    }

    fn replace_progress(&mut self, update: impl FnOnce(&mut ProgressState)) -> Vec<SessionUpdate> {
        let Some(current) = self.progress.as_ref() else {
            return Vec::new();
        };
        let mut next = current.clone();
        update(&mut next);
        self.progress = Some(next.clone());
        vec![SessionUpdate::Progress(next)]
    }

    fn finish(&mut self, outcome: SessionOutcome) -> Vec<SessionUpdate> {
        self.state = outcome.state();
        self.progress = None;
        self.outcome = Some(outcome.clone());
        vec![SessionUpdate::Terminal(outcome)]
    }
}

/// Shared flag a caller raises to abandon a running session.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

pub fn dispatch(observer: &mut dyn SessionObserver, updates: Vec<SessionUpdate>) {
    for update in updates {
        match update {
            SessionUpdate::Progress(progress) => observer.on_progress(&progress),
            SessionUpdate::Preview(artifacts) => observer.on_preview(&artifacts),
            SessionUpdate::Anomaly(anomaly) => observer.on_anomaly(&anomaly),
            SessionUpdate::Terminal(outcome) => observer.on_outcome(&outcome),
        }
    }
}

/// Pumps `stream` into `session` until it reaches a terminal state, then
/// closes the stream. Cancellation and the optional deadline both close the
/// connection, which the session reports as `Disconnected`.
pub fn drive_session(
    session: &mut GenerationSession,
    stream: &mut dyn EventStream,
    observer: &mut dyn SessionObserver,
    cancel: &CancelToken,
    deadline: Option<Instant>,
) -> SessionOutcome {
    loop {
        if let Some(outcome) = session.outcome() {
            let outcome = outcome.clone();
            stream.close();
            return outcome;
        }
        if cancel.is_cancelled() {
            stream.close();
            dispatch(observer, session.handle_close(true, "cancelled by caller"));
            continue;
        }
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            stream.close();
            dispatch(observer, session.handle_close(true, "deadline exceeded"));
            continue;
        }

        let updates = match stream.next_frame() {
            Ok(StreamFrame::Text(raw)) => session.handle_text(&raw),
            Ok(StreamFrame::Binary(len)) => session.handle_binary(len),
            Ok(StreamFrame::Idle) => continue,
            Ok(StreamFrame::Closed { clean, reason }) => session.handle_close(clean, &reason),
            Err(err) => session.handle_transport_error(&err.to_string()),
        };
        dispatch(observer, updates);
    }
}

/// Writes every session update to the JSONL event log.
#[derive(Debug, Clone)]
pub struct EventLogObserver {
    events: EventWriter,
}

impl EventLogObserver {
    pub fn new(events: EventWriter) -> Self {
        Self { events }
    }
}

impl SessionObserver for EventLogObserver {
    fn on_progress(&mut self, progress: &ProgressState) {
        let _ = self.events.emit("generation_progress", to_payload(progress));
    }

    fn on_preview(&mut self, artifacts: &[GeneratedArtifact]) {
        let _ = self.events.emit(
            "generation_preview",
            to_payload(&json!({ "artifacts": artifacts })),
        );
    }

    fn on_anomaly(&mut self, anomaly: &ProtocolAnomaly) {
        let _ = self.events.emit(
            "protocol_anomaly",
            to_payload(&json!({
                "code": anomaly.code(),
                "detail": anomaly.to_string(),
            })),
        );
    }

    fn on_outcome(&mut self, outcome: &SessionOutcome) {
        let _ = self.events.emit("generation_finished", to_payload(outcome));
    }
}

/// Forwards to a caller observer and, when present, the event log.
pub(crate) struct TeeObserver<'a> {
    pub(crate) primary: &'a mut dyn SessionObserver,
    pub(crate) log: Option<EventLogObserver>,
}

impl SessionObserver for TeeObserver<'_> {
    fn on_progress(&mut self, progress: &ProgressState) {
        if let Some(log) = self.log.as_mut() {
            log.on_progress(progress);
        }
        self.primary.on_progress(progress);
    }

    fn on_preview(&mut self, artifacts: &[GeneratedArtifact]) {
        if let Some(log) = self.log.as_mut() {
            log.on_preview(artifacts);
        }
        self.primary.on_preview(artifacts);
    }

    fn on_anomaly(&mut self, anomaly: &ProtocolAnomaly) {
        if let Some(log) = self.log.as_mut() {
            log.on_anomaly(anomaly);
        }
        self.primary.on_anomaly(anomaly);
    }

    fn on_outcome(&mut self, outcome: &SessionOutcome) {
        if let Some(log) = self.log.as_mut() {
            log.on_outcome(outcome);
        }
        self.primary.on_outcome(outcome);
    }
}

pub(crate) fn to_payload<T: serde::Serialize + ?Sized>(value: &T) -> EventPayload {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => map,
        _ => EventPayload::new(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::{Duration, Instant};

    use morph_contracts::artifacts::GeneratedArtifact;
    use morph_contracts::events::EventWriter;
    use morph_contracts::graph::GraphDocument;
    use morph_contracts::protocol::ProtocolAnomaly;
    use morph_contracts::session::{ProgressState, SessionOutcome, SessionState};
    use morph_contracts::workflow::WorkflowVariant;
    use serde_json::{json, Value};

    use super::{
        drive_session, CancelToken, EventLogObserver, GenerationRequest, GenerationSession,
        SessionObserver, SessionUpdate, CONNECTION_ERROR_PREFIX,
    };
    use crate::stream::testing::{text, ScriptedStream};
    use crate::stream::StreamFrame;

    #[derive(Default)]
    struct Recorder {
        progress: Vec<ProgressState>,
        previews: Vec<Vec<GeneratedArtifact>>,
        anomalies: Vec<ProtocolAnomaly>,
        outcomes: Vec<SessionOutcome>,
    }

    impl SessionObserver for Recorder {
        fn on_progress(&mut self, progress: &ProgressState) {
            self.progress.push(progress.clone());
        }

        fn on_preview(&mut self, artifacts: &[GeneratedArtifact]) {
            self.previews.push(artifacts.to_vec());
        }

        fn on_anomaly(&mut self, anomaly: &ProtocolAnomaly) {
            self.anomalies.push(anomaly.clone());
        }

        fn on_outcome(&mut self, outcome: &SessionOutcome) {
            self.outcomes.push(outcome.clone());
        }
    }

    fn face_session(correlation_id: &str) -> GenerationSession {
        let mut session = GenerationSession::new(GenerationRequest {
            correlation_id: correlation_id.to_string(),
            client_id: "client-1".to_string(),
            graph: GraphDocument::default(),
            variant: WorkflowVariant::Face,
            seed: 12345,
            output_node_id: "9".to_string(),
        });
        session.connected();
        session
    }

    fn output_images(filename: &str) -> Value {
        json!({"images": [{"filename": filename, "subfolder": "", "type": "output"}]})
    }

    fn feed(session: &mut GenerationSession, events: &[Value]) -> Vec<SessionUpdate> {
        events
            .iter()
            .flat_map(|event| session.handle_text(&event.to_string()))
            .collect()
    }

    #[test]
    fn face_generation_completes_with_output_node_images() -> anyhow::Result<()> {
        let mut session = face_session("p1");
        assert_eq!(session.state(), SessionState::Queued);

        feed(
            &mut session,
            &[
                json!({"type": "status", "data": {"status": {"exec_info": {"queue_remaining": 1}}}}),
                json!({"type": "execution_start", "data": {"prompt_id": "p1"}}),
                json!({"type": "executing", "data": {"node": "3", "prompt_id": "p1"}}),
                json!({"type": "progress", "data": {"value": 10, "max": 20, "prompt_id": "p1", "node": "3"}}),
            ],
        );
        assert_eq!(session.state(), SessionState::Executing);
        let progress = session.progress().cloned().expect("progress while running");
        assert_eq!(progress.step, 10);
        assert_eq!(progress.max_steps, 20);
        assert_eq!(progress.current_node_id.as_deref(), Some("3"));

        let updates = feed(
            &mut session,
            &[json!({"type": "executed", "data": {
                "node": "9",
                "prompt_id": "p1",
                "output": output_images("ComfyUI_001.png"),
            }})],
        );

        assert_eq!(session.state(), SessionState::Completed);
        assert!(session.progress().is_none());
        let Some(SessionUpdate::Terminal(SessionOutcome::Completed { artifacts })) = updates.last()
        else {
            panic!("expected completion, got {updates:?}");
        };
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].reference.filename, "ComfyUI_001.png");
        assert_eq!(artifacts[0].correlation_id, "p1");
        assert_eq!(artifacts[0].seed, 12345);
        assert_eq!(artifacts[0].node_id, "9");
        Ok(())
    }

    #[test]
    fn execution_error_fails_and_ignores_later_events() -> anyhow::Result<()> {
        let mut session = face_session("p1");
        let updates = feed(
            &mut session,
            &[
                json!({"type": "execution_error", "data": {
                    "prompt_id": "p1",
                    "node_id": "3",
                    "exception_message": "CUDA out of memory",
                }}),
                json!({"type": "executed", "data": {
                    "node": "9",
                    "prompt_id": "p1",
                    "output": output_images("late.png"),
                }}),
            ],
        );

        assert_eq!(
            updates,
            vec![SessionUpdate::Terminal(SessionOutcome::Failed {
                node_id: Some("3".to_string()),
                message: "CUDA out of memory".to_string(),
            })]
        );
        assert_eq!(session.state(), SessionState::Failed);
        assert!(session.handle_close(false, "gone").is_empty());
        Ok(())
    }

    #[test]
    fn unclean_close_while_executing_disconnects() -> anyhow::Result<()> {
        let mut session = face_session("p1");
        feed(
            &mut session,
            &[json!({"type": "executing", "data": {"node": "3", "prompt_id": "p1"}})],
        );
        let updates = session.handle_close(false, "connection reset");
        assert!(matches!(
            updates.as_slice(),
            [SessionUpdate::Terminal(SessionOutcome::Disconnected { message })]
                if message.contains("connection reset")
        ));
        assert_eq!(session.state(), SessionState::Disconnected);
        Ok(())
    }

    #[test]
    fn events_for_other_submissions_are_ignored() -> anyhow::Result<()> {
        let mut session = face_session("p1");
        let updates = feed(
            &mut session,
            &[
                json!({"type": "execution_start", "data": {"prompt_id": "p2"}}),
                json!({"type": "progress", "data": {"value": 5, "max": 20, "prompt_id": "p2"}}),
                json!({"type": "execution_error", "data": {"prompt_id": "p2", "exception_message": "boom"}}),
                json!({"type": "executed", "data": {"node": "9", "prompt_id": "p2", "output": output_images("other.png")}}),
            ],
        );

        assert!(updates.is_empty());
        assert_eq!(session.state(), SessionState::Queued);
        assert!(session.outcome().is_none());
        Ok(())
    }

    #[test]
    fn interleaved_stream_updates_only_the_matching_session() -> anyhow::Result<()> {
        let mut first = face_session("p1");
        let mut second = face_session("p2");
        let stream = [
            json!({"type": "execution_start", "data": {"prompt_id": "p1"}}),
            json!({"type": "progress", "data": {"value": 3, "max": 20, "prompt_id": "p1", "node": "3"}}),
            json!({"type": "execution_start", "data": {"prompt_id": "p2"}}),
            json!({"type": "progress", "data": {"value": 11, "max": 25, "prompt_id": "p2", "node": "3"}}),
            json!({"type": "progress", "data": {"value": 4, "max": 20, "prompt_id": "p1", "node": "3"}}),
            json!({"type": "execution_error", "data": {"prompt_id": "p2", "node_id": "3", "exception_message": "CUDA OOM"}}),
            json!({"type": "executed", "data": {
                "node": "9",
                "prompt_id": "p1",
                "output": output_images("ComfyUI_p1.png"),
            }}),
        ];

        let mut first_progress = Vec::new();
        let mut second_progress = Vec::new();
        for event in &stream {
            let raw = event.to_string();
            first.handle_text(&raw);
            if let Some(progress) = first.progress() {
                first_progress.push(progress.clone());
            }
            second.handle_text(&raw);
            if let Some(progress) = second.progress() {
                second_progress.push(progress.clone());
            }
        }

        assert!(first_progress.iter().all(|progress| progress.correlation_id == "p1"));
        assert!(second_progress.iter().all(|progress| progress.correlation_id == "p2"));
        assert!(first_progress
            .iter()
            .all(|progress| progress.max_steps == 0 || progress.max_steps == 20));
        assert!(second_progress
            .iter()
            .all(|progress| progress.max_steps == 0 || progress.max_steps == 25));
        assert_eq!(first_progress.last().map(|progress| progress.step), Some(4));
        assert_eq!(second_progress.last().map(|progress| progress.step), Some(11));

        assert!(matches!(
            first.outcome(),
            Some(SessionOutcome::Completed { artifacts })
                if artifacts.len() == 1 && artifacts[0].reference.filename == "ComfyUI_p1.png"
        ));
        assert_eq!(
            second.outcome(),
            Some(&SessionOutcome::Failed {
                node_id: Some("3".to_string()),
                message: "CUDA OOM".to_string(),
            })
        );
        Ok(())
    }

    #[test]
    fn images_from_other_nodes_are_previews() -> anyhow::Result<()> {
        let mut session = face_session("p1");
        let updates = feed(
            &mut session,
            &[json!({"type": "executed", "data": {
                "node": "19",
                "prompt_id": "p1",
                "output": {"images": [{"filename": "preview.png", "subfolder": "", "type": "temp"}]},
            }})],
        );

        assert!(matches!(updates.as_slice(), [SessionUpdate::Preview(artifacts)] if artifacts.len() == 1));
        assert!(!session.is_terminal());
        assert_eq!(session.last_executed_node(), Some("19"));
        Ok(())
    }

    #[test]
    fn output_node_without_images_keeps_waiting() -> anyhow::Result<()> {
        let mut session = face_session("p1");
        let updates = feed(
            &mut session,
            &[
                json!({"type": "executed", "data": {"node": "9", "prompt_id": "p1", "output": {}}}),
                json!({"type": "executing", "data": {"node": null, "prompt_id": "p1"}}),
            ],
        );

        assert!(!updates
            .iter()
            .any(|update| matches!(update, SessionUpdate::Terminal(_))));
        assert_eq!(session.state(), SessionState::Finalizing);
        Ok(())
    }

    #[test]
    fn unknown_and_malformed_frames_are_anomalies() -> anyhow::Result<()> {
        let mut session = face_session("p1");
        let mut updates = session.handle_text("{not json");
        updates.extend(session.handle_text(&json!({"type": "crystools.monitor", "data": {}}).to_string()));
        updates.extend(session.handle_binary(128));

        assert_eq!(updates.len(), 3);
        assert!(matches!(updates[0], SessionUpdate::Anomaly(ProtocolAnomaly::InvalidJson { .. })));
        assert!(matches!(
            &updates[1],
            SessionUpdate::Anomaly(ProtocolAnomaly::UnknownType { event_type }) if event_type == "crystools.monitor"
        ));
        assert_eq!(
            updates[2],
            SessionUpdate::Anomaly(ProtocolAnomaly::BinaryFrame { len: 128 })
        );
        assert_eq!(session.state(), SessionState::Queued);
        Ok(())
    }

    #[test]
    fn interruption_is_terminal() -> anyhow::Result<()> {
        let mut session = face_session("p1");
        feed(
            &mut session,
            &[json!({"type": "execution_interrupted", "data": {"prompt_id": "p1", "node_id": "3"}})],
        );
        assert_eq!(session.outcome(), Some(&SessionOutcome::Interrupted));
        Ok(())
    }

    #[test]
    fn transport_error_reports_connection_failure() -> anyhow::Result<()> {
        let mut session = face_session("p1");
        let updates = session.handle_transport_error("tls handshake failed");
        assert!(matches!(
            updates.as_slice(),
            [SessionUpdate::Terminal(SessionOutcome::Failed { node_id: None, message })]
                if message.starts_with(CONNECTION_ERROR_PREFIX)
        ));
        Ok(())
    }

    #[test]
    fn driver_reports_exactly_one_outcome_and_closes_stream() -> anyhow::Result<()> {
        let mut session = face_session("p1");
        let mut stream = ScriptedStream::new(vec![
            Ok(StreamFrame::Idle),
            text(json!({"type": "execution_start", "data": {"prompt_id": "p1"}})),
            Ok(StreamFrame::Binary(16)),
            text(json!({"type": "executed", "data": {
                "node": "9",
                "prompt_id": "p1",
                "output": output_images("ComfyUI_001.png"),
            }})),
            text(json!({"type": "execution_error", "data": {"prompt_id": "p1", "exception_message": "late"}})),
        ]);
        let closed = stream.closed_flag();
        let mut recorder = Recorder::default();

        let outcome = drive_session(
            &mut session,
            &mut stream,
            &mut recorder,
            &CancelToken::new(),
            None,
        );

        assert!(outcome.is_success());
        assert_eq!(recorder.outcomes, vec![outcome]);
        assert_eq!(recorder.anomalies.len(), 1);
        assert!(!recorder.progress.is_empty());
        assert!(closed.load(Ordering::SeqCst));
        Ok(())
    }

    #[test]
    fn driver_disconnects_when_cancelled() -> anyhow::Result<()> {
        let mut session = face_session("p1");
        let mut stream = ScriptedStream::new(vec![Ok(StreamFrame::Idle); 4]);
        let cancel = CancelToken::new();
        cancel.cancel();

        let outcome = drive_session(
            &mut session,
            &mut stream,
            &mut super::NullObserver,
            &cancel,
            None,
        );

        assert!(matches!(outcome, SessionOutcome::Disconnected { message } if message.contains("cancelled")));
        Ok(())
    }

    #[test]
    fn driver_disconnects_after_deadline() -> anyhow::Result<()> {
        let mut session = face_session("p1");
        let mut stream = ScriptedStream::new(vec![Ok(StreamFrame::Idle); 8]);
        let deadline = Instant::now() - Duration::from_millis(1);

        let outcome = drive_session(
            &mut session,
            &mut stream,
            &mut super::NullObserver,
            &CancelToken::new(),
            Some(deadline),
        );

        assert!(matches!(outcome, SessionOutcome::Disconnected { message } if message.contains("deadline")));
        Ok(())
    }

    #[test]
    fn event_log_observer_writes_jsonl() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let writer = EventWriter::new(&path).scoped("p1");
        let mut observer = EventLogObserver::new(writer);

        observer.on_anomaly(&ProtocolAnomaly::BinaryFrame { len: 4 });
        observer.on_outcome(&SessionOutcome::Interrupted);

        let raw = std::fs::read_to_string(&path)?;
        let rows = raw
            .lines()
            .map(serde_json::from_str::<Value>)
            .collect::<Result<Vec<Value>, _>>()?;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["type"], "protocol_anomaly");
        assert_eq!(rows[0]["code"], "binary_frame");
        assert_eq!(rows[1]["type"], "generation_finished");
        assert_eq!(rows[1]["outcome"], "interrupted");
        assert_eq!(rows[1]["session_id"], "p1");
        Ok(())
    }
}
