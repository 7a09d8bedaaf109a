//! Public generation operations. Each call owns a fresh client id, one event
//! stream and one session; nothing is retried here.

use std::time::{Duration, Instant};

use morph_contracts::artifacts::{ArtifactKind, ArtifactReference, GeneratedArtifact};
use morph_contracts::events::EventWriter;
use morph_contracts::session::SessionOutcome;
use morph_contracts::workflow::WorkflowVariant;
use serde_json::json;

use crate::client::{EngineApi, ImageUpload, SubmissionClient};
use crate::config::EngineConfig;
use crate::error::GenerationError;
use crate::injector::{CharacterAttributes, InjectionInput, OutputName, PromptContext, PromptInjector};
use crate::session::{
    dispatch, drive_session, to_payload, CancelToken, EventLogObserver, GenerationRequest,
    GenerationSession, SessionObserver, TeeObserver, CONNECTION_ERROR_PREFIX,
};
use crate::stream::{StreamConnector, WsConnector};
use crate::templates::{BuiltinTemplates, DirectoryTemplates, TemplateResolver};

const PENDING_CONDITIONING: &str = "pending_conditioning.png";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacterRequest {
    pub attributes: CharacterAttributes,
    /// Ordered, deduplicated prompt strings from the tag-ranking service.
    pub ranked_tags: Vec<String>,
    /// Enables character-scoped output filenames when set.
    pub character_id: Option<String>,
    /// Must not exceed `injector::MAX_SAFE_SEED`; larger values are rejected.
    pub seed: Option<u64>,
    pub context: PromptContext,
}

impl CharacterRequest {
    pub fn new(attributes: CharacterAttributes) -> Self {
        Self {
            attributes,
            ranked_tags: Vec::new(),
            character_id: None,
            seed: None,
            context: PromptContext::CharacterCreation,
        }
    }
}

/// Where a body generation gets its face from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditioningSource {
    Upload { bytes: Vec<u8>, filename: String },
    /// An image the engine already holds. Anything outside the input folder is
    /// copied there first, since loader nodes only read inputs.
    Reference(ArtifactReference),
}

#[derive(Debug, Clone)]
pub struct GenerationJob {
    pub variant: WorkflowVariant,
    pub request: CharacterRequest,
    pub conditioning: Option<ConditioningSource>,
    pub cancel: CancelToken,
}

impl GenerationJob {
    pub fn new(variant: WorkflowVariant, request: CharacterRequest) -> Self {
        Self {
            variant,
            request,
            conditioning: None,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_conditioning(mut self, source: ConditioningSource) -> Self {
        self.conditioning = Some(source);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedImages {
    pub correlation_id: String,
    pub client_id: String,
    pub variant: WorkflowVariant,
    pub seed: u64,
    pub artifacts: Vec<GeneratedArtifact>,
}

pub struct Orchestrator {
    api: Box<dyn EngineApi>,
    connector: Box<dyn StreamConnector>,
    templates: TemplateResolver,
    injector: PromptInjector,
    events: Option<EventWriter>,
    deadline: Option<Duration>,
}

impl Orchestrator {
    pub fn new<A, C>(api: A, connector: C, templates: TemplateResolver) -> Self
    where
        A: EngineApi + 'static,
        C: StreamConnector + 'static,
    {
        Self {
            api: Box::new(api),
            connector: Box::new(connector),
            templates,
            injector: PromptInjector::new(),
            events: None,
            deadline: None,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        let templates = match config.template_dir.as_ref() {
            Some(dir) => TemplateResolver::new(DirectoryTemplates::new(dir)),
            None => TemplateResolver::new(BuiltinTemplates),
        };
        Self::new(
            SubmissionClient::new(&config.base_url),
            WsConnector::new(config),
            templates,
        )
        .with_deadline(config.session_deadline)
    }

    pub fn with_event_log(mut self, events: EventWriter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn api(&self) -> &dyn EngineApi {
        self.api.as_ref()
    }

    pub fn templates(&self) -> &TemplateResolver {
        &self.templates
    }

    pub fn generate_face(
        &self,
        request: CharacterRequest,
        observer: &mut dyn SessionObserver,
    ) -> Result<GeneratedImages, GenerationError> {
        self.generate(GenerationJob::new(WorkflowVariant::Face, request), observer)
    }

    pub fn generate_body_from_face(
        &self,
        request: CharacterRequest,
        face: ConditioningSource,
        observer: &mut dyn SessionObserver,
    ) -> Result<GeneratedImages, GenerationError> {
        let job = GenerationJob::new(WorkflowVariant::BodyFromFace, request).with_conditioning(face);
        self.generate(job, observer)
    }

    pub fn generate_body_with_detailer(
        &self,
        request: CharacterRequest,
        face: ConditioningSource,
        observer: &mut dyn SessionObserver,
    ) -> Result<GeneratedImages, GenerationError> {
        let job =
            GenerationJob::new(WorkflowVariant::BodyWithDetailer, request).with_conditioning(face);
        self.generate(job, observer)
    }

    /// Runs one job to its single outcome. Template and mapping problems fail
    /// before any network call; submission problems fail before a session
    /// exists; everything after enqueue arrives as the session's outcome.
    pub fn generate(
        &self,
        job: GenerationJob,
        observer: &mut dyn SessionObserver,
    ) -> Result<GeneratedImages, GenerationError> {
        let variant = job.variant;
        let roles = variant.roles();
        let graph = self.templates.resolve(roles.template)?;
        let wants_conditioning = job.conditioning.is_some() && roles.conditioning_image.is_some();
        let output_name = job.request.character_id.as_deref().map(OutputName::now);
        let injection = |conditioning_image: Option<&ArtifactReference>, seed: Option<u64>| {
            self.injector.inject(
                graph.clone(),
                &InjectionInput {
                    variant,
                    attributes: &job.request.attributes,
                    ranked_tags: &job.request.ranked_tags,
                    conditioning_image,
                    seed,
                    output_name: output_name.as_ref(),
                    context: job.request.context,
                },
            )
        };

        // Injection runs once against a stand-in image so that every template
        // and input problem surfaces before the conditioning upload.
        let pending = ArtifactReference::new(PENDING_CONDITIONING, "", ArtifactKind::Input);
        let planned = injection(wants_conditioning.then_some(&pending), job.request.seed)?;

        let client_id = uuid::Uuid::new_v4().to_string();
        let injected = match job.conditioning.as_ref() {
            Some(source) if wants_conditioning => {
                let staged = self.stage_conditioning(source, &client_id)?;
                injection(Some(&staged), Some(planned.seed))?
            }
            _ => planned,
        };

        let mut stream = self.connector.connect(&client_id)?;
        let receipt = match self.api.enqueue(&injected.graph, &client_id) {
            Ok(receipt) => receipt,
            Err(err) => {
                stream.close();
                return Err(err);
            }
        };
        let correlation_id = receipt.correlation_id.clone();
        let session_events = self
            .events
            .as_ref()
            .map(|events| events.scoped(correlation_id.clone()));
        if let Some(events) = session_events.as_ref() {
            let _ = events.emit(
                "graph_enqueued",
                to_payload(&json!({
                    "correlation_id": correlation_id,
                    "client_id": client_id,
                    "variant": variant.as_str(),
                    "template_revision": roles.revision,
                    "seed": injected.seed,
                    "output_node_id": injected.output_node_id,
                    "queue_number": receipt.number,
                    "node_errors": receipt.node_errors,
                    "fingerprint": injected.graph.fingerprint(),
                })),
            );
        }

        let mut session = GenerationSession::new(GenerationRequest {
            correlation_id: correlation_id.clone(),
            client_id: client_id.clone(),
            graph: injected.graph,
            variant,
            seed: injected.seed,
            output_node_id: injected.output_node_id,
        });
        let mut tee = TeeObserver {
            primary: observer,
            log: session_events.map(EventLogObserver::new),
        };
        dispatch(&mut tee, session.connected());
        let deadline = self.deadline.map(|limit| Instant::now() + limit);
        let outcome = drive_session(
            &mut session,
            stream.as_mut(),
            &mut tee,
            &job.cancel,
            deadline,
        );

        match outcome {
            SessionOutcome::Completed { artifacts } => Ok(GeneratedImages {
                correlation_id,
                client_id,
                variant,
                seed: injected.seed,
                artifacts,
            }),
            SessionOutcome::Failed {
                node_id: None,
                message,
            } if message.starts_with(CONNECTION_ERROR_PREFIX) => {
                Err(GenerationError::Stream { message })
            }
            SessionOutcome::Failed { node_id, message } => {
                Err(GenerationError::Execution { node_id, message })
            }
            SessionOutcome::Interrupted => Err(GenerationError::Interrupted),
            SessionOutcome::Disconnected { message } => {
                Err(GenerationError::Disconnected { message })
            }
        }
    }

    fn stage_conditioning(
        &self,
        source: &ConditioningSource,
        client_id: &str,
    ) -> Result<ArtifactReference, GenerationError> {
        let (bytes, filename) = match source {
            ConditioningSource::Reference(reference) if reference.kind == ArtifactKind::Input => {
                return Ok(reference.clone());
            }
            ConditioningSource::Reference(reference) => {
                let bytes = self.api.fetch_artifact_bytes(reference)?;
                let extension = reference
                    .filename
                    .rsplit_once('.')
                    .map(|(_, ext)| ext)
                    .unwrap_or("png");
                (bytes, format!("conditioning_{}.{extension}", uuid::Uuid::new_v4().simple()))
            }
            ConditioningSource::Upload { bytes, filename } => (bytes.clone(), filename.clone()),
        };

        let uploaded = self.api.upload_conditioning_image(ImageUpload {
            bytes,
            filename,
            overwrite: true,
            subfolder: None,
            kind: ArtifactKind::Input,
        })?;
        let reference = uploaded.as_reference();
        if let Some(events) = self.events.as_ref() {
            let _ = events.scoped(client_id).emit(
                "conditioning_uploaded",
                to_payload(&json!({
                    "client_id": client_id,
                    "reference": reference,
                })),
            );
        }
        Ok(reference)
    }
}
