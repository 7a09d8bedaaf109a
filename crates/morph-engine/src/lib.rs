pub mod client;
pub mod config;
pub mod error;
pub mod injector;
pub mod orchestrator;
pub mod session;
pub mod stream;
pub mod templates;

pub use client::{
    EngineApi, EnqueueReceipt, ImageUpload, QueueStatus, SubmissionClient, UploadedImage,
};
pub use config::EngineConfig;
pub use error::{ErrorCategory, GenerationError};
pub use injector::{
    Anatomy, CharacterAttributes, InjectedGraph, InjectionInput, PromptContext, PromptInjector,
};
pub use orchestrator::{
    CharacterRequest, ConditioningSource, GeneratedImages, GenerationJob, Orchestrator,
};
pub use session::{
    drive_session, CancelToken, EventLogObserver, GenerationRequest, GenerationSession,
    NullObserver, SessionObserver, SessionUpdate,
};
pub use stream::{EventStream, StreamConnector, StreamFrame, WsConnector};
pub use templates::{BuiltinTemplates, DirectoryTemplates, TemplateResolver, TemplateStore};
