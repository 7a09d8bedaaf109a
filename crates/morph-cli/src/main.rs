use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use morph_contracts::artifacts::{ArtifactKind, ArtifactReference, GeneratedArtifact};
use morph_contracts::events::EventWriter;
use morph_contracts::protocol::ProtocolAnomaly;
use morph_contracts::session::{ProgressState, SessionOutcome};
use morph_contracts::workflow::WorkflowVariant;
use morph_engine::{
    Anatomy, CharacterAttributes, CharacterRequest, ConditioningSource, EngineApi, EngineConfig,
    GeneratedImages, Orchestrator, PromptContext, SessionObserver, SubmissionClient,
    TemplateResolver,
};
use serde_json::{json, Value};

#[derive(Debug, Parser)]
#[command(
    name = "morph-rs",
    version,
    about = "Character image generation against a node-graph engine"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Face(FaceArgs),
    Body(BodyArgs),
    Probe(ProbeArgs),
    Templates(TemplatesArgs),
}

#[derive(Debug, Parser)]
struct EngineArgs {
    #[arg(long)]
    engine_url: Option<String>,
    #[arg(long)]
    template_dir: Option<PathBuf>,
    #[arg(long)]
    deadline_secs: Option<u64>,
}

#[derive(Debug, Parser)]
struct CharacterArgs {
    #[arg(long, default_value = "female")]
    anatomy: String,
    /// 0 = masculine, 100 = feminine.
    #[arg(long, default_value_t = 50)]
    expression: u8,
    #[arg(long, default_value = "")]
    ethnicity: String,
    #[arg(long, default_value = "")]
    hair: String,
    #[arg(long, default_value = "")]
    eyes: String,
    #[arg(long)]
    body_type: Option<String>,
    /// Ranked prompt tag, highest priority first. Repeatable.
    #[arg(long = "tag")]
    tags: Vec<String>,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long)]
    character_id: Option<String>,
}

#[derive(Debug, Parser)]
struct FaceArgs {
    #[command(flatten)]
    character: CharacterArgs,
    #[command(flatten)]
    engine: EngineArgs,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct BodyArgs {
    #[command(flatten)]
    character: CharacterArgs,
    #[command(flatten)]
    engine: EngineArgs,
    /// Local face image to upload as the conditioning input.
    #[arg(long, conflicts_with = "face_ref")]
    face: Option<PathBuf>,
    /// Face image already on the engine, as `subfolder/filename`.
    #[arg(long)]
    face_ref: Option<String>,
    #[arg(long, default_value = "output")]
    face_kind: String,
    #[arg(long)]
    detailer: bool,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct ProbeArgs {
    #[arg(long)]
    engine_url: Option<String>,
}

#[derive(Debug, Parser)]
struct TemplatesArgs {
    #[arg(long)]
    template_dir: Option<PathBuf>,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("morph-rs error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Face(args) => run_face(args),
        Command::Body(args) => run_body(args),
        Command::Probe(args) => run_probe(args),
        Command::Templates(args) => run_templates(args),
    }
}

fn run_face(args: FaceArgs) -> Result<i32> {
    let request = build_request(&args.character)?;
    let orchestrator = build_orchestrator(&args.engine, &args.out, args.events.as_deref())?;
    let mut observer = CliObserver::default();
    let images = orchestrator
        .generate_face(request, &mut observer)
        .context("face generation failed")?;
    report(orchestrator.api(), &images, &args.out)
}

fn run_body(args: BodyArgs) -> Result<i32> {
    let request = build_request(&args.character)?;
    let face = match (args.face.as_ref(), args.face_ref.as_deref()) {
        (Some(path), _) => {
            let bytes = fs::read(path)
                .with_context(|| format!("failed to read face image {}", path.display()))?;
            let filename = path
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or("face.png")
                .to_string();
            ConditioningSource::Upload { bytes, filename }
        }
        (None, Some(raw)) => ConditioningSource::Reference(parse_face_ref(raw, &args.face_kind)?),
        (None, None) => bail!("body generation needs --face or --face-ref"),
    };
    let orchestrator = build_orchestrator(&args.engine, &args.out, args.events.as_deref())?;
    let mut observer = CliObserver::default();
    let images = if args.detailer {
        orchestrator.generate_body_with_detailer(request, face, &mut observer)
    } else {
        orchestrator.generate_body_from_face(request, face, &mut observer)
    }
    .context("body generation failed")?;
    report(orchestrator.api(), &images, &args.out)
}

fn run_probe(args: ProbeArgs) -> Result<i32> {
    let mut config = EngineConfig::from_env();
    if let Some(url) = args.engine_url.as_deref() {
        config = config.with_base_url(url);
    }
    let client = SubmissionClient::new(&config.base_url);
    match client.queue_status() {
        Ok(status) => {
            println!(
                "{}",
                json!({
                    "engine_url": client.base_url(),
                    "reachable": true,
                    "running": status.running,
                    "pending": status.pending,
                })
            );
            Ok(0)
        }
        Err(err) => {
            println!(
                "{}",
                json!({
                    "engine_url": client.base_url(),
                    "reachable": false,
                    "error": err.to_string(),
                })
            );
            Ok(2)
        }
    }
}

fn run_templates(args: TemplatesArgs) -> Result<i32> {
    let mut config = EngineConfig::from_env();
    if args.template_dir.is_some() {
        config.template_dir = args.template_dir;
    }
    let orchestrator = Orchestrator::from_config(&config);
    let templates = orchestrator.templates();
    for variant in WorkflowVariant::ALL {
        println!("{}", describe_template(templates, variant));
    }
    Ok(0)
}

fn describe_template(templates: &TemplateResolver, variant: WorkflowVariant) -> Value {
    let roles = variant.roles();
    match templates.resolve(roles.template) {
        Ok(graph) => match roles.first_missing(&graph) {
            None => json!({
                "variant": variant.as_str(),
                "template": roles.template,
                "revision": roles.revision,
                "nodes": graph.len(),
                "output_node_id": roles.output,
                "fingerprint": graph.fingerprint(),
                "ok": true,
            }),
            Some((role, node_id)) => json!({
                "variant": variant.as_str(),
                "template": roles.template,
                "ok": false,
                "error": format!("missing {role} node '{node_id}'"),
            }),
        },
        Err(err) => json!({
            "variant": variant.as_str(),
            "template": roles.template,
            "ok": false,
            "error": err.to_string(),
        }),
    }
}

fn build_orchestrator(
    args: &EngineArgs,
    out: &Path,
    events: Option<&Path>,
) -> Result<Orchestrator> {
    fs::create_dir_all(out)
        .with_context(|| format!("failed to create output dir {}", out.display()))?;
    let mut config = EngineConfig::from_env();
    if let Some(url) = args.engine_url.as_deref() {
        config = config.with_base_url(url);
    }
    if let Some(dir) = args.template_dir.clone() {
        config.template_dir = Some(dir);
    }
    if let Some(secs) = args.deadline_secs.filter(|secs| *secs > 0) {
        config.session_deadline = Some(Duration::from_secs(secs));
    }
    let events_path = events
        .map(Path::to_path_buf)
        .unwrap_or_else(|| out.join("events.jsonl"));
    Ok(Orchestrator::from_config(&config).with_event_log(EventWriter::new(events_path)))
}

fn build_request(args: &CharacterArgs) -> Result<CharacterRequest> {
    let Some(anatomy) = Anatomy::parse(&args.anatomy) else {
        bail!("unknown anatomy '{}' (expected male, female or other)", args.anatomy);
    };
    if args.expression > 100 {
        bail!("--expression must be between 0 and 100");
    }
    let mut request = CharacterRequest::new(CharacterAttributes {
        anatomy,
        gender_expression: args.expression,
        ethnicity: args.ethnicity.clone(),
        hair_color: args.hair.clone(),
        eye_color: args.eyes.clone(),
        body_type: args.body_type.clone(),
    });
    request.ranked_tags = args
        .tags
        .iter()
        .map(|tag| tag.trim().to_string())
        .filter(|tag| !tag.is_empty())
        .collect();
    request.seed = args.seed;
    request.character_id = args
        .character_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string);
    request.context = PromptContext::CharacterCreation;
    Ok(request)
}

fn parse_face_ref(raw: &str, kind: &str) -> Result<ArtifactReference> {
    let raw = raw.trim().trim_matches('/');
    if raw.is_empty() {
        bail!("--face-ref is empty");
    }
    let Some(kind) = ArtifactKind::parse(kind) else {
        bail!("unknown artifact kind '{kind}' (expected output, temp or input)");
    };
    let (subfolder, filename) = raw.rsplit_once('/').unwrap_or(("", raw));
    Ok(ArtifactReference::new(filename, subfolder, kind))
}

/// Downloads every artifact into `out` and prints one summary line.
fn report(api: &dyn EngineApi, images: &GeneratedImages, out: &Path) -> Result<i32> {
    let saved = persist_artifacts(api, &images.artifacts, out)?;
    println!(
        "{}",
        json!({
            "correlation_id": images.correlation_id,
            "client_id": images.client_id,
            "variant": images.variant.as_str(),
            "seed": images.seed,
            "artifacts": saved,
        })
    );
    Ok(0)
}

fn persist_artifacts(
    api: &dyn EngineApi,
    artifacts: &[GeneratedArtifact],
    out: &Path,
) -> Result<Vec<Value>> {
    let mut saved = Vec::with_capacity(artifacts.len());
    for artifact in artifacts {
        let bytes = api
            .fetch_artifact_bytes(&artifact.reference)
            .with_context(|| format!("failed to fetch {}", artifact.reference.relative_path()))?;
        let path = out.join(format!("{}.{}", artifact.persist_stem(), artifact.extension()));
        fs::write(&path, &bytes)
            .with_context(|| format!("failed to write {}", path.display()))?;
        let (width, height) = image::ImageReader::new(Cursor::new(&bytes))
            .with_guessed_format()?
            .into_dimensions()
            .with_context(|| format!("{} is not a readable image", path.display()))?;
        saved.push(json!({
            "path": path.to_string_lossy(),
            "url": api.artifact_url(&artifact.reference),
            "width": width,
            "height": height,
        }));
    }
    Ok(saved)
}

/// Human progress on stderr. The orchestrator writes the event log itself.
#[derive(Default)]
struct CliObserver {
    last_line: Option<String>,
}

impl CliObserver {
    fn print(&mut self, line: String) {
        if self.last_line.as_deref() == Some(line.as_str()) {
            return;
        }
        eprintln!("{line}");
        self.last_line = Some(line);
    }
}

impl SessionObserver for CliObserver {
    fn on_progress(&mut self, progress: &ProgressState) {
        self.print(progress_line(progress));
    }

    fn on_preview(&mut self, artifacts: &[GeneratedArtifact]) {
        let names = artifacts
            .iter()
            .map(|artifact| artifact.reference.relative_path())
            .collect::<Vec<String>>();
        self.print(format!("preview: {}", names.join(", ")));
    }

    fn on_anomaly(&mut self, anomaly: &ProtocolAnomaly) {
        self.print(format!("ignored frame: {anomaly}"));
    }

    fn on_outcome(&mut self, outcome: &SessionOutcome) {
        self.print(format!("finished: {}", outcome.state().as_str()));
    }
}

fn progress_line(progress: &ProgressState) -> String {
    match progress.fraction() {
        Some(fraction) => format!("[{:>3.0}%] {}", fraction * 100.0, progress.message),
        _ => progress.message.clone(),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use image::{ImageFormat, RgbaImage};
    use morph_contracts::artifacts::{ArtifactKind, ArtifactReference, GeneratedArtifact};
    use morph_contracts::session::ProgressState;
    use morph_engine::{EngineApi, EnqueueReceipt, GenerationError, ImageUpload, UploadedImage};

    use super::{build_request, parse_face_ref, persist_artifacts, progress_line, CharacterArgs};

    struct PngApi;

    impl EngineApi for PngApi {
        fn enqueue(
            &self,
            _graph: &morph_contracts::graph::GraphDocument,
            _client_id: &str,
        ) -> Result<EnqueueReceipt, GenerationError> {
            Err(GenerationError::Interrupted)
        }

        fn upload_conditioning_image(
            &self,
            _upload: ImageUpload,
        ) -> Result<UploadedImage, GenerationError> {
            Err(GenerationError::Interrupted)
        }

        fn fetch_artifact_bytes(
            &self,
            _reference: &ArtifactReference,
        ) -> Result<Vec<u8>, GenerationError> {
            let mut bytes = Cursor::new(Vec::new());
            RgbaImage::new(3, 2)
                .write_to(&mut bytes, ImageFormat::Png)
                .map_err(|err| GenerationError::Stream {
                    message: err.to_string(),
                })?;
            Ok(bytes.into_inner())
        }

        fn artifact_url(&self, reference: &ArtifactReference) -> String {
            format!("http://engine.test/view?filename={}", reference.filename)
        }
    }

    fn character_args() -> CharacterArgs {
        CharacterArgs {
            anatomy: "F".to_string(),
            expression: 90,
            ethnicity: "latina".to_string(),
            hair: "black".to_string(),
            eyes: "brown".to_string(),
            body_type: None,
            tags: vec![" freckles ".to_string(), "  ".to_string()],
            seed: Some(9),
            character_id: Some(" c1 ".to_string()),
        }
    }

    #[test]
    fn builds_request_from_flags() -> anyhow::Result<()> {
        let request = build_request(&character_args())?;
        assert_eq!(request.ranked_tags, vec!["freckles".to_string()]);
        assert_eq!(request.character_id.as_deref(), Some("c1"));
        assert_eq!(request.seed, Some(9));
        Ok(())
    }

    #[test]
    fn rejects_unknown_anatomy() {
        let mut args = character_args();
        args.anatomy = "robot".to_string();
        assert!(build_request(&args).is_err());
    }

    #[test]
    fn parses_face_reference() -> anyhow::Result<()> {
        let reference = parse_face_ref("characters/c1/face/c1_face_9.png", "output")?;
        assert_eq!(reference.subfolder, "characters/c1/face");
        assert_eq!(reference.filename, "c1_face_9.png");
        assert_eq!(reference.kind, ArtifactKind::Output);

        let bare = parse_face_ref("face.png", "input")?;
        assert_eq!(bare.subfolder, "");
        assert!(parse_face_ref("face.png", "gallery").is_err());
        Ok(())
    }

    #[test]
    fn persists_artifacts_with_dimensions() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let artifact = GeneratedArtifact {
            reference: ArtifactReference::new("ComfyUI_001.png", "", ArtifactKind::Output),
            correlation_id: "abc".to_string(),
            node_id: "9".to_string(),
            seed: 12345,
        };

        let saved = persist_artifacts(&PngApi, &[artifact], temp.path())?;

        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0]["width"], 3);
        assert_eq!(saved[0]["height"], 2);
        assert!(temp.path().join("abc_12345_ComfyUI_001.png").exists());
        Ok(())
    }

    #[test]
    fn progress_line_shows_percentage_while_sampling() {
        let mut progress = ProgressState::new("abc");
        assert_eq!(progress_line(&progress), "waiting for engine");
        progress.step = 5;
        progress.max_steps = 20;
        progress.message = "step 5/20".to_string();
        assert_eq!(progress_line(&progress), "[ 25%] step 5/20");
    }
}
