//! HTTP side of the engine: enqueue a graph, upload a conditioning image,
//! fetch a rendered artifact. Nothing here retries.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use morph_contracts::artifacts::{ArtifactKind, ArtifactReference};
use morph_contracts::graph::GraphDocument;
use reqwest::blocking::multipart::{Form as MultipartForm, Part as MultipartPart};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Value};

use crate::config::normalize_base_url;
use crate::error::{truncate_text, GenerationError};

const ERROR_BODY_MAX_CHARS: usize = 512;

#[derive(Debug, Clone, PartialEq)]
pub struct EnqueueReceipt {
    pub correlation_id: String,
    pub number: Option<u64>,
    /// Validation notes the engine attached while still accepting the graph.
    pub node_errors: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageUpload {
    pub bytes: Vec<u8>,
    pub filename: String,
    pub overwrite: bool,
    pub subfolder: Option<String>,
    pub kind: ArtifactKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedImage {
    pub stored_filename: String,
    pub subfolder: Option<String>,
    pub kind: Option<ArtifactKind>,
}

impl UploadedImage {
    pub fn as_reference(&self) -> ArtifactReference {
        ArtifactReference::new(
            self.stored_filename.clone(),
            self.subfolder.clone().unwrap_or_default(),
            self.kind.unwrap_or(ArtifactKind::Input),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStatus {
    pub running: usize,
    pub pending: usize,
}

/// Engine operations the orchestrator depends on.
pub trait EngineApi: Send + Sync {
    fn enqueue(&self, graph: &GraphDocument, client_id: &str)
        -> Result<EnqueueReceipt, GenerationError>;
    fn upload_conditioning_image(&self, upload: ImageUpload)
        -> Result<UploadedImage, GenerationError>;
    fn fetch_artifact_bytes(&self, reference: &ArtifactReference)
        -> Result<Vec<u8>, GenerationError>;
    fn artifact_url(&self, reference: &ArtifactReference) -> String;
}

#[derive(Debug, Clone)]
pub struct SubmissionClient {
    base_url: String,
    http: HttpClient,
}

impl SubmissionClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: normalize_base_url(base_url),
            http: HttpClient::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// `GET /queue`; used as a connectivity probe.
    pub fn queue_status(&self) -> Result<QueueStatus, GenerationError> {
        let endpoint = self.endpoint("queue");
        let response = self
            .http
            .get(&endpoint)
            .send()
            .map_err(|err| GenerationError::http(format!("queue probe failed ({endpoint})"), err))?;
        let (status, body) = read_body("queue probe", response)?;
        if !(200..300).contains(&status) {
            return Err(GenerationError::MalformedResponse {
                context: "queue probe".to_string(),
                message: format!("status {status}: {}", truncate_text(&body, ERROR_BODY_MAX_CHARS)),
            });
        }
        parse_queue_response(&parse_json("queue probe", &body)?)
    }

    pub fn fetch_artifact_data_url(
        &self,
        reference: &ArtifactReference,
    ) -> Result<String, GenerationError> {
        let bytes = self.fetch_artifact_bytes(reference)?;
        Ok(data_url(&bytes, &reference.filename))
    }
}

impl EngineApi for SubmissionClient {
    fn enqueue(
        &self,
        graph: &GraphDocument,
        client_id: &str,
    ) -> Result<EnqueueReceipt, GenerationError> {
        let endpoint = self.endpoint("prompt");
        let payload = json!({
            "prompt": graph,
            "client_id": client_id,
        });
        let response = self
            .http
            .post(&endpoint)
            .json(&payload)
            .send()
            .map_err(|err| GenerationError::http(format!("enqueue request failed ({endpoint})"), err))?;
        let (status, body) = read_body("enqueue", response)?;
        if !(200..300).contains(&status) {
            return Err(GenerationError::EngineRejected {
                status,
                body: truncate_text(&body, ERROR_BODY_MAX_CHARS),
            });
        }
        parse_enqueue_response(&parse_json("enqueue", &body)?)
    }

    fn upload_conditioning_image(
        &self,
        upload: ImageUpload,
    ) -> Result<UploadedImage, GenerationError> {
        let endpoint = self.endpoint("upload/image");
        let mime = mime_for_filename(&upload.filename);
        let part = MultipartPart::bytes(upload.bytes)
            .file_name(upload.filename.clone())
            .mime_str(mime)
            .map_err(|err| GenerationError::http("invalid upload content type", err))?;
        let mut form = MultipartForm::new()
            .part("image", part)
            .text("overwrite", if upload.overwrite { "true" } else { "false" })
            .text("type", upload.kind.as_str());
        if let Some(subfolder) = upload.subfolder.filter(|value| !value.trim().is_empty()) {
            form = form.text("subfolder", subfolder);
        }
        let response = self
            .http
            .post(&endpoint)
            .multipart(form)
            .send()
            .map_err(|err| GenerationError::http(format!("upload request failed ({endpoint})"), err))?;
        let (status, body) = read_body("upload", response)?;
        if !(200..300).contains(&status) {
            return Err(GenerationError::UploadFailed {
                status,
                body: truncate_text(&body, ERROR_BODY_MAX_CHARS),
            });
        }
        parse_upload_response(&parse_json("upload", &body)?)
    }

    fn fetch_artifact_bytes(
        &self,
        reference: &ArtifactReference,
    ) -> Result<Vec<u8>, GenerationError> {
        let url = self.artifact_url(reference);
        let response = self
            .http
            .get(&url)
            .send()
            .map_err(|err| GenerationError::http(format!("artifact fetch failed ({url})"), err))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(GenerationError::FetchFailed {
                status: status.as_u16(),
                body: truncate_text(&body, ERROR_BODY_MAX_CHARS),
            });
        }
        let bytes = response
            .bytes()
            .map_err(|err| GenerationError::http("failed reading artifact bytes", err))?;
        Ok(bytes.to_vec())
    }

    fn artifact_url(&self, reference: &ArtifactReference) -> String {
        view_url(&self.base_url, reference)
    }
}

/// `GET /view` locator for an artifact. Pure string construction.
pub fn view_url(base_url: &str, reference: &ArtifactReference) -> String {
    let raw = format!("{}/view", normalize_base_url(base_url));
    match reqwest::Url::parse(&raw) {
        Ok(mut url) => {
            url.query_pairs_mut()
                .append_pair("filename", &reference.filename)
                .append_pair("subfolder", &reference.subfolder)
                .append_pair("type", reference.kind.as_str());
            url.to_string()
        }
        Err(_) => format!(
            "{raw}?filename={}&subfolder={}&type={}",
            reference.filename,
            reference.subfolder,
            reference.kind.as_str()
        ),
    }
}

pub fn parse_enqueue_response(payload: &Value) -> Result<EnqueueReceipt, GenerationError> {
    let correlation_id = payload
        .get("prompt_id")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| GenerationError::MalformedResponse {
            context: "enqueue".to_string(),
            message: "response has no prompt_id".to_string(),
        })?;
    Ok(EnqueueReceipt {
        correlation_id: correlation_id.to_string(),
        number: payload.get("number").and_then(Value::as_u64),
        node_errors: payload.get("node_errors").cloned().unwrap_or(Value::Null),
    })
}

pub fn parse_upload_response(payload: &Value) -> Result<UploadedImage, GenerationError> {
    let stored_filename = payload
        .get("name")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| GenerationError::MalformedResponse {
            context: "upload".to_string(),
            message: "response has no name".to_string(),
        })?;
    Ok(UploadedImage {
        stored_filename: stored_filename.to_string(),
        subfolder: payload
            .get("subfolder")
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())
            .map(str::to_string),
        kind: payload
            .get("type")
            .and_then(Value::as_str)
            .and_then(ArtifactKind::parse),
    })
}

pub fn parse_queue_response(payload: &Value) -> Result<QueueStatus, GenerationError> {
    let count = |key: &str| payload.get(key).and_then(Value::as_array).map(Vec::len);
    match (count("queue_running"), count("queue_pending")) {
        (Some(running), Some(pending)) => Ok(QueueStatus { running, pending }),
        _ => Err(GenerationError::MalformedResponse {
            context: "queue probe".to_string(),
            message: "response is missing queue_running/queue_pending".to_string(),
        }),
    }
}

pub fn data_url(bytes: &[u8], filename: &str) -> String {
    format!(
        "data:{};base64,{}",
        mime_for_filename(filename),
        BASE64.encode(bytes)
    )
}

fn mime_for_filename(filename: &str) -> &'static str {
    let ext = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        _ => "image/png",
    }
}

fn read_body(context: &str, response: HttpResponse) -> Result<(u16, String), GenerationError> {
    let status = response.status().as_u16();
    let body = response
        .text()
        .map_err(|err| GenerationError::http(format!("{context} response body read failed"), err))?;
    Ok((status, body))
}

fn parse_json(context: &str, body: &str) -> Result<Value, GenerationError> {
    serde_json::from_str(body).map_err(|err| GenerationError::MalformedResponse {
        context: context.to_string(),
        message: format!("invalid JSON payload: {err}"),
    })
}
