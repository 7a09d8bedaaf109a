use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use morph_contracts::graph::GraphDocument;

use crate::error::GenerationError;

const FACE_TEMPLATE_JSON: &str = include_str!("../resources/workflows/face.json");
const BODY_FROM_FACE_TEMPLATE_JSON: &str = include_str!("../resources/workflows/body_from_face.json");
const BODY_WITH_DETAILER_TEMPLATE_JSON: &str =
    include_str!("../resources/workflows/body_with_detailer.json");

/// Source of raw template documents, keyed by name.
pub trait TemplateStore: Send + Sync {
    /// `Ok(None)` when no template has that name.
    fn load(&self, name: &str) -> Result<Option<String>, GenerationError>;
    fn names(&self) -> Vec<String>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinTemplates;

impl TemplateStore for BuiltinTemplates {
    fn load(&self, name: &str) -> Result<Option<String>, GenerationError> {
        let raw = match name {
            "face" => FACE_TEMPLATE_JSON,
            "body_from_face" => BODY_FROM_FACE_TEMPLATE_JSON,
            "body_with_detailer" => BODY_WITH_DETAILER_TEMPLATE_JSON,
            _ => return Ok(None),
        };
        Ok(Some(raw.to_string()))
    }

    fn names(&self) -> Vec<String> {
        vec![
            "body_from_face".to_string(),
            "body_with_detailer".to_string(),
            "face".to_string(),
        ]
    }
}

/// Reads `<dir>/<name>.json` on every call.
#[derive(Debug, Clone)]
pub struct DirectoryTemplates {
    dir: PathBuf,
}

impl DirectoryTemplates {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl TemplateStore for DirectoryTemplates {
    fn load(&self, name: &str) -> Result<Option<String>, GenerationError> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Ok(None);
        }
        let path = self.dir.join(format!("{name}.json"));
        match fs::read_to_string(&path) {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(GenerationError::TemplateParse {
                name: name.to_string(),
                message: format!("failed reading {}: {err}", path.display()),
            }),
        }
    }

    fn names(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut names = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some("json"))
            .filter_map(|path| path.file_stem().and_then(|stem| stem.to_str()).map(str::to_string))
            .collect::<Vec<String>>();
        names.sort();
        names
    }
}

pub struct TemplateResolver {
    store: Box<dyn TemplateStore>,
}

impl TemplateResolver {
    pub fn new<S: TemplateStore + 'static>(store: S) -> Self {
        Self {
            store: Box::new(store),
        }
    }

    pub fn builtin() -> Self {
        Self::new(BuiltinTemplates)
    }

    pub fn names(&self) -> Vec<String> {
        self.store.names()
    }

    /// Loads and validates `name`. Each call parses a fresh document, so the
    /// caller owns it outright.
    pub fn resolve(&self, name: &str) -> Result<GraphDocument, GenerationError> {
        let raw = self
            .store
            .load(name)?
            .ok_or_else(|| GenerationError::TemplateNotFound {
                name: name.to_string(),
            })?;
        let graph = GraphDocument::from_json_str(&raw).map_err(|err| {
            GenerationError::TemplateParse {
                name: name.to_string(),
                message: err.to_string(),
            }
        })?;
        if graph.is_empty() {
            return Err(GenerationError::TemplateParse {
                name: name.to_string(),
                message: "graph has no nodes".to_string(),
            });
        }
        if let Some(dangling) = graph.dangling_references().first() {
            return Err(GenerationError::TemplateParse {
                name: name.to_string(),
                message: format!(
                    "input '{}' on node '{}' references missing node '{}'",
                    dangling.input, dangling.node_id, dangling.target
                ),
            });
        }
        Ok(graph)
    }
}
