use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Engine storage folder an artifact lives in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    #[default]
    Output,
    Temp,
    Input,
}

impl ArtifactKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Output => "output",
            Self::Temp => "temp",
            Self::Input => "input",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "output" => Some(Self::Output),
            "temp" => Some(Self::Temp),
            "input" => Some(Self::Input),
            _ => None,
        }
    }
}

/// A file reported by the engine, retrievable through `/view`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactReference {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default)]
    pub kind: ArtifactKind,
}

impl ArtifactReference {
    pub fn new(filename: impl Into<String>, subfolder: impl Into<String>, kind: ArtifactKind) -> Self {
        Self {
            filename: filename.into(),
            subfolder: subfolder.into(),
            kind,
        }
    }

    /// `subfolder/filename`, or just the filename when there is no subfolder.
    pub fn relative_path(&self) -> String {
        let subfolder = self.subfolder.trim_matches('/');
        if subfolder.is_empty() {
            self.filename.clone()
        } else {
            format!("{subfolder}/{}", self.filename)
        }
    }

    /// Reads the `images` list of an `executed` output payload. Entries that
    /// are not objects or have no filename are skipped.
    pub fn list_from_output(output: &Value) -> Vec<Self> {
        let Some(rows) = output.get("images").and_then(Value::as_array) else {
            return Vec::new();
        };
        rows.iter()
            .filter_map(|row| {
                let filename = row
                    .get("filename")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|value| !value.is_empty())?;
                let subfolder = row.get("subfolder").and_then(Value::as_str).unwrap_or("");
                let kind = row
                    .get("type")
                    .and_then(Value::as_str)
                    .and_then(ArtifactKind::parse)
                    .unwrap_or_default();
                Some(Self::new(filename, subfolder, kind))
            })
            .collect()
    }
}

/// An artifact tied back to the submission and seed that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedArtifact {
    pub reference: ArtifactReference,
    pub correlation_id: String,
    pub node_id: String,
    pub seed: u64,
}

impl GeneratedArtifact {
    /// Stable stem for persisted copies: `(correlationId, seed)` plus the
    /// position-bearing engine filename.
    pub fn persist_stem(&self) -> String {
        let stem = self
            .reference
            .filename
            .rsplit_once('.')
            .map(|(stem, _)| stem)
            .unwrap_or(&self.reference.filename);
        format!("{}_{}_{}", self.correlation_id, self.seed, stem)
    }

    pub fn extension(&self) -> &str {
        self.reference
            .filename
            .rsplit_once('.')
            .map(|(_, ext)| ext)
            .unwrap_or("png")
    }
}
