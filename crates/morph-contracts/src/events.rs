use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// Append-only writer for `events.jsonl`.
///
/// - default fields are `type`, `session_id`, `ts`
/// - caller payload is merged last and can override defaults
/// - one compact JSON object per line
///
/// Writers scoped to different sessions share the same file and lock, so
/// concurrent sessions never interleave partial lines.
#[derive(Debug, Clone)]
pub struct EventWriter {
    sink: Arc<EventSink>,
    session_id: Option<String>,
}

#[derive(Debug)]
struct EventSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            sink: Arc::new(EventSink {
                path: path.into(),
                lock: Mutex::new(()),
            }),
            session_id: None,
        }
    }

    /// Returns a writer that stamps every event with `session_id`.
    pub fn scoped(&self, session_id: impl Into<String>) -> Self {
        Self {
            sink: Arc::clone(&self.sink),
            session_id: Some(session_id.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.sink.path
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(event_type.to_string()));
        event.insert(
            "session_id".to_string(),
            self.session_id
                .as_ref()
                .map(|id| Value::String(id.clone()))
                .unwrap_or(Value::Null),
        );
        event.insert("ts".to_string(), Value::String(now_utc_iso()));
        for (key, value) in payload {
            event.insert(key, value);
        }

        if let Some(parent) = self.sink.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(&event)?;
        let _guard = self
            .sink
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event writer lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.sink.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(event))
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
