use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_ENGINE_URL: &str = "http://127.0.0.1:8188";
const STREAM_POLL_MS_DEFAULT: u64 = 250;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// HTTP base of the engine, without a trailing slash.
    pub base_url: String,
    /// Directory of `<name>.json` templates; built-ins are used when unset.
    pub template_dir: Option<PathBuf>,
    /// Calling-layer deadline after which a session is cancelled.
    pub session_deadline: Option<Duration>,
    /// Socket read timeout used to poll for cancellation between frames.
    pub stream_poll: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_ENGINE_URL.to_string(),
            template_dir: None,
            session_deadline: None,
            stream_poll: Duration::from_millis(STREAM_POLL_MS_DEFAULT),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let mut config = Self::default();
        if let Some(url) = non_empty("MORPH_ENGINE_URL") {
            config.base_url = normalize_base_url(&url);
        }
        config.template_dir = non_empty("MORPH_TEMPLATE_DIR").map(PathBuf::from);
        config.session_deadline = non_empty("MORPH_SESSION_DEADLINE_SECS")
            .and_then(|raw| raw.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);
        if let Some(ms) = non_empty("MORPH_STREAM_POLL_MS").and_then(|raw| raw.parse::<u64>().ok()) {
            config.stream_poll = Duration::from_millis(ms.clamp(50, 5000));
        }
        config
    }

    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = normalize_base_url(url);
        self
    }
}

pub fn normalize_base_url(raw: &str) -> String {
    raw.trim().trim_end_matches('/').to_string()
}

/// Event-stream URL for `client_id`: `http→ws`, `https→wss`, path `/ws`.
pub fn stream_url(base_url: &str, client_id: &str) -> String {
    if let Ok(mut url) = reqwest::Url::parse(base_url) {
        let scheme = match url.scheme() {
            "https" => "wss".to_string(),
            "http" => "ws".to_string(),
            other => other.to_string(),
        };
        let _ = url.set_scheme(&scheme);
        let path = format!("{}/ws", url.path().trim_end_matches('/'));
        url.set_path(&path);
        url.query_pairs_mut().clear().append_pair("clientId", client_id);
        return url.to_string();
    }
    format!(
        "ws://{}/ws?clientId={client_id}",
        base_url
            .trim_start_matches("http://")
            .trim_start_matches("https://")
            .trim_end_matches('/')
    )
}
