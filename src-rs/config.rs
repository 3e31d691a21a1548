use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::error::PipelineError;

pub const DEFAULT_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_MAX_EDGE: u32 = 1024;
pub const DEFAULT_JPEG_QUALITY: u8 = 80;

const API_KEY_VARS: [&str; 2] = ["GEMINI_API_KEY", "API_KEY"];

/// How picked photos are downsampled and re-encoded before upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizeSettings {
    /// Cap for the longer edge, in pixels. Smaller images are never upscaled.
    pub max_edge: u32,
    pub jpeg_quality: u8,
}

impl Default for NormalizeSettings {
    fn default() -> Self {
        Self {
            max_edge: DEFAULT_MAX_EDGE,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

impl NormalizeSettings {
    pub fn new(max_edge: u32, jpeg_quality: u8) -> Self {
        Self {
            max_edge: max_edge.max(1),
            jpeg_quality: jpeg_quality.clamp(1, 100),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSettings {
    pub endpoint: String,
    pub model: String,
    pub timeout: Duration,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub api_key: Option<String>,
    pub backend: BackendSettings,
    pub normalize: NormalizeSettings,
}

impl Config {
    pub fn from_env() -> Self {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!(path = %path.display(), "loaded .env");
        }
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Resolve configuration from an arbitrary key lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let api_key = API_KEY_VARS.iter().find_map(|key| get(*key));

        let mut backend = BackendSettings::default();
        if let Some(endpoint) = get("LABEL_SCAN_ENDPOINT") {
            backend.endpoint = endpoint.trim_end_matches('/').to_string();
        }
        if let Some(model) = get("LABEL_SCAN_MODEL") {
            backend.model = model;
        }
        let timeout = get("LABEL_SCAN_TIMEOUT_SECS");
        if let Some(secs) = parse_var::<u64>("LABEL_SCAN_TIMEOUT_SECS", timeout) {
            backend.timeout = Duration::from_secs(secs.max(1));
        }

        let defaults = NormalizeSettings::default();
        let normalize = NormalizeSettings::new(
            parse_var("LABEL_SCAN_MAX_EDGE", get("LABEL_SCAN_MAX_EDGE")).unwrap_or(defaults.max_edge),
            parse_var("LABEL_SCAN_JPEG_QUALITY", get("LABEL_SCAN_JPEG_QUALITY"))
                .unwrap_or(defaults.jpeg_quality),
        );

        Self {
            api_key,
            backend,
            normalize,
        }
    }

    /// The API credential, or a configuration error telling the user how to provide one.
    pub fn require_api_key(&self) -> Result<&str, PipelineError> {
        self.api_key.as_deref().ok_or_else(|| {
            PipelineError::MissingCredential(format!(
                "No API key configured. Set {} (or {}) in the environment or in a .env file, then retry.",
                API_KEY_VARS[0], API_KEY_VARS[1]
            ))
        })
    }
}

fn parse_var<T: FromStr>(name: &str, raw: Option<String>) -> Option<T> {
    let raw = raw?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(variable = name, value = %raw, "ignoring unparsable setting, using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = Config::from_lookup(lookup(&[]));
        assert!(config.api_key.is_none());
        assert_eq!(config.backend, BackendSettings::default());
        assert_eq!(config.normalize, NormalizeSettings::default());
    }

    #[test]
    fn missing_key_is_a_configuration_error() {
        let config = Config::from_lookup(lookup(&[("GEMINI_API_KEY", "   ")]));
        let err = config.require_api_key().unwrap_err();
        assert!(matches!(err, PipelineError::MissingCredential(_)));
        assert!(err.user_message().contains("GEMINI_API_KEY"));
    }

    #[test]
    fn falls_back_to_generic_api_key() {
        let config = Config::from_lookup(lookup(&[("API_KEY", "k-123")]));
        assert_eq!(config.require_api_key().unwrap(), "k-123");
    }

    #[test]
    fn overrides_are_read_and_clamped() {
        let config = Config::from_lookup(lookup(&[
            ("GEMINI_API_KEY", "key"),
            ("LABEL_SCAN_ENDPOINT", "http://localhost:8080/v1/"),
            ("LABEL_SCAN_MODEL", "gemini-test"),
            ("LABEL_SCAN_TIMEOUT_SECS", "5"),
            ("LABEL_SCAN_MAX_EDGE", "512"),
            ("LABEL_SCAN_JPEG_QUALITY", "0"),
        ]));
        assert_eq!(config.backend.endpoint, "http://localhost:8080/v1");
        assert_eq!(config.backend.model, "gemini-test");
        assert_eq!(config.backend.timeout, Duration::from_secs(5));
        assert_eq!(config.normalize.max_edge, 512);
        assert_eq!(config.normalize.jpeg_quality, 1);
    }

    #[test]
    fn unparsable_numbers_keep_defaults() {
        let config = Config::from_lookup(lookup(&[
            ("LABEL_SCAN_MAX_EDGE", "big"),
            ("LABEL_SCAN_TIMEOUT_SECS", "-3"),
        ]));
        assert_eq!(config.normalize.max_edge, DEFAULT_MAX_EDGE);
        assert_eq!(config.backend.timeout, Duration::from_secs(DEFAULT_TIMEOUT_SECS));
    }
}
