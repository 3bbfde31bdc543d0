use std::env;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::paths::AppPaths;

/// Engine-wide tunables for chunking, retrieval, and prompt assembly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum chunk size in characters
    pub chunk_size: usize,
    /// Maximum context block length in characters
    pub context_window_size: usize,
    /// Maximum number of chunks injected into the context block
    pub max_context_chunks: usize,
    /// Similarity floor for retrieval (0.0-1.0)
    pub min_similarity: f32,
    /// Conversation history cap per key
    pub history_limit: usize,
    /// Most recent history messages included in the prompt
    pub prompt_history_window: usize,
    /// System prompt used when the caller supplies none
    pub default_system_prompt: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            context_window_size: 2000,
            max_context_chunks: 5,
            min_similarity: 0.3,
            history_limit: 50,
            prompt_history_window: 10,
            default_system_prompt: "You are a helpful assistant.".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load from a YAML file, falling back to defaults when the file is
    /// missing or unreadable.
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(path) {
            Ok(contents) => match serde_yaml::from_str(&contents) {
                Ok(config) => config,
                Err(err) => {
                    tracing::warn!(
                        "Invalid config at {}: {}; using defaults",
                        path.display(),
                        err
                    );
                    Self::default()
                }
            },
            Err(err) => {
                tracing::warn!(
                    "Could not read config at {}: {}; using defaults",
                    path.display(),
                    err
                );
                Self::default()
            }
        }
    }

    /// Load from `LORECORE_CONFIG_PATH` if set, else the default location.
    pub fn load_default(paths: &AppPaths) -> Self {
        if let Ok(path) = env::var("LORECORE_CONFIG_PATH") {
            return Self::load(Path::new(&path));
        }
        Self::load(&paths.config_path)
    }
}

/// Backend family tag for a configured LLM provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    AzureOpenAi,
    LocalInference,
    Google,
    Mock,
}

/// Connection and budget settings for one LLM provider instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Azure deployments pin an API version in the query string
    #[serde(default)]
    pub api_version: Option<String>,
    pub model: String,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    #[serde(default = "default_tokens_per_minute")]
    pub tokens_per_minute: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_requests_per_minute() -> u32 {
    60
}

fn default_tokens_per_minute() -> u32 {
    40_000
}

fn default_timeout_secs() -> u64 {
    30
}

impl ProviderConfig {
    pub fn new(kind: ProviderKind, model: impl Into<String>) -> Self {
        Self {
            kind,
            base_url: None,
            api_key: None,
            api_version: None,
            model: model.into(),
            max_tokens: None,
            requests_per_minute: default_requests_per_minute(),
            tokens_per_minute: default_tokens_per_minute(),
            timeout_secs: default_timeout_secs(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_limits(mut self, requests_per_minute: u32, tokens_per_minute: u32) -> Self {
        self.requests_per_minute = requests_per_minute;
        self.tokens_per_minute = tokens_per_minute;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.chunk_size, 500);
        assert_eq!(config.context_window_size, 2000);
        assert_eq!(config.max_context_chunks, 5);
        assert!((config.min_similarity - 0.3).abs() < f32::EPSILON);
        assert_eq!(config.history_limit, 50);
        assert_eq!(config.prompt_history_window, 10);
    }

    #[test]
    fn load_missing_file_falls_back_to_defaults() {
        let path = std::env::temp_dir().join(format!(
            "lorecore-config-missing-{}.yml",
            uuid::Uuid::new_v4()
        ));
        let config = EngineConfig::load(&path);
        assert_eq!(config.chunk_size, 500);
    }

    #[test]
    fn load_partial_yaml_overrides_some_fields() {
        let path = std::env::temp_dir().join(format!(
            "lorecore-config-test-{}.yml",
            uuid::Uuid::new_v4()
        ));
        std::fs::write(&path, "chunk_size: 120\nmin_similarity: 0.5\n").unwrap();

        let config = EngineConfig::load(&path);
        assert_eq!(config.chunk_size, 120);
        assert!((config.min_similarity - 0.5).abs() < f32::EPSILON);
        assert_eq!(config.context_window_size, 2000);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn provider_config_defaults_and_builders() {
        let config = ProviderConfig::new(ProviderKind::OpenAi, "gpt-4o-mini")
            .with_api_key("sk-test")
            .with_limits(2, 1000);

        assert_eq!(config.requests_per_minute, 2);
        assert_eq!(config.tokens_per_minute, 1000);
        assert_eq!(config.timeout_secs, 30);
        assert_eq!(config.api_key.as_deref(), Some("sk-test"));

        let default = ProviderConfig::new(ProviderKind::Anthropic, "claude");
        assert_eq!(default.requests_per_minute, 60);
        assert_eq!(default.tokens_per_minute, 40_000);
    }

    #[test]
    fn provider_kind_serializes_snake_case() {
        let tag = serde_json::to_string(&ProviderKind::AzureOpenAi).unwrap();
        assert_eq!(tag, "\"azure_open_ai\"");
        let tag = serde_json::to_string(&ProviderKind::LocalInference).unwrap();
        assert_eq!(tag, "\"local_inference\"");
    }
}
