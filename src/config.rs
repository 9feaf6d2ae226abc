//! Engine configuration.
//!
//! Settings are read-only to the engine: hosts load or build a [`Config`],
//! hand pieces of it to the components at construction time, and rebuild the
//! components if the user edits anything.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Provider routing and local model parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    /// Provider name consulted first (usually `"Cloud"` or `"Local"`).
    pub primary_service_type: String,
    /// Provider name consulted when the primary is not registered.
    /// `"None"` disables the fallback.
    pub fallback_service_type: String,

    /// Path to the GGUF model file.
    pub local_model_path: PathBuf,
    /// Context window in tokens for each local conversation.
    pub local_model_context_size: u32,
    /// Hard cap on generated tokens per local turn.
    pub local_model_max_tokens: u32,
    /// Sampling temperature; `0.0` selects greedy decoding.
    pub local_model_temperature: f32,
    /// Worker threads for local inference. `0` lets llama.cpp decide.
    pub local_cpu_cores: u32,
    /// Offload as many layers as possible to the GPU.
    pub prefer_gpu: bool,
    /// Memory-map the model file instead of reading it into RAM.
    pub local_model_memory_map: bool,
    /// Lock model pages in RAM to avoid swapping.
    pub local_model_memory_lock: bool,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            primary_service_type: "Cloud".to_string(),
            fallback_service_type: "None".to_string(),
            local_model_path: PathBuf::new(),
            local_model_context_size: 4096,
            local_model_max_tokens: 2048,
            local_model_temperature: 0.7,
            local_cpu_cores: 0,
            prefer_gpu: false,
            local_model_memory_map: true,
            local_model_memory_lock: false,
        }
    }
}

/// Wire dialect of a cloud configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Vendor {
    OpenAi,
    Anthropic,
    Google,
    /// Any server speaking the OpenAI chat-completions dialect
    /// (Ollama, vLLM, OpenRouter, ...). Requires an explicit `base_url`.
    OpenAiCompatible,
}

impl Vendor {
    #[must_use]
    pub fn default_base_url(self) -> &'static str {
        match self {
            Self::OpenAi | Self::OpenAiCompatible => "https://api.openai.com",
            Self::Anthropic => "https://api.anthropic.com",
            Self::Google => "https://generativelanguage.googleapis.com/v1beta/models",
        }
    }
}

/// One entry in the ordered cloud fallback chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudProviderConfig {
    pub name: String,
    pub vendor: Vendor,
    #[serde(default)]
    pub api_key: String,
    /// Overrides the vendor default endpoint when set.
    #[serde(default)]
    pub base_url: Option<String>,
    pub model: String,
    #[serde(default = "default_cloud_temperature")]
    pub temperature: f32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_cloud_temperature() -> f32 {
    0.7
}

fn default_enabled() -> bool {
    true
}

impl CloudProviderConfig {
    /// Endpoint base, falling back to the vendor default.
    #[must_use]
    pub fn base_url(&self) -> &str {
        self.base_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .unwrap_or_else(|| self.vendor.default_base_url())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub provider: ProviderSettings,
    /// Fallback chain order is the order of this list.
    pub cloud_providers: Vec<CloudProviderConfig>,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = dirs::config_dir()
            .map(|d| d.join("redraft").join("config.toml"))
            .unwrap_or_else(|| PathBuf::from(".redraft/config.toml"));
        Self::load_from(&config_path)
    }

    pub fn load_from(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&content)?)
        } else {
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = ProviderSettings::default();
        assert_eq!(settings.primary_service_type, "Cloud");
        assert_eq!(settings.fallback_service_type, "None");
        assert_eq!(settings.local_model_context_size, 4096);
        assert_eq!(settings.local_model_max_tokens, 2048);
        assert!(settings.local_model_memory_map);
        assert!(!settings.local_model_memory_lock);
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
            [provider]
            primary_service_type = "Local"
            local_model_path = "/models/q4.gguf"
            local_model_context_size = 8192

            [[cloud_providers]]
            name = "OpenRouter"
            vendor = "open_ai_compatible"
            base_url = "https://openrouter.ai/api"
            model = "gpt-4o-mini"
            enabled = false
        "#;
        let config: Config = toml::from_str(toml).expect("parse");
        assert_eq!(config.provider.primary_service_type, "Local");
        assert_eq!(config.provider.local_model_context_size, 8192);
        // Unspecified fields keep their defaults.
        assert_eq!(config.provider.local_model_max_tokens, 2048);
        let cloud = &config.cloud_providers[0];
        assert_eq!(cloud.vendor, Vendor::OpenAiCompatible);
        assert!(!cloud.enabled);
        assert_eq!(cloud.base_url(), "https://openrouter.ai/api");
    }

    #[test]
    fn test_base_url_vendor_default() {
        let config = CloudProviderConfig {
            name: "Anthropic".to_string(),
            vendor: Vendor::Anthropic,
            api_key: String::new(),
            base_url: Some("  ".to_string()),
            model: "claude-sonnet-4-0".to_string(),
            temperature: 0.7,
            enabled: true,
        };
        assert_eq!(config.base_url(), "https://api.anthropic.com");
    }

    #[test]
    fn test_load_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Config::load_from(&dir.path().join("nope.toml")).expect("load");
        assert_eq!(config.provider.primary_service_type, "Cloud");
        assert!(config.cloud_providers.is_empty());
    }
}
