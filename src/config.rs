use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::query::Vocabulary;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Deepseek,
    Openai,
    Ollama,
}

impl ProviderKind {
    pub fn default_model(self) -> &'static str {
        match self {
            ProviderKind::Deepseek => "deepseek-chat",
            ProviderKind::Openai => "gpt-4o-mini",
            ProviderKind::Ollama => "llama3.1",
        }
    }

    pub fn default_base_url(self) -> &'static str {
        match self {
            ProviderKind::Deepseek => "https://api.deepseek.com",
            ProviderKind::Openai => "https://api.openai.com/v1",
            ProviderKind::Ollama => "http://localhost:11434",
        }
    }

    /// Environment variable and `api_keys.toml` entry holding the key.
    /// Ollama runs locally and needs none.
    pub fn api_key_name(self) -> Option<&'static str> {
        match self {
            ProviderKind::Deepseek => Some("DEEPSEEK_API_KEY"),
            ProviderKind::Openai => Some("OPENAI_API_KEY"),
            ProviderKind::Ollama => None,
        }
    }
}

pub const TAVILY_KEY_NAME: &str = "TAVILY_API_KEY";

fn default_kind() -> ProviderKind {
    ProviderKind::Deepseek
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    4000
}

fn default_max_results() -> usize {
    3
}

fn default_max_content_length() -> usize {
    20000
}

fn default_max_reflections() -> u32 {
    2
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("reports")
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub vocabulary: Vocabulary,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderConfig {
    #[serde(default = "default_kind")]
    pub kind: ProviderKind,
    /// Falls back to the provider's default model.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: default_kind(),
            model: None,
            base_url: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

impl ProviderConfig {
    pub fn model(&self) -> String {
        self.model
            .clone()
            .unwrap_or_else(|| self.kind.default_model().to_string())
    }

    /// Explicit `base_url`, then `OLLAMA_HOST` for Ollama, then the provider default.
    pub fn base_url(&self) -> String {
        if let Some(url) = &self.base_url {
            return url.trim_end_matches('/').to_string();
        }
        if self.kind == ProviderKind::Ollama {
            if let Ok(host) = std::env::var("OLLAMA_HOST") {
                return host.trim_end_matches('/').to_string();
            }
        }
        self.kind.default_base_url().to_string()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SearchConfig {
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    /// Characters of each result excerpt handed to the model.
    #[serde(default = "default_max_content_length")]
    pub max_content_length: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_results: default_max_results(),
            max_content_length: default_max_content_length(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentConfig {
    #[serde(default = "default_max_reflections")]
    pub max_reflections: u32,
    #[serde(default)]
    pub time_horizon: Option<String>,
    #[serde(default)]
    pub analysis_angles: Vec<String>,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_true")]
    pub save_intermediate_states: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_reflections: default_max_reflections(),
            time_horizon: None,
            analysis_angles: Vec::new(),
            output_dir: default_output_dir(),
            save_intermediate_states: true,
        }
    }
}

impl Config {
    /// Load from the config directory. A missing or broken file yields defaults.
    pub fn load() -> Self {
        Self::load_from(&Self::get_config_path())
    }

    pub fn load_from(config_path: &Path) -> Self {
        if config_path.exists() {
            match fs::read_to_string(config_path) {
                Ok(contents) => match toml::from_str(&contents) {
                    Ok(config) => {
                        debug!(path = %config_path.display(), "loaded config");
                        return config;
                    }
                    Err(e) => warn!("Error parsing {}: {}. Using defaults.", config_path.display(), e),
                },
                Err(e) => warn!("Error reading {}: {}. Using defaults.", config_path.display(), e),
            }
        }

        Config::default()
    }

    pub fn get_config_path() -> PathBuf {
        if let Some(home) = std::env::var_os("HOME") {
            PathBuf::from(home).join(".config/deep-search/config.toml")
        } else {
            PathBuf::from("config.toml")
        }
    }

    pub fn get_config_dir() -> PathBuf {
        if let Some(home) = std::env::var_os("HOME") {
            PathBuf::from(home).join(".config/deep-search")
        } else {
            PathBuf::from(".")
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiKeysConfig {
    #[serde(default)]
    keys: HashMap<String, String>,
}

/// Read the `[keys]` table of an `api_keys.toml` file. A missing file is empty.
pub fn load_api_keys(path: &Path) -> anyhow::Result<HashMap<String, String>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }

    let contents = fs::read_to_string(path)?;
    let config: ApiKeysConfig = toml::from_str(&contents)?;
    Ok(config.keys)
}

/// API keys by name: environment first, then `api_keys.toml`.
#[derive(Debug, Clone, Default)]
pub struct ApiKeys {
    file_keys: HashMap<String, String>,
}

impl ApiKeys {
    pub fn load() -> Self {
        let path = Config::get_config_dir().join("api_keys.toml");
        let file_keys = load_api_keys(&path).unwrap_or_else(|e| {
            warn!("Failed to load {}: {}", path.display(), e);
            HashMap::new()
        });
        Self { file_keys }
    }

    pub fn from_map(file_keys: HashMap<String, String>) -> Self {
        Self { file_keys }
    }

    pub fn get(&self, name: &str) -> Option<String> {
        std::env::var(name)
            .ok()
            .or_else(|| self.file_keys.get(name).cloned())
            .filter(|key| !key.trim().is_empty())
    }
}
