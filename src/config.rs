//! Process-wide configuration.
//!
//! Resolved once at startup from, in increasing priority:
//! built-in defaults, `{working_dir}/.atlas/settings.json`, environment
//! variables, and finally command-line overrides applied by the binary.
//! Immutable afterwards and shared as `Arc<Config>`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::llm::{LlmClient, OllamaClient, OpenRouterClient, DEFAULT_OLLAMA_URL};

pub const DEFAULT_MODEL: &str = "jobautomation/OpenEuroLLM-Polish:latest";
pub const DEFAULT_WEBDRIVER_URL: &str = "http://localhost:9515";

/// Which model backend to talk to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LlmProvider {
    Ollama { base_url: String },
    OpenRouter { api_key: String },
}

impl LlmProvider {
    pub fn label(&self) -> &str {
        match self {
            LlmProvider::Ollama { .. } => "ollama",
            LlmProvider::OpenRouter { .. } => "openrouter",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub model: String,
    pub provider: LlmProvider,
    pub working_dir: PathBuf,
    pub screenshots_dir: PathBuf,
    pub logs_dir: PathBuf,
    /// Roots beyond the user profile and working directory that steps may touch.
    pub extra_allowed_roots: Vec<PathBuf>,
    /// Additional attempts after the first failure of a step.
    pub max_retries: u32,
    /// Delay before the first self-heal retry; doubles on each further retry.
    pub retry_backoff: Duration,
    pub model_timeout: Duration,
    pub shell_timeout: Duration,
    /// Messages kept in a task's conversation with the model.
    pub history_window: usize,
    pub webdriver_url: String,
    /// Skip the interactive confirmation before executing a plan.
    pub auto_confirm: bool,
}

/// On-disk settings file. Every field is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ollama_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_roots: Option<Vec<PathBuf>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webdriver_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_confirm: Option<bool>,
}

impl Config {
    /// Built-in defaults rooted at `working_dir`.
    pub fn new(working_dir: PathBuf) -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            provider: LlmProvider::Ollama {
                base_url: DEFAULT_OLLAMA_URL.to_string(),
            },
            screenshots_dir: working_dir.join("screenshots"),
            logs_dir: working_dir.join("logs"),
            working_dir,
            extra_allowed_roots: Vec::new(),
            max_retries: 2,
            retry_backoff: Duration::from_millis(500),
            model_timeout: Duration::from_secs(120),
            shell_timeout: Duration::from_secs(60),
            history_window: 12,
            webdriver_url: DEFAULT_WEBDRIVER_URL.to_string(),
            auto_confirm: false,
        }
    }

    /// Defaults, then the settings file, then the process environment.
    pub fn load(working_dir: PathBuf) -> Self {
        let mut config = Self::new(working_dir);
        let settings_path = config.settings_path();

        if settings_path.exists() {
            match Self::load_settings(&settings_path) {
                Ok(settings) => {
                    tracing::info!("Loaded settings from {}", settings_path.display());
                    config.apply_settings(settings);
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to load settings from {}: {}, using defaults",
                        settings_path.display(),
                        e
                    );
                }
            }
        } else {
            tracing::debug!(
                "No settings file found at {}, using defaults",
                settings_path.display()
            );
        }

        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    pub fn settings_path(&self) -> PathBuf {
        self.working_dir.join(".atlas").join("settings.json")
    }

    fn load_settings(path: &Path) -> Result<Settings, std::io::Error> {
        let contents = std::fs::read_to_string(path)?;
        serde_json::from_str(&contents)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    pub fn apply_settings(&mut self, settings: Settings) {
        if let Some(model) = settings.model {
            self.model = model;
        }
        if let Some(url) = settings.ollama_url {
            self.provider = LlmProvider::Ollama { base_url: url };
        }
        if let Some(roots) = settings.allowed_roots {
            self.extra_allowed_roots.extend(roots);
        }
        if let Some(retries) = settings.max_retries {
            self.max_retries = retries;
        }
        if let Some(secs) = settings.model_timeout_secs {
            self.model_timeout = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = settings.shell_timeout_secs {
            self.shell_timeout = Duration::from_secs(secs.max(1));
        }
        if let Some(url) = settings.webdriver_url {
            self.webdriver_url = url;
        }
        if let Some(auto) = settings.auto_confirm {
            self.auto_confirm = auto;
        }
    }

    /// Apply environment overrides. `lookup` is `std::env::var` in production.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(model) = get("ATLAS_MODEL") {
            self.model = model;
        }
        if let Some(url) = get("OLLAMA_HOST") {
            let url = if url.starts_with("http://") || url.starts_with("https://") {
                url
            } else {
                format!("http://{}", url)
            };
            self.provider = LlmProvider::Ollama { base_url: url };
        }
        // A hosted key wins over a local server.
        if let Some(key) = get("OPENROUTER_API_KEY") {
            self.provider = LlmProvider::OpenRouter { api_key: key };
        }
        if let Some(dir) = get("ATLAS_WORKING_DIR") {
            self.set_working_dir(PathBuf::from(dir));
        }
        if let Some(roots) = get("ATLAS_ALLOWED_ROOTS") {
            self.extra_allowed_roots
                .extend(std::env::split_paths(&roots).filter(|p| !p.as_os_str().is_empty()));
        }
        if let Some(retries) = get("ATLAS_MAX_RETRIES").and_then(|v| v.trim().parse().ok()) {
            self.max_retries = retries;
        }
        if let Some(secs) = get("ATLAS_MODEL_TIMEOUT_SECS").and_then(|v| v.trim().parse::<u64>().ok())
        {
            self.model_timeout = Duration::from_secs(secs.max(1));
        }
        if let Some(url) = get("ATLAS_WEBDRIVER_URL") {
            self.webdriver_url = url;
        }
    }

    /// Move the working directory, keeping output directories inside it.
    pub fn set_working_dir(&mut self, working_dir: PathBuf) {
        self.screenshots_dir = working_dir.join("screenshots");
        self.logs_dir = working_dir.join("logs");
        self.working_dir = working_dir;
    }

    /// Create the declared output directories.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.screenshots_dir)?;
        std::fs::create_dir_all(&self.logs_dir)?;
        Ok(())
    }

    /// Build the model backend this configuration points at.
    pub fn llm_client(&self) -> Arc<dyn LlmClient> {
        match &self.provider {
            LlmProvider::Ollama { base_url } => Arc::new(OllamaClient::new(base_url.clone())),
            LlmProvider::OpenRouter { api_key } => Arc::new(OpenRouterClient::new(api_key.clone())),
        }
    }
}
