use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use parley_llm::{DEFAULT_HTTP_ENDPOINT, DEFAULT_OPENAI_MODEL};
use parley_sync::{EngineConfig, WatcherConfig};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const CONFIG_DIRECTORY_NAME: &str = "parley";
pub const CONFIG_FILE_NAME: &str = "config.json";
pub const DATABASE_FILE_NAME: &str = "conversations.db";
pub const ENV_PREFIX: &str = "PARLEY_";
/// Storage location selecting the process-local log.
pub const MEMORY_DATABASE: &str = ":memory:";
pub const DEFAULT_USER_ID: &str = "local";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnswerBackend {
    /// Document question-answering service reached over HTTP.
    #[default]
    Http,
    /// OpenAI-compatible chat completions, answering from the loaded document.
    Openai,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnswerSettings {
    pub backend: AnswerBackend,
    pub endpoint: String,
    pub timeout_ms: u64,
    pub api_key: String,
    pub model: String,
    pub max_tokens: Option<u64>,
}

impl Default for AnswerSettings {
    fn default() -> Self {
        Self {
            backend: AnswerBackend::Http,
            endpoint: DEFAULT_HTTP_ENDPOINT.to_string(),
            timeout_ms: 60_000,
            api_key: String::new(),
            model: DEFAULT_OPENAI_MODEL.to_string(),
            max_tokens: None,
        }
    }
}

impl AnswerSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    fn normalized(mut self) -> Self {
        let defaults = Self::default();
        self.endpoint = self.endpoint.trim().to_string();
        // The rig adapter falls back to the provider's own URL when the endpoint is empty.
        match self.backend {
            AnswerBackend::Http if self.endpoint.is_empty() => self.endpoint = defaults.endpoint,
            AnswerBackend::Openai if self.endpoint == DEFAULT_HTTP_ENDPOINT => {
                self.endpoint.clear();
            }
            _ => {}
        }
        self.api_key = self.api_key.trim().to_string();
        self.model = self.model.trim().to_string();
        if self.model.is_empty() {
            self.model = defaults.model;
        }
        if self.timeout_ms == 0 {
            self.timeout_ms = defaults.timeout_ms;
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// `:memory:`, a sqlite file path, or a `sqlite:` URL.
    pub database: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            database: default_database_path().to_string_lossy().into_owned(),
        }
    }
}

impl StorageSettings {
    pub fn is_memory(&self) -> bool {
        self.database == MEMORY_DATABASE
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherSettings {
    pub poll_interval_ms: u64,
    pub retry_initial_ms: u64,
    pub retry_max_ms: u64,
    pub stale_pending_after_secs: u64,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            retry_initial_ms: 250,
            retry_max_ms: 8_000,
            stale_pending_after_secs: 300,
        }
    }
}

impl WatcherSettings {
    fn normalized(mut self) -> Self {
        let defaults = Self::default();
        for (value, default) in [
            (&mut self.poll_interval_ms, defaults.poll_interval_ms),
            (&mut self.retry_initial_ms, defaults.retry_initial_ms),
            (&mut self.retry_max_ms, defaults.retry_max_ms),
            (
                &mut self.stale_pending_after_secs,
                defaults.stale_pending_after_secs,
            ),
        ] {
            if *value == 0 {
                *value = default;
            }
        }
        self.retry_max_ms = self.retry_max_ms.max(self.retry_initial_ms);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RevealSettings {
    pub step_delay_ms: u64,
}

impl Default for RevealSettings {
    fn default() -> Self {
        Self { step_delay_ms: 50 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParleyConfig {
    /// Owner of every conversation this process opens.
    pub user_id: String,
    pub answer: AnswerSettings,
    pub storage: StorageSettings,
    pub watcher: WatcherSettings,
    pub reveal: RevealSettings,
}

impl Default for ParleyConfig {
    fn default() -> Self {
        Self {
            user_id: DEFAULT_USER_ID.to_string(),
            answer: AnswerSettings::default(),
            storage: StorageSettings::default(),
            watcher: WatcherSettings::default(),
            reveal: RevealSettings::default(),
        }
    }
}

impl ParleyConfig {
    /// Layers defaults, the JSON file at `path` (if present) and `PARLEY_*` variables.
    ///
    /// Nested keys use a double underscore: `PARLEY_ANSWER__ENDPOINT`.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn load(path: &Path) -> ConfigResult<Self> {
        let config = Self::figment(path)
            .extract::<Self>()
            .context(ExtractSnafu {
                stage: "extract-config",
                path: path.to_path_buf(),
            })?;
        Ok(config.normalized())
    }

    pub fn normalized(mut self) -> Self {
        self.user_id = self.user_id.trim().to_string();
        if self.user_id.is_empty() {
            self.user_id = DEFAULT_USER_ID.to_string();
        }
        self.answer = self.answer.normalized();
        self.storage.database = self.storage.database.trim().to_string();
        if self.storage.database.is_empty() {
            self.storage = StorageSettings::default();
        }
        self.watcher = self.watcher.normalized();
        self
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            watcher: WatcherConfig {
                poll_interval: Duration::from_millis(self.watcher.poll_interval_ms),
                retry_initial: Duration::from_millis(self.watcher.retry_initial_ms),
                retry_max: Duration::from_millis(self.watcher.retry_max_ms),
            },
            reveal_step_delay: Duration::from_millis(self.reveal.step_delay_ms),
            stale_pending_after: Duration::from_secs(self.watcher.stale_pending_after_secs),
            ..EngineConfig::default()
        }
    }
}

pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|path| path.join(CONFIG_DIRECTORY_NAME))
        .unwrap_or_else(|| PathBuf::from(".parley"))
}

pub fn default_database_path() -> PathBuf {
    dirs::data_dir()
        .map(|path| path.join(CONFIG_DIRECTORY_NAME))
        .unwrap_or_else(|| PathBuf::from(".parley"))
        .join(DATABASE_FILE_NAME)
}

/// Live configuration, swappable at runtime and persisted as JSON.
pub struct ConfigStore {
    config: Arc<ArcSwap<ParleyConfig>>,
    config_path: PathBuf,
}

impl ConfigStore {
    pub fn default_config_path() -> PathBuf {
        default_config_dir().join(CONFIG_FILE_NAME)
    }

    /// Loads from `config_path`, falling back to defaults when the file cannot be parsed.
    pub fn new(config_path: PathBuf) -> Self {
        let config = match ParleyConfig::load(&config_path) {
            Ok(config) => config,
            Err(error) => {
                tracing::warn!("{error}. using defaults");
                ParleyConfig::default()
            }
        };

        Self {
            config: Arc::new(ArcSwap::from_pointee(config)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config(&self) -> Arc<ParleyConfig> {
        self.config.load_full()
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn update(&self, config: ParleyConfig) -> ConfigResult<()> {
        let normalized_config = config.normalized();
        self.persist(&normalized_config)?;
        self.config.store(Arc::new(normalized_config));
        Ok(())
    }

    fn persist(&self, config: &ParleyConfig) -> ConfigResult<()> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-config-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(config).context(SerializeConfigSnafu {
            stage: "serialize-config-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-config-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-config-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!("saved config to {:?}", self.config_path);
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display("failed to load config from {path:?} on `{stage}`: {source}"))]
    Extract {
        stage: &'static str,
        path: PathBuf,
        #[snafu(source(from(figment::Error, Box::new)))]
        source: Box<figment::Error>,
    },
    #[snafu(display("failed to create config directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize config on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write config file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace config file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

pub type ConfigResult<T> = Result<T, ConfigError>;
