use std::{env, fmt, fs, path::PathBuf, str::FromStr, time::Duration};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{info, warn};

use crate::{flow::session::idle_minutes, invoker::RetryPolicy};

/// A key/value configuration source.
#[async_trait]
pub trait ConfigManagerType: Send + Sync {
    async fn keys(&self) -> Vec<String>;
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: &str) -> Result<(), String>;
    async fn del(&self, key: &str);
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn debug_box(&self) -> String;
}

pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl ConfigManager {
    pub async fn get(&self, key: &str) -> Option<String> {
        self.0.get(key).await.filter(|v| !v.trim().is_empty())
    }

    /// Parsed value of `key`, or `default` when unset. Unparseable values are
    /// logged and replaced by the default.
    pub async fn get_or<T>(&self, key: &str, default: T) -> T
    where
        T: FromStr + fmt::Display,
    {
        match self.get(key).await {
            None => default,
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                warn!("config `{}`: cannot parse `{}`, using {}", key, raw, default);
                default
            }),
        }
    }
}

impl Clone for ConfigManager {
    fn clone(&self) -> Self {
        ConfigManager(self.0.clone_box())
    }
}

impl fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Process environment, seeded from a `.env` file that `set`/`del` keep in sync.
#[derive(Clone, Debug)]
pub struct EnvConfigManager {
    env_file: PathBuf,
}

impl EnvConfigManager {
    pub fn new(env_file: PathBuf) -> Box<Self> {
        if env_file.exists() {
            dotenvy::from_path(&env_file).ok();
            info!("Loaded .env from {}", env_file.display());
        } else {
            warn!("no .env at {}", env_file.display());
        }
        Box::new(Self { env_file })
    }

    // rewrites `key` in the .env file; `None` removes the line
    fn rewrite(&self, key: &str, value: Option<&str>) -> Result<(), String> {
        let content = fs::read_to_string(&self.env_file).unwrap_or_default();
        let mut found = false;
        let mut lines: Vec<String> = content
            .lines()
            .filter_map(|line| match line.split_once('=') {
                Some((k, _)) if k.trim() == key => {
                    found = true;
                    value.map(|v| format!("{key}={v}"))
                }
                _ => Some(line.to_string()),
            })
            .collect();
        if let (false, Some(v)) = (found, value) {
            lines.push(format!("{key}={v}"));
        }
        fs::write(&self.env_file, lines.join("\n")).map_err(|e| e.to_string())
    }
}

#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn keys(&self) -> Vec<String> {
        env::vars().map(|(k, _)| k).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), String> {
        unsafe {
            env::set_var(key, value);
        };
        self.rewrite(key, Some(value))
    }

    async fn del(&self, key: &str) {
        unsafe {
            env::remove_var(key);
        };
        if self.env_file.exists() {
            let _ = self.rewrite(key, None);
        }
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("EnvConfigManager({})", self.env_file.display())
    }
}

/// In-memory configuration.
#[derive(Debug, Clone, Default)]
pub struct MapConfigManager {
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::new(Self::default())
    }

    pub fn with(self: Box<Self>, key: &str, value: &str) -> Box<Self> {
        self.map.insert(key.to_string(), value.to_string());
        self
    }
}

#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn keys(&self) -> Vec<String> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), String> {
        self.map.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn del(&self, key: &str) {
        self.map.remove(key);
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

pub const DEFAULT_FALLBACK_MESSAGE: &str =
    "Lo siento, tuvimos un problema procesando tu mensaje.";
pub const DEFAULT_ABANDON_MESSAGE: &str = "Conversación cancelada. Escríbenos cuando quieras.";
pub const DEFAULT_ABANDON_KEYWORDS: [&str; 4] = ["cancelar", "salir", "cancel", "exit"];

/// Engine-wide knobs. Flows may override the conversational ones in their settings.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub max_steps: usize,
    pub history_window: usize,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub session_capacity: u64,
    pub http_timeout: Duration,
    pub http_attempts: u32,
    pub backoff: Duration,
    pub fallback_message: String,
    pub human_contact: Option<String>,
    pub abandon_keywords: Vec<String>,
    pub abandon_message: String,
    pub openai_url: String,
    pub openai_key: Option<String>,
    pub openai_model: String,
    pub llm_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_steps: 50,
            history_window: 20,
            idle_timeout: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(600),
            session_capacity: 100_000,
            http_timeout: Duration::from_millis(30_000),
            http_attempts: 3,
            backoff: Duration::from_millis(1000),
            fallback_message: DEFAULT_FALLBACK_MESSAGE.to_string(),
            human_contact: None,
            abandon_keywords: DEFAULT_ABANDON_KEYWORDS.iter().map(|k| k.to_string()).collect(),
            abandon_message: DEFAULT_ABANDON_MESSAGE.to_string(),
            openai_url: "https://api.openai.com/v1".to_string(),
            openai_key: None,
            openai_model: "gpt-4o-mini".to_string(),
            llm_timeout: Duration::from_millis(30_000),
        }
    }
}

impl EngineSettings {
    pub async fn from_config(config: &ConfigManager) -> Self {
        let d = Self::default();
        let abandon_keywords = match config.get("FLOWBOT_ABANDON_KEYWORDS").await {
            Some(list) => list
                .split(',')
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .collect(),
            None => d.abandon_keywords,
        };
        Self {
            max_steps: config.get_or("FLOWBOT_MAX_STEPS", d.max_steps).await,
            history_window: config.get_or("FLOWBOT_HISTORY_WINDOW", d.history_window).await,
            idle_timeout: idle_minutes(config.get_or("FLOWBOT_IDLE_TIMEOUT_MINS", 30u64).await),
            sweep_interval: Duration::from_secs(
                config.get_or("FLOWBOT_SWEEP_INTERVAL_SECS", 600u64).await.max(1),
            ),
            session_capacity: config
                .get_or("FLOWBOT_SESSION_CAPACITY", d.session_capacity)
                .await,
            http_timeout: Duration::from_millis(
                config.get_or("FLOWBOT_HTTP_TIMEOUT_MS", 30_000u64).await,
            ),
            http_attempts: config.get_or("FLOWBOT_HTTP_ATTEMPTS", d.http_attempts).await,
            backoff: Duration::from_millis(config.get_or("FLOWBOT_BACKOFF_MS", 1000u64).await),
            fallback_message: config
                .get("FLOWBOT_FALLBACK_MESSAGE")
                .await
                .unwrap_or(d.fallback_message),
            human_contact: config.get("FLOWBOT_HUMAN_CONTACT").await,
            abandon_keywords,
            abandon_message: config
                .get("FLOWBOT_ABANDON_MESSAGE")
                .await
                .unwrap_or(d.abandon_message),
            openai_url: config.get("OPENAI_URL").await.unwrap_or(d.openai_url),
            openai_key: config.get("OPENAI_KEY").await,
            openai_model: config.get("OPENAI_MODEL").await.unwrap_or(d.openai_model),
            llm_timeout: Duration::from_millis(
                config.get_or("FLOWBOT_LLM_TIMEOUT_MS", 30_000u64).await,
            ),
        }
    }

    /// Retry policy for REST calls, before per-api and per-node overrides.
    pub fn http_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.http_attempts, self.backoff, self.http_timeout)
    }

    pub fn llm_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.http_attempts, self.backoff, self.llm_timeout)
    }
}
