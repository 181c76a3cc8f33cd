//! Configuration management with file persistence

use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};

use crate::agents::{ExecutorConfig, SchedulerConfig};
use crate::domain::context::{InjectionFilter, RetrieverConfig};
use crate::domain::locking::LockConfig;
use crate::storage::{DatabaseConfig, default_database_path};

/// Agent core configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub llm: LlmConfig,
    pub locks: LocksConfig,
    pub context: ContextConfig,
    pub scheduler: SchedulerSection,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub default_model: String,
    pub fallback_models: Vec<String>,
    pub temperature: f32,
    pub max_tokens: usize,
    pub timeout_secs: u64,
    /// Attempts per model when rate limited
    pub max_retries: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            default_model: "anthropic/claude-sonnet-4-20250514".to_string(),
            fallback_models: vec![
                "anthropic/claude-3-5-haiku-latest".to_string(),
                "openai/gpt-4o".to_string(),
            ],
            temperature: 0.7,
            max_tokens: 8192,
            timeout_secs: 120,
            max_retries: 3,
        }
    }
}

impl LlmConfig {
    pub fn resolved_api_key(&self) -> anyhow::Result<Option<String>> {
        self.enforce_env_only()?;

        Ok(env::var("DEMIARCH_API_KEY")
            .or_else(|_| env::var("OPENROUTER_API_KEY"))
            .ok()
            .filter(|key| !key.trim().is_empty()))
    }

    pub fn redacted_api_key(&self) -> anyhow::Result<Option<String>> {
        self.resolved_api_key().map(|opt| {
            opt.map(|key| match key.char_indices().rev().nth(3) {
                Some((idx, _)) if key.len() > 4 => format!("***{}", &key[idx..]),
                _ => "***".to_string(),
            })
        })
    }

    pub fn enforce_env_only(&self) -> anyhow::Result<()> {
        if self.api_key.is_some() {
            return Err(anyhow!(
                "LLM API keys must be provided via environment variables, not stored in configuration"
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocksConfig {
    pub default_timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for LocksConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 300,
            sweep_interval_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub top_k: usize,
    pub max_tokens: usize,
    /// Extra prompt-injection markers, on top of the built-in list
    pub injection_denylist: Vec<String>,
    pub background_backfill: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            top_k: 10,
            max_tokens: 4000,
            injection_denylist: Vec::new(),
            background_backfill: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub execution_deadline_secs: u64,
    pub aggregate_timeout_secs: u64,
    pub max_workers: usize,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            execution_deadline_secs: 600,
            aggregate_timeout_secs: 1800,
            max_workers: 16,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,
}

const KEYS: &[&str] = &[
    "llm.default_model",
    "llm.fallback_models",
    "llm.temperature",
    "llm.max_tokens",
    "llm.timeout_secs",
    "llm.max_retries",
    "llm.api_key",
    "locks.default_timeout_secs",
    "locks.sweep_interval_secs",
    "context.top_k",
    "context.max_tokens",
    "context.injection_denylist",
    "context.background_backfill",
    "scheduler.execution_deadline_secs",
    "scheduler.aggregate_timeout_secs",
    "scheduler.max_workers",
    "storage.database_path",
];

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> anyhow::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("Invalid {} value: {}", key, value))
}

fn parse_positive(key: &str, value: &str) -> anyhow::Result<u64> {
    let parsed: u64 = parse_value(key, value)?;
    if parsed == 0 {
        return Err(anyhow!("{} must be greater than zero", key));
    }
    Ok(parsed)
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var("DEMIARCH_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("demiarch")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("agents.toml"))
    }

    /// Load configuration from file, or defaults if it doesn't exist
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::config_path()?;

        if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> anyhow::Result<()> {
        self.validate()?;

        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;

        let path = Self::config_path()?;
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        self.llm.enforce_env_only()?;

        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(anyhow!("llm.temperature must be between 0.0 and 2.0"));
        }
        if self.llm.default_model.trim().is_empty() {
            return Err(anyhow!("llm.default_model must not be empty"));
        }
        if self.llm.max_retries == 0 {
            return Err(anyhow!("llm.max_retries must be at least 1"));
        }
        if self.locks.default_timeout_secs == 0 || self.locks.sweep_interval_secs == 0 {
            return Err(anyhow!("lock timeouts and sweep interval must be greater than zero"));
        }
        if self.scheduler.max_workers == 0 {
            return Err(anyhow!("scheduler.max_workers must be at least 1"));
        }
        if self.scheduler.execution_deadline_secs == 0 || self.scheduler.aggregate_timeout_secs == 0 {
            return Err(anyhow!("scheduler deadlines must be greater than zero"));
        }
        Ok(())
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        match key {
            "llm.default_model" => Ok(self.llm.default_model.clone()),
            "llm.fallback_models" => Ok(self.llm.fallback_models.join(", ")),
            "llm.temperature" => Ok(self.llm.temperature.to_string()),
            "llm.max_tokens" => Ok(self.llm.max_tokens.to_string()),
            "llm.timeout_secs" => Ok(self.llm.timeout_secs.to_string()),
            "llm.max_retries" => Ok(self.llm.max_retries.to_string()),

            "locks.default_timeout_secs" => Ok(self.locks.default_timeout_secs.to_string()),
            "locks.sweep_interval_secs" => Ok(self.locks.sweep_interval_secs.to_string()),

            "context.top_k" => Ok(self.context.top_k.to_string()),
            "context.max_tokens" => Ok(self.context.max_tokens.to_string()),
            "context.injection_denylist" => Ok(self.context.injection_denylist.join(", ")),
            "context.background_backfill" => Ok(self.context.background_backfill.to_string()),

            "scheduler.execution_deadline_secs" => {
                Ok(self.scheduler.execution_deadline_secs.to_string())
            }
            "scheduler.aggregate_timeout_secs" => {
                Ok(self.scheduler.aggregate_timeout_secs.to_string())
            }
            "scheduler.max_workers" => Ok(self.scheduler.max_workers.to_string()),

            "storage.database_path" => Ok(self.database_path().display().to_string()),

            "llm.api_key" | "api_key" => match self.llm.redacted_api_key()? {
                Some(redacted) => Ok(redacted),
                None => Ok(
                    "(not set - use DEMIARCH_API_KEY or OPENROUTER_API_KEY env var)".to_string(),
                ),
            },

            _ => Err(anyhow!(
                "Unknown configuration key: {}. Use `demiarch-agents config list` to see available keys.",
                key
            )),
        }
    }

    /// Set a configuration value by key
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        match key {
            "llm.default_model" => {
                if value.trim().is_empty() {
                    return Err(anyhow!("llm.default_model must not be empty"));
                }
                self.llm.default_model = value.trim().to_string();
            }
            "llm.fallback_models" => self.llm.fallback_models = split_list(value),
            "llm.temperature" => {
                let temp: f32 = parse_value(key, value)?;
                if !(0.0..=2.0).contains(&temp) {
                    return Err(anyhow!("Temperature must be between 0.0 and 2.0"));
                }
                self.llm.temperature = temp;
            }
            "llm.max_tokens" => self.llm.max_tokens = parse_value(key, value)?,
            "llm.timeout_secs" => self.llm.timeout_secs = parse_positive(key, value)?,
            "llm.max_retries" => self.llm.max_retries = parse_positive(key, value)? as u32,

            "locks.default_timeout_secs" => {
                self.locks.default_timeout_secs = parse_positive(key, value)?
            }
            "locks.sweep_interval_secs" => {
                self.locks.sweep_interval_secs = parse_positive(key, value)?
            }

            "context.top_k" => self.context.top_k = parse_value(key, value)?,
            "context.max_tokens" => self.context.max_tokens = parse_value(key, value)?,
            "context.injection_denylist" => self.context.injection_denylist = split_list(value),
            "context.background_backfill" => {
                self.context.background_backfill = parse_value(key, value)?
            }

            "scheduler.execution_deadline_secs" => {
                self.scheduler.execution_deadline_secs = parse_positive(key, value)?
            }
            "scheduler.aggregate_timeout_secs" => {
                self.scheduler.aggregate_timeout_secs = parse_positive(key, value)?
            }
            "scheduler.max_workers" => {
                self.scheduler.max_workers = parse_positive(key, value)? as usize
            }

            "storage.database_path" => {
                self.storage.database_path = match value.trim() {
                    "" => None,
                    path => Some(PathBuf::from(path)),
                };
            }

            "llm.api_key" | "api_key" => {
                return Err(anyhow!(
                    "API keys cannot be stored in configuration for security. \
                     Set the DEMIARCH_API_KEY or OPENROUTER_API_KEY environment variable instead."
                ));
            }

            _ => {
                return Err(anyhow!(
                    "Unknown configuration key: {}. Use `demiarch-agents config list` to see available keys.",
                    key
                ));
            }
        }
        Ok(())
    }

    /// List all configuration keys and their values
    pub fn list(&self) -> anyhow::Result<Vec<(String, String)>> {
        KEYS.iter()
            .map(|key| Ok((key.to_string(), self.get(key)?)))
            .collect()
    }

    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(default_database_path)
    }

    pub fn lock_config(&self) -> LockConfig {
        LockConfig::default()
            .with_timeout(Duration::from_secs(self.locks.default_timeout_secs))
            .with_sweep_interval(Duration::from_secs(self.locks.sweep_interval_secs))
    }

    pub fn retriever_config(&self) -> RetrieverConfig {
        RetrieverConfig::default().with_top_k(self.context.top_k)
    }

    /// Built-in markers extended with the configured denylist
    pub fn injection_filter(&self) -> InjectionFilter {
        let mut filter = InjectionFilter::default();
        filter.extend(&self.context.injection_denylist);
        filter
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig::default()
            .with_deadline(Duration::from_secs(self.scheduler.execution_deadline_secs))
            .with_max_context_tokens(self.context.max_tokens)
            .with_max_workers(self.scheduler.max_workers)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig::default()
            .with_aggregate_timeout(Duration::from_secs(self.scheduler.aggregate_timeout_secs))
    }

    pub fn database_config(&self) -> DatabaseConfig {
        DatabaseConfig::with_path(self.database_path())
    }
}
