//! Runtime configuration.
//!
//! Loaded once at process start from `~/.stagewatch/config.toml` (missing file
//! means defaults), then individual fields may be overridden by environment
//! variables. The result is immutable for the life of the process.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, WatchError};

const STATE_DIR_NAME: &str = ".stagewatch";
const CONFIG_FILE_NAME: &str = "config.toml";
const DEFAULT_DB_FILE_NAME: &str = "inventory_events.db";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Consecutive discrepant frames required before an alert fires.
    #[serde(default = "default_debounce_k")]
    pub debounce_k: u32,
    #[serde(default = "default_cooldown_sec")]
    pub cooldown_sec: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            debounce_k: default_debounce_k(),
            cooldown_sec: default_cooldown_sec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionConfig {
    #[serde(default = "default_tracked_class")]
    pub tracked_class: String,
    #[serde(default = "default_conf_threshold")]
    pub conf_threshold: f32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            tracked_class: default_tracked_class(),
            conf_threshold: default_conf_threshold(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    #[serde(default = "default_observation_every")]
    pub observation_every: u64,
    #[serde(default = "default_agent_every_n_frames")]
    pub agent_every_n_frames: u64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            observation_every: default_observation_every(),
            agent_every_n_frames: default_agent_every_n_frames(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    /// Model used for alert sentences.
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_llm_timeout_sec")]
    pub timeout_sec: f64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            timeout_sec: default_llm_timeout_sec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Fine-tuned model served by the same endpoint as [`LlmConfig`].
    #[serde(default = "default_agent_model")]
    pub model: String,
    #[serde(default = "default_agent_timeout_sec")]
    pub timeout_sec: f64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            model: default_agent_model(),
            timeout_sec: default_agent_timeout_sec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertConfig {
    #[serde(default = "default_salutation")]
    pub salutation: String,
    #[serde(default = "default_object_noun")]
    pub object_noun: String,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            salutation: default_salutation(),
            object_noun: default_object_noun(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub sqlite_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WatchConfig {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub sampling: SamplingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub alert: AlertConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl WatchConfig {
    /// Resolves the SQLite path, falling back to the state directory.
    pub fn sqlite_path(&self) -> Result<PathBuf> {
        match &self.storage.sqlite_path {
            Some(path) => Ok(path.clone()),
            None => Ok(state_dir()?.join(DEFAULT_DB_FILE_NAME)),
        }
    }

    /// Applies environment overrides. Unparseable values are skipped with a
    /// warning so a typo never prevents startup.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        override_parsed(&lookup, "DEBOUNCE_K", &mut self.session.debounce_k);
        override_parsed(&lookup, "COOLDOWN_SEC", &mut self.session.cooldown_sec);
        override_parsed(&lookup, "CONF_THRESHOLD", &mut self.detection.conf_threshold);
        override_string(&lookup, "TRACKED_CLASS", &mut self.detection.tracked_class);
        override_parsed(
            &lookup,
            "OBS_SAMPLE_EVERY",
            &mut self.sampling.observation_every,
        );
        override_parsed(
            &lookup,
            "AGENT_EVERY_N_FRAMES",
            &mut self.sampling.agent_every_n_frames,
        );
        if let Some(raw) = lookup("AGENT_ENABLED") {
            self.agent.enabled = parse_env_bool(&raw);
        }
        override_string(&lookup, "AGENT_MODEL", &mut self.agent.model);
        override_parsed(&lookup, "AGENT_TIMEOUT_SEC", &mut self.agent.timeout_sec);
        override_string(&lookup, "OLLAMA_BASE_URL", &mut self.llm.base_url);
        override_string(&lookup, "OLLAMA_MODEL", &mut self.llm.model);
        override_parsed(&lookup, "OLLAMA_TIMEOUT_SEC", &mut self.llm.timeout_sec);
        override_string(&lookup, "ALERT_SALUTATION", &mut self.alert.salutation);
        override_string(&lookup, "ALERT_OBJECT_NOUN", &mut self.alert.object_noun);
        if let Some(raw) = lookup("SQLITE_PATH") {
            if !raw.trim().is_empty() {
                self.storage.sqlite_path = Some(PathBuf::from(raw.trim()));
            }
        }
    }
}

/// Returns the per-user state directory (`~/.stagewatch`).
pub fn state_dir() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(STATE_DIR_NAME))
        .ok_or(WatchError::HomeDirNotFound)
}

pub fn default_config_path() -> Result<PathBuf> {
    Ok(state_dir()?.join(CONFIG_FILE_NAME))
}

/// Loads the config file (defaults when absent) and applies process env overrides.
pub fn load_config(path: Option<PathBuf>) -> Result<WatchConfig> {
    let config_path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };
    let mut config = load_config_file(&config_path)?;
    config.apply_env_overrides(|key| std::env::var(key).ok());
    Ok(config)
}

pub fn load_config_file(path: &Path) -> Result<WatchConfig> {
    if !path.exists() {
        return Ok(WatchConfig::default());
    }
    let content = fs_err::read_to_string(path).map_err(|source| WatchError::ConfigRead {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str::<WatchConfig>(&content).map_err(|err| WatchError::ConfigMalformed {
        path: path.to_path_buf(),
        details: err.to_string(),
    })
}

pub fn parse_env_bool(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn override_parsed<F, T>(lookup: &F, key: &str, target: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *target = value,
        Err(_) => tracing::warn!(key, value = %raw, "Ignoring unparseable config override"),
    }
}

fn override_string<F>(lookup: &F, key: &str, target: &mut String)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(key) {
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            *target = trimmed.to_string();
        }
    }
}

fn default_debounce_k() -> u32 {
    5
}

fn default_cooldown_sec() -> u64 {
    10
}

fn default_tracked_class() -> String {
    "cup".to_string()
}

fn default_conf_threshold() -> f32 {
    0.20
}

fn default_observation_every() -> u64 {
    3
}

fn default_agent_every_n_frames() -> u64 {
    10
}

fn default_llm_base_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_llm_model() -> String {
    "gemma2:2b".to_string()
}

fn default_llm_timeout_sec() -> f64 {
    2.5
}

fn default_agent_model() -> String {
    "stagewatch-gemma".to_string()
}

fn default_agent_timeout_sec() -> f64 {
    60.0
}

fn default_salutation() -> String {
    "Mr. Richard".to_string()
}

fn default_object_noun() -> String {
    "chair".to_string()
}
