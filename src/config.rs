use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dirs::config_dir;
use serde::{Deserialize, Serialize};

use crate::decompose::{Decomposer, HttpSuggester};
use crate::lifecycle::hooks::Collaborators;
use crate::models::OrchestrationMode;
use crate::orchestrator::{
    OrchestratorConfig, DEFAULT_CAPACITY, DEFAULT_ESCALATE_AFTER_HOURS, DEFAULT_LOCK_STALE_SECS,
};

const APP_NAME: &str = "epicflow";
const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Registry database file. Defaults to the platform data directory.
    pub db_path: Option<PathBuf>,
    /// Maximum number of features in capacity-consuming stages.
    pub capacity: usize,
    pub mode: OrchestrationMode,
    pub hook_timeout_secs: u64,
    /// Shell command run by the `test` hook. Without one, tests are assumed green.
    pub test_command: Option<String>,
    pub suggester_url: Option<String>,
    pub suggester_timeout_secs: u64,
    /// Pause between passes of `orchestrate --watch`.
    pub interval_secs: u64,
    pub escalate_after_hours: i64,
    pub lock_stale_secs: i64,
    pub api_key: Option<String>,
    pub cors_origins: Option<Vec<String>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: None,
            capacity: DEFAULT_CAPACITY,
            mode: OrchestrationMode::Suggest,
            hook_timeout_secs: 300,
            test_command: None,
            suggester_url: None,
            suggester_timeout_secs: 30,
            interval_secs: 300,
            escalate_after_hours: DEFAULT_ESCALATE_AFTER_HOURS,
            lock_stale_secs: DEFAULT_LOCK_STALE_SECS,
            api_key: None,
            cors_origins: None,
        }
    }
}

impl Config {
    /// Load the config file, then apply `EPICFLOW_*` environment overrides.
    /// A missing or unreadable file yields defaults.
    pub fn load() -> Self {
        let mut config = match Self::try_load() {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), "failed to load config, using defaults");
                Self::default()
            }
        };
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    fn try_load() -> Result<Self> {
        let config_path = config_path()?;
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("failed to read {}", config_path.display()))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("failed to parse config file")
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value.
    /// Unparseable values are ignored with a warning.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(path) = var("EPICFLOW_DB") {
            self.db_path = Some(PathBuf::from(path));
        }
        parse_into(&var, "EPICFLOW_CAPACITY", &mut self.capacity);
        parse_into(&var, "EPICFLOW_MODE", &mut self.mode);
        parse_into(&var, "EPICFLOW_HOOK_TIMEOUT_SECS", &mut self.hook_timeout_secs);
        if let Some(command) = var("EPICFLOW_TEST_COMMAND") {
            self.test_command = Some(command);
        }
        if let Some(url) = var("EPICFLOW_SUGGESTER_URL") {
            self.suggester_url = Some(url);
        }
        parse_into(&var, "EPICFLOW_SUGGESTER_TIMEOUT_SECS", &mut self.suggester_timeout_secs);
        parse_into(&var, "EPICFLOW_INTERVAL_SECS", &mut self.interval_secs);
        parse_into(&var, "EPICFLOW_ESCALATE_AFTER_HOURS", &mut self.escalate_after_hours);
        if let Some(key) = var("EPICFLOW_API_KEY") {
            self.api_key = Some(key);
        }
        if let Some(origins) = var("EPICFLOW_CORS_ORIGINS") {
            self.cors_origins = Some(origins.split(',').map(|s| s.trim().to_string()).collect());
        }
    }

    pub fn hook_timeout(&self) -> Duration {
        Duration::from_secs(self.hook_timeout_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            escalate_after: chrono::Duration::hours(self.escalate_after_hours),
            lock_stale_after: chrono::Duration::seconds(self.lock_stale_secs),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators::local(self.test_command.clone())
    }

    pub fn decomposer(&self) -> Decomposer {
        match &self.suggester_url {
            Some(url) => Decomposer::with_suggester(Arc::new(HttpSuggester::new(
                url.clone(),
                Duration::from_secs(self.suggester_timeout_secs),
            ))),
            None => Decomposer::new(),
        }
    }
}

fn parse_into<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, target: &mut T) {
    if let Some(raw) = var(key) {
        match raw.trim().parse() {
            Ok(value) => *target = value,
            Err(_) => tracing::warn!(key, value = %raw, "ignoring invalid environment override"),
        }
    }
}

fn config_path() -> Result<PathBuf> {
    let mut path =
        config_dir().ok_or_else(|| anyhow::anyhow!("could not determine config directory"))?;
    path.push(APP_NAME);
    path.push(CONFIG_FILE);
    Ok(path)
}
