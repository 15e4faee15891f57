use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::error::{Result, ReviewError};

/// Which transport realization the workflow talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    Api,
    Browser,
}

/// Immutable run configuration, constructed once in the CLI layer and passed
/// by reference. Flags win over `AUTOREVIEW_*` environment fallbacks.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub instructions: PathBuf,
    pub mode: TransportMode,
    pub model: String,
    pub api_timeout_secs: u64,
    pub command: Option<String>,
    pub command_timeout_secs: u64,
    pub iterations: u32,
    pub branch_prefix: String,
    pub remote: String,
    pub push: bool,
    pub auto: bool,
    pub create_pr: bool,
    pub ctx_turn_pairs: usize,
    pub log_tail_bytes: usize,
    pub max_prompt_bytes: usize,
    pub max_patches_per_iteration: u32,
    pub max_error_rounds: u32,
    pub headless: bool,
    pub profile_dir: PathBuf,
    pub webdriver_url: String,
    pub state_dir: String,
}

pub const DEFAULT_STATE_DIR: &str = ".autoreview";
pub const RESUME_FILE: &str = ".autoreview-state.json";

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.parse().ok())
}

fn env_flag(key: &str) -> bool {
    env_string(key)
        .map(|v| !matches!(v.trim().to_lowercase().as_str(), "0" | "false" | "no"))
        .unwrap_or(false)
}

pub fn default_model() -> String {
    env_string("AUTOREVIEW_MODEL").unwrap_or_else(|| "gpt-5-pro".to_string())
}

pub fn default_api_timeout() -> u64 {
    env_parse("AUTOREVIEW_API_TIMEOUT").unwrap_or(120)
}

pub fn default_command_timeout() -> u64 {
    env_parse("AUTOREVIEW_COMMAND_TIMEOUT").unwrap_or(300)
}

pub fn default_iterations() -> u32 {
    env_parse("AUTOREVIEW_ITERATIONS").unwrap_or(3)
}

pub fn default_branch_prefix() -> String {
    env_string("AUTOREVIEW_BRANCH_PREFIX").unwrap_or_else(|| "iteration".to_string())
}

pub fn default_remote() -> String {
    env_string("AUTOREVIEW_REMOTE").unwrap_or_else(|| "origin".to_string())
}

fn default_ctx_turn_pairs() -> usize {
    env_parse("AUTOREVIEW_CTX_TURNS").unwrap_or(6)
}

fn default_log_tail_bytes() -> usize {
    env_parse("AUTOREVIEW_LOG_TAIL_BYTES").unwrap_or(20_000)
}

fn default_max_prompt_bytes() -> usize {
    env_parse("AUTOREVIEW_MAX_PROMPT_BYTES").unwrap_or(200_000)
}

fn default_max_patches() -> u32 {
    env_parse("AUTOREVIEW_MAX_PATCHES").unwrap_or(64)
}

fn default_max_error_rounds() -> u32 {
    env_parse("AUTOREVIEW_MAX_ERROR_ROUNDS").unwrap_or(6)
}

fn default_profile_dir() -> PathBuf {
    env_string("AUTOREVIEW_PROFILE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            std::env::var("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("."))
                .join(".cache")
                .join("autoreview")
                .join("chrome")
        })
}

fn default_webdriver_url() -> String {
    env_string("AUTOREVIEW_WEBDRIVER_URL").unwrap_or_else(|| "http://localhost:9515".to_string())
}

/// Flag values collected by clap; `None` means "fall back to env/default".
#[derive(Debug, Default)]
pub struct ConfigOverrides {
    pub mode: Option<TransportMode>,
    pub model: Option<String>,
    pub api_timeout_secs: Option<u64>,
    pub command: Option<String>,
    pub command_timeout_secs: Option<u64>,
    pub iterations: Option<u32>,
    pub branch_prefix: Option<String>,
    pub remote: Option<String>,
    pub no_push: bool,
    pub auto: bool,
}

impl Config {
    pub fn build(instructions: PathBuf, overrides: ConfigOverrides) -> Result<Self> {
        if !instructions.exists() {
            return Err(ReviewError::InstructionsNotFound(instructions));
        }

        let iterations = overrides.iterations.unwrap_or_else(default_iterations);
        if !(1..=3).contains(&iterations) {
            return Err(ReviewError::Config(format!(
                "iterations must be between 1 and 3 (got {iterations})"
            )));
        }

        let config = Self {
            instructions,
            mode: overrides.mode.unwrap_or(TransportMode::Api),
            model: overrides.model.unwrap_or_else(default_model),
            api_timeout_secs: overrides.api_timeout_secs.unwrap_or_else(default_api_timeout),
            command: overrides.command.or_else(|| env_string("AUTOREVIEW_CMD")),
            command_timeout_secs: overrides
                .command_timeout_secs
                .unwrap_or_else(default_command_timeout),
            iterations,
            branch_prefix: overrides.branch_prefix.unwrap_or_else(default_branch_prefix),
            remote: overrides.remote.unwrap_or_else(default_remote),
            push: !overrides.no_push,
            auto: overrides.auto,
            create_pr: env_flag("AUTOREVIEW_CREATE_PR"),
            ctx_turn_pairs: default_ctx_turn_pairs(),
            log_tail_bytes: default_log_tail_bytes(),
            max_prompt_bytes: default_max_prompt_bytes(),
            max_patches_per_iteration: default_max_patches(),
            max_error_rounds: default_max_error_rounds(),
            headless: env_flag("AUTOREVIEW_HEADLESS"),
            profile_dir: default_profile_dir(),
            webdriver_url: default_webdriver_url(),
            state_dir: DEFAULT_STATE_DIR.to_string(),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(ReviewError::Config("model name is empty".into()));
        }
        if self.api_timeout_secs == 0 {
            return Err(ReviewError::Config("api timeout must be non-zero".into()));
        }
        if self.branch_prefix.trim().is_empty() || self.branch_prefix.contains(char::is_whitespace)
        {
            return Err(ReviewError::Config(format!(
                "invalid branch prefix: {:?}",
                self.branch_prefix
            )));
        }
        Ok(())
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(dir: &tempfile::TempDir, name: &str) -> PathBuf {
        let p = dir.path().join(name);
        std::fs::write(&p, "do the thing\n").unwrap();
        p
    }

    #[test]
    fn flags_win_and_defaults_fill() {
        let dir = tempfile::tempdir().unwrap();
        let instructions = touch(&dir, "instructions.txt");

        let cfg = Config::build(
            instructions,
            ConfigOverrides {
                model: Some("gpt-5-mini".into()),
                iterations: Some(2),
                no_push: true,
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(cfg.model, "gpt-5-mini");
        assert_eq!(cfg.iterations, 2);
        assert!(!cfg.push);
        assert_eq!(cfg.branch_prefix, "iteration");
        assert_eq!(cfg.mode, TransportMode::Api);
    }

    #[test]
    fn iterations_bounds_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let instructions = touch(&dir, "instructions.txt");

        let err = Config::build(
            instructions,
            ConfigOverrides {
                iterations: Some(4),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn missing_instructions_rejected() {
        let err = Config::build(PathBuf::from("/nonexistent/instr.txt"), Default::default())
            .unwrap_err();
        assert!(matches!(err, ReviewError::InstructionsNotFound(_)));
    }
}
