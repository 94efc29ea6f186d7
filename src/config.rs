use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::suggestion::Delimiters;

// ── Profile ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    /// Base URL of the generate server
    pub endpoint: String,
    /// Model identifier sent with every request
    pub model: String,
    /// Optional API key (sent as Bearer token)
    pub api_key: Option<String>,
    /// Stream tokens as they arrive. When false the whole reply is fetched in
    /// one request and inserted at once.
    #[serde(default = "default_stream")]
    pub stream: bool,
    /// Directory suggestions are applied under. Default: the working directory.
    #[serde(default)]
    pub project_root: Option<PathBuf>,
    /// Outer markers the model is asked to wrap suggestions in.
    /// Set both to "" to ask for bare blocks.
    #[serde(default = "default_suggestion_open")]
    pub suggestion_open: String,
    #[serde(default = "default_suggestion_close")]
    pub suggestion_close: String,
    /// Log file. Default: $XDG_STATE_HOME/oxchat/oxchat.log
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

fn default_stream() -> bool {
    true
}

fn default_suggestion_open() -> String {
    "<<<SUGGESTION".to_string()
}

fn default_suggestion_close() -> String {
    "SUGGESTION>>>".to_string()
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:11434".to_string(),
            model: "llama3".to_string(),
            api_key: None,
            stream: default_stream(),
            project_root: None,
            suggestion_open: default_suggestion_open(),
            suggestion_close: default_suggestion_close(),
            log_file: None,
        }
    }
}

// ── Config file ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConfigFile {
    /// Which profile to use when none is specified
    #[serde(default = "default_profile_name")]
    pub default_profile: String,

    #[serde(default)]
    pub profiles: HashMap<String, Profile>,
}

fn default_profile_name() -> String {
    "default".to_string()
}

impl ConfigFile {
    /// Load from disk, or return a default config if the file doesn't exist yet.
    pub fn load() -> Result<Self> {
        Self::load_from(&config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file at {}", path.display()))
    }

    /// Write a starter config file to disk (only if it doesn't exist).
    pub fn write_default_if_missing() -> Result<PathBuf> {
        let path = config_path();
        if path.exists() {
            return Ok(path);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, DEFAULT_CONFIG_TOML)?;
        Ok(path)
    }

    /// Resolve the active profile given an optional override name.
    pub fn resolve_profile(&self, name: Option<&str>) -> Option<&Profile> {
        let key = name.unwrap_or(&self.default_profile);
        self.profiles.get(key)
    }
}

// ── Command-line overrides ────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct Overrides<'a> {
    pub profile: Option<&'a str>,
    pub endpoint: Option<&'a str>,
    pub model: Option<&'a str>,
    pub api_key: Option<&'a str>,
    pub no_stream: bool,
}

// ── Resolved runtime config (after merging file + CLI overrides) ──────────────

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    /// Profile name that was resolved (for display)
    pub profile_name: String,
    pub stream: bool,
    pub project_root: PathBuf,
    /// None when the profile asks for bare blocks
    pub delimiters: Option<Delimiters>,
    pub log_file: Option<PathBuf>,
}

impl ResolvedConfig {
    /// Merge config file profile with CLI overrides.
    /// Priority: CLI args > env vars (handled by clap) > config file profile > built-in defaults
    pub fn resolve(file: &ConfigFile, overrides: &Overrides<'_>) -> Self {
        let profile_name = overrides
            .profile
            .unwrap_or(&file.default_profile)
            .to_string();

        let base = file
            .resolve_profile(overrides.profile)
            .cloned()
            .unwrap_or_default();

        let delimiters = (!base.suggestion_open.is_empty() && !base.suggestion_close.is_empty())
            .then(|| Delimiters::new(base.suggestion_open, base.suggestion_close));

        Self {
            endpoint: overrides
                .endpoint
                .map(str::to_string)
                .unwrap_or(base.endpoint),
            model: overrides
                .model
                .map(str::to_string)
                .unwrap_or(base.model),
            api_key: overrides
                .api_key
                .map(str::to_string)
                .or(base.api_key),
            profile_name,
            stream: base.stream && !overrides.no_stream,
            project_root: base
                .project_root
                .unwrap_or_else(|| PathBuf::from(".")),
            delimiters,
            log_file: base.log_file,
        }
    }

    pub fn log_path(&self) -> PathBuf {
        self.log_file.clone().unwrap_or_else(default_log_path)
    }
}

// ── Paths ─────────────────────────────────────────────────────────────────────

pub fn config_path() -> PathBuf {
    dirs_config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("oxchat")
        .join("config.toml")
}

fn dirs_config_dir() -> Option<PathBuf> {
    // XDG_CONFIG_HOME or ~/.config
    std::env::var("XDG_CONFIG_HOME")
        .ok()
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join(".config"))
        })
}

pub fn default_log_path() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .ok()
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join(".local").join("state"))
        })
        .unwrap_or_else(|| PathBuf::from("."))
        .join("oxchat")
        .join("oxchat.log")
}

// ── Default config template written on --init ─────────────────────────────────

const DEFAULT_CONFIG_TOML: &str = r#"# oxchat configuration
# Run `oxchat --init` to regenerate this file.

default_profile = "local"

# ── Local Ollama (default) ────────────────────────────────────────────────────
[profiles.local]
endpoint = "http://localhost:11434"
model    = "llama3"
stream   = true
# api_key is not needed for Ollama

# ── Another local model example ───────────────────────────────────────────────
# [profiles.coder]
# endpoint = "http://localhost:11434"
# model    = "qwen2.5-coder:7b"

# ── Remote server behind a proxy that checks a token ─────────────────────────
# [profiles.lab]
# endpoint = "http://10.0.0.12:11434"
# model    = "llama3:70b"
# api_key  = "..."
# stream   = false

# ── Suggestions (optional, per-profile) ──────────────────────────────────────
# project_root     = "/home/me/src/project"   # where suggestions are applied
# suggestion_open  = "<<<SUGGESTION"          # "" for bare FILE/BEFORE/AFTER blocks
# suggestion_close = "SUGGESTION>>>"

# ── Logging ──────────────────────────────────────────────────────────────────
# log_file = "/tmp/oxchat.log"                 # filter with OXCHAT_LOG=debug
"#;
