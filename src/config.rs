use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::engine::DEFAULT_MAX_OUTPUT_BYTES;

/// Configuration file structure for buildwatch.
///
/// Holds the server endpoints and view preferences so they do not have to be
/// repeated on every invocation. Command-line flags and environment variables
/// take precedence over anything loaded here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub waterfall: WaterfallConfig,

    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerConfig {
    /// Base URL of the REST API; `/api/` is appended to it
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Base URL of the websocket endpoints; `/api/socks/` is appended to it
    #[serde(default = "default_ws_url")]
    pub ws_url: String,

    /// Access token sent as a bearer token
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WaterfallConfig {
    /// Streamed output kept per running step
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    /// Redraw the view after every change
    #[serde(default = "default_true")]
    pub redraw: bool,

    /// Show the tail of each step's output under the step
    #[serde(default)]
    pub show_output: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OutputConfig {
    #[serde(default)]
    pub format: OutputFormat,

    /// Pretty-print JSON output
    #[serde(default)]
    pub pretty: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Summary,
    Json,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            ws_url: default_ws_url(),
            token: None,
        }
    }
}

impl Default for WaterfallConfig {
    fn default() -> Self {
        Self {
            max_output_bytes: default_max_output_bytes(),
            redraw: true,
            show_output: false,
        }
    }
}

fn default_api_url() -> String {
    "http://localhost:8888".to_string()
}

fn default_ws_url() -> String {
    "ws://localhost:8888".to_string()
}

fn default_max_output_bytes() -> usize {
    DEFAULT_MAX_OUTPUT_BYTES
}

fn default_true() -> bool {
    true
}

const CANDIDATES: [&str; 4] = [
    "buildwatch.toml",
    "buildwatch.json",
    "buildwatch.yaml",
    "buildwatch.yml",
];

impl Config {
    /// Load configuration from a file.
    ///
    /// Searches for configuration files in this order:
    /// 1. Specified path
    /// 2. ./buildwatch.toml, ./buildwatch.json, ./buildwatch.yaml, ./buildwatch.yml
    /// 3. `<config dir>/buildwatch/config.toml`
    ///
    /// Returns default configuration if no file is found.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load_from_path(path);
        }
        Self::load_from_candidates(Path::new("."), user_config_path().as_deref())
    }

    fn load_from_candidates(dir: &Path, fallback: Option<&Path>) -> Result<Self> {
        for candidate in &CANDIDATES {
            let path = dir.join(candidate);
            if path.exists() {
                return Self::load_from_path(&path);
            }
        }

        if let Some(path) = fallback.filter(|path| path.exists()) {
            return Self::load_from_path(path);
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file path.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or("");

        match extension {
            "toml" => toml::from_str(&contents)
                .with_context(|| format!("Failed to parse TOML config: {}", path.display())),
            "json" => serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse JSON config: {}", path.display())),
            "yaml" | "yml" => serde_yaml::from_str(&contents)
                .with_context(|| format!("Failed to parse YAML config: {}", path.display())),
            _ => toml::from_str(&contents)
                .or_else(|_| serde_json::from_str(&contents))
                .or_else(|_| serde_yaml::from_str(&contents))
                .with_context(|| format!("Failed to parse config file: {}", path.display())),
        }
    }

    /// Save configuration to a file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::to_string_pretty(self)?,
            Some("yaml") | Some("yml") => serde_yaml::to_string(self)?,
            _ => toml::to_string_pretty(self)?,
        };

        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }
}

/// Per-user configuration file, e.g. `~/.config/buildwatch/config.toml`.
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("buildwatch").join("config.toml"))
}
