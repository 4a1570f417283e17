use anyhow::{Error, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(version)]
pub struct Cli {
    /// Path to configuration file
    #[clap(long)]
    pub conf: Option<String>,

    /// HTTP listening address
    #[clap(long)]
    pub http: Option<String>,
}

fn default_config_http_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_ws_path_prefix() -> String {
    "/voice".to_string()
}

fn default_stream_timeout() -> String {
    "15s".to_string()
}

pub fn default_greeting_prompt() -> String {
    "A caller just connected. Greet them warmly in one short sentence, in character, \
     and ask how you can help them today."
        .to_string()
}

fn default_llm_base_url() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}

fn default_llm_model() -> String {
    "gemini-2.0-flash".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct LlmConfig {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    pub api_key: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct BackendConfig {
    pub base_url: String,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct PosConfig {
    pub base_url: String,
    pub token_url: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_config_http_addr")]
    pub http_addr: String,

    pub log_level: Option<String>,
    pub log_file: Option<String>,

    /// Path prefix for the voice transport's WebSocket connections.
    #[serde(default = "default_ws_path_prefix")]
    pub ws_path_prefix: String,

    /// Wall-clock bound on the model's first streaming response.
    #[serde(default = "default_stream_timeout")]
    pub stream_timeout: String,

    #[serde(default = "default_greeting_prompt")]
    pub greeting_prompt: String,

    #[serde(default)]
    pub llm: LlmConfig,

    /// Tenant/order backend API. Absent means the in-process store.
    pub backend: Option<BackendConfig>,

    /// POS provider integration. Absent disables catalog sync and order
    /// submission jobs.
    pub pos: Option<PosConfig>,

    /// Where finished-call webhook payloads are relayed, if anywhere.
    pub call_events_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_addr: default_config_http_addr(),
            log_level: None,
            log_file: None,
            ws_path_prefix: default_ws_path_prefix(),
            stream_timeout: default_stream_timeout(),
            greeting_prompt: default_greeting_prompt(),
            llm: LlmConfig::default(),
            backend: None,
            pos: None,
            call_events_url: None,
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self, Error> {
        let config: Self = toml::from_str(
            &std::fs::read_to_string(path).map_err(|e| anyhow::anyhow!("{}: {}", e, path))?,
        )?;
        Ok(config)
    }

    pub fn stream_timeout(&self) -> Duration {
        humantime::parse_duration(&self.stream_timeout)
            .unwrap_or(crate::llm::guarded::DEFAULT_STREAM_TIMEOUT)
    }
}
