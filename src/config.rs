use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub files: FilesConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    /// Private chat ids allowed to talk to the bot. Empty means nobody.
    #[serde(default)]
    pub allowed_chat_ids: Vec<i64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    #[serde(default = "default_engine_binary")]
    pub binary: String,
    /// Model passed with `--model` on attempts that select one explicitly.
    #[serde(default)]
    pub model: String,
    /// Persona line placed at the top of the system preamble.
    #[serde(default = "default_persona")]
    pub persona: String,
    /// Optional MCP server config file handed to the engine on attempts
    /// that keep auxiliary tool servers.
    #[serde(default)]
    pub mcp_config: Option<String>,
    #[serde(default = "default_approval_timeout_secs")]
    pub approval_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary: default_engine_binary(),
            model: String::new(),
            persona: default_persona(),
            mcp_config: None,
            approval_timeout_secs: default_approval_timeout_secs(),
        }
    }
}

fn default_engine_binary() -> String {
    "claude".to_string()
}
fn default_persona() -> String {
    "You are agentbridge, a personal assistant reachable over Telegram.".to_string()
}
fn default_approval_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct JobsConfig {
    #[serde(default = "default_claude_bin")]
    pub claude_bin: String,
    #[serde(default = "default_codex_bin")]
    pub codex_bin: String,
    #[serde(default = "default_gemini_bin")]
    pub gemini_bin: String,
    /// Tail-truncation ceiling for a job's captured output.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    /// Working directory used when a job does not specify one.
    #[serde(default = "default_job_workdir")]
    pub workdir: String,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            claude_bin: default_claude_bin(),
            codex_bin: default_codex_bin(),
            gemini_bin: default_gemini_bin(),
            max_output_bytes: default_max_output_bytes(),
            workdir: default_job_workdir(),
        }
    }
}

fn default_claude_bin() -> String {
    "claude".to_string()
}
fn default_codex_bin() -> String {
    "codex".to_string()
}
fn default_gemini_bin() -> String {
    "gemini".to_string()
}
fn default_max_output_bytes() -> usize {
    16384
}
fn default_job_workdir() -> String {
    ".".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct StateConfig {
    #[serde(default = "default_state_dir")]
    pub dir: String,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: default_state_dir(),
        }
    }
}

fn default_state_dir() -> String {
    "state".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct FilesConfig {
    #[serde(default = "default_inbox_dir")]
    pub inbox_dir: String,
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            inbox_dir: default_inbox_dir(),
            max_file_size_mb: default_max_file_size_mb(),
        }
    }
}

fn default_inbox_dir() -> String {
    "inbox".to_string()
}
fn default_max_file_size_mb() -> u64 {
    20
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Cannot read {}: {}", path.display(), e))?;
        let config: AppConfig = toml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("Cannot parse {}: {}", path.display(), e))?;
        Ok(config)
    }
}
