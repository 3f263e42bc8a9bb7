use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::normalize::ChunkMethod;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub tasks: TasksConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LimitsConfig {
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: usize,
    #[serde(default = "default_min_text_chars")]
    pub min_text_chars: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: default_max_file_bytes(),
            min_text_chars: default_min_text_chars(),
        }
    }
}

fn default_max_file_bytes() -> usize {
    50 * 1024 * 1024
}
fn default_min_text_chars() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_overlap")]
    pub overlap: usize,
    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: usize,
    #[serde(default = "default_method")]
    pub method: ChunkMethod,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            overlap: default_overlap(),
            min_chunk_size: default_min_chunk_size(),
            method: default_method(),
        }
    }
}

fn default_chunk_size() -> usize {
    800
}
fn default_overlap() -> usize {
    100
}
fn default_min_chunk_size() -> usize {
    100
}
fn default_method() -> ChunkMethod {
    ChunkMethod::Recursive
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_questions_per_chunk")]
    pub questions_per_chunk: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_prompt_chars")]
    pub max_prompt_chars: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            questions_per_chunk: default_questions_per_chunk(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            timeout_secs: default_timeout_secs(),
            max_prompt_chars: default_max_prompt_chars(),
        }
    }
}

fn default_base_url() -> String {
    "https://api.deepseek.com/v1".to_string()
}
fn default_model() -> String {
    "deepseek-chat".to_string()
}
fn default_api_key_env() -> String {
    "DEEPSEEK_API_KEY".to_string()
}
fn default_questions_per_chunk() -> usize {
    2
}
fn default_max_retries() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_backoff_multiplier() -> u32 {
    2
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_prompt_chars() -> usize {
    2000
}

#[derive(Debug, Deserialize, Clone)]
pub struct TasksConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_progress_grace_secs")]
    pub progress_grace_secs: u64,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            progress_grace_secs: default_progress_grace_secs(),
        }
    }
}

fn default_max_concurrent() -> usize {
    4
}
fn default_progress_grace_secs() -> u64 {
    300
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.chunking.chunk_size == 0 {
        anyhow::bail!("chunking.chunk_size must be > 0");
    }
    if config.chunking.overlap >= config.chunking.chunk_size {
        anyhow::bail!("chunking.overlap must be smaller than chunking.chunk_size");
    }
    if config.chunking.min_chunk_size > config.chunking.chunk_size {
        anyhow::bail!("chunking.min_chunk_size must not exceed chunking.chunk_size");
    }
    if config.generation.questions_per_chunk == 0 || config.generation.questions_per_chunk > 10 {
        anyhow::bail!("generation.questions_per_chunk must be in 1..=10");
    }
    if config.generation.backoff_multiplier == 0 {
        anyhow::bail!("generation.backoff_multiplier must be >= 1");
    }
    if config.tasks.max_concurrent == 0 {
        anyhow::bail!("tasks.max_concurrent must be >= 1");
    }
    if config.limits.max_file_bytes == 0 {
        anyhow::bail!("limits.max_file_bytes must be > 0");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> Config {
        toml::from_str(toml_str).unwrap()
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let config = parse("[db]\npath = \"/tmp/bankgen.sqlite\"\n");
        assert_eq!(config.limits.max_file_bytes, 50 * 1024 * 1024);
        assert_eq!(config.limits.min_text_chars, 100);
        assert_eq!(config.chunking.chunk_size, 800);
        assert_eq!(config.chunking.overlap, 100);
        assert_eq!(config.chunking.method, ChunkMethod::Recursive);
        assert_eq!(config.generation.questions_per_chunk, 2);
        assert_eq!(config.generation.max_retries, 3);
        assert_eq!(config.generation.timeout_secs, 30);
        assert_eq!(config.tasks.max_concurrent, 4);
        assert_eq!(config.tasks.progress_grace_secs, 300);
        validate(&config).unwrap();
    }

    #[test]
    fn overlap_must_be_smaller_than_chunk_size() {
        let config = parse(
            "[db]\npath = \"/tmp/x.sqlite\"\n[chunking]\nchunk_size = 100\noverlap = 100\n",
        );
        assert!(validate(&config).is_err());
    }

    #[test]
    fn questions_per_chunk_bounds() {
        let config = parse(
            "[db]\npath = \"/tmp/x.sqlite\"\n[generation]\nquestions_per_chunk = 0\n",
        );
        assert!(validate(&config).is_err());
    }

    #[test]
    fn method_parses_from_toml() {
        let config = parse("[db]\npath = \"/tmp/x.sqlite\"\n[chunking]\nmethod = \"fixed\"\n");
        assert_eq!(config.chunking.method, ChunkMethod::Fixed);
    }
}
