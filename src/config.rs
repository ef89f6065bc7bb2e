use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, ValueEnum};

use crate::chunker::ChunkConfig;
use crate::embedder::{Embedder, HashingEmbedder, OpenAiEmbedder};
use crate::error::ConfigError;
use crate::llm::{Generator, LLMConfig, OpenAiChat};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EmbedderKind {
    /// Hosted OpenAI-compatible embeddings.
    Openai,
    /// Offline feature hashing; no API key needed.
    Hashing,
}

/// Flags shared by every subcommand. Each falls back to an environment
/// variable, which may come from a `.env` file.
#[derive(Args, Debug, Clone)]
pub struct Settings {
    /// API key for the completion and embedding service
    #[arg(long, global = true, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub openai_api_key: Option<String>,

    /// Base URL of the OpenAI-compatible API
    #[arg(long, global = true, env = "PAPERCHAT_OPENAI_BASE", default_value = "https://api.openai.com/v1")]
    pub openai_base_url: String,

    /// Directory holding the paper corpus
    #[arg(long, global = true, env = "PAPERCHAT_DOCS_DIR", default_value = "docs")]
    pub docs_dir: PathBuf,

    /// Directory of the persisted vector index
    #[arg(long, global = true, env = "PAPERCHAT_DB_DIR", default_value = "./research_db")]
    pub db_dir: PathBuf,

    /// Chat model used for answers
    #[arg(long, global = true, env = "PAPERCHAT_CHAT_MODEL", default_value = "gpt-3.5-turbo")]
    pub model: String,

    /// Sampling temperature for answers
    #[arg(long, global = true, env = "PAPERCHAT_TEMPERATURE", default_value_t = 0.7)]
    pub temperature: f32,

    /// Embedding backend
    #[arg(long, global = true, env = "PAPERCHAT_EMBEDDER", value_enum, default_value_t = EmbedderKind::Openai)]
    pub embedder: EmbedderKind,

    /// Embedding model for the openai backend
    #[arg(long, global = true, env = "PAPERCHAT_EMBEDDING_MODEL", default_value = "text-embedding-ada-002")]
    pub embedding_model: String,

    /// Chunks retrieved per question
    #[arg(long, global = true, env = "PAPERCHAT_TOP_K", default_value_t = 5)]
    pub top_k: usize,

    /// Maximum characters per chunk
    #[arg(long, global = true, env = "PAPERCHAT_CHUNK_SIZE", default_value_t = 1000)]
    pub chunk_size: usize,

    /// Characters shared between neighbouring chunks
    #[arg(long, global = true, env = "PAPERCHAT_CHUNK_OVERLAP", default_value_t = 200)]
    pub chunk_overlap: usize,

    /// Past turns included in conversational prompts (0 = all)
    #[arg(long, global = true, env = "PAPERCHAT_HISTORY_TURNS", default_value_t = 10)]
    pub history_turns: usize,

    /// Seconds before a service request times out
    #[arg(long, global = true, env = "PAPERCHAT_TIMEOUT_SECS", default_value_t = 60)]
    pub timeout_secs: u64,

    /// Attempts per service request; 1 disables retries
    #[arg(long, global = true, env = "PAPERCHAT_MAX_ATTEMPTS", default_value_t = 1)]
    pub max_attempts: usize,

    /// Minutes before an idle browser session is forgotten
    #[arg(long, global = true, env = "PAPERCHAT_SESSION_IDLE_MINS", default_value_t = 60)]
    pub session_idle_mins: u64,

    /// Do not rewrite follow-up questions before retrieval
    #[arg(long, global = true)]
    pub no_condense: bool,
}

/// Validated configuration, built once at startup and passed by reference.
#[derive(Debug, Clone)]
pub struct Config {
    api_key: Option<String>,
    pub openai_base_url: String,
    pub docs_dir: PathBuf,
    pub db_dir: PathBuf,
    pub chat: LLMConfig,
    pub embedder: EmbedderKind,
    pub embedding_model: String,
    pub top_k: usize,
    pub chunk: ChunkConfig,
    pub history_turns: usize,
    pub timeout: Duration,
    pub max_attempts: usize,
    pub session_idle: Duration,
    pub condense_questions: bool,
}

impl Config {
    pub fn from_args(settings: Settings) -> Result<Self, ConfigError> {
        let chunk = ChunkConfig::new(settings.chunk_size, settings.chunk_overlap)?;
        if settings.top_k == 0 {
            return Err(ConfigError::Invalid {
                key: "PAPERCHAT_TOP_K",
                message: "must be at least 1".into(),
            });
        }
        if !(0.0..=2.0).contains(&settings.temperature) {
            return Err(ConfigError::Invalid {
                key: "PAPERCHAT_TEMPERATURE",
                message: format!("{} is outside 0.0..=2.0", settings.temperature),
            });
        }
        if settings.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "PAPERCHAT_MAX_ATTEMPTS",
                message: "must be at least 1".into(),
            });
        }
        let api_key = settings
            .openai_api_key
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty());

        Ok(Config {
            api_key,
            openai_base_url: settings.openai_base_url,
            docs_dir: settings.docs_dir,
            db_dir: settings.db_dir,
            chat: LLMConfig {
                model: settings.model,
                temperature: settings.temperature,
            },
            embedder: settings.embedder,
            embedding_model: settings.embedding_model,
            top_k: settings.top_k,
            chunk,
            history_turns: settings.history_turns,
            timeout: Duration::from_secs(settings.timeout_secs),
            max_attempts: settings.max_attempts,
            session_idle: Duration::from_secs(settings.session_idle_mins * 60),
            condense_questions: !settings.no_condense,
        })
    }

    fn api_key(&self) -> Result<&str, ConfigError> {
        self.api_key
            .as_deref()
            .ok_or(ConfigError::Missing("OPENAI_API_KEY"))
    }

    pub fn build_embedder(&self) -> Result<Box<dyn Embedder>, ConfigError> {
        match self.embedder {
            EmbedderKind::Hashing => Ok(Box::new(HashingEmbedder::default())),
            EmbedderKind::Openai => Ok(Box::new(OpenAiEmbedder::new(
                self.api_key()?,
                &self.openai_base_url,
                &self.embedding_model,
                self.timeout,
                self.max_attempts,
            )?)),
        }
    }

    pub fn build_generator(&self) -> Result<Box<dyn Generator>, ConfigError> {
        Ok(Box::new(OpenAiChat::new(
            self.api_key()?,
            &self.openai_base_url,
            self.timeout,
            self.max_attempts,
        )?))
    }
}

/// Parses a listen address for the web front end.
pub fn parse_bind(raw: &str) -> Result<SocketAddr, ConfigError> {
    raw.parse().map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
        key: "PAPERCHAT_BIND",
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        settings: Settings,
    }

    fn settings(args: &[&str]) -> Settings {
        let mut argv = vec!["paperchat"];
        argv.extend_from_slice(args);
        TestCli::parse_from(argv).settings
    }

    #[test]
    fn test_defaults_match_original_setup() -> anyhow::Result<()> {
        let config = Config::from_args(settings(&["--openai-api-key", "sk-test"]))?;
        assert_eq!(config.chunk, ChunkConfig::new(1000, 200)?);
        assert_eq!(config.top_k, 5);
        assert_eq!(config.chat, LLMConfig::default());
        assert_eq!(config.db_dir, PathBuf::from("./research_db"));
        assert!(config.condense_questions);
        Ok(())
    }

    #[test]
    fn test_invalid_chunking_is_rejected() {
        let err = Config::from_args(settings(&["--chunk-size", "100", "--chunk-overlap", "100"]));
        assert!(matches!(err, Err(ConfigError::Chunk(_))));
    }

    #[test]
    fn test_missing_key_is_fatal_for_hosted_services() -> anyhow::Result<()> {
        let mut raw = settings(&[]);
        raw.openai_api_key = Some("   ".into());
        let config = Config::from_args(raw)?;
        assert!(matches!(config.build_generator(), Err(ConfigError::Missing("OPENAI_API_KEY"))));
        assert!(matches!(config.build_embedder(), Err(ConfigError::Missing(_))));
        Ok(())
    }

    #[test]
    fn test_hashing_embedder_needs_no_key() -> anyhow::Result<()> {
        let mut raw = settings(&["--embedder", "hashing"]);
        raw.openai_api_key = None;
        let config = Config::from_args(raw)?;
        assert_eq!(config.build_embedder()?.id(), "hashing:512");
        Ok(())
    }

    #[test]
    fn test_zero_attempts_is_rejected() {
        let err = Config::from_args(settings(&["--max-attempts", "0"]));
        assert!(matches!(err, Err(ConfigError::Invalid { key: "PAPERCHAT_MAX_ATTEMPTS", .. })));
    }

    #[test]
    fn test_bind_address() {
        assert!(parse_bind("127.0.0.1:8501").is_ok());
        assert!(matches!(parse_bind("localhost"), Err(ConfigError::Invalid { .. })));
    }
}
