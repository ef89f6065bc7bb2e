//! Error types for every stage of the question-answering pipeline.

use std::path::PathBuf;

use thiserror::Error;

/// A source file that could not be read or parsed.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse PDF {path}: {message}")]
    Pdf { path: PathBuf, message: String },

    #[error("no reader registered for {0}")]
    Unsupported(PathBuf),
}

/// Invalid chunking parameters.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("chunk size must be greater than zero")]
    ZeroSize,

    #[error("chunk overlap ({overlap}) must be smaller than chunk size ({size})")]
    OverlapTooLarge { size: usize, overlap: usize },
}

/// Embedding or index-lookup failure.
#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("embedding request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("embedding service returned {status}: {body}")]
    Service { status: u16, body: String },

    #[error("invalid embedding response: {0}")]
    InvalidResponse(String),

    #[error("query embedding has {got} dimensions, index expects {expected}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// Completion-service failure.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("completion request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("completion service returned {status}: {body}")]
    Service { status: u16, body: String },

    #[error("invalid completion response: {0}")]
    InvalidResponse(String),

    #[error("prompt cannot be empty")]
    EmptyPrompt,
}

/// Missing or malformed startup configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },

    #[error(transparent)]
    Chunk(#[from] ChunkError),
}

/// Failure while building, persisting, or reopening the vector index.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("index I/O at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt index file {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("index was built with embedder '{stored}', but '{active}' is configured")]
    EmbedderMismatch { stored: String, active: String },

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Retrieval(#[from] RetrievalError),
}

/// A failed question-answering turn.
#[derive(Debug, Error)]
pub enum QaError {
    #[error("query cannot be empty")]
    EmptyQuery,

    #[error(transparent)]
    Retrieval(#[from] RetrievalError),

    #[error(transparent)]
    Generation(#[from] GenerationError),
}
