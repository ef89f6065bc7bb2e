//! Text embedding backends.

use std::hash::{Hash, Hasher};
use std::thread;
use std::time::Duration;

use lazy_static::lazy_static;
use ndarray::Array1;
use regex::Regex;
use reqwest::StatusCode;
use reqwest::blocking::{Client, ClientBuilder};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use rustc_hash::{FxHashSet, FxHasher};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use unicode_normalization::UnicodeNormalization;

use crate::error::{ConfigError, RetrievalError};

/// Turns text into vectors comparable by cosine similarity.
pub trait Embedder: Send + Sync {
    /// Stable identifier recorded in persisted indexes, e.g. `openai:text-embedding-ada-002`.
    fn id(&self) -> String;

    fn embed(&self, texts: &[&str]) -> Result<Vec<Array1<f32>>, RetrievalError>;

    fn embed_query(&self, text: &str) -> Result<Array1<f32>, RetrievalError> {
        self.embed(&[text])?
            .pop()
            .ok_or_else(|| RetrievalError::InvalidResponse("no embedding returned for query".into()))
    }
}

/// Blocking client for OpenAI-compatible `/embeddings` endpoints.
pub struct OpenAiEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    max_attempts: usize,
    batch_size: usize,
}

impl OpenAiEmbedder {
    pub fn new(
        api_key: &str,
        base_url: &str,
        model: &str,
        timeout: Duration,
        max_attempts: usize,
    ) -> Result<Self, ConfigError> {
        let client = api_client(api_key, timeout)?
            .build()
            .map_err(|e| ConfigError::Invalid {
                key: "PAPERCHAT_OPENAI_BASE",
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self::with_client(client, base_url, model, max_attempts))
    }

    pub fn with_client(client: Client, base_url: &str, model: &str, max_attempts: usize) -> Self {
        OpenAiEmbedder {
            client,
            endpoint: format!("{}/embeddings", base_url.trim_end_matches('/')),
            model: model.to_string(),
            max_attempts: max_attempts.max(1),
            batch_size: 64,
        }
    }

    fn embed_batch(&self, inputs: &[&str]) -> Result<Vec<Array1<f32>>, RetrievalError> {
        let request = EmbeddingRequest {
            model: &self.model,
            input: inputs,
        };
        let mut attempt = 0;
        loop {
            attempt += 1;
            let retry = attempt < self.max_attempts;
            let resp = match self.client.post(&self.endpoint).json(&request).send() {
                Ok(resp) => resp,
                Err(e) if retry && (e.is_timeout() || e.is_connect()) => {
                    warn!(attempt, error = %e, "embedding request failed, retrying");
                    thread::sleep(backoff(attempt));
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let status = resp.status();
            if !status.is_success() {
                let body = resp
                    .text()
                    .unwrap_or_else(|_| "<body unavailable>".to_string());
                if retry && is_transient(status) {
                    warn!(attempt, %status, "embedding service busy, retrying");
                    thread::sleep(backoff(attempt));
                    continue;
                }
                return Err(RetrievalError::Service {
                    status: status.as_u16(),
                    body,
                });
            }

            let mut parsed: EmbeddingResponse = resp
                .json()
                .map_err(|e| RetrievalError::InvalidResponse(e.to_string()))?;
            if parsed.data.len() != inputs.len() {
                return Err(RetrievalError::InvalidResponse(format!(
                    "{} embeddings returned for {} inputs",
                    parsed.data.len(),
                    inputs.len()
                )));
            }
            parsed.data.sort_by_key(|entry| entry.index);
            return Ok(parsed
                .data
                .into_iter()
                .map(|entry| Array1::from(entry.embedding))
                .collect());
        }
    }
}

impl Embedder for OpenAiEmbedder {
    fn id(&self) -> String {
        format!("openai:{}", self.model)
    }

    fn embed(&self, texts: &[&str]) -> Result<Vec<Array1<f32>>, RetrievalError> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            debug!(batch = batch.len(), "embedding batch");
            out.extend(self.embed_batch(batch)?);
        }
        Ok(out)
    }
}

/// Client builder carrying the bearer key and JSON content type.
pub(crate) fn api_client(api_key: &str, timeout: Duration) -> Result<ClientBuilder, ConfigError> {
    let api_key = api_key.trim();
    if api_key.is_empty() {
        return Err(ConfigError::Missing("OPENAI_API_KEY"));
    }
    let mut headers = HeaderMap::new();
    let auth = HeaderValue::from_str(&format!("Bearer {api_key}")).map_err(|e| {
        ConfigError::Invalid {
            key: "OPENAI_API_KEY",
            message: e.to_string(),
        }
    })?;
    headers.insert(AUTHORIZATION, auth);
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(Client::builder().timeout(timeout).default_headers(headers))
}

pub(crate) fn is_transient(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

pub(crate) fn backoff(attempt: usize) -> Duration {
    let capped = attempt.min(5) as u32;
    Duration::from_millis(500 * (1 << capped))
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

lazy_static! {
    static ref STOP_WORDS: FxHashSet<&'static str> = [
        "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "has", "he", "in",
        "is", "it", "its", "of", "on", "that", "the", "to", "was", "were", "will", "with",
    ]
    .into_iter()
    .collect();
    static ref NON_WORD: Regex = Regex::new(r"[^\w\s]").unwrap();
}

/// Offline embedder: signed feature hashing over normalised word tokens.
pub struct HashingEmbedder {
    dims: usize,
}

impl HashingEmbedder {
    pub fn new(dims: usize) -> Self {
        HashingEmbedder { dims: dims.max(1) }
    }

    fn tokenize(text: &str) -> Vec<String> {
        let text = text.nfc().collect::<String>().to_lowercase();
        NON_WORD
            .replace_all(&text, " ")
            .split_whitespace()
            .filter(|token| !STOP_WORDS.contains(token))
            .map(str::to_string)
            .collect()
    }

    fn vectorize(&self, text: &str) -> Array1<f32> {
        let mut v = Array1::<f32>::zeros(self.dims);
        for token in Self::tokenize(text) {
            let mut hasher = FxHasher::default();
            token.hash(&mut hasher);
            let h = hasher.finish();
            let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
            v[(h % self.dims as u64) as usize] += sign;
        }
        let norm = v.dot(&v).sqrt();
        if norm > 0.0 {
            v /= norm;
        }
        v
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        HashingEmbedder::new(512)
    }
}

impl Embedder for HashingEmbedder {
    fn id(&self) -> String {
        format!("hashing:{}", self.dims)
    }

    fn embed(&self, texts: &[&str]) -> Result<Vec<Array1<f32>>, RetrievalError> {
        Ok(texts.iter().map(|text| self.vectorize(text)).collect())
    }
}
