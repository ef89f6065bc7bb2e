use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use ndarray::Array1;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::chunker::Chunk;
use crate::embedder::Embedder;
use crate::error::{IndexError, RetrievalError};
use crate::utils::ensure_dir;

const INDEX_FILE: &str = "index.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedChunk {
    pub id: Uuid,
    pub chunk: Chunk,
    pub embedding: Array1<f32>,
}

/// Exact cosine-similarity index over embedded chunks, persisted as one JSON file.
#[derive(Debug, Serialize, Deserialize)]
pub struct VectorDB {
    embedder: String,
    entries: Vec<IndexedChunk>,
}

impl VectorDB {
    pub fn new(embedder: &dyn Embedder) -> Self {
        VectorDB {
            embedder: embedder.id(),
            entries: Vec::new(),
        }
    }

    /// Embeds every chunk and returns an in-memory index.
    pub fn build(chunks: Vec<Chunk>, embedder: &dyn Embedder) -> Result<Self, RetrievalError> {
        let mut db = VectorDB::new(embedder);
        db.add_chunks(chunks, embedder)?;
        Ok(db)
    }

    pub fn add_chunks(
        &mut self,
        chunks: Vec<Chunk>,
        embedder: &dyn Embedder,
    ) -> Result<(), RetrievalError> {
        if chunks.is_empty() {
            return Ok(());
        }
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        let embeddings = embedder.embed(&texts)?;
        if embeddings.len() != chunks.len() {
            return Err(RetrievalError::InvalidResponse(format!(
                "{} embeddings for {} chunks",
                embeddings.len(),
                chunks.len()
            )));
        }
        for (chunk, embedding) in chunks.into_iter().zip(embeddings) {
            if let Some(expected) = self.dims() {
                if embedding.len() != expected {
                    return Err(RetrievalError::DimensionMismatch {
                        expected,
                        got: embedding.len(),
                    });
                }
            }
            self.entries.push(IndexedChunk {
                id: Uuid::new_v4(),
                chunk,
                embedding,
            });
        }
        Ok(())
    }

    pub fn index_file(dir: &Path) -> PathBuf {
        dir.join(INDEX_FILE)
    }

    /// Writes the index under `dir`, replacing any previous copy.
    pub fn persist(&self, dir: &Path) -> Result<(), IndexError> {
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| IndexError::Io { path, source }
        };
        ensure_dir(dir).map_err(io_err(dir))?;

        let target = Self::index_file(dir);
        let tmp = dir.join(format!("{INDEX_FILE}.tmp"));
        let file = File::create(&tmp).map_err(io_err(&tmp))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, self).map_err(|source| IndexError::Corrupt {
            path: tmp.clone(),
            source,
        })?;
        writer.flush().map_err(io_err(&tmp))?;
        fs::rename(&tmp, &target).map_err(io_err(&target))?;

        info!("Vector database created and saved to {}", dir.display());
        Ok(())
    }

    /// Reopens a persisted index without re-embedding anything.
    pub fn open(dir: &Path, embedder: &dyn Embedder) -> Result<Self, IndexError> {
        let path = Self::index_file(dir);
        let file = File::open(&path).map_err(|source| IndexError::Io {
            path: path.clone(),
            source,
        })?;
        let db: VectorDB = serde_json::from_reader(BufReader::new(file))
            .map_err(|source| IndexError::Corrupt { path, source })?;

        let active = embedder.id();
        if db.embedder != active {
            return Err(IndexError::EmbedderMismatch {
                stored: db.embedder,
                active,
            });
        }
        info!("Loaded existing vector database from {}", dir.display());
        Ok(db)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn embedder_id(&self) -> &str {
        &self.embedder
    }

    /// Embedding width, known once the index holds at least one entry.
    pub fn dims(&self) -> Option<usize> {
        self.entries.first().map(|e| e.embedding.len())
    }

    /// Returns up to `top_k` entries by descending cosine similarity.
    /// Equal scores keep insertion order.
    pub fn search_similar(
        &self,
        query: &Array1<f32>,
        top_k: usize,
    ) -> Result<Vec<(f32, &IndexedChunk)>, RetrievalError> {
        if let Some(expected) = self.dims() {
            if query.len() != expected {
                return Err(RetrievalError::DimensionMismatch {
                    expected,
                    got: query.len(),
                });
            }
        }

        let mut similarities: Vec<(f32, &IndexedChunk)> = self
            .entries
            .iter()
            .map(|entry| (cosine_similarity(&entry.embedding, query), entry))
            .collect();
        similarities.sort_by(|a, b| b.0.total_cmp(&a.0));
        similarities.truncate(top_k);
        Ok(similarities)
    }
}

fn cosine_similarity(a: &Array1<f32>, b: &Array1<f32>) -> f32 {
    let dot_product = a.dot(b);
    let norm_a = a.dot(a).sqrt();
    let norm_b = b.dot(b).sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot_product / (norm_a * norm_b)
    }
}
