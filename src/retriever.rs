use std::path::Path;

use tracing::{debug, info};

use crate::chunker::{Chunk, ChunkConfig, split_documents};
use crate::embedder::Embedder;
use crate::error::{IndexError, RetrievalError};
use crate::loader::Loader;
use crate::utils::preview;
use crate::vector_db::VectorDB;

/// How the index behind a [`Retriever`] came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOrigin {
    /// Reopened from disk.
    Loaded,
    /// No persisted index existed, so one was built from the corpus.
    Built { papers: usize, chunks: usize },
}

/// Ingests `docs_dir`, chunks it and embeds every chunk.
pub fn build_index(
    docs_dir: &Path,
    chunk_config: ChunkConfig,
    embedder: &dyn Embedder,
    loader: &Loader,
) -> Result<(VectorDB, usize), IndexError> {
    let corpus = loader.load_directory(docs_dir)?;
    let chunks = split_documents(&corpus.documents, chunk_config);
    let db = VectorDB::build(chunks, embedder)?;
    Ok((db, corpus.papers))
}

pub struct Retriever {
    db: VectorDB,
    embedder: Box<dyn Embedder>,
    top_k: usize,
}

impl Retriever {
    pub fn new(db: VectorDB, embedder: Box<dyn Embedder>, top_k: usize) -> Self {
        Retriever {
            db,
            embedder,
            top_k,
        }
    }

    /// Opens the index persisted at `db_dir`, or builds and persists one from
    /// `docs_dir` when that directory does not exist yet.
    pub fn open_or_build(
        db_dir: &Path,
        docs_dir: &Path,
        chunk_config: ChunkConfig,
        embedder: Box<dyn Embedder>,
        top_k: usize,
    ) -> Result<(Self, IndexOrigin), IndexError> {
        if db_dir.exists() {
            let db = VectorDB::open(db_dir, embedder.as_ref())?;
            return Ok((Retriever::new(db, embedder, top_k), IndexOrigin::Loaded));
        }

        info!(
            "No database found at {}. Creating a new one...",
            db_dir.display()
        );
        let (db, papers) = build_index(docs_dir, chunk_config, embedder.as_ref(), &Loader::default())?;
        db.persist(db_dir)?;
        let origin = IndexOrigin::Built {
            papers,
            chunks: db.len(),
        };
        Ok((Retriever::new(db, embedder, top_k), origin))
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    pub fn index_len(&self) -> usize {
        self.db.len()
    }

    /// Up to `k` chunks nearest to `query`, most similar first.
    pub fn retrieve(&self, query: &str, k: usize) -> Result<Vec<Chunk>, RetrievalError> {
        if self.db.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        let embedding = self.embedder.embed_query(query)?;
        let hits = self.db.search_similar(&embedding, k)?;
        debug!(query = %preview(query, 60), hits = hits.len(), "retrieved chunks");
        Ok(hits.into_iter().map(|(_, entry)| entry.chunk.clone()).collect())
    }

    /// [`Retriever::retrieve`] with the configured `top_k`.
    pub fn retrieve_default(&self, query: &str) -> Result<Vec<Chunk>, RetrievalError> {
        self.retrieve(query, self.top_k)
    }
}
