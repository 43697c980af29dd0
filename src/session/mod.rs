// Session module
// Ties chunking, embedding, the vector index, retrieval and answer generation
// into one stateful conversation over a document collection


use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::task::JoinError;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::embeddings::{ChunkingConfig, Document, Embedder, chunk_document};
use crate::generation::{Answer, AnswerGenerator, ChatHistory, Generator};
use crate::index::{IndexEntry, VectorIndex};
use crate::retrieval::Retriever;
use crate::{RagError, Result};

/// Whether a session has anything to answer from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Empty,
    Indexed,
}

impl fmt::Display for SessionState {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "empty"),
            Self::Indexed => write!(f, "indexed"),
        }
    }
}

/// Outcome of ingesting one document
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub document_id: String,
    pub chunks_added: usize,
    pub total_entries: usize,
}

/// A question-answering session over an in-memory vector index.
///
/// One request runs at a time; every operation takes `&mut self`. Calls to
/// the embedding and generation backends run on tokio's blocking pool.
pub struct Session {
    chunking: ChunkingConfig,
    k: usize,
    index_path: PathBuf,
    index: Arc<VectorIndex>,
    embedder: Arc<dyn Embedder>,
    retriever: Retriever,
    answers: AnswerGenerator,
    history: ChatHistory,
}

impl fmt::Debug for Session {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("chunking", &self.chunking)
            .field("k", &self.k)
            .field("index_path", &self.index_path)
            .field("entries", &self.index.len())
            .field("embedding_model", &self.embedder.embedding_model())
            .field("answers", &self.answers)
            .field("history_turns", &self.history.len())
            .finish()
    }
}

impl Session {
    /// Create a session with an empty index
    #[inline]
    pub fn new(
        config: &Config,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| RagError::Config(e.to_string()))?;

        let index = VectorIndex::new(config.retrieval.metric)
            .with_embedding_model(embedder.embedding_model());

        Ok(Self {
            chunking: config.chunking,
            k: config.retrieval.k,
            index_path: config.resolved_index_path(),
            index: Arc::new(index),
            retriever: Retriever::new(Arc::clone(&embedder)),
            embedder,
            answers: AnswerGenerator::new(generator),
            history: ChatHistory::new(config.retrieval.history_turns),
        })
    }

    /// Create a session, loading the saved index at the configured path if there is one
    #[inline]
    pub fn open(
        config: &Config,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
    ) -> Result<Self> {
        let mut session = Self::new(config, embedder, generator)?;

        if !VectorIndex::exists(&session.index_path) {
            debug!(
                "No saved index at {}, starting empty",
                session.index_path.display()
            );
            return Ok(session);
        }

        let index = VectorIndex::load(&session.index_path)?;

        if let Some(model) = index.embedding_model() {
            if model != session.embedder.embedding_model() {
                warn!(
                    "Index was built with embedding model {} but {} is configured",
                    model,
                    session.embedder.embedding_model()
                );
            }
        }
        if index.metric() != config.retrieval.metric {
            warn!(
                "Index uses the {} metric, ignoring configured {}",
                index.metric(),
                config.retrieval.metric
            );
        }

        info!(
            "Opened index with {} entries from {}",
            index.len(),
            session.index_path.display()
        );
        session.index = Arc::new(index);
        Ok(session)
    }

    #[inline]
    pub fn state(&self) -> SessionState {
        if self.index.is_empty() {
            SessionState::Empty
        } else {
            SessionState::Indexed
        }
    }

    #[inline]
    pub fn index(&self) -> &VectorIndex {
        &self.index
    }

    #[inline]
    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    #[inline]
    pub fn history(&self) -> &ChatHistory {
        &self.history
    }

    #[inline]
    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    /// Chunk, embed and index a document. Nothing is added unless every
    /// chunk was embedded.
    #[inline]
    pub async fn ingest(&mut self, document: Document) -> Result<IngestReport> {
        self.ingest_until(document, std::future::pending::<()>())
            .await
    }

    /// Like [`Session::ingest`], but gives up with [`RagError::Cancelled`]
    /// as soon as `cancel` completes. A cancelled ingest leaves the index untouched.
    #[inline]
    pub async fn ingest_until<C: Future>(
        &mut self,
        document: Document,
        cancel: C,
    ) -> Result<IngestReport> {
        let document_id = document.id.clone();
        info!("Ingesting document {}", document_id);

        let chunking = self.chunking;
        let embedder = Arc::clone(&self.embedder);
        let stop = CancelFlag::default();
        let _stop_on_exit = stop.on_drop();
        let task = tokio::task::spawn_blocking(move || {
            embed_document(&document, &chunking, embedder.as_ref(), &stop)
        });

        let prepared = tokio::select! {
            biased;
            _ = cancel => {
                warn!("Ingest of {} cancelled", document_id);
                return Err(RagError::Cancelled);
            }
            joined = task => joined.map_err(join_error)?,
        };

        let outcome = prepared.and_then(|entries| {
            let chunks_added = entries.len();
            Arc::make_mut(&mut self.index).add(entries)?;
            Ok(chunks_added)
        });

        match outcome {
            Ok(chunks_added) => {
                info!(
                    "Indexed {} chunks from {} ({} entries total)",
                    chunks_added,
                    document_id,
                    self.index.len()
                );
                Ok(IngestReport {
                    document_id,
                    chunks_added,
                    total_entries: self.index.len(),
                })
            }
            Err(source) => {
                warn!("Failed to ingest {}: {}", document_id, source);
                Err(RagError::Ingestion {
                    document_id,
                    source: Box::new(source),
                })
            }
        }
    }

    /// Answer a question from the indexed documents and remember the turn
    #[inline]
    pub async fn ask(&mut self, question: &str) -> Result<Answer> {
        self.ask_until(question, std::future::pending::<()>()).await
    }

    /// Like [`Session::ask`], but gives up with [`RagError::Cancelled`] as
    /// soon as `cancel` completes
    #[inline]
    pub async fn ask_until<C: Future>(&mut self, question: &str, cancel: C) -> Result<Answer> {
        self.ensure_indexed()?;

        let index = Arc::clone(&self.index);
        let retriever = self.retriever.clone();
        let answers = self.answers.clone();
        let history = self.history.clone();
        let k = self.k;
        let owned_question = question.to_string();
        let stop = CancelFlag::default();
        let _stop_on_exit = stop.on_drop();

        let task = tokio::task::spawn_blocking(move || {
            let context = retriever.retrieve(&index, &owned_question, k)?;
            stop.check()?;
            answers.answer(&owned_question, context, &history)
        });

        let answer = tokio::select! {
            biased;
            _ = cancel => {
                warn!("Question cancelled");
                return Err(RagError::Cancelled);
            }
            joined = task => joined.map_err(join_error)??,
        };

        debug!("Answered with {} context chunks", answer.context.len());
        self.history.push(question, answer.text.clone());
        Ok(answer)
    }

    /// Ask for a JSON answer and parse it into a list of `T`. Structured
    /// questions are not added to the conversation history.
    #[inline]
    pub async fn ask_structured<T>(&self, question: &str, format: &str) -> Result<Vec<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.ensure_indexed()?;

        let index = Arc::clone(&self.index);
        let retriever = self.retriever.clone();
        let answers = self.answers.clone();
        let k = self.k;
        let question = question.to_string();
        let format = format.to_string();
        let stop = CancelFlag::default();
        let _stop_on_exit = stop.on_drop();

        tokio::task::spawn_blocking(move || {
            let context = retriever.retrieve(&index, &question, k)?;
            stop.check()?;
            answers.answer_structured(&question, &context, &format)
        })
        .await
        .map_err(join_error)?
    }

    /// Write the index to the configured path
    #[inline]
    pub fn save(&self) -> Result<()> {
        self.index.save(&self.index_path)
    }

    /// Drop every indexed entry, returning the session to [`SessionState::Empty`]
    #[inline]
    pub fn rebuild(&mut self) {
        info!("Clearing index with {} entries", self.index.len());
        Arc::make_mut(&mut self.index).clear();
    }

    fn ensure_indexed(&self) -> Result<()> {
        match self.state() {
            SessionState::Indexed => Ok(()),
            SessionState::Empty => Err(RagError::NotIndexed),
        }
    }
}

/// Tells a blocking task that nobody is waiting for its result any more
#[derive(Debug, Clone, Default)]
struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            debug!("Stopping abandoned background work");
            Err(RagError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Guard that raises the flag when the awaiting future returns or is dropped
    fn on_drop(&self) -> CancelOnDrop {
        CancelOnDrop(self.clone())
    }
}

struct CancelOnDrop(CancelFlag);

impl Drop for CancelOnDrop {
    #[inline]
    fn drop(&mut self) {
        self.0.cancel();
    }
}

fn embed_document(
    document: &Document,
    chunking: &ChunkingConfig,
    embedder: &dyn Embedder,
    stop: &CancelFlag,
) -> Result<Vec<IndexEntry>> {
    let chunks = chunk_document(document, chunking)?;
    if chunks.is_empty() {
        debug!("Document {} produced no chunks", document.id);
        return Ok(Vec::new());
    }

    let texts: Vec<String> = chunks.iter().map(|chunk| chunk.text.clone()).collect();
    let mut embeddings = Vec::with_capacity(texts.len());
    for batch in texts.chunks(embedder.max_batch_size().max(1)) {
        stop.check()?;
        embeddings.extend(embedder.embed_batch(batch)?);
    }

    if embeddings.len() != chunks.len() {
        return Err(RagError::EmbeddingService(format!(
            "expected {} embeddings, got {}",
            chunks.len(),
            embeddings.len()
        )));
    }

    Ok(embeddings
        .into_iter()
        .zip(chunks)
        .map(|(embedding, chunk)| IndexEntry { embedding, chunk })
        .collect())
}

fn join_error(error: JoinError) -> RagError {
    RagError::Other(anyhow::anyhow!("background task failed: {}", error))
}
