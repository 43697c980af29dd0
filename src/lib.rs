use thiserror::Error;

pub type Result<T> = std::result::Result<T, RagError>;

#[derive(Error, Debug)]
pub enum RagError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to ingest document '{document_id}': {source}")]
    Ingestion {
        document_id: String,
        #[source]
        source: Box<RagError>,
    },

    #[error("Embedding service error: {0}")]
    EmbeddingService(String),

    #[error("Generation service error: {0}")]
    GenerationService(String),

    #[error("No documents have been indexed yet")]
    NotIndexed,

    #[error("Failed to parse model response: {message}")]
    Parse { message: String, raw: String },

    #[error("Vector index error: {0}")]
    Index(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl RagError {
    /// The raw model output attached to a parse failure, if any
    #[inline]
    pub fn raw_response(&self) -> Option<&str> {
        match self {
            Self::Parse { raw, .. } => Some(raw),
            Self::Ingestion { source, .. } => source.raw_response(),
            _ => None,
        }
    }
}

pub mod commands;
pub mod config;
pub mod embeddings;
pub mod generation;
pub mod index;
pub mod ollama;
pub mod retrieval;
pub mod session;
