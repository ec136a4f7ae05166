//! Persistent memory stack: sqlite-vec vector store with FTS5 keyword
//! index, the embedding gateway, and the checkpoint store built on top.

pub mod checkpoint;
pub mod embedding;
mod migrations;
pub mod store;

pub use checkpoint::{CheckpointRecord, CheckpointStore, SimilarCheckpoint};
pub use embedding::{
    CachedEmbedding, EmbeddingProvider, HashEmbedding, OllamaEmbedding, OpenAiEmbedding,
};
pub use store::{HybridRow, RrfParams, SearchRow, VectorRow, VectorStore};
