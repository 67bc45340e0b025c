//! Embedding storage and similarity search for the smart routing scope.
//!
//! One row per enabled tool: the tool's descriptive text and its embedding
//! vector. The [`index::VectorIndex`] keeps rows reconciled with the tool
//! catalog and answers k-nearest cosine queries for `search_tools`.

pub mod embedder;
pub mod index;
pub mod store;

pub use embedder::{Embedder, EmbedderError, HttpEmbedder, MockEmbedder};
pub use index::{SearchHit, VectorIndex};
pub use store::{EmbeddingRow, EmbeddingStore};
