//! Clients for the OpenAI-compatible chat and embedding oracles.

pub mod client;
pub mod embedding;
pub mod types;

pub use client::{ChatOracle, LlmClient, LlmError};
pub use embedding::{EmbeddingClient, EmbeddingOracle};
pub use types::Message;
