//! Cross-lingual entity alignment: candidate retrieval, oracle verification and cluster resolution.

pub(crate) mod prompt;
pub(crate) mod resolver;
pub(crate) mod retriever;
pub(crate) mod scheduler;

pub use resolver::{ClusterTable, resolve};
pub use retriever::{CandidateMap, EntityIndex};
pub use scheduler::{Scheduler, UnitStatus, VerificationUnit};
