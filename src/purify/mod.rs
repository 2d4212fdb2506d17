//! Self-consistency purification of extracted entities and triples.

pub(crate) mod article;
pub(crate) mod parser;
pub(crate) mod prompt;
pub(crate) mod purifier;

pub use article::{Article, ArticleError, is_purified, write_back};
pub use purifier::Purifier;
