//! Source resolver adapter seam
//!
//! Turning a search term or URL into a playable source (search, metadata,
//! download) lives outside the core. The core only calls `resolve` through
//! this trait, from inside the fetch pool's worker tasks.

use async_trait::async_trait;
use thiserror::Error;

use crate::track::ResolvedSource;

/// Resolution failure kinds reported by the adapter
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// Nothing matched the query
    #[error("no results found")]
    NotFound,

    /// Transient network failure while resolving or fetching
    #[error("network error: {0}")]
    Network(String),

    /// The query points at a source kind the resolver cannot handle
    #[error("unsupported source: {0}")]
    UnsupportedSource(String),
}

/// Resolves a play request into a fetchable audio source with metadata
#[async_trait]
pub trait SourceResolver: Send + Sync {
    async fn resolve(&self, query: &str) -> Result<ResolvedSource, ResolveError>;
}
