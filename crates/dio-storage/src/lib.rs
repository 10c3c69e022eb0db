//! Persistence and HTTP plumbing: payload archive, research documents, entity roster.

mod artifacts;
mod http;
mod research;
mod roster;

use std::path::PathBuf;

use thiserror::Error;

pub use artifacts::{ArtifactStore, StoredArtifact};
pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, HttpClientConfig,
    HttpFetcher, RetryDisposition,
};
pub use research::{JsonFileResearchStore, MemoryResearchStore, ResearchStore};
pub use roster::{EntityRoster, FileRoster, MemoryRoster};

pub const CRATE_NAME: &str = "dio-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o failure on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid json in {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid yaml in {context}: {source}")]
    Yaml {
        context: String,
        #[source]
        source: serde_yaml::Error,
    },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}
