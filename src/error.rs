use crate::model::JobKey;
use crate::rows::BuildRowKey;
use thiserror::Error;

pub type Result<T, E = CacheError> = std::result::Result<T, E>;

/// Errors raised by the cache, the providers and the row projection.
#[derive(Debug, Error)]
pub enum CacheError {
    /// A provider doesn't know the repository. Expected during a refresh: only fatal when
    /// every registered provider reports it.
    #[error("repository not found")]
    RepositoryNotFound,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no matching build found in cache for account {account_id:?} and build {build_id:?}")]
    BuildNotFound { account_id: String, build_id: String },

    #[error("build {build_id:?} has no stage {stage_id}")]
    StageNotFound { build_id: String, stage_id: u64 },

    #[error("no matching job found in cache for key {0}")]
    JobNotFound(JobKey),

    #[error("no provider registered for account {0:?}")]
    ProviderNotFound(String),

    #[error("no row associated to key {0}")]
    KeyNotFound(BuildRowKey),

    #[error("{0}")]
    Provider(color_eyre::Report),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation cancelled")]
    Cancelled,
}

impl From<color_eyre::Report> for CacheError {
    fn from(err: color_eyre::Report) -> Self {
        CacheError::Provider(err)
    }
}

impl CacheError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            CacheError::RepositoryNotFound
                | CacheError::BuildNotFound { .. }
                | CacheError::StageNotFound { .. }
                | CacheError::JobNotFound(_)
                | CacheError::ProviderNotFound(_)
                | CacheError::KeyNotFound(_)
        )
    }
}
