//! The capability a CI backend implements to feed the [`crate::cache::Cache`].

pub mod command;
pub mod parser;

use crate::error::Result;
use crate::model::{Build, Repository};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Content of a job log as returned by a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobLog {
    pub text: String,
    /// `false` while the job is still running: the text may grow and must not be cached.
    pub complete: bool,
}

#[async_trait]
pub trait Provider: Send + Sync {
    /// Identifier of the account this provider serves. Unique among registered providers.
    fn account_id(&self) -> &str;

    /// Streams up to `limit` builds of the repository into `builds`.
    ///
    /// Must return [`crate::error::CacheError::RepositoryNotFound`] when the provider doesn't
    /// know the repository, and should stop early once `cancel` fires.
    async fn builds(
        &self,
        cancel: &CancellationToken,
        repository_url: &str,
        limit: usize,
        builds: mpsc::Sender<Build>,
    ) -> Result<()>;

    async fn log(
        &self,
        cancel: &CancellationToken,
        repository: &Repository,
        job_id: u64,
    ) -> Result<JobLog>;
}
