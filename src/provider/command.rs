//! A provider backed by an external program speaking the JSON format of
//! [`crate::provider::parser`].
//!
//! The program is run as `PROGRAM [ARGS..] builds <URL> <LIMIT>` and
//! `PROGRAM [ARGS..] log <URL> <JOB_ID>`.

use crate::error::{CacheError, Result};
use crate::model::{Build, Repository};
use crate::provider::{parser, JobLog, Provider};
use async_trait::async_trait;
use color_eyre::eyre::eyre;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const PROGRAM_TIMEOUT: Duration = Duration::from_secs(30);

pub struct CommandProvider {
    account_id: String,
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandProvider {
    pub fn new(account_id: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            account_id: account_id.into(),
            program: program.into(),
            args: Vec::new(),
            timeout: PROGRAM_TIMEOUT,
        }
    }

    /// Arguments passed before the subcommand.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(&self, cancel: &CancellationToken, args: &[&str]) -> Result<String> {
        let start = std::time::Instant::now();
        let program = self.program.display();
        // Dropping the output future on cancellation or timeout kills the child.
        let output = Command::new(&self.program)
            .args(&self.args)
            .args(args)
            .kill_on_drop(true)
            .output();

        let output = tokio::select! {
            () = cancel.cancelled() => return Err(CacheError::Cancelled),
            output = tokio::time::timeout(self.timeout, output) => output,
        };
        let output = output
            .map_err(|_| eyre!("{program} timed out after {}s", self.timeout.as_secs()))?
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    eyre!("provider program {program} not found")
                } else {
                    eyre!("Failed to run {program}: {e}")
                }
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(eyre!("{program} {} failed: {}", args.join(" "), stderr.trim()).into());
        }

        tracing::debug!(
            account = %self.account_id,
            args = ?args,
            elapsed_ms = start.elapsed().as_millis(),
            "provider command completed"
        );
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        parser::check_response_size(&stdout)?;
        Ok(stdout)
    }
}

#[async_trait]
impl Provider for CommandProvider {
    fn account_id(&self) -> &str {
        &self.account_id
    }

    async fn builds(
        &self,
        cancel: &CancellationToken,
        repository_url: &str,
        limit: usize,
        builds: mpsc::Sender<Build>,
    ) -> Result<()> {
        let limit = limit.to_string();
        let output = self.run(cancel, &["builds", repository_url, &limit]).await?;
        let Some(parsed) = parser::parse_builds(&self.account_id, &output)? else {
            return Err(CacheError::RepositoryNotFound);
        };

        for build in parsed {
            tokio::select! {
                () = cancel.cancelled() => return Err(CacheError::Cancelled),
                sent = builds.send(build) => {
                    if sent.is_err() {
                        return Err(CacheError::Cancelled);
                    }
                }
            }
        }
        Ok(())
    }

    async fn log(
        &self,
        cancel: &CancellationToken,
        repository: &Repository,
        job_id: u64,
    ) -> Result<JobLog> {
        let job_id = job_id.to_string();
        let output = self.run(cancel, &["log", &repository.url, &job_id]).await?;
        Ok(parser::parse_log(&output)?)
    }
}
