//! Concurrency-safe build store fed by any number of [`Provider`]s.
//!
//! All reads and writes go through one mutex. Critical sections are plain map operations and the
//! lock is never held across a provider call: values are copied out, the provider is called
//! without the lock, and results are written back under a fresh lock.

use crate::error::{CacheError, Result};
use crate::model::{Build, Job, JobKey, Repository};
use crate::provider::{JobLog, Provider};
use crate::repository_builds::RepositoryBuilds;
use crate::text;
use chrono::{DateTime, Utc};
use color_eyre::eyre::eyre;
use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

const BUILD_CHANNEL_CAPACITY: usize = 16;
/// Delay between two fetches of the log of a job that is still running.
pub const LOG_POLL_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BuildKey {
    account_id: String,
    build_id: String,
}

impl BuildKey {
    fn new(account_id: &str, build_id: &str) -> Self {
        Self {
            account_id: account_id.to_string(),
            build_id: build_id.to_string(),
        }
    }
}

/// Cheap to clone: clones share the same builds and providers.
#[derive(Clone)]
pub struct Cache {
    builds: Arc<Mutex<HashMap<BuildKey, Build>>>,
    providers: Arc<HashMap<String, Arc<dyn Provider>>>,
    log_poll_interval: Duration,
}

impl Cache {
    /// Providers are indexed by their own account ID; a later provider replaces an earlier one
    /// with the same ID.
    pub fn new(providers: Vec<Arc<dyn Provider>>) -> Self {
        let providers = providers
            .into_iter()
            .map(|p| (p.account_id().to_string(), p))
            .collect();
        Self {
            builds: Arc::default(),
            providers: Arc::new(providers),
            log_poll_interval: LOG_POLL_INTERVAL,
        }
    }

    pub fn with_log_poll_interval(mut self, interval: Duration) -> Self {
        self.log_poll_interval = interval;
        self
    }

    pub fn new_repository_builds(&self, repository_url: &str) -> RepositoryBuilds {
        RepositoryBuilds::new(self.clone(), repository_url)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<BuildKey, Build>> {
        // Every critical section leaves the map consistent, so a poisoned lock is still usable.
        self.builds.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores `build`, replacing any build with the same account and ID.
    pub fn save(&self, build: Build) -> Result<()> {
        let Some(repository) = &build.repository else {
            return Err(CacheError::InvalidArgument(format!(
                "build {:?} has no repository",
                build.id
            )));
        };
        validate_ids(&build)?;
        let key = BuildKey::new(&repository.account_id, &build.id);
        self.lock().insert(key, build);
        Ok(())
    }

    /// Overwrites a single job of a cached build.
    pub fn save_job(&self, account_id: &str, build_id: &str, stage_id: u64, job: Job) -> Result<()> {
        let mut builds = self.lock();
        let build = builds
            .get_mut(&BuildKey::new(account_id, build_id))
            .ok_or_else(|| CacheError::BuildNotFound {
                account_id: account_id.to_string(),
                build_id: build_id.to_string(),
            })?;
        let jobs = if stage_id == 0 {
            &mut build.jobs
        } else {
            &mut build
                .stages
                .get_mut(&stage_id)
                .ok_or_else(|| CacheError::StageNotFound {
                    build_id: build_id.to_string(),
                    stage_id,
                })?
                .jobs
        };
        if job.id == 0 {
            return Err(CacheError::InvalidArgument(format!(
                "build {build_id:?} has a job with ID 0"
            )));
        }
        jobs.insert(job.id, job);
        Ok(())
    }

    /// Point-in-time copy of every cached build.
    pub fn builds(&self) -> Vec<Build> {
        self.lock().values().cloned().collect()
    }

    /// Copies of the jobs matching `keys`. Keys without a cached job are skipped.
    pub fn fetch_jobs(&self, keys: &[JobKey]) -> Vec<(JobKey, Job)> {
        let builds = self.lock();
        keys.iter()
            .filter_map(|key| {
                let build = builds.get(&BuildKey::new(&key.account_id, &key.build_id))?;
                let job = build.get(key.stage_id, key.job_id)?;
                Some((key.clone(), job.clone()))
            })
            .collect()
    }

    /// Refreshes the builds of `repository_url` from every provider concurrently.
    ///
    /// Each saved build fires a timestamp on `updates` from a detached task; the signal is
    /// dropped once the refresh is over or cancelled, so a slow reader never stalls ingestion.
    ///
    /// The first provider error (or failed save) cancels the other providers and becomes the
    /// result. [`CacheError::RepositoryNotFound`] is only returned when every provider reports
    /// it.
    pub async fn update_from_providers(
        &self,
        cancel: &CancellationToken,
        repository_url: &str,
        limit: usize,
        updates: &mpsc::Sender<DateTime<Utc>>,
    ) -> Result<()> {
        let sub = cancel.child_token();
        let _cancel_on_return = sub.clone().drop_guard();
        let (err_tx, mut err_rx) = mpsc::unbounded_channel::<Result<()>>();

        for provider in self.providers.values() {
            let provider = Arc::clone(provider);
            let cache = self.clone();
            let sub = sub.clone();
            let updates = updates.clone();
            let err_tx = err_tx.clone();
            let url = repository_url.to_string();

            tokio::spawn(async move {
                let (build_tx, build_rx) = mpsc::channel(BUILD_CHANNEL_CAPACITY);
                let producer = async {
                    let outcome = tokio::select! {
                        outcome = provider.builds(&sub, &url, limit, build_tx) => outcome,
                        () = sub.cancelled() => Err(CacheError::Cancelled),
                    };
                    tracing::debug!(
                        account = provider.account_id(),
                        ok = outcome.is_ok(),
                        "provider finished streaming builds"
                    );
                    report(&err_tx, outcome);
                };
                let consumer = async {
                    let mut build_rx = build_rx;
                    while let Some(build) = build_rx.recv().await {
                        if let Err(e) = cache.save(build) {
                            report(&err_tx, Err(e));
                            return;
                        }
                        notify_update(&sub, &updates);
                    }
                };
                tokio::join!(producer, consumer);
            });
        }
        // Closes once every provider task has dropped its sender.
        drop(err_tx);

        let mut result = Ok(());
        let mut not_found = 0;
        while let Some(outcome) = err_rx.recv().await {
            match outcome {
                Ok(()) => {}
                Err(CacheError::RepositoryNotFound) => {
                    not_found += 1;
                    if not_found == self.providers.len() && result.is_ok() {
                        result = Err(CacheError::RepositoryNotFound);
                    }
                }
                Err(err) => {
                    sub.cancel();
                    if result.is_ok() {
                        tracing::warn!("update of {repository_url} failed: {err}");
                        result = Err(err);
                    }
                }
            }
        }

        result
    }

    fn provider(&self, account_id: &str) -> Result<Arc<dyn Provider>> {
        self.providers
            .get(account_id)
            .cloned()
            .ok_or_else(|| CacheError::ProviderNotFound(account_id.to_string()))
    }

    fn resolve_job(&self, key: &JobKey) -> Result<(Arc<Repository>, Job)> {
        let builds = self.lock();
        let build = builds
            .get(&BuildKey::new(&key.account_id, &key.build_id))
            .ok_or_else(|| CacheError::BuildNotFound {
                account_id: key.account_id.clone(),
                build_id: key.build_id.clone(),
            })?;
        let job = build
            .get(key.stage_id, key.job_id)
            .ok_or_else(|| CacheError::JobNotFound(key.clone()))?;
        let repository = build
            .repository
            .clone()
            .ok_or_else(|| CacheError::InvalidArgument(format!("build {:?} has no repository", build.id)))?;
        Ok((repository, job.clone()))
    }

    async fn fetch_log(
        &self,
        cancel: &CancellationToken,
        key: &JobKey,
        repository: &Repository,
    ) -> Result<JobLog> {
        let provider = self.provider(&key.account_id)?;
        tokio::select! {
            () = cancel.cancelled() => Err(CacheError::Cancelled),
            log = provider.log(cancel, repository, key.job_id) => log,
        }
    }

    /// Writes the log of a job to `writer`, fetching it from the provider if it isn't cached.
    ///
    /// Only complete logs are stored back in the cache; the partial log of a running job is
    /// written but fetched again next time.
    pub async fn write_log<W>(
        &self,
        cancel: &CancellationToken,
        key: &JobKey,
        writer: &mut W,
    ) -> Result<()>
    where
        W: Write + Send + ?Sized,
    {
        let (repository, mut job) = self.resolve_job(key)?;
        let mut log = match job.log.take() {
            Some(log) => log,
            None => {
                let fetched = self.fetch_log(cancel, key, &repository).await?;
                if fetched.complete {
                    job.log = Some(fetched.text.clone());
                    self.save_job(&key.account_id, &key.build_id, key.stage_id, job)?;
                }
                fetched.text
            }
        };

        if !log.ends_with('\n') {
            log.push('\n');
        }
        writer.write_all(text::post_process(&log).as_bytes())?;
        Ok(())
    }

    /// Writes every log in turn, stopping at the first failure.
    pub async fn write_logs(&self, cancel: &CancellationToken, jobs: Vec<(JobKey, File)>) -> Result<()> {
        for (key, mut file) in jobs {
            self.write_log(cancel, &key, &mut file).await?;
        }
        Ok(())
    }

    /// Follows the logs of running jobs until they complete or `cancel` fires.
    ///
    /// Every job is followed by its own task. Returns the first error once all tasks are done.
    pub async fn stream_logs(&self, cancel: &CancellationToken, jobs: Vec<(JobKey, File)>) -> Result<()> {
        let mut tasks = JoinSet::new();
        for (key, file) in jobs {
            let cache = self.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move { cache.stream_log(&cancel, key, file).await });
        }

        let mut result = Ok(());
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined.unwrap_or_else(|e| {
                Err(CacheError::Provider(eyre!("log streaming task failed: {e}")))
            });
            if let Err(err) = outcome {
                tracing::warn!("log streaming failed: {err}");
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }

    async fn stream_log(&self, cancel: &CancellationToken, key: JobKey, mut file: File) -> Result<()> {
        let mut written = 0;
        loop {
            let (repository, mut job) = self.resolve_job(&key)?;
            if let Some(log) = job.log.take() {
                // Stored by another writer while this one was following the job.
                write_settled(&mut file, &log, written, true)?;
                return Ok(());
            }

            let log = match self.fetch_log(cancel, &key, &repository).await {
                Err(CacheError::Cancelled) => return Ok(()),
                other => other?,
            };
            written = write_settled(&mut file, &log.text, written, log.complete)?;

            if log.complete {
                job.log = Some(log.text);
                return self.save_job(&key.account_id, &key.build_id, key.stage_id, job);
            }

            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                () = tokio::time::sleep(self.log_poll_interval) => {}
            }
        }
    }
}

/// Writes the part of `log` past byte `written` that can no longer change and returns the new
/// offset.
///
/// Until the log is complete only whole lines are written, so a line rewritten with carriage
/// returns across two fetches is post-processed in one piece and the file ends up identical to
/// what [`Cache::write_log`] produces for the complete log.
fn write_settled<W>(writer: &mut W, log: &str, written: usize, complete: bool) -> Result<usize>
where
    W: Write + ?Sized,
{
    let Some(pending) = log.get(written..) else {
        return Ok(written);
    };
    let settled = if complete {
        pending.len()
    } else {
        pending.rfind('\n').map_or(0, |i| i + 1)
    };
    if settled > 0 {
        writer.write_all(text::post_process(&pending[..settled]).as_bytes())?;
    }
    if complete && !log.ends_with('\n') {
        writer.write_all(b"\n")?;
    }
    Ok(written + settled)
}

/// Row keys use 0 for "no stage" and "no job", so a stage or job with ID 0 would collide with its
/// parent's key.
fn validate_ids(build: &Build) -> Result<()> {
    let invalid = |what: &str| {
        Err(CacheError::InvalidArgument(format!(
            "build {:?} has a {what} with ID 0",
            build.id
        )))
    };
    if build.jobs.contains_key(&0) {
        return invalid("job");
    }
    for (&stage_id, stage) in &build.stages {
        if stage_id == 0 {
            return invalid("stage");
        }
        if stage.jobs.contains_key(&0) {
            return invalid("job");
        }
    }
    Ok(())
}

fn report(err_tx: &mpsc::UnboundedSender<Result<()>>, outcome: Result<()>) {
    if err_tx.send(outcome).is_err() {
        tracing::warn!("update: error channel closed");
    }
}

/// Fire-and-forget: the timestamp is dropped if the refresh is cancelled before it is read.
fn notify_update(cancel: &CancellationToken, updates: &mpsc::Sender<DateTime<Utc>>) {
    let cancel = cancel.clone();
    let updates = updates.clone();
    let now = Utc::now();
    tokio::spawn(async move {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {}
            sent = updates.send(now) => {
                if sent.is_err() {
                    tracing::debug!("update: receiver dropped");
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Stage, State};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum Outcome {
        Builds(Vec<Build>),
        NotFound,
        Fail,
        WaitForCancel,
    }

    struct FakeProvider {
        account_id: String,
        outcome: Outcome,
        log: JobLog,
        log_calls: AtomicUsize,
    }

    impl FakeProvider {
        fn new(account_id: &str, outcome: Outcome) -> Self {
            Self {
                account_id: account_id.to_string(),
                outcome,
                log: JobLog {
                    text: "hello".to_string(),
                    complete: true,
                },
                log_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Provider for FakeProvider {
        fn account_id(&self) -> &str {
            &self.account_id
        }

        async fn builds(
            &self,
            cancel: &CancellationToken,
            _repository_url: &str,
            _limit: usize,
            builds: mpsc::Sender<Build>,
        ) -> Result<()> {
            match &self.outcome {
                Outcome::Builds(list) => {
                    for build in list {
                        if builds.send(build.clone()).await.is_err() {
                            return Err(CacheError::Cancelled);
                        }
                    }
                    Ok(())
                }
                Outcome::NotFound => Err(CacheError::RepositoryNotFound),
                Outcome::Fail => Err(eyre!("HTTP 500").into()),
                Outcome::WaitForCancel => {
                    cancel.cancelled().await;
                    Err(CacheError::Cancelled)
                }
            }
        }

        async fn log(
            &self,
            _cancel: &CancellationToken,
            _repository: &Repository,
            _job_id: u64,
        ) -> Result<JobLog> {
            self.log_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.log.clone())
        }
    }

    fn repository(account_id: &str) -> Arc<Repository> {
        Arc::new(Repository {
            account_id: account_id.to_string(),
            id: 1,
            url: "https://example.com/owner/repo".to_string(),
            owner: "owner".to_string(),
            name: "repo".to_string(),
        })
    }

    fn build(account_id: &str, id: &str) -> Build {
        let mut build = Build::new(repository(account_id), id);
        build.jobs.insert(
            1,
            Job {
                id: 1,
                state: State::Passed,
                name: "test".to_string(),
                ..Job::default()
            },
        );
        build.stages.insert(
            2,
            Stage {
                id: 2,
                name: "deploy".to_string(),
                ..Stage::default()
            },
        );
        build
    }

    fn key(account_id: &str, build_id: &str, stage_id: u64, job_id: u64) -> JobKey {
        JobKey {
            account_id: account_id.to_string(),
            build_id: build_id.to_string(),
            stage_id,
            job_id,
        }
    }

    #[test]
    fn save_requires_repository() {
        let cache = Cache::new(vec![]);
        let mut b = build("a", "1");
        b.repository = None;
        assert!(matches!(cache.save(b), Err(CacheError::InvalidArgument(_))));
        assert!(cache.builds().is_empty());
    }

    #[test]
    fn save_rejects_zero_stage_and_job_ids() {
        let cache = Cache::new(vec![]);

        let mut zero_stage = build("a", "1");
        let mut stage = zero_stage.stages.remove(&2).unwrap();
        stage.id = 0;
        stage.jobs.insert(7, Job { id: 7, ..Job::default() });
        zero_stage.stages.insert(0, stage);
        assert!(matches!(cache.save(zero_stage), Err(CacheError::InvalidArgument(_))));

        let mut zero_job = build("a", "1");
        zero_job.stages.get_mut(&2).unwrap().jobs.insert(0, Job::default());
        assert!(matches!(cache.save(zero_job), Err(CacheError::InvalidArgument(_))));

        let mut zero_top_job = build("a", "1");
        zero_top_job.jobs.insert(0, Job::default());
        assert!(matches!(cache.save(zero_top_job), Err(CacheError::InvalidArgument(_))));
        assert!(cache.builds().is_empty());

        cache.save(build("a", "1")).unwrap();
        let err = cache.save_job("a", "1", 2, Job::default()).unwrap_err();
        assert!(matches!(err, CacheError::InvalidArgument(_)));
        assert!(cache.builds()[0].stages[&2].jobs.is_empty());
    }

    #[test]
    fn save_replaces_previous_build() {
        let cache = Cache::new(vec![]);
        cache.save(build("a", "1")).unwrap();
        let mut newer = build("a", "1");
        newer.jobs.clear();
        cache.save(newer).unwrap();

        let builds = cache.builds();
        assert_eq!(builds.len(), 1);
        assert!(builds[0].jobs.is_empty());
    }

    #[test]
    fn same_build_id_on_two_accounts_are_distinct() {
        let cache = Cache::new(vec![]);
        cache.save(build("a", "1")).unwrap();
        cache.save(build("b", "1")).unwrap();
        assert_eq!(cache.builds().len(), 2);
    }

    #[test]
    fn save_job_overwrites_in_place() {
        let cache = Cache::new(vec![]);
        cache.save(build("a", "1")).unwrap();
        let job = Job {
            id: 1,
            state: State::Failed,
            ..Job::default()
        };
        cache.save_job("a", "1", 0, job).unwrap();
        let staged = Job {
            id: 5,
            ..Job::default()
        };
        cache.save_job("a", "1", 2, staged).unwrap();

        let builds = cache.builds();
        assert_eq!(builds[0].jobs[&1].state, State::Failed);
        assert!(builds[0].stages[&2].jobs.contains_key(&5));
    }

    #[test]
    fn save_job_reports_missing_build_or_stage() {
        let cache = Cache::new(vec![]);
        let err = cache.save_job("a", "1", 0, Job::default()).unwrap_err();
        assert!(matches!(err, CacheError::BuildNotFound { .. }));

        cache.save(build("a", "1")).unwrap();
        let err = cache.save_job("a", "1", 9, Job::default()).unwrap_err();
        assert!(matches!(err, CacheError::StageNotFound { stage_id: 9, .. }));
        assert!(err.is_not_found());
    }

    #[test]
    fn builds_is_a_snapshot() {
        let cache = Cache::new(vec![]);
        cache.save(build("a", "1")).unwrap();
        let mut snapshot = cache.builds();
        snapshot[0].jobs.clear();
        assert_eq!(cache.builds()[0].jobs.len(), 1);
    }

    #[test]
    fn fetch_jobs_skips_missing_keys() {
        let cache = Cache::new(vec![]);
        cache.save(build("a", "1")).unwrap();
        let jobs = cache.fetch_jobs(&[key("a", "1", 0, 1), key("a", "1", 0, 42), key("a", "9", 0, 1)]);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].0, key("a", "1", 0, 1));
    }

    #[tokio::test]
    async fn update_succeeds_when_one_provider_knows_the_repository() {
        let providers: Vec<Arc<dyn Provider>> = vec![
            Arc::new(FakeProvider::new("gitlab", Outcome::NotFound)),
            Arc::new(FakeProvider::new(
                "travis",
                Outcome::Builds(vec![build("travis", "1"), build("travis", "2")]),
            )),
        ];
        let cache = Cache::new(providers);
        let (tx, _rx) = mpsc::channel(8);

        let result = cache
            .update_from_providers(&CancellationToken::new(), "url", 10, &tx)
            .await;

        assert!(result.is_ok());
        assert_eq!(cache.builds().len(), 2);
    }

    #[tokio::test]
    async fn update_reports_not_found_when_no_provider_knows_the_repository() {
        let providers: Vec<Arc<dyn Provider>> = vec![
            Arc::new(FakeProvider::new("gitlab", Outcome::NotFound)),
            Arc::new(FakeProvider::new("travis", Outcome::NotFound)),
        ];
        let cache = Cache::new(providers);
        let (tx, _rx) = mpsc::channel(8);

        let result = cache
            .update_from_providers(&CancellationToken::new(), "url", 10, &tx)
            .await;

        assert!(matches!(result, Err(CacheError::RepositoryNotFound)));
    }

    #[tokio::test]
    async fn update_fails_fast_and_cancels_other_providers() {
        let providers: Vec<Arc<dyn Provider>> = vec![
            Arc::new(FakeProvider::new("slow", Outcome::WaitForCancel)),
            Arc::new(FakeProvider::new("broken", Outcome::Fail)),
        ];
        let cache = Cache::new(providers);
        let (tx, _rx) = mpsc::channel(8);

        let result = cache
            .update_from_providers(&CancellationToken::new(), "url", 10, &tx)
            .await;

        match result {
            Err(CacheError::Provider(report)) => assert_eq!(report.to_string(), "HTTP 500"),
            other => panic!("expected provider error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn update_reports_invalid_builds() {
        let mut orphan = build("a", "1");
        orphan.repository = None;
        let providers: Vec<Arc<dyn Provider>> =
            vec![Arc::new(FakeProvider::new("a", Outcome::Builds(vec![orphan])))];
        let cache = Cache::new(providers);
        let (tx, _rx) = mpsc::channel(8);

        let result = cache
            .update_from_providers(&CancellationToken::new(), "url", 10, &tx)
            .await;

        assert!(matches!(result, Err(CacheError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn update_without_providers_is_a_no_op() {
        let cache = Cache::new(vec![]);
        let (tx, _rx) = mpsc::channel(1);
        let result = cache
            .update_from_providers(&CancellationToken::new(), "url", 10, &tx)
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn update_honours_caller_cancellation() {
        let providers: Vec<Arc<dyn Provider>> =
            vec![Arc::new(FakeProvider::new("slow", Outcome::WaitForCancel))];
        let cache = Cache::new(providers);
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = cache.update_from_providers(&cancel, "url", 10, &tx).await;
        assert!(matches!(result, Err(CacheError::Cancelled)));
    }

    #[tokio::test]
    async fn update_does_not_block_on_a_full_updates_channel() {
        let builds = (0..20).map(|i| build("a", &i.to_string())).collect();
        let providers: Vec<Arc<dyn Provider>> =
            vec![Arc::new(FakeProvider::new("a", Outcome::Builds(builds)))];
        let cache = Cache::new(providers);
        // Nobody reads this channel.
        let (tx, _rx) = mpsc::channel(1);

        cache
            .update_from_providers(&CancellationToken::new(), "url", 20, &tx)
            .await
            .unwrap();
        assert_eq!(cache.builds().len(), 20);
    }

    #[tokio::test]
    async fn write_log_fetches_and_caches_complete_logs() {
        let provider = Arc::new(FakeProvider::new("a", Outcome::NotFound));
        let registered: Arc<dyn Provider> = provider.clone();
        let cache = Cache::new(vec![registered]);
        cache.save(build("a", "1")).unwrap();
        let cancel = CancellationToken::new();

        let mut out = Vec::new();
        cache.write_log(&cancel, &key("a", "1", 0, 1), &mut out).await.unwrap();
        assert_eq!(out, b"hello\n");

        let mut again = Vec::new();
        cache.write_log(&cancel, &key("a", "1", 0, 1), &mut again).await.unwrap();
        assert_eq!(again, b"hello\n");
        assert_eq!(provider.log_calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.builds()[0].jobs[&1].log.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn write_log_does_not_cache_partial_logs() {
        let mut provider = FakeProvider::new("a", Outcome::NotFound);
        provider.log.complete = false;
        let provider = Arc::new(provider);
        let registered: Arc<dyn Provider> = provider.clone();
        let cache = Cache::new(vec![registered]);
        cache.save(build("a", "1")).unwrap();
        let cancel = CancellationToken::new();

        let mut out = Vec::new();
        cache.write_log(&cancel, &key("a", "1", 0, 1), &mut out).await.unwrap();
        cache.write_log(&cancel, &key("a", "1", 0, 1), &mut out).await.unwrap();

        assert_eq!(provider.log_calls.load(Ordering::SeqCst), 2);
        assert!(cache.builds()[0].jobs[&1].log.is_none());
    }

    #[test]
    fn write_settled_holds_back_unfinished_lines() {
        let mut out = Vec::new();
        let written = write_settled(&mut out, "a\n10%\r", 0, false).unwrap();
        assert_eq!(written, 2);
        assert_eq!(out, b"a\n");

        let written = write_settled(&mut out, "a\n10%\r20%\nb", written, true).unwrap();
        assert_eq!(written, "a\n10%\r20%\nb".len());
        assert_eq!(String::from_utf8(out).unwrap(), "a\n20%\nb\n");
    }

    #[test]
    fn write_settled_matches_whole_log_post_processing() {
        let log = "step 1\r\n 5%\r50%\r100%\ndone";
        let mut whole = Vec::new();
        write_settled(&mut whole, log, 0, true).unwrap();

        // Every prefix is a possible intermediate fetch.
        for cut in (0..log.len()).filter(|&i| log.is_char_boundary(i)) {
            let mut streamed = Vec::new();
            let written = write_settled(&mut streamed, &log[..cut], 0, false).unwrap();
            write_settled(&mut streamed, log, written, true).unwrap();
            assert_eq!(streamed, whole, "split at {cut}");
        }
        assert_eq!(String::from_utf8(whole).unwrap(), "step 1\n100%\ndone\n");
    }

    #[tokio::test]
    async fn write_log_reports_missing_job_and_provider() {
        let cache = Cache::new(vec![]);
        cache.save(build("a", "1")).unwrap();
        let cancel = CancellationToken::new();
        let mut out = Vec::new();

        let err = cache
            .write_log(&cancel, &key("a", "1", 0, 7), &mut out)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::JobNotFound(_)));

        let err = cache
            .write_log(&cancel, &key("a", "1", 0, 1), &mut out)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::ProviderNotFound(_)));
        assert!(out.is_empty());
    }
}
