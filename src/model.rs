//! Provider-independent build model and status aggregation.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    Pending,
    Running,
    Passed,
    Failed,
    Canceled,
    Manual,
    Skipped,
    #[default]
    #[serde(other)]
    Unknown,
}

impl State {
    pub fn is_active(self) -> bool {
        matches!(self, State::Pending | State::Running)
    }

    /// Rank used when rolling child statuses up into a parent. Higher wins.
    pub fn precedence(self) -> u8 {
        match self {
            State::Unknown => 80,
            State::Running => 70,
            State::Pending => 60,
            State::Canceled => 50,
            State::Failed => 40,
            State::Passed => 30,
            State::Skipped => 20,
            State::Manual => 10,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            State::Unknown => "unknown",
            State::Pending => "pending",
            State::Running => "running",
            State::Passed => "passed",
            State::Failed => "failed",
            State::Canceled => "canceled",
            State::Manual => "manual",
            State::Skipped => "skipped",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Anything whose status takes part in aggregation.
pub trait Statuser {
    fn status(&self) -> State;
    fn allowed_failure(&self) -> bool;
}

/// Roll the statuses of `items` up into a single status.
///
/// Items that are allowed to fail are ignored while they are failed or canceled, so an
/// optional job cannot fail its parent. Any other item competes on [`State::precedence`].
/// An empty collection aggregates to [`State::Unknown`].
pub fn aggregate_statuses<'a, S, I>(items: I) -> State
where
    S: Statuser + 'a + ?Sized,
    I: IntoIterator<Item = &'a S>,
{
    let mut items = items.into_iter().peekable();
    let Some(first) = items.peek() else {
        return State::Unknown;
    };

    let mut state = first.status();
    for item in items {
        let status = item.status();
        let ignored = item.allowed_failure() && matches!(status, State::Canceled | State::Failed);
        if !ignored && status.precedence() > state.precedence() {
            state = status;
        }
    }
    state
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Account {
    pub id: String,
    pub url: String,
    pub user_id: String,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Repository {
    pub account_id: String,
    pub id: u64,
    pub url: String,
    pub owner: String,
    pub name: String,
}

impl Repository {
    pub fn slug(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Commit {
    pub sha: String,
    pub message: String,
    pub date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Build {
    /// Must be set before the build can be saved in a [`crate::cache::Cache`].
    pub repository: Option<Arc<Repository>>,
    pub id: String,
    pub commit: Commit,
    pub git_ref: String,
    pub is_tag: bool,
    pub repo_build_number: String,
    pub state: State,
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub duration: Option<Duration>,
    pub web_url: String,
    pub stages: BTreeMap<u64, Stage>,
    /// Jobs that don't belong to any stage.
    pub jobs: BTreeMap<u64, Job>,
}

impl Build {
    /// An empty build last updated now.
    pub fn new(repository: Arc<Repository>, id: impl Into<String>) -> Self {
        Self {
            repository: Some(repository),
            id: id.into(),
            commit: Commit::default(),
            git_ref: String::new(),
            is_tag: false,
            repo_build_number: String::new(),
            state: State::Unknown,
            created_at: None,
            started_at: None,
            finished_at: None,
            updated_at: Utc::now(),
            duration: None,
            web_url: String::new(),
            stages: BTreeMap::new(),
            jobs: BTreeMap::new(),
        }
    }

    /// Looks up a job directly under the build (`stage_id == 0`) or inside a stage.
    pub fn get(&self, stage_id: u64, job_id: u64) -> Option<&Job> {
        if stage_id == 0 {
            self.jobs.get(&job_id)
        } else {
            self.stages.get(&stage_id)?.jobs.get(&job_id)
        }
    }

    /// Every job of the build, stage-less jobs first.
    pub fn all_jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs
            .values()
            .chain(self.stages.values().flat_map(|s| s.jobs.values()))
    }
}

impl Statuser for Build {
    fn status(&self) -> State {
        self.state
    }

    fn allowed_failure(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Stage {
    pub id: u64,
    pub name: String,
    pub state: State,
    pub jobs: BTreeMap<u64, Job>,
}

impl Statuser for Stage {
    fn status(&self) -> State {
        self.state
    }

    fn allowed_failure(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Job {
    pub id: u64,
    pub state: State,
    pub name: String,
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration: Option<Duration>,
    /// `None` until fetched from the provider.
    pub log: Option<String>,
    pub web_url: String,
    pub allow_failure: bool,
}

impl Job {
    /// First known timestamp among finished, started and created.
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.finished_at.or(self.started_at).or(self.created_at)
    }
}

impl Statuser for Job {
    fn status(&self) -> State {
        self.state
    }

    fn allowed_failure(&self) -> bool {
        self.allow_failure
    }
}

/// Identifies one job in the cache. `stage_id` is 0 for jobs attached directly to a build.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct JobKey {
    pub account_id: String,
    pub build_id: String,
    pub stage_id: u64,
    pub job_id: u64,
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.account_id, self.build_id, self.stage_id, self.job_id
        )
    }
}
