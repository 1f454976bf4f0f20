//! JSON wire format spoken by provider programs, converted into the build model.
//!
//! `builds` answers with
//!
//! ```json
//! {"repository": {"id": 1, "url": "...", "owner": "...", "name": "..."},
//!  "builds": [{"id": "42", "state": "passed", "stages": [...], "jobs": [...], ...}]}
//! ```
//!
//! where a `null` repository means the provider doesn't know it. `log` answers with
//! `{"log": "...", "complete": true}`.

use crate::model::{aggregate_statuses, Build, Commit, Job, Repository, Stage, State};
use crate::provider::JobLog;
use chrono::{DateTime, Utc};
use color_eyre::eyre::{eyre, Result};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

const MAX_RESPONSE_SIZE: usize = 10 * 1024 * 1024; // 10 MB

pub fn check_response_size(json: &str) -> Result<()> {
    if json.len() > MAX_RESPONSE_SIZE {
        return Err(eyre!(
            "Response too large ({:.1} MB, max {} MB)",
            json.len() as f64 / (1024.0 * 1024.0),
            MAX_RESPONSE_SIZE / (1024 * 1024)
        ));
    }
    Ok(())
}

// -- Intermediate wire structs --

#[derive(Deserialize, Debug)]
struct WireBuilds {
    repository: Option<WireRepository>,
    #[serde(default)]
    builds: Vec<WireBuild>,
}

#[derive(Deserialize, Debug)]
struct WireRepository {
    #[serde(default)]
    id: u64,
    url: String,
    #[serde(default)]
    owner: String,
    #[serde(default)]
    name: String,
}

#[derive(Deserialize, Debug, Default)]
struct WireCommit {
    #[serde(default)]
    sha: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    date: Option<String>,
}

#[derive(Deserialize, Debug)]
struct WireBuild {
    id: String,
    #[serde(default)]
    number: String,
    #[serde(default)]
    state: Option<State>,
    #[serde(default, rename = "ref")]
    git_ref: String,
    #[serde(default)]
    is_tag: bool,
    #[serde(default)]
    commit: WireCommit,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    started_at: Option<String>,
    #[serde(default)]
    finished_at: Option<String>,
    #[serde(default)]
    updated_at: Option<String>,
    /// Seconds.
    #[serde(default)]
    duration: Option<u64>,
    #[serde(default)]
    web_url: String,
    #[serde(default)]
    stages: Vec<WireStage>,
    #[serde(default)]
    jobs: Vec<WireJob>,
}

#[derive(Deserialize, Debug)]
struct WireStage {
    id: u64,
    #[serde(default)]
    name: String,
    #[serde(default)]
    state: Option<State>,
    #[serde(default)]
    jobs: Vec<WireJob>,
}

#[derive(Deserialize, Debug)]
struct WireJob {
    id: u64,
    #[serde(default)]
    name: String,
    #[serde(default)]
    state: State,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    started_at: Option<String>,
    #[serde(default)]
    finished_at: Option<String>,
    #[serde(default)]
    duration: Option<u64>,
    #[serde(default)]
    web_url: String,
    #[serde(default)]
    allow_failure: bool,
}

#[derive(Deserialize, Debug)]
struct WireLog {
    log: String,
    #[serde(default)]
    complete: bool,
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

fn parse_optional_datetime(s: Option<&str>) -> Option<DateTime<Utc>> {
    s.and_then(|s| parse_datetime(s).ok())
}

impl From<WireJob> for Job {
    fn from(j: WireJob) -> Self {
        Job {
            id: j.id,
            state: j.state,
            name: j.name,
            created_at: parse_optional_datetime(j.created_at.as_deref()),
            started_at: parse_optional_datetime(j.started_at.as_deref()),
            finished_at: parse_optional_datetime(j.finished_at.as_deref()),
            duration: j.duration.map(Duration::from_secs),
            log: None,
            web_url: j.web_url,
            allow_failure: j.allow_failure,
        }
    }
}

impl From<WireStage> for Stage {
    fn from(s: WireStage) -> Self {
        let jobs = s.jobs.into_iter().map(|j| (j.id, Job::from(j))).collect();
        let mut stage = Stage {
            id: s.id,
            name: s.name,
            state: State::Unknown,
            jobs,
        };
        // Providers that only report job statuses get the stage status rolled up.
        stage.state = s
            .state
            .unwrap_or_else(|| aggregate_statuses(stage.jobs.values()));
        stage
    }
}

fn build_from_wire(repository: &Arc<Repository>, b: WireBuild) -> Build {
    let mut build = Build::new(Arc::clone(repository), b.id);
    build.repo_build_number = b.number;
    build.git_ref = b.git_ref;
    build.is_tag = b.is_tag;
    build.commit = Commit {
        sha: b.commit.sha,
        message: b.commit.message,
        date: parse_optional_datetime(b.commit.date.as_deref()),
    };
    build.created_at = parse_optional_datetime(b.created_at.as_deref());
    build.started_at = parse_optional_datetime(b.started_at.as_deref());
    build.finished_at = parse_optional_datetime(b.finished_at.as_deref());
    if let Some(updated_at) = parse_optional_datetime(b.updated_at.as_deref()) {
        build.updated_at = updated_at;
    }
    build.duration = b.duration.map(Duration::from_secs);
    build.web_url = b.web_url;
    build.jobs = b.jobs.into_iter().map(|j| (j.id, Job::from(j))).collect();
    build.stages = b.stages.into_iter().map(|s| (s.id, Stage::from(s))).collect();
    build.state = b
        .state
        .unwrap_or_else(|| aggregate_statuses(build.all_jobs()));
    build
}

/// Parses the answer to `builds`. `Ok(None)` when the provider doesn't know the repository.
pub fn parse_builds(account_id: &str, json: &str) -> Result<Option<Vec<Build>>> {
    check_response_size(json)?;
    let wire: WireBuilds =
        serde_json::from_str(json).map_err(|e| eyre!("Failed to parse builds: {e}"))?;
    let Some(repository) = wire.repository else {
        return Ok(None);
    };
    let repository = Arc::new(Repository {
        account_id: account_id.to_string(),
        id: repository.id,
        url: repository.url,
        owner: repository.owner,
        name: repository.name,
    });

    Ok(Some(
        wire.builds
            .into_iter()
            .map(|b| build_from_wire(&repository, b))
            .collect(),
    ))
}

pub fn parse_log(json: &str) -> Result<JobLog> {
    check_response_size(json)?;
    let wire: WireLog = serde_json::from_str(json).map_err(|e| eyre!("Failed to parse log: {e}"))?;
    Ok(JobLog {
        text: wire.log,
        complete: wire.complete,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const BUILDS: &str = r#"{
        "repository": {"id": 7, "url": "https://example.com/owner/repo", "owner": "owner", "name": "repo"},
        "builds": [{
            "id": "1001",
            "number": "42",
            "ref": "main",
            "commit": {"sha": "abc123", "message": "Fix parser\n\nDetails", "date": "2024-01-15T10:00:00Z"},
            "started_at": "2024-01-15T10:01:00Z",
            "updated_at": "2024-01-15T10:05:00+02:00",
            "duration": 240,
            "web_url": "https://ci.example.com/builds/1001",
            "jobs": [{"id": 1, "name": "lint", "state": "passed"}],
            "stages": [{
                "id": 2,
                "name": "test",
                "jobs": [
                    {"id": 3, "name": "unit", "state": "running", "started_at": "2024-01-15T10:02:00Z"},
                    {"id": 4, "name": "flaky", "state": "failed", "allow_failure": true}
                ]
            }]
        }]
    }"#;

    #[test]
    fn parse_builds_full() {
        let builds = parse_builds("travis", BUILDS).unwrap().unwrap();
        assert_eq!(builds.len(), 1);
        let build = &builds[0];

        let repository = build.repository.as_ref().unwrap();
        assert_eq!(repository.account_id, "travis");
        assert_eq!(repository.slug(), "owner/repo");
        assert_eq!(build.id, "1001");
        assert_eq!(build.repo_build_number, "42");
        assert_eq!(build.git_ref, "main");
        assert_eq!(build.commit.sha, "abc123");
        assert_eq!(build.duration, Some(Duration::from_secs(240)));
        assert_eq!(
            build.updated_at,
            parse_datetime("2024-01-15T08:05:00Z").unwrap()
        );
        assert!(build.finished_at.is_none());

        assert_eq!(build.jobs[&1].state, State::Passed);
        let stage = &build.stages[&2];
        assert_eq!(stage.jobs.len(), 2);
        assert!(stage.jobs[&4].allow_failure);
        assert_eq!(
            stage.jobs[&3].started_at,
            Some(parse_datetime("2024-01-15T10:02:00Z").unwrap())
        );
    }

    #[test]
    fn parse_builds_aggregates_missing_statuses() {
        let builds = parse_builds("travis", BUILDS).unwrap().unwrap();
        assert_eq!(builds[0].stages[&2].state, State::Running);
        assert_eq!(builds[0].state, State::Running);
    }

    #[test]
    fn parse_builds_keeps_reported_statuses() {
        let json = r#"{"repository": {"url": "u"}, "builds": [
            {"id": "1", "state": "canceled", "jobs": [{"id": 1, "state": "passed"}]}
        ]}"#;
        let builds = parse_builds("a", json).unwrap().unwrap();
        assert_eq!(builds[0].state, State::Canceled);
    }

    #[test]
    fn parse_builds_unknown_repository() {
        let json = r#"{"repository": null, "builds": []}"#;
        assert_eq!(parse_builds("a", json).unwrap(), None);
    }

    #[test]
    fn parse_unknown_state() {
        let json = r#"{"repository": {"url": "u"}, "builds": [
            {"id": "1", "jobs": [{"id": 1, "state": "waiting_for_resource"}]}
        ]}"#;
        let builds = parse_builds("a", json).unwrap().unwrap();
        assert_eq!(builds[0].jobs[&1].state, State::Unknown);
    }

    #[test]
    fn parse_unrecognised_reported_states() {
        let json = r#"{"repository": {"url": "u"}, "builds": [
            {"id": "1", "state": "errored", "stages": [
                {"id": 2, "state": "blocked", "jobs": [{"id": 3, "state": "passed"}]}
            ]}
        ]}"#;
        let builds = parse_builds("a", json).unwrap().unwrap();
        assert_eq!(builds[0].state, State::Unknown);
        assert_eq!(builds[0].stages[&2].state, State::Unknown);
        assert_eq!(builds[0].stages[&2].jobs[&3].state, State::Passed);
    }

    #[test]
    fn parse_build_without_jobs_is_unknown() {
        let json = r#"{"repository": {"url": "u"}, "builds": [{"id": "1"}]}"#;
        let builds = parse_builds("a", json).unwrap().unwrap();
        assert_eq!(builds[0].state, State::Unknown);
        assert!(builds[0].stages.is_empty());
    }

    #[test]
    fn parse_invalid_timestamps_are_dropped() {
        let json = r#"{"repository": {"url": "u"}, "builds": [
            {"id": "1", "started_at": "yesterday", "jobs": [{"id": 1, "finished_at": "soon"}]}
        ]}"#;
        let builds = parse_builds("a", json).unwrap().unwrap();
        assert!(builds[0].started_at.is_none());
        assert!(builds[0].jobs[&1].finished_at.is_none());
    }

    #[test]
    fn parse_invalid_json_error() {
        let err = parse_builds("a", "not json").unwrap_err();
        assert!(err.to_string().contains("Failed to parse builds"));
    }

    #[test]
    fn parse_missing_fields_error() {
        let json = r#"{"repository": {"url": "u"}, "builds": [{"number": "1"}]}"#;
        assert!(parse_builds("a", json).is_err());
    }

    #[test]
    fn parse_log_basic() {
        let log = parse_log(r#"{"log": "line 1\nline 2", "complete": true}"#).unwrap();
        assert_eq!(
            log,
            JobLog {
                text: "line 1\nline 2".to_string(),
                complete: true
            }
        );
        let partial = parse_log(r#"{"log": ""}"#).unwrap();
        assert!(!partial.complete);
    }

    #[test]
    fn oversized_response_is_rejected() {
        let json = format!(r#"{{"log": "{}"}}"#, "x".repeat(MAX_RESPONSE_SIZE));
        let err = parse_log(&json).unwrap_err();
        assert!(err.to_string().contains("Response too large"));
    }
}
