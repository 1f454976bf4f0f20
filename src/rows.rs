//! Rows of the build table: one per build, stage or job.

use crate::model::{JobKey, State};
use crate::text;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;

/// Identity of a row, stable across refreshes.
///
/// `stage_id` and `job_id` are 0 when they don't apply: a build row is
/// `(account, build, 0, 0)`, a stage row `(account, build, stage, 0)`, a job directly under a
/// build `(account, build, 0, job)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct BuildRowKey {
    pub account_id: String,
    pub build_id: String,
    pub stage_id: u64,
    pub job_id: u64,
}

impl BuildRowKey {
    pub fn new(account_id: &str, build_id: &str, stage_id: u64, job_id: u64) -> Self {
        Self {
            account_id: account_id.to_string(),
            build_id: build_id.to_string(),
            stage_id,
            job_id,
        }
    }

    /// Key of the enclosing stage, or of the build for rows outside any stage.
    pub fn stage_parent(&self) -> Self {
        Self {
            job_id: 0,
            ..self.clone()
        }
    }

    pub fn build_parent(&self) -> Self {
        Self {
            stage_id: 0,
            job_id: 0,
            ..self.clone()
        }
    }

    pub fn job_key(&self) -> JobKey {
        JobKey {
            account_id: self.account_id.clone(),
            build_id: self.build_id.clone(),
            stage_id: self.stage_id,
            job_id: self.job_id,
        }
    }
}

impl fmt::Display for BuildRowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.account_id, self.build_id, self.stage_id, self.job_id
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowKind {
    Pipeline,
    Stage,
    Job,
}

impl RowKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RowKind::Pipeline => "P",
            RowKind::Stage => "S",
            RowKind::Job => "J",
        }
    }
}

/// Columns of the build table, in display order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Column {
    Account,
    State,
    Name,
    Build,
    Stage,
    Job,
    Type,
    Id,
    Started,
    Finished,
    Updated,
}

impl Column {
    pub const ALL: [Column; 11] = [
        Column::Account,
        Column::State,
        Column::Name,
        Column::Build,
        Column::Stage,
        Column::Job,
        Column::Type,
        Column::Id,
        Column::Started,
        Column::Finished,
        Column::Updated,
    ];

    pub fn header(self) -> &'static str {
        match self {
            Column::Account => "ACCOUNT",
            Column::State => "STATE",
            Column::Name => "NAME",
            Column::Build => "BUILD",
            Column::Stage => "STAGE",
            Column::Job => "JOB",
            Column::Type => "TYPE",
            Column::Id => "ID",
            Column::Started => "STARTED",
            Column::Finished => "FINISHED",
            Column::Updated => "UPDATED",
        }
    }
}

/// What the table renderer needs from a row.
pub trait TabularRow {
    type Key;

    fn key(&self) -> Self::Key;
    fn url(&self) -> &str;
    /// Display value of every column. Timestamps are shown relative to `now`.
    fn tabular(&self, now: DateTime<Utc>) -> BTreeMap<Column, String>;
}

/// Shown in place of an absent timestamp.
pub const NULL_PLACEHOLDER: &str = "-";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRow {
    pub key: BuildRowKey,
    pub kind: RowKind,
    pub id: String,
    pub state: State,
    pub name: String,
    /// Tree-drawing prefix put in front of the name. Only meaningful for visible rows.
    pub prefix: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub url: String,
    /// Expanded in the tree.
    pub traversable: bool,
}

impl BuildRow {
    /// `true` if any displayed value contains `search`.
    pub fn matches(&self, search: &str, now: DateTime<Utc>) -> bool {
        self.tabular(now).values().any(|value| value.contains(search))
    }
}

impl TabularRow for BuildRow {
    type Key = BuildRowKey;

    fn key(&self) -> BuildRowKey {
        self.key.clone()
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn tabular(&self, now: DateTime<Utc>) -> BTreeMap<Column, String> {
        let time = |t: Option<DateTime<Utc>>| {
            t.map_or_else(|| NULL_PLACEHOLDER.to_string(), |t| text::elapsed_since(t, now))
        };

        BTreeMap::from([
            (Column::Account, self.key.account_id.clone()),
            (Column::State, self.state.to_string()),
            (Column::Name, format!("{}{}", self.prefix, self.name)),
            (Column::Build, self.key.build_id.clone()),
            (Column::Stage, self.key.stage_id.to_string()),
            (Column::Job, self.key.job_id.to_string()),
            (Column::Type, self.kind.as_str().to_string()),
            (Column::Id, self.id.clone()),
            (Column::Started, time(self.started_at)),
            (Column::Finished, time(self.finished_at)),
            (Column::Updated, time(self.updated_at)),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> BuildRow {
        BuildRow {
            key: BuildRowKey::new("travis", "42", 3, 7),
            kind: RowKind::Job,
            id: "7".to_string(),
            state: State::Failed,
            name: "unit tests".to_string(),
            prefix: "├── ".to_string(),
            started_at: None,
            finished_at: None,
            updated_at: None,
            url: "https://ci.example.com/jobs/7".to_string(),
            traversable: false,
        }
    }

    #[test]
    fn parent_keys_zero_trailing_fields() {
        let key = BuildRowKey::new("a", "1", 2, 3);
        assert_eq!(key.stage_parent(), BuildRowKey::new("a", "1", 2, 0));
        assert_eq!(key.build_parent(), BuildRowKey::new("a", "1", 0, 0));
        assert_eq!(key.to_string(), "a/1/2/3");
    }

    #[test]
    fn tabular_renders_every_column() {
        let cells = row().tabular(Utc::now());
        let columns: Vec<Column> = cells.keys().copied().collect();
        assert_eq!(columns, Column::ALL.to_vec());
        assert_eq!(cells[&Column::Name], "├── unit tests");
        assert_eq!(cells[&Column::State], "failed");
        assert_eq!(cells[&Column::Type], "J");
        assert_eq!(cells[&Column::Stage], "3");
        assert_eq!(cells[&Column::Started], NULL_PLACEHOLDER);
    }

    #[test]
    fn tabular_formats_timestamps_relative_to_now() {
        let now = Utc::now();
        let mut r = row();
        r.finished_at = Some(now - chrono::Duration::seconds(65));
        assert_eq!(r.tabular(now)[&Column::Finished], "1m 5s ago");
    }

    #[test]
    fn matches_any_displayed_value() {
        let now = Utc::now();
        let r = row();
        assert!(r.matches("unit", now));
        assert!(r.matches("travis", now));
        assert!(r.matches("├", now));
        assert!(!r.matches("deploy", now));
    }
}
