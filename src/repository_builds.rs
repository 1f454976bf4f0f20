//! Tree projection of the cached builds, flattened into the rows shown by the dashboard.
//!
//! Each build is a tree: the build row, then its stage-less jobs, then its stages with their
//! jobs. Only expanded ("traversable") nodes show their children. The flattened view is rebuilt
//! lazily after any change to the trees or to the expansion state.

use crate::cache::Cache;
use crate::error::{CacheError, Result};
use crate::model::{Build, Job, JobKey, Stage};
use crate::rows::{BuildRow, BuildRowKey, RowKind};
use crate::tree::{self, TreeNode};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
struct RowTree {
    row: BuildRow,
    children: Vec<RowTree>,
}

impl TreeNode for RowTree {
    fn traversable(&self) -> bool {
        self.row.traversable
    }

    fn set_prefix(&mut self, prefix: String) {
        self.row.prefix = prefix;
    }

    fn children(&self) -> &[Self] {
        &self.children
    }

    fn children_mut(&mut self) -> &mut [Self] {
        &mut self.children
    }
}

impl RowTree {
    fn from_build(build: &Build) -> Self {
        let account_id = build
            .repository
            .as_ref()
            .map_or("", |repository| repository.account_id.as_str());
        let id = if build.repo_build_number.is_empty() {
            build.id.clone()
        } else {
            build.repo_build_number.clone()
        };

        // Stage-less jobs come first, then stages, each group in ascending ID order.
        let children = build
            .jobs
            .values()
            .map(|job| Self::from_job(account_id, &build.id, 0, job))
            .chain(
                build
                    .stages
                    .values()
                    .map(|stage| Self::from_stage(account_id, &build.id, stage)),
            )
            .collect();

        RowTree {
            row: BuildRow {
                key: BuildRowKey::new(account_id, &build.id, 0, 0),
                kind: RowKind::Pipeline,
                id,
                state: build.state,
                name: build.commit.message.lines().next().unwrap_or("").to_string(),
                prefix: String::new(),
                started_at: build.started_at,
                finished_at: build.finished_at,
                updated_at: Some(build.updated_at),
                url: build.web_url.clone(),
                traversable: false,
            },
            children,
        }
    }

    fn from_stage(account_id: &str, build_id: &str, stage: &Stage) -> Self {
        RowTree {
            row: BuildRow {
                key: BuildRowKey::new(account_id, build_id, stage.id, 0),
                kind: RowKind::Stage,
                id: stage.id.to_string(),
                state: stage.state,
                name: stage.name.clone(),
                prefix: String::new(),
                started_at: None,
                finished_at: None,
                updated_at: None,
                url: String::new(),
                traversable: false,
            },
            children: stage
                .jobs
                .values()
                .map(|job| Self::from_job(account_id, build_id, stage.id, job))
                .collect(),
        }
    }

    fn from_job(account_id: &str, build_id: &str, stage_id: u64, job: &Job) -> Self {
        RowTree {
            row: BuildRow {
                key: BuildRowKey::new(account_id, build_id, stage_id, job.id),
                kind: RowKind::Job,
                id: job.id.to_string(),
                state: job.state,
                name: job.name.clone(),
                prefix: String::new(),
                started_at: job.started_at,
                finished_at: job.finished_at,
                updated_at: job.last_activity(),
                url: job.web_url.clone(),
                traversable: false,
            },
            children: Vec::new(),
        }
    }
}

/// Path of child indices from the forest root down to a node.
type TreePath = Vec<usize>;

fn index_tree(node: &RowTree, path: &mut TreePath, index: &mut HashMap<BuildRowKey, TreePath>) {
    index.insert(node.row.key.clone(), path.clone());
    for (i, child) in node.children.iter().enumerate() {
        path.push(i);
        index_tree(child, path, index);
        path.pop();
    }
}

/// Number of rows to show before and after a search match so that the viewport moves as little
/// as possible. Indices are positions in the flattened view.
fn match_window(top: usize, bottom: usize, active: usize, matched: usize) -> (usize, usize) {
    let nbr_rows = (bottom + 1).saturating_sub(top).max(1);
    if matched > active {
        let max = bottom.max(matched);
        let min = top.max((max + 1).saturating_sub(nbr_rows));
        (matched.saturating_sub(min), max - matched)
    } else {
        let min = top.min(matched);
        let max = bottom.min(min + nbr_rows - 1);
        (matched - min, max.saturating_sub(matched))
    }
}

/// Live view of the builds held by a [`Cache`].
#[derive(Clone)]
pub struct RepositoryBuilds {
    cache: Cache,
    repository_url: String,
    rows: Vec<RowTree>,
    tree_index: HashMap<BuildRowKey, TreePath>,
    dfs_traversal: Vec<BuildRow>,
    dfs_index: HashMap<BuildRowKey, usize>,
    dfs_up_to_date: bool,
}

impl RepositoryBuilds {
    pub fn new(cache: Cache, repository_url: &str) -> Self {
        Self {
            cache,
            repository_url: repository_url.to_string(),
            rows: Vec::new(),
            tree_index: HashMap::new(),
            dfs_traversal: Vec::new(),
            dfs_index: HashMap::new(),
            dfs_up_to_date: false,
        }
    }

    pub fn repository_url(&self) -> &str {
        &self.repository_url
    }

    /// Rebuilds the trees from the current content of the cache.
    ///
    /// Builds are ordered by last update, most recent first. Nodes that were expanded before the
    /// call stay expanded.
    pub fn fetch_rows(&mut self) {
        let expanded: HashSet<BuildRowKey> = self
            .rows
            .iter()
            .flat_map(|root| tree::depth_first_traversal(root, true))
            .filter(|node| node.row.traversable)
            .map(|node| node.row.key.clone())
            .collect();

        let mut rows: Vec<RowTree> = self.cache.builds().iter().map(RowTree::from_build).collect();
        // Stable: rows without a timestamp keep their relative order at the end.
        rows.sort_by(|a, b| b.row.updated_at.cmp(&a.row.updated_at));

        let mut tree_index = HashMap::new();
        for (i, root) in rows.iter_mut().enumerate() {
            tree::for_each_mut(root, &mut |node: &mut RowTree| {
                if expanded.contains(&node.row.key) {
                    node.row.traversable = true;
                }
            });
            index_tree(root, &mut vec![i], &mut tree_index);
        }

        self.rows = rows;
        self.tree_index = tree_index;
        self.dfs_up_to_date = false;
    }

    fn node(&self, key: &BuildRowKey) -> Option<&RowTree> {
        let (first, rest) = self.tree_index.get(key)?.split_first()?;
        let mut node = self.rows.get(*first)?;
        for &i in rest {
            node = node.children.get(i)?;
        }
        Some(node)
    }

    fn node_mut(&mut self, key: &BuildRowKey) -> Option<&mut RowTree> {
        let (first, rest) = self.tree_index.get(key)?.split_first()?;
        let mut node = self.rows.get_mut(*first)?;
        for &i in rest {
            node = node.children.get_mut(i)?;
        }
        Some(node)
    }

    /// Expands or collapses a row, and with `recursive` all of its descendants. Unknown keys are
    /// ignored.
    pub fn set_traversable(&mut self, key: &BuildRowKey, traversable: bool, recursive: bool) {
        let Some(node) = self.node_mut(key) else {
            return;
        };
        if recursive {
            tree::for_each_mut(node, &mut |n: &mut RowTree| n.row.traversable = traversable);
        } else {
            node.row.traversable = traversable;
        }
        self.dfs_up_to_date = false;
    }

    /// Whether the row is currently expanded. `None` for unknown keys.
    pub fn is_traversable(&self, key: &BuildRowKey) -> Option<bool> {
        self.node(key).map(|node| node.row.traversable)
    }

    pub fn has_active_builds(&self) -> bool {
        self.rows.iter().any(|root| root.row.state.is_active())
    }

    pub fn has_children(&self, key: &BuildRowKey) -> bool {
        self.node(key).is_some_and(|node| !node.children.is_empty())
    }

    fn prefix_and_index(&mut self) {
        if self.dfs_up_to_date {
            return;
        }
        self.dfs_traversal.clear();
        self.dfs_index.clear();
        for root in &mut self.rows {
            tree::prefix_depth_first(root);
            for node in tree::depth_first_traversal(root, false) {
                self.dfs_index
                    .insert(node.row.key.clone(), self.dfs_traversal.len());
                self.dfs_traversal.push(node.row.clone());
            }
        }
        self.dfs_up_to_date = true;
    }

    /// Number of visible rows.
    pub fn len(&mut self) -> usize {
        self.prefix_and_index();
        self.dfs_traversal.len()
    }

    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }

    /// Position of `key` in the flattened view, falling back to its stage then its build when
    /// the row itself is hidden under a collapsed ancestor.
    fn resolve(&self, key: &BuildRowKey) -> Result<usize> {
        [key.clone(), key.stage_parent(), key.build_parent()]
            .iter()
            .find_map(|candidate| self.dfs_index.get(candidate).copied())
            .ok_or_else(|| CacheError::KeyNotFound(key.clone()))
    }

    /// Window of visible rows around `key`: up to `nbr_before` rows before it and `nbr_after`
    /// after. The window is shifted, not shrunk, when it hits either end of the view.
    ///
    /// Returns the rows and the position of the selected row in them.
    pub fn select(
        &mut self,
        key: &BuildRowKey,
        nbr_before: usize,
        nbr_after: usize,
    ) -> Result<(Vec<BuildRow>, usize)> {
        self.prefix_and_index();
        if self.dfs_traversal.is_empty() {
            return Ok((Vec::new(), 0));
        }

        let index = self.resolve(key)?;
        let size = nbr_before.saturating_add(nbr_after).saturating_add(1);
        let len = self.dfs_traversal.len();
        let lower = index.saturating_sub(nbr_before);
        let upper = lower.saturating_add(size).min(len);
        let lower = upper.saturating_sub(size);

        Ok((self.dfs_traversal[lower..upper].to_vec(), index - lower))
    }

    /// The first `limit` visible rows.
    pub fn select_first(&mut self, limit: usize) -> Result<Vec<BuildRow>> {
        self.prefix_and_index();
        let Some(first) = self.dfs_traversal.first() else {
            return Ok(Vec::new());
        };
        if limit == 0 {
            return Ok(Vec::new());
        }
        let key = first.key.clone();
        self.select(&key, 0, limit - 1).map(|(rows, _)| rows)
    }

    /// The last `limit` visible rows.
    pub fn select_last(&mut self, limit: usize) -> Result<Vec<BuildRow>> {
        self.prefix_and_index();
        let Some(last) = self.dfs_traversal.last() else {
            return Ok(Vec::new());
        };
        if limit == 0 {
            return Ok(Vec::new());
        }
        let key = last.key.clone();
        self.select(&key, limit - 1, 0).map(|(rows, _)| rows)
    }

    /// Finds the next visible row, after `active` (or before it when `ascending` is false), with
    /// a displayed value containing `search`. The search wraps around and stops on `active`.
    ///
    /// `top` and `bottom` are the rows at both ends of the current viewport: the returned window
    /// keeps its size and moves only as far as needed to show the match. `Ok(None)` when no other
    /// row matches.
    pub fn next_match(
        &mut self,
        top: &BuildRowKey,
        bottom: &BuildRowKey,
        active: &BuildRowKey,
        search: &str,
        ascending: bool,
    ) -> Result<Option<(Vec<BuildRow>, usize)>> {
        self.prefix_and_index();
        let len = self.dfs_traversal.len();
        if len == 0 {
            return Ok(None);
        }
        let active_index = self.resolve(active)?;
        let top_index = self.resolve(top)?;
        let bottom_index = self.resolve(bottom)?;

        let step = |i: usize| {
            if ascending {
                (i + 1) % len
            } else {
                (i + len - 1) % len
            }
        };

        let now = Utc::now();
        let mut i = step(active_index);
        while i != active_index {
            if self.dfs_traversal[i].matches(search, now) {
                let (before, after) = match_window(top_index, bottom_index, active_index, i);
                let key = self.dfs_traversal[i].key.clone();
                return self.select(&key, before, after).map(Some);
            }
            i = step(i);
        }
        Ok(None)
    }

    /// Creates one log file per job under the row `key` (the row itself included) in `dir`.
    ///
    /// Logs of finished jobs are written before returning. When some jobs are still running, the
    /// returned [`LogStreamer`] follows their logs into the remaining files.
    pub async fn write_to_directory(
        &self,
        cancel: &CancellationToken,
        key: &BuildRowKey,
        dir: &Path,
    ) -> Result<(Vec<PathBuf>, Option<LogStreamer>)> {
        let node = self
            .node(key)
            .ok_or_else(|| CacheError::KeyNotFound(key.clone()))?;
        let job_keys: Vec<JobKey> = tree::depth_first_traversal(node, true)
            .into_iter()
            .filter(|n| n.row.kind == RowKind::Job)
            .map(|n| n.row.key.job_key())
            .collect();

        let mut paths = Vec::new();
        let mut finished = Vec::new();
        let mut active = Vec::new();
        for (job_key, job) in self.cache.fetch_jobs(&job_keys) {
            let prefix = format!("job_{}_", job.id);
            let (file, path) = tempfile::Builder::new()
                .prefix(&prefix)
                .suffix(".log")
                .tempfile_in(dir)?
                .keep()
                .map_err(|e| CacheError::Io(e.error))?;
            tracing::debug!("writing log of job {job_key} to {}", path.display());
            paths.push(path);
            if job.state.is_active() {
                active.push((job_key, file));
            } else {
                finished.push((job_key, file));
            }
        }

        self.cache.write_logs(cancel, finished).await?;

        let streamer = (!active.is_empty()).then(|| LogStreamer {
            cache: self.cache.clone(),
            jobs: active,
        });
        Ok((paths, streamer))
    }
}

/// Follows the logs of running jobs into the files created by
/// [`RepositoryBuilds::write_to_directory`].
pub struct LogStreamer {
    cache: Cache,
    jobs: Vec<(JobKey, File)>,
}

impl LogStreamer {
    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    /// Runs until every job is complete or `cancel` fires.
    pub async fn stream(self, cancel: &CancellationToken) -> Result<()> {
        self.cache.stream_logs(cancel, self.jobs).await
    }
}
