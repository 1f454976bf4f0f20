//! Dashboard state: a viewport over the rows of a [`RepositoryBuilds`], the search prompt and the
//! status line.
//!
//! The viewport only ever holds the rows on screen. Every move asks the projection for a new
//! window around the active row, so the table scrolls without the state ever holding the full
//! flattened view.

use crate::error::CacheError;
use crate::repository_builds::RepositoryBuilds;
use crate::rows::{BuildRow, BuildRowKey};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::time::Instant;

// Polling intervals (seconds)
pub const POLL_INTERVAL_ACTIVE: u64 = 3;

// UI constants
pub const NOTIFICATION_TTL_SECS: u64 = 5;
pub const SPINNER_FRAME_COUNT: usize = 10;
pub const NARROW_WIDTH_THRESHOLD: u16 = 80;
pub const ERROR_TTL_SECS: u64 = 10;

#[derive(Debug, Clone)]
pub struct Notification {
    pub message: String,
    pub timestamp: Instant,
}

/// Immutable configuration set at startup.
pub struct AppConfig {
    pub log_dir: PathBuf,
    pub version_string: String,
    /// Polling interval while no build is running.
    pub base_interval: u64,
}

/// Everything a background task needs to export the logs of a subtree.
pub struct ExportRequest {
    pub builds: RepositoryBuilds,
    pub key: BuildRowKey,
    pub dir: PathBuf,
}

pub struct AppState {
    pub config: AppConfig,
    builds: RepositoryBuilds,

    // Viewport
    pub rows: Vec<BuildRow>,
    pub cursor: usize,
    pub height: usize,

    // Search
    pub search: Option<String>,
    /// Text typed so far while the search prompt is open.
    pub prompt: Option<String>,

    // Polling
    pub last_refresh: Option<DateTime<Utc>>,
    pub poll_interval: u64,
    pub loading: bool,

    // Transient UI
    pub notifications: Vec<Notification>,
    pub error: Option<(String, Instant)>,
    pub spinner_frame: usize,
    pub should_quit: bool,
}

impl AppState {
    pub fn new(config: AppConfig, builds: RepositoryBuilds) -> Self {
        let poll_interval = config.base_interval;
        Self {
            config,
            builds,
            rows: Vec::new(),
            cursor: 0,
            height: 1,
            search: None,
            prompt: None,
            last_refresh: None,
            poll_interval,
            loading: true,
            notifications: Vec::new(),
            error: None,
            spinner_frame: 0,
            should_quit: false,
        }
    }

    pub fn active_row(&self) -> Option<&BuildRow> {
        self.rows.get(self.cursor)
    }

    fn active_key(&self) -> Option<BuildRowKey> {
        self.active_row().map(|row| row.key.clone())
    }

    /// Keeps at most `height` rows, with the row at `cursor` visible.
    fn set_window(&mut self, mut rows: Vec<BuildRow>, cursor: usize) {
        let mut cursor = cursor.min(rows.len().saturating_sub(1));
        if rows.len() > self.height {
            let start = (cursor + 1).saturating_sub(self.height);
            rows = rows.into_iter().skip(start).take(self.height).collect();
            cursor -= start;
        }
        self.rows = rows;
        self.cursor = cursor;
    }

    /// Recomputes the window around the active row, keeping it at the same screen position.
    pub fn reselect(&mut self) {
        match self.active_key() {
            Some(key) => self.select_around(&key),
            None => self.go_top(),
        }
    }

    fn select_around(&mut self, key: &BuildRowKey) {
        let after = self.height.saturating_sub(self.cursor + 1);
        match self.builds.select(key, self.cursor, after) {
            Ok((rows, index)) => self.set_window(rows, index),
            // The active build left the cache
            Err(CacheError::KeyNotFound(_)) => self.go_top(),
            Err(e) => self.set_error(e.to_string()),
        }
    }

    /// Rebuilds the rows from the cache after an update.
    pub fn refresh_rows(&mut self) {
        self.builds.fetch_rows();
        self.reselect();
    }

    /// Number of table rows that fit on screen.
    pub fn set_height(&mut self, height: usize) {
        let height = height.max(1);
        if height != self.height {
            let key = self.active_key();
            self.height = height;
            self.cursor = self.cursor.min(height - 1);
            match key {
                Some(key) => self.select_around(&key),
                None => self.go_top(),
            }
        }
    }

    pub fn move_cursor_down(&mut self) {
        if self.cursor + 1 < self.rows.len() {
            self.cursor += 1;
            return;
        }
        let Some(key) = self.active_key() else {
            return;
        };
        // Active row is the last one on screen: scroll by one.
        match self.builds.select(&key, self.height.saturating_sub(2), 1) {
            Ok((rows, index)) => {
                let next = if index + 1 < rows.len() { index + 1 } else { index };
                self.set_window(rows, next);
            }
            Err(e) => self.set_error(e.to_string()),
        }
    }

    pub fn move_cursor_up(&mut self) {
        if self.cursor > 0 {
            self.cursor -= 1;
            return;
        }
        let Some(key) = self.active_key() else {
            return;
        };
        match self.builds.select(&key, 1, self.height.saturating_sub(2)) {
            Ok((rows, index)) => self.set_window(rows, index.saturating_sub(1)),
            Err(e) => self.set_error(e.to_string()),
        }
    }

    pub fn page_down(&mut self) {
        for _ in 0..self.height {
            self.move_cursor_down();
        }
    }

    pub fn page_up(&mut self) {
        for _ in 0..self.height {
            self.move_cursor_up();
        }
    }

    pub fn go_top(&mut self) {
        match self.builds.select_first(self.height) {
            Ok(rows) => self.set_window(rows, 0),
            Err(e) => self.set_error(e.to_string()),
        }
    }

    pub fn go_bottom(&mut self) {
        match self.builds.select_last(self.height) {
            Ok(rows) => {
                let last = rows.len().saturating_sub(1);
                self.set_window(rows, last);
            }
            Err(e) => self.set_error(e.to_string()),
        }
    }

    fn set_traversable(&mut self, traversable: bool, recursive: bool) {
        if let Some(key) = self.active_key() {
            self.builds.set_traversable(&key, traversable, recursive);
            self.reselect();
        }
    }

    pub fn expand_current(&mut self) {
        self.set_traversable(true, false);
    }

    pub fn expand_all(&mut self) {
        self.set_traversable(true, true);
    }

    pub fn collapse_all(&mut self) {
        self.set_traversable(false, true);
    }

    /// Collapses the active row, or its parent when the row has nothing to hide. The collapsed
    /// row becomes active.
    pub fn collapse_current(&mut self) {
        let Some(key) = self.active_key() else {
            return;
        };
        let expanded = self.builds.has_children(&key)
            && self.builds.is_traversable(&key).unwrap_or(false);
        let target = if expanded {
            key
        } else if key.job_id != 0 && key.stage_id != 0 {
            key.stage_parent()
        } else {
            key.build_parent()
        };
        self.builds.set_traversable(&target, false, false);
        // Hidden rows resolve to their closest visible ancestor.
        self.reselect();
    }

    pub fn toggle_expand(&mut self) {
        let Some(key) = self.active_key() else {
            return;
        };
        let expanded = self.builds.is_traversable(&key).unwrap_or(false);
        self.set_traversable(!expanded, false);
    }

    // --- Search ---

    pub fn start_search(&mut self) {
        self.prompt = Some(String::new());
    }

    pub fn is_searching(&self) -> bool {
        self.prompt.is_some()
    }

    pub fn search_input(&mut self, c: char) {
        if let Some(prompt) = &mut self.prompt {
            prompt.push(c);
        }
    }

    pub fn search_backspace(&mut self) {
        if let Some(prompt) = &mut self.prompt {
            prompt.pop();
        }
    }

    pub fn cancel_search(&mut self) {
        self.prompt = None;
    }

    pub fn submit_search(&mut self) {
        let Some(text) = self.prompt.take() else {
            return;
        };
        if text.is_empty() {
            return;
        }
        self.search = Some(text);
        self.find(true);
    }

    /// Moves to the next row matching the last search, downwards when `ascending`.
    pub fn find(&mut self, ascending: bool) {
        let Some(search) = self.search.clone() else {
            self.notify("No search yet: press / to search".to_string());
            return;
        };
        let (Some(top), Some(bottom), Some(active)) = (
            self.rows.first().map(|r| r.key.clone()),
            self.rows.last().map(|r| r.key.clone()),
            self.active_key(),
        ) else {
            return;
        };
        match self
            .builds
            .next_match(&top, &bottom, &active, &search, ascending)
        {
            Ok(Some((rows, index))) => self.set_window(rows, index),
            Ok(None) => self.notify(format!("No match for '{search}'")),
            Err(e) => self.set_error(e.to_string()),
        }
    }

    // --- Actions run in the background ---

    pub fn export_request(&self) -> Option<ExportRequest> {
        Some(ExportRequest {
            builds: self.builds.clone(),
            key: self.active_key()?,
            dir: self.config.log_dir.clone(),
        })
    }

    pub fn on_exported(&mut self, paths: &[PathBuf], streaming: bool) {
        let mut message = format!(
            "Wrote {} log file(s) to {}",
            paths.len(),
            self.config.log_dir.display()
        );
        if streaming {
            message.push_str(", following running jobs");
        }
        self.notify(message);
    }

    pub fn repository_url(&self) -> &str {
        self.builds.repository_url()
    }

    pub fn active_url(&self) -> Option<&str> {
        self.active_row()
            .map(|row| row.url.as_str())
            .filter(|url| !url.is_empty())
    }

    /// Whether a build of the repository is still pending or running.
    pub fn has_active_builds(&self) -> bool {
        self.builds.has_active_builds()
    }

    /// Polling interval suited to the current activity.
    pub fn desired_interval(&self) -> u64 {
        if self.has_active_builds() {
            POLL_INTERVAL_ACTIVE.min(self.config.base_interval)
        } else {
            self.config.base_interval
        }
    }

    // --- Status line ---

    pub fn notify(&mut self, message: String) {
        self.notifications.push(Notification {
            message,
            timestamp: Instant::now(),
        });
    }

    pub fn prune_notifications(&mut self) {
        let now = Instant::now();
        self.notifications
            .retain(|n| now.duration_since(n.timestamp).as_secs() < NOTIFICATION_TTL_SECS);
    }

    pub fn advance_spinner(&mut self) {
        self.spinner_frame = (self.spinner_frame + 1) % SPINNER_FRAME_COUNT;
    }

    pub fn set_error(&mut self, msg: String) {
        self.error = Some((msg, Instant::now()));
    }

    pub fn clear_error(&mut self) {
        self.error = None;
    }

    pub fn prune_error(&mut self) {
        if let Some((_, ts)) = &self.error {
            if ts.elapsed().as_secs() >= ERROR_TTL_SECS {
                self.error = None;
            }
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error.as_ref().map(|(msg, _)| msg.as_str())
    }
}
