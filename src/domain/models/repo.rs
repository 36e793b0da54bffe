//! Repo registry domain model.
//!
//! The registry is an ordered list of source repositories. Order is
//! priority: the first active entry is the default repo for tasks and
//! goals submitted without one. The whole list is persisted under a single
//! storage key so a reorder is one atomic write.

use serde::{Deserialize, Serialize};

/// Whether a repository is eligible for scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepoStatus {
    Active,
    Paused,
}

impl RepoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
        }
    }
}

/// One repository entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoEntry {
    /// Stable id derived from the URL.
    pub id: String,
    pub url: String,
    pub name: String,
    pub status: RepoStatus,
}

impl RepoEntry {
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            id: slug_of(&url),
            name: name_of(&url),
            url,
            status: RepoStatus::Active,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == RepoStatus::Active
    }
}

/// The full ordered registry. Index = priority (0 is highest).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoList {
    pub entries: Vec<RepoEntry>,
}

impl RepoList {
    /// The top-priority active entry, the default repo for submissions.
    pub fn default_repo(&self) -> Option<&RepoEntry> {
        self.entries.iter().find(|e| e.is_active())
    }

    pub fn get(&self, id: &str) -> Option<&RepoEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// Find the entry for a repo URL, if registered.
    pub fn by_url(&self, url: &str) -> Option<&RepoEntry> {
        self.entries.iter().find(|e| e.url == url)
    }

    /// Add an entry at the end; no-op when the id already exists.
    pub fn add(&mut self, entry: RepoEntry) -> bool {
        if self.get(&entry.id).is_some() {
            return false;
        }
        self.entries.push(entry);
        true
    }

    /// Remove by id; returns whether anything was removed.
    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        self.entries.len() != before
    }

    /// Swap the entry one position toward the front.
    pub fn move_up(&mut self, id: &str) -> bool {
        match self.entries.iter().position(|e| e.id == id) {
            Some(i) if i > 0 => {
                self.entries.swap(i, i - 1);
                true
            }
            _ => false,
        }
    }

    /// Swap the entry one position toward the back.
    pub fn move_down(&mut self, id: &str) -> bool {
        match self.entries.iter().position(|e| e.id == id) {
            Some(i) if i + 1 < self.entries.len() => {
                self.entries.swap(i, i + 1);
                true
            }
            _ => false,
        }
    }

    pub fn set_status(&mut self, id: &str, status: RepoStatus) -> bool {
        match self.entries.iter_mut().find(|e| e.id == id) {
            Some(entry) => {
                entry.status = status;
                true
            }
            None => false,
        }
    }

    /// Whether the URL belongs to a paused entry. Unregistered URLs are
    /// schedulable, so only a positive pause match returns true.
    pub fn is_paused(&self, url: &str) -> bool {
        self.by_url(url).is_some_and(|e| e.status == RepoStatus::Paused)
    }
}

/// URL -> stable slug id (`github.com/acme/widgets` -> `github.com-acme-widgets`).
fn slug_of(url: &str) -> String {
    url.trim_end_matches('/')
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches(".git")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' { c } else { '-' })
        .collect()
}

/// Last path segment of the URL as a display name.
fn name_of(url: &str) -> String {
    url.trim_end_matches('/')
        .trim_end_matches(".git")
        .rsplit('/')
        .next()
        .unwrap_or(url)
        .to_string()
}

/// Deterministic repo URL -> local workspace path mapping.
///
/// Stands in for the workspace-manager collaborator; it only needs to be a
/// deterministic function of the URL.
pub fn local_path_for(workspace_root: &std::path::Path, url: &str) -> std::path::PathBuf {
    workspace_root.join(slug_of(url))
}
