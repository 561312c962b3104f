//! Per-session version control: file states and the commit log.

use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::{debug, info};

use super::{FileStatus, GitCommit, GitStatus, VcsError, VcsResult, DEFAULT_BRANCH};

/// Per-file status plus the commit log of one session.
///
/// A file has exactly one status at a time, so the staged, unstaged and
/// untracked sets reported by [`get_status`](Self::get_status) never overlap.
#[derive(Debug, Clone)]
pub struct VersionControl {
    files: BTreeMap<String, FileStatus>,
    /// Most recent first
    commits: VecDeque<GitCommit>,
    branches: Vec<String>,
    current_branch: String,
}

impl VersionControl {
    pub fn new() -> Self {
        Self {
            files: BTreeMap::new(),
            commits: VecDeque::new(),
            branches: vec![DEFAULT_BRANCH.to_string()],
            current_branch: DEFAULT_BRANCH.to_string(),
        }
    }

    /// Register a freshly created file; returns false if it is already known
    pub fn track_new_file(&mut self, file: &str) -> bool {
        if self.files.contains_key(file) {
            return false;
        }
        self.files.insert(file.to_string(), FileStatus::Untracked);
        true
    }

    /// React to an edit of `file`.
    ///
    /// Any edit leaves the file unstaged, including the first edit of a file
    /// never registered through [`track_new_file`](Self::track_new_file).
    pub fn on_document_changed(&mut self, file: &str) {
        if self.files.insert(file.to_string(), FileStatus::Unstaged) != Some(FileStatus::Unstaged) {
            debug!("{} has unstaged changes", file);
        }
    }

    fn check_stageable(&self, file: &str) -> VcsResult<()> {
        match self.files.get(file).copied() {
            Some(FileStatus::Unstaged) | Some(FileStatus::Untracked) => Ok(()),
            Some(FileStatus::Staged) => Err(VcsError::AlreadyStaged(file.to_string())),
            Some(FileStatus::Clean) | None => Err(VcsError::NothingToStage(file.to_string())),
        }
    }

    pub fn stage(&mut self, file: &str) -> VcsResult<()> {
        self.check_stageable(file)?;
        self.files.insert(file.to_string(), FileStatus::Staged);
        debug!("Staged {}", file);
        Ok(())
    }

    /// Stage several files; on error none of them is staged
    pub fn stage_files<S: AsRef<str>>(&mut self, files: &[S]) -> VcsResult<()> {
        let files: BTreeSet<&str> = files.iter().map(|file| file.as_ref()).collect();
        for file in &files {
            self.check_stageable(file)?;
        }
        for file in files {
            self.stage(file)?;
        }
        Ok(())
    }

    pub fn unstage(&mut self, file: &str) -> VcsResult<()> {
        match self.files.get(file).copied() {
            Some(FileStatus::Staged) => {
                self.files.insert(file.to_string(), FileStatus::Unstaged);
                Ok(())
            }
            _ => Err(VcsError::NotStaged(file.to_string())),
        }
    }

    /// Stage every untracked and unstaged file; returns what was staged
    pub fn stage_all(&mut self) -> Vec<String> {
        let mut staged = Vec::new();
        for (file, status) in self.files.iter_mut() {
            if matches!(status, FileStatus::Unstaged | FileStatus::Untracked) {
                *status = FileStatus::Staged;
                staged.push(file.clone());
            }
        }
        staged
    }

    /// Record all staged files as a new commit at the front of the log
    pub fn commit(&mut self, message: &str, author: &str) -> VcsResult<GitCommit> {
        let message = message.trim();
        if message.is_empty() {
            return Err(VcsError::EmptyMessage);
        }

        let staged: Vec<String> = self
            .files
            .iter()
            .filter(|(_, status)| **status == FileStatus::Staged)
            .map(|(file, _)| file.clone())
            .collect();
        if staged.is_empty() {
            return Err(VcsError::NothingToCommit);
        }

        let parent = self.commits.front().map(|commit| commit.id().to_string());
        let commit = GitCommit::new(parent.as_deref(), message, author, Utc::now(), staged);

        for file in commit.files() {
            self.files.insert(file.clone(), FileStatus::Clean);
        }
        self.commits.push_front(commit.clone());

        info!(
            "Committed {} on {}: {} ({} files)",
            commit.short_id(),
            self.current_branch,
            commit.message(),
            commit.files().len()
        );
        Ok(commit)
    }

    pub fn create_branch(&mut self, name: &str) -> VcsResult<()> {
        let name = name.trim();
        if name.is_empty() || name.chars().any(char::is_whitespace) {
            return Err(VcsError::InvalidBranchName(name.to_string()));
        }
        if self.branches.iter().any(|branch| branch == name) {
            return Err(VcsError::BranchExists(name.to_string()));
        }
        self.branches.push(name.to_string());
        Ok(())
    }

    /// Switch the current branch label; file states are untouched
    pub fn checkout_branch(&mut self, name: &str) -> VcsResult<()> {
        if !self.branches.iter().any(|branch| branch == name) {
            return Err(VcsError::BranchNotFound(name.to_string()));
        }
        self.current_branch = name.to_string();
        Ok(())
    }

    pub fn file_status(&self, file: &str) -> Option<FileStatus> {
        self.files.get(file).copied()
    }

    pub fn head(&self) -> Option<&GitCommit> {
        self.commits.front()
    }

    pub fn current_branch(&self) -> &str {
        &self.current_branch
    }

    pub fn get_status(&self) -> GitStatus {
        let with_status = |wanted: FileStatus| -> Vec<String> {
            self.files
                .iter()
                .filter(|(_, status)| **status == wanted)
                .map(|(file, _)| file.clone())
                .collect()
        };

        GitStatus {
            staged: with_status(FileStatus::Staged),
            unstaged: with_status(FileStatus::Unstaged),
            untracked: with_status(FileStatus::Untracked),
            current_branch: self.current_branch.clone(),
            branches: self.branches.clone(),
            commits: self.get_commit_log(),
        }
    }

    /// Commit log, most recent first
    pub fn get_commit_log(&self) -> Vec<GitCommit> {
        self.commits.iter().cloned().collect()
    }
}

impl Default for VersionControl {
    fn default() -> Self {
        Self::new()
    }
}
