// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Thin `git2` adapter over the repository holding the input model.
//!
//! Every method opens the repository fresh; `git2::Repository` is not `Sync`
//! and callers run these under `spawn_blocking`.

use std::path::{Path, PathBuf};

use git2::{
    build::CheckoutBuilder, BranchType, Commit, Repository, Signature, Status, StatusOptions,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Fallback committer identity when the repo has no configured one.
const COMMITTER_NAME: &str = "AEGIS deployer";
const COMMITTER_EMAIL: &str = "deployer@aegis.local";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub id: String,
    pub message: String,
    pub author: String,
    /// Commit time, epoch seconds.
    pub time: i64,
}

impl CommitInfo {
    fn from_commit(commit: &Commit<'_>) -> Self {
        Self {
            id: commit.id().to_string(),
            message: commit.message().unwrap_or("").to_string(),
            author: commit.author().name().unwrap_or("").to_string(),
            time: commit.time().seconds(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub change: ChangeKind,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepoStatus {
    pub staged: Vec<FileChange>,
    pub unstaged: Vec<FileChange>,
    pub untracked: Vec<String>,
}

impl RepoStatus {
    pub fn is_clean(&self) -> bool {
        self.staged.is_empty() && self.unstaged.is_empty() && self.untracked.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagInfo {
    pub name: String,
    pub commit_id: String,
}

/// Handle to the model repository, pinned to one branch.
#[derive(Debug, Clone)]
pub struct GitWorkspace {
    path: PathBuf,
    branch: String,
}

impl GitWorkspace {
    pub fn new(path: impl Into<PathBuf>, branch: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            branch: branch.into(),
        }
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    fn open(&self) -> Result<Repository, git2::Error> {
        Repository::open(&self.path)
    }

    /// True when HEAD points at the pinned branch's head commit.
    pub fn is_branch_head(&self) -> Result<bool, git2::Error> {
        let repo = self.open()?;
        let head = repo.head()?.peel_to_commit()?.id();
        let branch = repo
            .find_branch(&self.branch, BranchType::Local)?
            .get()
            .peel_to_commit()?
            .id();
        Ok(head == branch)
    }

    pub fn status(&self) -> Result<RepoStatus, git2::Error> {
        let repo = self.open()?;
        let mut options = StatusOptions::new();
        options.include_untracked(true).recurse_untracked_dirs(true);
        let statuses = repo.statuses(Some(&mut options))?;

        let mut result = RepoStatus::default();
        for entry in statuses.iter() {
            let Some(path) = entry.path() else { continue };
            let status = entry.status();
            if status.contains(Status::WT_NEW) {
                result.untracked.push(path.to_string());
            }
            for (flag, change) in [
                (Status::INDEX_NEW, ChangeKind::Added),
                (Status::INDEX_MODIFIED, ChangeKind::Modified),
                (Status::INDEX_DELETED, ChangeKind::Deleted),
            ] {
                if status.contains(flag) {
                    result.staged.push(FileChange {
                        path: path.to_string(),
                        change,
                    });
                }
            }
            for (flag, change) in [
                (Status::WT_MODIFIED, ChangeKind::Modified),
                (Status::WT_DELETED, ChangeKind::Deleted),
            ] {
                if status.contains(flag) {
                    result.unstaged.push(FileChange {
                        path: path.to_string(),
                        change,
                    });
                }
            }
        }
        Ok(result)
    }

    /// Most recent commits on the pinned branch, newest first.
    pub fn history(&self, count: usize) -> Result<Vec<CommitInfo>, git2::Error> {
        let repo = self.open()?;
        let mut walk = repo.revwalk()?;
        walk.push_ref(&format!("refs/heads/{}", self.branch))?;
        let mut commits = Vec::new();
        for oid in walk.take(count) {
            let commit = repo.find_commit(oid?)?;
            commits.push(CommitInfo::from_commit(&commit));
        }
        Ok(commits)
    }

    pub fn current_commit(&self) -> Result<CommitInfo, git2::Error> {
        let repo = self.open()?;
        let commit = repo.head()?.peel_to_commit()?;
        Ok(CommitInfo::from_commit(&commit))
    }

    pub fn branch_commit(&self) -> Result<CommitInfo, git2::Error> {
        let repo = self.open()?;
        let branch = repo.find_branch(&self.branch, BranchType::Local)?;
        let commit = branch.get().peel_to_commit()?;
        Ok(CommitInfo::from_commit(&commit))
    }

    pub fn tags(&self) -> Result<Vec<TagInfo>, git2::Error> {
        let repo = self.open()?;
        let mut tags = Vec::new();
        for reference in repo.references_glob("refs/tags/*")? {
            let reference = reference?;
            let Some(name) = reference.shorthand().map(str::to_string) else {
                continue;
            };
            let commit_id = reference.peel_to_commit()?.id().to_string();
            tags.push(TagInfo { name, commit_id });
        }
        Ok(tags)
    }

    /// Stages everything (additions, modifications and deletions) and commits.
    pub fn stage_and_commit(&self, message: &str) -> Result<CommitInfo, git2::Error> {
        let repo = self.open()?;
        let mut index = repo.index()?;
        index.add_all(["*"], git2::IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"], None)?;
        index.write()?;

        let tree = repo.find_tree(index.write_tree()?)?;
        let parent = repo.head()?.peel_to_commit()?;
        let signature = self.signature(&repo)?;
        let id = repo.commit(
            Some("HEAD"),
            &signature,
            &signature,
            message,
            &tree,
            &[&parent],
        )?;
        debug!(commit = %id, "Committed model changes");
        let info = CommitInfo::from_commit(&repo.find_commit(id)?);
        Ok(info)
    }

    /// Reverts `commit_id` in the working tree and commits the result.
    pub fn revert(&self, commit_id: &str) -> Result<CommitInfo, git2::Error> {
        let repo = self.open()?;
        let commit = repo.find_commit(git2::Oid::from_str(commit_id)?)?;
        repo.revert(&commit, None)?;

        let mut index = repo.index()?;
        let tree = repo.find_tree(index.write_tree()?)?;
        let parent = repo.head()?.peel_to_commit()?;
        let signature = self.signature(&repo)?;
        let message = format!(
            "Revert \"{}\"",
            commit.summary().unwrap_or(commit_id)
        );
        let id = repo.commit(
            Some("HEAD"),
            &signature,
            &signature,
            &message,
            &tree,
            &[&parent],
        )?;
        repo.cleanup_state()?;
        let info = CommitInfo::from_commit(&repo.find_commit(id)?);
        Ok(info)
    }

    /// Discards working tree changes to one file.
    pub fn checkout_file(&self, path: &Path) -> Result<(), git2::Error> {
        let repo = self.open()?;
        let mut checkout = CheckoutBuilder::new();
        checkout.force().path(path);
        repo.checkout_head(Some(&mut checkout))
    }

    /// Removes one file from the index, keeping the working tree copy.
    pub fn reset_file(&self, path: &Path) -> Result<(), git2::Error> {
        let repo = self.open()?;
        let head = repo.head()?.peel(git2::ObjectType::Commit)?;
        repo.reset_default(Some(&head), [path])
    }

    pub fn unstage_all(&self) -> Result<(), git2::Error> {
        let repo = self.open()?;
        let head = repo.head()?.peel(git2::ObjectType::Commit)?;
        repo.reset_default(Some(&head), ["*"])
    }

    fn signature(&self, repo: &Repository) -> Result<Signature<'static>, git2::Error> {
        repo.signature()
            .or_else(|_| Signature::now(COMMITTER_NAME, COMMITTER_EMAIL))
    }
}
