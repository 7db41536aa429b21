// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Guarded access to the input model and its git history.
//!
//! Every model operation goes through the [`ModelGuard`]: reads run
//! concurrently, writes are exclusive and fail fast on conflict. Successful
//! writes broadcast a model-changed event.

use std::fs;

use serde_yaml::Value;
use tokio::task;
use tracing::{error, info};

use crate::application::guard::ModelGuard;
use crate::config::DeployerConfig;
use crate::domain::model::{id_key, ModelDocument, ModelError};
use crate::infrastructure::event_bus::{DeployerEvent, EventBus};
use crate::infrastructure::git_workspace::{CommitInfo, GitWorkspace, RepoStatus, TagInfo};
use crate::infrastructure::{model_reader, model_writer};

pub struct ModelService {
    config: DeployerConfig,
    guard: ModelGuard,
    git: GitWorkspace,
    events: EventBus,
}

impl ModelService {
    pub fn new(config: DeployerConfig, events: EventBus) -> Self {
        let git = GitWorkspace::new(&config.repo_dir, &config.branch);
        Self {
            config,
            guard: ModelGuard::new(),
            git,
            events,
        }
    }

    fn read_validated(&self) -> Result<ModelDocument, ModelError> {
        let doc =
            model_reader::read_model(&self.config.model_dir, self.config.model_version)?;
        if !doc.errors.is_empty() {
            for e in &doc.errors {
                error!(error = %e, "Input model error");
            }
            return Err(ModelError::InvalidModel(doc.errors.clone()));
        }
        Ok(doc)
    }

    /// Reads and validates the full model.
    pub async fn get_model(&self) -> Result<ModelDocument, ModelError> {
        self.guard.read(async { self.read_validated() }).await
    }

    /// Writes `doc` back to the model directory, reproducing its file layout.
    pub async fn write_model(&self, doc: &ModelDocument) -> Result<(), ModelError> {
        self.guard
            .write(async { model_writer::write_model(doc, &self.config.model_dir) })
            .await?;
        self.events.publish(DeployerEvent::ModelChanged);
        Ok(())
    }

    /// Runs a closure against a freshly read model and writes the result
    /// back, all under one writer slot.
    async fn mutate<F>(&self, apply: F) -> Result<(), ModelError>
    where
        F: FnOnce(&mut ModelDocument) -> Result<(), ModelError>,
    {
        self.guard
            .write(async {
                let mut doc = self.read_validated()?;
                apply(&mut doc)?;
                model_writer::write_model(&doc, &self.config.model_dir)
            })
            .await?;
        self.events.publish(DeployerEvent::ModelChanged);
        Ok(())
    }

    /// Stages and commits all pending changes on the pinned branch.
    pub async fn commit(&self, message: &str) -> Result<CommitInfo, ModelError> {
        if message.trim().is_empty() {
            return Err(ModelError::User("Commit message is missing".to_string()));
        }
        let git = self.git.clone();
        let branch = self.config.branch.clone();
        let message = message.to_string();
        let commit = self
            .guard
            .write(async move {
                task::spawn_blocking(move || {
                    if !git.is_branch_head()? {
                        return Err(ModelError::NotBranchHead(branch));
                    }
                    if git.status()?.is_clean() {
                        return Err(ModelError::NoChanges);
                    }
                    Ok(git.stage_and_commit(&message)?)
                })
                .await?
            })
            .await?;
        info!(commit = %commit.id, "Committed input model changes");
        Ok(commit)
    }

    pub async fn get_status(&self) -> Result<RepoStatus, ModelError> {
        let git = self.git.clone();
        self.guard
            .read(async move { Ok(task::spawn_blocking(move || git.status()).await??) })
            .await
    }

    pub async fn get_history(&self, count: usize) -> Result<Vec<CommitInfo>, ModelError> {
        let git = self.git.clone();
        self.guard
            .read(async move { Ok(task::spawn_blocking(move || git.history(count)).await??) })
            .await
    }

    pub async fn get_current_commit(&self) -> Result<CommitInfo, ModelError> {
        let git = self.git.clone();
        self.guard
            .read(async move { Ok(task::spawn_blocking(move || git.current_commit()).await??) })
            .await
    }

    pub async fn get_branch_commit(&self) -> Result<CommitInfo, ModelError> {
        let git = self.git.clone();
        self.guard
            .read(async move { Ok(task::spawn_blocking(move || git.branch_commit()).await??) })
            .await
    }

    pub async fn get_tags(&self) -> Result<Vec<TagInfo>, ModelError> {
        let git = self.git.clone();
        self.guard
            .read(async move { Ok(task::spawn_blocking(move || git.tags()).await??) })
            .await
    }

    pub async fn is_branch_head(&self) -> Result<bool, ModelError> {
        let git = self.git.clone();
        self.guard
            .read(async move { Ok(task::spawn_blocking(move || git.is_branch_head()).await??) })
            .await
    }

    /// Reverts a past commit with a new revert commit.
    pub async fn revert(&self, commit_id: &str) -> Result<CommitInfo, ModelError> {
        let git = self.git.clone();
        let commit_id = commit_id.to_string();
        let commit = self
            .guard
            .write(async move {
                task::spawn_blocking(move || Ok(git.revert(&commit_id)?)).await?
            })
            .await?;
        self.events.publish(DeployerEvent::ModelChanged);
        Ok(commit)
    }

    /// Discards every uncommitted change: unstages the index, restores
    /// tracked files and deletes untracked ones.
    pub async fn clean(&self) -> Result<(), ModelError> {
        let git = self.git.clone();
        let repo_dir = self.config.repo_dir.clone();
        self.guard
            .write(async move {
                task::spawn_blocking(move || {
                    git.unstage_all()?;
                    let status = git.status()?;
                    for change in &status.unstaged {
                        git.checkout_file(change.path.as_ref())?;
                    }
                    for path in &status.untracked {
                        let full = repo_dir.join(path);
                        fs::remove_file(&full).map_err(|source| ModelError::Io {
                            path: full,
                            source,
                        })?;
                    }
                    Ok(())
                })
                .await?
            })
            .await?;
        self.events.publish(DeployerEvent::ModelChanged);
        Ok(())
    }

    /// Returns a copy of one model section.
    pub async fn get_entity(&self, name: &str) -> Result<Value, ModelError> {
        let doc = self.get_model().await?;
        doc.input_model
            .get(name)
            .cloned()
            .ok_or_else(|| ModelError::User(format!("Entity '{name}' not found")))
    }

    /// Replaces one model section wholesale.
    pub async fn replace_entity(&self, name: &str, value: Value) -> Result<(), ModelError> {
        let name = name.to_string();
        self.mutate(move |doc| {
            if !doc.input_model.contains(&name) {
                return Err(ModelError::User(format!("Entity '{name}' not found")));
            }
            doc.input_model.insert(name, value);
            Ok(())
        })
        .await
    }

    /// Appends a record to a list section, rejecting duplicate keys.
    pub async fn add_entity_member(&self, name: &str, member: Value) -> Result<(), ModelError> {
        let name = name.to_string();
        self.mutate(move |doc| {
            let records = list_section(doc, &name)?;
            if let Some(key_field) = id_key(&member) {
                let key = member.get(key_field);
                if records.iter().any(|r| r.get(key_field) == key) {
                    return Err(ModelError::User(format!(
                        "'{name}' already contains an entry with that {key_field}"
                    )));
                }
            }
            records.push(member);
            Ok(())
        })
        .await
    }

    /// Replaces the record of a list section identified by `id`.
    pub async fn update_entity_member(
        &self,
        name: &str,
        id: &str,
        member: Value,
    ) -> Result<(), ModelError> {
        let name = name.to_string();
        let id = id.to_string();
        self.mutate(move |doc| {
            let records = list_section(doc, &name)?;
            let index = member_index(records, &id)
                .ok_or_else(|| ModelError::User(format!("No '{id}' found in '{name}'")))?;
            records[index] = member;
            Ok(())
        })
        .await
    }

    /// Removes the record of a list section identified by `id`.
    pub async fn delete_entity_member(&self, name: &str, id: &str) -> Result<(), ModelError> {
        let name = name.to_string();
        let id = id.to_string();
        self.mutate(move |doc| {
            let records = list_section(doc, &name)?;
            let index = member_index(records, &id)
                .ok_or_else(|| ModelError::User(format!("No '{id}' found in '{name}'")))?;
            records.remove(index);
            Ok(())
        })
        .await
    }
}

fn list_section<'a>(
    doc: &'a mut ModelDocument,
    name: &str,
) -> Result<&'a mut Vec<Value>, ModelError> {
    match doc.input_model.get_mut(name) {
        Some(Value::Sequence(records)) => Ok(records),
        Some(_) => Err(ModelError::User(format!("Entity '{name}' is not a list"))),
        None => Err(ModelError::User(format!("Entity '{name}' not found"))),
    }
}

/// Finds a record by its key field, compared against the string form of `id`.
fn member_index(records: &[Value], id: &str) -> Option<usize> {
    records.iter().position(|record| {
        id_key(record)
            .and_then(|key_field| record.get(key_field))
            .map(|key| match key {
                Value::String(s) => s == id,
                Value::Number(n) => n.to_string() == id,
                _ => false,
            })
            .unwrap_or(false)
    })
}
