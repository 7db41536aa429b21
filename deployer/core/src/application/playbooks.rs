// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Catalog of runnable playbooks and the spawn glue around them.
//!
//! Playbooks are scanned from the configured directories (later directories
//! win on name collision) on top of the fixed entries that always run from
//! the static ansible directory. Runs go through the play registry, which
//! guards `site.yml` and `ready-deployment.yml` against concurrent runs.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use indexmap::IndexMap;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::application::play_registry::{PlayRegistry, SpawnedPlay};
use crate::config::DeployerConfig;
use crate::domain::play::{PlayError, SpawnOptions};

/// Playbooks that must never run twice at the same time.
const GUARDED_PLAYBOOKS: [&str; 2] = ["site.yml", "ready-deployment.yml"];

/// Fixed catalog entries, run from the static ansible directory.
const STATIC_PLAYBOOKS: [&str; 2] = ["validate.yml", "ready-deployment.yml"];

#[derive(Debug, Clone)]
pub struct PlaybookEntry {
    pub dir: PathBuf,
    pub file: String,
}

#[derive(Debug, Clone, Default)]
pub struct PlaybookRunOptions {
    /// Passed as a JSON `--extra-vars` payload.
    pub extra_vars: BTreeMap<String, serde_json::Value>,
    pub limit: Option<String>,
    pub tags: Option<String>,
    pub skip_tags: Option<String>,
    pub client_id: Option<String>,
    /// Guard this run even when the playbook is not in the guarded list.
    pub prevent_concurrent_runs: bool,
}

pub struct PlaybookService {
    config: DeployerConfig,
    registry: Arc<PlayRegistry>,
    catalog: RwLock<IndexMap<String, PlaybookEntry>>,
    refresh_lock: Mutex<()>,
}

impl PlaybookService {
    pub fn new(config: DeployerConfig, registry: Arc<PlayRegistry>) -> Self {
        Self {
            config,
            registry,
            catalog: RwLock::new(IndexMap::new()),
            refresh_lock: Mutex::new(()),
        }
    }

    /// Canonical catalog key of a playbook name.
    pub fn normalise(name: &str) -> String {
        name.to_lowercase()
            .trim_end_matches(".yml")
            .replace('-', "_")
    }

    /// Rescans the playbook directories. Concurrent refreshes serialize so a
    /// burst of cache misses scans once at a time.
    pub async fn refresh(&self) {
        let _serialize = self.refresh_lock.lock().await;
        let mut catalog: IndexMap<String, PlaybookEntry> = IndexMap::new();
        for file in STATIC_PLAYBOOKS {
            catalog.insert(
                Self::normalise(file),
                PlaybookEntry {
                    dir: self.config.ansible_dir.clone(),
                    file: file.to_string(),
                },
            );
        }
        for dir in &self.config.playbook_dirs {
            match fs::read_dir(dir) {
                Ok(entries) => {
                    for entry in entries.flatten() {
                        let Some(name) = entry.file_name().to_str().map(str::to_string)
                        else {
                            continue;
                        };
                        if name.starts_with('_') || !name.ends_with(".yml") {
                            continue;
                        }
                        catalog.insert(
                            Self::normalise(&name),
                            PlaybookEntry {
                                dir: dir.clone(),
                                file: name,
                            },
                        );
                    }
                }
                Err(error) => {
                    // Scanned directories appear once the deployment area has
                    // been readied; missing ones are expected early on.
                    warn!(dir = %dir.display(), %error, "Skipping unreadable playbook directory");
                }
            }
        }
        catalog.sort_keys();
        *self.catalog.write().await = catalog;
    }

    /// Names of all runnable playbooks, sorted.
    pub async fn list(&self) -> Vec<String> {
        self.refresh().await;
        self.catalog.read().await.keys().cloned().collect()
    }

    /// Catalog entry for a normalised playbook name.
    pub async fn lookup(&self, key: &str) -> Option<PlaybookEntry> {
        self.catalog.read().await.get(key).cloned()
    }

    /// Runs a playbook by name. An unknown name triggers one catalog refresh
    /// before failing.
    pub async fn run(
        &self,
        name: &str,
        options: PlaybookRunOptions,
    ) -> Result<SpawnedPlay, PlayError> {
        let key = Self::normalise(name);
        let entry = match self.lookup(&key).await {
            Some(entry) => entry,
            None => {
                debug!(playbook = %key, "Playbook not in catalog, refreshing");
                self.refresh().await;
                self.lookup(&key).await.ok_or_else(|| {
                    PlayError::User(format!("Playbook '{name}' is not available"))
                })?
            }
        };
        self.start(&entry, options).await
    }

    async fn start(
        &self,
        entry: &PlaybookEntry,
        options: PlaybookRunOptions,
    ) -> Result<SpawnedPlay, PlayError> {
        let mut args: Vec<String> = Vec::new();
        if let Some(inventory) = &self.config.inventory_file {
            args.push("-i".to_string());
            args.push(inventory.clone());
        }
        args.push(entry.file.clone());
        if !options.extra_vars.is_empty() {
            args.push("--extra-vars".to_string());
            args.push(serde_json::to_string(&options.extra_vars)?);
        }
        if let Some(limit) = &options.limit {
            args.push("--limit".to_string());
            args.push(limit.clone());
        }
        if let Some(tags) = &options.tags {
            args.push("--tags".to_string());
            args.push(tags.clone());
        }
        if let Some(skip_tags) = &options.skip_tags {
            args.push("--skip-tags".to_string());
            args.push(skip_tags.clone());
        }

        let mut env = HashMap::new();
        env.insert("PYTHONUNBUFFERED".to_string(), "1".to_string());
        if !self.config.no_color {
            env.insert("ANSIBLE_FORCE_COLOR".to_string(), "true".to_string());
        }

        let guarded = GUARDED_PLAYBOOKS.contains(&entry.file.as_str());
        let spawn_options = SpawnOptions {
            description: None,
            internal: false,
            prevent_concurrent_runs: guarded || options.prevent_concurrent_runs,
            client_id: options.client_id,
            env: Some(env),
        };
        self.registry
            .spawn(
                &entry.dir,
                &self.config.playbook_command,
                &args,
                spawn_options,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::event_bus::EventBus;
    use tempfile::TempDir;

    #[test]
    fn names_normalise() {
        assert_eq!(PlaybookService::normalise("Site.yml"), "site");
        assert_eq!(
            PlaybookService::normalise("ready-deployment.yml"),
            "ready_deployment"
        );
        assert_eq!(PlaybookService::normalise("monitor_deploy"), "monitor_deploy");
    }

    #[tokio::test]
    async fn catalog_scans_and_overrides() {
        let dir = TempDir::new().unwrap();
        let scanned = dir.path().join("scratch");
        std::fs::create_dir_all(&scanned).unwrap();
        std::fs::write(scanned.join("site.yml"), "").unwrap();
        std::fs::write(scanned.join("_internal.yml"), "").unwrap();
        std::fs::write(scanned.join("notes.txt"), "").unwrap();

        let config = DeployerConfig {
            ansible_dir: dir.path().join("ansible"),
            playbook_dirs: vec![scanned],
            ..DeployerConfig::default()
        };
        let registry = PlayRegistry::new(
            dir.path().join("logs"),
            dir.path().join("archive"),
            1024,
            EventBus::with_default_capacity(),
        )
        .unwrap();
        let service = PlaybookService::new(config, registry);

        let names = service.list().await;
        assert_eq!(names, vec!["ready_deployment", "site", "validate"]);
    }

    #[tokio::test]
    async fn later_directories_shadow_earlier_ones() {
        let dir = TempDir::new().unwrap();
        let first = dir.path().join("first");
        let second = dir.path().join("second");
        for scanned in [&first, &second] {
            std::fs::create_dir_all(scanned).unwrap();
            std::fs::write(scanned.join("site.yml"), "").unwrap();
        }

        let config = DeployerConfig {
            ansible_dir: dir.path().join("ansible"),
            playbook_dirs: vec![first, second.clone()],
            ..DeployerConfig::default()
        };
        let registry = PlayRegistry::new(
            dir.path().join("logs"),
            dir.path().join("archive"),
            1024,
            EventBus::with_default_capacity(),
        )
        .unwrap();
        let service = PlaybookService::new(config, registry);
        service.refresh().await;

        let entry = service.lookup("site").await.unwrap();
        assert_eq!(entry.dir, second);
    }

    #[tokio::test]
    async fn unknown_playbook_is_a_user_error() {
        let dir = TempDir::new().unwrap();
        let config = DeployerConfig {
            ansible_dir: dir.path().join("ansible"),
            ..DeployerConfig::default()
        };
        let registry = PlayRegistry::new(
            dir.path().join("logs"),
            dir.path().join("archive"),
            1024,
            EventBus::with_default_capacity(),
        )
        .unwrap();
        let service = PlaybookService::new(config, registry);

        let result = service
            .run("does-not-exist", PlaybookRunOptions::default())
            .await;
        assert!(matches!(result, Err(PlayError::User(_))));
    }
}
