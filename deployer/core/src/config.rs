// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Typed service configuration shared by the deployer subsystems.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Configuration for the deployer core. All paths are absolute; callers embed
/// this in their own config loading (the core never reads config files).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct DeployerConfig {
    /// Root of the git working tree holding the input model.
    pub repo_dir: PathBuf,
    /// Directory inside `repo_dir` containing the model YAML files.
    pub model_dir: PathBuf,
    /// Where play metadata and raw logs are persisted.
    pub logs_dir: PathBuf,
    /// Where archived play metadata is moved to reclaim log space.
    pub archive_dir: PathBuf,
    /// Validator output directory (`server_info.yml` lives here).
    pub cp_output_dir: PathBuf,
    /// Directory holding the static playbooks (validate, ready-deployment).
    pub ansible_dir: PathBuf,
    /// Directories scanned for runnable playbooks, later entries win.
    pub playbook_dirs: Vec<PathBuf>,
    /// Inventory passed to every playbook run, `None` to omit `-i`.
    pub inventory_file: Option<String>,
    /// Executable used to run playbooks.
    pub playbook_command: String,
    /// Branch the model history is pinned to.
    pub branch: String,
    /// Expected input model schema version.
    pub model_version: u64,
    /// Persisted log size beyond which old plays are archived.
    pub archive_threshold_mb: u64,
    /// Disable ANSIBLE_FORCE_COLOR for spawned playbooks.
    pub no_color: bool,
}

impl Default for DeployerConfig {
    fn default() -> Self {
        Self {
            repo_dir: PathBuf::new(),
            model_dir: PathBuf::new(),
            logs_dir: PathBuf::new(),
            archive_dir: PathBuf::new(),
            cp_output_dir: PathBuf::new(),
            ansible_dir: PathBuf::new(),
            playbook_dirs: Vec::new(),
            inventory_file: Some("hosts/verb_hosts".to_string()),
            playbook_command: "ansible-playbook".to_string(),
            branch: "site".to_string(),
            model_version: 2,
            archive_threshold_mb: 100,
            no_color: false,
        }
    }
}

impl DeployerConfig {
    /// Archive threshold in bytes.
    pub fn max_log_bytes(&self) -> u64 {
        self.archive_threshold_mb * 1024 * 1024
    }
}
