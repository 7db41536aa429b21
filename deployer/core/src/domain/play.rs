// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Play (spawned process) domain types.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unique reference to a play: `{start_epoch_ms}_{pid}`.
pub type PlayRef = String;

/// Metadata describing a spawned process, live or finished. This is the
/// record persisted as `<ref>.yml` when the process ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayMeta {
    pub play_ref: PlayRef,
    pub pid: u32,
    /// Epoch millis at spawn time.
    pub start_time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    /// Exit code, `None` while alive or when killed by signal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    /// Masked human-readable command description.
    pub command_string: String,
    pub killed: bool,
    pub alive: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_size: Option<u64>,
}

/// Which output stream a chunk of log data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// Options accepted by the registry's spawn operation.
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    /// Overrides the command string in the play record.
    pub description: Option<String>,
    /// Internal plays are tracked for completion but never broadcast,
    /// persisted or listed.
    pub internal: bool,
    /// Refuse to spawn while an identical command is already running.
    pub prevent_concurrent_runs: bool,
    /// Client that initiated the run.
    pub client_id: Option<String>,
    /// Extra environment for the child process.
    pub env: Option<HashMap<String, String>>,
}

/// Filter for listing plays.
#[derive(Debug, Clone, Default)]
pub struct PlayFilter {
    /// Only plays started within this duration.
    pub max_age: Option<Duration>,
    /// At most this many plays, most recent first.
    pub max_count: Option<usize>,
    /// `Some(true)`: live only. `Some(false)`: finished only.
    pub live: Option<bool>,
}

#[derive(Debug, Error)]
pub enum PlayError {
    #[error("prevented spawning of a new process: the service is shutting down")]
    ShuttingDown,

    #[error("another instance of '{description}' is already running")]
    ConcurrentRun { description: String },

    #[error("failed to spawn '{command}': {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("process {} exited with code {:?}", .meta.play_ref, .meta.code)]
    PlayFailed { meta: Box<PlayMeta> },

    #[error("no play found for reference '{0}'")]
    NotFound(PlayRef),

    #[error("play completion signal was lost")]
    CompletionLost,

    #[error("{0}")]
    User(String),

    #[error("play storage error on {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode play record: {0}")]
    Decode(#[from] serde_yaml::Error),

    #[error("failed to encode extra vars: {0}")]
    ExtraVars(#[from] serde_json::Error),
}
