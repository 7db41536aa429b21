// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Registry of spawned playbook processes ("plays").
//!
//! Live plays are tracked in memory with their accumulating log. When a play
//! ends its metadata and log are persisted to the logs directory, the play is
//! evicted from memory and the archive threshold is evaluated. Old plays move
//! to the archive directory (metadata kept, raw log deleted) once persisted
//! logs outgrow the configured budget.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use indexmap::IndexMap;
use parking_lot::Mutex;
use regex::Regex;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::domain::play::{
    LogStream, PlayError, PlayFilter, PlayMeta, PlayRef, SpawnOptions,
};
use crate::infrastructure::event_bus::{DeployerEvent, EventBus};

const META_EXT: &str = "yml";
const LOG_EXT: &str = "log";

/// Keys whose values are masked out of command strings before they reach
/// records, logs or events.
const SECRET_KEYS: [&str; 2] = ["encrypt", "rekey"];

struct LivePlay {
    meta: PlayMeta,
    log: Arc<Mutex<String>>,
    subscribers: HashSet<String>,
    kill_tx: mpsc::Sender<()>,
}

/// A successfully spawned play: start-time metadata plus a completion handle.
pub struct SpawnedPlay {
    pub meta: PlayMeta,
    pub completion: PlayCompletion,
}

/// Resolves when the play ends: `Ok` with the terminal metadata on exit code
/// zero, [`PlayError::PlayFailed`] otherwise.
pub struct PlayCompletion {
    rx: oneshot::Receiver<Result<PlayMeta, PlayError>>,
}

impl PlayCompletion {
    pub async fn wait(self) -> Result<PlayMeta, PlayError> {
        self.rx.await.map_err(|_| PlayError::CompletionLost)?
    }
}

pub struct PlayRegistry {
    logs_dir: PathBuf,
    archive_dir: PathBuf,
    max_log_bytes: u64,
    live: DashMap<PlayRef, LivePlay>,
    events: EventBus,
    archive_in_progress: AtomicBool,
    prevent_new: AtomicBool,
}

impl PlayRegistry {
    pub fn new(
        logs_dir: impl Into<PathBuf>,
        archive_dir: impl Into<PathBuf>,
        max_log_bytes: u64,
        events: EventBus,
    ) -> Result<Arc<Self>, PlayError> {
        let logs_dir = logs_dir.into();
        let archive_dir = archive_dir.into();
        for dir in [&logs_dir, &archive_dir] {
            fs::create_dir_all(dir).map_err(|source| PlayError::Storage {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(Arc::new(Self {
            logs_dir,
            archive_dir,
            max_log_bytes,
            live: DashMap::new(),
            events,
            archive_in_progress: AtomicBool::new(false),
            prevent_new: AtomicBool::new(false),
        }))
    }

    /// Spawns `command` under `cwd` and tracks it until it exits.
    pub async fn spawn(
        self: &Arc<Self>,
        cwd: &Path,
        command: &str,
        args: &[String],
        options: SpawnOptions,
    ) -> Result<SpawnedPlay, PlayError> {
        debug!(%command, "Attempting to spawn child process");
        if self.prevent_new.load(Ordering::SeqCst) {
            return Err(PlayError::ShuttingDown);
        }

        let command_string = mask_secrets(
            &options
                .description
                .clone()
                .unwrap_or_else(|| format!("{} {}", command, args.join(" "))),
        );

        if options.prevent_concurrent_runs {
            let duplicate = self.live.iter().any(|entry| {
                entry.meta.alive && entry.meta.command_string == command_string
            });
            if duplicate {
                warn!(command = %command_string, "Refusing concurrent run");
                return Err(PlayError::ConcurrentRun {
                    description: command_string,
                });
            }
        }

        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if !cwd.as_os_str().is_empty() {
            cmd.current_dir(cwd);
        }
        if let Some(env) = &options.env {
            cmd.envs(env);
        }

        let mut child = cmd.spawn().map_err(|source| {
            error!(command = %command_string, %source, "Failed to spawn child process");
            PlayError::SpawnFailed {
                command: command_string.clone(),
                source,
            }
        })?;
        let pid = child.id().ok_or_else(|| PlayError::SpawnFailed {
            command: command_string.clone(),
            source: io::Error::other("spawned child has no PID"),
        })?;

        let start_time = Utc::now().timestamp_millis();
        let play_ref: PlayRef = format!("{start_time}_{pid}");
        info!(%play_ref, pid, command = %command_string, "Spawned child process");

        let meta = PlayMeta {
            play_ref: play_ref.clone(),
            pid,
            start_time,
            end_time: None,
            code: None,
            command_string,
            killed: false,
            alive: true,
            client_id: options.client_id.clone(),
            log_size: None,
        };

        let log = Arc::new(Mutex::new(String::new()));
        let (kill_tx, kill_rx) = mpsc::channel(1);
        if !options.internal {
            self.live.insert(
                play_ref.clone(),
                LivePlay {
                    meta: meta.clone(),
                    log: log.clone(),
                    subscribers: HashSet::new(),
                    kill_tx,
                },
            );
            self.events
                .publish(DeployerEvent::PlayStarted { meta: meta.clone() });
        }

        let (done_tx, done_rx) = oneshot::channel();
        let registry = Arc::clone(self);
        let monitor_meta = meta.clone();
        let internal = options.internal;
        tokio::spawn(async move {
            registry
                .monitor(child, monitor_meta, log, kill_rx, internal, done_tx)
                .await;
        });

        Ok(SpawnedPlay {
            meta,
            completion: PlayCompletion { rx: done_rx },
        })
    }

    async fn monitor(
        self: Arc<Self>,
        mut child: Child,
        mut meta: PlayMeta,
        log: Arc<Mutex<String>>,
        mut kill_rx: mpsc::Receiver<()>,
        internal: bool,
        done_tx: oneshot::Sender<Result<PlayMeta, PlayError>>,
    ) {
        let mut collectors = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            collectors.push(tokio::spawn(collect_output(
                stdout,
                LogStream::Stdout,
                meta.play_ref.clone(),
                log.clone(),
                self.events.clone(),
                internal,
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            collectors.push(tokio::spawn(collect_output(
                stderr,
                LogStream::Stderr,
                meta.play_ref.clone(),
                log.clone(),
                self.events.clone(),
                internal,
            )));
        }

        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                Some(()) = kill_rx.recv() => {
                    info!(play_ref = %meta.play_ref, "Killing child process");
                    if let Err(error) = child.start_kill() {
                        error!(play_ref = %meta.play_ref, %error, "Child process could not be killed");
                    }
                }
            }
        };

        let _ = join_all(collectors).await;

        let code = status.as_ref().ok().and_then(|s| s.code());
        meta.end_time = Some(Utc::now().timestamp_millis());
        meta.code = code;
        meta.alive = false;
        if let Some(entry) = self.live.get(&meta.play_ref) {
            meta.killed = entry.meta.killed;
        }
        let log_text = log.lock().clone();
        meta.log_size = Some(log_text.len() as u64);

        if !internal {
            self.events
                .publish(DeployerEvent::PlayEnded { meta: meta.clone() });
            if let Err(error) = self.persist(&meta, &log_text) {
                error!(play_ref = %meta.play_ref, %error, "Failed to persist play record");
            }
            self.live.remove(&meta.play_ref);
            let registry = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(error) = registry.archive().await {
                    error!(%error, "Play archive evaluation failed");
                }
            });
        }

        let result = if code == Some(0) {
            Ok(meta)
        } else {
            info!(play_ref = %meta.play_ref, ?code, killed = meta.killed,
                "Child process ended with non-zero code");
            Err(PlayError::PlayFailed {
                meta: Box::new(meta),
            })
        };
        let _ = done_tx.send(result);
    }

    fn persist(&self, meta: &PlayMeta, log_text: &str) -> Result<(), PlayError> {
        let log_path = self.record_path(&meta.play_ref, LOG_EXT);
        fs::write(&log_path, log_text).map_err(|source| PlayError::Storage {
            path: log_path,
            source,
        })?;
        let meta_path = self.record_path(&meta.play_ref, META_EXT);
        let encoded = serde_yaml::to_string(meta)?;
        fs::write(&meta_path, encoded).map_err(|source| PlayError::Storage {
            path: meta_path,
            source,
        })?;
        debug!(play_ref = %meta.play_ref, "Persisted play record");
        Ok(())
    }

    fn record_path(&self, play_ref: &str, ext: &str) -> PathBuf {
        self.logs_dir.join(format!("{play_ref}.{ext}"))
    }

    /// Requests termination of a live play. The play still runs its normal
    /// end-of-life path (events, persistence, archive evaluation).
    pub fn kill(&self, play_ref: &str) -> Result<(), PlayError> {
        let Some(mut entry) = self.live.get_mut(play_ref) else {
            warn!(%play_ref, "Kill requested for unknown play");
            return Err(PlayError::NotFound(play_ref.to_string()));
        };
        entry.meta.killed = true;
        let _ = entry.kill_tx.try_send(());
        Ok(())
    }

    /// Evaluates the archive threshold and moves the oldest plays out of the
    /// logs directory until the persisted logs fit the budget again. Returns
    /// the number of log bytes reclaimed. Only one evaluation runs at a time;
    /// a second concurrent call returns `Ok(0)`.
    pub async fn archive(self: &Arc<Self>) -> Result<u64, PlayError> {
        if self.prevent_new.load(Ordering::SeqCst) {
            return Ok(0);
        }
        if self.archive_in_progress.swap(true, Ordering::SeqCst) {
            debug!("Archive evaluation already in progress");
            return Ok(0);
        }
        let _done = scopeguard::guard((), |_| {
            self.archive_in_progress.store(false, Ordering::SeqCst);
        });

        let mut logs: Vec<(String, u64, i64)> = Vec::new();
        let mut total: u64 = 0;
        let entries = fs::read_dir(&self.logs_dir).map_err(|source| PlayError::Storage {
            path: self.logs_dir.clone(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| PlayError::Storage {
                path: self.logs_dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(LOG_EXT) {
                continue;
            }
            let Some(base) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            let Some(start_time) = parse_start_time(base) else {
                error!(record = %base, "Unparseable play record name, refusing to archive");
                return Ok(0);
            };
            total += size;
            logs.push((base.to_string(), size, start_time));
        }

        if total <= self.max_log_bytes {
            debug!(total, budget = self.max_log_bytes, "Persisted logs within budget");
            return Ok(0);
        }

        logs.sort_by_key(|(_, _, start_time)| *start_time);
        let mut excess = (total - self.max_log_bytes) as i64;
        let mut reclaimed: u64 = 0;
        for (base, size, _) in logs {
            if excess < 0 {
                break;
            }
            self.archive_record(&base)?;
            excess -= size as i64;
            reclaimed += size;
        }
        info!(reclaimed, "Archived old play records");
        Ok(reclaimed)
    }

    /// Moves one record's metadata into the archive and deletes its raw log.
    fn archive_record(&self, base: &str) -> Result<(), PlayError> {
        let meta_path = self.record_path(base, META_EXT);
        let archived = self.archive_dir.join(format!("{base}.{META_EXT}"));
        if meta_path.is_file() {
            fs::rename(&meta_path, &archived).map_err(|source| PlayError::Storage {
                path: meta_path,
                source,
            })?;
        }
        let log_path = self.record_path(base, LOG_EXT);
        fs::remove_file(&log_path).map_err(|source| PlayError::Storage {
            path: log_path,
            source,
        })?;
        debug!(record = %base, "Archived play record");
        Ok(())
    }

    /// Lists plays, live and persisted, most recent first.
    pub fn get_plays(&self, filter: &PlayFilter) -> Result<Vec<PlayMeta>, PlayError> {
        let mut plays: IndexMap<PlayRef, PlayMeta> = IndexMap::new();

        if filter.live != Some(true) {
            for base in self.persisted_refs()? {
                if let Ok(meta) = self.read_persisted(&base) {
                    plays.insert(base, meta);
                }
            }
        }
        if filter.live != Some(false) {
            for entry in self.live.iter() {
                plays.insert(entry.key().clone(), entry.meta.clone());
            }
        }

        let mut all: Vec<PlayMeta> = plays.into_values().collect();
        all.sort_by(|a, b| b.start_time.cmp(&a.start_time));

        if let Some(max_age) = filter.max_age {
            let threshold = Utc::now().timestamp_millis() - max_age.as_millis() as i64;
            all.retain(|meta| meta.start_time >= threshold);
        }
        if let Some(max_count) = filter.max_count {
            all.truncate(max_count);
        }
        Ok(all)
    }

    fn persisted_refs(&self) -> Result<Vec<String>, PlayError> {
        let entries = fs::read_dir(&self.logs_dir).map_err(|source| PlayError::Storage {
            path: self.logs_dir.clone(),
            source,
        })?;
        let mut refs = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(META_EXT) {
                if let Some(base) = path.file_stem().and_then(|s| s.to_str()) {
                    refs.push(base.to_string());
                }
            }
        }
        refs.sort();
        Ok(refs)
    }

    fn read_persisted(&self, play_ref: &str) -> Result<PlayMeta, PlayError> {
        let path = self.record_path(play_ref, META_EXT);
        let raw = fs::read_to_string(&path).map_err(|_| PlayError::NotFound(play_ref.to_string()))?;
        Ok(serde_yaml::from_str(&raw)?)
    }

    /// Metadata of one play, live or persisted.
    pub fn get_meta(&self, play_ref: &str) -> Result<PlayMeta, PlayError> {
        if let Some(entry) = self.live.get(play_ref) {
            return Ok(entry.meta.clone());
        }
        self.read_persisted(play_ref)
    }

    /// The play's log, optionally front-truncated to at most `max_size`
    /// bytes at a line boundary.
    pub fn get_log(&self, play_ref: &str, max_size: Option<usize>) -> Result<String, PlayError> {
        let log = if let Some(entry) = self.live.get(play_ref) {
            entry.log.lock().clone()
        } else {
            let path = self.record_path(play_ref, LOG_EXT);
            fs::read_to_string(&path).map_err(|_| PlayError::NotFound(play_ref.to_string()))?
        };
        Ok(truncate_log(log, max_size))
    }

    /// Path of the persisted raw log, for callers that stream it themselves.
    pub fn get_log_file_path(&self, play_ref: &str) -> Result<PathBuf, PlayError> {
        let path = self.record_path(play_ref, LOG_EXT);
        if path.is_file() {
            Ok(path)
        } else {
            Err(PlayError::NotFound(play_ref.to_string()))
        }
    }

    /// Registers a client as watching a live play and returns a receiver of
    /// that play's events.
    pub fn subscribe(
        &self,
        play_ref: &str,
        client_id: &str,
    ) -> Result<crate::infrastructure::event_bus::PlayEventReceiver, PlayError> {
        let Some(mut entry) = self.live.get_mut(play_ref) else {
            return Err(PlayError::NotFound(play_ref.to_string()));
        };
        entry.subscribers.insert(client_id.to_string());
        Ok(self.events.subscribe_play(play_ref))
    }

    /// Drops a client from every live play's subscriber set.
    pub fn unsubscribe_client(&self, client_id: &str) {
        for mut entry in self.live.iter_mut() {
            entry.subscribers.remove(client_id);
        }
    }

    /// Refuses further spawns; used by the shutdown hook.
    pub fn prevent_spawn(&self) {
        info!("Refusing new child processes from now on");
        self.prevent_new.store(true, Ordering::SeqCst);
    }

    pub fn has_live_plays(&self) -> bool {
        !self.live.is_empty()
    }
}

/// Masks secret values (`encrypt`/`rekey`) in a command string, both in
/// `--extra-vars` JSON payloads and flag-style arguments.
fn mask_secrets(command: &str) -> String {
    let mut masked = command.to_string();
    for key in SECRET_KEYS {
        if let Ok(re) = Regex::new(&format!(r#""{key}"\s*:\s*"[^"]*""#)) {
            masked = re
                .replace_all(&masked, format!(r#""{key}": "***""#))
                .into_owned();
        }
        if let Ok(re) = Regex::new(&format!(r"(--{key}[ =])\S+")) {
            masked = re.replace_all(&masked, "${1}***").into_owned();
        }
    }
    masked
}

/// Start time embedded in a record name (`{epoch_ms}_{pid}`).
fn parse_start_time(play_ref: &str) -> Option<i64> {
    let (time, pid) = play_ref.split_once('_')?;
    pid.parse::<u32>().ok()?;
    time.parse::<i64>().ok()
}

/// Keeps at most the trailing `max_size` bytes, cut at a line boundary. Falls
/// back to the full log when no boundary exists in the kept range.
fn truncate_log(log: String, max_size: Option<usize>) -> String {
    let Some(max_size) = max_size else {
        return log;
    };
    if max_size == 0 || log.len() <= max_size {
        return log;
    }
    let cut = log.len() - max_size;
    match log.as_bytes()[..=cut].iter().rposition(|&b| b == b'\n') {
        Some(index) => {
            info!(kept = log.len() - index, "Truncating play log");
            log[index..].to_string()
        }
        None => {
            warn!("No line boundary found for log truncation, returning the full log");
            log
        }
    }
}

async fn collect_output<R>(
    mut stream: R,
    kind: LogStream,
    play_ref: PlayRef,
    log: Arc<Mutex<String>>,
    events: EventBus,
    internal: bool,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let data = String::from_utf8_lossy(&buf[..n]).into_owned();
                log.lock().push_str(&data);
                if !internal {
                    events.publish(DeployerEvent::LogData {
                        play_ref: play_ref.clone(),
                        stream: kind,
                        data,
                    });
                }
            }
        }
    }
}
