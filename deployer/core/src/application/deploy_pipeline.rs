// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! The staged deploy pipeline.
//!
//! A run executes the fixed stage sequence up to a requested target stage.
//! Only one run may execute at a time, process-wide. When a stage fails and
//! the caller supplied a before-change model snapshot, the pipeline restores
//! the snapshot and re-runs the early stages; rollback failures are logged
//! and never replace the original error.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::json;
use serde_yaml::Value;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::application::model_service::ModelService;
use crate::application::playbooks::{PlaybookRunOptions, PlaybookService};
use crate::config::DeployerConfig;
use crate::domain::model::ModelDocument;
use crate::domain::pipeline::{DeployStage, PipelineError};
use crate::domain::play::PlayMeta;

/// Commit message used when the caller supplies none.
const DEFAULT_COMMIT_MESSAGE: &str = "Model change via the deploy service";

/// Validator output file mapping server ids to deployment facts.
const SERVER_INFO_FILE: &str = "server_info.yml";

/// Typed request for one pipeline run.
#[derive(Debug, Clone, Default)]
pub struct PipelineRequest {
    pub commit_message: Option<String>,
    pub encryption_key: Option<String>,
    pub client_id: Option<String>,
    pub remove_deleted_servers: bool,
    pub free_unused_addresses: bool,
    /// Explicit ansible limit expression.
    pub limit: Option<String>,
    /// Server id resolved to a hostname limit by the apply-limit stage.
    pub limit_server_id: Option<String>,
    /// Snapshot the model is rolled back to on failure.
    pub model_before_change: Option<ModelDocument>,
}

struct CommitOptions {
    message: String,
}

struct ValidatorOptions {
    encryption_key: Option<String>,
    remove_deleted_servers: bool,
    free_unused_addresses: bool,
    client_id: Option<String>,
}

struct ReadyOptions {
    client_id: Option<String>,
}

struct ApplyLimitOptions {
    server_id: Option<String>,
}

struct DeployOptions {
    limit: Option<String>,
    encryption_key: Option<String>,
    client_id: Option<String>,
}

struct PlayStageOptions {
    tags: &'static str,
    client_id: Option<String>,
}

/// Mutable state threaded through the stages of one run.
struct StageContext {
    request: PipelineRequest,
    resolved_limit: Option<String>,
}

impl StageContext {
    fn new(request: &PipelineRequest) -> Self {
        Self {
            request: request.clone(),
            resolved_limit: None,
        }
    }

    fn commit_options(&self) -> CommitOptions {
        CommitOptions {
            message: self
                .request
                .commit_message
                .clone()
                .unwrap_or_else(|| DEFAULT_COMMIT_MESSAGE.to_string()),
        }
    }

    fn validator_options(&self) -> ValidatorOptions {
        ValidatorOptions {
            encryption_key: self.request.encryption_key.clone(),
            remove_deleted_servers: self.request.remove_deleted_servers,
            free_unused_addresses: self.request.free_unused_addresses,
            client_id: self.request.client_id.clone(),
        }
    }

    fn ready_options(&self) -> ReadyOptions {
        ReadyOptions {
            client_id: self.request.client_id.clone(),
        }
    }

    fn apply_limit_options(&self) -> ApplyLimitOptions {
        ApplyLimitOptions {
            server_id: self.request.limit_server_id.clone(),
        }
    }

    fn deploy_options(&self) -> DeployOptions {
        DeployOptions {
            limit: self.resolved_limit.clone().or(self.request.limit.clone()),
            encryption_key: self.request.encryption_key.clone(),
            client_id: self.request.client_id.clone(),
        }
    }

    fn hosts_options(&self) -> PlayStageOptions {
        PlayStageOptions {
            tags: "generate_hosts_file",
            client_id: self.request.client_id.clone(),
        }
    }

    fn health_check_options(&self) -> PlayStageOptions {
        PlayStageOptions {
            tags: "active_ping_checks",
            client_id: self.request.client_id.clone(),
        }
    }
}

/// Handle to a running pipeline.
pub struct PipelineRun {
    stage_rx: watch::Receiver<DeployStage>,
    deploy_started: oneshot::Receiver<PlayMeta>,
    handle: JoinHandle<Result<DeployStage, PipelineError>>,
}

impl PipelineRun {
    /// Stage currently (or last) executing.
    pub fn current_stage(&self) -> DeployStage {
        *self.stage_rx.borrow()
    }

    /// Resolves with the deploy play's metadata once the deploy stage has
    /// spawned successfully, or `None` when the run never got that far.
    pub async fn deploy_started(&mut self) -> Option<PlayMeta> {
        (&mut self.deploy_started).await.ok()
    }

    /// Waits for the run to finish, returning the last completed stage.
    pub async fn wait(self) -> Result<DeployStage, PipelineError> {
        match self.handle.await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::Aborted),
        }
    }
}

pub struct DeployPipeline {
    model: Arc<ModelService>,
    playbooks: Arc<PlaybookService>,
    cp_output_dir: PathBuf,
    executing: AtomicBool,
}

impl DeployPipeline {
    pub fn new(
        model: Arc<ModelService>,
        playbooks: Arc<PlaybookService>,
        config: &DeployerConfig,
    ) -> Self {
        Self {
            model,
            playbooks,
            cp_output_dir: config.cp_output_dir.clone(),
            executing: AtomicBool::new(false),
        }
    }

    /// Starts a run up to `target`, failing fast when one is already
    /// executing. The run continues in a background task; the returned handle
    /// observes it.
    pub fn run_to(
        self: &Arc<Self>,
        target: DeployStage,
        request: PipelineRequest,
    ) -> Result<PipelineRun, PipelineError> {
        if self.executing.swap(true, Ordering::SeqCst) {
            warn!("Deploy process already running, refusing a second run");
            return Err(PipelineError::AlreadyRunning);
        }
        info!(target = %target, "Deploy process started");

        let (stage_tx, stage_rx) = watch::channel(DeployStage::Commit);
        let (deploy_tx, deploy_rx) = oneshot::channel();
        let pipeline = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let _running = scopeguard::guard(Arc::clone(&pipeline), |p| {
                p.executing.store(false, Ordering::SeqCst);
                info!("Deploy process finished");
            });
            pipeline.drive(target, request, stage_tx, deploy_tx).await
        });

        Ok(PipelineRun {
            stage_rx,
            deploy_started: deploy_rx,
            handle,
        })
    }

    /// [`run_to`](Self::run_to) with a stage given by name.
    pub fn run_to_named(
        self: &Arc<Self>,
        target: &str,
        request: PipelineRequest,
    ) -> Result<PipelineRun, PipelineError> {
        self.run_to(target.parse()?, request)
    }

    async fn drive(
        &self,
        target: DeployStage,
        request: PipelineRequest,
        stage_tx: watch::Sender<DeployStage>,
        deploy_tx: oneshot::Sender<PlayMeta>,
    ) -> Result<DeployStage, PipelineError> {
        let mut ctx = StageContext::new(&request);
        let mut deploy_tx = Some(deploy_tx);

        for stage in DeployStage::ALL.iter().copied().take(target.index() + 1) {
            info!(stage = %stage, "Deploy process step: {}", stage.verb());
            let _ = stage_tx.send(stage);
            if let Err(source) = self.execute_stage(stage, &mut ctx, &mut deploy_tx).await {
                error!(stage = %stage, error = %source, "Deploy process failed");
                if deploy_tx.is_none() {
                    // The deploy start already answered the caller; from here
                    // failures surface through logs and play events.
                    error!(stage = %stage, "Failure after deploy start, reported via logging only");
                }
                if let Some(snapshot) = &request.model_before_change {
                    self.rollback(snapshot, stage, &request).await;
                }
                return Err(PipelineError::Stage { stage, source });
            }
        }
        Ok(target)
    }

    async fn execute_stage(
        &self,
        stage: DeployStage,
        ctx: &mut StageContext,
        deploy_tx: &mut Option<oneshot::Sender<PlayMeta>>,
    ) -> anyhow::Result<()> {
        match stage {
            DeployStage::Commit => {
                let options = ctx.commit_options();
                self.model.commit(&options.message).await?;
            }
            DeployStage::RunValidator => {
                let options = ctx.validator_options();
                let mut extra_vars = BTreeMap::new();
                if options.remove_deleted_servers {
                    extra_vars.insert("remove_deleted_servers".to_string(), json!("y"));
                }
                if options.free_unused_addresses {
                    extra_vars.insert("free_unused_addresses".to_string(), json!("y"));
                }
                if let Some(key) = options.encryption_key {
                    extra_vars.insert("encrypt".to_string(), json!(key));
                    extra_vars.insert("rekey".to_string(), json!(""));
                }
                let run = self
                    .playbooks
                    .run(
                        "validate",
                        PlaybookRunOptions {
                            extra_vars,
                            client_id: options.client_id,
                            prevent_concurrent_runs: true,
                            ..PlaybookRunOptions::default()
                        },
                    )
                    .await?;
                run.completion.wait().await?;
            }
            DeployStage::Ready => {
                let options = ctx.ready_options();
                let run = self
                    .playbooks
                    .run(
                        "ready_deployment",
                        PlaybookRunOptions {
                            client_id: options.client_id,
                            ..PlaybookRunOptions::default()
                        },
                    )
                    .await?;
                run.completion.wait().await?;
            }
            DeployStage::ApplyLimit => self.apply_limit(ctx),
            DeployStage::Deploy => {
                let options = ctx.deploy_options();
                let mut extra_vars = BTreeMap::new();
                if let Some(key) = options.encryption_key {
                    extra_vars.insert("encrypt".to_string(), json!(key));
                }
                let run = self
                    .playbooks
                    .run(
                        "site",
                        PlaybookRunOptions {
                            extra_vars,
                            limit: options.limit,
                            client_id: options.client_id,
                            ..PlaybookRunOptions::default()
                        },
                    )
                    .await?;
                if let Some(tx) = deploy_tx.take() {
                    let _ = tx.send(run.meta.clone());
                }
                run.completion.wait().await?;
            }
            DeployStage::GenerateHosts => {
                let options = ctx.hosts_options();
                let run = self
                    .playbooks
                    .run(
                        "site",
                        PlaybookRunOptions {
                            tags: Some(options.tags.to_string()),
                            client_id: options.client_id,
                            ..PlaybookRunOptions::default()
                        },
                    )
                    .await?;
                run.completion.wait().await?;
            }
            DeployStage::HealthCheck => {
                let options = ctx.health_check_options();
                let run = self
                    .playbooks
                    .run(
                        "monitor_deploy",
                        PlaybookRunOptions {
                            tags: Some(options.tags.to_string()),
                            client_id: options.client_id,
                            ..PlaybookRunOptions::default()
                        },
                    )
                    .await?;
                run.completion.wait().await?;
            }
        }
        Ok(())
    }

    /// Resolves the requested server id to a hostname from the validator
    /// output. A missing id is logged and the deploy proceeds unlimited.
    fn apply_limit(&self, ctx: &mut StageContext) {
        let options = ctx.apply_limit_options();
        let Some(server_id) = options.server_id else {
            info!("No server id supplied, deploying without a limit");
            return;
        };
        let path = self.cp_output_dir.join(SERVER_INFO_FILE);
        let hostname = fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_yaml::from_str::<Value>(&raw).ok())
            .and_then(|info| {
                info.get(server_id.as_str())
                    .and_then(|entry| entry.get("hostname"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            });
        match hostname {
            Some(hostname) => {
                info!(%server_id, %hostname, "Limiting the deploy to one server");
                ctx.resolved_limit = Some(hostname);
            }
            None => {
                error!(%server_id, file = %path.display(),
                    "No hostname found for server id, deploying without a limit");
            }
        }
    }

    /// Restores the snapshot and re-runs the early stages (never past
    /// `ready`, and never the failed stage itself). Errors are logged only.
    async fn rollback(
        &self,
        snapshot: &ModelDocument,
        failed: DeployStage,
        request: &PipelineRequest,
    ) {
        info!(failed = %failed, "Rolling back the model and deployment state");
        if let Err(error) = self.model.write_model(snapshot).await {
            error!(%error, "Rollback failed: could not restore the model");
            return;
        }
        let failed_index = failed.index();
        if failed_index == 0 {
            info!("Failure happened at the first stage, nothing to re-run");
            return;
        }
        let Some(target) = DeployStage::from_index(
            (failed_index - 1).min(DeployStage::Ready.index()),
        ) else {
            return;
        };

        let mut rollback_request = request.clone();
        rollback_request.commit_message = Some(format!(
            "Deploy service rollback of '{}', stage '{}' failed",
            request
                .commit_message
                .as_deref()
                .unwrap_or(DEFAULT_COMMIT_MESSAGE),
            failed
        ));
        rollback_request.remove_deleted_servers = true;
        rollback_request.limit = None;
        rollback_request.limit_server_id = None;
        rollback_request.model_before_change = None;

        let mut ctx = StageContext::new(&rollback_request);
        let mut no_deploy_tx = None;
        for stage in DeployStage::ALL.iter().copied().take(target.index() + 1) {
            info!(stage = %stage, "Rollback step: {}", stage.verb());
            if let Err(error) = self.execute_stage(stage, &mut ctx, &mut no_deploy_tx).await {
                error!(stage = %stage, %error, "Rollback step failed");
                return;
            }
        }
        info!("Rollback complete");
    }
}
