// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! End-to-end tests of the deploy pipeline against a real git repository and
//! stub playbooks (shell scripts run through `/bin/sh`).

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use git2::{build::CheckoutBuilder, IndexAddOption, Repository, Signature};
use serde_yaml::Value;
use tempfile::TempDir;

use aegis_deploy_core::application::deploy_pipeline::{
    DeployPipeline, PipelineRequest, PipelineRun,
};
use aegis_deploy_core::application::model_service::ModelService;
use aegis_deploy_core::application::play_registry::PlayRegistry;
use aegis_deploy_core::application::playbooks::PlaybookService;
use aegis_deploy_core::config::DeployerConfig;
use aegis_deploy_core::domain::pipeline::{DeployStage, PipelineError};
use aegis_deploy_core::infrastructure::event_bus::EventBus;

struct Harness {
    _tmp: TempDir,
    model: Arc<ModelService>,
    pipeline: Arc<DeployPipeline>,
    markers: PathBuf,
    flags: PathBuf,
}

impl Harness {
    fn ran(&self, marker: &str) -> bool {
        self.markers.join(marker).is_file()
    }

    fn set_flag(&self, flag: &str) {
        fs::write(self.flags.join(flag), "").unwrap();
    }

    fn clear_flag(&self, flag: &str) {
        let _ = fs::remove_file(self.flags.join(flag));
    }

    /// Appends a server record so the commit stage has something to commit.
    async fn grow_model(&self, id: &str) {
        let mut doc = self.model.get_model().await.unwrap();
        if let Some(Value::Sequence(servers)) = doc.input_model.get_mut("servers") {
            servers.push(serde_yaml::from_str(&format!("id: {id}\nrole: ROLE-A\n")).unwrap());
        } else {
            panic!("servers section missing");
        }
        self.model.write_model(&doc).await.unwrap();
    }
}

fn init_site_repo(dir: &Path) {
    let repo = Repository::init(dir).unwrap();
    let mut index = repo.index().unwrap();
    index
        .add_all(["*"], IndexAddOption::DEFAULT, None)
        .unwrap();
    index.write().unwrap();
    let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
    let sig = Signature::now("tester", "tester@example.com").unwrap();
    let commit_id = repo
        .commit(Some("HEAD"), &sig, &sig, "initial model", &tree, &[])
        .unwrap();
    let commit = repo.find_commit(commit_id).unwrap();
    repo.branch("site", &commit, true).unwrap();
    repo.set_head("refs/heads/site").unwrap();
    repo.checkout_head(Some(CheckoutBuilder::new().force()))
        .unwrap();
}

fn harness() -> Harness {
    let tmp = TempDir::new().unwrap();
    let repo_dir = tmp.path().join("repo");
    let model_dir = repo_dir.join("model");
    let markers = tmp.path().join("markers");
    let flags = tmp.path().join("flags");
    let ansible_dir = tmp.path().join("ansible");
    let scratch_dir = tmp.path().join("scratch");
    for dir in [&markers, &flags, &ansible_dir, &scratch_dir] {
        fs::create_dir_all(dir).unwrap();
    }

    fs::create_dir_all(model_dir.join("data")).unwrap();
    fs::write(
        model_dir.join("cloudConfig.yml"),
        "product:\n  version: 2\ncloud:\n  name: testcloud\n",
    )
    .unwrap();
    fs::write(
        model_dir.join("data/servers.yml"),
        "product:\n  version: 2\nservers:\n  - id: server1\n    role: ROLE-A\n",
    )
    .unwrap();
    init_site_repo(&repo_dir);

    // Stub playbooks: plain shell scripts run through /bin/sh. Behavior is
    // toggled per test via flag files.
    let m = markers.display();
    let f = flags.display();
    fs::write(
        ansible_dir.join("validate.yml"),
        format!(
            "if [ -f {f}/fail_validate ]; then exit 1; fi\n\
             if [ -f {f}/slow_validate ]; then sleep 2; fi\n\
             touch {m}/validate.ran\nexit 0\n"
        ),
    )
    .unwrap();
    fs::write(
        ansible_dir.join("ready-deployment.yml"),
        format!("touch {m}/ready.ran\nexit 0\n"),
    )
    .unwrap();
    fs::write(
        scratch_dir.join("site.yml"),
        format!("touch {m}/site.ran\nexit 0\n"),
    )
    .unwrap();
    fs::write(
        scratch_dir.join("monitor-deploy.yml"),
        format!("touch {m}/monitor.ran\nexit 0\n"),
    )
    .unwrap();

    let config = DeployerConfig {
        repo_dir,
        model_dir,
        logs_dir: tmp.path().join("logs"),
        archive_dir: tmp.path().join("archive"),
        cp_output_dir: tmp.path().join("cp_output"),
        ansible_dir,
        playbook_dirs: vec![scratch_dir],
        inventory_file: None,
        playbook_command: "/bin/sh".to_string(),
        ..DeployerConfig::default()
    };

    let events = EventBus::with_default_capacity();
    let registry = PlayRegistry::new(
        config.logs_dir.clone(),
        config.archive_dir.clone(),
        config.max_log_bytes(),
        events.clone(),
    )
    .unwrap();
    let model = Arc::new(ModelService::new(config.clone(), events));
    let playbooks = Arc::new(PlaybookService::new(config.clone(), registry));
    let pipeline = Arc::new(DeployPipeline::new(model.clone(), playbooks, &config));

    Harness {
        _tmp: tmp,
        model,
        pipeline,
        markers,
        flags,
    }
}

fn start(h: &Harness, target: DeployStage, request: PipelineRequest) -> PipelineRun {
    h.pipeline.run_to(target, request).unwrap()
}

#[tokio::test]
async fn run_to_ready_executes_stages_in_order() {
    let h = harness();
    h.grow_model("server2").await;

    let run = start(&h, DeployStage::Ready, PipelineRequest::default());
    let finished = run.wait().await.unwrap();

    assert_eq!(finished, DeployStage::Ready);
    assert!(h.ran("validate.ran"));
    assert!(h.ran("ready.ran"));
    assert!(!h.ran("site.ran"));

    let head = h.model.get_current_commit().await.unwrap();
    assert!(head.message.contains("deploy service"));
}

#[tokio::test]
async fn deploy_started_resolves_with_the_deploy_play() {
    let h = harness();
    h.grow_model("server2").await;

    let mut run = start(&h, DeployStage::Deploy, PipelineRequest::default());
    let meta = run.deploy_started().await.expect("deploy never started");
    assert!(meta.command_string.contains("site.yml"));

    assert_eq!(run.wait().await.unwrap(), DeployStage::Deploy);
    assert!(h.ran("site.ran"));
}

#[tokio::test]
async fn validator_failure_rolls_back_to_the_snapshot() {
    let h = harness();
    let snapshot = h.model.get_model().await.unwrap();
    h.grow_model("server2").await;
    h.set_flag("fail_validate");

    let request = PipelineRequest {
        commit_message: Some("add server2".to_string()),
        model_before_change: Some(snapshot.clone()),
        ..PipelineRequest::default()
    };
    let run = start(&h, DeployStage::Ready, request);
    let error = run.wait().await.unwrap_err();

    // The caller gets the validator failure, not any rollback outcome.
    match error {
        PipelineError::Stage { stage, .. } => assert_eq!(stage, DeployStage::RunValidator),
        other => panic!("expected stage failure, got {other:?}"),
    }
    assert!(!h.ran("ready.ran"));

    // The model is back to the snapshot and the rollback was committed.
    let restored = h.model.get_model().await.unwrap();
    assert_eq!(restored.input_model, snapshot.input_model);
    let head = h.model.get_current_commit().await.unwrap();
    assert!(head.message.contains("rollback"));
}

#[tokio::test]
async fn rollback_failure_never_masks_the_original_error() {
    let h = harness();
    let mut snapshot = h.model.get_model().await.unwrap();
    // Sabotage the snapshot's provenance: with no descriptors left for the
    // servers file, writing it back cannot resolve the section's key field.
    snapshot
        .file_info
        .file_section_map
        .get_mut("data/servers.yml")
        .unwrap()
        .clear();
    h.grow_model("server2").await;
    h.set_flag("fail_validate");

    let request = PipelineRequest {
        model_before_change: Some(snapshot),
        ..PipelineRequest::default()
    };
    let run = start(&h, DeployStage::Ready, request);
    match run.wait().await.unwrap_err() {
        PipelineError::Stage { stage, .. } => assert_eq!(stage, DeployStage::RunValidator),
        other => panic!("expected the validator failure, got {other:?}"),
    }
}

#[tokio::test]
async fn concurrent_runs_are_refused() {
    let h = harness();
    h.grow_model("server2").await;
    h.set_flag("slow_validate");

    let first = start(&h, DeployStage::RunValidator, PipelineRequest::default());
    let second = h
        .pipeline
        .run_to(DeployStage::RunValidator, PipelineRequest::default());
    assert!(matches!(second, Err(PipelineError::AlreadyRunning)));

    assert_eq!(first.wait().await.unwrap(), DeployStage::RunValidator);

    // Once the first run finished the pipeline accepts work again.
    h.clear_flag("slow_validate");
    h.grow_model("server3").await;
    let third = start(&h, DeployStage::RunValidator, PipelineRequest::default());
    assert_eq!(third.wait().await.unwrap(), DeployStage::RunValidator);
}

#[tokio::test]
async fn apply_limit_resolves_a_hostname_and_missing_ids_are_tolerated() {
    let h = harness();
    h.grow_model("server2").await;

    // Validator output maps server ids to hostnames.
    let cp_output = h._tmp.path().join("cp_output");
    fs::create_dir_all(&cp_output).unwrap();
    fs::write(
        cp_output.join("server_info.yml"),
        "server1:\n  hostname: host-0001\n",
    )
    .unwrap();

    let request = PipelineRequest {
        limit_server_id: Some("server-unknown".to_string()),
        ..PipelineRequest::default()
    };
    let mut run = start(&h, DeployStage::Deploy, request);
    let meta = run.deploy_started().await.expect("deploy never started");
    // An unresolvable id is logged and the deploy proceeds unlimited.
    assert!(!meta.command_string.contains("--limit"));
    assert_eq!(run.wait().await.unwrap(), DeployStage::Deploy);
    assert!(h.ran("site.ran"));

    // A known id is resolved to its hostname and limits the deploy.
    h.grow_model("server3").await;
    let request = PipelineRequest {
        limit_server_id: Some("server1".to_string()),
        ..PipelineRequest::default()
    };
    let mut run = start(&h, DeployStage::Deploy, request);
    let meta = run.deploy_started().await.expect("deploy never started");
    assert!(meta.command_string.contains("--limit host-0001"));
    assert_eq!(run.wait().await.unwrap(), DeployStage::Deploy);
}

#[tokio::test]
async fn unknown_stage_names_are_rejected() {
    let h = harness();
    let result = h
        .pipeline
        .run_to_named("reticulate-splines", PipelineRequest::default());
    assert!(matches!(result, Err(PipelineError::UnknownStage(_))));
}
