// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Application services: guarded model access, the play registry, the
//! playbook catalog and the deploy pipeline.

pub mod deploy_pipeline;
pub mod guard;
pub mod model_service;
pub mod play_registry;
pub mod playbooks;
