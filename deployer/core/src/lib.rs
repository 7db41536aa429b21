// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Core subsystems for the AEGIS cloud deployer.
//!
//! # Architecture
//!
//! - **Model Store:** reads/writes the versioned input model across a
//!   directory of YAML files with exact round-trip provenance.
//! - **Process Registry:** spawns, tracks, streams, persists and archives
//!   long-running playbook processes.
//! - **Deploy Pipeline:** sequences commit, validation, readiness and
//!   deployment steps with rollback on failure.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

pub use domain::*;
