// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Infrastructure adapters: model file I/O, git workspace, event bus.

pub mod event_bus;
pub mod git_workspace;
pub mod model_reader;
pub mod model_writer;
