// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain types and errors for the deployer core.

pub mod model;
pub mod pipeline;
pub mod play;

pub use model::*;
pub use pipeline::*;
pub use play::*;
