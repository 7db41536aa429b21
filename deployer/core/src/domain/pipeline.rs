// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Deploy pipeline domain types.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The fixed, ordered stages of a deploy run.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum DeployStage {
    Commit,
    RunValidator,
    Ready,
    ApplyLimit,
    Deploy,
    GenerateHosts,
    HealthCheck,
}

impl DeployStage {
    pub const ALL: [DeployStage; 7] = [
        DeployStage::Commit,
        DeployStage::RunValidator,
        DeployStage::Ready,
        DeployStage::ApplyLimit,
        DeployStage::Deploy,
        DeployStage::GenerateHosts,
        DeployStage::HealthCheck,
    ];

    pub fn index(self) -> usize {
        Self::ALL.iter().position(|s| *s == self).unwrap_or(0)
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Commit => "commit",
            Self::RunValidator => "run-validator",
            Self::Ready => "ready",
            Self::ApplyLimit => "apply-limit",
            Self::Deploy => "deploy",
            Self::GenerateHosts => "generate-hosts",
            Self::HealthCheck => "health-check",
        }
    }

    /// Progress message logged when the stage starts.
    pub fn verb(self) -> &'static str {
        match self {
            Self::Commit => "Committing model changes",
            Self::RunValidator => "Running the configuration validator",
            Self::ApplyLimit => "Resolving the deployment limit",
            Self::Ready => "Readying the deployment area",
            Self::Deploy => "Deploying",
            Self::GenerateHosts => "Generating the hosts file",
            Self::HealthCheck => "Running the deployment health check",
        }
    }
}

impl fmt::Display for DeployStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DeployStage {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|stage| stage.name() == s)
            .ok_or_else(|| PipelineError::UnknownStage(s.to_string()))
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("cannot run concurrent deploy processes")]
    AlreadyRunning,

    #[error("unknown deploy stage '{0}'")]
    UnknownStage(String),

    #[error("deploy process failed at stage '{stage}': {source}")]
    Stage {
        stage: DeployStage,
        #[source]
        source: anyhow::Error,
    },

    #[error("deploy process task aborted")]
    Aborted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_order_is_fixed() {
        assert_eq!(DeployStage::Commit.index(), 0);
        assert_eq!(DeployStage::HealthCheck.index(), 6);
        assert!(DeployStage::Ready < DeployStage::Deploy);
        assert_eq!(DeployStage::from_index(3), Some(DeployStage::ApplyLimit));
        assert_eq!(DeployStage::from_index(7), None);
    }

    #[test]
    fn stage_names_round_trip() {
        for stage in DeployStage::ALL {
            assert_eq!(stage.name().parse::<DeployStage>().ok(), Some(stage));
        }
        assert!(matches!(
            "reticulate".parse::<DeployStage>(),
            Err(PipelineError::UnknownStage(_))
        ));
    }
}
