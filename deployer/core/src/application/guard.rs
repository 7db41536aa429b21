// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Single-writer/multi-reader guard over the input model.
//!
//! Reads run concurrently and wait for an in-flight writer. A write fails
//! immediately when another writer is active (writers never queue behind each
//! other) and otherwise waits for in-flight readers before running. Reads
//! issued while a writer is pending queue until it finishes.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::RwLock;
use tracing::{debug, error};

use crate::domain::model::ModelError;

pub struct ModelGuard {
    lock: RwLock<()>,
    writer_active: AtomicBool,
}

impl ModelGuard {
    pub fn new() -> Self {
        Self {
            lock: RwLock::new(()),
            writer_active: AtomicBool::new(false),
        }
    }

    /// Runs `op` as a reader.
    pub async fn read<F, T>(&self, op: F) -> T
    where
        F: Future<Output = T>,
    {
        debug!("Acquiring model reader lock");
        let _reader = self.lock.read().await;
        debug!("Acquired model reader lock");
        op.await
    }

    /// Runs `op` as the single writer, or fails fast with
    /// [`ModelError::ConcurrentWrite`] when a writer is already active. The
    /// writer slot releases on every exit path.
    pub async fn write<F, T>(&self, op: F) -> Result<T, ModelError>
    where
        F: Future<Output = Result<T, ModelError>>,
    {
        if self.writer_active.swap(true, Ordering::SeqCst) {
            error!("Writer already active, concurrent writes to the model are not allowed");
            return Err(ModelError::ConcurrentWrite);
        }
        let _slot = scopeguard::guard((), |_| {
            self.writer_active.store(false, Ordering::SeqCst);
        });

        debug!("Acquiring model writer lock");
        let _writer = self.lock.write().await;
        debug!("Acquired model writer lock");
        op.await
    }
}

impl Default for ModelGuard {
    fn default() -> Self {
        Self::new()
    }
}
