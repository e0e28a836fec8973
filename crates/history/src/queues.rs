// SPDX-License-Identifier: LGPL-2.1-or-later
// Copyright (C) 2025 Shahzad A. Bhatti <bhatti@plexobject.com>
//
// This file is part of Kairos.
//
// Kairos is free software: you can redistribute it and/or modify
// it under the terms of the GNU Lesser General Public License as published by
// the Free Software Foundation, either version 2.1 of the License, or
// (at your option) any later version.
//
// Kairos is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public License
// along with Kairos. If not, see <https://www.gnu.org/licenses/>.

//! Per-category task queue readers.
//!
//! Each shard owner runs one reader loop per enabled category. A pass reads
//! committed tasks above the ack cursor, executes them in key order, then
//! advances the cursor (clamped below any in-flight write by the shard)
//! and range-deletes rows below the committed cursor.

use crate::shard::ShardContext;
use async_trait::async_trait;
use chrono::Utc;
use kairos_core::{CategoryKind, ServiceResult, TaskCategory, TaskKey};
use kairos_persistence::{TaskRow, TaskStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Executes one committed task.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Process the task. A returned error halts the pass before the task,
    /// leaving the cursor below it so the task is retried next pass.
    async fn execute(&self, task: &TaskRow) -> ServiceResult<()>;
}

/// Reader loop for one `(shard, category)` stream.
pub struct QueueReader {
    shard: Arc<ShardContext>,
    category: TaskCategory,
    task_store: Arc<dyn TaskStore>,
    executor: Arc<dyn TaskExecutor>,
    batch_size: usize,
    shutdown: Notify,
}

impl QueueReader {
    /// Reader over an acquired shard.
    pub fn new(
        shard: Arc<ShardContext>,
        category: TaskCategory,
        task_store: Arc<dyn TaskStore>,
        executor: Arc<dyn TaskExecutor>,
        batch_size: usize,
    ) -> Self {
        Self {
            shard,
            category,
            task_store,
            executor,
            batch_size,
            shutdown: Notify::new(),
        }
    }

    /// Upper bound of a pass: everything for immediate categories, fired
    /// timers only for scheduled ones.
    fn read_bound(&self) -> TaskKey {
        match self.category.kind() {
            CategoryKind::Immediate => TaskKey::maximum(),
            CategoryKind::Scheduled => TaskKey::new(Utc::now(), i64::MAX),
        }
    }

    /// Run one pass. Returns the number of tasks executed.
    pub async fn process_once(&self) -> ServiceResult<usize> {
        let ack = self.shard.ack_level(self.category);
        let tasks = self
            .task_store
            .get_tasks(
                self.shard.shard_id(),
                self.category.id(),
                ack,
                self.read_bound(),
                self.batch_size,
            )
            .await?;

        let mut processed = 0;
        let mut candidate = ack;
        for task in &tasks {
            match self.executor.execute(task).await {
                Ok(()) => {
                    processed += 1;
                    candidate = task.key.next();
                }
                Err(err) => {
                    warn!(
                        category = %self.category,
                        task_id = task.key.task_id,
                        error = %err,
                        "task execution failed, stopping pass"
                    );
                    break;
                }
            }
        }

        if candidate > ack {
            let committed = self
                .shard
                .advance_ack_level(self.category, candidate)
                .await?;
            let deleted = self
                .task_store
                .range_delete_tasks(self.shard.shard_id(), self.category.id(), committed)
                .await?;
            debug!(
                category = %self.category,
                processed,
                deleted,
                ack = committed.task_id,
                "queue pass complete"
            );
        }
        Ok(processed)
    }

    /// Run passes on an interval until [`stop`](Self::stop).
    pub async fn run(&self, poll_interval: Duration) {
        let mut ticker = tokio::time::interval(poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.process_once().await {
                        warn!(category = %self.category, error = %err, "queue pass failed");
                    }
                }
                _ = self.shutdown.notified() => return,
            }
        }
    }

    /// Stop the reader loop.
    pub fn stop(&self) {
        self.shutdown.notify_waiters();
    }
}
