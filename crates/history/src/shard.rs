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

//! Shard ownership context.
//!
//! ## Purpose
//! One context exists per owned shard. It holds the range id acquired from
//! persistence (the fence against a previous owner), allocates task keys,
//! tracks in-flight writes, and clamps ack-cursor advancement below the
//! smallest in-flight key. Ownership release drains the tracker first so the
//! next owner reads stable cursors.

use crate::task_tracker::TaskRequestTracker;
use chrono::{DateTime, Utc};
use kairos_core::{
    CategoryKind, ServiceError, ServiceResult, TaskCategory, TaskCategoryRegistry, TaskKey,
};
use kairos_persistence::{ExecutionStore, ShardRecord};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::info;

// Each acquisition starts task ids at range_id << RANGE_ID_SHIFT so ids stay
// monotonic across ownership moves without coordination.
const RANGE_ID_SHIFT: u32 = 20;

struct ShardInner {
    ack_levels: BTreeMap<i32, TaskKey>,
    last_assigned_keys: BTreeMap<i32, TaskKey>,
    next_task_id: i64,
}

/// Context for one owned shard.
pub struct ShardContext {
    shard_id: i32,
    range_id: i64,
    owner: String,
    registry: TaskCategoryRegistry,
    store: Arc<dyn ExecutionStore>,
    tracker: TaskRequestTracker,
    inner: Mutex<ShardInner>,
    released: AtomicBool,
}

impl ShardContext {
    /// Acquire ownership of `shard_id`, bumping the persisted range id.
    pub async fn acquire(
        store: Arc<dyn ExecutionStore>,
        shard_id: i32,
        owner: impl Into<String>,
        registry: TaskCategoryRegistry,
    ) -> ServiceResult<Arc<Self>> {
        let owner = owner.into();
        let record: ShardRecord = store.acquire_shard(shard_id, &owner).await?;
        let floor = record.range_id << RANGE_ID_SHIFT;
        let next_task_id = record
            .last_assigned_keys
            .values()
            .map(|key| key.task_id + 1)
            .max()
            .unwrap_or(0)
            .max(floor);
        info!(shard_id, range_id = record.range_id, owner = %owner, "acquired shard");
        Ok(Arc::new(Self {
            shard_id,
            range_id: record.range_id,
            owner,
            tracker: TaskRequestTracker::new(registry.clone()),
            registry,
            store,
            inner: Mutex::new(ShardInner {
                ack_levels: record.ack_levels,
                last_assigned_keys: record.last_assigned_keys,
                next_task_id,
            }),
            released: AtomicBool::new(false),
        }))
    }

    /// Shard id.
    pub fn shard_id(&self) -> i32 {
        self.shard_id
    }

    /// Range id acquired for this ownership term.
    pub fn range_id(&self) -> i64 {
        self.range_id
    }

    /// Owner identity, informational.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Version stamp applied to tasks emitted under this ownership term.
    pub fn version_stamp(&self) -> i64 {
        self.range_id
    }

    /// Categories enabled on this shard.
    pub fn registry(&self) -> &TaskCategoryRegistry {
        &self.registry
    }

    /// In-flight write tracker.
    pub fn tracker(&self) -> &TaskRequestTracker {
        &self.tracker
    }

    /// Backing store.
    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    /// Allocate the key for a newly generated task.
    ///
    /// Immediate categories get the zero fire time; scheduled categories keep
    /// the task's fire time. Task ids are strictly increasing within the
    /// ownership term, which makes every allocated key strictly greater than
    /// the category's last-assigned key.
    pub fn allocate_task_key(
        &self,
        category: TaskCategory,
        fire_time: Option<DateTime<Utc>>,
    ) -> ServiceResult<TaskKey> {
        if !self.registry.contains(category) {
            return Err(ServiceError::InvalidArgument(format!(
                "task category {} is not enabled on shard {}",
                category, self.shard_id
            )));
        }
        let mut inner = self.inner.lock().expect("shard lock poisoned");
        let task_id = inner.next_task_id;
        inner.next_task_id += 1;
        let key = match category.kind() {
            CategoryKind::Immediate => TaskKey::new_immediate(task_id),
            CategoryKind::Scheduled => TaskKey::new(
                fire_time.ok_or_else(|| {
                    ServiceError::InvalidArgument(format!(
                        "scheduled task in category {} has no fire time",
                        category
                    ))
                })?,
                task_id,
            ),
        };
        Ok(key)
    }

    /// Check a generated key against the category's last-assigned key and
    /// record it as the new high-water mark.
    pub fn validate_and_record_key(
        &self,
        category: TaskCategory,
        key: TaskKey,
    ) -> ServiceResult<()> {
        let mut inner = self.inner.lock().expect("shard lock poisoned");
        if let Some(last) = inner.last_assigned_keys.get(&category.id()) {
            if key.task_id <= last.task_id {
                return Err(ServiceError::internal(format!(
                    "task key {} not greater than last assigned {} for category {}",
                    key.task_id, last.task_id, category
                )));
            }
        }
        inner.last_assigned_keys.insert(category.id(), key);
        Ok(())
    }

    /// Last-assigned keys snapshot, for inclusion in a commit request.
    pub fn last_assigned_keys(&self) -> BTreeMap<i32, TaskKey> {
        self.inner
            .lock()
            .expect("shard lock poisoned")
            .last_assigned_keys
            .clone()
    }

    /// Committed ack cursor for a category.
    pub fn ack_level(&self, category: TaskCategory) -> TaskKey {
        self.inner
            .lock()
            .expect("shard lock poisoned")
            .ack_levels
            .get(&category.id())
            .copied()
            .unwrap_or_else(TaskKey::minimum)
    }

    /// Advance the ack cursor toward `candidate`, clamped below the smallest
    /// in-flight key, and persist the result. Returns the effective cursor.
    ///
    /// The clamp is the correctness reason the tracker exists: a commit whose
    /// outcome is unknown may still land, and its tasks must not be deleted
    /// by the range delete that follows cursor advancement.
    pub async fn advance_ack_level(
        &self,
        category: TaskCategory,
        candidate: TaskKey,
    ) -> ServiceResult<TaskKey> {
        let effective = match self.tracker.min_task_key(category) {
            Some(inflight_min) if inflight_min < candidate => inflight_min,
            _ => candidate,
        };
        let current = self.ack_level(category);
        if effective <= current {
            return Ok(current);
        }
        self.store
            .update_ack_level(self.shard_id, self.range_id, category.id(), effective)
            .await?;
        self.inner
            .lock()
            .expect("shard lock poisoned")
            .ack_levels
            .insert(category.id(), effective);
        Ok(effective)
    }

    /// Release ownership: wait for in-flight writes to settle so the next
    /// owner reads stable cursors. Idempotent.
    pub async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.tracker.drain().await;
        info!(shard_id = self.shard_id, range_id = self.range_id, "released shard");
    }
}
