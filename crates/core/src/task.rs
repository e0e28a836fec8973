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

//! Durable task model.
//!
//! ## Purpose
//! Tasks are the unit of durable follow-up work emitted by the history engine
//! alongside every mutable-state commit. Each task belongs to exactly one
//! category; within a category task keys are totally ordered, which is what
//! ack cursors and range deletes rely on.
//!
//! ## Key shape
//! Immediate categories order by a 64-bit task id alone. Scheduled categories
//! (timers) order by `(fire_time, task_id)`. Both shapes share one `TaskKey`
//! struct; immediate keys carry the zero fire time so the lexicographic
//! ordering degenerates to the id.

use crate::WorkflowKey;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Whether a category's tasks are dispatched as soon as they are committed or
/// only once their fire time arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CategoryKind {
    /// Dispatched immediately; keyed by task id.
    Immediate,
    /// Dispatched at fire time; keyed by `(fire_time, task_id)`.
    Scheduled,
}

/// Closed set of task categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TaskCategory {
    /// Drives matching dispatch of workflow/activity tasks.
    Transfer,
    /// Durable timers.
    Timer,
    /// Visibility-index updates.
    Visibility,
    /// Cross-cluster replication.
    Replication,
    /// Side-effects against external destinations.
    Outbound,
    /// Closed-workflow archival.
    Archival,
    /// Memo propagation.
    Memo,
}

impl TaskCategory {
    /// Stable numeric id, used by the CLI and the persisted task tables.
    pub fn id(&self) -> i32 {
        match self {
            TaskCategory::Transfer => 1,
            TaskCategory::Timer => 2,
            TaskCategory::Visibility => 3,
            TaskCategory::Replication => 4,
            TaskCategory::Outbound => 5,
            TaskCategory::Archival => 6,
            TaskCategory::Memo => 7,
        }
    }

    /// Resolve a category from its stable numeric id.
    pub fn from_id(id: i32) -> Option<TaskCategory> {
        match id {
            1 => Some(TaskCategory::Transfer),
            2 => Some(TaskCategory::Timer),
            3 => Some(TaskCategory::Visibility),
            4 => Some(TaskCategory::Replication),
            5 => Some(TaskCategory::Outbound),
            6 => Some(TaskCategory::Archival),
            7 => Some(TaskCategory::Memo),
            _ => None,
        }
    }

    /// Dispatch discipline for the category.
    pub fn kind(&self) -> CategoryKind {
        match self {
            TaskCategory::Timer => CategoryKind::Scheduled,
            _ => CategoryKind::Immediate,
        }
    }

    /// Lower-case name used in logs and metric tags.
    pub fn name(&self) -> &'static str {
        match self {
            TaskCategory::Transfer => "transfer",
            TaskCategory::Timer => "timer",
            TaskCategory::Visibility => "visibility",
            TaskCategory::Replication => "replication",
            TaskCategory::Outbound => "outbound",
            TaskCategory::Archival => "archival",
            TaskCategory::Memo => "memo",
        }
    }
}

impl fmt::Display for TaskCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// The set of categories enabled on a shard.
#[derive(Debug, Clone)]
pub struct TaskCategoryRegistry {
    categories: BTreeMap<i32, TaskCategory>,
}

impl TaskCategoryRegistry {
    /// Registry with every category enabled.
    pub fn new_default() -> Self {
        let mut categories = BTreeMap::new();
        for category in [
            TaskCategory::Transfer,
            TaskCategory::Timer,
            TaskCategory::Visibility,
            TaskCategory::Replication,
            TaskCategory::Outbound,
            TaskCategory::Archival,
            TaskCategory::Memo,
        ] {
            categories.insert(category.id(), category);
        }
        Self { categories }
    }

    /// Registry restricted to the given categories.
    pub fn new_with(categories: impl IntoIterator<Item = TaskCategory>) -> Self {
        Self {
            categories: categories.into_iter().map(|c| (c.id(), c)).collect(),
        }
    }

    /// Whether the category is enabled.
    pub fn contains(&self, category: TaskCategory) -> bool {
        self.categories.contains_key(&category.id())
    }

    /// Enabled categories in id order.
    pub fn categories(&self) -> impl Iterator<Item = TaskCategory> + '_ {
        self.categories.values().copied()
    }
}

impl Default for TaskCategoryRegistry {
    fn default() -> Self {
        Self::new_default()
    }
}

/// Totally ordered key of a task within its category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskKey {
    /// Fire time; the zero timestamp for immediate categories.
    pub fire_time: DateTime<Utc>,
    /// Shard-assigned 64-bit id, monotonic per category.
    pub task_id: i64,
}

impl TaskKey {
    /// Key for an immediate-category task.
    pub fn new_immediate(task_id: i64) -> Self {
        Self {
            fire_time: zero_time(),
            task_id,
        }
    }

    /// Key for a scheduled-category task.
    pub fn new(fire_time: DateTime<Utc>, task_id: i64) -> Self {
        Self { fire_time, task_id }
    }

    /// The immediate successor of this key: same fire time, next task id.
    pub fn next(&self) -> Self {
        Self {
            fire_time: self.fire_time,
            task_id: self.task_id + 1,
        }
    }

    /// Smallest representable key.
    pub fn minimum() -> Self {
        Self {
            fire_time: zero_time(),
            task_id: 0,
        }
    }

    /// Largest representable key.
    pub fn maximum() -> Self {
        Self {
            fire_time: Utc.timestamp_millis_opt(i64::MAX / 2).single().expect("in range"),
            task_id: i64::MAX,
        }
    }
}

impl Ord for TaskKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.fire_time
            .cmp(&other.fire_time)
            .then(self.task_id.cmp(&other.task_id))
    }
}

impl PartialOrd for TaskKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The zero fire time shared by all immediate keys.
pub fn zero_time() -> DateTime<Utc> {
    Utc.timestamp_millis_opt(0).single().expect("epoch is valid")
}

/// A durable task emitted by the history engine.
pub trait Task: Send + Sync + fmt::Debug {
    /// Workflow the task belongs to.
    fn workflow_key(&self) -> &WorkflowKey;
    /// Category the task is appended under.
    fn category(&self) -> TaskCategory;
    /// Total-order key within the category.
    fn key(&self) -> TaskKey;
    /// Assign the key; called once by the shard during commit.
    fn set_key(&mut self, key: TaskKey);
    /// Version stamp from the emitting shard's clock, used to fence stale
    /// tasks after ownership moves.
    fn version_stamp(&self) -> i64;
    /// Opaque serialized payload persisted in the task row.
    fn payload(&self) -> serde_json::Value;
}

/// Minimal task implementation used by shard and tracker tests.
#[derive(Debug, Clone)]
pub struct FakeTask {
    /// Owning workflow.
    pub workflow_key: WorkflowKey,
    /// Category to append under.
    pub category: TaskCategory,
    /// Assigned key.
    pub task_key: TaskKey,
    /// Emitting shard's version stamp.
    pub version: i64,
}

impl FakeTask {
    /// New fake task with an unassigned key.
    pub fn new(workflow_key: WorkflowKey, category: TaskCategory) -> Self {
        Self {
            workflow_key,
            category,
            task_key: TaskKey::minimum(),
            version: 0,
        }
    }
}

impl Task for FakeTask {
    fn workflow_key(&self) -> &WorkflowKey {
        &self.workflow_key
    }

    fn category(&self) -> TaskCategory {
        self.category
    }

    fn key(&self) -> TaskKey {
        self.task_key
    }

    fn set_key(&mut self, key: TaskKey) {
        self.task_key = key;
    }

    fn version_stamp(&self) -> i64 {
        self.version
    }

    fn payload(&self) -> serde_json::Value {
        serde_json::json!({
            "namespace_id": self.workflow_key.namespace_id,
            "workflow_id": self.workflow_key.workflow_id,
            "run_id": self.workflow_key.run_id,
            "category": self.category.name(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_immediate_keys_order_by_id() {
        let a = TaskKey::new_immediate(123);
        let b = TaskKey::new_immediate(125);
        assert!(a < b);
        assert!(TaskKey::minimum() <= a);
        assert!(b < TaskKey::maximum());
    }

    #[test]
    fn test_scheduled_keys_order_by_fire_time_first() {
        let now = Utc::now();
        let earlier_big_id = TaskKey::new(now, 999);
        let later_small_id = TaskKey::new(now + Duration::minutes(1), 1);
        assert!(earlier_big_id < later_small_id);

        // Same fire time falls back to id order.
        let tie_a = TaskKey::new(now, 124);
        let tie_b = TaskKey::new(now, 125);
        assert!(tie_a < tie_b);
    }

    #[test]
    fn test_category_ids_are_stable() {
        for category in TaskCategoryRegistry::new_default().categories() {
            assert_eq!(TaskCategory::from_id(category.id()), Some(category));
        }
        assert_eq!(TaskCategory::from_id(0), None);
        assert_eq!(TaskCategory::from_id(99), None);
    }

    #[test]
    fn test_restricted_registry() {
        let registry =
            TaskCategoryRegistry::new_with([TaskCategory::Transfer, TaskCategory::Timer]);
        assert!(registry.contains(TaskCategory::Transfer));
        assert!(!registry.contains(TaskCategory::Outbound));
    }
}
