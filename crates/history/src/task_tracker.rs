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

//! Per-shard tracker of task keys mid-write.
//!
//! ## Purpose
//! Between the moment a commit transaction is issued and the moment its
//! outcome is known, the generated task keys may or may not be live in
//! storage. Ack cursors must never advance past the smallest such key, or a
//! write that lands late would be deleted unread. The tracker owns that set.
//!
//! ## Completion semantics
//! - Success: keys are removed; the tasks are durably visible behind the
//!   cursor logic.
//! - Definitely-not-inserted (conditional failure): keys are removed
//!   immediately; storage guarantees they never landed.
//! - Any other error: the outcome is unknown, so the keys stay tracked and
//!   the cursor stays pinned below them.

use kairos_core::{TaskCategory, TaskCategoryRegistry, TaskKey};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Outcome reported for a tracked commit request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The transaction committed.
    Success,
    /// The transaction definitely did not apply (conditional failure).
    DefinitelyNotInserted,
    /// The transaction outcome is unknown (e.g. transport failure).
    Unknown,
}

#[derive(Default)]
struct Inner {
    // category id -> multiset of inflight keys
    pending: HashMap<i32, BTreeMap<TaskKey, usize>>,
    outstanding: usize,
}

struct State {
    registry: TaskCategoryRegistry,
    inner: Mutex<Inner>,
    drained: Notify,
}

/// Tracks task keys for requests whose persistence outcome is pending.
#[derive(Clone)]
pub struct TaskRequestTracker {
    state: Arc<State>,
}

/// Handle used to report the outcome of one tracked request. Completing more
/// than once is a no-op.
pub struct TrackedRequest {
    state: Arc<State>,
    keys: Vec<(TaskCategory, TaskKey)>,
    completed: AtomicBool,
}

impl TaskRequestTracker {
    /// Tracker for the categories enabled on a shard.
    pub fn new(registry: TaskCategoryRegistry) -> Self {
        Self {
            state: Arc::new(State {
                registry,
                inner: Mutex::new(Inner::default()),
                drained: Notify::new(),
            }),
        }
    }

    /// Register the task keys of one commit request.
    ///
    /// Keys in categories the shard does not serve are ignored; validation
    /// against the registry happens earlier on the commit path.
    pub fn track(
        &self,
        keys_by_category: HashMap<TaskCategory, Vec<TaskKey>>,
    ) -> TrackedRequest {
        let mut keys = Vec::new();
        {
            let mut inner = self.state.inner.lock().expect("tracker lock poisoned");
            for (category, category_keys) in keys_by_category {
                if !self.state.registry.contains(category) {
                    continue;
                }
                let pending = inner.pending.entry(category.id()).or_default();
                for key in category_keys {
                    *pending.entry(key).or_insert(0) += 1;
                    keys.push((category, key));
                }
            }
            inner.outstanding += 1;
        }
        TrackedRequest {
            state: self.state.clone(),
            keys,
            completed: AtomicBool::new(false),
        }
    }

    /// Smallest inflight key for a category, if any.
    pub fn min_task_key(&self, category: TaskCategory) -> Option<TaskKey> {
        let inner = self.state.inner.lock().expect("tracker lock poisoned");
        inner
            .pending
            .get(&category.id())
            .and_then(|keys| keys.keys().next().copied())
    }

    /// Wait until every tracked request has reported an outcome. Called as
    /// part of shard ownership release; returns immediately when nothing is
    /// inflight.
    pub async fn drain(&self) {
        loop {
            let notified = self.state.drained.notified();
            if self
                .state
                .inner
                .lock()
                .expect("tracker lock poisoned")
                .outstanding
                == 0
            {
                return;
            }
            notified.await;
        }
    }

    /// Drop all tracked state. Used when the shard unloads without a clean
    /// handoff; the next owner re-reads cursors from storage.
    pub fn clear(&self) {
        let mut inner = self.state.inner.lock().expect("tracker lock poisoned");
        inner.pending.clear();
        inner.outstanding = 0;
        drop(inner);
        self.state.drained.notify_waiters();
    }
}

impl TrackedRequest {
    /// Report the request outcome. Unknown outcomes leave the keys tracked.
    pub fn complete(&self, outcome: TaskOutcome) {
        if self.completed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut inner = self.state.inner.lock().expect("tracker lock poisoned");
        if outcome != TaskOutcome::Unknown {
            for (category, key) in &self.keys {
                if let Some(pending) = inner.pending.get_mut(&category.id()) {
                    if let Some(count) = pending.get_mut(key) {
                        *count -= 1;
                        if *count == 0 {
                            pending.remove(key);
                        }
                    }
                }
            }
        }
        if inner.outstanding > 0 {
            inner.outstanding -= 1;
        }
        let empty = inner.outstanding == 0;
        drop(inner);
        if empty {
            self.state.drained.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn tracker() -> TaskRequestTracker {
        TaskRequestTracker::new(TaskCategoryRegistry::new_with([
            TaskCategory::Transfer,
            TaskCategory::Timer,
        ]))
    }

    fn transfer_keys(ids: &[i64]) -> HashMap<TaskCategory, Vec<TaskKey>> {
        HashMap::from([(
            TaskCategory::Transfer,
            ids.iter().map(|id| TaskKey::new_immediate(*id)).collect(),
        )])
    }

    #[tokio::test]
    async fn test_track_and_min_task_key() {
        let tracker = tracker();
        let now = Utc::now();

        let _req = tracker.track(HashMap::from([
            (
                TaskCategory::Transfer,
                vec![TaskKey::new_immediate(123), TaskKey::new_immediate(125)],
            ),
            (
                TaskCategory::Timer,
                vec![
                    TaskKey::new(now, 124),
                    TaskKey::new(now + Duration::minutes(1), 122),
                ],
            ),
        ]));
        assert_eq!(
            tracker.min_task_key(TaskCategory::Transfer),
            Some(TaskKey::new_immediate(123))
        );
        assert_eq!(
            tracker.min_task_key(TaskCategory::Timer),
            Some(TaskKey::new(now, 124))
        );

        let _req2 = tracker.track(HashMap::from([
            (TaskCategory::Transfer, vec![TaskKey::new_immediate(130)]),
            (
                TaskCategory::Timer,
                vec![TaskKey::new(now - Duration::minutes(1), 131)],
            ),
        ]));
        assert_eq!(
            tracker.min_task_key(TaskCategory::Transfer),
            Some(TaskKey::new_immediate(123))
        );
        assert_eq!(
            tracker.min_task_key(TaskCategory::Timer),
            Some(TaskKey::new(now - Duration::minutes(1), 131))
        );

        // Category not enabled on this shard.
        assert_eq!(tracker.min_task_key(TaskCategory::Visibility), None);
    }

    #[tokio::test]
    async fn test_request_completion() {
        let tracker = tracker();
        let req1 = tracker.track(transfer_keys(&[123, 125]));
        let req2 = tracker.track(transfer_keys(&[122]));
        let req3 = tracker.track(transfer_keys(&[127]));
        assert_eq!(
            tracker.min_task_key(TaskCategory::Transfer),
            Some(TaskKey::new_immediate(122))
        );

        req2.complete(TaskOutcome::Success);
        assert_eq!(
            tracker.min_task_key(TaskCategory::Transfer),
            Some(TaskKey::new_immediate(123))
        );

        // Conditional failure guarantees the task never landed.
        req3.complete(TaskOutcome::DefinitelyNotInserted);
        assert_eq!(
            tracker.min_task_key(TaskCategory::Transfer),
            Some(TaskKey::new_immediate(123))
        );

        // Unknown outcome keeps the keys pinned.
        req1.complete(TaskOutcome::Unknown);
        assert_eq!(
            tracker.min_task_key(TaskCategory::Transfer),
            Some(TaskKey::new_immediate(123))
        );

        tracker.drain().await;
    }

    #[tokio::test]
    async fn test_drain_waits_for_outstanding_requests() {
        let tracker = tracker();
        // Drain with nothing inflight returns immediately.
        tracker.drain().await;

        let requests = vec![
            tracker.track(transfer_keys(&[123])),
            tracker.track(transfer_keys(&[122])),
            tracker.track(transfer_keys(&[127])),
        ];
        for req in requests {
            tokio::spawn(async move {
                req.complete(TaskOutcome::Success);
            });
        }
        tracker.drain().await;
    }

    #[tokio::test]
    async fn test_completion_is_idempotent() {
        let tracker = tracker();
        let req = tracker.track(transfer_keys(&[5]));
        req.complete(TaskOutcome::Success);
        req.complete(TaskOutcome::Success);
        assert_eq!(tracker.min_task_key(TaskCategory::Transfer), None);
        tracker.drain().await;
    }

    #[tokio::test]
    async fn test_clear() {
        let tracker = tracker();
        let _req1 = tracker.track(transfer_keys(&[123, 125]));
        let req2 = tracker.track(transfer_keys(&[122]));
        req2.complete(TaskOutcome::Unknown);
        assert_eq!(
            tracker.min_task_key(TaskCategory::Transfer),
            Some(TaskKey::new_immediate(122))
        );

        tracker.clear();
        assert_eq!(tracker.min_task_key(TaskCategory::Transfer), None);
        tracker.drain().await;
    }
}
