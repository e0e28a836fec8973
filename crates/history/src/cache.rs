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

//! Per-shard workflow mutable-state cache.
//!
//! ## Design
//! Workflows do not hold pointers into the cache; they address slots by
//! workflow key, and each slot carries a version counter bumped on eviction
//! so stale holders notice. The slot's writer mutex is the per-workflow
//! serialized section: one writer at a time per workflow id within the shard.

use crate::mutable_state::WorkflowMutableState;
use kairos_core::WorkflowKey;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Cached state plus the persisted db-record version it corresponds to.
#[derive(Debug, Clone)]
pub struct CachedState {
    /// Mutable state snapshot.
    pub state: WorkflowMutableState,
    /// `db_record_version` of the persisted row backing the snapshot.
    pub db_record_version: i64,
}

/// One cache slot. Holders of an [`Arc<CacheSlot>`] observe eviction through
/// the slot version.
pub struct CacheSlot {
    writer: tokio::sync::Mutex<()>,
    state: Mutex<Option<CachedState>>,
    slot_version: AtomicU64,
}

impl CacheSlot {
    fn new() -> Self {
        Self {
            writer: tokio::sync::Mutex::new(()),
            state: Mutex::new(None),
            slot_version: AtomicU64::new(0),
        }
    }

    /// Serialize writers for this workflow.
    pub async fn lock_writer(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.writer.lock().await
    }

    /// Cached state, if the slot is warm.
    pub fn cached(&self) -> Option<CachedState> {
        self.state.lock().expect("cache lock poisoned").clone()
    }

    /// Replace the cached state.
    pub fn put(&self, cached: CachedState) {
        *self.state.lock().expect("cache lock poisoned") = Some(cached);
    }

    /// Drop the cached state and invalidate outstanding references.
    pub fn invalidate(&self) {
        *self.state.lock().expect("cache lock poisoned") = None;
        self.slot_version.fetch_add(1, Ordering::SeqCst);
    }

    /// Version observed when a reference was taken; compare to detect
    /// eviction.
    pub fn version(&self) -> u64 {
        self.slot_version.load(Ordering::SeqCst)
    }
}

/// Map of workflow key to cache slot for one shard.
#[derive(Default)]
pub struct WorkflowCache {
    slots: Mutex<HashMap<WorkflowKey, Arc<CacheSlot>>>,
}

impl WorkflowCache {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the slot for a workflow.
    pub fn slot(&self, key: &WorkflowKey) -> Arc<CacheSlot> {
        let mut slots = self.slots.lock().expect("cache lock poisoned");
        slots
            .entry(key.clone())
            .or_insert_with(|| Arc::new(CacheSlot::new()))
            .clone()
    }

    /// Invalidate and remove a workflow's slot.
    pub fn evict(&self, key: &WorkflowKey) {
        let slot = {
            let mut slots = self.slots.lock().expect("cache lock poisoned");
            slots.remove(key)
        };
        if let Some(slot) = slot {
            slot.invalidate();
        }
    }

    /// Number of resident slots.
    pub fn len(&self) -> usize {
        self.slots.lock().expect("cache lock poisoned").len()
    }

    /// Whether the cache holds no slots.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> WorkflowKey {
        WorkflowKey::new("ns", "wf", "run")
    }

    #[tokio::test]
    async fn test_slot_identity_is_stable() {
        let cache = WorkflowCache::new();
        let a = cache.slot(&key());
        let b = cache.slot(&key());
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_eviction_bumps_slot_version() {
        let cache = WorkflowCache::new();
        let slot = cache.slot(&key());
        let seen = slot.version();

        slot.put(CachedState {
            state: WorkflowMutableState::new(key(), vec![1]),
            db_record_version: 1,
        });
        assert!(slot.cached().is_some());

        cache.evict(&key());
        assert!(slot.cached().is_none());
        assert!(slot.version() > seen);

        // A fresh slot replaces the evicted one.
        let fresh = cache.slot(&key());
        assert!(!Arc::ptr_eq(&slot, &fresh));
    }

    #[tokio::test]
    async fn test_writer_lock_serializes() {
        let cache = WorkflowCache::new();
        let slot = cache.slot(&key());
        let guard = slot.lock_writer().await;
        assert!(slot.writer.try_lock().is_err());
        drop(guard);
        assert!(slot.writer.try_lock().is_ok());
    }
}
