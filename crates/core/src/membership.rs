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

//! Membership capability trait.
//!
//! ## Purpose
//! Shard ownership is conveyed by an external membership service. Core code
//! depends only on this narrow shape: a keyed lookup returning the owning
//! host, plus a change stream that fires whenever the ring moves. The real
//! implementation lives outside this workspace; the in-memory resolver here
//! backs tests.

use crate::error::{ServiceError, ServiceResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::broadcast;

/// A resolved cluster host.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostInfo {
    address: String,
}

impl HostInfo {
    /// Host from its RPC address.
    pub fn from_address(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }

    /// RPC address of the host.
    pub fn address(&self) -> &str {
        &self.address
    }
}

/// Fired when ring ownership changes. Carries no payload; listeners
/// re-resolve the keys they care about.
#[derive(Debug, Clone, Default)]
pub struct MembershipChangedEvent;

/// Keyed ownership lookup over the membership ring.
#[async_trait]
pub trait ServiceResolver: Send + Sync {
    /// Host currently owning `key`.
    async fn lookup(&self, key: &str) -> ServiceResult<HostInfo>;

    /// Subscribe to ring-change events.
    fn subscribe(&self) -> broadcast::Receiver<MembershipChangedEvent>;
}

/// In-memory resolver for tests: ownership is an explicit map, and change
/// events fire on demand.
pub struct SimulatedResolver {
    owners: RwLock<HashMap<String, HostInfo>>,
    changes: broadcast::Sender<MembershipChangedEvent>,
    lookups: RwLock<u64>,
}

impl SimulatedResolver {
    /// Empty resolver.
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(16);
        Self {
            owners: RwLock::new(HashMap::new()),
            changes,
            lookups: RwLock::new(0),
        }
    }

    /// Assign `key` to the host at `address`.
    pub fn assign(&self, key: impl Into<String>, address: impl Into<String>) {
        self.owners
            .write()
            .expect("resolver lock poisoned")
            .insert(key.into(), HostInfo::from_address(address));
    }

    /// Fire a membership-changed event to all subscribers.
    pub fn notify_changed(&self) {
        let _ = self.changes.send(MembershipChangedEvent);
    }

    /// Number of lookups served, for call-count assertions.
    pub fn lookup_count(&self) -> u64 {
        *self.lookups.read().expect("resolver lock poisoned")
    }
}

impl Default for SimulatedResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ServiceResolver for SimulatedResolver {
    async fn lookup(&self, key: &str) -> ServiceResult<HostInfo> {
        *self.lookups.write().expect("resolver lock poisoned") += 1;
        self.owners
            .read()
            .expect("resolver lock poisoned")
            .get(key)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(format!("no owner for key {}", key)))
    }

    fn subscribe(&self) -> broadcast::Receiver<MembershipChangedEvent> {
        self.changes.subscribe()
    }
}
