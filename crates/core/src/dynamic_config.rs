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

//! Recognized dynamic-configuration options.
//!
//! ## Purpose
//! Components read tunables through an explicit table of recognized keys, each
//! with a compiled-in default. Values can be swapped at runtime; every read
//! goes through the shared map so a swap is visible on the next read without
//! restarting anything.
//!
//! ## Design
//! Config is passed explicitly to constructors; there is no process-global
//! instance and no environment-variable fallback.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Recognized configuration keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKey {
    /// How long a poller identity stays in a queue's recent-poller history.
    PollerHistoryTtl,
    /// Interval between drainage re-checks on a version sub-workflow.
    VersionDrainageStatusRefreshInterval,
    /// Grace period before trusting the visibility index on drainage checks.
    VersionDrainageStatusVisibilityGracePeriod,
    /// Maximum versions per worker deployment before the scavenger runs.
    MatchingMaxVersionsInDeployment,
    /// Maximum assignment rules per task queue.
    MatchingMaxAssignmentRules,
    /// Maximum redirect rules per task queue.
    MatchingMaxRedirectRules,
    /// Maximum upstream chain length behind any redirect target.
    MatchingMaxUpstreamBuildIds,
    /// Whether the front door masks internal error details from clients.
    FrontendMaskInternalErrorDetails,
    /// Interval between full namespace cache refreshes.
    NamespaceCacheRefreshInterval,
    /// Page size used by the namespace refresh loop.
    NamespaceCacheRefreshPageSize,
    /// Per-task execution timeout for the outbound category.
    OutboundTaskTimeout,
    /// How long a standby outbound task may stay pending before discard.
    OutboundStandbyTaskMissingEventsDiscardDelay,
    /// Stale-TTL applied to redirector cache entries on membership change.
    HistoryClientStaleTtl,
    /// Retention for version-rule tombstones before physical cleanup.
    VersioningRuleTombstoneRetention,
}

/// A dynamically swappable value.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    /// Duration-typed option.
    Duration(Duration),
    /// Integer-typed option.
    Int(i64),
    /// Boolean-typed option.
    Bool(bool),
}

impl ConfigKey {
    /// Compiled-in default for the key.
    pub fn default_value(&self) -> ConfigValue {
        use ConfigKey::*;
        match self {
            PollerHistoryTtl => ConfigValue::Duration(Duration::from_secs(5 * 60)),
            VersionDrainageStatusRefreshInterval => {
                ConfigValue::Duration(Duration::from_secs(3 * 60))
            }
            VersionDrainageStatusVisibilityGracePeriod => {
                ConfigValue::Duration(Duration::from_secs(3 * 60))
            }
            MatchingMaxVersionsInDeployment => ConfigValue::Int(100),
            MatchingMaxAssignmentRules => ConfigValue::Int(100),
            MatchingMaxRedirectRules => ConfigValue::Int(500),
            MatchingMaxUpstreamBuildIds => ConfigValue::Int(50),
            FrontendMaskInternalErrorDetails => ConfigValue::Bool(false),
            NamespaceCacheRefreshInterval => ConfigValue::Duration(Duration::from_secs(10)),
            NamespaceCacheRefreshPageSize => ConfigValue::Int(200),
            OutboundTaskTimeout => ConfigValue::Duration(Duration::from_secs(10)),
            OutboundStandbyTaskMissingEventsDiscardDelay => {
                ConfigValue::Duration(Duration::from_secs(15 * 60))
            }
            HistoryClientStaleTtl => ConfigValue::Duration(Duration::from_secs(30)),
            VersioningRuleTombstoneRetention => {
                ConfigValue::Duration(Duration::from_secs(14 * 24 * 3600))
            }
        }
    }
}

/// Read-through store of dynamic options with per-key hot swap.
#[derive(Debug, Clone, Default)]
pub struct DynamicConfig {
    overrides: Arc<RwLock<HashMap<ConfigKey, ConfigValue>>>,
}

impl DynamicConfig {
    /// Store with no overrides; every read returns the compiled-in default.
    pub fn new() -> Self {
        Self::default()
    }

    /// Swap the value for a key. Subsequent reads observe the new value.
    pub fn set(&self, key: ConfigKey, value: ConfigValue) {
        self.overrides
            .write()
            .expect("dynamic config lock poisoned")
            .insert(key, value);
    }

    /// Remove an override, reverting the key to its default.
    pub fn unset(&self, key: ConfigKey) {
        self.overrides
            .write()
            .expect("dynamic config lock poisoned")
            .remove(&key);
    }

    fn get(&self, key: ConfigKey) -> ConfigValue {
        self.overrides
            .read()
            .expect("dynamic config lock poisoned")
            .get(&key)
            .cloned()
            .unwrap_or_else(|| key.default_value())
    }

    /// Duration value of a key. Panics if the key is not duration-typed,
    /// which indicates a programming error rather than bad input.
    pub fn duration(&self, key: ConfigKey) -> Duration {
        match self.get(key) {
            ConfigValue::Duration(d) => d,
            other => panic!("config key {:?} is not a duration: {:?}", key, other),
        }
    }

    /// Integer value of a key.
    pub fn int(&self, key: ConfigKey) -> i64 {
        match self.get(key) {
            ConfigValue::Int(i) => i,
            other => panic!("config key {:?} is not an integer: {:?}", key, other),
        }
    }

    /// Boolean value of a key.
    pub fn bool(&self, key: ConfigKey) -> bool {
        match self.get(key) {
            ConfigValue::Bool(b) => b,
            other => panic!("config key {:?} is not a boolean: {:?}", key, other),
        }
    }
}
