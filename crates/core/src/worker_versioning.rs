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

//! Worker-versioning identifiers shared across the matching, history and
//! deployment planes.

use crate::BuildId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Fully-qualified deployment version: `deployment_name:build_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeploymentVersion {
    /// Named grouping of worker versions sharing routing intent.
    pub deployment_name: String,
    /// Worker binary version within the deployment.
    pub build_id: BuildId,
}

impl DeploymentVersion {
    /// Convenience constructor.
    pub fn new(deployment_name: impl Into<String>, build_id: impl Into<BuildId>) -> Self {
        Self {
            deployment_name: deployment_name.into(),
            build_id: build_id.into(),
        }
    }
}

impl fmt::Display for DeploymentVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.deployment_name, self.build_id)
    }
}

/// How a polling worker participates in versioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersioningMode {
    /// Worker is unversioned; it receives only unversioned work.
    Unversioned,
    /// Worker is pinned to its declared deployment version.
    Versioned,
}

/// Versioning identity a worker presents on every poll and add.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerDeploymentOptions {
    /// Deployment the worker belongs to.
    pub deployment_name: String,
    /// The worker's build id.
    pub build_id: BuildId,
    /// Participation mode.
    pub versioning_mode: VersioningMode,
}

/// Per-workflow routing directive, attached at start or via options update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersioningOverride {
    /// All tasks route to this exact version, ignoring deployment routing.
    Pinned(DeploymentVersion),
    /// Tasks follow the deployment's current version as it changes.
    AutoUpgrade,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deployment_version_display() {
        let version = DeploymentVersion::new("checkout", "v2.1");
        assert_eq!(version.to_string(), "checkout:v2.1");
    }
}
