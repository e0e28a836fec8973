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

//! Sub-state-machine hosting inside workflow mutable state.
//!
//! ## Purpose
//! A workflow's mutable state hosts a tree of sub-state machines addressed by
//! path. Durable tasks carry a [`NodeRef`] naming the node and the transition
//! count observed when the task was generated. On access, a persisted
//! transition count beyond the reference means the machine has already moved
//! on; the access fails with `StaleReference` and the caller refreshes or,
//! for standby side-effects, drops the task because the active side already
//! executed it.

use kairos_core::{ServiceError, ServiceResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Capabilities a node's machine advertises; task executors dispatch on
/// these instead of downcasting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCapabilities {
    /// Handles immediate-category tasks.
    pub execute_immediate: bool,
    /// Handles scheduled (timer-backed) tasks.
    pub execute_scheduled: bool,
    /// Participates in replication apply.
    pub on_replicate: bool,
}

/// One node of the machine tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChasmNode {
    /// Number of state transitions applied to this node since creation.
    pub transition_count: u64,
    /// Machine-defined serialized state.
    pub data: Value,
    /// Advertised capability set.
    pub capabilities: NodeCapabilities,
    children: BTreeMap<String, ChasmNode>,
}

/// Reference to a node at a known transition count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRef {
    /// Path from the root, one component per tree level.
    pub path: Vec<String>,
    /// Transition count observed when the reference was created.
    pub transition_count: u64,
}

/// Access discipline for [`NodeTree::access`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Observe only; the transition count is unchanged.
    Read,
    /// Mutate; the transition count is bumped after the closure succeeds.
    Write,
}

/// Tree of sub-state machines addressed by path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeTree {
    root: ChasmNode,
}

impl NodeTree {
    /// Empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    fn node_mut(&mut self, path: &[String]) -> Option<&mut ChasmNode> {
        let mut current = &mut self.root;
        for component in path {
            current = current.children.get_mut(component)?;
        }
        Some(current)
    }

    fn node(&self, path: &[String]) -> Option<&ChasmNode> {
        let mut current = &self.root;
        for component in path {
            current = current.children.get(component)?;
        }
        Some(current)
    }

    /// Create or replace the node at `path`, creating intermediate nodes as
    /// needed. Bumps the node's transition count.
    pub fn upsert(&mut self, path: &[String], data: Value, capabilities: NodeCapabilities) {
        let mut current = &mut self.root;
        for component in path {
            current = current.children.entry(component.clone()).or_default();
        }
        current.data = data;
        current.capabilities = capabilities;
        current.transition_count += 1;
    }

    /// Remove the node at `path` and its subtree.
    pub fn remove(&mut self, path: &[String]) -> bool {
        let Some((last, parent_path)) = path.split_last() else {
            return false;
        };
        match self.node_mut(parent_path) {
            Some(parent) => parent.children.remove(last).is_some(),
            None => false,
        }
    }

    /// A reference to the node at `path` at its current transition count.
    pub fn reference(&self, path: &[String]) -> Option<NodeRef> {
        self.node(path).map(|node| NodeRef {
            path: path.to_vec(),
            transition_count: node.transition_count,
        })
    }

    /// Access the referenced node.
    ///
    /// Fails with `StaleReference` when the persisted transition count has
    /// advanced past the reference, or when the node no longer exists (a
    /// deleted machine reads as infinitely advanced). Write access bumps the
    /// transition count after the closure succeeds.
    pub fn access<T>(
        &mut self,
        node_ref: &NodeRef,
        mode: AccessMode,
        f: impl FnOnce(&mut ChasmNode) -> ServiceResult<T>,
    ) -> ServiceResult<T> {
        let Some(node) = self.node_mut(&node_ref.path) else {
            return Err(ServiceError::StaleReference {
                referenced: node_ref.transition_count,
                persisted: u64::MAX,
            });
        };
        if node.transition_count > node_ref.transition_count {
            return Err(ServiceError::StaleReference {
                referenced: node_ref.transition_count,
                persisted: node.transition_count,
            });
        }
        let result = f(node)?;
        if mode == AccessMode::Write {
            node.transition_count += 1;
        }
        Ok(result)
    }
}
