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

//! Write-ahead version history for replicated workflow branches.
//!
//! ## Purpose
//! Each workflow branch records an ordered sequence of `(version, event_id)`
//! items summarizing which failover version authored which prefix of events.
//! Two strict monotonicity invariants hold on every history:
//! versions along the sequence are non-decreasing, and event ids strictly
//! increase. The lowest common ancestor between a local and a remote history
//! is the anchor for conflict resolution across replicated clusters.

use crate::error::{ServiceError, ServiceResult};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// First valid event id in any branch.
pub const FIRST_EVENT_ID: i64 = 1;

/// One `(version, event_id)` item of a version history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionHistoryItem {
    /// Failover version that authored the run of events ending at `event_id`.
    pub version: i64,
    /// Inclusive last event id authored under `version`.
    pub event_id: i64,
}

impl VersionHistoryItem {
    /// Convenience constructor.
    pub fn new(version: i64, event_id: i64) -> Self {
        Self { version, event_id }
    }
}

/// Compare items by `(event_id, version)`.
pub fn compare_items(a: &VersionHistoryItem, b: &VersionHistoryItem) -> Ordering {
    a.event_id
        .cmp(&b.event_id)
        .then(a.version.cmp(&b.version))
}

/// A single branch's version history.
///
/// The branch token names the linear sub-history within the workflow's event
/// tree; for the current run it is never empty.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VersionHistory {
    /// Opaque identifier of the branch in the history tree.
    pub branch_token: Vec<u8>,
    /// Monotone `(version, event_id)` items.
    pub items: Vec<VersionHistoryItem>,
}

impl VersionHistory {
    /// New history with the given branch token and items.
    pub fn new(branch_token: Vec<u8>, items: Vec<VersionHistoryItem>) -> Self {
        Self {
            branch_token,
            items,
        }
    }

    /// Whether the history carries no items yet.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Append a new item or extend the last one.
    ///
    /// Rejects any item that would violate monotonicity: a version lower than
    /// the last item's, or an event id not strictly greater than the last
    /// item's.
    pub fn add_or_update_item(&mut self, item: VersionHistoryItem) -> ServiceResult<()> {
        let Some(last) = self.items.last_mut() else {
            self.items.push(item);
            return Ok(());
        };

        if item.version < last.version {
            return Err(ServiceError::internal(format!(
                "cannot update version history with a lower version {}. Last version: {}",
                item.version, last.version
            )));
        }
        if item.event_id <= last.event_id {
            return Err(ServiceError::internal(format!(
                "cannot add version history with a lower event id {}. Last event id: {}",
                item.event_id, last.event_id
            )));
        }

        if item.version > last.version {
            self.items.push(item);
        } else {
            // Same version, strictly larger event id: extend in place.
            last.event_id = item.event_id;
        }
        Ok(())
    }

    /// Whether the given item falls inside this history.
    pub fn contains_item(&self, item: &VersionHistoryItem) -> bool {
        let mut prev_event_id = FIRST_EVENT_ID - 1;
        for current in &self.items {
            if item.version == current.version {
                if prev_event_id < item.event_id && item.event_id <= current.event_id {
                    return true;
                }
            } else if item.version < current.version {
                return false;
            }
            prev_event_id = current.event_id;
        }
        false
    }

    /// Lowest common ancestor item between this history and a remote one.
    ///
    /// Walks both sequences from the tail; the first version match yields the
    /// item with the smaller event id. Errors when the histories share no
    /// prefix at all, which indicates corruption.
    pub fn find_lca_item(&self, remote: &VersionHistory) -> ServiceResult<VersionHistoryItem> {
        find_lca_item_from_slices(&self.items, &remote.items)
    }

    /// Copy of this history truncated at the given LCA item.
    pub fn copy_until_lca_item(
        &self,
        lca_item: &VersionHistoryItem,
    ) -> ServiceResult<VersionHistory> {
        let not_found =
            || ServiceError::internal("version history does not contain the LCA item");
        let mut result = VersionHistory::new(self.branch_token.clone(), Vec::new());
        for item in &self.items {
            if item.version < lca_item.version {
                result.add_or_update_item(*item)?;
            } else if item.version == lca_item.version {
                if lca_item.event_id > item.event_id {
                    return Err(not_found());
                }
                result.add_or_update_item(*lca_item)?;
                return Ok(result);
            } else {
                return Err(not_found());
            }
        }
        Err(not_found())
    }

    /// Whether an LCA item sits exactly at this history's tail, meaning new
    /// events can be appended to the branch instead of forking it.
    pub fn is_lca_appendable(&self, lca_item: &VersionHistoryItem) -> bool {
        self.items.last() == Some(lca_item)
    }

    /// First item of the history.
    pub fn first_item(&self) -> ServiceResult<VersionHistoryItem> {
        self.items
            .first()
            .copied()
            .ok_or_else(|| ServiceError::internal("version history is empty"))
    }

    /// Last item of the history.
    pub fn last_item(&self) -> ServiceResult<VersionHistoryItem> {
        self.items
            .last()
            .copied()
            .ok_or_else(|| ServiceError::internal("version history is empty"))
    }

    /// Version that authored the given event id.
    pub fn version_at_event(&self, event_id: i64) -> ServiceResult<i64> {
        let last = self.last_item()?;
        if event_id < FIRST_EVENT_ID || event_id > last.event_id {
            return Err(ServiceError::internal(format!(
                "input event ID is not in range, eventID: {}",
                event_id
            )));
        }
        // Items are sorted by event id, so the first item whose event id
        // covers the input holds the answer.
        for item in &self.items {
            if event_id <= item.event_id {
                return Ok(item.version);
            }
        }
        Err(ServiceError::internal(format!(
            "input event ID is not in range, eventID: {}",
            event_id
        )))
    }

    /// Compare two histories by their last items.
    pub fn compare(&self, other: &VersionHistory) -> ServiceResult<Ordering> {
        Ok(compare_items(&self.last_item()?, &other.last_item()?))
    }
}

/// LCA between two raw item slices.
pub fn find_lca_item_from_slices(
    a: &[VersionHistoryItem],
    b: &[VersionHistoryItem],
) -> ServiceResult<VersionHistoryItem> {
    let mut a_index = a.len() as isize - 1;
    let mut b_index = b.len() as isize - 1;

    while a_index >= 0 && b_index >= 0 {
        let a_item = a[a_index as usize];
        let b_item = b[b_index as usize];

        match a_item.version.cmp(&b_item.version) {
            Ordering::Equal => {
                return Ok(if a_item.event_id > b_item.event_id {
                    b_item
                } else {
                    a_item
                });
            }
            Ordering::Greater => a_index -= 1,
            Ordering::Less => b_index -= 1,
        }
    }

    Err(ServiceError::internal(
        "version history is malformed. No joint point found",
    ))
}

/// True iff the LCA of the two item sequences equals either endpoint, i.e.
/// one history is a prefix of the other.
pub fn items_in_same_branch(a: &[VersionHistoryItem], b: &[VersionHistoryItem]) -> bool {
    let Ok(lca) = find_lca_item_from_slices(a, b) else {
        return false;
    };
    let (Some(a_last), Some(b_last)) = (a.last(), b.last()) else {
        return false;
    };
    lca == *a_last || lca == *b_last
}

/// Split items into the prefix authored locally and the remote-authored tail.
///
/// An item is locally generated when its version is congruent to the cluster's
/// initial failover version modulo the failover-version increment.
pub fn split_by_last_local_generated_item(
    items: &[VersionHistoryItem],
    initial_failover_version: i64,
    failover_version_increment: i64,
) -> (Vec<VersionHistoryItem>, Vec<VersionHistoryItem>) {
    for i in (0..items.len()).rev() {
        if items[i].version % failover_version_increment == initial_failover_version {
            return (items[..=i].to_vec(), items[i + 1..].to_vec());
        }
    }
    (Vec::new(), items.to_vec())
}

/// Collection of branches with a distinguished current branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionHistories {
    /// Index of the branch receiving new events.
    pub current_index: usize,
    /// All known branches.
    pub histories: Vec<VersionHistory>,
}

impl VersionHistories {
    /// Collection seeded with a single current branch.
    pub fn new(history: VersionHistory) -> Self {
        Self {
            current_index: 0,
            histories: vec![history],
        }
    }

    /// The current branch.
    pub fn current(&self) -> ServiceResult<&VersionHistory> {
        self.histories
            .get(self.current_index)
            .ok_or_else(|| ServiceError::internal("version histories current index out of range"))
    }

    /// Find the branch with the best LCA against the given remote items.
    ///
    /// Best means the LCA with the highest event id; ties prefer the shorter
    /// local history so conflict resolution rewinds the least work.
    pub fn find_lca_item(
        &self,
        remote_items: &[VersionHistoryItem],
    ) -> ServiceResult<(VersionHistoryItem, usize)> {
        let mut best: Option<(VersionHistoryItem, usize, usize)> = None;
        for (index, local) in self.histories.iter().enumerate() {
            let item = find_lca_item_from_slices(&local.items, remote_items)?;
            let replace = match &best {
                None => true,
                Some((best_item, _, best_len)) => {
                    item.event_id > best_item.event_id
                        || (item.event_id == best_item.event_id && local.items.len() < *best_len)
                }
            };
            if replace {
                best = Some((item, index, local.items.len()));
            }
        }
        best.map(|(item, index, _)| (item, index))
            .ok_or_else(|| ServiceError::internal("version histories collection is empty"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(raw: &[(i64, i64)]) -> Vec<VersionHistoryItem> {
        raw.iter()
            .map(|(v, e)| VersionHistoryItem::new(*v, *e))
            .collect()
    }

    #[test]
    fn test_add_or_update_appends_and_extends() {
        let mut history = VersionHistory::default();
        history
            .add_or_update_item(VersionHistoryItem::new(0, 3))
            .unwrap();
        history
            .add_or_update_item(VersionHistoryItem::new(0, 5))
            .unwrap();
        history
            .add_or_update_item(VersionHistoryItem::new(4, 7))
            .unwrap();
        assert_eq!(history.items, items(&[(0, 5), (4, 7)]));
    }

    #[test]
    fn test_add_or_update_rejects_monotonicity_violations() {
        let mut history = VersionHistory::new(vec![], items(&[(4, 7)]));

        // Lower version.
        assert!(history
            .add_or_update_item(VersionHistoryItem::new(3, 9))
            .is_err());
        // Event id not strictly increasing.
        assert!(history
            .add_or_update_item(VersionHistoryItem::new(4, 7))
            .is_err());
        assert!(history
            .add_or_update_item(VersionHistoryItem::new(5, 6))
            .is_err());
        assert_eq!(history.items, items(&[(4, 7)]));
    }

    #[test]
    fn test_contains_item() {
        let history = VersionHistory::new(vec![], items(&[(0, 3), (4, 7)]));

        assert!(history.contains_item(&VersionHistoryItem::new(0, 1)));
        assert!(history.contains_item(&VersionHistoryItem::new(0, 3)));
        assert!(history.contains_item(&VersionHistoryItem::new(4, 5)));
        assert!(history.contains_item(&VersionHistoryItem::new(4, 7)));

        // Event 4 was authored under version 4, not version 0.
        assert!(!history.contains_item(&VersionHistoryItem::new(0, 4)));
        assert!(!history.contains_item(&VersionHistoryItem::new(4, 3)));
        assert!(!history.contains_item(&VersionHistoryItem::new(4, 8)));
        assert!(!history.contains_item(&VersionHistoryItem::new(9, 1)));
    }

    #[test]
    fn test_lca_three_way() {
        let local = VersionHistory::new(vec![], items(&[(0, 3), (4, 5), (6, 7), (10, 9)]));
        let remote = VersionHistory::new(vec![], items(&[(0, 3), (4, 5), (6, 6), (12, 11)]));

        let lca = local.find_lca_item(&remote).unwrap();
        assert_eq!(lca, VersionHistoryItem::new(6, 6));

        // LCA is contained in both histories, per the correctness property.
        assert!(local.contains_item(&lca));
        assert!(remote.contains_item(&lca));
    }

    #[test]
    fn test_lca_disjoint_histories_error() {
        let a = VersionHistory::new(vec![], items(&[(1, 3)]));
        let b = VersionHistory::new(vec![], items(&[(2, 3)]));
        assert!(a.find_lca_item(&b).is_err());
    }

    #[test]
    fn test_copy_until_lca() {
        let history = VersionHistory::new(vec![1, 2], items(&[(0, 3), (4, 5), (6, 7)]));
        let copied = history
            .copy_until_lca_item(&VersionHistoryItem::new(6, 6))
            .unwrap();
        assert_eq!(copied.items, items(&[(0, 3), (4, 5), (6, 6)]));

        // LCA beyond the recorded tail cannot be honored.
        assert!(history
            .copy_until_lca_item(&VersionHistoryItem::new(6, 8))
            .is_err());
        assert!(history
            .copy_until_lca_item(&VersionHistoryItem::new(7, 8))
            .is_err());
    }

    #[test]
    fn test_same_branch_is_prefix_relation() {
        let trunk = items(&[(0, 3), (4, 7)]);
        let extension = items(&[(0, 3), (4, 9)]);
        let fork = items(&[(0, 3), (5, 6)]);

        assert!(items_in_same_branch(&trunk, &extension));
        assert!(items_in_same_branch(&extension, &trunk));
        assert!(!items_in_same_branch(&extension, &fork));
    }

    #[test]
    fn test_version_at_event() {
        let history = VersionHistory::new(vec![], items(&[(0, 3), (4, 7)]));
        assert_eq!(history.version_at_event(1).unwrap(), 0);
        assert_eq!(history.version_at_event(3).unwrap(), 0);
        assert_eq!(history.version_at_event(4).unwrap(), 4);
        assert_eq!(history.version_at_event(7).unwrap(), 4);
        assert!(history.version_at_event(0).is_err());
        assert!(history.version_at_event(8).is_err());
    }

    #[test]
    fn test_histories_pick_best_branch() {
        let histories = VersionHistories {
            current_index: 0,
            histories: vec![
                VersionHistory::new(vec![], items(&[(0, 3), (4, 7)])),
                VersionHistory::new(vec![], items(&[(0, 3), (6, 8)])),
            ],
        };
        let remote = items(&[(0, 3), (6, 10)]);
        let (item, index) = histories.find_lca_item(&remote).unwrap();
        assert_eq!(index, 1);
        assert_eq!(item, VersionHistoryItem::new(6, 8));
    }

    #[test]
    fn test_split_by_last_local_generated_item() {
        let all = items(&[(1, 3), (2, 5), (11, 8), (12, 10)]);
        // Cluster with initial version 1, increment 10: versions 1 and 11 are local.
        let (local, remote) = split_by_last_local_generated_item(&all, 1, 10);
        assert_eq!(local, items(&[(1, 3), (2, 5), (11, 8)]));
        assert_eq!(remote, items(&[(12, 10)]));

        let (local, remote) = split_by_last_local_generated_item(&all, 3, 10);
        assert!(local.is_empty());
        assert_eq!(remote.len(), 4);
    }
}
