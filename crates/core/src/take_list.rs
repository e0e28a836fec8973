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

//! A set whose values can only be observed by removing them.

/// Holds values that can only be observed by being taken out of the set.
/// Duplicate values are allowed as long as each maps to a distinct key.
#[derive(Debug)]
pub struct IndexedTakeList<K: PartialEq, V> {
    values: Vec<Entry<K, V>>,
}

#[derive(Debug)]
struct Entry<K, V> {
    key: K,
    value: Option<V>,
}

impl<K: PartialEq, V> IndexedTakeList<K, V> {
    /// Build the set by applying `indexer` to each value.
    pub fn new(values: Vec<V>, indexer: impl Fn(&V) -> K) -> Self {
        let values = values
            .into_iter()
            .map(|v| Entry {
                key: indexer(&v),
                value: Some(v),
            })
            .collect();
        Self { values }
    }

    /// Find a value by key and remove it.
    pub fn take(&mut self, key: &K) -> Option<V> {
        for entry in &mut self.values {
            if entry.key == *key {
                return entry.value.take();
            }
        }
        None
    }

    /// Remove and return all remaining values.
    pub fn take_remaining(&mut self) -> Vec<V> {
        let remaining = self
            .values
            .iter_mut()
            .filter_map(|entry| entry.value.take())
            .collect();
        self.values.clear();
        remaining
    }
}
