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

//! SQL dialect differences.
//!
//! The sub-map tables share one query shape; only the upsert clause and the
//! placeholder style differ per engine. Query text is rendered here so every
//! backend uses identical table/column templates.

/// Supported SQL engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// Embedded engine; upsert via `REPLACE INTO`.
    Sqlite,
    /// Upsert via `ON DUPLICATE KEY UPDATE`.
    MySql,
    /// Upsert via `ON CONFLICT … DO UPDATE`.
    Postgres,
}

impl Dialect {
    /// Placeholder for the 1-based parameter `n`.
    fn placeholder(&self, n: usize) -> String {
        match self {
            Dialect::Sqlite | Dialect::MySql => "?".to_string(),
            Dialect::Postgres => format!("${}", n),
        }
    }

    /// Comma-separated placeholder list for `count` parameters starting at
    /// 1-based offset `start`.
    pub fn placeholders(&self, start: usize, count: usize) -> String {
        (0..count)
            .map(|i| self.placeholder(start + i))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Upsert statement for a row keyed by `pk_columns` with payload
    /// `non_pk_columns`.
    pub fn upsert_query(
        &self,
        table: &str,
        pk_columns: &[&str],
        non_pk_columns: &[&str],
    ) -> String {
        let all_columns: Vec<&str> = pk_columns
            .iter()
            .chain(non_pk_columns.iter())
            .copied()
            .collect();
        let column_list = all_columns.join(", ");
        let values = self.placeholders(1, all_columns.len());

        match self {
            Dialect::Sqlite => {
                format!("REPLACE INTO {} ({}) VALUES ({})", table, column_list, values)
            }
            Dialect::MySql => {
                let updates = non_pk_columns
                    .iter()
                    .map(|c| format!("{} = VALUES({})", c, c))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!(
                    "INSERT INTO {} ({}) VALUES ({}) ON DUPLICATE KEY UPDATE {}",
                    table, column_list, values, updates
                )
            }
            Dialect::Postgres => {
                let conflict = pk_columns.join(", ");
                let updates = non_pk_columns
                    .iter()
                    .map(|c| format!("{} = EXCLUDED.{}", c, c))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!(
                    "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) DO UPDATE SET {}",
                    table, column_list, values, conflict, updates
                )
            }
        }
    }
}
