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

//! Namespace tables.
//!
//! ## Layout
//! The namespaces table is keyed by a fixed partition constant plus the name.
//! The metadata table holds a single `notification_version` row that is
//! incremented under its row lock on every namespace mutation, giving a
//! process-wide monotone version the registry diffs against.

use crate::error::{StoreError, StoreResult};
use crate::store::{NamespacePage, NamespaceRecord, NamespaceStore};
use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

/// Fixed partition constant; namespaces are a single-partition table.
const PARTITION_ID: i32 = 54321;

/// Sqlite-backed namespace store.
#[derive(Clone)]
pub struct SqliteNamespaceStore {
    pool: SqlitePool,
}

impl SqliteNamespaceStore {
    /// Wrap an existing pool. Call [`bootstrap`](Self::bootstrap) once before use.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the namespaces and metadata tables, seeding the version row.
    pub async fn bootstrap(&self) -> StoreResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS namespaces (\
             partition_id INTEGER NOT NULL, \
             id TEXT NOT NULL, \
             name TEXT NOT NULL, \
             data BLOB NOT NULL, \
             data_encoding TEXT NOT NULL, \
             notification_version INTEGER NOT NULL, \
             PRIMARY KEY (partition_id, name))",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS namespace_metadata (\
             partition_id INTEGER NOT NULL PRIMARY KEY, \
             notification_version INTEGER NOT NULL)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "INSERT OR IGNORE INTO namespace_metadata (partition_id, notification_version) \
             VALUES (?, 0)",
        )
        .bind(PARTITION_ID)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Bump and return the next notification version inside `tx`.
    async fn next_notification_version(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    ) -> StoreResult<i64> {
        let row = sqlx::query(
            "SELECT notification_version FROM namespace_metadata WHERE partition_id = ?",
        )
        .bind(PARTITION_ID)
        .fetch_one(&mut **tx)
        .await?;
        let version: i64 = row.get(0);
        sqlx::query(
            "UPDATE namespace_metadata SET notification_version = ? WHERE partition_id = ?",
        )
        .bind(version + 1)
        .bind(PARTITION_ID)
        .execute(&mut **tx)
        .await?;
        Ok(version + 1)
    }

    fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> StoreResult<NamespaceRecord> {
        let data: Vec<u8> = row.get("data");
        Ok(NamespaceRecord {
            id: row.get("id"),
            name: row.get("name"),
            data: serde_json::from_slice(&data)?,
            data_encoding: row.get("data_encoding"),
            notification_version: row.get("notification_version"),
        })
    }
}

#[async_trait]
impl NamespaceStore for SqliteNamespaceStore {
    async fn create_namespace(&self, mut record: NamespaceRecord) -> StoreResult<NamespaceRecord> {
        let mut tx = self.pool.begin().await?;
        let version = Self::next_notification_version(&mut tx).await?;
        record.notification_version = version;
        let result = sqlx::query(
            "INSERT OR IGNORE INTO namespaces \
             (partition_id, id, name, data, data_encoding, notification_version) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(PARTITION_ID)
        .bind(&record.id)
        .bind(&record.name)
        .bind(serde_json::to_vec(&record.data)?)
        .bind(&record.data_encoding)
        .bind(version)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::ConditionFailed(format!(
                "namespace {} already exists",
                record.name
            )));
        }
        tx.commit().await?;
        Ok(record)
    }

    async fn update_namespace(&self, mut record: NamespaceRecord) -> StoreResult<NamespaceRecord> {
        let mut tx = self.pool.begin().await?;
        let version = Self::next_notification_version(&mut tx).await?;
        record.notification_version = version;
        let result = sqlx::query(
            "UPDATE namespaces SET data = ?, data_encoding = ?, notification_version = ? \
             WHERE partition_id = ? AND name = ?",
        )
        .bind(serde_json::to_vec(&record.data)?)
        .bind(&record.data_encoding)
        .bind(version)
        .bind(PARTITION_ID)
        .bind(&record.name)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("namespace {}", record.name)));
        }
        tx.commit().await?;
        Ok(record)
    }

    async fn get_namespace_by_name(&self, name: &str) -> StoreResult<NamespaceRecord> {
        let row = sqlx::query(
            "SELECT id, name, data, data_encoding, notification_version FROM namespaces \
             WHERE partition_id = ? AND name = ?",
        )
        .bind(PARTITION_ID)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Self::record_from_row(&row),
            None => Err(StoreError::NotFound(format!("namespace {}", name))),
        }
    }

    async fn delete_namespace(&self, name: &str) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM namespaces WHERE partition_id = ? AND name = ?")
            .bind(PARTITION_ID)
            .bind(name)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("namespace {}", name)));
        }
        Ok(())
    }

    async fn list_namespaces(
        &self,
        page_size: usize,
        page_token: Option<String>,
    ) -> StoreResult<NamespacePage> {
        let rows = match &page_token {
            Some(token) => {
                sqlx::query(
                    "SELECT id, name, data, data_encoding, notification_version FROM namespaces \
                     WHERE partition_id = ? AND name > ? ORDER BY name LIMIT ?",
                )
                .bind(PARTITION_ID)
                .bind(token)
                .bind(page_size as i64)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT id, name, data, data_encoding, notification_version FROM namespaces \
                     WHERE partition_id = ? ORDER BY name LIMIT ?",
                )
                .bind(PARTITION_ID)
                .bind(page_size as i64)
                .fetch_all(&self.pool)
                .await?
            }
        };

        let namespaces: Vec<NamespaceRecord> = rows
            .iter()
            .map(Self::record_from_row)
            .collect::<StoreResult<_>>()?;
        let next_page_token = if namespaces.len() == page_size {
            namespaces.last().map(|r| r.name.clone())
        } else {
            None
        };
        Ok(NamespacePage {
            namespaces,
            next_page_token,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn store() -> SqliteNamespaceStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = SqliteNamespaceStore::new(pool);
        store.bootstrap().await.unwrap();
        store
    }

    fn record(name: &str) -> NamespaceRecord {
        NamespaceRecord {
            id: format!("id-{}", name),
            name: name.to_string(),
            data: json!({"retention_days": 7}),
            data_encoding: "json".into(),
            notification_version: 0,
        }
    }

    #[tokio::test]
    async fn test_create_stamps_monotone_versions() {
        let store = store().await;
        let a = store.create_namespace(record("alpha")).await.unwrap();
        let b = store.create_namespace(record("beta")).await.unwrap();
        assert!(b.notification_version > a.notification_version);
    }

    #[tokio::test]
    async fn test_create_duplicate_is_condition_failed() {
        let store = store().await;
        store.create_namespace(record("alpha")).await.unwrap();
        let err = store.create_namespace(record("alpha")).await.unwrap_err();
        assert!(matches!(err, StoreError::ConditionFailed(_)));
    }

    #[tokio::test]
    async fn test_update_bumps_global_version() {
        let store = store().await;
        let created = store.create_namespace(record("alpha")).await.unwrap();
        let mut changed = created.clone();
        changed.data = json!({"retention_days": 30});
        let updated = store.update_namespace(changed).await.unwrap();
        assert!(updated.notification_version > created.notification_version);

        let fetched = store.get_namespace_by_name("alpha").await.unwrap();
        assert_eq!(fetched.data, json!({"retention_days": 30}));
    }

    #[tokio::test]
    async fn test_list_pages_in_name_order() {
        let store = store().await;
        for name in ["delta", "alpha", "charlie", "beta"] {
            store.create_namespace(record(name)).await.unwrap();
        }

        let page1 = store.list_namespaces(3, None).await.unwrap();
        let names: Vec<&str> = page1.namespaces.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "beta", "charlie"]);

        let page2 = store
            .list_namespaces(3, page1.next_page_token)
            .await
            .unwrap();
        assert_eq!(page2.namespaces.len(), 1);
        assert_eq!(page2.namespaces[0].name, "delta");
        assert!(page2.next_page_token.is_none());
    }
}
