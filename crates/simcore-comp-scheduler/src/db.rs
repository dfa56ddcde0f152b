// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task store construction from a database URL.

use std::sync::Arc;

use simcore_comp_core::{PostgresTaskStore, Result, SqliteTaskStore, TaskStore, migrations};
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::SqlitePoolOptions;
use tracing::info;

/// Connect to `database_url`, run migrations and return the matching store.
///
/// `sqlite:` URLs select the SQLite backend, anything else PostgreSQL.
pub async fn connect_task_store(
    database_url: &str,
    update_concurrency: usize,
) -> Result<Arc<dyn TaskStore>> {
    if database_url.starts_with("sqlite:") {
        // Every connection to an in-memory database sees its own database.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        migrations::run_sqlite(&pool).await?;
        info!("SQLite task store ready");
        return Ok(Arc::new(
            SqliteTaskStore::new(pool).with_update_concurrency(update_concurrency),
        ));
    }

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    let row: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&pool).await?;
    info!(result = row.0, "Database health check passed");
    migrations::run_postgres(&pool).await?;
    info!("PostgreSQL task store ready");

    Ok(Arc::new(
        PostgresTaskStore::new(pool).with_update_concurrency(update_concurrency),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_connect_in_memory_sqlite() {
        let store = connect_task_store("sqlite::memory:", 4).await.unwrap();
        assert_eq!(store.update_concurrency(), 4);
        assert!(store.list_tasks(Uuid::new_v4()).await.unwrap().is_empty());
    }
}
