//! Database migration support.
//!
//! Embeds and runs the SQL migrations under `warden_core/migrations/`,
//! one directory per dialect.

use sqlx::{MySqlPool, SqlitePool};

/// Run the SQLite migrations against the given pool.
pub async fn migrate_sqlite(pool: &SqlitePool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations/sqlite").run(pool).await
}

/// Run the MySQL migrations against the given pool.
pub async fn migrate_mysql(pool: &MySqlPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations/mysql").run(pool).await
}
