//! SQLite persistence for conversation turns.

mod turns;

pub use turns::SqliteTurnStore;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::str::FromStr;

/// Initialize the SQLite connection pool and run migrations.
///
/// The database file is created automatically if it doesn't exist.
/// WAL journal mode with `synchronous = FULL`: a committed turn survives
/// power loss, not just a process crash.
pub async fn init_pool(db_path: &str) -> Result<SqlitePool, crate::Error> {
    let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path))?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(opts)
        .await?;

    migrate(&pool).await?;

    tracing::info!(path = %db_path, "Database ready");
    Ok(pool)
}

/// Apply embedded migrations.
pub async fn migrate(pool: &SqlitePool) -> Result<(), crate::Error> {
    sqlx::migrate!().run(pool).await?;
    Ok(())
}
