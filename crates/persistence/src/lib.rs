#![deny(warnings)]

//! Persistence layer: the operator's ordered list of tracked locations.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use telemetry_core::{slugify, TrackedLocation};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    /// Name is blank or has no characters that survive slugging.
    #[error("location name {0:?} is empty")]
    EmptyName(String),
    #[error("a location with slug {0:?} is already tracked")]
    Duplicate(String),
    #[error("no tracked location with id {0}")]
    NotFound(i64),
    #[error("stored timestamp {0:?} is not RFC 3339")]
    BadTimestamp(String),
}

/// Returns the default SQLite URL used for the local store.
pub fn default_sqlite_url() -> &'static str {
    "sqlite://./data/telemetry.db"
}

/// Open (creating if needed) and migrate the store.
pub async fn init_db(url: &str) -> Result<SqlitePool, StoreError> {
    let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
    let mut pool = SqlitePoolOptions::new();
    if url.contains(":memory:") {
        // Every connection would see its own empty database.
        pool = pool.max_connections(1).idle_timeout(None).max_lifetime(None);
    }
    let pool = pool.connect_with(options).await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!(url, "tracked-location store ready");
    Ok(pool)
}

type Row = (i64, String, String, String);

fn from_row((id, name, slug, date_added): Row) -> Result<TrackedLocation, StoreError> {
    let date_added = DateTime::parse_from_rfc3339(&date_added)
        .map_err(|_| StoreError::BadTimestamp(date_added.clone()))?
        .with_timezone(&Utc);
    Ok(TrackedLocation {
        id,
        name,
        slug,
        date_added,
    })
}

/// Tracked locations in display order.
pub async fn list_tracked(pool: &SqlitePool) -> Result<Vec<TrackedLocation>, StoreError> {
    let rows: Vec<Row> = sqlx::query_as(
        "SELECT id, name, slug, date_added FROM tracked_locations ORDER BY position, id",
    )
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(from_row).collect()
}

/// Append a location to the end of the list. Slugs are unique.
pub async fn add_tracked(pool: &SqlitePool, name: &str) -> Result<TrackedLocation, StoreError> {
    let name = name.trim();
    let slug = slugify(name);
    if slug.is_empty() {
        return Err(StoreError::EmptyName(name.to_string()));
    }
    let date_added = Utc::now();

    let mut tx = pool.begin().await?;
    let taken: Option<i64> = sqlx::query_scalar("SELECT id FROM tracked_locations WHERE slug = ?")
        .bind(&slug)
        .fetch_optional(&mut *tx)
        .await?;
    if taken.is_some() {
        return Err(StoreError::Duplicate(slug));
    }
    let position: i64 =
        sqlx::query_scalar("SELECT COALESCE(MAX(position) + 1, 0) FROM tracked_locations")
            .fetch_one(&mut *tx)
            .await?;
    let inserted = sqlx::query(
        "INSERT INTO tracked_locations (name, slug, position, date_added) VALUES (?, ?, ?, ?)",
    )
    .bind(name)
    .bind(&slug)
    .bind(position)
    .bind(date_added.to_rfc3339())
    .execute(&mut *tx)
    .await
    .map_err(|err| {
        let unique = err
            .as_database_error()
            .is_some_and(|db| db.is_unique_violation());
        if unique {
            StoreError::Duplicate(slug.clone())
        } else {
            StoreError::Db(err)
        }
    })?;
    tx.commit().await?;

    let id = inserted.last_insert_rowid();
    debug!(id, slug = %slug, position, "location tracked");
    Ok(TrackedLocation {
        id,
        name: name.to_string(),
        slug,
        date_added,
    })
}

pub async fn remove_tracked(pool: &SqlitePool, id: i64) -> Result<(), StoreError> {
    let result = sqlx::query("DELETE FROM tracked_locations WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound(id));
    }
    debug!(id, "location untracked");
    Ok(())
}

/// Move a location to `index` (clamped to the end) and renumber the list.
pub async fn move_tracked(
    pool: &SqlitePool,
    id: i64,
    index: usize,
) -> Result<Vec<TrackedLocation>, StoreError> {
    let mut tx = pool.begin().await?;
    let mut ids: Vec<i64> =
        sqlx::query_scalar("SELECT id FROM tracked_locations ORDER BY position, id")
            .fetch_all(&mut *tx)
            .await?;
    let from = ids
        .iter()
        .position(|candidate| *candidate == id)
        .ok_or(StoreError::NotFound(id))?;
    let moved = ids.remove(from);
    ids.insert(index.min(ids.len()), moved);
    for (position, row_id) in ids.iter().enumerate() {
        sqlx::query("UPDATE tracked_locations SET position = ? WHERE id = ?")
            .bind(position as i64)
            .bind(row_id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    list_tracked(pool).await
}
