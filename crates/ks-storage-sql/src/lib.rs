//! SQL-backed adapters (SQLite today; the pool/query layer below only
//! reaches for SQLite-specific pragmas in [`connect`], everything else
//! goes through `sea_query`'s backend-neutral builders).
//!
//! Every op that needs read-then-write atomicity runs inside one
//! `sqlx` transaction. Unlike the Redis/Mongo adapters, there's no
//! `FnOnce`-vs-retry tension here: a SQL transaction already gives a
//! single connection exclusive, serialized access to the rows it
//! touches for the lifetime of the transaction, so `transact`'s
//! `transition` closure runs exactly once, inside one `BEGIN`/`COMMIT`,
//! with no compare-and-swap loop needed.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_query::{Alias, ColumnDef, Expr, Iden, Query, SqliteQueryBuilder, Table};
use sqlx::sqlite::{Sqlite, SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Executor, Row};

use ks_domain::{Error, Result};
use ks_storage::{
    CacheAdapter, CacheRecord, LockAdapter, LockRecord, RateLimiterRecord, RateLimiterStorageAdapter,
    RateLimiterTransition,
};

fn wrap(err: sqlx::Error) -> Error {
    Error::Adapter(anyhow::Error::from(err))
}

/// Mirrors the knobs `harborgrid`'s `DatabaseConfig` exposes for its
/// SQLite pool; only the fields `ks-storage-sql` actually acts on.
#[derive(Debug, Clone)]
pub struct SqlPoolConfig {
    pub url: String,
    pub min_connections: u32,
    pub max_connections: u32,
    pub connect_timeout: Duration,
    pub busy_timeout: Duration,
    pub enable_wal: bool,
}

impl Default for SqlPoolConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://keystone.db".to_owned(),
            min_connections: 1,
            max_connections: 10,
            connect_timeout: Duration::from_secs(30),
            busy_timeout: Duration::from_millis(5000),
            enable_wal: true,
        }
    }
}

/// Open a pool and set the pragmas that make SQLite safe under
/// concurrent access from an async pool (WAL journaling, a busy
/// timeout so writers queue instead of erroring under contention).
pub async fn connect(config: &SqlPoolConfig) -> Result<SqlitePool> {
    let connect_options = if config.url.ends_with(":memory:") {
        // a pooled in-memory database needs every connection to land on the
        // same backing store, so a single connection is forced here.
        SqliteConnectOptions::new().in_memory(true)
    } else {
        SqliteConnectOptions::new()
            .filename(config.url.replace("sqlite://", ""))
            .create_if_missing(true)
    }
    .busy_timeout(config.busy_timeout);

    let max_connections = if config.url.ends_with(":memory:") { 1 } else { config.max_connections };
    let min_connections = if config.url.ends_with(":memory:") { 1 } else { config.min_connections };

    let pool = SqlitePoolOptions::new()
        .min_connections(min_connections)
        .max_connections(max_connections)
        .acquire_timeout(config.connect_timeout)
        .connect_with(connect_options)
        .await
        .map_err(wrap)?;

    if config.enable_wal {
        sqlx::query("PRAGMA journal_mode=WAL").execute(&pool).await.map_err(wrap)?;
    }
    sqlx::query("PRAGMA synchronous=NORMAL").execute(&pool).await.map_err(wrap)?;

    Ok(pool)
}

fn id() -> Alias {
    Alias::new("id")
}
fn value_col() -> Alias {
    Alias::new("value")
}
fn expires_at() -> Alias {
    Alias::new("expires_at")
}
fn lock_id_col() -> Alias {
    Alias::new("lock_id")
}
fn state_col() -> Alias {
    Alias::new("state")
}

async fn ensure_lock_table(pool: &SqlitePool, table: &Alias) -> Result<()> {
    let sql = Table::create()
        .table(table.clone())
        .if_not_exists()
        .col(ColumnDef::new(id()).text().primary_key())
        .col(ColumnDef::new(lock_id_col()).text().not_null())
        .col(ColumnDef::new(expires_at()).text().null())
        .build(SqliteQueryBuilder);
    sqlx::query(&sql).execute(pool).await.map_err(wrap)?;
    Ok(())
}

async fn ensure_keyed_json_table(pool: &SqlitePool, table: &Alias) -> Result<()> {
    let sql = Table::create()
        .table(table.clone())
        .if_not_exists()
        .col(ColumnDef::new(id()).text().primary_key())
        .col(ColumnDef::new(value_col()).text().not_null())
        .col(ColumnDef::new(expires_at()).text().null())
        .build(SqliteQueryBuilder);
    sqlx::query(&sql).execute(pool).await.map_err(wrap)?;
    Ok(())
}

fn to_rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339()
}

fn parse_rfc3339(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .expect("timestamps are only ever written by to_rfc3339")
        .with_timezone(&Utc)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Lock
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SqlLockAdapter {
    pool: SqlitePool,
    table: Alias,
}

impl SqlLockAdapter {
    pub async fn new(pool: SqlitePool, table_name: impl Into<String>) -> Result<Self> {
        let table = Alias::new(table_name.into());
        ensure_lock_table(&pool, &table).await?;
        Ok(Self { pool, table })
    }
}

#[async_trait]
impl LockAdapter for SqlLockAdapter {
    async fn acquire(&self, key: &str, lock_id: &str, ttl: Option<Duration>) -> Result<bool> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(wrap)?;

        let select_sql = Query::select()
            .column(expires_at())
            .from(self.table.clone())
            .and_where(Expr::col(id()).eq(key))
            .to_string(SqliteQueryBuilder);
        let existing = sqlx::query(&select_sql).fetch_optional(&mut *tx).await.map_err(wrap)?;

        let vacant = match existing {
            None => true,
            Some(row) => match row.try_get::<Option<String>, _>(0).map_err(wrap)? {
                None => false,
                Some(raw) => parse_rfc3339(&raw) <= now,
            },
        };
        if !vacant {
            tx.rollback().await.map_err(wrap)?;
            return Ok(false);
        }

        let expires_at_value = ttl.map(|d| to_rfc3339(now + chrono::Duration::milliseconds(d.as_millis() as i64)));
        let upsert_sql = format!(
            "INSERT INTO {table} (id, lock_id, expires_at) VALUES (?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET lock_id = excluded.lock_id, expires_at = excluded.expires_at",
            table = self.table.to_string(),
        );
        sqlx::query(&upsert_sql)
            .bind(key)
            .bind(lock_id)
            .bind(expires_at_value)
            .execute(&mut *tx)
            .await
            .map_err(wrap)?;

        tx.commit().await.map_err(wrap)?;
        Ok(true)
    }

    async fn release(&self, key: &str, lock_id: &str) -> Result<bool> {
        let sql = Query::delete()
            .from_table(self.table.clone())
            .and_where(Expr::col(id()).eq(key))
            .and_where(Expr::col(lock_id_col()).eq(lock_id))
            .to_string(SqliteQueryBuilder);
        let result = sqlx::query(&sql).execute(&self.pool).await.map_err(wrap)?;
        Ok(result.rows_affected() > 0)
    }

    async fn force_release(&self, key: &str) -> Result<bool> {
        let sql = Query::delete()
            .from_table(self.table.clone())
            .and_where(Expr::col(id()).eq(key))
            .to_string(SqliteQueryBuilder);
        let result = sqlx::query(&sql).execute(&self.pool).await.map_err(wrap)?;
        Ok(result.rows_affected() > 0)
    }

    async fn refresh(&self, key: &str, lock_id: &str, ttl: Duration) -> Result<bool> {
        let now = Utc::now();
        let new_expiry = to_rfc3339(now + chrono::Duration::milliseconds(ttl.as_millis() as i64));
        let sql = format!(
            "UPDATE {table} SET expires_at = ? \
             WHERE id = ? AND lock_id = ? AND expires_at IS NOT NULL AND expires_at > ?",
            table = self.table.to_string(),
        );
        let result = sqlx::query(&sql)
            .bind(new_expiry)
            .bind(key)
            .bind(lock_id)
            .bind(to_rfc3339(now))
            .execute(&self.pool)
            .await
            .map_err(wrap)?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_state(&self, key: &str) -> Result<Option<LockRecord>> {
        let sql = Query::select()
            .column(lock_id_col())
            .column(expires_at())
            .from(self.table.clone())
            .and_where(Expr::col(id()).eq(key))
            .to_string(SqliteQueryBuilder);
        let row = sqlx::query(&sql).fetch_optional(&self.pool).await.map_err(wrap)?;
        let Some(row) = row else { return Ok(None) };

        let lock_id: String = row.try_get(0).map_err(wrap)?;
        let expires_at_raw: Option<String> = row.try_get(1).map_err(wrap)?;
        let expires_at = expires_at_raw.as_deref().map(parse_rfc3339);
        if let Some(at) = expires_at {
            if at <= Utc::now() {
                return Ok(None);
            }
        }
        Ok(Some(LockRecord { lock_id, expires_at }))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Rate limiter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SqlRateLimiterAdapter {
    pool: SqlitePool,
    table: Alias,
}

impl SqlRateLimiterAdapter {
    pub async fn new(pool: SqlitePool, table_name: impl Into<String>) -> Result<Self> {
        let table = Alias::new(table_name.into());
        let sql = Table::create()
            .table(table.clone())
            .if_not_exists()
            .col(ColumnDef::new(id()).text().primary_key())
            .col(ColumnDef::new(state_col()).text().not_null())
            .col(ColumnDef::new(expires_at()).text().not_null())
            .build(SqliteQueryBuilder);
        sqlx::query(&sql).execute(&pool).await.map_err(wrap)?;
        Ok(Self { pool, table })
    }

    fn select_sql(&self) -> String {
        Query::select()
            .column(state_col())
            .column(expires_at())
            .from(self.table.clone())
            .and_where(Expr::col(id()).eq(Expr::cust("?")))
            .to_string(SqliteQueryBuilder)
    }
}

#[async_trait]
impl RateLimiterStorageAdapter for SqlRateLimiterAdapter {
    async fn find(&self, key: &str) -> Result<Option<RateLimiterRecord>> {
        let row = sqlx::query(&self.select_sql())
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(wrap)?;
        let Some(row) = row else { return Ok(None) };
        let state_raw: String = row.try_get(0).map_err(wrap)?;
        let expires_at_raw: String = row.try_get(1).map_err(wrap)?;
        let expires_at = parse_rfc3339(&expires_at_raw);
        if expires_at <= Utc::now() {
            return Ok(None);
        }
        let state = serde_json::from_str(&state_raw).map_err(Error::Serde)?;
        Ok(Some(RateLimiterRecord { state, expires_at }))
    }

    async fn transact(&self, key: &str, transition: RateLimiterTransition) -> Result<serde_json::Value> {
        let mut tx = self.pool.begin().await.map_err(wrap)?;

        let row = sqlx::query(&self.select_sql())
            .bind(key)
            .fetch_optional(&mut *tx)
            .await
            .map_err(wrap)?;
        let current = match row {
            None => None,
            Some(row) => {
                let state_raw: String = row.try_get(0).map_err(wrap)?;
                let expires_at_raw: String = row.try_get(1).map_err(wrap)?;
                let expires_at = parse_rfc3339(&expires_at_raw);
                if expires_at <= Utc::now() {
                    None
                } else {
                    let state = serde_json::from_str(&state_raw).map_err(Error::Serde)?;
                    Some(RateLimiterRecord { state, expires_at })
                }
            }
        };

        let (next, outcome) = transition(current);
        let next_state = serde_json::to_string(&next.state).map_err(Error::Serde)?;
        let upsert_sql = format!(
            "INSERT INTO {table} (id, state, expires_at) VALUES (?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET state = excluded.state, expires_at = excluded.expires_at",
            table = self.table.to_string(),
        );
        sqlx::query(&upsert_sql)
            .bind(key)
            .bind(next_state)
            .bind(to_rfc3339(next.expires_at))
            .execute(&mut *tx)
            .await
            .map_err(wrap)?;

        tx.commit().await.map_err(wrap)?;
        Ok(outcome)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let sql = Query::delete()
            .from_table(self.table.clone())
            .and_where(Expr::col(id()).eq(key))
            .to_string(SqliteQueryBuilder);
        sqlx::query(&sql).execute(&self.pool).await.map_err(wrap)?;
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cache
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SqlCacheAdapter {
    pool: SqlitePool,
    table: Alias,
}

impl SqlCacheAdapter {
    pub async fn new(pool: SqlitePool, table_name: impl Into<String>) -> Result<Self> {
        let table = Alias::new(table_name.into());
        ensure_keyed_json_table(&pool, &table).await?;
        Ok(Self { pool, table })
    }

    async fn fetch_live<'e, E>(&self, key: &str, executor: E) -> Result<Option<CacheRecord>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let sql = Query::select()
            .column(value_col())
            .column(expires_at())
            .from(self.table.clone())
            .and_where(Expr::col(id()).eq(Expr::cust("?")))
            .to_string(SqliteQueryBuilder);
        let row = sqlx::query(&sql).bind(key).fetch_optional(executor).await.map_err(wrap)?;
        let Some(row) = row else { return Ok(None) };
        let value_raw: String = row.try_get(0).map_err(wrap)?;
        let expires_at_raw: Option<String> = row.try_get(1).map_err(wrap)?;
        let expires_at = expires_at_raw.as_deref().map(parse_rfc3339);
        if let Some(at) = expires_at {
            if at <= Utc::now() {
                return Ok(None);
            }
        }
        let value = serde_json::from_str(&value_raw).map_err(Error::Serde)?;
        Ok(Some(CacheRecord { value, expires_at }))
    }
}

#[async_trait]
impl CacheAdapter for SqlCacheAdapter {
    async fn get(&self, key: &str) -> Result<Option<CacheRecord>> {
        self.fetch_live(key, &self.pool).await
    }

    async fn get_and_remove(&self, key: &str) -> Result<Option<CacheRecord>> {
        let mut tx = self.pool.begin().await.map_err(wrap)?;
        let found = self.fetch_live(key, &mut *tx).await?;
        if found.is_some() {
            let sql = Query::delete()
                .from_table(self.table.clone())
                .and_where(Expr::col(id()).eq(key))
                .to_string(SqliteQueryBuilder);
            sqlx::query(&sql).execute(&mut *tx).await.map_err(wrap)?;
        }
        tx.commit().await.map_err(wrap)?;
        Ok(found)
    }

    async fn add(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(wrap)?;
        if self.fetch_live(key, &mut *tx).await?.is_some() {
            tx.rollback().await.map_err(wrap)?;
            return Ok(false);
        }
        let now = Utc::now();
        let expires_at_value = ttl.map(|d| to_rfc3339(now + chrono::Duration::milliseconds(d.as_millis() as i64)));
        let value_raw = serde_json::to_string(&value).map_err(Error::Serde)?;
        let upsert_sql = format!(
            "INSERT INTO {table} (id, value, expires_at) VALUES (?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
            table = self.table.to_string(),
        );
        sqlx::query(&upsert_sql)
            .bind(key)
            .bind(value_raw)
            .bind(expires_at_value)
            .execute(&mut *tx)
            .await
            .map_err(wrap)?;
        tx.commit().await.map_err(wrap)?;
        Ok(true)
    }

    async fn update(&self, key: &str, value: serde_json::Value) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(wrap)?;
        if self.fetch_live(key, &mut *tx).await?.is_none() {
            tx.rollback().await.map_err(wrap)?;
            return Ok(false);
        }
        let value_raw = serde_json::to_string(&value).map_err(Error::Serde)?;
        let sql = format!("UPDATE {table} SET value = ? WHERE id = ?", table = self.table.to_string());
        sqlx::query(&sql).bind(value_raw).bind(key).execute(&mut *tx).await.map_err(wrap)?;
        tx.commit().await.map_err(wrap)?;
        Ok(true)
    }

    async fn put(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(wrap)?;
        let was_live = self.fetch_live(key, &mut *tx).await?.is_some();
        let now = Utc::now();
        let expires_at_value = ttl.map(|d| to_rfc3339(now + chrono::Duration::milliseconds(d.as_millis() as i64)));
        let value_raw = serde_json::to_string(&value).map_err(Error::Serde)?;
        let upsert_sql = format!(
            "INSERT INTO {table} (id, value, expires_at) VALUES (?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
            table = self.table.to_string(),
        );
        sqlx::query(&upsert_sql)
            .bind(key)
            .bind(value_raw)
            .bind(expires_at_value)
            .execute(&mut *tx)
            .await
            .map_err(wrap)?;
        tx.commit().await.map_err(wrap)?;
        Ok(was_live)
    }

    async fn increment(&self, key: &str, delta: f64) -> Result<Option<f64>> {
        let mut tx = self.pool.begin().await.map_err(wrap)?;
        let Some(current) = self.fetch_live(key, &mut *tx).await? else {
            tx.commit().await.map_err(wrap)?;
            return Ok(None);
        };
        let Some(current_number) = current.value.as_f64() else {
            return Err(Error::TypeCache { key: key.to_owned() });
        };
        let next = current_number + delta;
        let sql = format!("UPDATE {table} SET value = ? WHERE id = ?", table = self.table.to_string());
        sqlx::query(&sql)
            .bind(serde_json::to_string(&serde_json::json!(next)).map_err(Error::Serde)?)
            .bind(key)
            .execute(&mut *tx)
            .await
            .map_err(wrap)?;
        tx.commit().await.map_err(wrap)?;
        Ok(Some(next))
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let sql = Query::delete()
            .from_table(self.table.clone())
            .and_where(Expr::col(id()).eq(key))
            .to_string(SqliteQueryBuilder);
        let result = sqlx::query(&sql).execute(&self.pool).await.map_err(wrap)?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove_many(&self, keys: &[String]) -> Result<bool> {
        if keys.is_empty() {
            return Ok(false);
        }
        let sql = Query::delete()
            .from_table(self.table.clone())
            .and_where(Expr::col(id()).is_in(keys.to_vec()))
            .to_string(SqliteQueryBuilder);
        let result = sqlx::query(&sql).execute(&self.pool).await.map_err(wrap)?;
        Ok(result.rows_affected() > 0)
    }

    async fn clear(&self, prefix: &str) -> Result<()> {
        let pattern = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
        let sql = format!(
            "DELETE FROM {table} WHERE id LIKE ? ESCAPE '\\'",
            table = self.table.to_string(),
        );
        sqlx::query(&sql).bind(pattern).execute(&self.pool).await.map_err(wrap)?;
        Ok(())
    }
}
