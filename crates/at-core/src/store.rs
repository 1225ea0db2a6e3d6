//! Typed operations on a key/value + list + set + sorted-set + hash store,
//! with a small set of atomic compound operations used where the control
//! plane needs more than a single-key read-modify-write.
//!
//! [`SqliteStore`] is the concrete embedded backend for single-host
//! deployment; [`MemoryStore`] is an in-process test double. Both implement
//! [`Store`], so a future networked backend can be swapped in behind the
//! same trait without touching callers.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, OptionalExtension};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store transport error: {0}")]
    Transport(String),
    #[error("key not found")]
    NotFound,
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Transport(e.to_string())
    }
}

impl From<tokio_rusqlite::Error> for StoreError {
    fn from(e: tokio_rusqlite::Error) -> Self {
        StoreError::Transport(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    async fn rpush(&self, key: &str, value: &str) -> Result<i64, StoreError>;
    async fn lpop(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError>;
    async fn llen(&self, key: &str) -> Result<i64, StoreError>;
    async fn lrem(&self, key: &str, value: &str) -> Result<i64, StoreError>;

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError>;
    async fn srem(&self, key: &str, member: &str) -> Result<bool, StoreError>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError>;
    async fn scard(&self, key: &str) -> Result<i64, StoreError>;

    async fn zadd(&self, key: &str, score: i64, member: &str) -> Result<(), StoreError>;
    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError>;
    async fn zrangebyscore(
        &self,
        key: &str,
        min: i64,
        max: i64,
        limit: Option<i64>,
    ) -> Result<Vec<String>, StoreError>;
    async fn zcard(&self, key: &str) -> Result<i64, StoreError>;
    async fn zpopmin(&self, key: &str) -> Result<Option<(String, i64)>, StoreError>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError>;
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;
    async fn hdel(&self, key: &str, field: &str) -> Result<bool, StoreError>;
    async fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>, StoreError>;
    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>, StoreError>;
    async fn hlen(&self, key: &str) -> Result<i64, StoreError>;

    /// Set-if-absent with optional expiry. Returns `true` if the key was set.
    async fn setnx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool, StoreError>;
    /// Attach (or refresh) an expiry on an existing key. Returns `false` if
    /// the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Atomically try to consume `cost` tokens from a token bucket keyed by
    /// `key`, refilling at `tokens_per_second` up to `max_burst` based on
    /// elapsed time since the bucket's last recorded refill. Returns the
    /// remaining token count on success, or the bucket's current (pre-debit)
    /// token count wrapped in `Err` semantics via `Ok(None)` on insufficient
    /// tokens — callers use this to compute a retry-after.
    async fn try_acquire_token(
        &self,
        key: &str,
        tokens_per_second: f64,
        max_burst: f64,
        cost: f64,
    ) -> Result<TokenAcquireResult, StoreError>;

    /// Atomic claim: `setnx(claim_key, worker_id, ttl)`; on success, also
    /// reads and removes the matching hash/zset entries for `session_id` from
    /// `items_key`/`queue_key` in the same call. Returns the claimed work's
    /// JSON payload if this call won the claim.
    async fn claim_work(
        &self,
        claim_key: &str,
        items_key: &str,
        queue_key: &str,
        session_id: &str,
        worker_id: &str,
        ttl: Duration,
    ) -> Result<Option<String>, StoreError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenAcquireResult {
    Acquired { remaining: f64 },
    Denied { retry_after: Duration },
}

// ---------------------------------------------------------------------------
// SqliteStore — embedded backend
// ---------------------------------------------------------------------------

pub struct SqliteStore {
    conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
    pub async fn open(path: impl AsRef<std::path::Path>) -> Result<Self, StoreError> {
        let conn = tokio_rusqlite::Connection::open(path).await?;
        Self::init(conn).await
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = tokio_rusqlite::Connection::open_in_memory().await?;
        Self::init(conn).await
    }

    async fn init(conn: tokio_rusqlite::Connection) -> Result<Self, StoreError> {
        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode=WAL;
                 PRAGMA synchronous=NORMAL;
                 PRAGMA cache_size=-16000;
                 PRAGMA busy_timeout=5000;

                 CREATE TABLE IF NOT EXISTS kv (
                     key TEXT PRIMARY KEY,
                     value TEXT NOT NULL,
                     expires_at INTEGER
                 );
                 CREATE TABLE IF NOT EXISTS lists (
                     key TEXT NOT NULL,
                     seq INTEGER NOT NULL,
                     value TEXT NOT NULL,
                     PRIMARY KEY (key, seq)
                 );
                 CREATE TABLE IF NOT EXISTS sets (
                     key TEXT NOT NULL,
                     member TEXT NOT NULL,
                     PRIMARY KEY (key, member)
                 );
                 CREATE TABLE IF NOT EXISTS zsets (
                     key TEXT NOT NULL,
                     member TEXT NOT NULL,
                     score INTEGER NOT NULL,
                     PRIMARY KEY (key, member)
                 );
                 CREATE INDEX IF NOT EXISTS zsets_score_idx ON zsets(key, score);
                 CREATE TABLE IF NOT EXISTS hashes (
                     key TEXT NOT NULL,
                     field TEXT NOT NULL,
                     value TEXT NOT NULL,
                     PRIMARY KEY (key, field)
                 );
                 CREATE TABLE IF NOT EXISTS buckets (
                     key TEXT PRIMARY KEY,
                     tokens REAL NOT NULL,
                     last_refill_ms INTEGER NOT NULL
                 );",
            )?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn expires_at(ttl: Option<Duration>) -> Option<i64> {
    ttl.map(|d| now_millis() + d.as_millis() as i64)
}

#[async_trait]
impl Store for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let key = key.to_string();
        let now = now_millis();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "DELETE FROM kv WHERE key = ?1 AND expires_at IS NOT NULL AND expires_at <= ?2",
                    params![key, now],
                )?;
                let v: Option<String> = conn
                    .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |r| r.get(0))
                    .optional()?;
                Ok(v)
            })
            .await
            .map_err(Into::into)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let key = key.to_string();
        let value = value.to_string();
        let exp = expires_at(ttl);
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
                    params![key, value, exp],
                )?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let key = key.to_string();
        self.conn
            .call(move |conn| Ok(conn.execute("DELETE FROM kv WHERE key = ?1", params![key])? > 0))
            .await
            .map_err(Into::into)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.get(key).await?.is_some())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let pattern = format!("{prefix}%");
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT key FROM kv WHERE key LIKE ?1 ESCAPE '\\'")?;
                let rows = stmt
                    .query_map(params![pattern], |r| r.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(Into::into)
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<i64, StoreError> {
        let key = key.to_string();
        let value = value.to_string();
        self.conn
            .call(move |conn| {
                let next_seq: i64 = conn
                    .query_row(
                        "SELECT COALESCE(MAX(seq), -1) + 1 FROM lists WHERE key = ?1",
                        params![key],
                        |r| r.get(0),
                    )?;
                conn.execute(
                    "INSERT INTO lists (key, seq, value) VALUES (?1, ?2, ?3)",
                    params![key, next_seq, value],
                )?;
                let len: i64 =
                    conn.query_row("SELECT COUNT(*) FROM lists WHERE key = ?1", params![key], |r| r.get(0))?;
                Ok(len)
            })
            .await
            .map_err(Into::into)
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>, StoreError> {
        let key = key.to_string();
        self.conn
            .call(move |conn| {
                let row: Option<(i64, String)> = conn
                    .query_row(
                        "SELECT seq, value FROM lists WHERE key = ?1 ORDER BY seq ASC LIMIT 1",
                        params![key],
                        |r| Ok((r.get(0)?, r.get(1)?)),
                    )
                    .optional()?;
                if let Some((seq, value)) = row {
                    conn.execute("DELETE FROM lists WHERE key = ?1 AND seq = ?2", params![key, seq])?;
                    Ok(Some(value))
                } else {
                    Ok(None)
                }
            })
            .await
            .map_err(Into::into)
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError> {
        let key = key.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT value FROM lists WHERE key = ?1 ORDER BY seq ASC LIMIT ?2 OFFSET ?3",
                )?;
                let limit = if stop < 0 { -1 } else { stop - start + 1 };
                let rows = stmt
                    .query_map(params![key, limit, start], |r| r.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(Into::into)
    }

    async fn llen(&self, key: &str) -> Result<i64, StoreError> {
        let key = key.to_string();
        self.conn
            .call(move |conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM lists WHERE key = ?1",
                    params![key],
                    |r| r.get(0),
                )?)
            })
            .await
            .map_err(Into::into)
    }

    async fn lrem(&self, key: &str, value: &str) -> Result<i64, StoreError> {
        let key = key.to_string();
        let value = value.to_string();
        self.conn
            .call(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM lists WHERE key = ?1 AND value = ?2",
                    params![key, value],
                )? as i64)
            })
            .await
            .map_err(Into::into)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let key = key.to_string();
        let member = member.to_string();
        self.conn
            .call(move |conn| {
                Ok(conn.execute(
                    "INSERT OR IGNORE INTO sets (key, member) VALUES (?1, ?2)",
                    params![key, member],
                )? > 0)
            })
            .await
            .map_err(Into::into)
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let key = key.to_string();
        let member = member.to_string();
        self.conn
            .call(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM sets WHERE key = ?1 AND member = ?2",
                    params![key, member],
                )? > 0)
            })
            .await
            .map_err(Into::into)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let key = key.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT member FROM sets WHERE key = ?1")?;
                let rows = stmt
                    .query_map(params![key], |r| r.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(Into::into)
    }

    async fn scard(&self, key: &str) -> Result<i64, StoreError> {
        let key = key.to_string();
        self.conn
            .call(move |conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM sets WHERE key = ?1",
                    params![key],
                    |r| r.get(0),
                )?)
            })
            .await
            .map_err(Into::into)
    }

    async fn zadd(&self, key: &str, score: i64, member: &str) -> Result<(), StoreError> {
        let key = key.to_string();
        let member = member.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO zsets (key, member, score) VALUES (?1, ?2, ?3)
                     ON CONFLICT(key, member) DO UPDATE SET score = excluded.score",
                    params![key, member, score],
                )?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let key = key.to_string();
        let member = member.to_string();
        self.conn
            .call(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM zsets WHERE key = ?1 AND member = ?2",
                    params![key, member],
                )? > 0)
            })
            .await
            .map_err(Into::into)
    }

    async fn zrangebyscore(
        &self,
        key: &str,
        min: i64,
        max: i64,
        limit: Option<i64>,
    ) -> Result<Vec<String>, StoreError> {
        let key = key.to_string();
        let limit = limit.unwrap_or(-1);
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT member FROM zsets WHERE key = ?1 AND score >= ?2 AND score <= ?3
                     ORDER BY score ASC LIMIT ?4",
                )?;
                let rows = stmt
                    .query_map(params![key, min, max, limit], |r| r.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(Into::into)
    }

    async fn zcard(&self, key: &str) -> Result<i64, StoreError> {
        let key = key.to_string();
        self.conn
            .call(move |conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM zsets WHERE key = ?1",
                    params![key],
                    |r| r.get(0),
                )?)
            })
            .await
            .map_err(Into::into)
    }

    async fn zpopmin(&self, key: &str) -> Result<Option<(String, i64)>, StoreError> {
        let key = key.to_string();
        self.conn
            .call(move |conn| {
                let row: Option<(String, i64)> = conn
                    .query_row(
                        "SELECT member, score FROM zsets WHERE key = ?1 ORDER BY score ASC LIMIT 1",
                        params![key],
                        |r| Ok((r.get(0)?, r.get(1)?)),
                    )
                    .optional()?;
                if let Some((member, score)) = &row {
                    conn.execute(
                        "DELETE FROM zsets WHERE key = ?1 AND member = ?2",
                        params![key, member],
                    )?;
                    let _ = score;
                }
                Ok(row)
            })
            .await
            .map_err(Into::into)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let key = key.to_string();
        let field = field.to_string();
        let value = value.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO hashes (key, field, value) VALUES (?1, ?2, ?3)
                     ON CONFLICT(key, field) DO UPDATE SET value = excluded.value",
                    params![key, field, value],
                )?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let key = key.to_string();
        let field = field.to_string();
        self.conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT value FROM hashes WHERE key = ?1 AND field = ?2",
                        params![key, field],
                        |r| r.get(0),
                    )
                    .optional()?)
            })
            .await
            .map_err(Into::into)
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        let key = key.to_string();
        let field = field.to_string();
        self.conn
            .call(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM hashes WHERE key = ?1 AND field = ?2",
                    params![key, field],
                )? > 0)
            })
            .await
            .map_err(Into::into)
    }

    async fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        let mut out = Vec::with_capacity(fields.len());
        for f in fields {
            out.push(self.hget(key, f).await?);
        }
        Ok(out)
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>, StoreError> {
        let key = key.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT field, value FROM hashes WHERE key = ?1")?;
                let rows = stmt
                    .query_map(params![key], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(Into::into)
    }

    async fn hlen(&self, key: &str) -> Result<i64, StoreError> {
        let key = key.to_string();
        self.conn
            .call(move |conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM hashes WHERE key = ?1",
                    params![key],
                    |r| r.get(0),
                )?)
            })
            .await
            .map_err(Into::into)
    }

    async fn setnx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool, StoreError> {
        let key = key.to_string();
        let value = value.to_string();
        let exp = expires_at(ttl);
        let now = now_millis();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "DELETE FROM kv WHERE key = ?1 AND expires_at IS NOT NULL AND expires_at <= ?2",
                    params![key, now],
                )?;
                let inserted = conn.execute(
                    "INSERT OR IGNORE INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)",
                    params![key, value, exp],
                )?;
                Ok(inserted > 0)
            })
            .await
            .map_err(Into::into)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let key = key.to_string();
        let exp = now_millis() + ttl.as_millis() as i64;
        self.conn
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE kv SET expires_at = ?2 WHERE key = ?1",
                    params![key, exp],
                )? > 0)
            })
            .await
            .map_err(Into::into)
    }

    async fn try_acquire_token(
        &self,
        key: &str,
        tokens_per_second: f64,
        max_burst: f64,
        cost: f64,
    ) -> Result<TokenAcquireResult, StoreError> {
        let key = key.to_string();
        let now = now_millis();
        self.conn
            .call(move |conn| {
                let row: Option<(f64, i64)> = conn
                    .query_row(
                        "SELECT tokens, last_refill_ms FROM buckets WHERE key = ?1",
                        params![key],
                        |r| Ok((r.get(0)?, r.get(1)?)),
                    )
                    .optional()?;
                let (tokens, last_refill_ms) = row.unwrap_or((max_burst, now));
                let elapsed_secs = ((now - last_refill_ms).max(0) as f64) / 1000.0;
                let refilled = (tokens + elapsed_secs * tokens_per_second).min(max_burst);

                let result = if refilled >= cost {
                    let remaining = refilled - cost;
                    conn.execute(
                        "INSERT INTO buckets (key, tokens, last_refill_ms) VALUES (?1, ?2, ?3)
                         ON CONFLICT(key) DO UPDATE SET tokens = excluded.tokens, last_refill_ms = excluded.last_refill_ms",
                        params![key, remaining, now],
                    )?;
                    TokenAcquireResult::Acquired { remaining }
                } else {
                    conn.execute(
                        "INSERT INTO buckets (key, tokens, last_refill_ms) VALUES (?1, ?2, ?3)
                         ON CONFLICT(key) DO UPDATE SET tokens = excluded.tokens, last_refill_ms = excluded.last_refill_ms",
                        params![key, refilled, now],
                    )?;
                    let deficit = cost - refilled;
                    let wait_secs = deficit / tokens_per_second;
                    TokenAcquireResult::Denied {
                        retry_after: Duration::from_secs_f64(wait_secs.max(0.0)),
                    }
                };
                Ok(result)
            })
            .await
            .map_err(Into::into)
    }

    async fn claim_work(
        &self,
        claim_key: &str,
        items_key: &str,
        queue_key: &str,
        session_id: &str,
        worker_id: &str,
        ttl: Duration,
    ) -> Result<Option<String>, StoreError> {
        let claim_key = claim_key.to_string();
        let items_key = items_key.to_string();
        let queue_key = queue_key.to_string();
        let session_id = session_id.to_string();
        let worker_id = worker_id.to_string();
        let now = now_millis();
        let exp = now + ttl.as_millis() as i64;
        self.conn
            .call(move |conn| {
                conn.execute(
                    "DELETE FROM kv WHERE key = ?1 AND expires_at IS NOT NULL AND expires_at <= ?2",
                    params![claim_key, now],
                )?;
                let claimed = conn.execute(
                    "INSERT OR IGNORE INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)",
                    params![claim_key, worker_id, exp],
                )?;
                if claimed == 0 {
                    return Ok(None);
                }
                let item: Option<String> = conn
                    .query_row(
                        "SELECT value FROM hashes WHERE key = ?1 AND field = ?2",
                        params![items_key, session_id],
                        |r| r.get(0),
                    )
                    .optional()?;
                conn.execute(
                    "DELETE FROM zsets WHERE key = ?1 AND member = ?2",
                    params![queue_key, session_id],
                )?;
                conn.execute(
                    "DELETE FROM hashes WHERE key = ?1 AND field = ?2",
                    params![items_key, session_id],
                )?;
                Ok(item)
            })
            .await
            .map_err(Into::into)
    }
}

// ---------------------------------------------------------------------------
// MemoryStore — in-process test double
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryInner {
    kv: HashMap<String, (String, Option<i64>)>,
    lists: HashMap<String, Vec<String>>,
    sets: HashMap<String, std::collections::BTreeSet<String>>,
    zsets: HashMap<String, Vec<(String, i64)>>,
    hashes: HashMap<String, HashMap<String, String>>,
    buckets: HashMap<String, (f64, i64)>,
}

pub struct MemoryStore {
    inner: StdMutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: StdMutex::new(MemoryInner::default()),
        }
    }

    fn expire_if_needed(inner: &mut MemoryInner, key: &str) {
        let now = now_millis();
        let expired = matches!(inner.kv.get(key), Some((_, Some(e))) if *e <= now);
        if expired {
            inner.kv.remove(key);
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        Self::expire_if_needed(&mut inner, key);
        Ok(inner.kv.get(key).map(|(v, _)| v.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.kv.insert(key.to_string(), (value.to_string(), expires_at(ttl)));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.inner.lock().unwrap().kv.remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.get(key).await.map(|v| v.is_some())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .kv
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let list = inner.lists.entry(key.to_string()).or_default();
        list.push(value.to_string());
        Ok(list.len() as i64)
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.lists.get_mut(key) {
            Some(list) if !list.is_empty() => Ok(Some(list.remove(0))),
            _ => Ok(None),
        }
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let list = inner.lists.get(key).cloned().unwrap_or_default();
        let len = list.len() as i64;
        let start = start.max(0);
        let stop = if stop < 0 { len - 1 } else { stop.min(len - 1) };
        if start > stop || start >= len {
            return Ok(Vec::new());
        }
        Ok(list[start as usize..=(stop as usize)].to_vec())
    }

    async fn llen(&self, key: &str) -> Result<i64, StoreError> {
        Ok(self.inner.lock().unwrap().lists.get(key).map(|l| l.len()).unwrap_or(0) as i64)
    }

    async fn lrem(&self, key: &str, value: &str) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.lists.get_mut(key) {
            Some(list) => {
                let before = list.len();
                list.retain(|v| v != value);
                Ok((before - list.len()) as i64)
            }
            None => Ok(0),
        }
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        Ok(inner.sets.entry(key.to_string()).or_default().insert(member.to_string()))
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.sets.get_mut(key) {
            Some(set) => Ok(set.remove(member)),
            None => Ok(false),
        }
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn scard(&self, key: &str) -> Result<i64, StoreError> {
        Ok(self.inner.lock().unwrap().sets.get(key).map(|s| s.len()).unwrap_or(0) as i64)
    }

    async fn zadd(&self, key: &str, score: i64, member: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let zset = inner.zsets.entry(key.to_string()).or_default();
        zset.retain(|(m, _)| m != member);
        zset.push((member.to_string(), score));
        zset.sort_by_key(|(_, s)| *s);
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.zsets.get_mut(key) {
            Some(zset) => {
                let before = zset.len();
                zset.retain(|(m, _)| m != member);
                Ok(zset.len() != before)
            }
            None => Ok(false),
        }
    }

    async fn zrangebyscore(
        &self,
        key: &str,
        min: i64,
        max: i64,
        limit: Option<i64>,
    ) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let zset = inner.zsets.get(key).cloned().unwrap_or_default();
        let mut out: Vec<String> = zset
            .into_iter()
            .filter(|(_, s)| *s >= min && *s <= max)
            .map(|(m, _)| m)
            .collect();
        if let Some(limit) = limit {
            out.truncate(limit.max(0) as usize);
        }
        Ok(out)
    }

    async fn zcard(&self, key: &str) -> Result<i64, StoreError> {
        Ok(self.inner.lock().unwrap().zsets.get(key).map(|z| z.len()).unwrap_or(0) as i64)
    }

    async fn zpopmin(&self, key: &str) -> Result<Option<(String, i64)>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.zsets.get_mut(key) {
            Some(zset) if !zset.is_empty() => Ok(Some(zset.remove(0))),
            _ => Ok(None),
        }
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .hashes
            .get(key)
            .and_then(|h| h.get(field))
            .cloned())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.hashes.get_mut(key) {
            Some(h) => Ok(h.remove(field).is_some()),
            None => Ok(false),
        }
    }

    async fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let h = inner.hashes.get(key);
        Ok(fields
            .iter()
            .map(|f| h.and_then(|h| h.get(f)).cloned())
            .collect())
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .hashes
            .get(key)
            .map(|h| h.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn hlen(&self, key: &str) -> Result<i64, StoreError> {
        Ok(self.inner.lock().unwrap().hashes.get(key).map(|h| h.len()).unwrap_or(0) as i64)
    }

    async fn setnx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        Self::expire_if_needed(&mut inner, key);
        if inner.kv.contains_key(key) {
            return Ok(false);
        }
        inner.kv.insert(key.to_string(), (value.to_string(), expires_at(ttl)));
        Ok(true)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.kv.get_mut(key) {
            Some((_, exp)) => {
                *exp = Some(now_millis() + ttl.as_millis() as i64);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn try_acquire_token(
        &self,
        key: &str,
        tokens_per_second: f64,
        max_burst: f64,
        cost: f64,
    ) -> Result<TokenAcquireResult, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let now = now_millis();
        let (tokens, last_refill_ms) = *inner.buckets.get(key).unwrap_or(&(max_burst, now));
        let elapsed_secs = ((now - last_refill_ms).max(0) as f64) / 1000.0;
        let refilled = (tokens + elapsed_secs * tokens_per_second).min(max_burst);

        if refilled >= cost {
            let remaining = refilled - cost;
            inner.buckets.insert(key.to_string(), (remaining, now));
            Ok(TokenAcquireResult::Acquired { remaining })
        } else {
            inner.buckets.insert(key.to_string(), (refilled, now));
            let deficit = cost - refilled;
            Ok(TokenAcquireResult::Denied {
                retry_after: Duration::from_secs_f64((deficit / tokens_per_second).max(0.0)),
            })
        }
    }

    async fn claim_work(
        &self,
        claim_key: &str,
        items_key: &str,
        queue_key: &str,
        session_id: &str,
        worker_id: &str,
        ttl: Duration,
    ) -> Result<Option<String>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        Self::expire_if_needed(&mut inner, claim_key);
        if inner.kv.contains_key(claim_key) {
            return Ok(None);
        }
        inner.kv.insert(
            claim_key.to_string(),
            (worker_id.to_string(), Some(now_millis() + ttl.as_millis() as i64)),
        );
        let item = inner
            .hashes
            .get_mut(items_key)
            .and_then(|h| h.remove(session_id));
        if let Some(zset) = inner.zsets.get_mut(queue_key) {
            zset.retain(|(m, _)| m != session_id);
        }
        Ok(item)
    }
}
