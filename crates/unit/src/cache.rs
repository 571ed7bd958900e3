//! Process-safe key/value caches over SQLite.
//!
//! Two stores exist per unit. The *persistent* cache survives reboots
//! (calibrations, OD baselines). The *intermittent* cache lives under `/tmp`
//! and holds running-job metadata, hardware locks and dodge schedules. Both
//! are plain `kv` tables in WAL mode so several job processes can use them at
//! once.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::error::CacheError;

type Result<T> = std::result::Result<T, CacheError>;

const IN_MEMORY_CONNECTIONS: u32 = 4;
/// Callers beyond the pool size queue instead of failing.
const IN_MEMORY_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(24 * 3600);

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

/// Whether a process with this pid exists. Without `/proc` every pid is
/// assumed alive, so nothing is ever reclaimed by mistake.
pub fn process_alive(pid: u32) -> bool {
    let proc_root = Path::new("/proc");
    if !proc_root.is_dir() {
        return true;
    }
    proc_root.join(pid.to_string()).exists()
}

/// Lock holders are written as `<name>:<pid>`.
pub fn holder_tag(name: &str) -> String {
    format!("{name}:{}", std::process::id())
}

fn holder_pid(holder: &str) -> Option<u32> {
    holder.rsplit_once(':').and_then(|(_, pid)| pid.parse().ok())
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Cache {
    pool: Pool<Sqlite>,
}

impl Cache {
    /// Open (creating if needed) a cache file and run migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir).map_err(|e| CacheError::Sqlx(sqlx::Error::Io(e)))?;
            }
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let cache = Self { pool };
        cache.migrate().await?;
        Ok(cache)
    }

    /// Private in-memory cache, for tests and `--local` runs. The
    /// connections share one database and never expire, which keeps it
    /// alive.
    ///
    /// Every connection is opened up front and handed out untested, so an
    /// acquire never waits on SQLite's worker threads. Queries then stay
    /// usable under a paused tokio clock; opening still needs the real one.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(IN_MEMORY_CONNECTIONS)
            .min_connections(IN_MEMORY_CONNECTIONS)
            .idle_timeout(None)
            .max_lifetime(None)
            .test_before_acquire(false)
            .acquire_timeout(IN_MEMORY_ACQUIRE_TIMEOUT)
            .connect_with(options)
            .await?;
        let cache = Self { pool };
        cache.migrate().await?;
        Ok(cache)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    // ----------------------------
    // Plain values
    // ----------------------------

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>("value")))
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO kv (key, value, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
              value=excluded.value,
              updated_at=excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(now_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Insert only if the key is absent. Returns whether this call wrote it.
    pub async fn insert_if_absent(&self, key: &str, value: &str) -> Result<bool> {
        let res = sqlx::query("INSERT OR IGNORE INTO kv (key, value, updated_at) VALUES (?, ?, ?)")
            .bind(key)
            .bind(value)
            .bind(now_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() == 1)
    }

    /// Write-once insert for immutable records.
    pub async fn insert_new(&self, key: &str, value: &str) -> Result<()> {
        if self.insert_if_absent(key, value).await? {
            Ok(())
        } else {
            Err(CacheError::Immutable(key.to_string()))
        }
    }

    /// Returns whether a row was removed.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let res = sqlx::query("DELETE FROM kv WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    /// Delete only while `key` still holds `value` (compare-and-delete).
    pub async fn delete_if(&self, key: &str, value: &str) -> Result<bool> {
        let res = sqlx::query("DELETE FROM kv WHERE key = ? AND value = ?")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    /// Keys starting with `prefix`, sorted.
    pub async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT key FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
        )
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get::<String, _>("key")).collect())
    }

    // ----------------------------
    // JSON values
    // ----------------------------

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|source| CacheError::Decode {
                    key: key.to_string(),
                    source,
                }),
            None => Ok(None),
        }
    }

    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value).map_err(|source| CacheError::Decode {
            key: key.to_string(),
            source,
        })?;
        self.set(key, &raw).await
    }

    // ----------------------------
    // Presence locks
    // ----------------------------

    /// Take an advisory lock: the key's presence is the lock. Fails fast
    /// with [`CacheError::Locked`] if another live holder has it; a holder
    /// whose process is gone is evicted first.
    pub async fn try_lock(&self, key: &str, holder: &str) -> Result<LockGuard> {
        for _ in 0..2 {
            if self.insert_if_absent(key, holder).await? {
                debug!(key, holder, "lock acquired");
                return Ok(LockGuard {
                    cache: self.clone(),
                    key: key.to_string(),
                    holder: holder.to_string(),
                    released: false,
                });
            }
            let Some(current) = self.get(key).await? else {
                continue;
            };
            match holder_pid(&current) {
                Some(pid) if !process_alive(pid) => {
                    warn!(key, stale_holder = %current, "reclaiming lock from exited process");
                    self.delete_if(key, &current).await?;
                }
                _ => {
                    return Err(CacheError::Locked {
                        key: key.to_string(),
                        holder: current,
                    })
                }
            }
        }
        Err(CacheError::Locked {
            key: key.to_string(),
            holder: "unknown".into(),
        })
    }
}

// ---------------------------------------------------------------------------
// Lock guard
// ---------------------------------------------------------------------------

/// Held presence lock. Call [`LockGuard::release`] on the normal path; if the
/// guard is dropped instead (panic, cancelled task) the release is spawned on
/// the current runtime.
pub struct LockGuard {
    cache: Cache,
    key: String,
    holder: String,
    released: bool,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        self.cache.delete_if(&self.key, &self.holder).await?;
        debug!(key = %self.key, "lock released");
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let cache = self.cache.clone();
        let key = std::mem::take(&mut self.key);
        let holder = std::mem::take(&mut self.holder);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = cache.delete_if(&key, &holder).await {
                        warn!(%key, "failed to release dropped lock: {e}");
                    }
                });
            }
            Err(_) => warn!(%key, "lock dropped outside a runtime; left for stale reclaim"),
        }
    }
}

// ---------------------------------------------------------------------------
// Both caches
// ---------------------------------------------------------------------------

/// Handles passed explicitly to every job.
#[derive(Clone)]
pub struct Caches {
    pub persistent: Cache,
    pub intermittent: Cache,
}

impl Caches {
    pub async fn open(persistent: &Path, intermittent: &Path) -> Result<Self> {
        Ok(Self {
            persistent: Cache::open(persistent).await?,
            intermittent: Cache::open(intermittent).await?,
        })
    }

    pub async fn in_memory() -> Result<Self> {
        Ok(Self {
            persistent: Cache::in_memory().await?,
            intermittent: Cache::in_memory().await?,
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
