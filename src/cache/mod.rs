//! Durable request cache keyed by normalized URL
//!
//! Every 2xx response the fetcher receives is written here before it is
//! classified, so a restarted crawl never repeats network traffic for a URL
//! it has already seen. Entries are content-addressed: writing the same key
//! twice with the same `(status_code, body_sha256)` is a no-op, writing it
//! with different content is rejected unless the stored entry is stale.
//!
//! # Example
//!
//! ```rust,ignore
//! use pubcrawl::cache::{CacheEntry, CacheKey, RequestCache, SqliteRequestCache};
//!
//! let cache = SqliteRequestCache::new("dataset/cache.db", None)?;
//! let key = CacheKey::from_url("https://example.org/a.pdf?utm_source=x")?;
//! cache.put(&CacheEntry::new(key.clone(), "https://example.org/a.pdf", 200, "application/pdf", body))?;
//! let hit = cache.get(&key)?;
//! ```

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use url::Url;

use crate::utils::error::CacheError;
use crate::utils::sha256_hex;

type Result<T> = std::result::Result<T, CacheError>;

/// Query parameters that never change the response
const TRACKING_PARAMS: &[&str] = &["fbclid", "gclid", "mc_cid", "mc_eid", "_ga", "ref_src"];

/// Normalized cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    /// Normalize a URL into a key
    ///
    /// Scheme and host are lowercased by the URL parser, default ports and
    /// fragments are dropped, tracking parameters are removed and the
    /// remaining query pairs are sorted.
    pub fn from_url(url: &str) -> Result<Self> {
        let mut parsed =
            Url::parse(url.trim()).map_err(|e| CacheError::InvalidKey(format!("{url}: {e}")))?;

        if parsed.host_str().is_none() {
            return Err(CacheError::InvalidKey(format!("{url}: missing host")));
        }

        parsed.set_fragment(None);

        let mut pairs: Vec<(String, String)> = parsed
            .query_pairs()
            .filter(|(k, _)| {
                let k = k.to_ascii_lowercase();
                !k.starts_with("utm_") && !TRACKING_PARAMS.contains(&k.as_str())
            })
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        pairs.sort();

        if pairs.is_empty() {
            parsed.set_query(None);
        } else {
            parsed.query_pairs_mut().clear().extend_pairs(pairs);
        }

        Ok(Self(parsed.to_string()))
    }

    /// Append a request signature (method, accept header, strategy...)
    pub fn with_signature(self, signature: &str) -> Self {
        if signature.is_empty() {
            return self;
        }
        Self(format!("{}#sig={signature}", self.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A cached response
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: CacheKey,
    /// URL the response was actually served from
    pub url: String,
    pub status_code: u16,
    pub content_type: String,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
    /// SHA-256 of `body`
    pub body_hash: String,
    pub fetched_at: DateTime<Utc>,
    /// Stale entries are never served as hits and may be replaced
    pub stale: bool,
}

impl CacheEntry {
    pub fn new(
        key: CacheKey,
        url: impl Into<String>,
        status_code: u16,
        content_type: impl Into<String>,
        body: Bytes,
    ) -> Self {
        let body_hash = sha256_hex(&body);
        Self {
            key,
            url: url.into(),
            status_code,
            content_type: content_type.into(),
            headers: BTreeMap::new(),
            body,
            body_hash,
            fetched_at: Utc::now(),
            stale: false,
        }
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    /// Store the entry already marked stale
    pub fn into_stale(mut self) -> Self {
        self.stale = true;
        self
    }

    /// Content identity used for integrity checks
    pub fn content_id(&self) -> String {
        format!("{}:{}", self.status_code, self.body_hash)
    }
}

/// Result of a cache write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutResult {
    /// No entry existed for the key
    Inserted,
    /// Entry existed with identical content
    Unchanged,
    /// Stale entry was overwritten
    Replaced,
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: u64,
    pub stale_entries: u64,
    pub total_bytes: u64,
}

/// Durable key to response store
pub trait RequestCache: Send + Sync {
    /// Entry for the key; `stale` is set when stored stale or past max age
    fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>>;

    /// Write an entry, enforcing content identity for non-stale entries
    fn put(&self, entry: &CacheEntry) -> Result<PutResult>;

    /// Mark an entry stale; returns false when the key is absent
    fn mark_stale(&self, key: &CacheKey) -> Result<bool>;

    fn stats(&self) -> Result<CacheStats>;

    /// Non-stale entry for the key
    fn lookup(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        Ok(self.get(key)?.filter(|entry| !entry.stale))
    }
}

/// SQLite implementation of [`RequestCache`]
///
/// Uses `Mutex` to serialize access to the single connection.
pub struct SqliteRequestCache {
    conn: Mutex<Connection>,
    max_age: Option<Duration>,
}

impl SqliteRequestCache {
    /// Open (or create) the cache database at `path`
    pub fn new(path: impl AsRef<Path>, max_age: Option<Duration>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA busy_timeout=5000;",
        )?;

        let cache = Self {
            conn: Mutex::new(conn),
            max_age,
        };
        cache.create_schema()?;

        tracing::info!(path = %path.display(), "Request cache initialized");
        Ok(cache)
    }

    /// Create in-memory cache (for testing)
    pub fn in_memory() -> Result<Self> {
        let cache = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
            max_age: None,
        };
        cache.create_schema()?;
        Ok(cache)
    }

    pub fn with_max_age(mut self, max_age: Option<Duration>) -> Self {
        self.max_age = max_age;
        self
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the guard cannot leave a half-applied
        // statement behind, so the connection stays usable.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn create_schema(&self) -> Result<()> {
        self.conn().execute_batch(
            r#"
                CREATE TABLE IF NOT EXISTS responses (
                    cache_key TEXT PRIMARY KEY,
                    url TEXT NOT NULL,
                    status_code INTEGER NOT NULL,
                    content_type TEXT NOT NULL,
                    headers TEXT NOT NULL,
                    body BLOB NOT NULL,
                    body_hash TEXT NOT NULL,
                    fetched_at_ms INTEGER NOT NULL,
                    stale INTEGER NOT NULL DEFAULT 0
                );
                "#,
        )?;
        Ok(())
    }

    fn is_expired(&self, fetched_at: DateTime<Utc>) -> bool {
        match self.max_age {
            Some(max_age) => Utc::now()
                .signed_duration_since(fetched_at)
                .to_std()
                .map(|age| age > max_age)
                .unwrap_or(false),
            None => false,
        }
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

impl RequestCache for SqliteRequestCache {
    fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let row = self
            .conn()
            .query_row(
                "SELECT url, status_code, content_type, headers, body, body_hash, fetched_at_ms, stale
                 FROM responses WHERE cache_key = ?1",
                params![key.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, u16>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Vec<u8>>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, i64>(6)?,
                        row.get::<_, bool>(7)?,
                    ))
                },
            )
            .optional()?;

        let Some((url, status_code, content_type, headers, body, body_hash, fetched_ms, stale)) =
            row
        else {
            return Ok(None);
        };

        let fetched_at = from_millis(fetched_ms);
        Ok(Some(CacheEntry {
            key: key.clone(),
            url,
            status_code,
            content_type,
            headers: serde_json::from_str(&headers)?,
            body: Bytes::from(body),
            body_hash,
            fetched_at,
            stale: stale || self.is_expired(fetched_at),
        }))
    }

    fn put(&self, entry: &CacheEntry) -> Result<PutResult> {
        let headers = serde_json::to_string(&entry.headers)?;
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let existing = tx
            .query_row(
                "SELECT status_code, body_hash, stale, fetched_at_ms FROM responses WHERE cache_key = ?1",
                params![entry.key.as_str()],
                |row| {
                    Ok((
                        row.get::<_, u16>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, bool>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;

        let result = match existing {
            None => PutResult::Inserted,
            Some((status, hash, _, _)) if status == entry.status_code && hash == entry.body_hash => {
                PutResult::Unchanged
            }
            Some((status, hash, stale, fetched_ms)) => {
                if !stale && !self.is_expired(from_millis(fetched_ms)) {
                    return Err(CacheError::IntegrityViolation {
                        key: entry.key.to_string(),
                        existing: format!("{status}:{hash}"),
                        incoming: entry.content_id(),
                    });
                }
                PutResult::Replaced
            }
        };

        match result {
            // Identical content: only the freshness flag may change
            PutResult::Unchanged => {
                tx.execute(
                    "UPDATE responses SET stale = ?2 WHERE cache_key = ?1",
                    params![entry.key.as_str(), entry.stale],
                )?;
            }
            PutResult::Inserted | PutResult::Replaced => {
                tx.execute(
                    "INSERT OR REPLACE INTO responses
                        (cache_key, url, status_code, content_type, headers, body, body_hash, fetched_at_ms, stale)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        entry.key.as_str(),
                        entry.url,
                        entry.status_code,
                        entry.content_type,
                        headers,
                        entry.body.as_ref(),
                        entry.body_hash,
                        entry.fetched_at.timestamp_millis(),
                        entry.stale,
                    ],
                )?;
            }
        }

        tx.commit()?;
        tracing::trace!(key = %entry.key, result = ?result, "Cache write");
        Ok(result)
    }

    fn mark_stale(&self, key: &CacheKey) -> Result<bool> {
        let changed = self.conn().execute(
            "UPDATE responses SET stale = 1 WHERE cache_key = ?1",
            params![key.as_str()],
        )?;
        Ok(changed > 0)
    }

    fn stats(&self) -> Result<CacheStats> {
        let conn = self.conn();
        let (entries, stale_entries, total_bytes) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(stale), 0), COALESCE(SUM(LENGTH(body)), 0) FROM responses",
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            },
        )?;

        Ok(CacheStats {
            entries: entries as u64,
            stale_entries: stale_entries as u64,
            total_bytes: total_bytes as u64,
        })
    }
}
