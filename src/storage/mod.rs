//! SQLite-backed storage layer
//!
//! One store owns a bounded pool of connections (WAL mode, NO_MUTEX with
//! external locking). Writes that must be atomic — the batch flush, the
//! category transition — run inside short explicit transactions; everything
//! else is a single statement through a cached prepare.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use itertools::Itertools;
use parking_lot::{Condvar, Mutex};
use rusqlite::{params, params_from_iter, Connection, OpenFlags, TransactionBehavior};
use tracing::{debug, info, warn};

use crate::errors::{classify_sqlite, EngineError};
use crate::events::FlushCounts;
use crate::types::{
    BuyEvaluationRow, Category, CategoryTransition, MarketSnapshot, NewToken, PriceSample,
    ScanLogEntry, TokenMetadata, TokenRecord, TokenTransaction,
};

/// Chunk size for multi-row inserts inside a flush
const INSERT_CHUNK: usize = 50;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;

CREATE TABLE IF NOT EXISTS tokens (
    address              TEXT PRIMARY KEY,
    symbol               TEXT NOT NULL DEFAULT 'LOADING...',
    name                 TEXT NOT NULL DEFAULT 'LOADING...',
    decimals             INTEGER NOT NULL DEFAULT 6,
    creator              TEXT,
    launch_signature     TEXT,
    launch_slot          INTEGER,
    current_price_sol    REAL NOT NULL DEFAULT 0,
    current_price_usd    REAL NOT NULL DEFAULT 0,
    market_cap           REAL NOT NULL DEFAULT 0,
    liquidity            REAL NOT NULL DEFAULT 0,
    volume_24h           REAL NOT NULL DEFAULT 0,
    holder_count         INTEGER NOT NULL DEFAULT 0,
    top10_concentration  REAL NOT NULL DEFAULT 0,
    curve_progress       REAL NOT NULL DEFAULT 0,
    safety_score         REAL,
    safety_checked_at    TEXT,
    safety_flags         TEXT NOT NULL DEFAULT '[]',
    category             TEXT NOT NULL DEFAULT 'NEW',
    previous_category    TEXT,
    category_updated_at  TEXT NOT NULL,
    category_scan_count  INTEGER NOT NULL DEFAULT 0,
    aim_attempts         INTEGER NOT NULL DEFAULT 0,
    buy_attempts         INTEGER NOT NULL DEFAULT 0,
    price_update_count   INTEGER NOT NULL DEFAULT 0,
    last_price_update    TEXT,
    last_scan_at         TEXT,
    discovered_at        TEXT NOT NULL,
    metadata_failed      INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_tokens_category ON tokens(category);
CREATE INDEX IF NOT EXISTS idx_tokens_discovered ON tokens(discovered_at);

CREATE TABLE IF NOT EXISTS category_transitions (
    id                        INTEGER PRIMARY KEY AUTOINCREMENT,
    token_address             TEXT NOT NULL,
    from_category             TEXT NOT NULL,
    to_category               TEXT NOT NULL,
    market_cap_at_transition  REAL NOT NULL,
    reason                    TEXT NOT NULL,
    metadata                  TEXT NOT NULL DEFAULT '{}',
    occurred_at               TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_transitions_token ON category_transitions(token_address);

CREATE TABLE IF NOT EXISTS scan_logs (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    token_address  TEXT NOT NULL,
    category       TEXT NOT NULL,
    scan_number    INTEGER NOT NULL,
    duration_ms    INTEGER NOT NULL,
    apis_used      TEXT NOT NULL DEFAULT '[]',
    error          TEXT,
    is_final       INTEGER NOT NULL DEFAULT 0,
    created_at     TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_scan_logs_token ON scan_logs(token_address);

CREATE TABLE IF NOT EXISTS buy_evaluations (
    id                    TEXT PRIMARY KEY,
    token_address         TEXT NOT NULL,
    evaluated_at          TEXT NOT NULL,
    passed                INTEGER NOT NULL,
    failure_reasons       TEXT NOT NULL DEFAULT '[]',
    criteria              TEXT NOT NULL DEFAULT '{}',
    observed              TEXT NOT NULL DEFAULT '{}',
    confidence            REAL NOT NULL,
    risk_level            TEXT NOT NULL,
    recommended_position  REAL NOT NULL,
    duration_ms           INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_buy_evaluations_token ON buy_evaluations(token_address);

CREATE TABLE IF NOT EXISTS token_prices (
    token_address          TEXT NOT NULL,
    time                   TEXT NOT NULL,
    price_usd              REAL NOT NULL,
    price_sol              REAL NOT NULL,
    virtual_sol_reserves   INTEGER NOT NULL DEFAULT 0,
    virtual_token_reserves INTEGER NOT NULL DEFAULT 0,
    real_sol_reserves      INTEGER NOT NULL DEFAULT 0,
    real_token_reserves    INTEGER NOT NULL DEFAULT 0,
    market_cap             REAL NOT NULL,
    liquidity_usd          REAL NOT NULL,
    slot                   INTEGER NOT NULL,
    source                 TEXT NOT NULL,
    UNIQUE(token_address, time)
);
CREATE INDEX IF NOT EXISTS idx_prices_token_time ON token_prices(token_address, time DESC);

CREATE TABLE IF NOT EXISTS token_transactions (
    signature      TEXT NOT NULL,
    token_address  TEXT NOT NULL,
    time           TEXT NOT NULL,
    kind           TEXT NOT NULL,
    user_address   TEXT NOT NULL,
    token_amount   REAL NOT NULL,
    sol_amount     REAL NOT NULL,
    price_sol      REAL NOT NULL,
    price_usd      REAL NOT NULL,
    slot           INTEGER NOT NULL,
    fee_lamports   INTEGER NOT NULL DEFAULT 0,
    UNIQUE(signature, token_address, time)
);
CREATE INDEX IF NOT EXISTS idx_tx_token_time ON token_transactions(token_address, time DESC);

CREATE TABLE IF NOT EXISTS api_call_logs (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    provider     TEXT NOT NULL,
    endpoint     TEXT NOT NULL,
    status       INTEGER,
    duration_ms  INTEGER NOT NULL,
    called_at    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS api_cache (
    cache_key   TEXT PRIMARY KEY,
    payload     TEXT NOT NULL,
    fetched_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sol_price_history (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    price_usd   REAL NOT NULL,
    source      TEXT NOT NULL,
    recorded_at TEXT NOT NULL
);
"#;

/// Tables the startup schema check requires
const REQUIRED_TABLES: [&str; 9] = [
    "tokens",
    "category_transitions",
    "scan_logs",
    "buy_evaluations",
    "token_prices",
    "token_transactions",
    "api_call_logs",
    "api_cache",
    "sol_price_history",
];

struct PoolInner {
    idle: Vec<Connection>,
    created: usize,
}

/// Bounded connection pool
///
/// Connections are created lazily up to `max`; a caller that finds the
/// pool exhausted blocks on the condvar until one is returned.
struct Pool {
    path: PathBuf,
    max: usize,
    inner: Mutex<PoolInner>,
    available: Condvar,
}

impl Pool {
    fn open_connection(path: &Path) -> Result<Connection, EngineError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags).map_err(classify_sqlite)?;
        conn.execute_batch("PRAGMA busy_timeout = 5000; PRAGMA synchronous = NORMAL;")
            .map_err(classify_sqlite)?;
        Ok(conn)
    }

    fn acquire(&self) -> Result<Connection, EngineError> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(conn) = inner.idle.pop() {
                return Ok(conn);
            }
            if inner.created < self.max {
                inner.created += 1;
                drop(inner);
                return match Self::open_connection(&self.path) {
                    Ok(conn) => Ok(conn),
                    Err(e) => {
                        self.inner.lock().created -= 1;
                        Err(e)
                    }
                };
            }
            self.available.wait(&mut inner);
        }
    }

    fn release(&self, conn: Connection) {
        self.inner.lock().idle.push(conn);
        self.available.notify_one();
    }
}

/// Guard returning its connection to the pool on drop
struct PooledConn<'a> {
    pool: &'a Pool,
    conn: Option<Connection>,
}

impl std::ops::Deref for PooledConn<'_> {
    type Target = Connection;
    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl std::ops::DerefMut for PooledConn<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl Drop for PooledConn<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

/// Handle over the scanner database
pub struct Store {
    pool: Pool,
    flush_errors: AtomicUsize,
}

impl Store {
    /// Open (or create) the database, apply the schema, verify it
    pub fn open(path: impl AsRef<Path>, pool_max: usize) -> Result<Arc<Self>, EngineError> {
        let path = path.as_ref().to_path_buf();
        let conn = Pool::open_connection(&path)?;
        conn.execute_batch(SCHEMA_SQL).map_err(classify_sqlite)?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if !journal_mode.eq_ignore_ascii_case("wal") {
            warn!(%journal_mode, "WAL mode not active");
        }

        Self::schema_check(&conn)?;

        let token_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM tokens", [], |row| row.get(0))
            .unwrap_or(0);
        info!(path = %path.display(), tokens = token_count, "storage opened");

        let pool = Pool {
            path,
            max: pool_max.max(1),
            inner: Mutex::new(PoolInner {
                idle: vec![conn],
                created: 1,
            }),
            available: Condvar::new(),
        };

        Ok(Arc::new(Self {
            pool,
            flush_errors: AtomicUsize::new(0),
        }))
    }

    /// Verify every required table exists; failure is fatal at startup
    fn schema_check(conn: &Connection) -> Result<(), EngineError> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table'")
            .map_err(classify_sqlite)?;
        let present: HashSet<String> = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(classify_sqlite)?
            .filter_map(|r| r.ok())
            .collect();

        for table in REQUIRED_TABLES {
            if !present.contains(table) {
                return Err(EngineError::Config(format!("missing table: {table}")));
            }
        }
        Ok(())
    }

    fn conn(&self) -> Result<PooledConn<'_>, EngineError> {
        Ok(PooledConn {
            pool: &self.pool,
            conn: Some(self.pool.acquire()?),
        })
    }

    /// Flush-transaction failures observed so far
    pub fn flush_error_count(&self) -> usize {
        self.flush_errors.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // Token rows
    // ------------------------------------------------------------------

    /// Fetch one token row
    pub fn get_token(&self, address: &str) -> Result<Option<TokenRecord>, EngineError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare_cached("SELECT * FROM tokens WHERE address = ?1")
            .map_err(classify_sqlite)?;
        let mut rows = stmt
            .query_map(params![address], row_to_token)
            .map_err(classify_sqlite)?;
        match rows.next() {
            Some(Ok(token)) => Ok(Some(token)),
            Some(Err(e)) => Err(classify_sqlite(e)),
            None => Ok(None),
        }
    }

    /// Direct per-price token update, outside any flush transaction
    #[allow(clippy::too_many_arguments)]
    pub fn update_token_price(
        &self,
        address: &str,
        price_sol: f64,
        price_usd: f64,
        market_cap: f64,
        liquidity: f64,
        curve_progress: f64,
        at: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let conn = self.conn()?;
        conn.prepare_cached(
            "UPDATE tokens SET current_price_sol = ?2, current_price_usd = ?3, \
             market_cap = ?4, liquidity = ?5, curve_progress = ?6, \
             last_price_update = ?7, price_update_count = price_update_count + 1 \
             WHERE address = ?1",
        )
        .map_err(classify_sqlite)?
        .execute(params![address, price_sol, price_usd, market_cap, liquidity, curve_progress, at])
        .map_err(classify_sqlite)?;
        Ok(())
    }

    /// Apply a market-data snapshot gathered by a scan
    pub fn update_market_snapshot(
        &self,
        address: &str,
        snapshot: &MarketSnapshot,
        at: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let conn = self.conn()?;
        conn.prepare_cached(
            "UPDATE tokens SET \
             market_cap = COALESCE(?2, market_cap), \
             liquidity = COALESCE(?3, liquidity), \
             volume_24h = COALESCE(?4, volume_24h), \
             holder_count = COALESCE(?5, holder_count), \
             top10_concentration = COALESCE(?6, top10_concentration), \
             safety_score = COALESCE(?7, safety_score), \
             safety_checked_at = CASE WHEN ?7 IS NULL THEN safety_checked_at ELSE ?8 END, \
             safety_flags = CASE WHEN ?9 IS NULL THEN safety_flags ELSE ?9 END \
             WHERE address = ?1",
        )
        .map_err(classify_sqlite)?
        .execute(params![
            address,
            snapshot.market_cap,
            snapshot.liquidity,
            snapshot.volume_24h,
            snapshot.holder_count,
            snapshot.top10_concentration,
            snapshot.safety_score,
            at,
            if snapshot.safety_flags.is_empty() {
                None
            } else {
                Some(serde_json::to_string(&snapshot.safety_flags).unwrap_or_default())
            },
        ])
        .map_err(classify_sqlite)?;
        Ok(())
    }

    /// Insert a full token row if absent (used by tests and rehydrate seeding)
    pub fn insert_token(&self, token: &TokenRecord) -> Result<(), EngineError> {
        let conn = self.conn()?;
        insert_token_stmt(&conn, token)
    }

    /// Tokens eligible for rehydrate, one page at a time
    pub fn load_active_tokens(
        &self,
        max_age_days: i64,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<TokenRecord>, EngineError> {
        let cutoff = Utc::now() - ChronoDuration::days(max_age_days);
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare_cached(
                "SELECT * FROM tokens \
                 WHERE category IN ('NEW','LOW','MEDIUM','HIGH','AIM') \
                 AND discovered_at >= ?1 \
                 ORDER BY address LIMIT ?2 OFFSET ?3",
            )
            .map_err(classify_sqlite)?;
        let rows = stmt
            .query_map(params![cutoff, limit as i64, offset as i64], row_to_token)
            .map_err(classify_sqlite)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(classify_sqlite)?);
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Category transitions
    // ------------------------------------------------------------------

    /// Atomically persist a category transition
    ///
    /// One transaction updates the token row's lifecycle columns and
    /// appends the transition log row; the caller emits the change event
    /// only after this returns Ok.
    pub fn apply_transition(
        &self,
        transition: &CategoryTransition,
        aim_attempts: u32,
    ) -> Result<(), EngineError> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(classify_sqlite)?;

        tx.prepare_cached(
            "UPDATE tokens SET category = ?2, previous_category = ?3, \
             category_updated_at = ?4, category_scan_count = 0, \
             aim_attempts = ?5, market_cap = ?6 \
             WHERE address = ?1",
        )
        .map_err(classify_sqlite)?
        .execute(params![
            transition.token_address,
            transition.to_category.as_str(),
            transition.from_category.as_str(),
            transition.occurred_at,
            aim_attempts,
            transition.market_cap_at_transition,
        ])
        .map_err(classify_sqlite)?;

        tx.prepare_cached(
            "INSERT INTO category_transitions \
             (token_address, from_category, to_category, market_cap_at_transition, \
              reason, metadata, occurred_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .map_err(classify_sqlite)?
        .execute(params![
            transition.token_address,
            transition.from_category.as_str(),
            transition.to_category.as_str(),
            transition.market_cap_at_transition,
            transition.reason.tag(),
            transition.metadata.to_string(),
            transition.occurred_at,
        ])
        .map_err(classify_sqlite)?;

        tx.commit().map_err(classify_sqlite)
    }

    /// All transitions recorded for a token, oldest first
    pub fn transitions_for(&self, address: &str) -> Result<Vec<CategoryTransition>, EngineError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare_cached(
                "SELECT token_address, from_category, to_category, market_cap_at_transition, \
                 reason, metadata, occurred_at \
                 FROM category_transitions WHERE token_address = ?1 ORDER BY id",
            )
            .map_err(classify_sqlite)?;
        let rows = stmt
            .query_map(params![address], |row| {
                let from: String = row.get(1)?;
                let to: String = row.get(2)?;
                let reason_tag: String = row.get(4)?;
                let metadata: String = row.get(5)?;
                Ok(CategoryTransition {
                    token_address: row.get(0)?,
                    from_category: Category::parse(&from).unwrap_or(Category::New),
                    to_category: Category::parse(&to).unwrap_or(Category::New),
                    market_cap_at_transition: row.get(3)?,
                    reason: reason_from_tag(&reason_tag),
                    metadata: serde_json::from_str(&metadata)
                        .unwrap_or(serde_json::Value::Null),
                    occurred_at: row.get(6)?,
                })
            })
            .map_err(classify_sqlite)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(classify_sqlite)?);
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Batch flush
    // ------------------------------------------------------------------

    /// Write one ingest batch in a single transaction
    ///
    /// Order inside the transaction: new tokens, price placeholders,
    /// prices (deduplicated by `(token, time)` keeping the max slot),
    /// transaction placeholders, transactions. Returns the counts and
    /// the placeholder addresses that still need metadata.
    pub fn flush_batch(
        &self,
        new_tokens: &[NewToken],
        prices: &[PriceSample],
        transactions: &[TokenTransaction],
    ) -> Result<(FlushCounts, Vec<String>), EngineError> {
        let now = Utc::now();
        let mut conn = self.conn()?;
        let result = (|| -> Result<(FlushCounts, Vec<String>), EngineError> {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(classify_sqlite)?;
            let mut counts = FlushCounts::default();
            let mut placeholders = Vec::new();

            // 1. New tokens, conflict-ignored
            for token in new_tokens {
                let inserted = tx
                    .prepare_cached(
                        "INSERT INTO tokens \
                         (address, creator, launch_signature, launch_slot, \
                          category_updated_at, discovered_at) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?5) \
                         ON CONFLICT(address) DO NOTHING",
                    )
                    .map_err(classify_sqlite)?
                    .execute(params![
                        token.address,
                        token.creator,
                        token.launch_signature,
                        token.launch_slot.map(|s| s as i64),
                        token.discovered_at,
                    ])
                    .map_err(classify_sqlite)?;
                counts.new_tokens += inserted;
            }

            // 2. Placeholders for price rows whose token is unknown
            let price_tokens: HashSet<&str> =
                prices.iter().map(|p| p.token_address.as_str()).collect();
            placeholders.extend(insert_placeholders(&tx, &price_tokens, now)?);

            // 3. Deduplicated price upserts
            let deduped = dedup_prices(prices);
            counts.prices = deduped.len();
            for chunk in &deduped.iter().chunks(INSERT_CHUNK) {
                for price in chunk {
                    tx.prepare_cached(
                        "INSERT INTO token_prices \
                         (token_address, time, price_usd, price_sol, \
                          virtual_sol_reserves, virtual_token_reserves, \
                          real_sol_reserves, real_token_reserves, \
                          market_cap, liquidity_usd, slot, source) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12) \
                         ON CONFLICT(token_address, time) DO UPDATE SET \
                         price_usd = excluded.price_usd, \
                         price_sol = excluded.price_sol, \
                         market_cap = excluded.market_cap, \
                         liquidity_usd = excluded.liquidity_usd",
                    )
                    .map_err(classify_sqlite)?
                    .execute(params![
                        price.token_address,
                        price.time,
                        price.price_usd,
                        price.price_sol,
                        price.virtual_sol_reserves as i64,
                        price.virtual_token_reserves as i64,
                        price.real_sol_reserves as i64,
                        price.real_token_reserves as i64,
                        price.market_cap,
                        price.liquidity_usd,
                        price.slot as i64,
                        price.source,
                    ])
                    .map_err(classify_sqlite)?;
                }
            }

            // 4. Placeholders for transaction tokens, then transactions
            let tx_tokens: HashSet<&str> = transactions
                .iter()
                .map(|t| t.token_address.as_str())
                .collect();
            placeholders.extend(insert_placeholders(&tx, &tx_tokens, now)?);

            for chunk in &transactions.iter().chunks(INSERT_CHUNK) {
                for record in chunk {
                    let inserted = tx
                        .prepare_cached(
                            "INSERT INTO token_transactions \
                             (signature, token_address, time, kind, user_address, \
                              token_amount, sol_amount, price_sol, price_usd, slot, fee_lamports) \
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11) \
                             ON CONFLICT(signature, token_address, time) DO NOTHING",
                        )
                        .map_err(classify_sqlite)?
                        .execute(params![
                            record.signature,
                            record.token_address,
                            record.time,
                            record.kind.as_str(),
                            record.user_address,
                            record.token_amount,
                            record.sol_amount,
                            record.price_sol,
                            record.price_usd,
                            record.slot as i64,
                            record.fee_lamports as i64,
                        ])
                        .map_err(classify_sqlite)?;
                    counts.transactions += inserted;
                }
            }

            counts.placeholders = placeholders.len();
            tx.commit().map_err(classify_sqlite)?;
            Ok((counts, placeholders))
        })();

        if result.is_err() {
            self.flush_errors.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Most recent stored price samples for a token, newest first
    pub fn recent_prices(
        &self,
        address: &str,
        limit: usize,
    ) -> Result<Vec<PriceSample>, EngineError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare_cached(
                "SELECT token_address, time, price_usd, price_sol, \
                 virtual_sol_reserves, virtual_token_reserves, \
                 real_sol_reserves, real_token_reserves, \
                 market_cap, liquidity_usd, slot, source \
                 FROM token_prices WHERE token_address = ?1 \
                 ORDER BY time DESC LIMIT ?2",
            )
            .map_err(classify_sqlite)?;
        let rows = stmt
            .query_map(params![address, limit as i64], |row| {
                Ok(PriceSample {
                    token_address: row.get(0)?,
                    time: row.get(1)?,
                    price_usd: row.get(2)?,
                    price_sol: row.get(3)?,
                    virtual_sol_reserves: row.get::<_, i64>(4)? as u64,
                    virtual_token_reserves: row.get::<_, i64>(5)? as u64,
                    real_sol_reserves: row.get::<_, i64>(6)? as u64,
                    real_token_reserves: row.get::<_, i64>(7)? as u64,
                    market_cap: row.get(8)?,
                    liquidity_usd: row.get(9)?,
                    slot: row.get::<_, i64>(10)? as u64,
                    source: row.get(11)?,
                })
            })
            .map_err(classify_sqlite)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(classify_sqlite)?);
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Scan logs, evaluations, enrichment
    // ------------------------------------------------------------------

    pub fn append_scan_log(&self, entry: &ScanLogEntry) -> Result<(), EngineError> {
        let conn = self.conn()?;
        conn.prepare_cached(
            "INSERT INTO scan_logs \
             (token_address, category, scan_number, duration_ms, apis_used, error, is_final, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .map_err(classify_sqlite)?
        .execute(params![
            entry.token_address,
            entry.category.as_str(),
            entry.scan_number,
            entry.duration_ms as i64,
            serde_json::to_string(&entry.apis_used).unwrap_or_else(|_| "[]".into()),
            entry.error,
            entry.is_final,
            entry.created_at,
        ])
        .map_err(classify_sqlite)?;
        Ok(())
    }

    /// Record a completed scan on the token row
    pub fn update_scan_progress(
        &self,
        address: &str,
        scan_count: u32,
        at: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let conn = self.conn()?;
        conn.prepare_cached(
            "UPDATE tokens SET category_scan_count = ?2, last_scan_at = ?3 WHERE address = ?1",
        )
        .map_err(classify_sqlite)?
        .execute(params![address, scan_count, at])
        .map_err(classify_sqlite)?;
        Ok(())
    }

    pub fn append_buy_evaluation(&self, row: &BuyEvaluationRow) -> Result<(), EngineError> {
        let conn = self.conn()?;
        conn.prepare_cached(
            "INSERT INTO buy_evaluations \
             (id, token_address, evaluated_at, passed, failure_reasons, criteria, observed, \
              confidence, risk_level, recommended_position, duration_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )
        .map_err(classify_sqlite)?
        .execute(params![
            row.id.to_string(),
            row.token_address,
            row.evaluated_at,
            row.passed,
            serde_json::to_string(&row.failure_reasons).unwrap_or_else(|_| "[]".into()),
            row.criteria.to_string(),
            row.observed.to_string(),
            row.confidence,
            row.risk_level.as_str(),
            row.recommended_position,
            row.duration_ms as i64,
        ])
        .map_err(classify_sqlite)?;
        Ok(())
    }

    pub fn count_buy_evaluations(&self, address: &str) -> Result<u32, EngineError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare_cached("SELECT COUNT(*) FROM buy_evaluations WHERE token_address = ?1")
            .map_err(classify_sqlite)?;
        stmt.query_row(params![address], |row| row.get::<_, u32>(0))
            .map_err(classify_sqlite)
    }

    /// Bump the evaluation counter, returning the new value
    pub fn increment_buy_attempts(&self, address: &str) -> Result<u32, EngineError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare_cached(
                "UPDATE tokens SET buy_attempts = buy_attempts + 1 WHERE address = ?1 \
                 RETURNING buy_attempts",
            )
            .map_err(classify_sqlite)?;
        stmt.query_row(params![address], |row| row.get::<_, u32>(0))
            .map_err(classify_sqlite)
    }

    /// Single-upsert metadata application from the enrichment worker
    pub fn apply_metadata(&self, meta: &TokenMetadata) -> Result<(), EngineError> {
        let conn = self.conn()?;
        conn.prepare_cached(
            "UPDATE tokens SET symbol = ?2, name = ?3, decimals = ?4, \
             creator = COALESCE(?5, creator), \
             holder_count = COALESCE(?6, holder_count), \
             top10_concentration = COALESCE(?7, top10_concentration), \
             metadata_failed = 0 \
             WHERE address = ?1",
        )
        .map_err(classify_sqlite)?
        .execute(params![
            meta.address,
            meta.symbol,
            meta.name,
            meta.decimals,
            meta.creator,
            meta.holder_count,
            meta.top10_concentration,
        ])
        .map_err(classify_sqlite)?;
        Ok(())
    }

    pub fn mark_metadata_failed(&self, address: &str) -> Result<(), EngineError> {
        let conn = self.conn()?;
        conn.prepare_cached("UPDATE tokens SET metadata_failed = 1 WHERE address = ?1")
            .map_err(classify_sqlite)?
            .execute(params![address])
            .map_err(classify_sqlite)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // API call logs and cache
    // ------------------------------------------------------------------

    pub fn record_api_call(
        &self,
        provider: &str,
        endpoint: &str,
        status: Option<u16>,
        duration_ms: u64,
    ) -> Result<(), EngineError> {
        let conn = self.conn()?;
        conn.prepare_cached(
            "INSERT INTO api_call_logs (provider, endpoint, status, duration_ms, called_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .map_err(classify_sqlite)?
        .execute(params![provider, endpoint, status, duration_ms as i64, Utc::now()])
        .map_err(classify_sqlite)?;
        Ok(())
    }

    pub fn api_cache_put(&self, key: &str, payload: &str) -> Result<(), EngineError> {
        let conn = self.conn()?;
        conn.prepare_cached(
            "INSERT INTO api_cache (cache_key, payload, fetched_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(cache_key) DO UPDATE SET \
             payload = excluded.payload, fetched_at = excluded.fetched_at",
        )
        .map_err(classify_sqlite)?
        .execute(params![key, payload, Utc::now()])
        .map_err(classify_sqlite)?;
        Ok(())
    }

    /// Cached payload no older than `max_age_secs`
    pub fn api_cache_get(&self, key: &str, max_age_secs: i64) -> Result<Option<String>, EngineError> {
        let cutoff = Utc::now() - ChronoDuration::seconds(max_age_secs);
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare_cached(
                "SELECT payload FROM api_cache WHERE cache_key = ?1 AND fetched_at >= ?2",
            )
            .map_err(classify_sqlite)?;
        let mut rows = stmt
            .query_map(params![key, cutoff], |row| row.get::<_, String>(0))
            .map_err(classify_sqlite)?;
        match rows.next() {
            Some(Ok(payload)) => Ok(Some(payload)),
            Some(Err(e)) => Err(classify_sqlite(e)),
            None => Ok(None),
        }
    }

    // ------------------------------------------------------------------
    // SOL price history
    // ------------------------------------------------------------------

    pub fn record_sol_price(&self, price_usd: f64, source: &str) -> Result<(), EngineError> {
        let conn = self.conn()?;
        conn.prepare_cached(
            "INSERT INTO sol_price_history (price_usd, source, recorded_at) VALUES (?1, ?2, ?3)",
        )
        .map_err(classify_sqlite)?
        .execute(params![price_usd, source, Utc::now()])
        .map_err(classify_sqlite)?;
        Ok(())
    }

    /// Most recent SOL→USD reference, if any history exists
    pub fn latest_sol_price(&self) -> Result<Option<f64>, EngineError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare_cached("SELECT price_usd FROM sol_price_history ORDER BY id DESC LIMIT 1")
            .map_err(classify_sqlite)?;
        let mut rows = stmt
            .query_map([], |row| row.get::<_, f64>(0))
            .map_err(classify_sqlite)?;
        match rows.next() {
            Some(Ok(price)) => Ok(Some(price)),
            Some(Err(e)) => Err(classify_sqlite(e)),
            None => Ok(None),
        }
    }
}

/// Keep the max-slot record per `(token, time)` key, preserving first-seen
/// order of the surviving keys
fn dedup_prices(prices: &[PriceSample]) -> Vec<&PriceSample> {
    let mut best: std::collections::HashMap<(&str, DateTime<Utc>), &PriceSample> =
        std::collections::HashMap::new();
    let mut order: Vec<(&str, DateTime<Utc>)> = Vec::new();
    for price in prices {
        let key = (price.token_address.as_str(), price.time);
        match best.get(&key) {
            Some(existing) if existing.slot >= price.slot => {}
            Some(_) => {
                best.insert(key, price);
            }
            None => {
                best.insert(key, price);
                order.push(key);
            }
        }
    }
    order.into_iter().filter_map(|key| best.remove(&key)).collect()
}

/// Insert `LOADING...` rows for any referenced token that has no row yet;
/// returns the addresses inserted
fn insert_placeholders(
    tx: &rusqlite::Transaction<'_>,
    addresses: &HashSet<&str>,
    now: DateTime<Utc>,
) -> Result<Vec<String>, EngineError> {
    if addresses.is_empty() {
        return Ok(Vec::new());
    }

    let mut missing = Vec::new();
    for chunk in &addresses.iter().chunks(INSERT_CHUNK) {
        let chunk: Vec<&&str> = chunk.collect();
        let marks = vec!["?"; chunk.len()].join(",");
        let mut stmt = tx
            .prepare(&format!(
                "SELECT address FROM tokens WHERE address IN ({marks})"
            ))
            .map_err(classify_sqlite)?;
        let known: HashSet<String> = stmt
            .query_map(params_from_iter(chunk.iter().map(|a| **a)), |row| {
                row.get::<_, String>(0)
            })
            .map_err(classify_sqlite)?
            .filter_map(|r| r.ok())
            .collect();
        for address in chunk {
            if !known.contains(*address) {
                missing.push((**address).to_string());
            }
        }
    }

    for address in &missing {
        tx.prepare_cached(
            "INSERT INTO tokens (address, category_updated_at, discovered_at) \
             VALUES (?1, ?2, ?2) ON CONFLICT(address) DO NOTHING",
        )
        .map_err(classify_sqlite)?
        .execute(params![address, now])
        .map_err(classify_sqlite)?;
    }

    debug!(count = missing.len(), "placeholder token rows inserted");
    Ok(missing)
}

fn insert_token_stmt(conn: &Connection, token: &TokenRecord) -> Result<(), EngineError> {
    conn.prepare_cached(
        "INSERT INTO tokens \
         (address, symbol, name, decimals, creator, launch_signature, launch_slot, \
          current_price_sol, current_price_usd, market_cap, liquidity, volume_24h, \
          holder_count, top10_concentration, curve_progress, \
          safety_score, safety_checked_at, safety_flags, \
          category, previous_category, category_updated_at, category_scan_count, \
          aim_attempts, buy_attempts, price_update_count, last_price_update, \
          last_scan_at, discovered_at, metadata_failed) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, \
                 ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29) \
         ON CONFLICT(address) DO NOTHING",
    )
    .map_err(classify_sqlite)?
    .execute(params![
        token.address,
        token.symbol,
        token.name,
        token.decimals,
        token.creator,
        token.launch_signature,
        token.launch_slot.map(|s| s as i64),
        token.current_price_sol,
        token.current_price_usd,
        token.market_cap,
        token.liquidity,
        token.volume_24h,
        token.holder_count,
        token.top10_concentration,
        token.curve_progress,
        token.safety_score,
        token.safety_checked_at,
        serde_json::to_string(&token.safety_flags).unwrap_or_else(|_| "[]".into()),
        token.category.as_str(),
        token.previous_category.map(|c| c.as_str()),
        token.category_updated_at,
        token.category_scan_count,
        token.aim_attempts,
        token.buy_attempts,
        token.price_update_count as i64,
        token.last_price_update,
        token.last_scan_at,
        token.discovered_at,
        token.metadata_failed,
    ])
    .map_err(classify_sqlite)?;
    Ok(())
}

fn row_to_token(row: &rusqlite::Row<'_>) -> rusqlite::Result<TokenRecord> {
    let safety_flags: String = row.get("safety_flags")?;
    let category: String = row.get("category")?;
    let previous: Option<String> = row.get("previous_category")?;
    Ok(TokenRecord {
        address: row.get("address")?,
        symbol: row.get("symbol")?,
        name: row.get("name")?,
        decimals: row.get("decimals")?,
        creator: row.get("creator")?,
        launch_signature: row.get("launch_signature")?,
        launch_slot: row.get::<_, Option<i64>>("launch_slot")?.map(|s| s as u64),
        current_price_sol: row.get("current_price_sol")?,
        current_price_usd: row.get("current_price_usd")?,
        market_cap: row.get("market_cap")?,
        liquidity: row.get("liquidity")?,
        volume_24h: row.get("volume_24h")?,
        holder_count: row.get("holder_count")?,
        top10_concentration: row.get("top10_concentration")?,
        curve_progress: row.get("curve_progress")?,
        safety_score: row.get("safety_score")?,
        safety_checked_at: row.get("safety_checked_at")?,
        safety_flags: serde_json::from_str(&safety_flags).unwrap_or_default(),
        category: Category::parse(&category).unwrap_or(Category::New),
        previous_category: previous.as_deref().and_then(Category::parse),
        category_updated_at: row.get("category_updated_at")?,
        category_scan_count: row.get("category_scan_count")?,
        aim_attempts: row.get("aim_attempts")?,
        buy_attempts: row.get("buy_attempts")?,
        price_update_count: row.get::<_, i64>("price_update_count")? as u64,
        last_price_update: row.get("last_price_update")?,
        last_scan_at: row.get("last_scan_at")?,
        discovered_at: row.get("discovered_at")?,
        metadata_failed: row.get("metadata_failed")?,
    })
}

fn reason_from_tag(tag: &str) -> crate::types::TransitionReason {
    use crate::types::TransitionReason as R;
    match tag {
        "market_cap_change" => R::MarketCapChange,
        "market_cap_threshold" => R::MarketCapThreshold,
        "zero_market_cap" => R::ZeroMarketCap,
        "scan_limit" => R::ScanLimit,
        "duration_timeout" => R::DurationTimeout,
        "recovery" => R::Recovery,
        "buy_executed" => R::BuyExecuted,
        "manual_override" => R::ManualOverride(String::new()),
        _ => R::ForceArchive(String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store() -> (TempDir, Arc<Store>) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("test.db"), 4).unwrap();
        (dir, store)
    }

    fn sample_price(address: &str, time: DateTime<Utc>, slot: u64) -> PriceSample {
        PriceSample {
            token_address: address.to_string(),
            time,
            price_usd: 0.000032,
            price_sol: 0.00000018,
            virtual_sol_reserves: 30_000_000_000,
            virtual_token_reserves: 1_000_000_000_000_000,
            real_sol_reserves: 1_000_000_000,
            real_token_reserves: 700_000_000_000_000,
            market_cap: 32_000.0,
            liquidity_usd: 9_000.0,
            slot,
            source: "stream".to_string(),
        }
    }

    #[test]
    fn open_creates_schema() {
        let (_dir, store) = open_store();
        assert_eq!(store.flush_error_count(), 0);
        assert!(store.get_token("missing").unwrap().is_none());
    }

    #[test]
    fn flush_empty_batch_commits_nothing() {
        let (_dir, store) = open_store();
        let (counts, placeholders) = store.flush_batch(&[], &[], &[]).unwrap();
        assert_eq!(counts, FlushCounts::default());
        assert!(placeholders.is_empty());
    }

    #[test]
    fn flush_dedups_prices_keeping_max_slot() {
        let (_dir, store) = open_store();
        let t = Utc::now();
        let prices = vec![
            sample_price("mintA", t, 100),
            sample_price("mintA", t, 102),
            sample_price("mintA", t, 101),
        ];
        let (counts, placeholders) = store.flush_batch(&[], &prices, &[]).unwrap();
        assert_eq!(counts.prices, 1);
        assert_eq!(placeholders, vec!["mintA".to_string()]);

        let stored = store.recent_prices("mintA", 10).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].slot, 102);
    }

    #[test]
    fn flush_inserts_new_tokens_once() {
        let (_dir, store) = open_store();
        let token = NewToken {
            address: "mintB".into(),
            creator: Some("creator".into()),
            launch_signature: Some("sig".into()),
            launch_slot: Some(5),
            discovered_at: Utc::now(),
        };
        let (counts, _) = store
            .flush_batch(std::slice::from_ref(&token), &[], &[])
            .unwrap();
        assert_eq!(counts.new_tokens, 1);

        // second flush is conflict-ignored
        let (counts, _) = store.flush_batch(&[token], &[], &[]).unwrap();
        assert_eq!(counts.new_tokens, 0);
    }

    #[test]
    fn transactions_get_placeholder_rows() {
        let (_dir, store) = open_store();
        let record = TokenTransaction {
            signature: "sig1".into(),
            token_address: "mintC".into(),
            time: Utc::now(),
            kind: crate::types::TxKind::Buy,
            user_address: "user".into(),
            token_amount: 1_000.0,
            sol_amount: 0.5,
            price_sol: 0.0000005,
            price_usd: 0.0001,
            slot: 10,
            fee_lamports: 5_000,
        };
        let (counts, placeholders) = store.flush_batch(&[], &[], &[record]).unwrap();
        assert_eq!(counts.transactions, 1);
        assert_eq!(placeholders, vec!["mintC".to_string()]);

        let token = store.get_token("mintC").unwrap().unwrap();
        assert_eq!(token.symbol, "LOADING...");
    }

    #[test]
    fn transition_is_atomic_and_visible() {
        let (_dir, store) = open_store();
        let now = Utc::now();
        store
            .insert_token(&TokenRecord::placeholder("mintD", now))
            .unwrap();

        let transition = CategoryTransition {
            token_address: "mintD".into(),
            from_category: Category::New,
            to_category: Category::Aim,
            market_cap_at_transition: 36_000.0,
            reason: crate::types::TransitionReason::MarketCapChange,
            metadata: serde_json::json!({}),
            occurred_at: now,
        };
        store.apply_transition(&transition, 1).unwrap();

        let token = store.get_token("mintD").unwrap().unwrap();
        assert_eq!(token.category, Category::Aim);
        assert_eq!(token.previous_category, Some(Category::New));
        assert_eq!(token.category_scan_count, 0);
        assert_eq!(token.aim_attempts, 1);
        assert_eq!(token.market_cap, 36_000.0);

        let transitions = store.transitions_for("mintD").unwrap();
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].to_category, Category::Aim);
        assert_eq!(transitions[0].market_cap_at_transition, 36_000.0);
    }

    #[test]
    fn buy_attempts_increment_returns_new_value() {
        let (_dir, store) = open_store();
        store
            .insert_token(&TokenRecord::placeholder("mintE", Utc::now()))
            .unwrap();
        assert_eq!(store.increment_buy_attempts("mintE").unwrap(), 1);
        assert_eq!(store.increment_buy_attempts("mintE").unwrap(), 2);
    }

    #[test]
    fn load_active_tokens_filters_terminal_and_old() {
        let (_dir, store) = open_store();
        let now = Utc::now();

        let mut active = TokenRecord::placeholder("mintF", now);
        active.category = Category::Low;
        store.insert_token(&active).unwrap();

        let mut binned = TokenRecord::placeholder("mintG", now);
        binned.category = Category::Bin;
        store.insert_token(&binned).unwrap();

        let mut stale = TokenRecord::placeholder("mintH", now - ChronoDuration::days(30));
        stale.category = Category::Low;
        store.insert_token(&stale).unwrap();

        let loaded = store.load_active_tokens(7, 100, 0).unwrap();
        let addresses: Vec<&str> = loaded.iter().map(|t| t.address.as_str()).collect();
        assert!(addresses.contains(&"mintF"));
        assert!(!addresses.contains(&"mintG"));
        assert!(!addresses.contains(&"mintH"));
    }

    #[test]
    fn sol_price_history_round_trip() {
        let (_dir, store) = open_store();
        assert_eq!(store.latest_sol_price().unwrap(), None);
        store.record_sol_price(178.5, "pyth").unwrap();
        store.record_sol_price(181.25, "pyth").unwrap();
        assert_eq!(store.latest_sol_price().unwrap(), Some(181.25));
    }

    #[test]
    fn api_cache_respects_age() {
        let (_dir, store) = open_store();
        store.api_cache_put("k", "{\"v\":1}").unwrap();
        assert!(store.api_cache_get("k", 60).unwrap().is_some());
        assert!(store.api_cache_get("k", -1).unwrap().is_none());
        assert!(store.api_cache_get("missing", 60).unwrap().is_none());
    }

    #[test]
    fn metadata_apply_and_failure_flag() {
        let (_dir, store) = open_store();
        store
            .insert_token(&TokenRecord::placeholder("mintI", Utc::now()))
            .unwrap();

        store
            .apply_metadata(&TokenMetadata {
                address: "mintI".into(),
                symbol: "CURVE".into(),
                name: "Curve Token".into(),
                decimals: 6,
                creator: Some("creator".into()),
                holder_count: Some(120),
                top10_concentration: Some(18.5),
            })
            .unwrap();

        let token = store.get_token("mintI").unwrap().unwrap();
        assert_eq!(token.symbol, "CURVE");
        assert_eq!(token.holder_count, 120);
        assert!(!token.metadata_failed);

        store.mark_metadata_failed("mintI").unwrap();
        assert!(store.get_token("mintI").unwrap().unwrap().metadata_failed);
    }

    #[test]
    fn scan_log_round_trip() {
        let (_dir, store) = open_store();
        store
            .append_scan_log(&ScanLogEntry {
                token_address: "mintJ".into(),
                category: Category::Aim,
                scan_number: 3,
                duration_ms: 120,
                apis_used: vec!["market".into()],
                error: None,
                is_final: false,
                created_at: Utc::now(),
            })
            .unwrap();
    }
}
