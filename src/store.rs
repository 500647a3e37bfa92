//! Durable storage for in-flight trades. A crash or restart must never
//! orphan a half-executed pair, so the engine rewrites the full set of
//! processing trades on every add and remove.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::pricing::ArbitrageSnapshot;

const PROCESSING_TRADES_KEY: &str = "processing_arbitrage_pairs";

/// One in-flight trade as written to disk: the launch-time snapshot plus its
/// magic number. Tracking state (fills, retries) is rebuilt from venue order
/// history on restore.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedTrade {
    pub magic_number: String,
    pub snapshot: ArbitrageSnapshot,
}

pub trait TradeStore: Send + Sync {
    /// Replace the stored set wholesale.
    fn save_all(&self, trades: &[PersistedTrade]) -> Result<()>;

    fn load_all(&self) -> Result<Vec<PersistedTrade>>;

    fn clear(&self) -> Result<()>;
}

/// SQLite-backed store. A single-row key/value table is enough: the unit of
/// persistence is the whole processing set, not individual trades.
pub struct SqliteTradeStore {
    conn: Mutex<Connection>,
}

impl SqliteTradeStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("opening trade store at {}", path.as_ref().display()))?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv_store (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;

        info!(path = %path.as_ref().display(), "trade store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl TradeStore for SqliteTradeStore {
    fn save_all(&self, trades: &[PersistedTrade]) -> Result<()> {
        let value = serde_json::to_string(trades).context("serializing processing trades")?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO kv_store (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = ?3",
            rusqlite::params![PROCESSING_TRADES_KEY, value, crate::models::now_ms()],
        )?;
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<PersistedTrade>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT value FROM kv_store WHERE key = ?1")?;
        let mut rows = stmt.query([PROCESSING_TRADES_KEY])?;

        match rows.next()? {
            Some(row) => {
                let value: String = row.get(0)?;
                serde_json::from_str(&value).context("deserializing processing trades")
            }
            None => Ok(Vec::new()),
        }
    }

    fn clear(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM kv_store WHERE key = ?1",
            [PROCESSING_TRADES_KEY],
        )?;
        Ok(())
    }
}

/// Volatile store for tests and dry runs.
#[derive(Default)]
pub struct MemoryTradeStore {
    trades: Mutex<Vec<PersistedTrade>>,
}

impl MemoryTradeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TradeStore for MemoryTradeStore {
    fn save_all(&self, trades: &[PersistedTrade]) -> Result<()> {
        *self.trades.lock() = trades.to_vec();
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<PersistedTrade>> {
        Ok(self.trades.lock().clone())
    }

    fn clear(&self) -> Result<()> {
        self.trades.lock().clear();
        Ok(())
    }
}
