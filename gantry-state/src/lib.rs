//! Live state cache shared by the trading and supervisor processes.
//!
//! A small key-value store of versioned values. Merges apply
//! monotonic-timestamp ordering: a write whose timestamp is not strictly
//! newer than the stored one (with `version` as the tie-breaker) is
//! dropped, so a stale REST response can never overwrite a fresher
//! streamed event.
//!
//! Two backends share one API: an LMDB environment for the real system
//! (both processes map the same file, which is how supervisor authority
//! survives a wedged trading process) and a plain in-memory map for tests.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use gantry_core::{EquityPoint, HaltFlag, Heartbeat, Order, Position, ProcessRole, Regime};
use heed::types::{SerdeJson, Str};
use heed::{Database, Env, EnvOpenOptions};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Map size reserved for the LMDB environment (1 GiB).
const MAP_SIZE_BYTES: usize = 1024 * 1024 * 1024;
const STATE_DB: &str = "live_state";

/// Well-known keys. Per-entity keys are `positions/{symbol}`,
/// `orders/{order_id}`, `heartbeats/{role}`.
pub const KEY_EQUITY: &str = "equity";
pub const KEY_REGIME: &str = "regime";
pub const KEY_HALT: &str = "halt";

pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state backend failure: {0}")]
    Backend(String),
    #[error("stored value for {key} could not be decoded: {source}")]
    Decode {
        key: String,
        source: serde_json::Error,
    },
    #[error("state I/O failure: {0}")]
    Io(#[from] std::io::Error),
}

impl From<heed::Error> for StateError {
    fn from(err: heed::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Value wrapper carrying the writer's logical timestamp and a version
/// tie-breaker.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Versioned<T> {
    pub ts: DateTime<Utc>,
    pub version: u64,
    pub data: T,
}

enum Backend {
    Lmdb {
        env: Env,
        db: Database<Str, SerdeJson<Versioned<serde_json::Value>>>,
    },
    Memory(RwLock<HashMap<String, Versioned<serde_json::Value>>>),
}

/// The cache handle. Cheap to clone.
#[derive(Clone)]
pub struct StateCache {
    backend: Arc<Backend>,
    version_counter: Arc<AtomicU64>,
}

impl StateCache {
    /// Open (or create) an LMDB-backed cache at `path` (a directory).
    pub fn open(path: impl AsRef<Path>) -> StateResult<Self> {
        let path = path.as_ref();
        fs::create_dir_all(path)?;
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(MAP_SIZE_BYTES)
                .max_dbs(4)
                .open(path)
        }?;
        let mut wtxn = env.write_txn()?;
        let db = env.create_database(&mut wtxn, Some(STATE_DB))?;
        wtxn.commit()?;
        Ok(Self {
            backend: Arc::new(Backend::Lmdb { env, db }),
            version_counter: Arc::new(AtomicU64::new(1)),
        })
    }

    /// Purely in-memory cache for tests and ephemeral tooling.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            backend: Arc::new(Backend::Memory(RwLock::new(HashMap::new()))),
            version_counter: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Merge a raw write. Returns whether the write was applied.
    ///
    /// Applied iff `ts > stored.ts`, or `ts == stored.ts` and
    /// `version > stored.version`.
    pub fn put_raw(
        &self,
        key: &str,
        value: Versioned<serde_json::Value>,
    ) -> StateResult<bool> {
        match self.backend.as_ref() {
            Backend::Lmdb { env, db } => {
                let mut wtxn = env.write_txn()?;
                let apply = match db.get(&wtxn, key)? {
                    Some(stored) => newer(&value, &stored),
                    None => true,
                };
                if apply {
                    db.put(&mut wtxn, key, &value)?;
                    wtxn.commit()?;
                } else {
                    debug!(key, "dropped stale state write");
                }
                Ok(apply)
            }
            Backend::Memory(map) => {
                let mut map = map.write();
                let apply = match map.get(key) {
                    Some(stored) => newer(&value, stored),
                    None => true,
                };
                if apply {
                    map.insert(key.to_string(), value);
                } else {
                    debug!(key, "dropped stale state write");
                }
                Ok(apply)
            }
        }
    }

    /// Read a raw value.
    pub fn get_raw(&self, key: &str) -> StateResult<Option<Versioned<serde_json::Value>>> {
        match self.backend.as_ref() {
            Backend::Lmdb { env, db } => {
                let rtxn = env.read_txn()?;
                Ok(db.get(&rtxn, key)?)
            }
            Backend::Memory(map) => Ok(map.read().get(key).cloned()),
        }
    }

    /// Remove a key, honoring the same ordering rule as writes.
    pub fn remove(&self, key: &str, ts: DateTime<Utc>) -> StateResult<bool> {
        match self.backend.as_ref() {
            Backend::Lmdb { env, db } => {
                let mut wtxn = env.write_txn()?;
                let apply = match db.get(&wtxn, key)? {
                    Some(stored) => ts >= stored.ts,
                    None => false,
                };
                if apply {
                    db.delete(&mut wtxn, key)?;
                    wtxn.commit()?;
                }
                Ok(apply)
            }
            Backend::Memory(map) => {
                let mut map = map.write();
                let apply = map.get(key).is_some_and(|stored| ts >= stored.ts);
                if apply {
                    map.remove(key);
                }
                Ok(apply)
            }
        }
    }

    /// All entries whose key starts with `prefix`.
    pub fn scan_prefix(
        &self,
        prefix: &str,
    ) -> StateResult<Vec<(String, Versioned<serde_json::Value>)>> {
        match self.backend.as_ref() {
            Backend::Lmdb { env, db } => {
                let rtxn = env.read_txn()?;
                let mut out = Vec::new();
                for entry in db.prefix_iter(&rtxn, prefix)? {
                    let (key, value) = entry?;
                    out.push((key.to_string(), value));
                }
                Ok(out)
            }
            Backend::Memory(map) => Ok(map
                .read()
                .iter()
                .filter(|(key, _)| key.starts_with(prefix))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect()),
        }
    }

    fn put_typed<T: Serialize>(&self, key: &str, ts: DateTime<Utc>, data: &T) -> StateResult<bool> {
        let value = Versioned {
            ts,
            version: self.version_counter.fetch_add(1, Ordering::Relaxed),
            data: serde_json::to_value(data).map_err(|source| StateError::Decode {
                key: key.to_string(),
                source,
            })?,
        };
        self.put_raw(key, value)
    }

    fn get_typed<T: DeserializeOwned>(&self, key: &str) -> StateResult<Option<Versioned<T>>> {
        let Some(raw) = self.get_raw(key)? else {
            return Ok(None);
        };
        let data = serde_json::from_value(raw.data).map_err(|source| StateError::Decode {
            key: key.to_string(),
            source,
        })?;
        Ok(Some(Versioned {
            ts: raw.ts,
            version: raw.version,
            data,
        }))
    }

    // ------------------------------------------------------------------
    // Typed views over the well-known key families.
    // ------------------------------------------------------------------

    pub fn set_position(&self, position: &Position) -> StateResult<bool> {
        let key = format!("positions/{}", position.symbol);
        self.put_typed(&key, position.updated_at, position)
    }

    pub fn position(&self, symbol: &str) -> StateResult<Option<Position>> {
        Ok(self
            .get_typed::<Position>(&format!("positions/{symbol}"))?
            .map(|v| v.data))
    }

    pub fn positions(&self) -> StateResult<Vec<Position>> {
        let mut out = Vec::new();
        for (key, value) in self.scan_prefix("positions/")? {
            let position =
                serde_json::from_value(value.data).map_err(|source| StateError::Decode {
                    key,
                    source,
                })?;
            out.push(position);
        }
        Ok(out)
    }

    pub fn set_order(&self, order: &Order) -> StateResult<bool> {
        let key = format!("orders/{}", order.order_id);
        if order.is_terminal() {
            // Terminal orders live in the journal and analytical store; the
            // cache only tracks working state.
            return self.remove(&key, order.updated_at);
        }
        self.put_typed(&key, order.updated_at, order)
    }

    pub fn open_orders(&self) -> StateResult<Vec<Order>> {
        let mut out = Vec::new();
        for (key, value) in self.scan_prefix("orders/")? {
            let order = serde_json::from_value(value.data)
                .map_err(|source| StateError::Decode { key, source })?;
            out.push(order);
        }
        Ok(out)
    }

    pub fn set_equity(&self, point: &EquityPoint) -> StateResult<bool> {
        self.put_typed(KEY_EQUITY, point.ts, point)
    }

    pub fn equity(&self) -> StateResult<Option<EquityPoint>> {
        Ok(self.get_typed::<EquityPoint>(KEY_EQUITY)?.map(|v| v.data))
    }

    pub fn set_regime(&self, regime: &Regime) -> StateResult<bool> {
        self.put_typed(KEY_REGIME, regime.detected_at, regime)
    }

    pub fn regime(&self) -> StateResult<Option<Regime>> {
        Ok(self.get_typed::<Regime>(KEY_REGIME)?.map(|v| v.data))
    }

    /// Raise or clear the halt flag. Clearing is an operator action; the
    /// flag otherwise persists across restarts of either process.
    pub fn set_halt(&self, halt: &HaltFlag) -> StateResult<bool> {
        let ts = halt.set_at.unwrap_or_else(Utc::now);
        self.put_typed(KEY_HALT, ts, halt)
    }

    pub fn halt(&self) -> StateResult<HaltFlag> {
        Ok(self
            .get_typed::<HaltFlag>(KEY_HALT)?
            .map(|v| v.data)
            .unwrap_or_default())
    }

    pub fn set_heartbeat(&self, heartbeat: &Heartbeat) -> StateResult<bool> {
        let key = format!("heartbeats/{}", heartbeat.role.as_str());
        self.put_typed(&key, heartbeat.ts, heartbeat)
    }

    pub fn heartbeat(&self, role: ProcessRole) -> StateResult<Option<Heartbeat>> {
        Ok(self
            .get_typed::<Heartbeat>(&format!("heartbeats/{}", role.as_str()))?
            .map(|v| v.data))
    }
}

fn newer<T>(candidate: &Versioned<T>, stored: &Versioned<T>) -> bool {
    candidate.ts > stored.ts || (candidate.ts == stored.ts && candidate.version > stored.version)
}
