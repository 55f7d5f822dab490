//! Change ledger: per model, the fingerprint of the dataset it was last
//! trained on and the one before that.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::transaction::{abort, TransactionError};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

const TREE: &str = "dataset_fingerprints";

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger store error")]
    Store(#[from] sled::Error),
    #[error("ledger entry for model `{0}` already exists")]
    AlreadyExists(String),
    #[error("no ledger entry for model `{0}`")]
    NotFound(String),
    #[error("ledger entry for model `{model}` moved on: expected current hash {expected}, found {found}")]
    Conflict { model: String, expected: String, found: String },
    #[error("ledger codec error")]
    Codec(#[from] serde_json::Error),
    #[error("corrupt ledger key: {0}")]
    CorruptKey(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub current_hash: String,
    pub previous_hash: String,
    pub updated_at: DateTime<Utc>,
}

pub trait ChangeLedger: Send + Sync {
    fn fetch_all(&self) -> Result<HashMap<String, LedgerEntry>, LedgerError>;
    /// Create an entry with current and previous set to `hash`. Fails if present.
    fn insert(&self, model: &str, hash: &str) -> Result<(), LedgerError>;
    /// Move an existing entry to `new_hash`, recording `old_hash` as previous.
    /// Fails if absent or if the stored current hash is no longer `old_hash`.
    fn update(&self, model: &str, new_hash: &str, old_hash: &str) -> Result<(), LedgerError>;
}

/// Ledger backed by an embedded sled tree. Every write is a single sled
/// transaction followed by a flush.
#[derive(Clone)]
pub struct SledLedger {
    db: sled::Db,
    tree: sled::Tree,
}

impl SledLedger {
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        let db = sled::open(path)?;
        let ledger = Self::from_db(db)?;
        info!(path=%path.display(), entries=ledger.tree.len(), "ledger opened");
        Ok(ledger)
    }

    /// In-memory ledger, discarded on drop.
    pub fn temporary() -> Result<Self, LedgerError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: sled::Db) -> Result<Self, LedgerError> {
        let tree = db.open_tree(TREE)?;
        Ok(Self { db, tree })
    }

    pub fn get(&self, model: &str) -> Result<Option<LedgerEntry>, LedgerError> {
        match self.tree.get(model.as_bytes())? {
            Some(v) => Ok(Some(serde_json::from_slice(&v)?)),
            None => Ok(None),
        }
    }

    pub fn flush(&self) -> Result<(), LedgerError> {
        self.db.flush()?;
        Ok(())
    }
}

fn unwrap_tx<T>(res: Result<T, TransactionError<LedgerError>>) -> Result<T, LedgerError> {
    res.map_err(|e| match e {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => LedgerError::Store(e),
    })
}

impl ChangeLedger for SledLedger {
    fn fetch_all(&self) -> Result<HashMap<String, LedgerEntry>, LedgerError> {
        let mut out = HashMap::new();
        for kv in self.tree.iter() {
            let (k, v) = kv?;
            let model = std::str::from_utf8(&k).map_err(|_| LedgerError::CorruptKey(format!("{:?}", k.as_ref())))?;
            out.insert(model.to_string(), serde_json::from_slice(&v)?);
        }
        Ok(out)
    }

    fn insert(&self, model: &str, hash: &str) -> Result<(), LedgerError> {
        let entry = LedgerEntry { current_hash: hash.to_string(), previous_hash: hash.to_string(), updated_at: Utc::now() };
        let value = serde_json::to_vec(&entry)?;
        unwrap_tx(self.tree.transaction(|tx| {
            if tx.get(model.as_bytes())?.is_some() { return abort(LedgerError::AlreadyExists(model.to_string())); }
            tx.insert(model.as_bytes(), value.clone())?;
            Ok(())
        }))?;
        self.tree.flush()?;
        debug!(model, hash, "ledger entry inserted");
        Ok(())
    }

    fn update(&self, model: &str, new_hash: &str, old_hash: &str) -> Result<(), LedgerError> {
        let entry = LedgerEntry { current_hash: new_hash.to_string(), previous_hash: old_hash.to_string(), updated_at: Utc::now() };
        let value = serde_json::to_vec(&entry)?;
        unwrap_tx(self.tree.transaction(|tx| {
            let existing = match tx.get(model.as_bytes())? {
                Some(v) => v,
                None => return abort(LedgerError::NotFound(model.to_string())),
            };
            let existing: LedgerEntry = match serde_json::from_slice(&existing) {
                Ok(e) => e,
                Err(e) => return abort(LedgerError::Codec(e)),
            };
            if existing.current_hash != old_hash {
                return abort(LedgerError::Conflict { model: model.to_string(), expected: old_hash.to_string(), found: existing.current_hash });
            }
            tx.insert(model.as_bytes(), value.clone())?;
            Ok(())
        }))?;
        self.tree.flush()?;
        debug!(model, new_hash, old_hash, "ledger entry updated");
        Ok(())
    }
}
