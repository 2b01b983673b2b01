// ============================================================================
// Ledger - Ownership Records (redb)
// ============================================================================
// Persistent mapping NFT mint -> verified owner, plus the update cursor,
// cached invite links and removals waiting to be retried.
// Default path: ~/.mintgate/ledger.redb (override via MINTGATE_DB_PATH env var)
// ============================================================================

pub mod types;

pub use types::{LedgerStats, OwnershipRecord};

use anyhow::{anyhow, Result};
use redb::{Database, ReadableTable, TableDefinition};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

// Table definitions
const OWNERSHIP: TableDefinition<&str, &[u8]> = TableDefinition::new("ownership");
const META: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

const MINT_PREFIX: &str = "mint:";
const CURSOR_KEY: &str = "main:update-id";
const INVITE_PREFIX: &str = "main:invite-id:";
const PENDING_REVOKE_PREFIX: &str = "main:pending-revoke:";

/// Ownership ledger shared by the dispatcher and the watchdog.
/// Every operation runs in its own redb transaction.
pub struct Ledger {
    db: Database,
    path: Option<PathBuf>,
}

impl Ledger {
    /// Open (or create) the ledger at the given path.
    /// If `path` is None, uses MINTGATE_DB_PATH env var or ~/.mintgate/ledger.redb
    pub fn open(path: Option<&str>) -> Result<Self> {
        let db_path = if let Some(p) = path {
            PathBuf::from(p)
        } else if let Ok(env_path) = std::env::var("MINTGATE_DB_PATH") {
            PathBuf::from(env_path)
        } else {
            let home = dirs::home_dir().ok_or_else(|| anyhow!("Cannot determine home directory"))?;
            let gate_dir = home.join(".mintgate");
            std::fs::create_dir_all(&gate_dir)
                .map_err(|e| anyhow!("Failed to create .mintgate directory: {}", e))?;
            gate_dir.join("ledger.redb")
        };

        info!("Opening ledger at: {}", db_path.display());

        let db = Database::create(&db_path)
            .map_err(|e| anyhow!("Failed to open ledger: {}", e))?;

        Self::init(db, Some(db_path))
    }

    /// Ledger backed by memory only; nothing survives the process
    pub fn in_memory() -> Result<Self> {
        let db = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .map_err(|e| anyhow!("Failed to create in-memory ledger: {}", e))?;

        Self::init(db, None)
    }

    fn init(db: Database, path: Option<PathBuf>) -> Result<Self> {
        // Ensure tables exist by doing a write transaction
        let write_txn = db
            .begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        {
            let _ = write_txn.open_table(OWNERSHIP).map_err(|e| anyhow!("Failed to create ownership table: {}", e))?;
            let _ = write_txn.open_table(META).map_err(|e| anyhow!("Failed to create meta table: {}", e))?;
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit init: {}", e))?;

        debug!("Ledger ready");

        Ok(Self { db, path })
    }

    /// Database file path (None for in-memory ledgers)
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    // ========================================================================
    // Ownership Operations
    // ========================================================================

    pub fn get(&self, mint: &str) -> Result<Option<OwnershipRecord>> {
        let key = format!("{}{}", MINT_PREFIX, mint);

        let read_txn = self.db.begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn.open_table(OWNERSHIP)
            .map_err(|e| anyhow!("Failed to open ownership table: {}", e))?;

        let value = table.get(key.as_str())
            .map_err(|e| anyhow!("Failed to get record: {}", e))?;
        value.map(|v| decode(v.value())).transpose()
    }

    pub fn set(&self, mint: &str, wallet: &str, user: i64) -> Result<()> {
        self.replace(mint, wallet, user).map(|_| ())
    }

    /// Write the record and return whatever it overwrote, in one transaction
    pub fn replace(&self, mint: &str, wallet: &str, user: i64) -> Result<Option<OwnershipRecord>> {
        let key = format!("{}{}", MINT_PREFIX, mint);
        let record = OwnershipRecord::new(wallet, user);
        let value = bincode::serialize(&record)
            .map_err(|e| anyhow!("Failed to serialize record: {}", e))?;

        let write_txn = self.db.begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        let previous;
        {
            let mut table = write_txn.open_table(OWNERSHIP)
                .map_err(|e| anyhow!("Failed to open ownership table: {}", e))?;
            previous = match table.insert(key.as_str(), value.as_slice())
                .map_err(|e| anyhow!("Failed to insert record: {}", e))?
            {
                Some(old) => Some(decode(old.value())?),
                None => None,
            };
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit: {}", e))?;

        debug!("Recorded {} -> user {} ({})", mint, user, wallet);
        Ok(previous)
    }

    pub fn delete(&self, mint: &str) -> Result<bool> {
        let key = format!("{}{}", MINT_PREFIX, mint);

        let write_txn = self.db.begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        let removed;
        {
            let mut table = write_txn.open_table(OWNERSHIP)
                .map_err(|e| anyhow!("Failed to open ownership table: {}", e))?;
            removed = table.remove(key.as_str())
                .map_err(|e| anyhow!("Failed to remove record: {}", e))?
                .is_some();
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit delete: {}", e))?;

        if removed {
            debug!("Deleted record for mint: {}", mint);
        }
        Ok(removed)
    }

    /// Remove the record of `mint` only if it is still exactly `expected`.
    /// Returns false when the record changed or is gone.
    pub fn delete_if(&self, mint: &str, expected: &OwnershipRecord) -> Result<bool> {
        let key = format!("{}{}", MINT_PREFIX, mint);

        let write_txn = self.db.begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        let removed;
        {
            let mut table = write_txn.open_table(OWNERSHIP)
                .map_err(|e| anyhow!("Failed to open ownership table: {}", e))?;
            let unchanged = match table.get(key.as_str())
                .map_err(|e| anyhow!("Failed to get record: {}", e))?
            {
                Some(current) => decode(current.value())? == *expected,
                None => false,
            };
            removed = unchanged
                && table.remove(key.as_str())
                    .map_err(|e| anyhow!("Failed to remove record: {}", e))?
                    .is_some();
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit delete: {}", e))?;

        if removed {
            debug!("Deleted record for mint: {}", mint);
        } else {
            debug!("Record for {} changed, not deleted", mint);
        }
        Ok(removed)
    }

    /// Snapshot of every ownership record, keyed by mint
    pub fn list_all(&self) -> Result<BTreeMap<String, OwnershipRecord>> {
        let read_txn = self.db.begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn.open_table(OWNERSHIP)
            .map_err(|e| anyhow!("Failed to open ownership table: {}", e))?;

        let mut results = BTreeMap::new();
        let iter = table.range::<&str>(MINT_PREFIX..)
            .map_err(|e| anyhow!("Failed to iterate records: {}", e))?;
        for entry in iter {
            let (key, value) = entry.map_err(|e| anyhow!("Failed to read entry: {}", e))?;
            let Some(mint) = key.value().strip_prefix(MINT_PREFIX) else {
                break;
            };
            results.insert(mint.to_string(), decode(value.value())?);
        }
        Ok(results)
    }

    // ========================================================================
    // Metadata Operations
    // ========================================================================

    /// Last processed inbound event id
    pub fn cursor(&self) -> Result<Option<i64>> {
        match self.get_meta(CURSOR_KEY)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| anyhow!("Corrupt cursor value ({} bytes)", bytes.len()))?;
                Ok(Some(i64::from_le_bytes(raw)))
            }
            None => Ok(None),
        }
    }

    pub fn set_cursor(&self, update_id: i64) -> Result<()> {
        self.put_meta(CURSOR_KEY, &update_id.to_le_bytes())
    }

    pub fn cached_invite(&self, collection_id: &str) -> Result<Option<String>> {
        let key = format!("{}{}", INVITE_PREFIX, collection_id);
        match self.get_meta(&key)? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|e| anyhow!("Corrupt invite link for {}: {}", collection_id, e)),
            None => Ok(None),
        }
    }

    pub fn cache_invite(&self, collection_id: &str, link: &str) -> Result<()> {
        let key = format!("{}{}", INVITE_PREFIX, collection_id);
        self.put_meta(&key, link.as_bytes())
    }

    /// Remember a removal that could not be carried out
    pub fn defer_revocation(&self, collection_id: &str, user: i64) -> Result<()> {
        let key = format!("{}{}:{}", PENDING_REVOKE_PREFIX, collection_id, user);
        self.put_meta(&key, &[])
    }

    pub fn clear_revocation(&self, collection_id: &str, user: i64) -> Result<()> {
        let key = format!("{}{}:{}", PENDING_REVOKE_PREFIX, collection_id, user);
        let write_txn = self.db.begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        {
            let mut table = write_txn.open_table(META)
                .map_err(|e| anyhow!("Failed to open meta table: {}", e))?;
            table.remove(key.as_str())
                .map_err(|e| anyhow!("Failed to remove {}: {}", key, e))?;
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit: {}", e))?;
        Ok(())
    }

    /// Deferred removals as (collection id, user)
    pub fn pending_revocations(&self) -> Result<Vec<(String, i64)>> {
        let read_txn = self.db.begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn.open_table(META)
            .map_err(|e| anyhow!("Failed to open meta table: {}", e))?;

        let mut pending = Vec::new();
        let iter = table.range::<&str>(PENDING_REVOKE_PREFIX..)
            .map_err(|e| anyhow!("Failed to iterate pending revocations: {}", e))?;
        for entry in iter {
            let (key, _) = entry.map_err(|e| anyhow!("Failed to read entry: {}", e))?;
            let Some(rest) = key.value().strip_prefix(PENDING_REVOKE_PREFIX) else {
                break;
            };
            let parsed = rest
                .rsplit_once(':')
                .and_then(|(collection, user)| Some((collection.to_string(), user.parse().ok()?)));
            match parsed {
                Some(item) => pending.push(item),
                None => warn!("Ignoring malformed pending revocation key {}", key.value()),
            }
        }
        Ok(pending)
    }

    fn get_meta(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn.open_table(META)
            .map_err(|e| anyhow!("Failed to open meta table: {}", e))?;

        let value = table.get(key).map_err(|e| anyhow!("Failed to get {}: {}", key, e))?;
        Ok(value.map(|v| v.value().to_vec()))
    }

    fn put_meta(&self, key: &str, value: &[u8]) -> Result<()> {
        let write_txn = self.db.begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        {
            let mut table = write_txn.open_table(META)
                .map_err(|e| anyhow!("Failed to open meta table: {}", e))?;
            table.insert(key, value)
                .map_err(|e| anyhow!("Failed to insert {}: {}", key, e))?;
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit: {}", e))?;
        Ok(())
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    pub fn stats(&self) -> Result<LedgerStats> {
        let records = self.list_all()?;
        let users: HashSet<i64> = records.values().map(|r| r.user).collect();
        let wallets: HashSet<&str> = records.values().map(|r| r.wallet.as_str()).collect();

        Ok(LedgerStats {
            total_records: records.len(),
            distinct_users: users.len(),
            distinct_wallets: wallets.len(),
            cursor: self.cursor()?,
        })
    }
}

fn decode(bytes: &[u8]) -> Result<OwnershipRecord> {
    bincode::deserialize(bytes).map_err(|e| anyhow!("Failed to deserialize record: {}", e))
}
