//! ============================================================================
//! Asset Directory - Static collection definitions
//! ============================================================================
//! Maps every qualifying NFT mint to the collection that owns it, and every
//! collection to its private group and invite link. Loaded once at startup
//! from `collections.json`; immutable afterwards.
//!
//! ```json
//! {
//!   "alpha": {
//!     "name": "Alpha",
//!     "mints": ["<mint pubkey>", "..."],
//!     "chatId": -1001234567890,
//!     "inviteLink": "https://t.me/+abcdef"
//!   }
//! }
//! ```
//! ============================================================================

use anyhow::{anyhow, bail, Result};
use serde::Deserialize;
use solana_sdk::pubkey::Pubkey;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::str::FromStr;
use tracing::info;

use crate::types::ChatId;

/// A named set of qualifying NFTs sharing one private group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collection {
    pub id: String,
    pub name: String,
    pub chat_id: ChatId,
    /// Invite link from the config file; None means one is created on demand
    pub invite_link: Option<String>,
    pub mints: BTreeSet<String>,
}

/// On-disk shape of one collection entry
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CollectionEntry {
    name: String,
    mints: Vec<String>,
    chat_id: ChatId,
    #[serde(default)]
    invite_link: Option<String>,
}

/// Read-only lookup tables built from the collection definitions
#[derive(Debug, Clone)]
pub struct AssetDirectory {
    collections: BTreeMap<String, Collection>,
    by_mint: HashMap<String, String>,
}

impl AssetDirectory {
    /// Load the directory from a JSON file. Any problem here is fatal.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("Failed to read {}: {}", path.display(), e))?;
        let directory = Self::from_json(&raw)?;

        info!(
            "Loaded {} collections ({} mints) from {}",
            directory.collections.len(),
            directory.by_mint.len(),
            path.display()
        );
        Ok(directory)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let entries: BTreeMap<String, CollectionEntry> = serde_json::from_str(raw)
            .map_err(|e| anyhow!("Invalid collections file: {}", e))?;

        let collections = entries
            .into_iter()
            .map(|(id, entry)| Collection {
                id,
                name: entry.name,
                chat_id: entry.chat_id,
                invite_link: entry.invite_link.filter(|link| !link.trim().is_empty()),
                mints: entry.mints.into_iter().collect(),
            })
            .collect();

        Self::from_collections(collections)
    }

    /// Build the directory, enforcing that every mint is a valid pubkey and
    /// belongs to exactly one collection
    pub fn from_collections(collections: Vec<Collection>) -> Result<Self> {
        if collections.is_empty() {
            bail!("No collections defined");
        }

        let mut by_id = BTreeMap::new();
        let mut by_mint: HashMap<String, String> = HashMap::new();

        for collection in collections {
            if collection.mints.is_empty() {
                bail!("Collection '{}' has no mints", collection.id);
            }
            for mint in &collection.mints {
                Pubkey::from_str(mint)
                    .map_err(|e| anyhow!("Collection '{}' lists invalid mint {}: {}", collection.id, mint, e))?;
                if let Some(owner) = by_mint.insert(mint.clone(), collection.id.clone()) {
                    bail!(
                        "Mint {} is listed in both '{}' and '{}'",
                        mint,
                        owner,
                        collection.id
                    );
                }
            }
            if by_id.contains_key(&collection.id) {
                bail!("Duplicate collection id '{}'", collection.id);
            }
            by_id.insert(collection.id.clone(), collection);
        }

        Ok(Self {
            collections: by_id,
            by_mint,
        })
    }

    pub fn collection(&self, id: &str) -> Option<&Collection> {
        self.collections.get(id)
    }

    /// Collection that owns the given mint
    pub fn collection_of(&self, mint: &str) -> Option<&Collection> {
        self.by_mint
            .get(mint)
            .and_then(|id| self.collections.get(id))
    }

    pub fn collections(&self) -> impl Iterator<Item = &Collection> {
        self.collections.values()
    }

    pub fn len(&self) -> usize {
        self.collections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }
}
