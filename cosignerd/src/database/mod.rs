//! Database interface for the cosigner.
//!
//! Record the imported keys, wallets and PSBTs.

pub mod jsonfile;
pub mod memory;

use crate::locks::EntityId;

use std::{error, fmt};

use cosigner::descriptors::WalletJson;
use miniscript::bitcoin::bip32::Fingerprint;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseError {
    Io(String),
    /// An entry couldn't be read back.
    Corrupted { id: EntityId, reason: String },
}

impl fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "Database I/O error: {}", e),
            Self::Corrupted { id, reason } => write!(f, "Corrupted entry for {}: {}", id, reason),
        }
    }
}

impl error::Error for DatabaseError {}

impl From<std::io::Error> for DatabaseError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// An imported extended key. The fingerprint is computed at import time and checked against the
/// key when it is loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredKey {
    pub label: String,
    pub fingerprint: Fingerprint,
    /// The base58check serialization of the key.
    pub key: String,
}

/// An imported PSBT, stored in base64 as it was last updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredPsbt {
    pub name: String,
    pub psbt: String,
}

/// A stored entity, of any kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entity {
    Key(StoredKey),
    Wallet(WalletJson),
    Psbt(StoredPsbt),
}

impl Entity {
    pub fn id(&self) -> EntityId {
        match self {
            Self::Key(key) => EntityId::Key(key.label.clone()),
            Self::Wallet(wallet) => EntityId::Wallet(wallet.name.clone()),
            Self::Psbt(psbt) => EntityId::Psbt(psbt.name.clone()),
        }
    }
}

pub trait DatabaseInterface: Send + Sync {
    fn connection(&self) -> Box<dyn DatabaseConnection>;
}

pub trait DatabaseConnection {
    /// Get the key with this label, if any.
    fn key(&mut self, label: &str) -> Result<Option<StoredKey>, DatabaseError>;

    /// All the stored keys, ordered by label.
    fn keys(&mut self) -> Result<Vec<StoredKey>, DatabaseError>;

    fn wallet(&mut self, name: &str) -> Result<Option<WalletJson>, DatabaseError>;

    /// All the stored wallets, ordered by name.
    fn wallets(&mut self) -> Result<Vec<WalletJson>, DatabaseError>;

    fn psbt(&mut self, name: &str) -> Result<Option<StoredPsbt>, DatabaseError>;

    /// All the stored PSBTs, ordered by name.
    fn psbts(&mut self) -> Result<Vec<StoredPsbt>, DatabaseError>;

    /// Store this entity, replacing any existing one with the same identifier.
    fn store(&mut self, entity: &Entity) -> Result<(), DatabaseError>;

    /// Remove this entity. Returns `false` if it didn't exist.
    fn delete(&mut self, id: &EntityId) -> Result<bool, DatabaseError>;

    fn exists(&mut self, id: &EntityId) -> Result<bool, DatabaseError> {
        Ok(match id {
            EntityId::Key(label) => self.key(label)?.is_some(),
            EntityId::Wallet(name) => self.wallet(name)?.is_some(),
            EntityId::Psbt(name) => self.psbt(name)?.is_some(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cosigner::testutils::*;

    // Exercise a database implementation.
    pub fn sanity_check_db(db: &dyn DatabaseInterface) {
        let mut conn = db.connection();
        assert!(conn.keys().unwrap().is_empty());
        assert!(conn.wallets().unwrap().is_empty());
        assert!(conn.psbts().unwrap().is_empty());

        let bob = StoredKey {
            label: "bob".to_string(),
            fingerprint: "1f5e43d8".parse().unwrap(),
            key: BOB_TPRV.to_string(),
        };
        let alice = StoredKey {
            label: "alice".to_string(),
            fingerprint: "a2ebe04e".parse().unwrap(),
            key: ALICE_TPRV.to_string(),
        };
        conn.store(&Entity::Key(bob.clone())).unwrap();
        conn.store(&Entity::Key(alice.clone())).unwrap();
        assert_eq!(conn.key("alice").unwrap(), Some(alice.clone()));
        assert_eq!(conn.key("carol").unwrap(), None);
        assert_eq!(conn.keys().unwrap(), vec![alice.clone(), bob.clone()]);

        // A wallet can have the same name as a key.
        let wallet = WalletJson::from_json(WALLET_JSON).unwrap();
        conn.store(&Entity::Wallet(wallet.clone())).unwrap();
        let wallet_alice = WalletJson {
            name: "alice".to_string(),
            ..wallet.clone()
        };
        conn.store(&Entity::Wallet(wallet_alice.clone())).unwrap();
        assert_eq!(conn.wallet("alice-and-bob").unwrap(), Some(wallet.clone()));
        assert_eq!(
            conn.wallets().unwrap(),
            vec![wallet_alice.clone(), wallet.clone()]
        );
        assert!(conn.exists(&EntityId::Wallet("alice".to_string())).unwrap());
        assert!(conn.exists(&EntityId::Key("alice".to_string())).unwrap());
        assert!(!conn.exists(&EntityId::Psbt("alice".to_string())).unwrap());

        // Storing again replaces the entry. Changes are visible from other connections.
        let mut psbt = StoredPsbt {
            name: "to-carol".to_string(),
            psbt: SAMPLE_PSBT.to_string(),
        };
        conn.store(&Entity::Psbt(psbt.clone())).unwrap();
        psbt.psbt = "cHNidP8=".to_string();
        conn.store(&Entity::Psbt(psbt.clone())).unwrap();
        assert_eq!(db.connection().psbt("to-carol").unwrap(), Some(psbt.clone()));
        assert_eq!(db.connection().psbts().unwrap(), vec![psbt.clone()]);

        assert!(conn.delete(&EntityId::Key("alice".to_string())).unwrap());
        assert!(!conn.delete(&EntityId::Key("alice".to_string())).unwrap());
        assert_eq!(conn.keys().unwrap(), vec![bob]);
        assert!(conn.exists(&EntityId::Wallet("alice".to_string())).unwrap());
        assert!(conn.delete(&Entity::Psbt(psbt).id()).unwrap());
        assert!(db.connection().psbts().unwrap().is_empty());
    }
}
