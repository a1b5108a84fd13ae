//! A database kept in memory, for tests and for callers which handle persistence themselves.

use crate::{
    database::{
        DatabaseConnection, DatabaseError, DatabaseInterface, Entity, StoredKey, StoredPsbt,
    },
    locks::EntityId,
};

use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock},
};

use cosigner::descriptors::WalletJson;

#[derive(Debug, Default)]
struct MemoryDbState {
    keys: BTreeMap<String, StoredKey>,
    wallets: BTreeMap<String, WalletJson>,
    psbts: BTreeMap<String, StoredPsbt>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    db: Arc<RwLock<MemoryDbState>>,
}

impl MemoryDatabase {
    pub fn new() -> MemoryDatabase {
        MemoryDatabase::default()
    }
}

impl DatabaseInterface for MemoryDatabase {
    fn connection(&self) -> Box<dyn DatabaseConnection> {
        Box::new(MemoryDatabase {
            db: self.db.clone(),
        })
    }
}

impl DatabaseConnection for MemoryDatabase {
    fn key(&mut self, label: &str) -> Result<Option<StoredKey>, DatabaseError> {
        Ok(self.db.read().unwrap().keys.get(label).cloned())
    }

    fn keys(&mut self) -> Result<Vec<StoredKey>, DatabaseError> {
        Ok(self.db.read().unwrap().keys.values().cloned().collect())
    }

    fn wallet(&mut self, name: &str) -> Result<Option<WalletJson>, DatabaseError> {
        Ok(self.db.read().unwrap().wallets.get(name).cloned())
    }

    fn wallets(&mut self) -> Result<Vec<WalletJson>, DatabaseError> {
        Ok(self.db.read().unwrap().wallets.values().cloned().collect())
    }

    fn psbt(&mut self, name: &str) -> Result<Option<StoredPsbt>, DatabaseError> {
        Ok(self.db.read().unwrap().psbts.get(name).cloned())
    }

    fn psbts(&mut self) -> Result<Vec<StoredPsbt>, DatabaseError> {
        Ok(self.db.read().unwrap().psbts.values().cloned().collect())
    }

    fn store(&mut self, entity: &Entity) -> Result<(), DatabaseError> {
        let mut db = self.db.write().unwrap();
        match entity {
            Entity::Key(key) => {
                db.keys.insert(key.label.clone(), key.clone());
            }
            Entity::Wallet(wallet) => {
                db.wallets.insert(wallet.name.clone(), wallet.clone());
            }
            Entity::Psbt(psbt) => {
                db.psbts.insert(psbt.name.clone(), psbt.clone());
            }
        }
        Ok(())
    }

    fn delete(&mut self, id: &EntityId) -> Result<bool, DatabaseError> {
        let mut db = self.db.write().unwrap();
        Ok(match id {
            EntityId::Key(label) => db.keys.remove(label).is_some(),
            EntityId::Wallet(name) => db.wallets.remove(name).is_some(),
            EntityId::Psbt(name) => db.psbts.remove(name).is_some(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::tests::sanity_check_db;

    #[test]
    fn memory_db() {
        sanity_check_db(&MemoryDatabase::new());
    }
}
