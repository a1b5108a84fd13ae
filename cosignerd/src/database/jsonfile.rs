//! A database storing each entity as a JSON file in the data directory.

use crate::{
    database::{
        DatabaseConnection, DatabaseError, DatabaseInterface, Entity, StoredKey, StoredPsbt,
    },
    datadir::DataDirectory,
    locks::EntityId,
};

use std::{fs, io, io::Write, path::Path};

use cosigner::descriptors::WalletJson;
use miniscript::bitcoin::Network;

use serde::{de::DeserializeOwned, Serialize};

#[derive(Debug, Clone)]
pub struct JsonFileDatabase {
    data_dir: DataDirectory,
    network: Network,
}

impl JsonFileDatabase {
    /// Open the database for this network in the data directory, creating its directories if
    /// needed.
    pub fn new(data_dir: DataDirectory, network: Network) -> Result<Self, DatabaseError> {
        data_dir.init_network(network)?;
        Ok(Self { data_dir, network })
    }

    fn read<T: DeserializeOwned>(&self, id: &EntityId) -> Result<Option<T>, DatabaseError> {
        let path = self.data_dir.entity_file_path(self.network, id);
        let content = match fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&content)
            .map(Some)
            .map_err(|e| DatabaseError::Corrupted {
                id: id.clone(),
                reason: e.to_string(),
            })
    }

    // All the entries of this kind, sorted by name.
    fn list<T: DeserializeOwned>(
        &self,
        kind: &str,
        id_from_name: impl Fn(String) -> EntityId,
    ) -> Result<Vec<T>, DatabaseError> {
        let dir = self.data_dir.entities_directory(self.network, kind);
        let mut names = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) {
                names.push(name.to_string());
            }
        }
        names.sort();

        let mut entities = Vec::with_capacity(names.len());
        for name in names {
            // It may have been removed since we listed the directory.
            if let Some(entity) = self.read(&id_from_name(name))? {
                entities.push(entity);
            }
        }
        Ok(entities)
    }

    fn write<T: Serialize>(&self, id: &EntityId, value: &T) -> Result<(), DatabaseError> {
        let path = self.data_dir.entity_file_path(self.network, id);
        let content = serde_json::to_vec_pretty(value).map_err(|e| DatabaseError::Corrupted {
            id: id.clone(),
            reason: e.to_string(),
        })?;
        // Write to a temporary file first so a reader never sees a partially written entry.
        let tmp_path = path.with_extension("json.tmp");
        write_private_file(&tmp_path, &content)?;
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }
}

fn write_private_file(path: &Path, content: &[u8]) -> Result<(), io::Error> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(content)?;
    file.sync_all()
}

impl DatabaseInterface for JsonFileDatabase {
    fn connection(&self) -> Box<dyn DatabaseConnection> {
        Box::new(self.clone())
    }
}

impl DatabaseConnection for JsonFileDatabase {
    fn key(&mut self, label: &str) -> Result<Option<StoredKey>, DatabaseError> {
        self.read(&EntityId::Key(label.to_string()))
    }

    fn keys(&mut self) -> Result<Vec<StoredKey>, DatabaseError> {
        self.list("key", EntityId::Key)
    }

    fn wallet(&mut self, name: &str) -> Result<Option<WalletJson>, DatabaseError> {
        self.read(&EntityId::Wallet(name.to_string()))
    }

    fn wallets(&mut self) -> Result<Vec<WalletJson>, DatabaseError> {
        self.list("wallet", EntityId::Wallet)
    }

    fn psbt(&mut self, name: &str) -> Result<Option<StoredPsbt>, DatabaseError> {
        self.read(&EntityId::Psbt(name.to_string()))
    }

    fn psbts(&mut self) -> Result<Vec<StoredPsbt>, DatabaseError> {
        self.list("psbt", EntityId::Psbt)
    }

    fn store(&mut self, entity: &Entity) -> Result<(), DatabaseError> {
        let id = entity.id();
        match entity {
            Entity::Key(key) => self.write(&id, key),
            Entity::Wallet(wallet) => self.write(&id, wallet),
            Entity::Psbt(psbt) => self.write(&id, psbt),
        }
    }

    fn delete(&mut self, id: &EntityId) -> Result<bool, DatabaseError> {
        let path = self.data_dir.entity_file_path(self.network, id);
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::tests::sanity_check_db;

    #[test]
    fn json_file_db() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let data_dir = DataDirectory::new(tmp_dir.path().to_path_buf());
        let db = JsonFileDatabase::new(data_dir.clone(), Network::Testnet).unwrap();
        sanity_check_db(&db);

        // Entries persist across instances, and are per network.
        let psbt = StoredPsbt {
            name: "to-carol".to_string(),
            psbt: cosigner::testutils::SAMPLE_PSBT.to_string(),
        };
        db.connection().store(&Entity::Psbt(psbt.clone())).unwrap();
        let path = tmp_dir.path().join("testnet/psbts/to-carol.json");
        assert!(path.is_file());
        assert!(!tmp_dir.path().join("testnet/psbts/to-carol.json.tmp").exists());
        let reopened = JsonFileDatabase::new(data_dir.clone(), Network::Testnet).unwrap();
        assert_eq!(reopened.connection().psbt("to-carol").unwrap(), Some(psbt));
        let signet = JsonFileDatabase::new(data_dir, Network::Signet).unwrap();
        assert!(signet.connection().psbts().unwrap().is_empty());

        // Files which aren't entries are ignored, invalid entries are reported.
        fs::write(tmp_dir.path().join("testnet/psbts/notes.txt"), "hello").unwrap();
        assert_eq!(reopened.connection().psbts().unwrap().len(), 1);
        fs::write(&path, "{\"name\": \"to-carol\"}").unwrap();
        assert!(matches!(
            reopened.connection().psbt("to-carol"),
            Err(DatabaseError::Corrupted { .. })
        ));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            reopened
                .connection()
                .store(&Entity::Key(StoredKey {
                    label: "alice".to_string(),
                    fingerprint: "a2ebe04e".parse().unwrap(),
                    key: cosigner::testutils::ALICE_TPRV.to_string(),
                }))
                .unwrap();
            let mode = fs::metadata(tmp_dir.path().join("testnet/keys/alice.json"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);

            // Each kind is listed from its own directory.
            let keys = reopened.connection().keys().unwrap();
            assert_eq!(keys.len(), 1);
            assert_eq!(keys[0].label, "alice");
            assert!(reopened.connection().wallets().unwrap().is_empty());
        }
    }
}
