//! # Cosigner commands
//!
//! External interface to the cosigner: import keys, wallets and PSBTs, sign a PSBT with a key
//! for a wallet, inspect and delete them. Entities are always designated explicitly by name.

use crate::{
    database::{DatabaseError, DatabaseInterface, Entity, StoredKey, StoredPsbt},
    locks::{EntityId, EntityLocks},
};

use cosigner::{
    descriptors::{DescError, WalletDescriptor, WalletJson},
    keys::{ExtendedKey, KeyError},
    psbt::{Psbt, PsbtError, PsbtSummary},
    signer::{SignOutcome, Signer, SignerError},
};

use std::{fmt, str::FromStr, sync::Arc};

use miniscript::bitcoin::{self, bip32::Fingerprint, secp256k1};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    InvalidName(String),
    AlreadyExists(EntityId),
    NotFound(EntityId),
    /// The entity is being used by another command.
    InUse(EntityId),
    /// The wallet's keys aren't for the network we operate on.
    WalletNetwork(bitcoin::Network),
    Key(KeyError),
    Descriptor(DescError),
    Psbt(PsbtError),
    Signer(SignerError),
    Database(DatabaseError),
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InvalidName(name) => write!(
                f,
                "Invalid name '{}'. It must be non-empty, not start with a '.' and not contain path separators.",
                name
            ),
            Self::AlreadyExists(id) => write!(f, "There is already a {}.", id),
            Self::NotFound(id) => write!(f, "Unknown {}.", id),
            Self::InUse(id) => write!(
                f,
                "The {} is in use by another operation. Please try again once it completed.",
                id
            ),
            Self::WalletNetwork(net) => {
                write!(f, "The wallet's keys aren't all for network '{}'.", net)
            }
            Self::Key(e) => write!(f, "{}", e),
            Self::Descriptor(e) => write!(f, "{}", e),
            Self::Psbt(e) => write!(f, "{}", e),
            Self::Signer(e) => write!(f, "Signing error: {}", e),
            Self::Database(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for CommandError {}

impl From<KeyError> for CommandError {
    fn from(e: KeyError) -> Self {
        Self::Key(e)
    }
}

impl From<DescError> for CommandError {
    fn from(e: DescError) -> Self {
        Self::Descriptor(e)
    }
}

impl From<PsbtError> for CommandError {
    fn from(e: PsbtError) -> Self {
        Self::Psbt(e)
    }
}

impl From<SignerError> for CommandError {
    fn from(e: SignerError) -> Self {
        Self::Signer(e)
    }
}

impl From<DatabaseError> for CommandError {
    fn from(e: DatabaseError) -> Self {
        Self::Database(e)
    }
}

// Names are used as file names by the JSON file database.
fn check_name(name: &str) -> Result<(), CommandError> {
    if name.is_empty()
        || name.starts_with('.')
        || name.contains(|c: char| c == '/' || c == '\\' || c.is_control())
    {
        return Err(CommandError::InvalidName(name.to_string()));
    }
    Ok(())
}

fn corrupted(id: EntityId, reason: impl fmt::Display) -> CommandError {
    CommandError::Database(DatabaseError::Corrupted {
        id,
        reason: reason.to_string(),
    })
}

/// The interface to the stored keys, wallets and PSBTs. It may be shared between threads.
pub struct CosignerControl {
    network: bitcoin::Network,
    db: Arc<dyn DatabaseInterface>,
    locks: EntityLocks,
    secp: secp256k1::Secp256k1<secp256k1::All>,
}

impl CosignerControl {
    pub fn new(network: bitcoin::Network, db: Arc<dyn DatabaseInterface>) -> CosignerControl {
        CosignerControl {
            network,
            db,
            locks: EntityLocks::new(),
            secp: secp256k1::Secp256k1::new(),
        }
    }

    pub fn network(&self) -> bitcoin::Network {
        self.network
    }

    /// The locks commands take on the entities they use.
    pub fn locks(&self) -> &EntityLocks {
        &self.locks
    }

    fn load_key(&self, label: &str) -> Result<ExtendedKey, CommandError> {
        let id = EntityId::Key(label.to_string());
        let stored = self
            .db
            .connection()
            .key(label)?
            .ok_or_else(|| CommandError::NotFound(id.clone()))?;
        let key = ExtendedKey::parse(&stored.key, self.network, &self.secp)
            .map_err(|e| corrupted(id.clone(), e))?;
        if key.fingerprint() != stored.fingerprint {
            return Err(corrupted(
                id,
                format!(
                    "fingerprint is {} but {} was recorded",
                    key.fingerprint(),
                    stored.fingerprint
                ),
            ));
        }
        Ok(key)
    }

    fn load_wallet(&self, name: &str) -> Result<WalletDescriptor, CommandError> {
        let id = EntityId::Wallet(name.to_string());
        self.db
            .connection()
            .wallet(name)?
            .ok_or_else(|| CommandError::NotFound(id.clone()))?
            .descriptor(&self.secp)
            .map_err(|e| corrupted(id, e))
    }

    fn load_psbt(&self, name: &str) -> Result<Psbt, CommandError> {
        let id = EntityId::Psbt(name.to_string());
        let stored = self
            .db
            .connection()
            .psbt(name)?
            .ok_or_else(|| CommandError::NotFound(id.clone()))?;
        Psbt::from_str(&stored.psbt).map_err(|e| corrupted(id, e))
    }

    // Store a new entity, making sure none exists with the same identifier.
    fn store_new(&self, entity: Entity) -> Result<(), CommandError> {
        let id = entity.id();
        check_name(id.name())?;
        let _lock = self.locks.write(id.clone());
        let mut db_conn = self.db.connection();
        if db_conn.exists(&id)? {
            return Err(CommandError::AlreadyExists(id));
        }
        db_conn.store(&entity)?;
        log::info!("Imported {}.", id);
        Ok(())
    }

    fn import_extended_key(
        &self,
        key: ExtendedKey,
        label: &str,
    ) -> Result<ImportKeyResult, CommandError> {
        let stored = StoredKey {
            label: label.to_string(),
            fingerprint: key.fingerprint(),
            key: key.to_string(),
        };
        self.store_new(Entity::Key(stored))?;
        Ok(ImportKeyResult {
            label: label.to_string(),
            fingerprint: key.fingerprint(),
            private: key.is_private(),
        })
    }
}

impl CosignerControl {
    /// Import a base58check-encoded extended key under this label.
    pub fn import_key(
        &self,
        serialized: &str,
        label: &str,
    ) -> Result<ImportKeyResult, CommandError> {
        let key = ExtendedKey::parse(serialized, self.network, &self.secp)?;
        self.import_extended_key(key, label)
    }

    /// Restore a master private key from its BIP39 mnemonic and import it under this label.
    pub fn import_mnemonic(
        &self,
        words: &str,
        label: &str,
    ) -> Result<ImportKeyResult, CommandError> {
        let key = ExtendedKey::from_mnemonic(words, self.network, &self.secp)?;
        self.import_extended_key(key, label)
    }

    /// Import a wallet from its JSON representation. The descriptor is checked against the
    /// cosigners' fingerprints and the threshold it comes with.
    pub fn import_wallet(&self, json: &str) -> Result<WalletJson, CommandError> {
        let wallet = WalletJson::from_json(json)?;
        check_name(&wallet.name)?;
        let desc = wallet.descriptor(&self.secp)?;
        if !desc.all_xpubs_net_is(self.network) {
            return Err(CommandError::WalletNetwork(self.network));
        }

        // Always store the descriptor with its checksum.
        let wallet = WalletJson::new(wallet.name, &desc, wallet.created_at_height);
        self.store_new(Entity::Wallet(wallet.clone()))?;
        Ok(wallet)
    }

    /// Import a PSBT, either binary or encoded in base64. Unless a name is given it is named
    /// after the label embedded in the PSBT, or its txid if there is no usable label.
    pub fn import_psbt(
        &self,
        data: &[u8],
        name: Option<&str>,
    ) -> Result<ImportPsbtResult, CommandError> {
        let psbt = Psbt::parse(data)?;
        let name = name
            .map(|n| n.to_string())
            .or_else(|| psbt.name().filter(|n| check_name(n).is_ok()))
            .unwrap_or_else(|| psbt.txid().to_string());
        self.store_new(Entity::Psbt(StoredPsbt {
            name: name.clone(),
            psbt: psbt.to_string(),
        }))?;
        Ok(ImportPsbtResult {
            name,
            txid: psbt.txid(),
        })
    }

    /// Merge the signatures of another version of a stored PSBT into it.
    pub fn update_psbt(&self, name: &str, data: &[u8]) -> Result<UpdatePsbtResult, CommandError> {
        let other = Psbt::parse(data)?;
        let _lock = self.locks.write(EntityId::Psbt(name.to_string()));
        let mut psbt = self.load_psbt(name)?;
        let added = psbt.combine(&other)?;
        if added > 0 {
            self.db.connection().store(&Entity::Psbt(StoredPsbt {
                name: name.to_string(),
                psbt: psbt.to_string(),
            }))?;
        }
        log::info!("Merged {} new signature(s) into PSBT '{}'.", added, name);
        Ok(UpdatePsbtResult { added })
    }

    /// Sign the PSBT with this key, for this wallet. The PSBT is only updated if signatures were
    /// added.
    pub fn sign(
        &self,
        key_label: &str,
        wallet_name: &str,
        psbt_name: &str,
    ) -> Result<SignResult, CommandError> {
        let _key_lock = self.locks.read(EntityId::Key(key_label.to_string()));
        let _wallet_lock = self.locks.read(EntityId::Wallet(wallet_name.to_string()));
        let _psbt_lock = self.locks.write(EntityId::Psbt(psbt_name.to_string()));

        let key = self.load_key(key_label)?;
        let wallet = self.load_wallet(wallet_name)?;
        let mut psbt = self.load_psbt(psbt_name)?;

        let outcome = Signer::new(&key, &wallet).sign(&mut psbt, &self.secp)?;
        if outcome.added() > 0 {
            self.db.connection().store(&Entity::Psbt(StoredPsbt {
                name: psbt_name.to_string(),
                psbt: psbt.to_string(),
            }))?;
        }
        log::info!(
            "Signed PSBT '{}' with key '{}': {} signature(s) added, {} already present.",
            psbt_name,
            key_label,
            outcome.added(),
            outcome.already_present()
        );

        Ok(SignResult {
            added: outcome.added(),
            already_present: outcome.already_present(),
            complete: psbt.is_complete(&wallet, &self.secp),
            message: outcome.message().to_string(),
            outcome,
            psbt: psbt.to_string(),
        })
    }

    /// Delete an entity. Fails if it is in use rather than waiting for it to be released.
    ///
    /// The PSBTs of a wallet aren't deleted along with it. Those still missing signatures are
    /// returned.
    pub fn delete(&self, id: &EntityId) -> Result<DeleteResult, CommandError> {
        let _lock = self
            .locks
            .try_write(id.clone())
            .ok_or_else(|| CommandError::InUse(id.clone()))?;
        let mut db_conn = self.db.connection();
        if !db_conn.exists(id)? {
            return Err(CommandError::NotFound(id.clone()));
        }

        let pending_psbts = match id {
            EntityId::Wallet(name) => self.pending_psbts(name)?,
            _ => Vec::new(),
        };
        if !pending_psbts.is_empty() {
            log::warn!(
                "Deleting {} which still has incomplete PSBTs: {}",
                id,
                pending_psbts.join(", ")
            );
        }

        db_conn.delete(id)?;
        log::info!("Deleted {}.", id);
        Ok(DeleteResult { pending_psbts })
    }

    // Stored PSBTs spending coins of this wallet which aren't completely signed.
    fn pending_psbts(&self, wallet_name: &str) -> Result<Vec<String>, CommandError> {
        let wallet = match self.load_wallet(wallet_name) {
            Ok(wallet) => wallet,
            Err(CommandError::Database(DatabaseError::Corrupted { reason, .. })) => {
                log::error!(
                    "Can't check pending PSBTs of corrupted wallet '{}': {}",
                    wallet_name,
                    reason
                );
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let mut pending = Vec::new();
        for stored in self.db.connection().psbts()? {
            let psbt = match Psbt::from_str(&stored.psbt) {
                Ok(psbt) => psbt,
                Err(e) => {
                    log::error!("Skipping corrupted PSBT '{}': {}", stored.name, e);
                    continue;
                }
            };
            let spends_wallet = psbt
                .inputs()
                .iter()
                .any(|input| wallet.locate_input(input, &self.secp).is_some());
            if spends_wallet && !psbt.is_complete(&wallet, &self.secp) {
                pending.push(stored.name);
            }
        }
        Ok(pending)
    }

    pub fn list(&self) -> Result<ListResult, CommandError> {
        let mut db_conn = self.db.connection();
        let keys = db_conn
            .keys()?
            .into_iter()
            .map(|key| ListKeysEntry {
                label: key.label,
                fingerprint: key.fingerprint,
            })
            .collect();
        let wallets = db_conn
            .wallets()?
            .into_iter()
            .map(|wallet| ListWalletsEntry {
                name: wallet.name,
                descriptor: wallet.descriptor,
                fingerprints: wallet.fingerprints,
                required_sig: wallet.required_sig,
            })
            .collect();
        let psbts = db_conn
            .psbts()?
            .into_iter()
            .map(|stored| {
                let psbt = Psbt::from_str(&stored.psbt)
                    .map_err(|e| corrupted(EntityId::Psbt(stored.name.clone()), e))?;
                Ok(ListPsbtsEntry {
                    name: stored.name,
                    txid: psbt.txid(),
                })
            })
            .collect::<Result<Vec<_>, CommandError>>()?;

        Ok(ListResult {
            keys,
            wallets,
            psbts,
        })
    }

    /// A description of the PSBT from the point of view of this wallet.
    pub fn print_psbt(
        &self,
        psbt_name: &str,
        wallet_name: &str,
    ) -> Result<PsbtSummary, CommandError> {
        let _wallet_lock = self.locks.read(EntityId::Wallet(wallet_name.to_string()));
        let _psbt_lock = self.locks.read(EntityId::Psbt(psbt_name.to_string()));
        let wallet = self.load_wallet(wallet_name)?;
        let psbt = self.load_psbt(psbt_name)?;
        Ok(psbt.summary(&wallet, self.network, &self.secp))
    }

    /// The PSBT encoded in base64.
    pub fn export_psbt(&self, name: &str) -> Result<String, CommandError> {
        let _lock = self.locks.read(EntityId::Psbt(name.to_string()));
        Ok(self.load_psbt(name)?.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportKeyResult {
    pub label: String,
    pub fingerprint: Fingerprint,
    /// Whether it can be used to sign.
    pub private: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportPsbtResult {
    pub name: String,
    pub txid: bitcoin::Txid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatePsbtResult {
    pub added: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignResult {
    #[serde(skip)]
    pub outcome: SignOutcome,
    pub added: usize,
    pub already_present: usize,
    /// Whether the PSBT has enough signatures for every input.
    pub complete: bool,
    pub message: String,
    /// The PSBT as stored after signing, in base64.
    pub psbt: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteResult {
    /// Names of the incomplete PSBTs spending from a deleted wallet.
    pub pending_psbts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListKeysEntry {
    pub label: String,
    pub fingerprint: Fingerprint,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListWalletsEntry {
    pub name: String,
    pub descriptor: String,
    pub fingerprints: Vec<Fingerprint>,
    pub required_sig: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListPsbtsEntry {
    pub name: String,
    pub txid: bitcoin::Txid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListResult {
    pub keys: Vec<ListKeysEntry>,
    pub wallets: Vec<ListWalletsEntry>,
    pub psbts: Vec<ListPsbtsEntry>,
}
