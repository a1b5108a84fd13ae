//! Signing engine
//!
//! Add the signatures an extended private key is able to provide to a PSBT spending from a wallet
//! it is a cosigner of.

use crate::{
    descriptors::{ScriptKind, WalletDescriptor},
    keys::{ExtendedKey, KeyError},
    psbt::{Insertion, Psbt, PsbtError},
};

use miniscript::bitcoin::{bip32::Fingerprint, ecdsa, hashes::Hash, secp256k1, sighash};

use std::{error, fmt};

/// Message shown to the user when signatures were added to the PSBT.
pub const SIGNATURES_ADDED_MSG: &str = "Added signatures";
/// Message shown to the user when the key had already signed everything it could sign.
pub const ALREADY_SIGNED_MSG: &str =
    "request to sign a PSBT already containing a signature from this key";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignerError {
    /// The key isn't one of the wallet's cosigners.
    KeyNotACosigner { fingerprint: Fingerprint },
    /// The key is a cosigner of the wallet but we only have its public part.
    WatchOnlyKey { fingerprint: Fingerprint },
    /// No input of the PSBT can be signed by this key.
    NothingToSign,
    MissingPreviousOutput(usize),
    UnsupportedSighash { input: usize, value: u32 },
    Sighash(String),
    /// The key at the derivation path of the wallet isn't the one in the descriptor.
    KeyMismatch { input: usize },
    Key(KeyError),
    Psbt(PsbtError),
}

impl fmt::Display for SignerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::KeyNotACosigner { fingerprint } => write!(
                f,
                "Key with fingerprint '{}' is not a cosigner of this wallet.",
                fingerprint
            ),
            Self::WatchOnlyKey { fingerprint } => write!(
                f,
                "Key with fingerprint '{}' is a public key, it can't sign.",
                fingerprint
            ),
            Self::NothingToSign => write!(f, "No input of this PSBT can be signed by this key."),
            Self::MissingPreviousOutput(i) => {
                write!(f, "Missing the previous output of input #{}.", i)
            }
            Self::UnsupportedSighash { input, value } => write!(
                f,
                "Unsupported sighash type {:#x} for input #{}.",
                value, input
            ),
            Self::Sighash(e) => write!(f, "Error computing sighash: {}", e),
            Self::KeyMismatch { input } => write!(
                f,
                "The key doesn't derive to the wallet's public key for input #{}.",
                input
            ),
            Self::Key(e) => write!(f, "{}", e),
            Self::Psbt(e) => write!(f, "{}", e),
        }
    }
}

impl error::Error for SignerError {}

impl From<KeyError> for SignerError {
    fn from(e: KeyError) -> Self {
        Self::Key(e)
    }
}

impl From<PsbtError> for SignerError {
    fn from(e: PsbtError) -> Self {
        Self::Psbt(e)
    }
}

/// What signing a PSBT resulted in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignOutcome {
    SignaturesAdded { added: usize, already_present: usize },
    /// The key had already signed every input it can sign.
    NoNewSignatures { already_present: usize },
}

impl SignOutcome {
    pub fn added(&self) -> usize {
        match self {
            Self::SignaturesAdded { added, .. } => *added,
            Self::NoNewSignatures { .. } => 0,
        }
    }

    pub fn already_present(&self) -> usize {
        match self {
            Self::SignaturesAdded {
                already_present, ..
            }
            | Self::NoNewSignatures { already_present } => *already_present,
        }
    }

    /// The message to present to the user.
    pub fn message(&self) -> &'static str {
        match self {
            Self::SignaturesAdded { .. } => SIGNATURES_ADDED_MSG,
            Self::NoNewSignatures { .. } => ALREADY_SIGNED_MSG,
        }
    }
}

/// Signs PSBTs of a wallet with one of its cosigners' key.
pub struct Signer<'a> {
    key: &'a ExtendedKey,
    wallet: &'a WalletDescriptor,
}

impl<'a> Signer<'a> {
    pub fn new(key: &'a ExtendedKey, wallet: &'a WalletDescriptor) -> Self {
        Self { key, wallet }
    }

    /// Add our signature to every input of the wallet in this PSBT which doesn't have one yet.
    ///
    /// All signatures are computed before any is inserted: on error the PSBT is left untouched.
    pub fn sign<C: secp256k1::Signing + secp256k1::Verification>(
        &self,
        psbt: &mut Psbt,
        secp: &secp256k1::Secp256k1<C>,
    ) -> Result<SignOutcome, SignerError> {
        let fingerprint = self.key.fingerprint();
        let slot = self
            .wallet
            .cosigner_slot_for(self.key)
            .ok_or(SignerError::KeyNotACosigner { fingerprint })?;
        let signing_key = self
            .key
            .signing_key()
            .ok_or(SignerError::WatchOnlyKey { fingerprint })?;
        log::debug!(
            "Signing PSBT '{}' with key '{}' as cosigner #{}.",
            psbt.txid(),
            fingerprint,
            slot
        );

        let mut pending = Vec::new();
        let mut already_present = 0;
        {
            let mut sighash_cache = sighash::SighashCache::new(psbt.unsigned_tx());
            for (i, psbt_in) in psbt.inputs().iter().enumerate() {
                if psbt_in.finalized {
                    log::debug!("Input #{} is already finalized.", i);
                    continue;
                }
                let located = match self.wallet.locate_input(psbt_in, secp) {
                    Some(located) => located,
                    None => {
                        log::debug!("Input #{} doesn't spend a coin of this wallet.", i);
                        continue;
                    }
                };
                let signer = match located.script.signer(slot) {
                    Some(signer) => signer,
                    None => continue,
                };

                let pubkey = self.key.derive_public_key(&signer.origin.1, secp)?;
                if pubkey != signer.pubkey {
                    return Err(SignerError::KeyMismatch { input: i });
                }
                if psbt_in.has_signature_from(&pubkey) {
                    already_present += 1;
                    continue;
                }

                let sighash_value = psbt_in.sighash_type.unwrap_or(1);
                let sighash_type = sighash::EcdsaSighashType::from_standard(sighash_value)
                    .map_err(|_| SignerError::UnsupportedSighash {
                        input: i,
                        value: sighash_value,
                    })?;
                let script_code = located.script.multisig_script();
                let msg = match located.script.kind {
                    ScriptKind::Wsh | ScriptKind::ShWsh => {
                        let value = psbt_in
                            .spent_output()
                            .ok_or(SignerError::MissingPreviousOutput(i))?
                            .value;
                        let sighash = sighash_cache
                            .p2wsh_signature_hash(i, script_code, value, sighash_type)
                            .map_err(|e| SignerError::Sighash(e.to_string()))?;
                        secp256k1::Message::from_digest_slice(sighash.as_byte_array())
                            .expect("Sighash is always 32 bytes.")
                    }
                    ScriptKind::Sh => {
                        // The sighash doesn't commit to the value, the whole spent transaction
                        // is required.
                        if psbt_in.non_witness_utxo.is_none() {
                            return Err(SignerError::MissingPreviousOutput(i));
                        }
                        let sighash = sighash_cache
                            .legacy_signature_hash(i, script_code, sighash_type.to_u32())
                            .map_err(|e| SignerError::Sighash(e.to_string()))?;
                        secp256k1::Message::from_digest_slice(sighash.as_byte_array())
                            .expect("Sighash is always 32 bytes.")
                    }
                };

                let (sig_pubkey, signature) =
                    signing_key.sign_ecdsa(&signer.origin.1, &msg, secp)?;
                debug_assert_eq!(sig_pubkey, pubkey);
                pending.push((
                    i,
                    pubkey,
                    ecdsa::Signature {
                        signature,
                        sighash_type,
                    },
                ));
            }
        }

        if pending.is_empty() && already_present == 0 {
            return Err(SignerError::NothingToSign);
        }

        let mut added = 0;
        for (i, pubkey, sig) in pending {
            if psbt.insert_signature(i, pubkey, sig)? == Insertion::Inserted {
                added += 1;
            }
        }
        log::info!(
            "Key '{}' added {} signature(s) to PSBT '{}', {} already present.",
            fingerprint,
            added,
            psbt.txid(),
            already_present
        );

        Ok(if added > 0 {
            SignOutcome::SignaturesAdded {
                added,
                already_present,
            }
        } else {
            SignOutcome::NoNewSignatures { already_present }
        })
    }
}
