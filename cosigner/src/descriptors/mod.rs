//! Multisig wallet descriptors
//!
//! A wallet is an M-of-N multisig output script template (`multi` or `sortedmulti`, under `wsh()`,
//! `sh(wsh())` or `sh()`) over N extended public keys. Each key, or slot, is identified by the
//! master fingerprint of its cosigner. Multipath keys (`/<0;1>/*`) define one keychain per path.

use crate::{
    keys::ExtendedKey,
    psbt::{Bip32Deriv, Input as PsbtIn, Output as PsbtOut, Psbt, PsbtError},
};

use miniscript::{
    bitcoin::{
        self,
        bip32::{self, Fingerprint},
        opcodes,
        script::Instruction,
        secp256k1, ScriptBuf, TxOut,
    },
    descriptor::{self, checksum::desc_checksum, DescriptorType, Wildcard},
    ForEachKey,
};

use std::{collections::BTreeSet, error, fmt, str::FromStr};

use serde::{Deserialize, Serialize};


#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DescError {
    /// Invalid descriptor grammar, unsupported template, non-extended keys, ..
    DescriptorSyntax(String),
    ChecksumMismatch {
        expected: String,
        found: String,
    },
    /// The threshold isn't between 1 and the number of keys.
    ThresholdOutOfRange {
        threshold: usize,
        keys: usize,
    },
    /// The threshold doesn't correspond to the one of the descriptor's multisig.
    ThresholdMismatch {
        threshold: usize,
        descriptor: usize,
    },
    /// The fingerprints don't correspond to the descriptor's keys.
    FingerprintsMismatch {
        expected: Vec<Fingerprint>,
        found: Vec<Fingerprint>,
    },
    UnknownKeychain(Keychain),
    Derivation(String),
    /// Invalid JSON wallet.
    Sidecar(String),
    Psbt(PsbtError),
}

// Strip the checksum from a descriptor, if present, and check it. Returns the checksum of the
// descriptor.
fn split_checksum(desc_str: &str) -> Result<(&str, String), DescError> {
    let (body, found) = match desc_str.rsplit_once('#') {
        Some((body, found)) => (body, Some(found)),
        None => (desc_str, None),
    };
    let expected = desc_checksum(body).map_err(|e| DescError::DescriptorSyntax(e.to_string()))?;
    if let Some(found) = found {
        if found != expected {
            return Err(DescError::ChecksumMismatch {
                expected,
                found: found.to_string(),
            });
        }
    }
    Ok((body, expected))
}

fn fingerprints_str(fgs: &[Fingerprint]) -> String {
    fgs.iter()
        .map(|fg| fg.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl fmt::Display for DescError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::DescriptorSyntax(e) => write!(f, "Invalid descriptor: {}", e),
            Self::ChecksumMismatch { expected, found } => write!(
                f,
                "Descriptor checksum mismatch: expected '{}', got '{}'.",
                expected, found
            ),
            Self::ThresholdOutOfRange { threshold, keys } => write!(
                f,
                "Threshold {} out of range for a multisig with {} keys.",
                threshold, keys
            ),
            Self::ThresholdMismatch {
                threshold,
                descriptor,
            } => write!(
                f,
                "Threshold {} doesn't match the descriptor's threshold of {}.",
                threshold, descriptor
            ),
            Self::FingerprintsMismatch { expected, found } => write!(
                f,
                "Fingerprints [{}] don't match the descriptor's keys [{}].",
                fingerprints_str(found),
                fingerprints_str(expected)
            ),
            Self::UnknownKeychain(k) => write!(f, "No keychain {} in this descriptor.", k),
            Self::Derivation(e) => write!(f, "Derivation error: {}", e),
            Self::Sidecar(e) => write!(f, "Invalid wallet file: {}", e),
            Self::Psbt(e) => write!(f, "{}", e),
        }
    }
}

impl error::Error for DescError {}

impl From<PsbtError> for DescError {
    fn from(e: PsbtError) -> Self {
        Self::Psbt(e)
    }
}

/// The position of a key in the descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotIndex(usize);

impl SlotIndex {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One of the derivation paths of a multipath descriptor. A descriptor without multipath keys
/// has a single keychain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Keychain(pub usize);

impl Keychain {
    pub const RECEIVE: Keychain = Keychain(0);
    pub const CHANGE: Keychain = Keychain(1);
}

impl fmt::Display for Keychain {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::RECEIVE => write!(f, "receive"),
            Self::CHANGE => write!(f, "change"),
            Keychain(i) => write!(f, "#{}", i),
        }
    }
}

/// How the multisig script is committed to in the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptKind {
    /// P2WSH
    Wsh,
    /// P2WSH nested in P2SH
    ShWsh,
    /// Legacy P2SH
    Sh,
}

impl ScriptKind {
    pub fn is_segwit(&self) -> bool {
        !matches!(self, Self::Sh)
    }
}

/// A public key which may sign for a given script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EligibleSigner {
    pub slot: SlotIndex,
    pub pubkey: bitcoin::PublicKey,
    /// Master fingerprint and full derivation path from it.
    pub origin: (Fingerprint, bip32::DerivationPath),
}

/// The scripts of the wallet at a given derivation index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletScript {
    pub kind: ScriptKind,
    pub script_pubkey: ScriptBuf,
    pub redeem_script: Option<ScriptBuf>,
    pub witness_script: Option<ScriptBuf>,
    /// In slot order.
    pub signers: Vec<EligibleSigner>,
}

impl WalletScript {
    /// The multisig script, as committed to by the signature hash.
    pub fn multisig_script(&self) -> &bitcoin::Script {
        match self.kind {
            ScriptKind::Sh => self.redeem_script.as_deref(),
            ScriptKind::Wsh | ScriptKind::ShWsh => self.witness_script.as_deref(),
        }
        .expect("Always set for this kind of script")
    }

    pub fn signer(&self, slot: SlotIndex) -> Option<&EligibleSigner> {
        self.signers.iter().find(|s| s.slot == slot)
    }

    pub fn is_signer(&self, pubkey: &bitcoin::PublicKey) -> bool {
        self.signers.iter().any(|s| s.pubkey == *pubkey)
    }
}

/// An input of a PSBT recognized as spending a coin of this wallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedInput {
    pub keychain: Keychain,
    pub index: u32,
    pub script: WalletScript,
}

// The numbers pushed in a multisig script. 17 to 20 are pushed as a single byte.
fn read_pushnum(instr: &Instruction) -> Option<usize> {
    match instr {
        Instruction::Op(op) => {
            let op = op.to_u8();
            let (op_1, op_16) = (
                opcodes::all::OP_PUSHNUM_1.to_u8(),
                opcodes::all::OP_PUSHNUM_16.to_u8(),
            );
            if (op_1..=op_16).contains(&op) {
                Some((op - op_1 + 1) as usize)
            } else {
                None
            }
        }
        Instruction::PushBytes(bytes) if bytes.len() == 1 => Some(bytes.as_bytes()[0] as usize),
        _ => None,
    }
}

/// Get the threshold and number of keys of a `<k> <pk>.. <n> CHECKMULTISIG` script.
fn multisig_params(script: &bitcoin::Script) -> Option<(usize, usize)> {
    let instructions = script
        .instructions()
        .collect::<Result<Vec<_>, _>>()
        .ok()?;
    let (last, rest) = instructions.split_last()?;
    if *last != Instruction::Op(opcodes::all::OP_CHECKMULTISIG) {
        return None;
    }
    let (first, rest) = rest.split_first()?;
    let (n_instr, keys) = rest.split_last()?;
    let (k, n) = (read_pushnum(first)?, read_pushnum(n_instr)?);
    let all_keys = keys
        .iter()
        .all(|i| matches!(i, Instruction::PushBytes(b) if b.len() == 33 || b.len() == 65));
    if keys.len() != n || !all_keys {
        return None;
    }
    Some((k, n))
}

fn desc_keys<Pk: miniscript::MiniscriptKey>(desc: &descriptor::Descriptor<Pk>) -> Vec<Pk> {
    let mut keys = Vec::new();
    desc.for_each_key(|k| {
        keys.push(k.clone());
        true
    });
    keys
}

/// A multisig wallet descriptor, bound to the fingerprints of its cosigners and its threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletDescriptor {
    // As imported, without checksum.
    body: String,
    checksum: String,
    multi_desc: descriptor::Descriptor<descriptor::DescriptorPublicKey>,
    keychains: Vec<descriptor::Descriptor<descriptor::DescriptorPublicKey>>,
    kind: ScriptKind,
    // Per slot.
    fingerprints: Vec<Fingerprint>,
    // Path from the master key to the parent of the derived keys, per keychain and per slot.
    key_paths: Vec<Vec<bip32::DerivationPath>>,
    threshold: usize,
}

impl fmt::Display for WalletDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}#{}", self.body, self.checksum)
    }
}

impl WalletDescriptor {
    /// Parse a multisig descriptor and check it against the list of cosigners' fingerprints and
    /// the number of required signatures it is associated with.
    pub fn parse(
        desc_str: &str,
        fingerprints: &[Fingerprint],
        threshold: usize,
        secp: &secp256k1::Secp256k1<impl secp256k1::Verification>,
    ) -> Result<Self, DescError> {
        let (body, checksum) = split_checksum(desc_str.trim())?;
        // Sanity checks are not always performed when calling `Descriptor::from_str`, so we perform
        // them explicitly.
        let multi_desc = descriptor::Descriptor::<descriptor::DescriptorPublicKey>::from_str(body)
            .and_then(|desc| desc.sanity_check().map(|_| desc))
            .map_err(|e| DescError::DescriptorSyntax(e.to_string()))?;
        let kind = match multi_desc.desc_type() {
            DescriptorType::Wsh | DescriptorType::WshSortedMulti => ScriptKind::Wsh,
            DescriptorType::ShWsh | DescriptorType::ShWshSortedMulti => ScriptKind::ShWsh,
            DescriptorType::Sh | DescriptorType::ShSortedMulti => ScriptKind::Sh,
            t => {
                return Err(DescError::DescriptorSyntax(format!(
                    "unsupported script template {:?}",
                    t
                )))
            }
        };

        let keys = desc_keys(&multi_desc);
        for key in keys.iter() {
            let wildcard = match key {
                descriptor::DescriptorPublicKey::XPub(xkey) => xkey.wildcard,
                descriptor::DescriptorPublicKey::MultiXPub(xkey) => xkey.wildcard,
                descriptor::DescriptorPublicKey::Single(_) => {
                    return Err(DescError::DescriptorSyntax(format!(
                        "'{}' is not an extended key",
                        key
                    )))
                }
            };
            if wildcard != Wildcard::Unhardened {
                return Err(DescError::DescriptorSyntax(format!(
                    "key '{}' must end with an unhardened wildcard",
                    key
                )));
            }
        }
        let desc_fingerprints: Vec<Fingerprint> =
            keys.iter().map(|k| k.master_fingerprint()).collect();
        let unique_fingerprints: BTreeSet<_> = desc_fingerprints.iter().collect();
        if unique_fingerprints.len() != desc_fingerprints.len() {
            return Err(DescError::DescriptorSyntax(
                "a cosigner appears more than once".to_string(),
            ));
        }

        let keychains = multi_desc
            .clone()
            .into_single_descriptors()
            .map_err(|e| DescError::DescriptorSyntax(e.to_string()))?;
        let key_paths = keychains
            .iter()
            .map(|desc| {
                desc_keys(desc)
                    .into_iter()
                    .map(|k| {
                        k.full_derivation_path().ok_or_else(|| {
                            DescError::DescriptorSyntax(format!("invalid derivation for '{}'", k))
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()
            })
            .collect::<Result<Vec<_>, _>>()?;

        // Make sure it is a multisig by looking at the script itself.
        let (desc_threshold, n_keys) = derived_scripts(&keychains[0], 0, secp)
            .ok()
            .and_then(|(_, _, script)| multisig_params(&script))
            .ok_or_else(|| {
                DescError::DescriptorSyntax(
                    "only multi() and sortedmulti() descriptors are supported".to_string(),
                )
            })?;
        if n_keys != keys.len() {
            return Err(DescError::DescriptorSyntax(
                "only multi() and sortedmulti() descriptors are supported".to_string(),
            ));
        }
        if threshold < 1 || threshold > n_keys {
            return Err(DescError::ThresholdOutOfRange {
                threshold,
                keys: n_keys,
            });
        }
        if threshold != desc_threshold {
            return Err(DescError::ThresholdMismatch {
                threshold,
                descriptor: desc_threshold,
            });
        }

        let found: BTreeSet<_> = fingerprints.iter().collect();
        if found != unique_fingerprints || fingerprints.len() != desc_fingerprints.len() {
            return Err(DescError::FingerprintsMismatch {
                expected: desc_fingerprints,
                found: fingerprints.to_vec(),
            });
        }

        Ok(WalletDescriptor {
            body: body.to_string(),
            checksum,
            multi_desc,
            keychains,
            kind,
            fingerprints: desc_fingerprints,
            key_paths,
            threshold,
        })
    }

    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn kind(&self) -> ScriptKind {
        self.kind
    }

    /// Master fingerprints of the cosigners, in slot order.
    pub fn fingerprints(&self) -> &[Fingerprint] {
        &self.fingerprints
    }

    pub fn keychains_count(&self) -> usize {
        self.keychains.len()
    }

    /// Whether all xpubs contained in this descriptor are for the passed expected network.
    pub fn all_xpubs_net_is(&self, expected_net: bitcoin::Network) -> bool {
        self.multi_desc.for_each_key(|xpub| match xpub {
            descriptor::DescriptorPublicKey::XPub(xpub) => xpub.xkey.network == expected_net.into(),
            descriptor::DescriptorPublicKey::MultiXPub(xpub) => {
                xpub.xkey.network == expected_net.into()
            }
            descriptor::DescriptorPublicKey::Single(_) => false,
        })
    }

    /// Whether a key matching this fingerprint is part of this descriptor
    pub fn contains_fingerprint(&self, fg: Fingerprint) -> bool {
        self.fingerprints.contains(&fg)
    }

    /// The slot this key is the cosigner of, if any. Only the fingerprint is compared.
    pub fn cosigner_slot_for(&self, key: &ExtendedKey) -> Option<SlotIndex> {
        self.fingerprints
            .iter()
            .position(|fg| *fg == key.fingerprint())
            .map(SlotIndex)
    }

    /// Get the scripts and the eligible signers for the given derivation index.
    pub fn script_for(
        &self,
        keychain: Keychain,
        index: u32,
        secp: &secp256k1::Secp256k1<impl secp256k1::Verification>,
    ) -> Result<WalletScript, DescError> {
        let desc = self
            .keychains
            .get(keychain.0)
            .ok_or(DescError::UnknownKeychain(keychain))?;
        let (script_pubkey, definite_desc, script) =
            derived_scripts(desc, index, secp)?;

        let signers = desc_keys(&definite_desc)
            .into_iter()
            .enumerate()
            .map(|(slot, key)| {
                let pubkey = key
                    .derive_public_key(secp)
                    .map_err(|e| DescError::Derivation(e.to_string()))?;
                let desc_key = key.as_descriptor_public_key();
                let path = desc_key.full_derivation_path().ok_or_else(|| {
                    DescError::Derivation(format!("no single derivation path for '{}'", key))
                })?;
                Ok(EligibleSigner {
                    slot: SlotIndex(slot),
                    pubkey,
                    origin: (desc_key.master_fingerprint(), path),
                })
            })
            .collect::<Result<Vec<_>, DescError>>()?;

        let (redeem_script, witness_script) = match self.kind {
            ScriptKind::Wsh => (None, Some(script)),
            ScriptKind::ShWsh => (Some(script.to_p2wsh()), Some(script)),
            ScriptKind::Sh => (Some(script), None),
        };
        Ok(WalletScript {
            kind: self.kind,
            script_pubkey,
            redeem_script,
            witness_script,
            signers,
        })
    }

    // Find the keychain and index at which one of these derived keys belongs to the wallet and
    // the wallet's scripts pass the given check.
    fn locate(
        &self,
        bip32_derivation: &Bip32Deriv,
        secp: &secp256k1::Secp256k1<impl secp256k1::Verification>,
        matches: impl Fn(&WalletScript) -> bool,
    ) -> Option<(Keychain, u32, WalletScript)> {
        for (pubkey, (fg, der_path)) in bip32_derivation.iter() {
            let slot = match self.fingerprints.iter().position(|f| f == fg) {
                Some(slot) => slot,
                None => continue,
            };
            let (last, parent) = match der_path[..].split_last() {
                Some((bip32::ChildNumber::Normal { index }, parent)) => (*index, parent),
                _ => continue,
            };

            for (keychain, paths) in self.key_paths.iter().enumerate() {
                if paths[slot][..] != *parent {
                    continue;
                }
                let keychain = Keychain(keychain);
                let script = match self.script_for(keychain, last, secp) {
                    Ok(script) => script,
                    Err(e) => {
                        log::debug!("Error deriving {} script at {}: {}", keychain, last, e);
                        continue;
                    }
                };
                if script.signers[slot].pubkey == *pubkey && matches(&script) {
                    return Some((keychain, last, script));
                }
            }
        }

        None
    }

    /// Recognize which keychain and derivation index this PSBT input spends from, using its BIP32
    /// derivations. The scripts present in the input, including the spent output's, must be the
    /// ones of this wallet at this index.
    pub fn locate_input(
        &self,
        psbt_in: &PsbtIn,
        secp: &secp256k1::Secp256k1<impl secp256k1::Verification>,
    ) -> Option<LocatedInput> {
        self.locate(&psbt_in.bip32_derivation, secp, |script| {
            input_matches(psbt_in, script)
        })
        .map(|(keychain, index, script)| LocatedInput {
            keychain,
            index,
            script,
        })
    }

    /// The keychain and derivation index of this transaction output if it pays to the wallet, as
    /// told by the BIP32 derivations of the PSBT output.
    pub fn locate_output(
        &self,
        psbt_out: &PsbtOut,
        txout: &TxOut,
        secp: &secp256k1::Secp256k1<impl secp256k1::Verification>,
    ) -> Option<(Keychain, u32)> {
        self.locate(&psbt_out.bip32_derivation, secp, |script| {
            script.script_pubkey == txout.script_pubkey
        })
        .map(|(keychain, index, _)| (keychain, index))
    }

    /// Update the PSBT input information with the scripts and BIP32 derivations of this
    /// descriptor at the given index.
    pub fn update_psbt_in(
        &self,
        keychain: Keychain,
        index: u32,
        psbt: &mut Psbt,
        input_index: usize,
        secp: &secp256k1::Secp256k1<impl secp256k1::Verification>,
    ) -> Result<(), DescError> {
        let script = self.script_for(keychain, index, secp)?;
        if let Some(ref witness_script) = script.witness_script {
            psbt.set_witness_script(input_index, witness_script.clone())?;
        }
        if let Some(ref redeem_script) = script.redeem_script {
            psbt.set_redeem_script(input_index, redeem_script.clone())?;
        }
        for signer in script.signers {
            let (fg, path) = signer.origin;
            psbt.set_bip32_derivation(input_index, signer.pubkey, fg, path)?;
        }
        Ok(())
    }

    /// Set the BIP32 derivations of this descriptor at the given index in a PSBT output, so it
    /// can be recognized as paying back to the wallet.
    pub fn update_psbt_out(
        &self,
        keychain: Keychain,
        index: u32,
        psbt: &mut Psbt,
        output_index: usize,
        secp: &secp256k1::Secp256k1<impl secp256k1::Verification>,
    ) -> Result<(), DescError> {
        let script = self.script_for(keychain, index, secp)?;
        for signer in script.signers {
            let (fg, path) = signer.origin;
            psbt.set_output_bip32_derivation(output_index, signer.pubkey, fg, path)?;
        }
        Ok(())
    }
}

// Get the script pubkey, the definite descriptor and the script to be signed for at this index.
fn derived_scripts(
    desc: &descriptor::Descriptor<descriptor::DescriptorPublicKey>,
    index: u32,
    secp: &secp256k1::Secp256k1<impl secp256k1::Verification>,
) -> Result<
    (
        ScriptBuf,
        descriptor::Descriptor<descriptor::DefiniteDescriptorKey>,
        ScriptBuf,
    ),
    DescError,
> {
    let definite_desc = desc
        .at_derivation_index(index)
        .map_err(|e| DescError::Derivation(e.to_string()))?;
    let derived_desc = definite_desc
        .derived_descriptor(secp)
        .map_err(|e| DescError::Derivation(e.to_string()))?;
    let script = derived_desc
        .explicit_script()
        .map_err(|e| DescError::Derivation(e.to_string()))?;
    Ok((derived_desc.script_pubkey(), definite_desc, script))
}

fn input_matches(psbt_in: &PsbtIn, script: &WalletScript) -> bool {
    if let Some(spent) = psbt_in.spent_output() {
        if spent.script_pubkey != script.script_pubkey {
            return false;
        }
    }
    if let Some(ref witness_script) = psbt_in.witness_script {
        if Some(witness_script) != script.witness_script.as_ref() {
            return false;
        }
    }
    if let Some(ref redeem_script) = psbt_in.redeem_script {
        if Some(redeem_script) != script.redeem_script.as_ref() {
            return false;
        }
    }
    true
}

/// The stored and exchanged form of a wallet: the descriptor along with the fingerprints of the
/// cosigners and the number of required signatures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletJson {
    pub name: String,
    pub descriptor: String,
    pub fingerprints: Vec<Fingerprint>,
    pub required_sig: usize,
    /// Block height at which the wallet was created, to rescan from.
    #[serde(default)]
    pub created_at_height: u32,
}

impl WalletJson {
    pub fn from_json(s: &str) -> Result<Self, DescError> {
        serde_json::from_str(s).map_err(|e| DescError::Sidecar(e.to_string()))
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("Serializing to a string never fails")
    }

    pub fn new(name: String, desc: &WalletDescriptor, created_at_height: u32) -> Self {
        Self {
            name,
            descriptor: desc.to_string(),
            fingerprints: desc.fingerprints().to_vec(),
            required_sig: desc.threshold(),
            created_at_height,
        }
    }

    pub fn descriptor(
        &self,
        secp: &secp256k1::Secp256k1<impl secp256k1::Verification>,
    ) -> Result<WalletDescriptor, DescError> {
        WalletDescriptor::parse(
            &self.descriptor,
            &self.fingerprints,
            self.required_sig,
            secp,
        )
    }
}
