//! Partially Signed Bitcoin Transactions
//!
//! A BIP174 PSBT kept as its raw key-value maps, along with a typed view of the fields relevant to
//! signing. Modifications go through the raw maps so anything we don't interpret is preserved as
//! is, and a PSBT that wasn't modified serializes back to the exact same bytes.

pub mod raw;

use crate::descriptors::{Keychain, WalletDescriptor};
use raw::{Pair, RawPsbt, PSBT_MAGIC};

use miniscript::bitcoin::{
    self,
    base64::{self, Engine},
    bip32::{ChildNumber, DerivationPath, Fingerprint},
    consensus, ecdsa, secp256k1, OutPoint, ScriptBuf, Transaction, TxOut, Txid,
};

use std::{
    collections::{BTreeMap, HashSet},
    error, fmt,
    str::{self, FromStr},
};

use serde::Serialize;

pub const PSBT_IN_NON_WITNESS_UTXO: u8 = 0x00;
pub const PSBT_IN_WITNESS_UTXO: u8 = 0x01;
pub const PSBT_IN_PARTIAL_SIG: u8 = 0x02;
pub const PSBT_IN_SIGHASH_TYPE: u8 = 0x03;
pub const PSBT_IN_REDEEM_SCRIPT: u8 = 0x04;
pub const PSBT_IN_WITNESS_SCRIPT: u8 = 0x05;
pub const PSBT_IN_BIP32_DERIVATION: u8 = 0x06;
pub const PSBT_IN_FINAL_SCRIPTSIG: u8 = 0x07;
pub const PSBT_IN_FINAL_SCRIPTWITNESS: u8 = 0x08;

pub const PSBT_OUT_REDEEM_SCRIPT: u8 = 0x00;
pub const PSBT_OUT_WITNESS_SCRIPT: u8 = 0x01;
pub const PSBT_OUT_BIP32_DERIVATION: u8 = 0x02;

/// Proprietary global field some wallets use to label a PSBT.
const PSBT_GLOBAL_NAME: &[u8] = b"\xfcname";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PsbtError {
    Malformed(String),
    InputIndex(usize),
    OutputIndex(usize),
    DifferentTransaction { expected: Txid, found: Txid },
}

impl fmt::Display for PsbtError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Malformed(e) => write!(f, "Malformed PSBT: {}", e),
            Self::InputIndex(i) => write!(f, "No input at index {} in PSBT.", i),
            Self::OutputIndex(i) => write!(f, "No output at index {} in PSBT.", i),
            Self::DifferentTransaction { expected, found } => write!(
                f,
                "PSBT is for transaction '{}', expected '{}'.",
                found, expected
            ),
        }
    }
}

impl error::Error for PsbtError {}

impl From<raw::DecodeError> for PsbtError {
    fn from(e: raw::DecodeError) -> Self {
        Self::Malformed(e.0)
    }
}

macro_rules! malformed {
    ($($arg:tt)*) => {
        PsbtError::Malformed(format!($($arg)*))
    };
}

/// Result of inserting a signature in a PSBT input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insertion {
    Inserted,
    /// There was already a signature for this public key. Nothing was changed.
    AlreadyPresent,
}

pub type Bip32Deriv = BTreeMap<bitcoin::PublicKey, (Fingerprint, DerivationPath)>;

fn no_key_data(pair: &Pair, field: &str) -> Result<(), PsbtError> {
    if pair.key_data().is_empty() {
        Ok(())
    } else {
        Err(malformed!("unexpected key data for {}", field))
    }
}

fn parse_pubkey(bytes: &[u8], field: &str) -> Result<bitcoin::PublicKey, PsbtError> {
    bitcoin::PublicKey::from_slice(bytes).map_err(|e| malformed!("invalid {} key: {}", field, e))
}

fn parse_key_source(value: &[u8]) -> Result<(Fingerprint, DerivationPath), PsbtError> {
    if value.len() < 4 || value.len() % 4 != 0 {
        return Err(malformed!("invalid BIP32 key source length {}", value.len()));
    }
    let fingerprint = Fingerprint::from([value[0], value[1], value[2], value[3]]);
    let path: Vec<ChildNumber> = value[4..]
        .chunks(4)
        .map(|c| ChildNumber::from(u32::from_le_bytes([c[0], c[1], c[2], c[3]])))
        .collect();
    Ok((fingerprint, DerivationPath::from(path)))
}

fn serialize_key_source(fingerprint: Fingerprint, path: &DerivationPath) -> Vec<u8> {
    let mut value = Vec::with_capacity(4 + 4 * path.len());
    value.extend_from_slice(fingerprint.as_bytes());
    for child in path {
        value.extend_from_slice(&u32::from(*child).to_le_bytes());
    }
    value
}

/// Typed view of a PSBT input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Input {
    /// The outpoint spent by this input, from the unsigned transaction.
    pub previous_output: OutPoint,
    pub non_witness_utxo: Option<Transaction>,
    pub witness_utxo: Option<TxOut>,
    /// Raw signatures, DER-encoded with the sighash type byte.
    pub partial_sigs: BTreeMap<bitcoin::PublicKey, Vec<u8>>,
    pub sighash_type: Option<u32>,
    pub redeem_script: Option<ScriptBuf>,
    pub witness_script: Option<ScriptBuf>,
    pub bip32_derivation: Bip32Deriv,
    /// Whether a final scriptSig or witness is present.
    pub finalized: bool,
}

impl Input {
    fn from_map(map: &raw::Map, previous_output: OutPoint) -> Result<Self, PsbtError> {
        let mut input = Input {
            previous_output,
            non_witness_utxo: None,
            witness_utxo: None,
            partial_sigs: BTreeMap::new(),
            sighash_type: None,
            redeem_script: None,
            witness_script: None,
            bip32_derivation: BTreeMap::new(),
            finalized: false,
        };

        for pair in map.pairs() {
            match pair.key_type() {
                PSBT_IN_NON_WITNESS_UTXO => {
                    no_key_data(pair, "non witness utxo")?;
                    let tx: Transaction = consensus::deserialize(&pair.value)
                        .map_err(|e| malformed!("invalid non witness utxo: {}", e))?;
                    if tx.compute_txid() != previous_output.txid {
                        return Err(malformed!(
                            "non witness utxo '{}' isn't the transaction spent by '{}'",
                            tx.compute_txid(),
                            previous_output
                        ));
                    }
                    if tx.output.len() <= previous_output.vout as usize {
                        return Err(malformed!(
                            "non witness utxo has no output {}",
                            previous_output.vout
                        ));
                    }
                    input.non_witness_utxo = Some(tx);
                }
                PSBT_IN_WITNESS_UTXO => {
                    no_key_data(pair, "witness utxo")?;
                    input.witness_utxo = Some(
                        consensus::deserialize(&pair.value)
                            .map_err(|e| malformed!("invalid witness utxo: {}", e))?,
                    );
                }
                PSBT_IN_PARTIAL_SIG => {
                    let pubkey = parse_pubkey(pair.key_data(), "partial signature")?;
                    ecdsa::Signature::from_slice(&pair.value)
                        .map_err(|e| malformed!("invalid partial signature: {}", e))?;
                    input.partial_sigs.insert(pubkey, pair.value.clone());
                }
                PSBT_IN_SIGHASH_TYPE => {
                    no_key_data(pair, "sighash type")?;
                    if pair.value.len() != 4 {
                        return Err(malformed!("invalid sighash type"));
                    }
                    let v = &pair.value;
                    input.sighash_type = Some(u32::from_le_bytes([v[0], v[1], v[2], v[3]]));
                }
                PSBT_IN_REDEEM_SCRIPT => {
                    no_key_data(pair, "redeem script")?;
                    input.redeem_script = Some(ScriptBuf::from(pair.value.clone()));
                }
                PSBT_IN_WITNESS_SCRIPT => {
                    no_key_data(pair, "witness script")?;
                    input.witness_script = Some(ScriptBuf::from(pair.value.clone()));
                }
                PSBT_IN_BIP32_DERIVATION => {
                    let pubkey = parse_pubkey(pair.key_data(), "BIP32 derivation")?;
                    input
                        .bip32_derivation
                        .insert(pubkey, parse_key_source(&pair.value)?);
                }
                PSBT_IN_FINAL_SCRIPTSIG | PSBT_IN_FINAL_SCRIPTWITNESS => {
                    input.finalized = true;
                }
                _ => {}
            }
        }

        Ok(input)
    }

    /// The output spent by this input, if the PSBT contains it.
    pub fn spent_output(&self) -> Option<&TxOut> {
        self.witness_utxo.as_ref().or_else(|| {
            self.non_witness_utxo
                .as_ref()
                .and_then(|tx| tx.output.get(self.previous_output.vout as usize))
        })
    }

    pub fn has_signature_from(&self, pubkey: &bitcoin::PublicKey) -> bool {
        self.partial_sigs.contains_key(pubkey)
    }

    /// Master fingerprints of the keys which signed this input, as far as the BIP32 derivations
    /// tell.
    pub fn signed_fingerprints(&self) -> Vec<Fingerprint> {
        self.partial_sigs
            .keys()
            .filter_map(|pk| self.bip32_derivation.get(pk).map(|(fg, _)| *fg))
            .collect()
    }
}

/// Typed view of a PSBT output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    pub redeem_script: Option<ScriptBuf>,
    pub witness_script: Option<ScriptBuf>,
    pub bip32_derivation: Bip32Deriv,
}

impl Output {
    fn from_map(map: &raw::Map) -> Result<Self, PsbtError> {
        let mut output = Output {
            redeem_script: None,
            witness_script: None,
            bip32_derivation: BTreeMap::new(),
        };
        for pair in map.pairs() {
            match pair.key_type() {
                PSBT_OUT_REDEEM_SCRIPT => {
                    no_key_data(pair, "output redeem script")?;
                    output.redeem_script = Some(ScriptBuf::from(pair.value.clone()));
                }
                PSBT_OUT_WITNESS_SCRIPT => {
                    no_key_data(pair, "output witness script")?;
                    output.witness_script = Some(ScriptBuf::from(pair.value.clone()));
                }
                PSBT_OUT_BIP32_DERIVATION => {
                    let pubkey = parse_pubkey(pair.key_data(), "output BIP32 derivation")?;
                    output
                        .bip32_derivation
                        .insert(pubkey, parse_key_source(&pair.value)?);
                }
                _ => {}
            }
        }
        Ok(output)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Psbt {
    raw: RawPsbt,
    unsigned_tx: Transaction,
    inputs: Vec<Input>,
    outputs: Vec<Output>,
}

impl fmt::Display for Psbt {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            base64::engine::general_purpose::STANDARD.encode(self.serialize())
        )
    }
}

impl FromStr for Psbt {
    type Err = PsbtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(s.trim())
            .map_err(|e| malformed!("invalid base64: {}", e))?;
        Self::from_bytes(&bytes)
    }
}

impl Psbt {
    /// Parse a binary PSBT.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PsbtError> {
        let (raw, unsigned_tx) = RawPsbt::decode(bytes)?;
        Self::from_raw(raw, unsigned_tx)
    }

    /// Parse a PSBT either in binary form or encoded in base64.
    pub fn parse(data: &[u8]) -> Result<Self, PsbtError> {
        if data.starts_with(PSBT_MAGIC) {
            Self::from_bytes(data)
        } else {
            let s = str::from_utf8(data).map_err(|_| malformed!("neither binary nor base64"))?;
            Self::from_str(s)
        }
    }

    /// Create an empty PSBT for this unsigned transaction.
    pub fn from_unsigned_tx(tx: Transaction) -> Result<Self, PsbtError> {
        Self::from_bytes(&RawPsbt::from_unsigned_tx(&tx).encode())
    }

    fn from_raw(raw: RawPsbt, unsigned_tx: Transaction) -> Result<Self, PsbtError> {
        if unsigned_tx.input.is_empty() {
            return Err(malformed!("transaction has no input"));
        }
        let inputs = raw
            .inputs
            .iter()
            .zip(unsigned_tx.input.iter())
            .map(|(map, txin)| Input::from_map(map, txin.previous_output))
            .collect::<Result<Vec<_>, _>>()?;
        let outputs = raw
            .outputs
            .iter()
            .map(Output::from_map)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Psbt {
            raw,
            unsigned_tx,
            inputs,
            outputs,
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        self.raw.encode()
    }

    pub fn unsigned_tx(&self) -> &Transaction {
        &self.unsigned_tx
    }

    pub fn txid(&self) -> Txid {
        self.unsigned_tx.compute_txid()
    }

    pub fn inputs(&self) -> &[Input] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[Output] {
        &self.outputs
    }

    /// The label of this PSBT, if it contains one.
    pub fn name(&self) -> Option<String> {
        self.raw
            .global
            .get(PSBT_GLOBAL_NAME)
            .and_then(|v| String::from_utf8(v.to_vec()).ok())
    }

    pub fn set_name(&mut self, name: &str) {
        self.raw.global.upsert(Pair {
            key: PSBT_GLOBAL_NAME.to_vec(),
            value: name.as_bytes().to_vec(),
        });
    }

    // Set a field of an input and refresh its typed view. Nothing is changed if the resulting
    // input is invalid.
    fn update_input(&mut self, index: usize, pair: Pair) -> Result<(), PsbtError> {
        let map = self
            .raw
            .inputs
            .get_mut(index)
            .ok_or(PsbtError::InputIndex(index))?;
        let mut updated = map.clone();
        updated.upsert(pair);
        let input = Input::from_map(&updated, self.unsigned_tx.input[index].previous_output)?;
        *map = updated;
        self.inputs[index] = input;
        Ok(())
    }

    pub fn set_witness_utxo(&mut self, index: usize, txout: &TxOut) -> Result<(), PsbtError> {
        let value = consensus::serialize(txout);
        self.update_input(index, Pair::new(PSBT_IN_WITNESS_UTXO, &[], value))
    }

    pub fn set_non_witness_utxo(
        &mut self,
        index: usize,
        tx: &Transaction,
    ) -> Result<(), PsbtError> {
        let value = consensus::serialize(tx);
        self.update_input(index, Pair::new(PSBT_IN_NON_WITNESS_UTXO, &[], value))
    }

    pub fn set_sighash_type(&mut self, index: usize, sighash_type: u32) -> Result<(), PsbtError> {
        let value = sighash_type.to_le_bytes().to_vec();
        self.update_input(index, Pair::new(PSBT_IN_SIGHASH_TYPE, &[], value))
    }

    pub fn set_witness_script(
        &mut self,
        index: usize,
        script: ScriptBuf,
    ) -> Result<(), PsbtError> {
        self.update_input(
            index,
            Pair::new(PSBT_IN_WITNESS_SCRIPT, &[], script.into_bytes()),
        )
    }

    pub fn set_redeem_script(&mut self, index: usize, script: ScriptBuf) -> Result<(), PsbtError> {
        self.update_input(
            index,
            Pair::new(PSBT_IN_REDEEM_SCRIPT, &[], script.into_bytes()),
        )
    }

    pub fn set_bip32_derivation(
        &mut self,
        index: usize,
        pubkey: bitcoin::PublicKey,
        fingerprint: Fingerprint,
        path: DerivationPath,
    ) -> Result<(), PsbtError> {
        let value = serialize_key_source(fingerprint, &path);
        self.update_input(
            index,
            Pair::new(PSBT_IN_BIP32_DERIVATION, &pubkey.to_bytes(), value),
        )
    }

    pub fn set_output_bip32_derivation(
        &mut self,
        index: usize,
        pubkey: bitcoin::PublicKey,
        fingerprint: Fingerprint,
        path: DerivationPath,
    ) -> Result<(), PsbtError> {
        let map = self
            .raw
            .outputs
            .get_mut(index)
            .ok_or(PsbtError::OutputIndex(index))?;
        map.upsert(Pair::new(
            PSBT_OUT_BIP32_DERIVATION,
            &pubkey.to_bytes(),
            serialize_key_source(fingerprint, &path),
        ));
        self.outputs[index] = Output::from_map(map)?;
        Ok(())
    }

    /// Store a signature for this public key in this input. If there is already one, nothing is
    /// changed.
    pub fn insert_signature(
        &mut self,
        index: usize,
        pubkey: bitcoin::PublicKey,
        signature: ecdsa::Signature,
    ) -> Result<Insertion, PsbtError> {
        let input = self
            .inputs
            .get_mut(index)
            .ok_or(PsbtError::InputIndex(index))?;
        if input.has_signature_from(&pubkey) {
            return Ok(Insertion::AlreadyPresent);
        }

        let value = signature.to_vec();
        let inserted = self.raw.inputs[index].insert_new(Pair::new(
            PSBT_IN_PARTIAL_SIG,
            &pubkey.to_bytes(),
            value.clone(),
        ));
        debug_assert!(inserted, "Typed and raw inputs are always in sync");
        input.partial_sigs.insert(pubkey, value);
        Ok(Insertion::Inserted)
    }

    /// Inputs of this wallet which this key may sign and doesn't have a signature for yet.
    pub fn inputs_needing_signature_from(
        &self,
        wallet: &WalletDescriptor,
        pubkey: &bitcoin::PublicKey,
        secp: &secp256k1::Secp256k1<impl secp256k1::Verification>,
    ) -> Vec<usize> {
        self.inputs
            .iter()
            .enumerate()
            .filter(|(_, input)| !input.finalized && !input.has_signature_from(pubkey))
            .filter(|(_, input)| {
                wallet
                    .locate_input(input, secp)
                    .map(|located| located.script.is_signer(pubkey))
                    .unwrap_or(false)
            })
            .map(|(index, _)| index)
            .collect()
    }

    /// Whether every input has enough signatures from distinct cosigners of this wallet, or is
    /// already finalized.
    pub fn is_complete(
        &self,
        wallet: &WalletDescriptor,
        secp: &secp256k1::Secp256k1<impl secp256k1::Verification>,
    ) -> bool {
        self.inputs.iter().all(|input| {
            input.finalized
                || wallet
                    .locate_input(input, secp)
                    .map(|located| {
                        let signers = located
                            .script
                            .signers
                            .iter()
                            .filter(|s| input.has_signature_from(&s.pubkey))
                            .count();
                        signers >= wallet.threshold()
                    })
                    .unwrap_or(false)
        })
    }

    pub fn signed_fingerprints(&self, index: usize) -> Result<Vec<Fingerprint>, PsbtError> {
        self.inputs
            .get(index)
            .map(Input::signed_fingerprints)
            .ok_or(PsbtError::InputIndex(index))
    }

    /// Merge the signatures from another PSBT for the same transaction. Returns the number of
    /// signatures which weren't already present.
    pub fn combine(&mut self, other: &Psbt) -> Result<usize, PsbtError> {
        if other.txid() != self.txid() {
            return Err(PsbtError::DifferentTransaction {
                expected: self.txid(),
                found: other.txid(),
            });
        }

        let mut added = 0;
        for (index, other_in) in other.raw.inputs.iter().enumerate() {
            let map = &mut self.raw.inputs[index];
            for pair in other_in.pairs() {
                if pair.key_type() == PSBT_IN_PARTIAL_SIG && map.insert_new(pair.clone()) {
                    added += 1;
                }
            }
            self.inputs[index] =
                Input::from_map(map, self.unsigned_tx.input[index].previous_output)?;
        }

        Ok(added)
    }

    /// A human readable view of this PSBT.
    pub fn summary(
        &self,
        wallet: &WalletDescriptor,
        network: bitcoin::Network,
        secp: &secp256k1::Secp256k1<impl secp256k1::Verification>,
    ) -> PsbtSummary {
        let inputs: Vec<InputSummary> = self
            .inputs
            .iter()
            .map(|input| InputSummary {
                outpoint: input.previous_output,
                value: input.spent_output().map(|txo| txo.value.to_sat()),
                wallet_path: wallet
                    .locate_input(input, secp)
                    .map(|l| wallet_path(l.keychain, l.index)),
                signed_by: input.signed_fingerprints(),
            })
            .collect();
        let outputs: Vec<OutputSummary> = self
            .unsigned_tx
            .output
            .iter()
            .zip(self.outputs.iter())
            .map(|(txout, psbt_out)| OutputSummary {
                address: bitcoin::Address::from_script(&txout.script_pubkey, network)
                    .map(|a| a.to_string())
                    .ok(),
                value: txout.value.to_sat(),
                wallet_path: wallet
                    .locate_output(psbt_out, txout, secp)
                    .map(|(keychain, index)| wallet_path(keychain, index)),
            })
            .collect();

        let input_total = inputs
            .iter()
            .map(|i| i.value)
            .sum::<Option<u64>>();
        let output_total: u64 = outputs.iter().map(|o| o.value).sum();
        let fee = input_total.and_then(|total| total.checked_sub(output_total));

        let received: i64 = outputs
            .iter()
            .filter(|o| o.wallet_path.is_some())
            .map(|o| o.value as i64)
            .sum();
        let spent: i64 = inputs
            .iter()
            .filter(|i| i.wallet_path.is_some())
            .filter_map(|i| i.value)
            .map(|v| v as i64)
            .sum();

        PsbtSummary {
            txid: self.txid(),
            name: self.name(),
            inputs,
            outputs,
            fee,
            balance: received - spent,
            info: self.privacy_notes(),
            size: SizeSummary {
                unsigned_vbytes: self.unsigned_tx.vsize(),
                psbt_bytes: self.serialize().len(),
            },
            required_sig: wallet.threshold(),
            complete: self.is_complete(wallet, secp),
        }
    }

    // Notes about what this transaction may reveal to a chain observer.
    fn privacy_notes(&self) -> Vec<String> {
        let mut info = Vec::new();
        let outputs = &self.unsigned_tx.output;
        let spent: Vec<&TxOut> = self
            .inputs
            .iter()
            .filter_map(|input| input.spent_output())
            .collect();

        let script_types: HashSet<_> = outputs
            .iter()
            .map(|txo| script_type(&txo.script_pubkey))
            .collect();
        if script_types.len() > 1 {
            info.push(PRIVACY_SCRIPT_TYPES.to_string());
        }

        let precisions: Vec<u32> = outputs
            .iter()
            .map(|txo| round_digits(txo.value.to_sat()))
            .collect();
        if let (Some(max), Some(min)) = (precisions.iter().max(), precisions.iter().min()) {
            if max - min >= 3 {
                info.push(PRIVACY_PRECISION.to_string());
            }
        }

        // Only if all the spent amounts are known.
        if self.inputs.len() > 1 && spent.len() == self.inputs.len() {
            let smallest_input = spent.iter().map(|txo| txo.value).min();
            if let Some(smallest_input) = smallest_input {
                if outputs.iter().any(|txo| txo.value < smallest_input) {
                    info.push(PRIVACY_UNNECESSARY_INPUT.to_string());
                }
            }
        }

        let spent_scripts: HashSet<&ScriptBuf> =
            spent.iter().map(|txo| &txo.script_pubkey).collect();
        if outputs
            .iter()
            .any(|txo| spent_scripts.contains(&txo.script_pubkey))
        {
            info.push(PRIVACY_ADDRESS_REUSE.to_string());
        }

        info
    }
}

pub const PRIVACY_SCRIPT_TYPES: &str = "Privacy: outputs have different script types https://en.bitcoin.it/wiki/Privacy#Sending_to_a_different_script_type";
pub const PRIVACY_PRECISION: &str =
    "Privacy: outputs have different precision https://en.bitcoin.it/wiki/Privacy#Round_numbers";
pub const PRIVACY_UNNECESSARY_INPUT: &str = "Privacy: smallest output is smaller than smallest input https://en.bitcoin.it/wiki/Privacy#Unnecessary_input_heuristic";
pub const PRIVACY_ADDRESS_REUSE: &str =
    "Privacy: address reuse https://en.bitcoin.it/wiki/Privacy#Address_reuse";

// The standard template of this script, if any.
fn script_type(script: &bitcoin::Script) -> Option<&'static str> {
    if script.is_p2pk() {
        Some("p2pk")
    } else if script.is_p2pkh() {
        Some("p2pkh")
    } else if script.is_p2sh() {
        Some("p2sh")
    } else if script.is_p2wpkh() {
        Some("p2wpkh")
    } else if script.is_p2wsh() {
        Some("p2wsh")
    } else if script.is_p2tr() {
        Some("p2tr")
    } else {
        None
    }
}

// The number of trailing zeros of this amount in base 10.
fn round_digits(mut value: u64) -> u32 {
    if value == 0 {
        return 0;
    }
    let mut digits = 0;
    while value % 10 == 0 {
        value /= 10;
        digits += 1;
    }
    digits
}

fn wallet_path(keychain: Keychain, index: u32) -> String {
    format!("{}/{}", keychain, index)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InputSummary {
    pub outpoint: OutPoint,
    /// In satoshis, if the spent output is known.
    pub value: Option<u64>,
    /// Keychain and derivation index if it spends a coin of the wallet.
    pub wallet_path: Option<String>,
    pub signed_by: Vec<Fingerprint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputSummary {
    pub address: Option<String>,
    pub value: u64,
    /// Keychain and derivation index if it pays back to the wallet.
    pub wallet_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PsbtSummary {
    pub txid: Txid,
    pub name: Option<String>,
    pub inputs: Vec<InputSummary>,
    pub outputs: Vec<OutputSummary>,
    /// In satoshis, if all spent outputs are known.
    pub fee: Option<u64>,
    /// Change of the wallet balance in satoshis: what is paid back to the wallet minus the wallet
    /// coins spent.
    pub balance: i64,
    /// Privacy notes.
    pub info: Vec<String>,
    pub size: SizeSummary,
    pub required_sig: usize,
    pub complete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SizeSummary {
    /// Virtual size of the transaction without any signature.
    pub unsigned_vbytes: usize,
    pub psbt_bytes: usize,
}

impl fmt::Display for PsbtSummary {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Transaction {}", self.txid)?;
        if let Some(ref name) = self.name {
            writeln!(f, "Name: {}", name)?;
        }
        writeln!(f, "Inputs:")?;
        for (i, input) in self.inputs.iter().enumerate() {
            let value = input
                .value
                .map(|v| format!("{} sat", v))
                .unwrap_or_else(|| "unknown value".to_string());
            let signed_by = input
                .signed_by
                .iter()
                .map(|fg| fg.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            writeln!(
                f,
                "  #{} {} {} [{}] signatures: {}/{} ({})",
                i,
                input.outpoint,
                value,
                input.wallet_path.as_deref().unwrap_or("external"),
                input.signed_by.len(),
                self.required_sig,
                signed_by
            )?;
        }
        writeln!(f, "Outputs:")?;
        for (i, output) in self.outputs.iter().enumerate() {
            write!(
                f,
                "  #{} {} {} sat",
                i,
                output.address.as_deref().unwrap_or("non-standard script"),
                output.value
            )?;
            if let Some(ref path) = output.wallet_path {
                write!(f, " [{}]", path)?;
            }
            writeln!(f)?;
        }
        match self.fee {
            Some(fee) => writeln!(f, "Fee: {} sat", fee)?,
            None => writeln!(f, "Fee: unknown")?,
        }
        writeln!(f, "Wallet balance change: {} sat", self.balance)?;
        writeln!(
            f,
            "Size: {} vbytes unsigned, PSBT of {} bytes",
            self.size.unsigned_vbytes, self.size.psbt_bytes
        )?;
        for note in self.info.iter() {
            writeln!(f, "{}", note)?;
        }
        write!(
            f,
            "Complete: {}",
            if self.complete { "yes" } else { "no" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{descriptors::Keychain, keys::ExtendedKey, testutils::*};

    use miniscript::bitcoin::{absolute, bip32, transaction, Amount, Sequence, TxIn, Witness};

    fn bob_signature() -> (bitcoin::PublicKey, ecdsa::Signature) {
        let secp = secp256k1::Secp256k1::new();
        let bob = ExtendedKey::parse(BOB_TPRV, bitcoin::Network::Testnet, &secp).unwrap();
        let path = bip32::DerivationPath::from_str("m/0/0").unwrap();
        let msg = secp256k1::Message::from_digest([1; 32]);
        let (pubkey, sig) = bob.signing_key().unwrap().sign_ecdsa(&path, &msg, &secp).unwrap();
        (pubkey, ecdsa::Signature::sighash_all(sig))
    }

    #[test]
    fn psbt_parsing() {
        let psbt = Psbt::from_str(SAMPLE_PSBT).unwrap();
        assert_eq!(psbt.to_string(), SAMPLE_PSBT);
        let bytes = psbt.serialize();
        assert_eq!(Psbt::from_bytes(&bytes).unwrap(), psbt);
        assert_eq!(Psbt::parse(&bytes).unwrap(), psbt);
        assert_eq!(Psbt::parse(SAMPLE_PSBT.as_bytes()).unwrap(), psbt);

        assert_eq!(psbt.name(), Some("to-carol".to_string()));
        assert_eq!(
            psbt.txid().to_string(),
            psbt.unsigned_tx().compute_txid().to_string()
        );
        assert_eq!(psbt.inputs().len(), 1);
        assert_eq!(psbt.outputs().len(), 1);

        let input = &psbt.inputs()[0];
        assert_eq!(
            input.previous_output.to_string(),
            "fbd00e5b9e8152c04214c72c791a78a65fdbab68b5c6164ff0d8b22a006c5221:1"
        );
        assert_eq!(input.witness_utxo.as_ref().unwrap().value.to_sat(), 568_341);
        assert_eq!(input.spent_output(), input.witness_utxo.as_ref());
        assert!(input.non_witness_utxo.is_some());
        assert!(input.witness_script.is_some());
        assert!(input.redeem_script.is_none());
        assert!(input.partial_sigs.is_empty());
        assert!(!input.finalized);
        assert_eq!(input.sighash_type, None);
        let fingerprints: Vec<_> = input
            .bip32_derivation
            .values()
            .map(|(fg, path)| (fg.to_string(), path.to_string()))
            .collect();
        assert_eq!(
            fingerprints,
            vec![
                ("1f5e43d8".to_string(), "0/0".to_string()),
                ("a2ebe04e".to_string(), "0/0".to_string())
            ]
        );
    }

    #[test]
    fn psbt_malformed() {
        for invalid in &[
            "",
            "not base64!",
            "cHNidP8=",
            // Valid base64 of a valid PSBT prefix
            &SAMPLE_PSBT[..100],
        ] {
            assert!(
                matches!(Psbt::from_str(invalid), Err(PsbtError::Malformed(_))),
                "{}",
                invalid
            );
        }
        assert!(matches!(
            Psbt::parse(&[0xff, 0xfe, 0x00]),
            Err(PsbtError::Malformed(_))
        ));

        // Bad typed values.
        let psbt = sample_psbt();
        let mut bad = psbt.clone();
        assert!(matches!(
            bad.update_input(0, Pair::new(PSBT_IN_SIGHASH_TYPE, &[], vec![1, 0])),
            Err(PsbtError::Malformed(_))
        ));
        assert!(matches!(
            bad.update_input(0, Pair::new(PSBT_IN_WITNESS_UTXO, &[], vec![1, 0])),
            Err(PsbtError::Malformed(_))
        ));
        assert!(matches!(
            bad.update_input(0, Pair::new(PSBT_IN_BIP32_DERIVATION, &[0x02; 33], vec![0; 5])),
            Err(PsbtError::Malformed(_))
        ));
        assert!(matches!(
            bad.update_input(0, Pair::new(PSBT_IN_PARTIAL_SIG, &[0x02; 3], vec![0; 4])),
            Err(PsbtError::Malformed(_))
        ));
        assert!(matches!(
            bad.update_input(0, Pair::new(PSBT_IN_WITNESS_SCRIPT, &[0x01], vec![])),
            Err(PsbtError::Malformed(_))
        ));
        assert_eq!(
            bad.update_input(1, Pair::new(PSBT_IN_SIGHASH_TYPE, &[], vec![1, 0, 0, 0])),
            Err(PsbtError::InputIndex(1))
        );
        // Nothing was modified.
        assert_eq!(bad, psbt);

        // The previous transaction must be the one spent.
        let prev_tx = psbt.inputs()[0].non_witness_utxo.clone().unwrap();
        let mut other_prev_tx = prev_tx.clone();
        other_prev_tx.lock_time = absolute::LockTime::from_consensus(1);
        assert!(matches!(
            bad.set_non_witness_utxo(0, &other_prev_tx),
            Err(PsbtError::Malformed(_))
        ));
        bad.set_non_witness_utxo(0, &prev_tx).unwrap();
        assert_eq!(bad, psbt);

        // No input.
        let tx = transaction::Transaction {
            version: transaction::Version::TWO,
            lock_time: absolute::LockTime::ZERO,
            input: vec![],
            output: psbt.unsigned_tx().output.clone(),
        };
        assert!(matches!(
            Psbt::from_unsigned_tx(tx),
            Err(PsbtError::Malformed(_))
        ));
    }

    #[test]
    fn psbt_name() {
        let mut psbt = sample_psbt();
        psbt.set_name("to-dave");
        assert_eq!(psbt.name(), Some("to-dave".to_string()));
        let bytes = psbt.serialize();
        assert_eq!(bytes.len(), sample_psbt().serialize().len() - 1);
        assert_eq!(
            Psbt::from_bytes(&bytes).unwrap().name(),
            Some("to-dave".to_string())
        );

        let tx = sample_psbt().unsigned_tx().clone();
        assert_eq!(Psbt::from_unsigned_tx(tx).unwrap().name(), None);
    }

    #[test]
    fn signature_insertion() {
        let secp = secp256k1::Secp256k1::new();
        let wallet = sample_wallet(&secp);
        let mut psbt = sample_psbt();
        let original = psbt.serialize();
        let (bob_pubkey, sig) = bob_signature();

        assert_eq!(
            psbt.inputs_needing_signature_from(&wallet, &bob_pubkey, &secp),
            vec![0]
        );
        assert_eq!(
            psbt.insert_signature(0, bob_pubkey, sig),
            Ok(Insertion::Inserted)
        );
        assert!(psbt.inputs()[0].has_signature_from(&bob_pubkey));
        assert!(psbt
            .inputs_needing_signature_from(&wallet, &bob_pubkey, &secp)
            .is_empty());
        assert_eq!(
            psbt.signed_fingerprints(0).unwrap(),
            vec![Fingerprint::from_str("1f5e43d8").unwrap()]
        );

        // The signature is appended to the input map, the rest is untouched.
        let signed = psbt.serialize();
        let sig_pair_len = 1 + 34 + 1 + sig.to_vec().len();
        assert_eq!(signed.len(), original.len() + sig_pair_len);
        let input_map_end = original.len() - 2;
        assert_eq!(&signed[..input_map_end], &original[..input_map_end]);
        assert_eq!(Psbt::from_bytes(&signed).unwrap(), psbt);

        // A second insertion for the same key doesn't change anything, even with another value.
        let (_, other_sig) = {
            let secp = secp256k1::Secp256k1::new();
            let bob = ExtendedKey::parse(BOB_TPRV, bitcoin::Network::Testnet, &secp).unwrap();
            let path = bip32::DerivationPath::from_str("m/0/0").unwrap();
            let msg = secp256k1::Message::from_digest([2; 32]);
            bob.signing_key().unwrap().sign_ecdsa(&path, &msg, &secp).unwrap()
        };
        assert_eq!(
            psbt.insert_signature(0, bob_pubkey, ecdsa::Signature::sighash_all(other_sig)),
            Ok(Insertion::AlreadyPresent)
        );
        assert_eq!(psbt.serialize(), signed);

        assert_eq!(
            psbt.insert_signature(1, bob_pubkey, sig),
            Err(PsbtError::InputIndex(1))
        );

        // Carol isn't a signer for this input.
        let carol = ExtendedKey::parse(CAROL_TPUB, bitcoin::Network::Testnet, &secp).unwrap();
        let carol_pubkey = carol
            .derive_public_key(&bip32::DerivationPath::from_str("m/0/0").unwrap(), &secp)
            .unwrap();
        assert!(psbt
            .inputs_needing_signature_from(&wallet, &carol_pubkey, &secp)
            .is_empty());
    }

    #[test]
    fn psbt_completion() {
        let secp = secp256k1::Secp256k1::new();
        let wallet = sample_wallet(&secp);
        let mut psbt = sample_psbt();
        assert!(!psbt.is_complete(&wallet, &secp));

        let (bob_pubkey, sig) = bob_signature();
        psbt.insert_signature(0, bob_pubkey, sig).unwrap();
        assert!(!psbt.is_complete(&wallet, &secp));

        // A signature from a key which isn't a signer of the input doesn't count.
        let carol = ExtendedKey::parse(CAROL_TPUB, bitcoin::Network::Testnet, &secp).unwrap();
        let carol_pubkey = carol
            .derive_public_key(&bip32::DerivationPath::from_str("m/0/0").unwrap(), &secp)
            .unwrap();
        let mut with_carol = psbt.clone();
        with_carol.insert_signature(0, carol_pubkey, sig).unwrap();
        assert!(!with_carol.is_complete(&wallet, &secp));

        let alice = ExtendedKey::parse(ALICE_TPRV, bitcoin::Network::Testnet, &secp).unwrap();
        let alice_pubkey = alice
            .derive_public_key(&bip32::DerivationPath::from_str("m/0/0").unwrap(), &secp)
            .unwrap();
        psbt.insert_signature(0, alice_pubkey, sig).unwrap();
        assert!(psbt.is_complete(&wallet, &secp));
    }

    #[test]
    fn psbt_combine() {
        let secp = secp256k1::Secp256k1::new();
        let wallet = sample_wallet(&secp);
        let (bob_pubkey, sig) = bob_signature();

        let mut psbt = sample_psbt();
        let mut signed = sample_psbt();
        signed.insert_signature(0, bob_pubkey, sig).unwrap();
        assert_eq!(psbt.combine(&signed), Ok(1));
        assert_eq!(psbt, signed);
        assert_eq!(psbt.combine(&signed), Ok(0));

        let other = psbt_spending(&wallet, &[(Keychain::RECEIVE, 0, 1_000)], &secp);
        assert_eq!(
            psbt.combine(&other),
            Err(PsbtError::DifferentTransaction {
                expected: psbt.txid(),
                found: other.txid()
            })
        );
    }

    #[test]
    fn psbt_construction() {
        let secp = secp256k1::Secp256k1::new();
        let wallet = sample_wallet(&secp);
        let script = wallet.script_for(Keychain::RECEIVE, 3, &secp).unwrap();
        let prev_tx = transaction::Transaction {
            version: transaction::Version::TWO,
            lock_time: absolute::LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(42_000),
                script_pubkey: script.script_pubkey.clone(),
            }],
        };
        let tx = transaction::Transaction {
            version: transaction::Version::TWO,
            lock_time: absolute::LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::new(prev_tx.compute_txid(), 0),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(41_000),
                script_pubkey: script.script_pubkey.clone(),
            }],
        };

        let mut psbt = Psbt::from_unsigned_tx(tx).unwrap();
        assert_eq!(wallet.locate_input(&psbt.inputs()[0], &secp), None);
        psbt.set_non_witness_utxo(0, &prev_tx).unwrap();
        wallet
            .update_psbt_in(Keychain::RECEIVE, 3, &mut psbt, 0, &secp)
            .unwrap();
        psbt.set_sighash_type(0, 1).unwrap();
        let input = &psbt.inputs()[0];
        assert_eq!(input.spent_output(), Some(&prev_tx.output[0]));
        assert_eq!(input.witness_script, script.witness_script);
        assert_eq!(input.bip32_derivation.len(), 2);
        assert_eq!(input.sighash_type, Some(1));
        let located = wallet.locate_input(input, &secp).unwrap();
        assert_eq!(located.index, 3);

        // Roundtrips.
        assert_eq!(Psbt::from_bytes(&psbt.serialize()).unwrap(), psbt);
        assert_eq!(Psbt::from_str(&psbt.to_string()).unwrap(), psbt);

        let summary = psbt.summary(&wallet, bitcoin::Network::Testnet, &secp);
        assert_eq!(summary.inputs[0].value, Some(42_000));
        assert_eq!(summary.inputs[0].wallet_path.as_deref(), Some("receive/3"));
        assert_eq!(summary.fee, Some(1_000));
        assert!(!summary.complete);
        assert_eq!(summary.name, None);
        // It pays back to the very same script, unbeknownst to the wallet.
        assert_eq!(summary.balance, -42_000);
        assert_eq!(summary.info, vec![PRIVACY_ADDRESS_REUSE.to_string()]);
    }

    #[test]
    fn psbt_summary() {
        let secp = secp256k1::Secp256k1::new();
        let wallet = sample_wallet(&secp);
        let mut psbt = sample_psbt();
        let (bob_pubkey, sig) = bob_signature();
        psbt.insert_signature(0, bob_pubkey, sig).unwrap();

        let summary = psbt.summary(&wallet, bitcoin::Network::Testnet, &secp);
        assert_eq!(summary.txid, psbt.txid());
        assert_eq!(summary.name.as_deref(), Some("to-carol"));
        assert_eq!(summary.inputs.len(), 1);
        assert_eq!(summary.inputs[0].value, Some(568_341));
        assert_eq!(summary.inputs[0].wallet_path.as_deref(), Some("receive/0"));
        assert_eq!(
            summary.inputs[0].signed_by,
            vec![Fingerprint::from_str("1f5e43d8").unwrap()]
        );
        assert_eq!(summary.outputs.len(), 1);
        assert_eq!(summary.outputs[0].value, 568_158);
        assert!(summary.outputs[0].address.as_ref().unwrap().starts_with('2'));
        assert_eq!(summary.outputs[0].wallet_path, None);
        assert_eq!(summary.fee, Some(183));
        assert_eq!(summary.required_sig, 2);
        assert!(!summary.complete);
        assert_eq!(summary.balance, -568_341);
        assert!(summary.info.is_empty());
        assert_eq!(summary.size.unsigned_vbytes, 83);
        assert_eq!(summary.size.psbt_bytes, psbt.serialize().len());

        let printed = summary.to_string();
        assert!(printed.contains("Name: to-carol"));
        assert!(printed.contains("signatures: 1/2 (1f5e43d8)"));
        assert!(printed.contains("Fee: 183 sat"));
        assert!(printed.contains("Wallet balance change: -568341 sat"));
        assert!(printed.contains("Size: 83 vbytes unsigned"));
        assert!(!printed.contains("Privacy"));
        assert!(printed.ends_with("Complete: no"));
    }

    #[test]
    fn summary_privacy_notes() {
        let secp = secp256k1::Secp256k1::new();
        let wallet = sample_wallet(&secp);
        let coins = [(Keychain::RECEIVE, 1, 50_000), (Keychain::RECEIVE, 2, 70_000)];
        let spending = psbt_spending(&wallet, &coins, &secp);

        // Pay a round amount to a P2PKH and send the change back to the wallet.
        let change = wallet.script_for(Keychain::RECEIVE, 5, &secp).unwrap();
        let external =
            ScriptBuf::from_hex("76a91402306a7c23f3e8010de41e9e591348bb83f11daa88ac").unwrap();
        let mut tx = spending.unsigned_tx().clone();
        tx.output = vec![
            TxOut {
                value: Amount::from_sat(12_345),
                script_pubkey: change.script_pubkey,
            },
            TxOut {
                value: Amount::from_sat(100_000),
                script_pubkey: external,
            },
        ];
        let mut psbt = Psbt::from_unsigned_tx(tx).unwrap();
        for (i, (keychain, index, _)) in coins.iter().enumerate() {
            let spent = spending.inputs()[i].spent_output().unwrap().clone();
            psbt.set_witness_utxo(i, &spent).unwrap();
            wallet
                .update_psbt_in(*keychain, *index, &mut psbt, i, &secp)
                .unwrap();
        }
        wallet
            .update_psbt_out(Keychain::RECEIVE, 5, &mut psbt, 0, &secp)
            .unwrap();

        let summary = psbt.summary(&wallet, bitcoin::Network::Testnet, &secp);
        assert_eq!(summary.fee, Some(7_655));
        assert_eq!(summary.outputs[0].wallet_path.as_deref(), Some("receive/5"));
        assert_eq!(summary.balance, 12_345 - 120_000);
        assert_eq!(
            summary.info,
            vec![
                PRIVACY_SCRIPT_TYPES.to_string(),
                PRIVACY_PRECISION.to_string(),
                PRIVACY_UNNECESSARY_INPUT.to_string(),
            ]
        );
        assert!(summary
            .to_string()
            .contains("Privacy: outputs have different precision"));

        // Without the spent amounts, no guess is made about unnecessary inputs.
        let unknown = Psbt::from_unsigned_tx(psbt.unsigned_tx().clone()).unwrap();
        let summary = unknown.summary(&wallet, bitcoin::Network::Testnet, &secp);
        assert_eq!(summary.fee, None);
        assert_eq!(summary.balance, 0);
        assert_eq!(
            summary.info,
            vec![
                PRIVACY_SCRIPT_TYPES.to_string(),
                PRIVACY_PRECISION.to_string(),
            ]
        );
    }

    #[test]
    fn amount_round_digits() {
        assert_eq!(round_digits(0), 0);
        assert_eq!(round_digits(3), 0);
        assert_eq!(round_digits(10), 1);
        assert_eq!(round_digits(11), 0);
        assert_eq!(round_digits(1_100), 2);
        assert_eq!(round_digits(1_100_030), 1);
        assert_eq!(round_digits(10_000_000_000_000_000_000), 19);
    }
}
