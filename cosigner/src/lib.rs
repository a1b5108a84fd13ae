//! # Cosigner
//!
//! Signing engine for multisig wallets. Given an extended private key, the descriptor of a wallet
//! it is a cosigner of and a PSBT spending from this wallet, add the signatures the key is able to
//! provide and report what changed.

pub mod descriptors;
pub mod keys;
pub mod psbt;
pub mod signer;
pub mod testutils;

pub use miniscript;
