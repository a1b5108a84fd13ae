//! Sample keys, wallet and PSBT shared by the unit tests of this crate and the tests of its
//! dependents.

use crate::{
    descriptors::{Keychain, WalletDescriptor},
    psbt::Psbt,
};

use std::str::FromStr;

use miniscript::bitcoin::{
    absolute, bip32::Fingerprint, secp256k1, transaction, Amount, OutPoint, ScriptBuf, Sequence,
    Transaction, TxIn, TxOut, Txid, Witness,
};

/// Alice's master key, fingerprint `a2ebe04e`.
pub const ALICE_TPRV: &str = "tprv8ZgxMBicQKsPfEf2t9eG7j14CDjS3JWL9nY3wgg6ZsLKY4tsR4wZjYuLsXWdyBPrMPo73JgeKmbd8pTkZZgQNWTdvCtDuauf52XGKL9zTDw";
pub const ALICE_TPUB: &str = "tpubD6NzVbkrYhZ4YhgpmoJrX8fAmFFNCdhEj68qECiPz98iNZ9e3Tm9v3XD3fzHZfBoLqeSm9oLtighoeijQ9jGAFm9raQ4JqHZ1N4BHyaBz6Y";
/// Bob's master key, fingerprint `1f5e43d8`.
pub const BOB_TPRV: &str = "tprv8ZgxMBicQKsPetwSbvkSob1PLvNeBzHftBgG61S37ywMpsCnKMkUhPbKp7FyZDsU2QvMqbF797DRqmwedPQnR5qqmUBkFVb7iNeKcEZv3ck";
pub const BOB_TPUB: &str = "tpubD6NzVbkrYhZ4YMyEVaR3CzfVuwtaMKUaTVH3NXULYFjkfMTYwka4stDBzHhHkxd4MEMVgyyEV1WBCrpwde72w8LzjAE6oRLARBAiCD8cGQV";
/// Carol's master key, fingerprint `f335a93a`. Not a cosigner of the sample wallet.
pub const CAROL_TPRV: &str = "tprv8ZgxMBicQKsPfFZUYhyjqwFjy9siLzfF1b193zDqUmPYRUoAi3K2T48ziXyZCKRxfotn8XiZjra26hL6PKAfPFh2hEYnsET6vc8pEmkLipo";
pub const CAROL_TPUB: &str = "tpubD6NzVbkrYhZ4YibGSMeLFLurYBPeWKr9atbvLWG8u3BwFy3wLS8cdYkrth98xeqUpVn5wpuvUNiif1UwRuHo1axu1ZZPAz4Pd8tbHT7UBGF";

/// 2-of-2 between Alice and Bob.
pub const WALLET_DESCRIPTOR: &str = "wsh(multi(2,tpubD6NzVbkrYhZ4YhgpmoJrX8fAmFFNCdhEj68qECiPz98iNZ9e3Tm9v3XD3fzHZfBoLqeSm9oLtighoeijQ9jGAFm9raQ4JqHZ1N4BHyaBz6Y/0/*,tpubD6NzVbkrYhZ4YMyEVaR3CzfVuwtaMKUaTVH3NXULYFjkfMTYwka4stDBzHhHkxd4MEMVgyyEV1WBCrpwde72w8LzjAE6oRLARBAiCD8cGQV/0/*))#wss3kl0z";
pub const WALLET_JSON: &str = r#"{"name":"alice-and-bob","descriptor":"wsh(multi(2,tpubD6NzVbkrYhZ4YhgpmoJrX8fAmFFNCdhEj68qECiPz98iNZ9e3Tm9v3XD3fzHZfBoLqeSm9oLtighoeijQ9jGAFm9raQ4JqHZ1N4BHyaBz6Y/0/*,tpubD6NzVbkrYhZ4YMyEVaR3CzfVuwtaMKUaTVH3NXULYFjkfMTYwka4stDBzHhHkxd4MEMVgyyEV1WBCrpwde72w8LzjAE6oRLARBAiCD8cGQV/0/*))#wss3kl0z","fingerprints":["1f5e43d8","a2ebe04e"],"required_sig":2,"created_at_height":1835680}"#;

/// An unsigned PSBT named "to-carol" spending the first receive coin of the sample wallet.
pub const SAMPLE_PSBT: &str = "cHNidP8BAFMCAAAAASFSbAAqstjwTxbGtWir21+meBp5LMcUQsBSgZ5bDtD7AQAAAAD+////AV6rCAAAAAAAF6kU4wEfjwloN3dvCV9wNOekdO53E92HAAAAAAX8bmFtZQh0by1jYXJvbAABAKECAAAAAcyd+J9zW1wSNV/mozPMv8mcXFzwQrK1EKq/FvRPJS40AQAAACMiACC+U25ZjJg9CiGsPhlAqQ0GWtFhOWxqopXdDTrh2oBdEP3///8Cp0lVAAAAAAAXqRRUIuqRoByuLh5D6zdViHWG7aGi84cVrAgAAAAAACIAIDz80EGjAUinXjMddGAtfQ3fKqcjgWj9wY5Y+8c7NA1zoAIcAAEBKxWsCAAAAAAAIgAgPPzQQaMBSKdeMx10YC19Dd8qpyOBaP3Bjlj7xzs0DXMBBUdSIQNP26ruccaqcu2cxRFYsPON2gj4ALrAFQ5ApBVtM+z9SiECIwjICs3MMHNnGbXPgSQKezAcOC5HzejKyjATzR8qXiRSriIGAiMIyArNzDBzZxm1z4EkCnswHDguR83oysowE80fKl4kDB9eQ9gAAAAAAAAAACIGA0/bqu5xxqpy7ZzFEViw843aCPgAusAVDkCkFW0z7P1KDKLr4E4AAAAAAAAAAAAA";

pub fn sample_wallet(
    secp: &secp256k1::Secp256k1<impl secp256k1::Verification>,
) -> WalletDescriptor {
    let fingerprints = [
        Fingerprint::from_str("1f5e43d8").unwrap(),
        Fingerprint::from_str("a2ebe04e").unwrap(),
    ];
    WalletDescriptor::parse(WALLET_DESCRIPTOR, &fingerprints, 2, secp).unwrap()
}

pub fn sample_psbt() -> Psbt {
    Psbt::from_str(SAMPLE_PSBT).unwrap()
}

// A dummy transaction funding the given script, unique per value of `nonce`.
fn funding_tx(script_pubkey: ScriptBuf, value: u64, nonce: u32) -> Transaction {
    Transaction {
        version: transaction::Version::TWO,
        lock_time: absolute::LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::new(
                Txid::from_str("6f0dc2ba2b4eb1d7d6b0f8e5b0c34d9e9b2f8d4a7c8e1f2a3b4c5d6e7f8091a2")
                    .unwrap(),
                nonce,
            ),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(value),
            script_pubkey,
        }],
    }
}

/// A PSBT spending coins of this wallet at the given keychains and derivation indexes, with the
/// given values, to a single output paying back to the first coin's address. Segwit inputs are
/// given the spent output, legacy ones the whole previous transaction.
pub fn psbt_spending(
    wallet: &WalletDescriptor,
    coins: &[(Keychain, u32, u64)],
    secp: &secp256k1::Secp256k1<impl secp256k1::Verification>,
) -> Psbt {
    let funding: Vec<_> = coins
        .iter()
        .enumerate()
        .map(|(i, (keychain, index, value))| {
            let script = wallet.script_for(*keychain, *index, secp).unwrap();
            funding_tx(script.script_pubkey, *value, i as u32)
        })
        .collect();
    let total: u64 = coins.iter().map(|(_, _, value)| value).sum();

    let tx = Transaction {
        version: transaction::Version::TWO,
        lock_time: absolute::LockTime::ZERO,
        input: funding
            .iter()
            .map(|tx| TxIn {
                previous_output: OutPoint::new(tx.compute_txid(), 0),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            })
            .collect(),
        output: vec![TxOut {
            value: Amount::from_sat(total - 1_000),
            script_pubkey: funding[0].output[0].script_pubkey.clone(),
        }],
    };

    let mut psbt = Psbt::from_unsigned_tx(tx).unwrap();
    for (i, ((keychain, index, _), prev_tx)) in coins.iter().zip(funding.iter()).enumerate() {
        if wallet.kind().is_segwit() {
            psbt.set_witness_utxo(i, &prev_tx.output[0]).unwrap();
        } else {
            psbt.set_non_witness_utxo(i, prev_tx).unwrap();
        }
        wallet
            .update_psbt_in(*keychain, *index, &mut psbt, i, secp)
            .unwrap();
    }
    psbt
}
