//! Extended keys
//!
//! Parsing and validation of BIP32 extended keys, either private (the signing material of a
//! cosigner) or public (watch-only). The master fingerprint of a key is computed once at import
//! and is what ties it to the slots of a wallet descriptor.

use miniscript::bitcoin::{
    self, base58,
    bip32::{self, DerivationPath, Fingerprint},
    secp256k1, NetworkKind,
};

use std::{error, fmt, str::FromStr};

const VERSION_XPRV: [u8; 4] = [0x04, 0x88, 0xAD, 0xE4];
const VERSION_XPUB: [u8; 4] = [0x04, 0x88, 0xB2, 0x1E];
const VERSION_TPRV: [u8; 4] = [0x04, 0x35, 0x83, 0x94];
const VERSION_TPUB: [u8; 4] = [0x04, 0x35, 0x87, 0xCF];

/// Size of a serialized extended key, without the base58 checksum.
const XKEY_LEN: usize = 78;

fn network_name(net: NetworkKind) -> &'static str {
    if net.is_mainnet() {
        "mainnet"
    } else {
        "testnet"
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// Not a base58check-encoded BIP32 extended key (checksum, version bytes, length, ..).
    InvalidKeyFormat(String),
    /// The key is encoded for a different network than the one we operate on.
    NetworkMismatch {
        expected: NetworkKind,
        found: NetworkKind,
    },
    /// Invalid derivation path or failed child key derivation.
    Derivation(bip32::Error),
}

impl fmt::Display for KeyError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InvalidKeyFormat(e) => write!(f, "Invalid extended key: {}", e),
            Self::NetworkMismatch { expected, found } => write!(
                f,
                "Extended key is for {} but we are operating on {}.",
                network_name(*found),
                network_name(*expected)
            ),
            Self::Derivation(e) => write!(f, "Key derivation error: {}", e),
        }
    }
}

impl error::Error for KeyError {}

/// Parse a derivation path, with or without the leading "m".
pub fn parse_derivation_path(s: &str) -> Result<DerivationPath, KeyError> {
    let s = s.trim();
    let normalized = if s.is_empty() {
        "m".to_string()
    } else if s.starts_with('m') {
        s.to_string()
    } else {
        format!("m/{}", s.trim_start_matches('/'))
    };
    DerivationPath::from_str(&normalized).map_err(KeyError::Derivation)
}

/// The secret or public material of an extended key.
#[derive(Clone, PartialEq, Eq)]
pub enum KeyMaterial {
    Private(bip32::Xpriv),
    Public(bip32::Xpub),
}

impl KeyMaterial {
    fn network(&self) -> NetworkKind {
        match self {
            Self::Private(xpriv) => xpriv.network,
            Self::Public(xpub) => xpub.network,
        }
    }

    fn depth(&self) -> u8 {
        match self {
            Self::Private(xpriv) => xpriv.depth,
            Self::Public(xpub) => xpub.depth,
        }
    }
}

/// A BIP32 extended key along with its master fingerprint.
///
/// The key is considered the root of the derivation paths found in descriptors and PSBTs: its
/// own fingerprint is the master fingerprint cosigners are identified by.
#[derive(Clone, PartialEq, Eq)]
pub struct ExtendedKey {
    material: KeyMaterial,
    fingerprint: Fingerprint,
}

impl fmt::Debug for ExtendedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.material {
            KeyMaterial::Private(_) => "private",
            KeyMaterial::Public(_) => "public",
        };
        f.debug_struct("ExtendedKey")
            .field("kind", &kind)
            .field("fingerprint", &self.fingerprint)
            .field("network", &network_name(self.material.network()))
            .finish()
    }
}

impl fmt::Display for ExtendedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.material {
            KeyMaterial::Private(ref xpriv) => write!(f, "{}", xpriv),
            KeyMaterial::Public(ref xpub) => write!(f, "{}", xpub),
        }
    }
}

impl ExtendedKey {
    /// Parse a base58check-serialized extended key (xprv, xpub, tprv or tpub). Its network tag
    /// must correspond to the network we are operating on.
    pub fn parse(
        s: &str,
        network: bitcoin::Network,
        secp: &secp256k1::Secp256k1<impl secp256k1::Signing>,
    ) -> Result<Self, KeyError> {
        let data = base58::decode_check(s.trim())
            .map_err(|e| KeyError::InvalidKeyFormat(e.to_string()))?;
        if data.len() != XKEY_LEN {
            return Err(KeyError::InvalidKeyFormat(format!(
                "{} bytes long, expected {}",
                data.len(),
                XKEY_LEN
            )));
        }

        let version = [data[0], data[1], data[2], data[3]];
        let material = match version {
            VERSION_XPRV | VERSION_TPRV => KeyMaterial::Private(
                bip32::Xpriv::decode(&data)
                    .map_err(|e| KeyError::InvalidKeyFormat(e.to_string()))?,
            ),
            VERSION_XPUB | VERSION_TPUB => KeyMaterial::Public(
                bip32::Xpub::decode(&data)
                    .map_err(|e| KeyError::InvalidKeyFormat(e.to_string()))?,
            ),
            _ => {
                return Err(KeyError::InvalidKeyFormat(format!(
                    "unknown version bytes {:02x}{:02x}{:02x}{:02x}",
                    version[0], version[1], version[2], version[3]
                )))
            }
        };

        let expected = NetworkKind::from(network);
        let found = material.network();
        if found != expected {
            return Err(KeyError::NetworkMismatch { expected, found });
        }
        if material.depth() != 0 {
            log::debug!(
                "Importing an extended key at depth {}. It will be used as the root of derivation paths.",
                material.depth()
            );
        }

        Ok(Self::from_material(material, secp))
    }

    /// Restore the master private key from a BIP39 mnemonic, without passphrase.
    pub fn from_mnemonic(
        words: &str,
        network: bitcoin::Network,
        secp: &secp256k1::Secp256k1<impl secp256k1::Signing>,
    ) -> Result<Self, KeyError> {
        let mnemonic = bip39::Mnemonic::from_str(words.trim())
            .map_err(|e| KeyError::InvalidKeyFormat(format!("mnemonic: {}", e)))?;
        let seed = mnemonic.to_seed("");
        let xpriv = bip32::Xpriv::new_master(network, &seed)
            .map_err(|e| KeyError::InvalidKeyFormat(e.to_string()))?;
        Ok(Self::from_material(KeyMaterial::Private(xpriv), secp))
    }

    fn from_material(
        material: KeyMaterial,
        secp: &secp256k1::Secp256k1<impl secp256k1::Signing>,
    ) -> Self {
        let fingerprint = match material {
            KeyMaterial::Private(ref xpriv) => xpriv.fingerprint(secp),
            KeyMaterial::Public(ref xpub) => xpub.fingerprint(),
        };
        Self {
            material,
            fingerprint,
        }
    }

    /// The master fingerprint of this key.
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn network(&self) -> NetworkKind {
        self.material.network()
    }

    pub fn is_private(&self) -> bool {
        matches!(self.material, KeyMaterial::Private(_))
    }

    pub fn material(&self) -> &KeyMaterial {
        &self.material
    }

    /// The extended public key corresponding to this key.
    pub fn xpub(&self, secp: &secp256k1::Secp256k1<impl secp256k1::Signing>) -> bip32::Xpub {
        match self.material {
            KeyMaterial::Private(ref xpriv) => bip32::Xpub::from_priv(secp, xpriv),
            KeyMaterial::Public(xpub) => xpub,
        }
    }

    /// Derive the public key at this path. A public key can't derive hardened children.
    pub fn derive_public_key<C: secp256k1::Signing + secp256k1::Verification>(
        &self,
        path: &DerivationPath,
        secp: &secp256k1::Secp256k1<C>,
    ) -> Result<bitcoin::PublicKey, KeyError> {
        let xpub = match self.material {
            KeyMaterial::Private(ref xpriv) => {
                let child = xpriv.derive_priv(secp, path).map_err(KeyError::Derivation)?;
                bip32::Xpub::from_priv(secp, &child)
            }
            KeyMaterial::Public(ref xpub) => {
                xpub.derive_pub(secp, path).map_err(KeyError::Derivation)?
            }
        };
        Ok(bitcoin::PublicKey::new(xpub.public_key))
    }

    /// Get the signing capability of this key. Only available for private keys.
    pub fn signing_key(&self) -> Option<SigningKey<'_>> {
        match self.material {
            KeyMaterial::Private(ref xpriv) => Some(SigningKey {
                xpriv,
                fingerprint: self.fingerprint,
            }),
            KeyMaterial::Public(_) => None,
        }
    }
}

/// Signing capability of a private [`ExtendedKey`].
pub struct SigningKey<'a> {
    xpriv: &'a bip32::Xpriv,
    fingerprint: Fingerprint,
}

impl<'a> SigningKey<'a> {
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Sign this digest with the key at the given derivation path. Nonces are derived per RFC6979
    /// so signing the same digest with the same key always produces the same signature.
    pub fn sign_ecdsa(
        &self,
        path: &DerivationPath,
        sighash: &secp256k1::Message,
        secp: &secp256k1::Secp256k1<impl secp256k1::Signing>,
    ) -> Result<(bitcoin::PublicKey, secp256k1::ecdsa::Signature), KeyError> {
        let privkey = self
            .xpriv
            .derive_priv(secp, path)
            .map_err(KeyError::Derivation)?
            .to_priv();
        let pubkey = privkey.public_key(secp);
        let signature = secp.sign_ecdsa_low_r(sighash, &privkey.inner);
        Ok((pubkey, signature))
    }
}
