//! Raw BIP174 key-value maps.
//!
//! Every pair is kept in the order it was read, so that a PSBT which wasn't modified serializes
//! back to the exact same bytes, including fields we don't interpret.

use miniscript::bitcoin::{
    consensus::{self, encode::VarInt},
    hex::DisplayHex,
    Transaction,
};

use std::{collections::HashSet, convert::TryFrom, error, fmt};

pub const PSBT_MAGIC: &[u8; 5] = b"psbt\xff";

pub const PSBT_GLOBAL_UNSIGNED_TX: u8 = 0x00;
pub const PSBT_GLOBAL_VERSION: u8 = 0xfb;
pub const PSBT_GLOBAL_PROPRIETARY: u8 = 0xfc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeError(pub String);

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl error::Error for DecodeError {}

macro_rules! decode_err {
    ($($arg:tt)*) => {
        DecodeError(format!($($arg)*))
    };
}

/// Write a Bitcoin compact size.
pub fn write_compact_size(buf: &mut Vec<u8>, n: u64) {
    buf.extend_from_slice(&consensus::serialize(&VarInt(n)));
}

/// A cursor over the bytes being decoded.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| decode_err!("unexpected end of data at offset {}", self.pos))?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    // Non-minimal encodings are rejected by the consensus decoder.
    fn read_compact_size(&mut self) -> Result<u64, DecodeError> {
        let (VarInt(n), read) = consensus::deserialize_partial::<VarInt>(&self.data[self.pos..])
            .map_err(|e| decode_err!("invalid compact size at offset {}: {}", self.pos, e))?;
        self.pos += read;
        Ok(n)
    }

    fn read_bytes(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.read_compact_size()?;
        let len = usize::try_from(len).map_err(|_| decode_err!("length {} too large", len))?;
        self.take(len)
    }
}

/// A key-value pair. The key contains its type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pair {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Pair {
    pub fn new(key_type: u8, key_data: &[u8], value: Vec<u8>) -> Self {
        let mut key = Vec::with_capacity(1 + key_data.len());
        key.push(key_type);
        key.extend_from_slice(key_data);
        Self { key, value }
    }

    /// The first byte of the key. All the types we interpret fit in it.
    pub fn key_type(&self) -> u8 {
        self.key[0]
    }

    pub fn key_data(&self) -> &[u8] {
        &self.key[1..]
    }
}

/// A map of key-value pairs, in wire order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Map {
    pairs: Vec<Pair>,
}

impl Map {
    pub fn pairs(&self) -> &[Pair] {
        &self.pairs
    }

    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.pairs
            .iter()
            .find(|p| p.key == key)
            .map(|p| p.value.as_slice())
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.pairs.iter().any(|p| p.key == key)
    }

    /// Replace the value of this key in place, or append the pair if the key isn't present.
    pub fn upsert(&mut self, pair: Pair) {
        match self.pairs.iter_mut().find(|p| p.key == pair.key) {
            Some(existing) => existing.value = pair.value,
            None => self.pairs.push(pair),
        }
    }

    /// Append a pair whose key must not be present.
    pub fn insert_new(&mut self, pair: Pair) -> bool {
        if self.contains_key(&pair.key) {
            return false;
        }
        self.pairs.push(pair);
        true
    }

    fn decode(reader: &mut Reader) -> Result<Self, DecodeError> {
        let mut pairs = Vec::new();
        let mut seen = HashSet::new();
        loop {
            let key = reader.read_bytes()?;
            if key.is_empty() {
                break;
            }
            if !seen.insert(key) {
                return Err(decode_err!("duplicate key {}", key.to_lower_hex_string()));
            }
            let value = reader.read_bytes()?;
            pairs.push(Pair {
                key: key.to_vec(),
                value: value.to_vec(),
            });
        }
        Ok(Self { pairs })
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        for pair in self.pairs.iter() {
            write_compact_size(buf, pair.key.len() as u64);
            buf.extend_from_slice(&pair.key);
            write_compact_size(buf, pair.value.len() as u64);
            buf.extend_from_slice(&pair.value);
        }
        buf.push(0x00);
    }
}

/// An untyped PSBT: the global map and one map per input and per output of the unsigned
/// transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPsbt {
    pub global: Map,
    pub inputs: Vec<Map>,
    pub outputs: Vec<Map>,
}

impl RawPsbt {
    /// A PSBT with only the unsigned transaction.
    pub fn from_unsigned_tx(tx: &Transaction) -> Self {
        let mut global = Map::default();
        global.upsert(Pair::new(
            PSBT_GLOBAL_UNSIGNED_TX,
            &[],
            consensus::serialize(tx),
        ));
        Self {
            global,
            inputs: vec![Map::default(); tx.input.len()],
            outputs: vec![Map::default(); tx.output.len()],
        }
    }

    /// Decode the maps, using the unsigned transaction to know how many input and output maps
    /// there are.
    pub fn decode(data: &[u8]) -> Result<(Self, Transaction), DecodeError> {
        if data.len() < PSBT_MAGIC.len() || &data[..PSBT_MAGIC.len()] != PSBT_MAGIC {
            return Err(decode_err!("invalid magic bytes"));
        }
        let mut reader = Reader::new(&data[PSBT_MAGIC.len()..]);

        let global = Map::decode(&mut reader)?;
        if let Some(version) = global.get(&[PSBT_GLOBAL_VERSION]) {
            if version.len() != 4 {
                return Err(decode_err!("invalid PSBT version field"));
            }
            let version = u32::from_le_bytes([version[0], version[1], version[2], version[3]]);
            if version != 0 {
                return Err(decode_err!("unsupported PSBT version {}", version));
            }
        }
        let tx_bytes = global
            .get(&[PSBT_GLOBAL_UNSIGNED_TX])
            .ok_or_else(|| decode_err!("missing unsigned transaction"))?;
        let tx: Transaction = consensus::deserialize(tx_bytes)
            .map_err(|e| decode_err!("invalid unsigned transaction: {}", e))?;
        if tx
            .input
            .iter()
            .any(|txin| !txin.script_sig.is_empty() || !txin.witness.is_empty())
        {
            return Err(decode_err!("unsigned transaction has a scriptSig or witness"));
        }

        let inputs = (0..tx.input.len())
            .map(|_| Map::decode(&mut reader))
            .collect::<Result<Vec<_>, _>>()?;
        let outputs = (0..tx.output.len())
            .map(|_| Map::decode(&mut reader))
            .collect::<Result<Vec<_>, _>>()?;
        if !reader.is_empty() {
            return Err(decode_err!("trailing data after the last output map"));
        }

        Ok((
            Self {
                global,
                inputs,
                outputs,
            },
            tx,
        ))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = PSBT_MAGIC.to_vec();
        self.global.encode(&mut buf);
        for map in self.inputs.iter().chain(self.outputs.iter()) {
            map.encode(&mut buf);
        }
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::*;

    use miniscript::bitcoin::{base64::Engine, consensus::encode::deserialize_hex};

    fn sample_bytes() -> Vec<u8> {
        miniscript::bitcoin::base64::engine::general_purpose::STANDARD
            .decode(SAMPLE_PSBT)
            .unwrap()
    }

    #[test]
    fn compact_size() {
        for (n, expected) in &[
            (0u64, vec![0x00u8]),
            (0xfc, vec![0xfc]),
            (0xfd, vec![0xfd, 0xfd, 0x00]),
            (0xffff, vec![0xfd, 0xff, 0xff]),
            (0x1_0000, vec![0xfe, 0x00, 0x00, 0x01, 0x00]),
            (0x1_0000_0000, vec![0xff, 0, 0, 0, 0, 1, 0, 0, 0]),
        ] {
            let mut buf = Vec::new();
            write_compact_size(&mut buf, *n);
            assert_eq!(&buf, expected);
            assert_eq!(Reader::new(&buf).read_compact_size().unwrap(), *n);
        }

        for non_minimal in &[
            vec![0xfdu8, 0x01, 0x00],
            vec![0xfe, 0xff, 0xff, 0x00, 0x00],
            vec![0xff, 0xff, 0xff, 0xff, 0xff, 0, 0, 0, 0],
        ] {
            assert!(Reader::new(non_minimal).read_compact_size().is_err());
        }
        assert!(Reader::new(&[0xfd, 0x01]).read_compact_size().is_err());

        // The cursor moves past the compact size only.
        let mut reader = Reader::new(&[0xfd, 0x00, 0x01, 0x2a]);
        assert_eq!(reader.read_compact_size().unwrap(), 0x100);
        assert_eq!(reader.read_compact_size().unwrap(), 0x2a);
        assert!(reader.is_empty());
        assert!(reader.read_compact_size().is_err());
    }

    #[test]
    fn raw_roundtrip() {
        let bytes = sample_bytes();
        let (raw, tx) = RawPsbt::decode(&bytes).unwrap();
        assert_eq!(raw.encode(), bytes);
        assert_eq!(tx.input.len(), 1);
        assert_eq!(raw.inputs.len(), 1);
        assert_eq!(raw.outputs.len(), 1);

        // The global map contains the unsigned transaction and the name of the PSBT, in this order.
        let keys: Vec<_> = raw.global.pairs().iter().map(|p| p.key.clone()).collect();
        assert_eq!(keys, vec![vec![0x00], b"\xfcname".to_vec()]);
        assert_eq!(raw.global.get(b"\xfcname"), Some(&b"to-carol"[..]));

        // Input map pairs are in wire order.
        let types: Vec<_> = raw.inputs[0].pairs().iter().map(|p| p.key_type()).collect();
        assert_eq!(types, vec![0x00, 0x01, 0x05, 0x06, 0x06]);
        assert!(raw.outputs[0].pairs().is_empty());
    }

    #[test]
    fn raw_map_update() {
        let mut map = Map::default();
        map.upsert(Pair::new(0x05, &[], vec![1, 2]));
        map.upsert(Pair::new(0x01, &[], vec![3]));
        map.upsert(Pair::new(0x05, &[], vec![4]));
        assert_eq!(map.pairs().len(), 2);
        assert_eq!(map.pairs()[0].value, vec![4]);
        assert!(!map.insert_new(Pair::new(0x01, &[], vec![5])));
        assert!(map.insert_new(Pair::new(0x02, &[0xaa], vec![5])));
        assert_eq!(map.pairs()[2].key_data(), &[0xaau8]);
        assert_eq!(map.get(&[0x01]), Some(&[3u8][..]));
    }

    #[test]
    fn raw_malformed() {
        let bytes = sample_bytes();

        // Magic
        let mut bad = bytes.clone();
        bad[4] = 0x00;
        assert!(RawPsbt::decode(&bad).is_err());
        assert!(RawPsbt::decode(b"psbt").is_err());

        // Truncated, at any position.
        for len in (5..bytes.len()).step_by(7) {
            assert!(RawPsbt::decode(&bytes[..len]).is_err(), "{}", len);
        }

        // Trailing data.
        let mut bad = bytes.clone();
        bad.push(0x00);
        assert!(RawPsbt::decode(&bad).is_err());

        // Duplicate key in the global map.
        let mut bad = b"psbt\xff".to_vec();
        let (raw, _) = RawPsbt::decode(&bytes).unwrap();
        let name = Pair {
            key: b"\xfcname".to_vec(),
            value: b"to-carol".to_vec(),
        };
        let mut global = raw.global.clone();
        global.pairs.push(name);
        global.encode(&mut bad);
        for map in raw.inputs.iter().chain(raw.outputs.iter()) {
            map.encode(&mut bad);
        }
        assert!(RawPsbt::decode(&bad)
            .unwrap_err()
            .0
            .contains("duplicate key fc6e616d65"));

        // No unsigned transaction.
        let mut bad = b"psbt\xff".to_vec();
        Map::default().encode(&mut bad);
        assert!(RawPsbt::decode(&bad).is_err());

        // PSBTv2
        let mut v2 = raw.clone();
        v2.global
            .upsert(Pair::new(PSBT_GLOBAL_VERSION, &[], 2u32.to_le_bytes().to_vec()));
        assert!(RawPsbt::decode(&v2.encode())
            .unwrap_err()
            .0
            .contains("version 2"));
        // An explicit version 0 is fine.
        let mut v0 = raw.clone();
        v0.global
            .upsert(Pair::new(PSBT_GLOBAL_VERSION, &[], 0u32.to_le_bytes().to_vec()));
        RawPsbt::decode(&v0.encode()).unwrap();

        // A signed transaction.
        let tx: Transaction = deserialize_hex("0200000001fbd00e5b9e8152c04214c72c791a78a65fdbab68b5c6164ff0d8b22a006c5221010000000151feffffff015eab08000000000017a914e3011f8f096837776f095f7034e7a474ee7713dd8700000000").unwrap();
        assert!(RawPsbt::decode(&RawPsbt::from_unsigned_tx(&tx).encode()).is_err());
    }
}
