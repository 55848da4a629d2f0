//! Persisted wallet records and their store keys.

use keypoold_primitives::encoding::{DecodeError, Decodable, Decoder, Encodable, Encoder};

use crate::derive::SeedId;
use crate::keypool::Chain;

pub const WALLET_VERSION: u32 = 1;

pub(crate) const META_VERSION: &[u8] = b"version";
pub(crate) const META_NETWORK: &[u8] = b"network";
pub(crate) const META_HD_CHAIN: &[u8] = b"hdchain";
pub(crate) const META_SEEDS: &[u8] = b"seeds";
pub(crate) const META_CRYPTED: &[u8] = b"crypted";

pub(crate) const CRYPTED_SEEDS_VERSION: u8 = 1;
pub(crate) const KDF_SALT_BYTES: usize = 16;
pub(crate) const NONCE_BYTES: usize = 12;

/// Active seed and the next unused derivation index of each chain.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HdChain {
    pub seed_id: SeedId,
    pub next_external: u32,
    pub next_internal: u32,
}

impl HdChain {
    pub fn new(seed_id: SeedId) -> Self {
        Self {
            seed_id,
            next_external: 0,
            next_internal: 0,
        }
    }

    pub fn next_index(&self, chain: Chain) -> u32 {
        match chain {
            Chain::External => self.next_external,
            Chain::Internal => self.next_internal,
        }
    }

    pub fn set_next_index(&mut self, chain: Chain, index: u32) {
        match chain {
            Chain::External => self.next_external = index,
            Chain::Internal => self.next_internal = index,
        }
    }
}

impl Encodable for HdChain {
    fn encode_to(&self, encoder: &mut Encoder) {
        encoder.write_bytes(&self.seed_id);
        encoder.write_u32_le(self.next_external);
        encoder.write_u32_le(self.next_internal);
    }
}

impl Decodable for HdChain {
    fn decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            seed_id: decoder.read_fixed()?,
            next_external: decoder.read_u32_le()?,
            next_internal: decoder.read_u32_le()?,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PoolRecord {
    pub pubkey: [u8; 33],
    pub created_at: u64,
}

impl Encodable for PoolRecord {
    fn encode_to(&self, encoder: &mut Encoder) {
        encoder.write_bytes(&self.pubkey);
        encoder.write_u64_le(self.created_at);
    }
}

impl Decodable for PoolRecord {
    fn decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            pubkey: decoder.read_fixed()?,
            created_at: decoder.read_u64_le()?,
        })
    }
}

/// Where an issued key came from. Keyed by the key's hash160.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KeyMetaRecord {
    pub seed_id: SeedId,
    pub chain: Chain,
    pub index: u32,
    pub pubkey: [u8; 33],
    pub created_at: u64,
}

/// BIP32 path of a pool key, as reported by address queries.
pub(crate) fn hd_key_path(chain: Chain, index: u32) -> String {
    format!("m/0'/{}'/{}'", chain.path_component(), index)
}

impl Encodable for KeyMetaRecord {
    fn encode_to(&self, encoder: &mut Encoder) {
        encoder.write_bytes(&self.seed_id);
        encoder.write_u8(self.chain.to_byte());
        encoder.write_u32_le(self.index);
        encoder.write_bytes(&self.pubkey);
        encoder.write_u64_le(self.created_at);
    }
}

impl Decodable for KeyMetaRecord {
    fn decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let seed_id = decoder.read_fixed()?;
        let chain = Chain::from_byte(decoder.read_u8()?)
            .ok_or(DecodeError::InvalidData("unknown key chain"))?;
        Ok(Self {
            seed_id,
            chain,
            index: decoder.read_u32_le()?,
            pubkey: decoder.read_fixed()?,
            created_at: decoder.read_u64_le()?,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KdfParams {
    pub mem_kib: u32,
    pub iters: u32,
    pub parallelism: u32,
    pub salt: [u8; KDF_SALT_BYTES],
}

/// Seed material sealed under a passphrase. The active seed id stays in the
/// clear so a locked wallet can still report it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CryptedSeeds {
    pub kdf: KdfParams,
    pub nonce: [u8; NONCE_BYTES],
    pub ciphertext: Vec<u8>,
    pub seed_id: SeedId,
}

impl Encodable for CryptedSeeds {
    fn encode_to(&self, encoder: &mut Encoder) {
        encoder.write_u8(CRYPTED_SEEDS_VERSION);
        encoder.write_u32_le(self.kdf.mem_kib);
        encoder.write_u32_le(self.kdf.iters);
        encoder.write_u32_le(self.kdf.parallelism);
        encoder.write_bytes(&self.kdf.salt);
        encoder.write_bytes(&self.nonce);
        encoder.write_var_bytes(&self.ciphertext);
        encoder.write_bytes(&self.seed_id);
    }
}

impl Decodable for CryptedSeeds {
    fn decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        if decoder.read_u8()? != CRYPTED_SEEDS_VERSION {
            return Err(DecodeError::InvalidData("unsupported crypted seed version"));
        }
        let kdf = KdfParams {
            mem_kib: decoder.read_u32_le()?,
            iters: decoder.read_u32_le()?,
            parallelism: decoder.read_u32_le()?,
            salt: decoder.read_fixed()?,
        };
        Ok(Self {
            kdf,
            nonce: decoder.read_fixed()?,
            ciphertext: decoder.read_var_bytes()?,
            seed_id: decoder.read_fixed()?,
        })
    }
}

/// `chain || index` with the index big-endian so a prefix scan yields
/// entries in derivation order.
pub fn pool_key(chain: Chain, index: u32) -> [u8; 5] {
    let mut key = [0u8; 5];
    key[0] = chain.to_byte();
    key[1..].copy_from_slice(&index.to_be_bytes());
    key
}

pub fn parse_pool_key(key: &[u8]) -> Result<(Chain, u32), DecodeError> {
    let mut decoder = Decoder::new(key);
    let chain = Chain::from_byte(decoder.read_u8()?)
        .ok_or(DecodeError::InvalidData("unknown key chain"))?;
    let index = decoder.read_u32_be()?;
    if !decoder.is_empty() {
        return Err(DecodeError::TrailingBytes);
    }
    Ok((chain, index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use keypoold_primitives::encoding::{decode, encode};

    #[test]
    fn pool_keys_order_by_chain_then_index() {
        let mut keys = vec![
            pool_key(Chain::Internal, 0),
            pool_key(Chain::External, 256),
            pool_key(Chain::External, 3),
        ];
        keys.sort();
        assert_eq!(parse_pool_key(&keys[0]), Ok((Chain::External, 3)));
        assert_eq!(parse_pool_key(&keys[1]), Ok((Chain::External, 256)));
        assert_eq!(parse_pool_key(&keys[2]), Ok((Chain::Internal, 0)));
        assert!(parse_pool_key(&[9, 0, 0, 0, 0]).is_err());
    }

    #[test]
    fn key_meta_reports_hd_path() {
        let record = KeyMetaRecord {
            seed_id: [1; 20],
            chain: Chain::Internal,
            index: 7,
            pubkey: [2; 33],
            created_at: 1_700_000_000,
        };
        assert_eq!(hd_key_path(record.chain, record.index), "m/0'/1'/7'");
        let decoded: KeyMetaRecord = decode(&encode(&record)).expect("decode");
        assert_eq!(decoded, record);
    }

    #[test]
    fn crypted_seeds_reject_unknown_version() {
        let record = CryptedSeeds {
            kdf: KdfParams {
                mem_kib: 8,
                iters: 1,
                parallelism: 1,
                salt: [3; KDF_SALT_BYTES],
            },
            nonce: [4; NONCE_BYTES],
            ciphertext: vec![5; 48],
            seed_id: [6; 20],
        };
        let mut bytes = encode(&record);
        assert_eq!(decode::<CryptedSeeds>(&bytes).expect("decode"), record);
        bytes[0] = 9;
        assert!(decode::<CryptedSeeds>(&bytes).is_err());
    }
}
