//! Block-template side of merge mining: hands out templates paying to one
//! reserved wallet key and consumes that key only once a block is accepted.

use std::collections::HashMap;
use std::sync::Mutex;

use keypoold_log::{log_debug, log_info};
use keypoold_primitives::encoding::Encoder;
use keypoold_primitives::{address_to_key_hash, p2pkh_script, reversed_hex, sha256d, Hash256};
use keypoold_wallet::{Reservation, WalletError, WalletHandle};
use serde::Serialize;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChainTip {
    pub hash: Hash256,
    pub height: u32,
    /// Reward for the next block, in satoshis.
    pub coinbase_value: i64,
    pub target: Hash256,
    pub chain_id: i32,
}

/// Consensus collaborator: supplies the tip to build on and decides whether
/// a block with an attached auxpow is accepted.
pub trait BlockSubmitter: Send + Sync {
    fn current_tip(&self) -> ChainTip;
    fn submit_block(&self, template: &AuxBlockTemplate, auxpow: &[u8]) -> bool;
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AuxBlockTemplate {
    pub hash: Hash256,
    pub previous_block_hash: Hash256,
    pub height: u32,
    pub coinbase_value: i64,
    pub coinbase_script: Vec<u8>,
    pub target: Hash256,
    pub chain_id: i32,
}

/// `createauxblock` result object.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct AuxBlockInfo {
    pub hash: String,
    pub chainid: i32,
    pub previousblockhash: String,
    pub coinbasevalue: i64,
    pub bits: String,
    pub height: u32,
    pub _target: String,
}

impl AuxBlockTemplate {
    pub fn info(&self) -> AuxBlockInfo {
        AuxBlockInfo {
            hash: reversed_hex(&self.hash),
            chainid: self.chain_id,
            previousblockhash: reversed_hex(&self.previous_block_hash),
            coinbasevalue: self.coinbase_value,
            bits: compact_bits(&self.target),
            height: self.height,
            _target: reversed_hex(&self.target),
        }
    }
}

#[derive(Debug)]
pub enum MinerError {
    Wallet(WalletError),
    UnknownTemplate,
    InvalidParameter(&'static str),
}

impl std::fmt::Display for MinerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MinerError::Wallet(err) => write!(f, "{err}"),
            MinerError::UnknownTemplate => write!(f, "block hash unknown"),
            MinerError::InvalidParameter(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for MinerError {}

impl From<WalletError> for MinerError {
    fn from(err: WalletError) -> Self {
        MinerError::Wallet(err)
    }
}

pub struct AuxpowMiner {
    wallet: WalletHandle,
    chain: Box<dyn BlockSubmitter>,
    reservation: Option<Reservation>,
    templates: HashMap<Hash256, AuxBlockTemplate>,
    extra_nonce: u64,
}

impl AuxpowMiner {
    pub fn new(wallet: WalletHandle, chain: Box<dyn BlockSubmitter>) -> Self {
        Self {
            wallet,
            chain,
            reservation: None,
            templates: HashMap::new(),
            extra_nonce: 0,
        }
    }

    pub fn holds_reservation(&self) -> bool {
        self.reservation.is_some()
    }

    pub fn template_count(&self) -> usize {
        self.templates.len()
    }

    /// Builds a new candidate paying to the held key, reserving one first if
    /// needed. Templates built on an older tip are forgotten.
    pub fn create_aux_block(&mut self) -> Result<AuxBlockTemplate, MinerError> {
        let address = match self.reservation.as_ref() {
            Some(reservation) => self.wallet.reservation_address(reservation),
            None => {
                let reservation = self.wallet.request_block_template_key()?;
                let address = self.wallet.reservation_address(&reservation);
                log_debug!("Auxpow miner reserved key {}", reservation.id());
                self.reservation = Some(reservation);
                address
            }
        };
        let network = self.wallet.with_wallet(|wallet| wallet.network());
        let key_hash = address_to_key_hash(&address, network)
            .map_err(|err| MinerError::Wallet(WalletError::InvalidAddress(err)))?;

        let tip = self.chain.current_tip();
        self.templates
            .retain(|_, template| template.previous_block_hash == tip.hash);

        self.extra_nonce = self.extra_nonce.wrapping_add(1);
        let coinbase_script = p2pkh_script(&key_hash);
        let mut encoder = Encoder::new();
        encoder.write_bytes(&tip.hash);
        encoder.write_u32_le(tip.height.saturating_add(1));
        encoder.write_u64_le(tip.coinbase_value as u64);
        encoder.write_var_bytes(&coinbase_script);
        encoder.write_u64_le(self.extra_nonce);
        let template = AuxBlockTemplate {
            hash: sha256d(&encoder.into_inner()),
            previous_block_hash: tip.hash,
            height: tip.height.saturating_add(1),
            coinbase_value: tip.coinbase_value,
            coinbase_script,
            target: tip.target,
            chain_id: tip.chain_id,
        };
        self.templates.insert(template.hash, template.clone());
        Ok(template)
    }

    /// Returns whether the block was accepted. Acceptance consumes the held
    /// key; rejection leaves the pool untouched.
    pub fn submit_aux_block(&mut self, hash_hex: &str, auxpow: &[u8]) -> Result<bool, MinerError> {
        let hash = parse_hash(hash_hex)?;
        let template = self
            .templates
            .get(&hash)
            .ok_or(MinerError::UnknownTemplate)?;
        if auxpow.is_empty() {
            return Err(MinerError::InvalidParameter("auxpow must not be empty"));
        }
        if !self.chain.submit_block(template, auxpow) {
            log_debug!("Auxpow block {hash_hex} rejected");
            return Ok(false);
        }

        let height = template.height;
        self.templates.clear();
        if let Some(mut reservation) = self.reservation.take() {
            let address = self.wallet.commit_reservation(&mut reservation)?;
            log_info!("Auxpow block {hash_hex} accepted at height {height}, paid to {address}");
        }
        Ok(true)
    }

    /// Drops every template and returns the held key to the pool.
    pub fn discard_templates(&mut self) -> Result<(), MinerError> {
        self.templates.clear();
        if let Some(mut reservation) = self.reservation.take() {
            self.wallet.release_reservation(&mut reservation)?;
            log_debug!("Auxpow miner released key {}", reservation.id());
        }
        Ok(())
    }
}

/// In-process chain for the standalone shell: every submission with a
/// non-empty auxpow is accepted and becomes the new tip.
pub struct LocalChain {
    tip: Mutex<ChainTip>,
}

impl LocalChain {
    pub const CHAIN_ID: i32 = 16;
    const COINBASE_VALUE: i64 = 50 * 100_000_000;

    pub fn new() -> Self {
        let mut target = [0u8; 32];
        target[31] = 0x7f;
        for byte in &mut target[..31] {
            *byte = 0xff;
        }
        Self {
            tip: Mutex::new(ChainTip {
                hash: [0u8; 32],
                height: 0,
                coinbase_value: Self::COINBASE_VALUE,
                target,
                chain_id: Self::CHAIN_ID,
            }),
        }
    }
}

impl Default for LocalChain {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockSubmitter for LocalChain {
    fn current_tip(&self) -> ChainTip {
        self.tip
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn submit_block(&self, template: &AuxBlockTemplate, auxpow: &[u8]) -> bool {
        let mut tip = self
            .tip
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if auxpow.is_empty() || template.previous_block_hash != tip.hash {
            return false;
        }
        tip.hash = template.hash;
        tip.height = template.height;
        true
    }
}

fn parse_hash(hash_hex: &str) -> Result<Hash256, MinerError> {
    let mut bytes = keypoold_primitives::hex_to_bytes(hash_hex)
        .ok_or(MinerError::InvalidParameter("hash must be hexadecimal"))?;
    if bytes.len() != 32 {
        return Err(MinerError::InvalidParameter("hash must be 32 bytes"));
    }
    bytes.reverse();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&bytes);
    Ok(hash)
}

/// Compact encoding of a little-endian 256-bit target, as hex.
fn compact_bits(target: &Hash256) -> String {
    let size = 32 - target.iter().rev().take_while(|byte| **byte == 0).count();
    let mut compact: u32 = 0;
    for offset in 0..3 {
        compact <<= 8;
        if let Some(index) = size.checked_sub(1 + offset) {
            compact |= u32::from(target[index]);
        }
    }
    let mut size = size as u32;
    if compact & 0x0080_0000 != 0 {
        compact >>= 8;
        size += 1;
    }
    format!("{:08x}", compact | (size << 24))
}

#[cfg(test)]
mod tests {
    use super::*;
    use keypoold_primitives::Network;
    use keypoold_storage::memory::MemoryStore;
    use keypoold_wallet::{KdfCost, Wallet, WalletConfig};
    use std::sync::Arc;

    struct Rejecting(LocalChain);

    impl BlockSubmitter for Rejecting {
        fn current_tip(&self) -> ChainTip {
            self.0.current_tip()
        }

        fn submit_block(&self, _template: &AuxBlockTemplate, _auxpow: &[u8]) -> bool {
            false
        }
    }

    fn locked_wallet(keypool_size: usize) -> WalletHandle {
        let config = WalletConfig {
            keypool_size,
            internal_keypool_size: None,
            kdf_cost: KdfCost {
                mem_kib: 8,
                iters: 1,
                parallelism: 1,
            },
        };
        let wallet = Wallet::load_or_create(Arc::new(MemoryStore::new()), Network::Regtest, config)
            .expect("wallet");
        let handle = WalletHandle::new(wallet);
        handle.encrypt_wallet("pw").expect("encrypt");
        handle.wallet_passphrase("pw", 0).expect("unlock");
        handle.keypool_refill(keypool_size).expect("refill");
        handle.wallet_lock().expect("lock");
        handle
    }

    #[test]
    fn repeated_templates_reuse_one_key() {
        let wallet = locked_wallet(2);
        let mut miner = AuxpowMiner::new(wallet.clone(), Box::new(LocalChain::new()));
        let first = miner.create_aux_block().expect("template");
        for _ in 0..5 {
            let next = miner.create_aux_block().expect("template");
            assert_ne!(next.hash, first.hash);
            assert_eq!(next.coinbase_script, first.coinbase_script);
        }
        assert_eq!(miner.template_count(), 6);
        assert_eq!(wallet.wallet_info().keypoolsize, 2);
    }

    #[test]
    fn accepted_block_consumes_the_key() {
        let wallet = locked_wallet(2);
        let mut miner = AuxpowMiner::new(wallet.clone(), Box::new(LocalChain::new()));
        let template = miner.create_aux_block().expect("template");
        let info = template.info();
        assert_eq!(info.height, 1);
        assert_eq!(info.chainid, LocalChain::CHAIN_ID);

        assert!(miner.submit_aux_block(&info.hash, &[1, 2, 3]).expect("submit"));
        assert!(!miner.holds_reservation());
        assert_eq!(miner.template_count(), 0);
        assert_eq!(wallet.wallet_info().keypoolsize, 1);

        let next = miner.create_aux_block().expect("template");
        assert_eq!(next.previous_block_hash, template.hash);
        assert_ne!(next.coinbase_script, template.coinbase_script);
    }

    #[test]
    fn rejected_or_discarded_blocks_do_not_drain() {
        let wallet = locked_wallet(1);
        let mut miner = AuxpowMiner::new(wallet.clone(), Box::new(Rejecting(LocalChain::new())));
        let template = miner.create_aux_block().expect("template");
        assert!(!miner
            .submit_aux_block(&template.info().hash, &[1])
            .expect("submit"));
        assert!(miner.holds_reservation());
        assert!(matches!(
            miner.submit_aux_block(&"00".repeat(32), &[1]),
            Err(MinerError::UnknownTemplate)
        ));

        miner.discard_templates().expect("discard");
        assert!(!miner.holds_reservation());
        assert_eq!(wallet.wallet_info().keypoolsize, 1);
        // The released key is handed out again.
        let again = miner.create_aux_block().expect("template");
        assert_eq!(again.coinbase_script, template.coinbase_script);
    }

    #[test]
    fn exhausted_pool_surfaces_wallet_error() {
        let wallet = locked_wallet(1);
        wallet.get_new_address().expect("drain");
        let mut miner = AuxpowMiner::new(wallet, Box::new(LocalChain::new()));
        assert!(matches!(
            miner.create_aux_block(),
            Err(MinerError::Wallet(WalletError::PoolExhausted(_)))
        ));
    }

    #[test]
    fn compact_bits_of_easy_target() {
        let mut target = [0u8; 32];
        target[31] = 0x7f;
        for byte in &mut target[..31] {
            *byte = 0xff;
        }
        assert_eq!(compact_bits(&target), "207fffff");
    }
}
