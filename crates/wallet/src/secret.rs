//! Seed custody: plaintext or passphrase-sealed seeds, lock state and the
//! unlock generation counter used to recognise stale relock timers.

use argon2::{
    Algorithm as Argon2Algorithm, Argon2, Params as Argon2Params, Version as Argon2Version,
};
use chacha20poly1305::aead::{Aead, Payload};
use chacha20poly1305::{ChaCha20Poly1305, KeyInit};
use keypoold_primitives::encoding::{Decoder, Encoder};
use keypoold_primitives::Network;
use rand::RngCore;
use zeroize::Zeroize;

use crate::derive::{seed_id, KeyDeriver, SeedId};
use crate::error::WalletError;
use crate::records::{CryptedSeeds, KdfParams, KDF_SALT_BYTES, NONCE_BYTES};

/// Longest unlock window honoured; longer requests are clamped.
pub const MAX_UNLOCK_SECONDS: u64 = 100_000_000;

const SEED_BYTES: usize = 32;
const MAX_RETIRED_SEEDS: u64 = 1024;

/// Argon2id cost used when sealing seeds.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct KdfCost {
    pub mem_kib: u32,
    pub iters: u32,
    pub parallelism: u32,
}

impl KdfCost {
    pub const DEFAULT: KdfCost = KdfCost {
        mem_kib: 64 * 1024,
        iters: 3,
        parallelism: 1,
    };
}

impl Default for KdfCost {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LockState {
    pub locked: bool,
    /// Unix seconds; `None` while locked or when unlocked without a timeout.
    pub unlock_expiry: Option<u64>,
}

/// The active seed plus seeds it replaced. Retired seeds are kept so keys
/// issued before an encryption can still be re-derived.
#[derive(Clone)]
pub struct SeedSet {
    active: [u8; SEED_BYTES],
    retired: Vec<[u8; SEED_BYTES]>,
}

impl Drop for SeedSet {
    fn drop(&mut self) {
        self.active.zeroize();
        for seed in &mut self.retired {
            seed.zeroize();
        }
    }
}

impl SeedSet {
    fn generate() -> Result<Self, WalletError> {
        Ok(Self {
            active: generate_seed()?,
            retired: Vec::new(),
        })
    }

    fn rotate(&self) -> Result<Self, WalletError> {
        let mut retired = Vec::with_capacity(self.retired.len() + 1);
        retired.push(self.active);
        retired.extend_from_slice(&self.retired);
        Ok(Self {
            active: generate_seed()?,
            retired,
        })
    }

    fn find(&self, id: &SeedId) -> Result<Option<&[u8; SEED_BYTES]>, WalletError> {
        if seed_id(&self.active)? == *id {
            return Ok(Some(&self.active));
        }
        for seed in &self.retired {
            if seed_id(seed)? == *id {
                return Ok(Some(seed));
            }
        }
        Ok(None)
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_bytes(&self.active);
        encoder.write_varint(self.retired.len() as u64);
        for seed in &self.retired {
            encoder.write_bytes(seed);
        }
        encoder.into_inner()
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, WalletError> {
        let mut decoder = Decoder::new(bytes);
        let active = decoder.read_fixed::<SEED_BYTES>()?;
        let count = decoder.read_varint()?;
        if count > MAX_RETIRED_SEEDS {
            return Err(WalletError::InvalidData("too many retired seeds"));
        }
        let mut set = Self {
            active,
            retired: Vec::with_capacity(count as usize),
        };
        for _ in 0..count {
            set.retired.push(decoder.read_fixed::<SEED_BYTES>()?);
        }
        if !decoder.is_empty() {
            return Err(WalletError::InvalidData("trailing bytes after seed set"));
        }
        Ok(set)
    }
}

/// Result of [`SecretStore::plan_encryption`]: everything needed to persist
/// the encrypted wallet before the in-memory state changes.
pub struct EncryptionPlan {
    pub record: CryptedSeeds,
    seeds: SeedSet,
}

impl EncryptionPlan {
    pub fn seed_id(&self) -> SeedId {
        self.record.seed_id
    }
}

pub struct SecretStore {
    network: Network,
    cost: KdfCost,
    /// `None` while an encrypted wallet is locked.
    seeds: Option<SeedSet>,
    crypted: Option<CryptedSeeds>,
    active_id: SeedId,
    unlock_expiry_ms: Option<u64>,
    unlock_generation: u64,
}

impl SecretStore {
    /// New unencrypted store holding a freshly generated seed.
    pub fn create(network: Network, cost: KdfCost) -> Result<Self, WalletError> {
        let seeds = SeedSet::generate()?;
        let active_id = seed_id(&seeds.active)?;
        Ok(Self {
            network,
            cost,
            seeds: Some(seeds),
            crypted: None,
            active_id,
            unlock_expiry_ms: None,
            unlock_generation: 0,
        })
    }

    pub fn from_plain(network: Network, cost: KdfCost, bytes: &[u8]) -> Result<Self, WalletError> {
        let seeds = SeedSet::decode(bytes)?;
        let active_id = seed_id(&seeds.active)?;
        Ok(Self {
            network,
            cost,
            seeds: Some(seeds),
            crypted: None,
            active_id,
            unlock_expiry_ms: None,
            unlock_generation: 0,
        })
    }

    /// Encrypted store; starts locked.
    pub fn from_crypted(network: Network, cost: KdfCost, record: CryptedSeeds) -> Self {
        Self {
            network,
            cost,
            seeds: None,
            active_id: record.seed_id,
            crypted: Some(record),
            unlock_expiry_ms: None,
            unlock_generation: 0,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.crypted.is_some()
    }

    pub fn can_derive(&self) -> bool {
        self.seeds.is_some()
    }

    pub fn active_seed_id(&self) -> SeedId {
        self.active_id
    }

    pub fn unlock_generation(&self) -> u64 {
        self.unlock_generation
    }

    pub fn crypted_record(&self) -> Option<&CryptedSeeds> {
        self.crypted.as_ref()
    }

    /// Encoded seeds of an unencrypted wallet, for the plaintext record.
    pub fn plain_seeds(&self) -> Option<Vec<u8>> {
        if self.is_encrypted() {
            return None;
        }
        self.seeds.as_ref().map(SeedSet::encode)
    }

    pub fn lock_state(&self) -> LockState {
        LockState {
            locked: self.seeds.is_none(),
            unlock_expiry: self
                .unlock_expiry_ms
                .filter(|_| self.seeds.is_some())
                .map(|ms| ms.div_ceil(1000)),
        }
    }

    /// Unix seconds at which the wallet relocks; 0 when locked, unencrypted
    /// or unlocked without a timeout.
    pub fn unlocked_until(&self) -> u64 {
        self.lock_state().unlock_expiry.unwrap_or(0)
    }

    pub fn deriver(&self) -> Result<KeyDeriver, WalletError> {
        let seeds = self.seeds.as_ref().ok_or(WalletError::WalletLocked)?;
        KeyDeriver::new(&seeds.active)
    }

    /// Deriver for a specific (possibly retired) seed.
    pub fn deriver_for(&self, id: &SeedId) -> Result<KeyDeriver, WalletError> {
        let seeds = self.seeds.as_ref().ok_or(WalletError::WalletLocked)?;
        let seed = seeds
            .find(id)?
            .ok_or(WalletError::InvalidData("key derived from an unknown seed"))?;
        KeyDeriver::new(seed)
    }

    pub fn plan_encryption(&self, passphrase: &str) -> Result<EncryptionPlan, WalletError> {
        if self.is_encrypted() {
            return Err(WalletError::AlreadyEncrypted);
        }
        let current = self.seeds.as_ref().ok_or(WalletError::WalletLocked)?;
        let seeds = current.rotate()?;
        let record = self.seal(passphrase, &seeds)?;
        Ok(EncryptionPlan { record, seeds })
    }

    /// Adopts the new seed and ciphertext. The store stays unlocked so the
    /// caller can derive under the new seed before calling [`Self::lock`].
    pub fn apply_encryption(&mut self, plan: EncryptionPlan) {
        self.active_id = plan.record.seed_id;
        self.crypted = Some(plan.record);
        self.seeds = Some(plan.seeds);
        self.unlock_expiry_ms = None;
        self.unlock_generation = self.unlock_generation.saturating_add(1);
    }

    /// Returns the new unlock generation and the expiry in unix millis
    /// (`None` when `duration_secs` is 0).
    pub fn unlock(
        &mut self,
        passphrase: &str,
        duration_secs: u64,
        now_ms: u64,
    ) -> Result<(u64, Option<u64>), WalletError> {
        let record = self.crypted.as_ref().ok_or(WalletError::NotEncrypted)?;
        let mut plaintext = open(self.network, passphrase, record)?;
        let decoded = SeedSet::decode(&plaintext);
        plaintext.zeroize();
        let seeds = decoded?;
        if seed_id(&seeds.active)? != record.seed_id {
            return Err(WalletError::InvalidData("crypted seed does not match its id"));
        }

        let duration_secs = duration_secs.min(MAX_UNLOCK_SECONDS);
        let expiry = (duration_secs > 0).then(|| now_ms.saturating_add(duration_secs * 1000));
        self.seeds = Some(seeds);
        self.unlock_expiry_ms = expiry;
        self.unlock_generation = self.unlock_generation.saturating_add(1);
        Ok((self.unlock_generation, expiry))
    }

    pub fn lock(&mut self) -> Result<(), WalletError> {
        if !self.is_encrypted() {
            return Err(WalletError::NotEncrypted);
        }
        self.lock_inner();
        Ok(())
    }

    pub(crate) fn lock_inner(&mut self) {
        self.seeds = None;
        self.unlock_expiry_ms = None;
        self.unlock_generation = self.unlock_generation.saturating_add(1);
    }

    pub fn lock_if_expired(&mut self, now_ms: u64) -> bool {
        match self.unlock_expiry_ms {
            Some(expiry) if self.seeds.is_some() && now_ms >= expiry => {
                self.lock_inner();
                true
            }
            _ => false,
        }
    }

    /// Locks only if no unlock or lock happened since `generation` was issued.
    pub fn lock_if_generation(&mut self, generation: u64) -> bool {
        if !self.is_encrypted() || self.seeds.is_none() || generation != self.unlock_generation {
            return false;
        }
        self.lock_inner();
        true
    }

    /// Reseals the seeds under `new_passphrase`. Nothing changes in memory;
    /// persist the returned record, then call [`Self::set_crypted`].
    pub fn plan_passphrase_change(
        &self,
        old_passphrase: &str,
        new_passphrase: &str,
    ) -> Result<CryptedSeeds, WalletError> {
        let record = self.crypted.as_ref().ok_or(WalletError::NotEncrypted)?;
        let mut plaintext = open(self.network, old_passphrase, record)?;
        let decoded = SeedSet::decode(&plaintext);
        plaintext.zeroize();
        let seeds = decoded?;
        self.seal(new_passphrase, &seeds)
    }

    pub fn set_crypted(&mut self, record: CryptedSeeds) {
        self.crypted = Some(record);
    }

    fn seal(&self, passphrase: &str, seeds: &SeedSet) -> Result<CryptedSeeds, WalletError> {
        let mut salt = [0u8; KDF_SALT_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        let kdf = KdfParams {
            mem_kib: self.cost.mem_kib,
            iters: self.cost.iters,
            parallelism: self.cost.parallelism,
            salt,
        };
        let mut key = derive_key(passphrase, &kdf)?;
        let mut nonce = [0u8; NONCE_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let mut plaintext = seeds.encode();
        let cipher = ChaCha20Poly1305::new(chacha20poly1305::Key::from_slice(&key));
        let aad = secrets_aad(self.network);
        let sealed = cipher.encrypt(
            chacha20poly1305::Nonce::from_slice(&nonce),
            Payload {
                msg: &plaintext,
                aad: &aad,
            },
        );
        plaintext.zeroize();
        key.zeroize();
        let ciphertext = sealed.map_err(|_| WalletError::InvalidData("seed encryption failed"))?;

        Ok(CryptedSeeds {
            kdf,
            nonce,
            ciphertext,
            seed_id: seed_id(&seeds.active)?,
        })
    }
}

fn open(network: Network, passphrase: &str, record: &CryptedSeeds) -> Result<Vec<u8>, WalletError> {
    let mut key = derive_key(passphrase, &record.kdf)?;
    let cipher = ChaCha20Poly1305::new(chacha20poly1305::Key::from_slice(&key));
    key.zeroize();
    let aad = secrets_aad(network);
    cipher
        .decrypt(
            chacha20poly1305::Nonce::from_slice(&record.nonce),
            Payload {
                msg: &record.ciphertext,
                aad: &aad,
            },
        )
        .map_err(|_| WalletError::WrongPassphrase)
}

fn derive_key(passphrase: &str, kdf: &KdfParams) -> Result<[u8; 32], WalletError> {
    let params = Argon2Params::new(kdf.mem_kib, kdf.iters, kdf.parallelism, Some(32))
        .map_err(|_| WalletError::InvalidData("invalid wallet kdf parameters"))?;
    let argon2 = Argon2::new(Argon2Algorithm::Argon2id, Argon2Version::V0x13, params);
    let mut out = [0u8; 32];
    argon2
        .hash_password_into(passphrase.as_bytes(), &kdf.salt, &mut out)
        .map_err(|_| WalletError::InvalidData("wallet key derivation failed"))?;
    Ok(out)
}

fn secrets_aad(network: Network) -> Vec<u8> {
    const PREFIX: &[u8] = b"keypoold-seeds-v1:";
    let mut out = Vec::with_capacity(PREFIX.len() + 1);
    out.extend_from_slice(PREFIX);
    out.push(network.to_byte());
    out
}

fn generate_seed() -> Result<[u8; SEED_BYTES], WalletError> {
    let mut seed = [0u8; SEED_BYTES];
    for _ in 0..100 {
        rand::rngs::OsRng.fill_bytes(&mut seed);
        if seed_id(&seed).is_ok() {
            return Ok(seed);
        }
    }
    seed.zeroize();
    Err(WalletError::InvalidData("failed to generate hd seed"))
}
