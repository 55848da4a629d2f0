use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use keypoold_log::{log_debug, log_info};
use keypoold_primitives::encoding::{decode, encode, Decoder};
use keypoold_primitives::{
    address_to_key_hash, bytes_to_hex, hash160, key_hash_to_address, reversed_hex,
    secret_key_to_wif, Network,
};
use keypoold_storage::{Column, KeyValueStore, WriteBatch};
use zeroize::Zeroize;

use crate::derive::SeedId;
use crate::error::WalletError;
use crate::keypool::{Chain, KeyPool};
use crate::records::{
    hd_key_path, CryptedSeeds, HdChain, KeyMetaRecord, META_CRYPTED, META_HD_CHAIN, META_NETWORK,
    META_SEEDS, META_VERSION, WALLET_VERSION,
};
use crate::reserve::{Reservation, ReservationManager, ReservationState};
use crate::secret::{KdfCost, LockState, SecretStore};

pub const DEFAULT_KEYPOOL_SIZE: usize = 100;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WalletConfig {
    /// Target unused keys per chain for automatic top-up (`-keypool`).
    pub keypool_size: usize,
    /// Internal chain target when it should differ from `keypool_size`.
    pub internal_keypool_size: Option<usize>,
    pub kdf_cost: KdfCost,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            keypool_size: DEFAULT_KEYPOOL_SIZE,
            internal_keypool_size: None,
            kdf_cost: KdfCost::DEFAULT,
        }
    }
}

impl WalletConfig {
    pub fn target(&self, chain: Chain) -> usize {
        match chain {
            Chain::External => self.keypool_size,
            Chain::Internal => self.internal_keypool_size.unwrap_or(self.keypool_size),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WalletInfo {
    pub keypoolsize: usize,
    pub keypoolsize_hd_internal: usize,
    pub keypoololdest: u64,
    /// Unix seconds; 0 when locked, unencrypted or unlocked without timeout.
    pub unlocked_until: u64,
    pub hdseedid: String,
    pub encrypted: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AddressInfo {
    pub address: String,
    pub ismine: bool,
    pub ischange: bool,
    pub hdkeypath: Option<String>,
    pub hdseedid: Option<String>,
    pub pubkey: Option<String>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct UnlockOutcome {
    pub generation: u64,
    /// Unix millis at which the wallet relocks, `None` for no timeout.
    pub expiry_ms: Option<u64>,
}

/// Where a wallet key sits in the HD tree.
struct KeyOrigin {
    seed_id: SeedId,
    chain: Chain,
    index: u32,
    pubkey: [u8; 33],
}

/// The wallet aggregate: seed custody, key pool and reservations. All
/// mutation goes through `&mut self`; share it through
/// [`crate::WalletHandle`].
pub struct Wallet {
    store: Arc<dyn KeyValueStore>,
    network: Network,
    config: WalletConfig,
    secrets: SecretStore,
    pool: KeyPool,
    reservations: ReservationManager,
}

impl Wallet {
    pub fn load_or_create(
        store: Arc<dyn KeyValueStore>,
        network: Network,
        config: WalletConfig,
    ) -> Result<Self, WalletError> {
        match store.get(Column::Meta, META_VERSION)? {
            Some(version) => Self::load(store, network, config, &version),
            None => Self::create(store, network, config),
        }
    }

    fn create(
        store: Arc<dyn KeyValueStore>,
        network: Network,
        config: WalletConfig,
    ) -> Result<Self, WalletError> {
        let secrets = SecretStore::create(network, config.kdf_cost)?;
        let hd = HdChain::new(secrets.active_seed_id());
        let mut seeds = secrets
            .plain_seeds()
            .ok_or(WalletError::InvalidData("new wallet has no plaintext seed"))?;

        let mut batch = WriteBatch::new();
        batch.put(Column::Meta, META_VERSION, WALLET_VERSION.to_le_bytes());
        batch.put(Column::Meta, META_NETWORK, [network.to_byte()]);
        batch.put(Column::Meta, META_HD_CHAIN, encode(&hd));
        batch.put(Column::Meta, META_SEEDS, seeds.as_slice());
        let written = store.write_batch(&batch);
        seeds.zeroize();
        written?;

        let mut wallet = Self {
            store,
            network,
            config,
            secrets,
            pool: KeyPool::new(hd),
            reservations: ReservationManager::new(),
        };
        log_info!(
            "Created {} wallet with hd seed {}",
            network.as_str(),
            wallet.hd_seed_id()
        );
        wallet.top_up_all()?;
        Ok(wallet)
    }

    fn load(
        store: Arc<dyn KeyValueStore>,
        network: Network,
        config: WalletConfig,
        version: &[u8],
    ) -> Result<Self, WalletError> {
        let version = Decoder::new(version).read_u32_le()?;
        if version == 0 || version > WALLET_VERSION {
            return Err(WalletError::InvalidData("unsupported wallet version"));
        }
        let stored_network = store
            .get(Column::Meta, META_NETWORK)?
            .and_then(|bytes| bytes.first().copied())
            .and_then(Network::from_byte)
            .ok_or(WalletError::InvalidData("missing wallet network"))?;
        if stored_network != network {
            return Err(WalletError::NetworkMismatch {
                expected: network,
                found: stored_network,
            });
        }
        let hd: HdChain = decode(
            &store
                .get(Column::Meta, META_HD_CHAIN)?
                .ok_or(WalletError::InvalidData("missing hd chain record"))?,
        )?;

        let secrets = match store.get(Column::Meta, META_CRYPTED)? {
            Some(bytes) => {
                let record: CryptedSeeds = decode(&bytes)?;
                SecretStore::from_crypted(network, config.kdf_cost, record)
            }
            None => {
                let mut bytes = store
                    .get(Column::Meta, META_SEEDS)?
                    .ok_or(WalletError::InvalidData("wallet has no seed record"))?;
                let secrets = SecretStore::from_plain(network, config.kdf_cost, &bytes);
                bytes.zeroize();
                secrets?
            }
        };
        if secrets.active_seed_id() != hd.seed_id {
            return Err(WalletError::InvalidData("hd chain does not match the active seed"));
        }

        let pool = KeyPool::load(store.as_ref(), hd)?;
        let mut wallet = Self {
            store,
            network,
            config,
            secrets,
            pool,
            reservations: ReservationManager::new(),
        };
        log_info!(
            "Loaded {} wallet: {} external / {} internal pool keys, encrypted={}",
            network.as_str(),
            wallet.pool.unused_count(Chain::External),
            wallet.pool.unused_count(Chain::Internal),
            wallet.secrets.is_encrypted()
        );
        wallet.top_up_all()?;
        Ok(wallet)
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn config(&self) -> &WalletConfig {
        &self.config
    }

    pub fn is_encrypted(&self) -> bool {
        self.secrets.is_encrypted()
    }

    pub fn hd_seed_id(&self) -> String {
        reversed_hex(&self.secrets.active_seed_id())
    }

    pub fn unused_count(&self, chain: Chain) -> usize {
        self.pool.unused_count(chain)
    }

    pub fn pending_reservations(&self) -> usize {
        self.reservations.pending_count()
    }

    pub fn lock_state(&mut self) -> LockState {
        self.lock_if_expired();
        self.secrets.lock_state()
    }

    pub fn unlocked_until(&mut self) -> u64 {
        self.lock_if_expired();
        self.secrets.unlocked_until()
    }

    pub fn unlock_generation(&self) -> u64 {
        self.secrets.unlock_generation()
    }

    pub fn wallet_info(&mut self) -> WalletInfo {
        self.lock_if_expired();
        WalletInfo {
            keypoolsize: self.pool.unused_count(Chain::External),
            keypoolsize_hd_internal: self.pool.unused_count(Chain::Internal),
            keypoololdest: self.pool.oldest(Chain::External),
            unlocked_until: self.secrets.unlocked_until(),
            hdseedid: self.hd_seed_id(),
            encrypted: self.secrets.is_encrypted(),
        }
    }

    pub fn encrypt_wallet(&mut self, passphrase: &str) -> Result<(), WalletError> {
        let plan = self.secrets.plan_encryption(passphrase)?;
        let hd = HdChain::new(plan.seed_id());

        let mut batch = WriteBatch::new();
        self.pool.stage_purge(&mut batch);
        batch.put(Column::Meta, META_HD_CHAIN, encode(&hd));
        batch.put(Column::Meta, META_CRYPTED, encode(&plan.record));
        batch.delete(Column::Meta, META_SEEDS);
        self.store.write_batch(&batch)?;

        let purged = self.pool.reset(hd);
        let dropped = self.reservations.clear();
        self.secrets.apply_encryption(plan);
        // The pool stays empty until an explicit refill under the new seed.
        self.secrets.lock_inner();
        log_info!(
            "Wallet encrypted with new hd seed {} (purged {purged} pool keys, dropped {dropped} reservations)",
            self.hd_seed_id()
        );
        Ok(())
    }

    pub fn wallet_passphrase(
        &mut self,
        passphrase: &str,
        duration_secs: u64,
    ) -> Result<UnlockOutcome, WalletError> {
        let (generation, expiry_ms) =
            self.secrets
                .unlock(passphrase, duration_secs, current_unix_millis())?;
        log_info!(
            "Wallet unlocked{}",
            match expiry_ms {
                Some(_) => format!(" for {}s", duration_secs.min(crate::MAX_UNLOCK_SECONDS)),
                None => String::new(),
            }
        );
        Ok(UnlockOutcome {
            generation,
            expiry_ms,
        })
    }

    pub fn wallet_lock(&mut self) -> Result<(), WalletError> {
        self.secrets.lock()?;
        log_info!("Wallet locked");
        Ok(())
    }

    pub fn wallet_passphrase_change(
        &mut self,
        old_passphrase: &str,
        new_passphrase: &str,
    ) -> Result<(), WalletError> {
        let record = self
            .secrets
            .plan_passphrase_change(old_passphrase, new_passphrase)?;
        self.store
            .put(Column::Meta, META_CRYPTED, &encode(&record))?;
        self.secrets.set_crypted(record);
        log_info!("Wallet passphrase changed");
        Ok(())
    }

    /// Locks the wallet if the unlock generation is still `generation`;
    /// called by the relock timer.
    pub fn lock_if_generation(&mut self, generation: u64) -> bool {
        let locked = self.secrets.lock_if_generation(generation);
        if locked {
            log_info!("Wallet relocked: unlock timeout expired");
        }
        locked
    }

    fn lock_if_expired(&mut self) {
        if self.secrets.lock_if_expired(current_unix_millis()) {
            log_info!("Wallet relocked: unlock timeout expired");
        }
    }

    /// Tops both chains up to `size`.
    pub fn keypool_refill(&mut self, size: usize) -> Result<(), WalletError> {
        self.keypool_refill_targets(size, size)
    }

    pub fn keypool_refill_targets(
        &mut self,
        external: usize,
        internal: usize,
    ) -> Result<(), WalletError> {
        self.lock_if_expired();
        let short = self.pool.unused_count(Chain::External) < external
            || self.pool.unused_count(Chain::Internal) < internal;
        let deriver = if short {
            Some(self.secrets.deriver()?)
        } else {
            None
        };
        let now = current_unix_seconds();
        let store = self.store.as_ref();
        let added_external =
            self.pool
                .refill(store, deriver.as_ref(), Chain::External, external, now)?;
        let added_internal =
            self.pool
                .refill(store, deriver.as_ref(), Chain::Internal, internal, now)?;
        if added_external + added_internal > 0 {
            log_info!(
                "Keypool refilled: +{added_external} external, +{added_internal} internal (now {} / {})",
                self.pool.unused_count(Chain::External),
                self.pool.unused_count(Chain::Internal)
            );
        }
        Ok(())
    }

    pub fn get_new_address(&mut self) -> Result<String, WalletError> {
        self.issue(Chain::External)
    }

    pub fn get_new_change_address(&mut self) -> Result<String, WalletError> {
        self.issue(Chain::Internal)
    }

    fn issue(&mut self, chain: Chain) -> Result<String, WalletError> {
        self.lock_if_expired();
        self.top_up(chain)?;
        let index = self
            .pool
            .next_unused(chain, |entry| self.reservations.is_held(entry))?
            .index;
        let entry = self
            .pool
            .commit(self.store.as_ref(), chain, index, current_unix_seconds())?;
        log_debug!("Issued {} key {}", chain.as_str(), entry.index);
        Ok(self.address_for(&entry.pubkey))
    }

    pub fn reserve_key(&mut self, chain: Chain) -> Result<Reservation, WalletError> {
        self.lock_if_expired();
        self.top_up(chain)?;
        let reservation = self.reservations.reserve(&self.pool, chain)?;
        log_debug!(
            "Reserved {} key {} (reservation {})",
            chain.as_str(),
            reservation.index(),
            reservation.id()
        );
        Ok(reservation)
    }

    /// Holds an external key for a block template's coinbase.
    pub fn request_block_template_key(&mut self) -> Result<Reservation, WalletError> {
        self.reserve_key(Chain::External)
    }

    /// Consumes the held key and returns its address. Only public material
    /// is used, so this works while locked.
    pub fn commit_reservation(
        &mut self,
        reservation: &mut Reservation,
    ) -> Result<String, WalletError> {
        self.reservations.check(reservation)?;
        let entry = self.pool.commit(
            self.store.as_ref(),
            reservation.chain(),
            reservation.index(),
            current_unix_seconds(),
        )?;
        self.reservations
            .resolve(reservation, ReservationState::Committed)?;
        log_debug!(
            "Committed reservation {} ({} key {})",
            reservation.id(),
            entry.chain.as_str(),
            entry.index
        );
        Ok(self.address_for(&entry.pubkey))
    }

    pub fn release_reservation(&mut self, reservation: &mut Reservation) -> Result<(), WalletError> {
        self.reservations
            .resolve(reservation, ReservationState::Released)?;
        log_debug!("Released reservation {}", reservation.id());
        Ok(())
    }

    pub fn reservation_address(&self, reservation: &Reservation) -> String {
        self.address_for(reservation.pubkey())
    }

    pub fn address_info(&self, address: &str) -> Result<AddressInfo, WalletError> {
        let key_hash = address_to_key_hash(address, self.network)?;
        let Some(origin) = self.find_key(&key_hash)? else {
            return Ok(AddressInfo {
                address: address.to_string(),
                ismine: false,
                ischange: false,
                hdkeypath: None,
                hdseedid: None,
                pubkey: None,
            });
        };
        Ok(AddressInfo {
            address: address.to_string(),
            ismine: true,
            ischange: origin.chain == Chain::Internal,
            hdkeypath: Some(hd_key_path(origin.chain, origin.index)),
            hdseedid: Some(reversed_hex(&origin.seed_id)),
            pubkey: Some(bytes_to_hex(&origin.pubkey)),
        })
    }

    /// WIF secret of a wallet address. Needs the seed in memory.
    pub fn dump_priv_key(&mut self, address: &str) -> Result<String, WalletError> {
        self.lock_if_expired();
        if !self.secrets.can_derive() {
            return Err(WalletError::WalletLocked);
        }
        let key_hash = address_to_key_hash(address, self.network)?;
        let origin = self.find_key(&key_hash)?.ok_or(WalletError::UnknownAddress)?;
        let deriver = self.secrets.deriver_for(&origin.seed_id)?;
        let mut secret = deriver.derive_secret(origin.chain, origin.index)?;
        let wif = secret_key_to_wif(&secret, self.network, true);
        secret.zeroize();
        Ok(wif)
    }

    fn find_key(&self, key_hash: &[u8; 20]) -> Result<Option<KeyOrigin>, WalletError> {
        if let Some(bytes) = self.store.get(Column::KeyMeta, key_hash)? {
            let meta: KeyMetaRecord = decode(&bytes)?;
            return Ok(Some(KeyOrigin {
                seed_id: meta.seed_id,
                chain: meta.chain,
                index: meta.index,
                pubkey: meta.pubkey,
            }));
        }
        for chain in Chain::ALL {
            let found = self
                .pool
                .entries(chain)
                .find(|entry| hash160(&entry.pubkey) == *key_hash);
            if let Some(entry) = found {
                return Ok(Some(KeyOrigin {
                    seed_id: self.pool.seed_id(),
                    chain,
                    index: entry.index,
                    pubkey: entry.pubkey,
                }));
            }
        }
        Ok(None)
    }

    fn address_for(&self, pubkey: &[u8; 33]) -> String {
        key_hash_to_address(&hash160(pubkey), self.network)
    }

    fn top_up_all(&mut self) -> Result<(), WalletError> {
        for chain in Chain::ALL {
            self.top_up(chain)?;
        }
        Ok(())
    }

    /// Refills `chain` to the configured size. Only unencrypted wallets top up
    /// on their own; an encrypted wallet derives on `keypool_refill` alone.
    fn top_up(&mut self, chain: Chain) -> Result<(), WalletError> {
        let target = self.config.target(chain);
        if self.secrets.is_encrypted() || self.pool.unused_count(chain) >= target {
            return Ok(());
        }
        let deriver = self.secrets.deriver()?;
        let added = self.pool.refill(
            self.store.as_ref(),
            Some(&deriver),
            chain,
            target,
            current_unix_seconds(),
        )?;
        log_debug!("Topped up {} keypool by {added}", chain.as_str());
        Ok(())
    }
}

pub(crate) fn current_unix_millis() -> u64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    u64::try_from(millis).unwrap_or(u64::MAX)
}

fn current_unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
