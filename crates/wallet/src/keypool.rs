//! Buffer of pre-derived, unused keys for the external and internal chains.
//!
//! Every unused entry is a record in [`Column::KeyPool`]; the in-memory maps
//! mirror the store and are only updated after a batch has been written.

use std::collections::BTreeMap;

use keypoold_primitives::encoding::{decode, encode};
use keypoold_storage::{Column, KeyValueStore, WriteBatch};

use crate::derive::{KeyDeriver, SeedId};
use crate::error::WalletError;
use crate::records::{
    parse_pool_key, pool_key, HdChain, KeyMetaRecord, PoolRecord, META_HD_CHAIN,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Chain {
    /// Receiving addresses.
    External,
    /// Change addresses.
    Internal,
}

impl Chain {
    pub const ALL: [Chain; 2] = [Chain::External, Chain::Internal];

    pub fn to_byte(self) -> u8 {
        match self {
            Chain::External => 0,
            Chain::Internal => 1,
        }
    }

    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            0 => Some(Chain::External),
            1 => Some(Chain::Internal),
            _ => None,
        }
    }

    /// Hardened child number of this chain below the account key.
    pub fn path_component(self) -> u32 {
        u32::from(self.to_byte())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Chain::External => "external",
            Chain::Internal => "internal",
        }
    }

    fn slot(self) -> usize {
        usize::from(self.to_byte())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KeyPoolEntry {
    pub chain: Chain,
    pub index: u32,
    pub pubkey: [u8; 33],
    pub created_at: u64,
    pub used: bool,
}

pub struct KeyPool {
    hd: HdChain,
    unused: [BTreeMap<u32, KeyPoolEntry>; 2],
}

impl KeyPool {
    pub fn new(hd: HdChain) -> Self {
        Self {
            hd,
            unused: [BTreeMap::new(), BTreeMap::new()],
        }
    }

    pub fn load(store: &dyn KeyValueStore, hd: HdChain) -> Result<Self, WalletError> {
        let mut pool = Self::new(hd);
        for (key, value) in store.scan_prefix(Column::KeyPool, &[])? {
            let (chain, index) = parse_pool_key(&key)?;
            let record: PoolRecord = decode(&value)?;
            if index >= pool.hd.next_index(chain) {
                return Err(WalletError::InvalidData("pool entry beyond hd chain counter"));
            }
            pool.unused[chain.slot()].insert(
                index,
                KeyPoolEntry {
                    chain,
                    index,
                    pubkey: record.pubkey,
                    created_at: record.created_at,
                    used: false,
                },
            );
        }
        Ok(pool)
    }

    pub fn hd_chain(&self) -> &HdChain {
        &self.hd
    }

    pub fn seed_id(&self) -> SeedId {
        self.hd.seed_id
    }

    pub fn unused_count(&self, chain: Chain) -> usize {
        self.unused[chain.slot()].len()
    }

    /// `created_at` of the oldest unused entry of `chain`, 0 when empty.
    pub fn oldest(&self, chain: Chain) -> u64 {
        self.unused[chain.slot()]
            .values()
            .map(|entry| entry.created_at)
            .min()
            .unwrap_or(0)
    }

    pub fn entries(&self, chain: Chain) -> impl Iterator<Item = &KeyPoolEntry> {
        self.unused[chain.slot()].values()
    }

    pub fn get(&self, chain: Chain, index: u32) -> Option<&KeyPoolEntry> {
        self.unused[chain.slot()].get(&index)
    }

    /// Lowest-index unused entry of `chain` that `skip` does not exclude.
    pub fn next_unused(
        &self,
        chain: Chain,
        skip: impl Fn(&KeyPoolEntry) -> bool,
    ) -> Result<&KeyPoolEntry, WalletError> {
        self.unused[chain.slot()]
            .values()
            .find(|entry| !skip(entry))
            .ok_or(WalletError::PoolExhausted(chain))
    }

    /// Derives entries until `chain` holds at least `target` unused keys.
    /// Returns how many were added; `deriver` is only consulted when the
    /// pool is short, so a locked wallet with a full pool succeeds.
    pub fn refill(
        &mut self,
        store: &dyn KeyValueStore,
        deriver: Option<&KeyDeriver>,
        chain: Chain,
        target: usize,
        now: u64,
    ) -> Result<usize, WalletError> {
        let missing = target.saturating_sub(self.unused_count(chain));
        if missing == 0 {
            return Ok(0);
        }
        let deriver = deriver.ok_or(WalletError::WalletLocked)?;

        let mut hd = self.hd.clone();
        let mut added = Vec::with_capacity(missing);
        let mut batch = WriteBatch::new();
        for _ in 0..missing {
            let derived = deriver.derive(chain, hd.next_index(chain))?;
            let record = PoolRecord {
                pubkey: derived.pubkey,
                created_at: now,
            };
            batch.put(Column::KeyPool, pool_key(chain, derived.index), encode(&record));
            hd.set_next_index(chain, derived.index.saturating_add(1));
            added.push(KeyPoolEntry {
                chain,
                index: derived.index,
                pubkey: derived.pubkey,
                created_at: now,
                used: false,
            });
        }
        batch.put(Column::Meta, META_HD_CHAIN, encode(&hd));
        store.write_batch(&batch)?;

        self.hd = hd;
        let count = added.len();
        for entry in added {
            self.unused[chain.slot()].insert(entry.index, entry);
        }
        Ok(count)
    }

    /// Marks the entry used: its pool record is replaced by key metadata in a
    /// single batch. Irreversible.
    pub fn commit(
        &mut self,
        store: &dyn KeyValueStore,
        chain: Chain,
        index: u32,
        now: u64,
    ) -> Result<KeyPoolEntry, WalletError> {
        let entry = self
            .get(chain, index)
            .ok_or(WalletError::InvalidReservation)?;
        let meta = KeyMetaRecord {
            seed_id: self.hd.seed_id,
            chain,
            index,
            pubkey: entry.pubkey,
            created_at: now,
        };
        let key_hash = keypoold_primitives::hash160(&entry.pubkey);

        let mut batch = WriteBatch::new();
        batch.delete(Column::KeyPool, pool_key(chain, index));
        batch.put(Column::KeyMeta, key_hash, encode(&meta));
        store.write_batch(&batch)?;

        let mut entry = self.unused[chain.slot()]
            .remove(&index)
            .ok_or(WalletError::InvalidReservation)?;
        entry.used = true;
        Ok(entry)
    }

    /// Stages deletion of every unused entry, for a seed change.
    pub fn stage_purge(&self, batch: &mut WriteBatch) {
        for chain in Chain::ALL {
            for index in self.unused[chain.slot()].keys() {
                batch.delete(Column::KeyPool, pool_key(chain, *index));
            }
        }
    }

    /// Drops all unused entries from memory and adopts `hd`. Call only after
    /// a batch from [`KeyPool::stage_purge`] has been written.
    pub fn reset(&mut self, hd: HdChain) -> usize {
        let purged = self.unused.iter().map(BTreeMap::len).sum();
        self.unused = [BTreeMap::new(), BTreeMap::new()];
        self.hd = hd;
        purged
    }
}
