//! Two-phase holds on pool keys for operations that may be abandoned.

use std::collections::HashMap;

use crate::error::WalletError;
use crate::keypool::{Chain, KeyPool, KeyPoolEntry};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReservationState {
    Pending,
    Committed,
    Released,
}

/// Ticket for a held pool entry. The entry stays in the pool (and in the
/// reported pool size) until the ticket is committed.
#[derive(Clone, Debug)]
pub struct Reservation {
    id: u64,
    chain: Chain,
    index: u32,
    pubkey: [u8; 33],
    state: ReservationState,
}

impl Reservation {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn chain(&self) -> Chain {
        self.chain
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn pubkey(&self) -> &[u8; 33] {
        &self.pubkey
    }

    pub fn state(&self) -> ReservationState {
        self.state
    }
}

#[derive(Default)]
pub struct ReservationManager {
    next_id: u64,
    pending: HashMap<u64, (Chain, u32)>,
}

impl ReservationManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, entry: &KeyPoolEntry) -> bool {
        self.pending
            .values()
            .any(|(chain, index)| *chain == entry.chain && *index == entry.index)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Holds the lowest-index entry of `chain` not already held.
    pub fn reserve(&mut self, pool: &KeyPool, chain: Chain) -> Result<Reservation, WalletError> {
        let entry = pool.next_unused(chain, |entry| self.is_held(entry))?;
        self.next_id = self.next_id.wrapping_add(1);
        let id = self.next_id;
        self.pending.insert(id, (chain, entry.index));
        Ok(Reservation {
            id,
            chain,
            index: entry.index,
            pubkey: entry.pubkey,
            state: ReservationState::Pending,
        })
    }

    /// Fails with `InvalidReservation` unless `reservation` is still pending
    /// in this manager.
    pub fn check(&self, reservation: &Reservation) -> Result<(), WalletError> {
        if reservation.state != ReservationState::Pending {
            return Err(WalletError::InvalidReservation);
        }
        match self.pending.get(&reservation.id) {
            Some((chain, index)) if *chain == reservation.chain && *index == reservation.index => {
                Ok(())
            }
            _ => Err(WalletError::InvalidReservation),
        }
    }

    pub fn resolve(
        &mut self,
        reservation: &mut Reservation,
        outcome: ReservationState,
    ) -> Result<(), WalletError> {
        self.check(reservation)?;
        self.pending.remove(&reservation.id);
        reservation.state = outcome;
        Ok(())
    }

    /// Invalidates every pending reservation; returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derive::{seed_id, KeyDeriver};
    use crate::records::HdChain;
    use keypoold_storage::memory::MemoryStore;

    fn pool_with(count: usize) -> KeyPool {
        let seed = [9u8; 32];
        let store = MemoryStore::new();
        let deriver = KeyDeriver::new(&seed).expect("deriver");
        let mut pool = KeyPool::new(HdChain::new(seed_id(&seed).expect("id")));
        pool.refill(&store, Some(&deriver), Chain::External, count, 0)
            .expect("refill");
        pool
    }

    #[test]
    fn concurrent_holds_never_share_an_entry() {
        let pool = pool_with(2);
        let mut manager = ReservationManager::new();
        let first = manager.reserve(&pool, Chain::External).expect("first");
        let second = manager.reserve(&pool, Chain::External).expect("second");
        assert_ne!(first.index(), second.index());
        assert!(matches!(
            manager.reserve(&pool, Chain::External),
            Err(WalletError::PoolExhausted(Chain::External))
        ));
        assert_eq!(pool.unused_count(Chain::External), 2);
    }

    #[test]
    fn release_returns_the_same_entry_next_time() {
        let pool = pool_with(3);
        let mut manager = ReservationManager::new();
        let mut held = manager.reserve(&pool, Chain::External).expect("reserve");
        manager
            .resolve(&mut held, ReservationState::Released)
            .expect("release");
        assert_eq!(held.state(), ReservationState::Released);
        let again = manager.reserve(&pool, Chain::External).expect("reserve");
        assert_eq!(again.index(), held.index());
        assert_ne!(again.id(), held.id());
    }

    #[test]
    fn resolving_twice_or_a_stale_clone_fails() {
        let pool = pool_with(1);
        let mut manager = ReservationManager::new();
        let mut held = manager.reserve(&pool, Chain::External).expect("reserve");
        let mut copy = held.clone();
        manager
            .resolve(&mut held, ReservationState::Committed)
            .expect("commit");
        assert!(matches!(
            manager.resolve(&mut held, ReservationState::Committed),
            Err(WalletError::InvalidReservation)
        ));
        assert!(matches!(
            manager.resolve(&mut copy, ReservationState::Released),
            Err(WalletError::InvalidReservation)
        ));
    }

    #[test]
    fn clear_invalidates_pending_tickets() {
        let pool = pool_with(1);
        let mut manager = ReservationManager::new();
        let mut held = manager.reserve(&pool, Chain::External).expect("reserve");
        assert_eq!(manager.clear(), 1);
        assert_eq!(manager.pending_count(), 0);
        assert!(matches!(
            manager.check(&held),
            Err(WalletError::InvalidReservation)
        ));
        assert!(manager
            .resolve(&mut held, ReservationState::Released)
            .is_err());
    }
}
