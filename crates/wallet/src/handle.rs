//! Thread-safe wallet facade with the auto-relock timer.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use keypoold_log::{log_debug, log_warn};

use crate::error::WalletError;
use crate::keypool::Chain;
use crate::reserve::Reservation;
use crate::wallet::{current_unix_millis, AddressInfo, UnlockOutcome, Wallet, WalletInfo};

struct Inner {
    wallet: Wallet,
    relock: Option<RelockTimer>,
}

/// Pending relock. Dropping it disconnects the channel, which wakes and
/// ends the timer thread without locking.
struct RelockTimer {
    generation: u64,
    _cancel: Sender<()>,
}

impl RelockTimer {
    fn arm(inner: Weak<Mutex<Inner>>, generation: u64, delay: Duration) -> Option<Self> {
        let (cancel, cancelled) = bounded::<()>(0);
        let spawned = thread::Builder::new()
            .name("wallet-relock".to_string())
            .spawn(move || {
                if !matches!(cancelled.recv_timeout(delay), Err(RecvTimeoutError::Timeout)) {
                    return;
                }
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                let mut guard = inner.lock().unwrap_or_else(PoisonError::into_inner);
                guard.wallet.lock_if_generation(generation);
                // A lazy expiry check may have locked first; the timer is spent
                // either way unless a later unlock replaced it.
                if guard
                    .relock
                    .as_ref()
                    .is_some_and(|timer| timer.generation == generation)
                {
                    guard.relock = None;
                }
            });
        match spawned {
            Ok(_) => Some(Self {
                generation,
                _cancel: cancel,
            }),
            Err(err) => {
                // The lazy expiry check still locks the wallet on next use.
                log_warn!("Failed to start wallet relock timer: {err}");
                None
            }
        }
    }
}

/// Shareable handle to one [`Wallet`]. Every call runs under a single mutex,
/// so pool, reservations and lock state are always observed together.
#[derive(Clone)]
pub struct WalletHandle {
    inner: Arc<Mutex<Inner>>,
}

impl WalletHandle {
    pub fn new(wallet: Wallet) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                wallet,
                relock: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` with exclusive access to the wallet.
    pub fn with_wallet<R>(&self, f: impl FnOnce(&mut Wallet) -> R) -> R {
        f(&mut self.lock().wallet)
    }

    pub fn encrypt_wallet(&self, passphrase: &str) -> Result<(), WalletError> {
        let mut guard = self.lock();
        guard.wallet.encrypt_wallet(passphrase)?;
        guard.relock = None;
        Ok(())
    }

    /// Unlocks for `duration_secs` (0: until `wallet_lock`), replacing any
    /// running relock timer.
    pub fn wallet_passphrase(
        &self,
        passphrase: &str,
        duration_secs: u64,
    ) -> Result<UnlockOutcome, WalletError> {
        let mut guard = self.lock();
        let outcome = guard.wallet.wallet_passphrase(passphrase, duration_secs)?;
        guard.relock = None;
        if let Some(expiry_ms) = outcome.expiry_ms {
            let delay = Duration::from_millis(expiry_ms.saturating_sub(current_unix_millis()));
            log_debug!(
                "Arming relock timer for generation {} in {}ms",
                outcome.generation,
                delay.as_millis()
            );
            guard.relock = RelockTimer::arm(Arc::downgrade(&self.inner), outcome.generation, delay);
        }
        Ok(outcome)
    }

    pub fn wallet_lock(&self) -> Result<(), WalletError> {
        let mut guard = self.lock();
        guard.wallet.wallet_lock()?;
        guard.relock = None;
        Ok(())
    }

    pub fn wallet_passphrase_change(
        &self,
        old_passphrase: &str,
        new_passphrase: &str,
    ) -> Result<(), WalletError> {
        self.lock()
            .wallet
            .wallet_passphrase_change(old_passphrase, new_passphrase)
    }

    pub fn keypool_refill(&self, size: usize) -> Result<(), WalletError> {
        self.lock().wallet.keypool_refill(size)
    }

    pub fn get_new_address(&self) -> Result<String, WalletError> {
        self.lock().wallet.get_new_address()
    }

    pub fn get_new_change_address(&self) -> Result<String, WalletError> {
        self.lock().wallet.get_new_change_address()
    }

    pub fn reserve_key(&self, chain: Chain) -> Result<Reservation, WalletError> {
        self.lock().wallet.reserve_key(chain)
    }

    pub fn request_block_template_key(&self) -> Result<Reservation, WalletError> {
        self.lock().wallet.request_block_template_key()
    }

    pub fn commit_reservation(&self, reservation: &mut Reservation) -> Result<String, WalletError> {
        self.lock().wallet.commit_reservation(reservation)
    }

    pub fn release_reservation(&self, reservation: &mut Reservation) -> Result<(), WalletError> {
        self.lock().wallet.release_reservation(reservation)
    }

    pub fn reservation_address(&self, reservation: &Reservation) -> String {
        self.lock().wallet.reservation_address(reservation)
    }

    pub fn wallet_info(&self) -> WalletInfo {
        self.lock().wallet.wallet_info()
    }

    pub fn address_info(&self, address: &str) -> Result<AddressInfo, WalletError> {
        self.lock().wallet.address_info(address)
    }

    pub fn dump_priv_key(&self, address: &str) -> Result<String, WalletError> {
        self.lock().wallet.dump_priv_key(address)
    }

    pub fn default_keypool_size(&self) -> usize {
        self.lock().wallet.config().keypool_size
    }

    /// Whether a relock timer is currently armed for an unlocked wallet.
    pub fn relock_pending(&self) -> bool {
        let mut guard = self.lock();
        if guard.wallet.lock_state().locked {
            guard.relock = None;
        }
        guard.relock.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret::KdfCost;
    use crate::wallet::WalletConfig;
    use keypoold_primitives::Network;
    use keypoold_storage::memory::MemoryStore;

    fn encrypted_handle() -> WalletHandle {
        let config = WalletConfig {
            keypool_size: 1,
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
        handle
    }

    #[test]
    fn timer_relocks_after_expiry() {
        keypoold_log::set_stderr_enabled(false);
        keypoold_log::enable_capture(4096);
        let handle = encrypted_handle();
        handle.wallet_passphrase("pw", 1).expect("unlock");
        assert!(handle.relock_pending());
        assert!(handle.wallet_info().unlocked_until > 0);
        thread::sleep(Duration::from_millis(1_500));
        assert!(keypoold_log::captured(4096)
            .iter()
            .any(|record| record.msg == "Wallet relocked: unlock timeout expired"));
        assert!(!handle.relock_pending());
        assert_eq!(handle.wallet_info().unlocked_until, 0);
        assert!(matches!(
            handle.keypool_refill(5),
            Err(WalletError::WalletLocked)
        ));
    }

    #[test]
    fn explicit_lock_cancels_timer_and_relock_is_idempotent() {
        let handle = encrypted_handle();
        handle.wallet_passphrase("pw", 60).expect("unlock");
        handle.wallet_lock().expect("lock");
        assert!(!handle.relock_pending());
        handle.wallet_lock().expect("second lock");
        assert_eq!(handle.wallet_info().unlocked_until, 0);
    }

    #[test]
    fn relock_by_another_path_disarms_timer() {
        let handle = encrypted_handle();
        let outcome = handle.wallet_passphrase("pw", 60).expect("unlock");
        assert!(handle.relock_pending());
        assert!(handle.with_wallet(|wallet| wallet.lock_if_generation(outcome.generation)));
        assert!(!handle.relock_pending());
        assert_eq!(handle.wallet_info().unlocked_until, 0);
    }

    #[test]
    fn re_unlock_supersedes_short_timer() {
        let handle = encrypted_handle();
        handle.wallet_passphrase("pw", 1).expect("unlock");
        handle.wallet_passphrase("pw", 0).expect("unlock without timeout");
        assert!(!handle.relock_pending());
        thread::sleep(Duration::from_millis(1_300));
        handle.keypool_refill(3).expect("still unlocked");
        assert_eq!(handle.wallet_info().keypoolsize, 3);
    }
}
