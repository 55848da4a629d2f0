use std::sync::Arc;

use keypoold_primitives::Network;
use keypoold_storage::memory::MemoryStore;
use keypoold_wallet::{
    Chain, KdfCost, ReservationState, Wallet, WalletConfig, WalletError, WalletHandle,
};

fn encrypted_wallet(keypool_size: usize) -> WalletHandle {
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
        .expect("create wallet");
    let handle = WalletHandle::new(wallet);
    handle.encrypt_wallet("pw").expect("encrypt");
    handle.wallet_passphrase("pw", 0).expect("unlock");
    handle.keypool_refill(keypool_size).expect("refill");
    handle.wallet_lock().expect("lock");
    handle
}

#[test]
fn released_reservations_never_drain_the_pool() {
    let wallet = encrypted_wallet(4);
    let mut first_index = None;
    for _ in 0..10 {
        let mut held = wallet.request_block_template_key().expect("reserve");
        assert_eq!(*first_index.get_or_insert(held.index()), held.index());
        assert_eq!(wallet.wallet_info().keypoolsize, 4);
        wallet.release_reservation(&mut held).expect("release");
        assert_eq!(held.state(), ReservationState::Released);
    }
    assert_eq!(wallet.wallet_info().keypoolsize, 4);
}

#[test]
fn commit_drains_exactly_one_and_cannot_repeat() {
    let wallet = encrypted_wallet(2);
    let mut held = wallet.reserve_key(Chain::External).expect("reserve");
    let expected = wallet.reservation_address(&held);
    assert_eq!(wallet.commit_reservation(&mut held).expect("commit"), expected);
    assert_eq!(held.state(), ReservationState::Committed);
    assert_eq!(wallet.wallet_info().keypoolsize, 1);

    assert!(matches!(
        wallet.commit_reservation(&mut held),
        Err(WalletError::InvalidReservation)
    ));
    assert!(matches!(
        wallet.release_reservation(&mut held),
        Err(WalletError::InvalidReservation)
    ));
    assert_ne!(wallet.get_new_address().expect("address"), expected);
}

#[test]
fn reserving_from_an_empty_locked_pool_fails() {
    let wallet = encrypted_wallet(1);
    let _held = wallet.request_block_template_key().expect("reserve");
    let err = wallet
        .request_block_template_key()
        .expect_err("only entry already held");
    assert!(matches!(err, WalletError::PoolExhausted(Chain::External)));
}

#[test]
fn unlocked_encrypted_pool_waits_for_refill() {
    let wallet = encrypted_wallet(1);
    wallet.wallet_passphrase("pw", 0).expect("unlock");
    let mut held = wallet.request_block_template_key().expect("reserve");
    wallet.commit_reservation(&mut held).expect("commit");
    assert!(matches!(
        wallet.request_block_template_key(),
        Err(WalletError::PoolExhausted(Chain::External))
    ));

    wallet.keypool_refill(1).expect("refill");
    let mut next = wallet.request_block_template_key().expect("reserve");
    assert_ne!(next.index(), held.index());
    wallet.release_reservation(&mut next).expect("release");
}
