//! HD key pool wallet: seed custody, pre-derived key buffers, reservations
//! and timed unlocking.

pub mod derive;
pub mod error;
pub mod handle;
pub mod keypool;
pub mod records;
pub mod reserve;
pub mod secret;
pub mod wallet;

pub use derive::{seed_id, DerivedPubKey, KeyDeriver, SeedId};
pub use error::WalletError;
pub use handle::WalletHandle;
pub use keypool::{Chain, KeyPool, KeyPoolEntry};
pub use reserve::{Reservation, ReservationManager, ReservationState};
pub use secret::{KdfCost, LockState, SecretStore, MAX_UNLOCK_SECONDS};
pub use wallet::{
    AddressInfo, UnlockOutcome, Wallet, WalletConfig, WalletInfo, DEFAULT_KEYPOOL_SIZE,
};
