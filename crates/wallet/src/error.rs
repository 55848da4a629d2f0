use keypoold_primitives::encoding::DecodeError;
use keypoold_primitives::{AddressError, Network};
use keypoold_storage::StoreError;

use crate::keypool::Chain;

#[derive(Debug)]
pub enum WalletError {
    Store(StoreError),
    Decode(DecodeError),
    InvalidData(&'static str),
    NetworkMismatch { expected: Network, found: Network },
    InvalidAddress(AddressError),
    UnknownAddress,
    /// Derivation or a secret was needed but the seed is not in memory.
    WalletLocked,
    PoolExhausted(Chain),
    WrongPassphrase,
    AlreadyEncrypted,
    NotEncrypted,
    /// The reservation was already committed, released or invalidated.
    InvalidReservation,
}

impl std::fmt::Display for WalletError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WalletError::Store(err) => write!(f, "wallet store error: {err}"),
            WalletError::Decode(err) => write!(f, "corrupt wallet record: {err}"),
            WalletError::InvalidData(msg) => write!(f, "{msg}"),
            WalletError::NetworkMismatch { expected, found } => write!(
                f,
                "wallet network mismatch (expected {}, found {})",
                expected.as_str(),
                found.as_str()
            ),
            WalletError::InvalidAddress(err) => write!(f, "Invalid address: {err}"),
            WalletError::UnknownAddress => write!(f, "Address does not refer to a wallet key"),
            WalletError::WalletLocked => write!(
                f,
                "Error: Please enter the wallet passphrase with walletpassphrase first."
            ),
            WalletError::PoolExhausted(_) => write!(f, "Keypool ran out"),
            WalletError::WrongPassphrase => {
                write!(f, "Error: The wallet passphrase entered was incorrect.")
            }
            WalletError::AlreadyEncrypted => write!(
                f,
                "Error: running with an encrypted wallet, but encryptwallet was called."
            ),
            WalletError::NotEncrypted => {
                write!(f, "Error: running with an unencrypted wallet.")
            }
            WalletError::InvalidReservation => {
                write!(f, "Reservation is no longer pending")
            }
        }
    }
}

impl std::error::Error for WalletError {}

impl From<StoreError> for WalletError {
    fn from(err: StoreError) -> Self {
        WalletError::Store(err)
    }
}

impl From<DecodeError> for WalletError {
    fn from(err: DecodeError) -> Self {
        WalletError::Decode(err)
    }
}

impl From<AddressError> for WalletError {
    fn from(err: AddressError) -> Self {
        WalletError::InvalidAddress(err)
    }
}
