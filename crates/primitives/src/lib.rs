//! Network parameters, hashing, address encoding and record serialization.

pub mod address;
pub mod encoding;
pub mod hash;
pub mod hex;
pub mod network;

pub use address::{
    address_to_key_hash, key_hash_to_address, p2pkh_script, secret_key_to_wif, wif_to_secret_key,
    AddressError,
};
pub use hash::{hash160, sha256, sha256d, Hash256};
pub use hex::{bytes_to_hex, hex_to_bytes, reversed_hex};
pub use network::Network;
