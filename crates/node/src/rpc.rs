//! JSON-RPC 1.0 style dispatch over the wallet and the auxpow miner.
//!
//! A request is `{"id", "method", "params"}` with positional params; a
//! response is `{"result", "error", "id"}` with exactly one of `result` and
//! `error` non-null.

use std::sync::{Mutex, MutexGuard, PoisonError};

use keypoold_log::{log_debug, log_warn};
use keypoold_primitives::hex_to_bytes;
use keypoold_wallet::{Chain, WalletError, WalletHandle};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::auxpow::{AuxpowMiner, MinerError};

pub const RPC_MISC_ERROR: i32 = -1;
pub const RPC_INVALID_ADDRESS_OR_KEY: i32 = -5;
pub const RPC_INVALID_PARAMETER: i32 = -8;
pub const RPC_WALLET_ERROR: i32 = -12;
pub const RPC_WALLET_WRONG_ENC_STATE: i32 = -15;
pub const RPC_INVALID_REQUEST: i32 = -32600;
pub const RPC_METHOD_NOT_FOUND: i32 = -32601;
pub const RPC_PARSE_ERROR: i32 = -32700;

const KEYPOOL_RAN_OUT_RECEIVE: &str = "Error: Keypool ran out, please call keypoolrefill first";

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize)]
struct RpcResponse {
    result: Value,
    error: Option<RpcError>,
    id: Value,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::new(RPC_INVALID_PARAMETER, message)
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

impl std::error::Error for RpcError {}

impl From<WalletError> for RpcError {
    fn from(err: WalletError) -> Self {
        let code = match &err {
            WalletError::PoolExhausted(_) | WalletError::WalletLocked | WalletError::WrongPassphrase => {
                RPC_WALLET_ERROR
            }
            WalletError::AlreadyEncrypted | WalletError::NotEncrypted => RPC_WALLET_WRONG_ENC_STATE,
            WalletError::InvalidReservation => RPC_INVALID_PARAMETER,
            WalletError::InvalidAddress(_) | WalletError::UnknownAddress => {
                RPC_INVALID_ADDRESS_OR_KEY
            }
            WalletError::Store(_)
            | WalletError::Decode(_)
            | WalletError::InvalidData(_)
            | WalletError::NetworkMismatch { .. } => RPC_MISC_ERROR,
        };
        Self::new(code, err.to_string())
    }
}

impl From<MinerError> for RpcError {
    fn from(err: MinerError) -> Self {
        match err {
            MinerError::Wallet(err) => err.into(),
            MinerError::UnknownTemplate | MinerError::InvalidParameter(_) => {
                Self::invalid_parameter(err.to_string())
            }
        }
    }
}

pub struct RpcDispatcher {
    wallet: WalletHandle,
    miner: Mutex<AuxpowMiner>,
}

impl RpcDispatcher {
    pub fn new(wallet: WalletHandle, miner: AuxpowMiner) -> Self {
        Self {
            wallet,
            miner: Mutex::new(miner),
        }
    }

    pub fn wallet(&self) -> &WalletHandle {
        &self.wallet
    }

    fn miner(&self) -> MutexGuard<'_, AuxpowMiner> {
        self.miner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns any key held for block templates to the pool.
    pub fn shutdown(&self) {
        if let Err(err) = self.miner().discard_templates() {
            log_warn!("Failed to release block template key: {err}");
        }
    }

    /// Handles one request line and returns the serialized response line.
    pub fn handle_line(&self, line: &str) -> String {
        let response = match serde_json::from_str::<RpcRequest>(line) {
            Ok(request) => {
                let outcome = match request.params {
                    Value::Null => self.dispatch(&request.method, &[]),
                    Value::Array(params) => self.dispatch(&request.method, &params),
                    _ => Err(RpcError::new(RPC_INVALID_REQUEST, "params must be an array")),
                };
                match outcome {
                    Ok(result) => RpcResponse {
                        result,
                        error: None,
                        id: request.id,
                    },
                    Err(err) => {
                        log_debug!("RPC {} failed: {err}", request.method);
                        RpcResponse {
                            result: Value::Null,
                            error: Some(err),
                            id: request.id,
                        }
                    }
                }
            }
            Err(err) => RpcResponse {
                result: Value::Null,
                error: Some(RpcError::new(RPC_PARSE_ERROR, format!("parse error: {err}"))),
                id: Value::Null,
            },
        };
        serde_json::to_string(&response).unwrap_or_else(|err| {
            log_warn!("Failed to serialize RPC response: {err}");
            format!(
                "{{\"result\":null,\"error\":{{\"code\":{RPC_MISC_ERROR},\"message\":\"internal error\"}},\"id\":null}}"
            )
        })
    }

    pub fn dispatch(&self, method: &str, params: &[Value]) -> Result<Value, RpcError> {
        match method {
            "getnewaddress" => self.wallet.get_new_address().map(Value::String).map_err(|err| {
                match err {
                    WalletError::PoolExhausted(Chain::External) => {
                        RpcError::new(RPC_WALLET_ERROR, KEYPOOL_RAN_OUT_RECEIVE)
                    }
                    other => other.into(),
                }
            }),
            "getrawchangeaddress" => Ok(Value::String(self.wallet.get_new_change_address()?)),
            "keypoolrefill" => {
                let size = match optional_u64(params, 0, "keypoolrefill size")? {
                    Some(size) => usize::try_from(size)
                        .map_err(|_| RpcError::invalid_parameter("keypoolrefill size too large"))?,
                    None => self.wallet.default_keypool_size(),
                };
                self.wallet.keypool_refill(size)?;
                Ok(Value::Null)
            }
            "encryptwallet" => {
                let passphrase = required_str(params, 0, "passphrase")?;
                if passphrase.is_empty() {
                    return Err(RpcError::invalid_parameter("passphrase can not be empty"));
                }
                // Encryption replaces the pool, so any template key must go first.
                if !self.wallet.wallet_info().encrypted {
                    self.miner().discard_templates()?;
                }
                self.wallet.encrypt_wallet(passphrase)?;
                Ok(Value::String(
                    "wallet encrypted; The keypool has been flushed and a new HD seed was generated. You need to make a new backup."
                        .to_string(),
                ))
            }
            "walletpassphrase" => {
                let passphrase = required_str(params, 0, "passphrase")?;
                let timeout = match params.get(1) {
                    Some(value) => {
                        let timeout = value
                            .as_i64()
                            .ok_or_else(|| RpcError::invalid_parameter("timeout must be an integer"))?;
                        u64::try_from(timeout)
                            .map_err(|_| RpcError::invalid_parameter("Timeout cannot be negative."))?
                    }
                    None => return Err(RpcError::invalid_parameter("missing timeout")),
                };
                self.wallet.wallet_passphrase(passphrase, timeout)?;
                Ok(Value::Null)
            }
            "walletlock" => {
                self.wallet.wallet_lock()?;
                Ok(Value::Null)
            }
            "walletpassphrasechange" => {
                let old = required_str(params, 0, "oldpassphrase")?;
                let new = required_str(params, 1, "newpassphrase")?;
                if new.is_empty() {
                    return Err(RpcError::invalid_parameter("passphrase can not be empty"));
                }
                self.wallet.wallet_passphrase_change(old, new)?;
                Ok(Value::Null)
            }
            "getwalletinfo" => {
                let info = self.wallet.wallet_info();
                Ok(json!({
                    "encrypted": info.encrypted,
                    "keypoololdest": info.keypoololdest,
                    "keypoolsize": info.keypoolsize,
                    "keypoolsize_hd_internal": info.keypoolsize_hd_internal,
                    "unlocked_until": info.unlocked_until,
                    "hdseedid": info.hdseedid,
                }))
            }
            "getaddressinfo" => {
                let address = required_str(params, 0, "address")?;
                let info = self.wallet.address_info(address)?;
                let mut out = Map::new();
                out.insert("address".to_string(), Value::String(info.address));
                out.insert("ismine".to_string(), Value::Bool(info.ismine));
                out.insert("ischange".to_string(), Value::Bool(info.ischange));
                if let Some(path) = info.hdkeypath {
                    out.insert("hdkeypath".to_string(), Value::String(path));
                }
                if let Some(seed_id) = info.hdseedid {
                    out.insert("hdseedid".to_string(), Value::String(seed_id));
                }
                if let Some(pubkey) = info.pubkey {
                    out.insert("pubkey".to_string(), Value::String(pubkey));
                }
                Ok(Value::Object(out))
            }
            "dumpprivkey" => {
                let address = required_str(params, 0, "address")?;
                Ok(Value::String(self.wallet.dump_priv_key(address)?))
            }
            "createauxblock" => self.create_aux_block(),
            "submitauxblock" => {
                let hash = required_str(params, 0, "hash")?;
                let auxpow = required_str(params, 1, "auxpow")?;
                self.submit_aux_block(hash, auxpow)
            }
            "getauxblock" => match params.len() {
                0 => self.create_aux_block(),
                2 => {
                    let hash = required_str(params, 0, "hash")?;
                    let auxpow = required_str(params, 1, "auxpow")?;
                    self.submit_aux_block(hash, auxpow)
                }
                _ => Err(RpcError::invalid_parameter(
                    "getauxblock takes either no parameters or hash and auxpow",
                )),
            },
            other => Err(RpcError::new(
                RPC_METHOD_NOT_FOUND,
                format!("Method not found: {other}"),
            )),
        }
    }

    fn create_aux_block(&self) -> Result<Value, RpcError> {
        let template = self.miner().create_aux_block()?;
        serde_json::to_value(template.info())
            .map_err(|err| RpcError::new(RPC_MISC_ERROR, err.to_string()))
    }

    fn submit_aux_block(&self, hash: &str, auxpow_hex: &str) -> Result<Value, RpcError> {
        let auxpow = hex_to_bytes(auxpow_hex)
            .ok_or_else(|| RpcError::invalid_parameter("auxpow must be hexadecimal"))?;
        let accepted = self.miner().submit_aux_block(hash, &auxpow)?;
        Ok(Value::Bool(accepted))
    }
}

fn required_str<'a>(params: &'a [Value], index: usize, name: &str) -> Result<&'a str, RpcError> {
    params
        .get(index)
        .ok_or_else(|| RpcError::invalid_parameter(format!("missing {name}")))?
        .as_str()
        .ok_or_else(|| RpcError::invalid_parameter(format!("{name} must be a string")))
}

fn optional_u64(params: &[Value], index: usize, name: &str) -> Result<Option<u64>, RpcError> {
    match params.get(index) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .map(Some)
            .ok_or_else(|| RpcError::invalid_parameter(format!("{name} must be a non-negative integer"))),
    }
}
