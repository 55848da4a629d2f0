use std::sync::Arc;

use keypoold::auxpow::{AuxpowMiner, LocalChain};
use keypoold::config::{Backend, Config};
use keypoold::rpc::{
    RpcDispatcher, RPC_INVALID_ADDRESS_OR_KEY, RPC_INVALID_PARAMETER, RPC_METHOD_NOT_FOUND,
    RPC_PARSE_ERROR, RPC_WALLET_ERROR, RPC_WALLET_WRONG_ENC_STATE,
};
use keypoold_log as logging;
use keypoold_primitives::Network;
use keypoold_storage::memory::MemoryStore;
use keypoold_wallet::{KdfCost, Wallet, WalletConfig, WalletHandle, DEFAULT_KEYPOOL_SIZE};
use serde_json::{json, Value};

fn dispatcher(keypool_size: usize) -> RpcDispatcher {
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
    let miner = AuxpowMiner::new(handle.clone(), Box::new(LocalChain::new()));
    RpcDispatcher::new(handle, miner)
}

fn call(rpc: &RpcDispatcher, method: &str, params: Value) -> Value {
    let line = json!({"id": 1, "method": method, "params": params}).to_string();
    let response: Value = serde_json::from_str(&rpc.handle_line(&line)).expect("response json");
    assert_eq!(response["id"], json!(1));
    response
}

fn ok(rpc: &RpcDispatcher, method: &str, params: Value) -> Value {
    let response = call(rpc, method, params);
    assert!(response["error"].is_null(), "{method} failed: {response}");
    response["result"].clone()
}

fn err(rpc: &RpcDispatcher, method: &str, params: Value) -> (i64, String) {
    let response = call(rpc, method, params);
    assert!(response["result"].is_null());
    let code = response["error"]["code"].as_i64().expect("error code");
    let message = response["error"]["message"]
        .as_str()
        .expect("error message")
        .to_string();
    (code, message)
}

#[test]
fn keypool_drain_over_rpc() {
    let rpc = dispatcher(1);
    let before = ok(&rpc, "getwalletinfo", json!([]))["hdseedid"].clone();

    ok(&rpc, "encryptwallet", json!(["test"]));
    let info = ok(&rpc, "getwalletinfo", json!([]));
    assert_ne!(info["hdseedid"], before);
    assert_eq!(info["encrypted"], json!(true));
    assert_eq!(info["unlocked_until"], json!(0));

    ok(&rpc, "walletpassphrase", json!(["test", 12000]));
    ok(&rpc, "keypoolrefill", json!([6]));
    ok(&rpc, "walletlock", json!([]));
    let info = ok(&rpc, "getwalletinfo", json!([]));
    assert_eq!(info["keypoolsize"], json!(6));
    assert_eq!(info["keypoolsize_hd_internal"], json!(6));

    for _ in 0..6 {
        ok(&rpc, "getrawchangeaddress", json!([]));
    }
    assert_eq!(
        err(&rpc, "getrawchangeaddress", json!([])),
        (i64::from(RPC_WALLET_ERROR), "Keypool ran out".to_string())
    );

    for _ in 0..6 {
        ok(&rpc, "getnewaddress", json!([]));
    }
    assert_eq!(
        err(&rpc, "getnewaddress", json!([])),
        (
            i64::from(RPC_WALLET_ERROR),
            "Error: Keypool ran out, please call keypoolrefill first".to_string()
        )
    );
    let (code, message) = err(&rpc, "getauxblock", json!([]));
    assert_eq!(code, i64::from(RPC_WALLET_ERROR));
    assert_eq!(message, "Keypool ran out");
}

#[test]
fn aux_block_templates_do_not_drain_the_pool() {
    let rpc = dispatcher(1);
    ok(&rpc, "encryptwallet", json!(["test"]));
    let (code, _) = err(&rpc, "getauxblock", json!([]));
    assert_eq!(code, i64::from(RPC_WALLET_ERROR));
    ok(&rpc, "walletpassphrase", json!(["test", 0]));
    ok(&rpc, "keypoolrefill", json!([1]));
    ok(&rpc, "walletlock", json!([]));

    let first = ok(&rpc, "getauxblock", json!([]));
    for _ in 0..4 {
        let next = ok(&rpc, "createauxblock", json!([]));
        assert_ne!(next["hash"], first["hash"]);
        assert_eq!(next["height"], json!(1));
    }
    assert_eq!(ok(&rpc, "getwalletinfo", json!([]))["keypoolsize"], json!(1));

    let hash = first["hash"].as_str().expect("hash");
    let accepted = ok(&rpc, "getauxblock", json!([hash, "00ff"]));
    assert_eq!(accepted, json!(true));
    assert_eq!(ok(&rpc, "getwalletinfo", json!([]))["keypoolsize"], json!(0));

    // Templates from before the accepted block are gone.
    let (code, _) = err(&rpc, "submitauxblock", json!([hash, "00ff"]));
    assert_eq!(code, i64::from(RPC_INVALID_PARAMETER));
}

#[test]
fn default_config_drain_and_short_unlock() {
    let config = Config {
        backend: Backend::Memory,
        data_dir: std::env::temp_dir(),
        conf_path: std::env::temp_dir().join("keypoold.conf"),
        network: Network::Regtest,
        keypool_size: DEFAULT_KEYPOOL_SIZE,
        log_level: logging::Level::Info,
        log_format: logging::Format::Text,
        log_timestamps: true,
    };
    let rpc = keypoold::open_dispatcher(&config).expect("open");
    let info = ok(&rpc, "getwalletinfo", json!([]));
    assert_eq!(info["keypoolsize"], json!(DEFAULT_KEYPOOL_SIZE));

    ok(&rpc, "encryptwallet", json!(["test"]));
    assert_eq!(ok(&rpc, "getwalletinfo", json!([]))["keypoolsize"], json!(0));

    ok(&rpc, "walletpassphrase", json!(["test", 12000]));
    ok(&rpc, "keypoolrefill", json!([6]));
    ok(&rpc, "walletlock", json!([]));
    for _ in 0..6 {
        ok(&rpc, "getrawchangeaddress", json!([]));
    }
    assert_eq!(
        err(&rpc, "getrawchangeaddress", json!([])),
        (i64::from(RPC_WALLET_ERROR), "Keypool ran out".to_string())
    );
    for _ in 0..6 {
        ok(&rpc, "getnewaddress", json!([]));
    }
    assert_eq!(err(&rpc, "getnewaddress", json!([])).0, i64::from(RPC_WALLET_ERROR));

    ok(&rpc, "walletpassphrase", json!(["test", 1]));
    ok(&rpc, "keypoolrefill", json!([3]));
    assert_eq!(ok(&rpc, "getwalletinfo", json!([]))["keypoolsize"], json!(3));
    std::thread::sleep(std::time::Duration::from_millis(1_100));
    assert_eq!(ok(&rpc, "getwalletinfo", json!([]))["unlocked_until"], json!(0));
    for _ in 0..3 {
        ok(&rpc, "getnewaddress", json!([]));
    }
    assert_eq!(
        err(&rpc, "getnewaddress", json!([])),
        (
            i64::from(RPC_WALLET_ERROR),
            "Error: Keypool ran out, please call keypoolrefill first".to_string()
        )
    );

    ok(&rpc, "walletpassphrase", json!(["test", 100]));
    ok(&rpc, "keypoolrefill", json!([100]));
    let info = ok(&rpc, "getwalletinfo", json!([]));
    assert_eq!(info["keypoolsize"], json!(100));
    assert_eq!(info["keypoolsize_hd_internal"], json!(100));
    rpc.shutdown();
}

#[test]
fn encryption_state_errors() {
    let rpc = dispatcher(2);
    assert_eq!(
        err(&rpc, "walletlock", json!([])).0,
        i64::from(RPC_WALLET_WRONG_ENC_STATE)
    );
    assert_eq!(
        err(&rpc, "walletpassphrase", json!(["x", 10])).0,
        i64::from(RPC_WALLET_WRONG_ENC_STATE)
    );
    assert_eq!(
        err(&rpc, "encryptwallet", json!([""])).0,
        i64::from(RPC_INVALID_PARAMETER)
    );

    ok(&rpc, "encryptwallet", json!(["pw"]));
    assert_eq!(
        err(&rpc, "encryptwallet", json!(["pw"])).0,
        i64::from(RPC_WALLET_WRONG_ENC_STATE)
    );
    assert_eq!(
        err(&rpc, "walletpassphrase", json!(["nope", 10])).0,
        i64::from(RPC_WALLET_ERROR)
    );
    assert_eq!(
        err(&rpc, "walletpassphrase", json!(["pw", -1])).0,
        i64::from(RPC_INVALID_PARAMETER)
    );
    assert_eq!(
        err(&rpc, "keypoolrefill", json!([5])).0,
        i64::from(RPC_WALLET_ERROR)
    );

    ok(&rpc, "walletpassphrasechange", json!(["pw", "pw2"]));
    ok(&rpc, "walletpassphrase", json!(["pw2", 0]));
    assert_eq!(ok(&rpc, "getwalletinfo", json!([]))["unlocked_until"], json!(0));
    ok(&rpc, "keypoolrefill", json!([]));
    ok(&rpc, "walletlock", json!([]));
    ok(&rpc, "walletlock", json!([]));
}

#[test]
fn address_queries() {
    let rpc = dispatcher(2);
    let address = ok(&rpc, "getnewaddress", json!([]));
    let address = address.as_str().expect("address");

    let info = ok(&rpc, "getaddressinfo", json!([address]));
    assert_eq!(info["ismine"], json!(true));
    assert_eq!(info["ischange"], json!(false));
    assert_eq!(info["hdkeypath"], json!("m/0'/0'/0'"));
    assert!(info["pubkey"].is_string());

    let wif = ok(&rpc, "dumpprivkey", json!([address]));
    assert!(wif.as_str().is_some_and(|wif| !wif.is_empty()));

    ok(&rpc, "encryptwallet", json!(["pw"]));
    assert_eq!(
        err(&rpc, "dumpprivkey", json!([address])).0,
        i64::from(RPC_WALLET_ERROR)
    );
    ok(&rpc, "walletpassphrase", json!(["pw", 30]));
    // Keys issued before encryption stay dumpable.
    assert_eq!(ok(&rpc, "dumpprivkey", json!([address])), wif);

    assert_eq!(
        err(&rpc, "getaddressinfo", json!(["not-an-address"])).0,
        i64::from(RPC_INVALID_ADDRESS_OR_KEY)
    );
}

#[test]
fn malformed_requests() {
    let rpc = dispatcher(1);
    let response: Value = serde_json::from_str(&rpc.handle_line("{not json")).expect("json");
    assert_eq!(response["error"]["code"], json!(RPC_PARSE_ERROR));
    assert!(response["id"].is_null());

    assert_eq!(
        err(&rpc, "sendtoaddress", json!([])).0,
        i64::from(RPC_METHOD_NOT_FOUND)
    );
    assert_eq!(
        err(&rpc, "getaddressinfo", json!([])).0,
        i64::from(RPC_INVALID_PARAMETER)
    );
    assert_eq!(
        err(&rpc, "getauxblock", json!(["only-hash"])).0,
        i64::from(RPC_INVALID_PARAMETER)
    );
    assert_eq!(
        err(&rpc, "keypoolrefill", json!([-3])).0,
        i64::from(RPC_INVALID_PARAMETER)
    );
}

#[test]
fn dispatcher_reopens_fjall_wallet() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = Config {
        backend: Backend::Fjall,
        data_dir: dir.path().to_path_buf(),
        conf_path: dir.path().join("keypoold.conf"),
        network: Network::Regtest,
        keypool_size: 3,
        log_level: logging::Level::Info,
        log_format: logging::Format::Text,
        log_timestamps: true,
    };
    let seed_id = {
        let rpc = keypoold::open_dispatcher(&config).expect("open");
        ok(&rpc, "getnewaddress", json!([]));
        ok(&rpc, "getwalletinfo", json!([]))["hdseedid"].clone()
    };
    let rpc = keypoold::open_dispatcher(&config).expect("reopen");
    let info = ok(&rpc, "getwalletinfo", json!([]));
    assert_eq!(info["hdseedid"], seed_id);
    assert_eq!(info["keypoolsize"], json!(3));
}
