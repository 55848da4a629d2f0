//! `keypoold`: a local wallet shell that serves key pool, encryption and
//! merge-mining RPCs over line-delimited JSON on stdin/stdout.

pub mod auxpow;
pub mod config;
pub mod rpc;

use std::fs;
use std::sync::Arc;
use std::time::Instant;

use keypoold_log::{self as logging, log_info, log_warn};
use keypoold_storage::fjall::FjallStore;
use keypoold_storage::memory::MemoryStore;
use keypoold_storage::KeyValueStore;
use keypoold_wallet::{Wallet, WalletConfig, WalletHandle};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::auxpow::{AuxpowMiner, LocalChain};
use crate::config::{usage, Backend, CliAction, Config};
use crate::rpc::RpcDispatcher;

pub const WALLET_DIR_NAME: &str = "wallet";

pub async fn run_entry() -> Result<(), String> {
    match config::parse_args()? {
        CliAction::PrintHelp => {
            println!("{}", usage());
            Ok(())
        }
        CliAction::PrintVersion => {
            println!("keypoold {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        CliAction::Run(config) => run_with_config(config).await,
    }
}

/// Opens the wallet store named by `config` and wires the dispatcher.
pub fn open_dispatcher(config: &Config) -> Result<RpcDispatcher, String> {
    let store: Arc<dyn KeyValueStore> = match config.backend {
        Backend::Memory => Arc::new(MemoryStore::new()),
        Backend::Fjall => {
            let path = config.data_dir.join(WALLET_DIR_NAME);
            fs::create_dir_all(&path)
                .map_err(|err| format!("failed to create {}: {err}", path.display()))?;
            let store = FjallStore::open(&path)
                .map_err(|err| format!("failed to open wallet store {}: {err}", path.display()))?;
            Arc::new(store)
        }
    };
    let wallet_config = WalletConfig {
        keypool_size: config.keypool_size,
        ..WalletConfig::default()
    };
    let wallet = Wallet::load_or_create(store, config.network, wallet_config)
        .map_err(|err| format!("failed to load wallet: {err}"))?;
    let handle = WalletHandle::new(wallet);
    let miner = AuxpowMiner::new(handle.clone(), Box::new(LocalChain::new()));
    Ok(RpcDispatcher::new(handle, miner))
}

async fn run_with_config(config: Config) -> Result<(), String> {
    logging::init(logging::LogConfig {
        level: config.log_level,
        format: config.log_format,
        timestamps: config.log_timestamps,
    });

    let start_time = Instant::now();
    let dispatcher = Arc::new(open_dispatcher(&config)?);
    let info = dispatcher.wallet().wallet_info();
    log_info!(
        "Wallet ready on {} ({:?} backend, log level {}, seed {}, {} / {} keys, encrypted: {}) in {}ms",
        config.network.as_str(),
        config.backend,
        logging::current_level().as_str(),
        info.hdseedid,
        info.keypoolsize,
        info.keypoolsize_hd_internal,
        info.encrypted,
        start_time.elapsed().as_millis()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.map_err(|err| format!("failed to read stdin: {err}"))? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                // Passphrase KDF work blocks; keep it off the reactor.
                let worker = Arc::clone(&dispatcher);
                let response = tokio::task::spawn_blocking(move || worker.handle_line(&line))
                    .await
                    .map_err(|err| format!("rpc worker failed: {err}"))?;
                stdout
                    .write_all(response.as_bytes())
                    .await
                    .map_err(|err| format!("failed to write stdout: {err}"))?;
                stdout
                    .write_all(b"\n")
                    .await
                    .map_err(|err| format!("failed to write stdout: {err}"))?;
                stdout
                    .flush()
                    .await
                    .map_err(|err| format!("failed to write stdout: {err}"))?;
            }
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    log_warn!("Failed to listen for shutdown signal: {err}");
                }
                log_info!("Shutdown requested");
                break;
            }
        }
    }

    dispatcher.shutdown();
    Ok(())
}
