//! Command line and `keypoold.conf` handling. Flags given on the command line
//! win over the config file, which wins over built-in defaults.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use keypoold_log as logging;
use keypoold_primitives::Network;
use keypoold_wallet::DEFAULT_KEYPOOL_SIZE;

pub const DEFAULT_DATA_DIR: &str = "./data";
pub const CONF_FILE_NAME: &str = "keypoold.conf";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Backend {
    Memory,
    Fjall,
}

impl Backend {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "memory" => Some(Self::Memory),
            "fjall" => Some(Self::Fjall),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub backend: Backend,
    pub data_dir: PathBuf,
    pub conf_path: PathBuf,
    pub network: Network,
    pub keypool_size: usize,
    pub log_level: logging::Level,
    pub log_format: logging::Format,
    pub log_timestamps: bool,
}

#[derive(Debug)]
pub enum CliAction {
    Run(Config),
    PrintHelp,
    PrintVersion,
}

pub fn parse_args() -> Result<CliAction, String> {
    parse_args_from(std::env::args().skip(1))
}

pub fn parse_args_from<I>(raw_args: I) -> Result<CliAction, String>
where
    I: IntoIterator<Item = String>,
{
    let mut backend = Backend::Fjall;
    let mut backend_set = false;
    let mut data_dir: Option<PathBuf> = None;
    let mut conf_path: Option<PathBuf> = None;
    let mut network = Network::Mainnet;
    let mut network_set = false;
    let mut keypool_size = DEFAULT_KEYPOOL_SIZE;
    let mut keypool_set = false;
    let mut log_level = logging::Level::Info;
    let mut log_level_set = false;
    let mut log_format = logging::Format::Text;
    let mut log_format_set = false;
    let mut log_timestamps = true;
    let mut log_timestamps_set = false;

    let mut args = raw_args.into_iter().peekable();
    if let Some(first) = args.peek().map(|value| value.as_str()) {
        match first {
            "help" => return Ok(CliAction::PrintHelp),
            "version" => return Ok(CliAction::PrintVersion),
            _ => {}
        }
    }

    while let Some(raw) = args.next() {
        // `-flag`, `--flag`, `--flag=value` and `--flag value` are all accepted.
        let (flag, mut inline) = match raw.split_once('=') {
            Some((flag, value)) if flag.starts_with('-') => {
                (flag.to_string(), Some(value.to_string()))
            }
            _ => (raw.clone(), None),
        };
        let flag = if flag.len() > 2 && flag.starts_with('-') && !flag.starts_with("--") {
            format!("-{flag}")
        } else {
            flag
        };
        let mut value_for = |name: &str| -> Result<String, String> {
            match inline.take() {
                Some(value) => Ok(value),
                None => args
                    .next()
                    .ok_or_else(|| format!("missing value for {name}\n{}", usage())),
            }
        };
        match flag.as_str() {
            "--help" | "-h" => return Ok(CliAction::PrintHelp),
            "--version" | "-V" => return Ok(CliAction::PrintVersion),
            "--backend" => {
                let value = value_for("--backend")?;
                backend = Backend::parse(&value)
                    .ok_or_else(|| format!("invalid backend '{value}'\n{}", usage()))?;
                backend_set = true;
            }
            "--data-dir" | "--datadir" => {
                data_dir = Some(PathBuf::from(value_for("--data-dir")?));
            }
            "--conf" => {
                conf_path = Some(PathBuf::from(value_for("--conf")?));
            }
            "--network" => {
                let value = value_for("--network")?;
                network = Network::parse(&value)
                    .ok_or_else(|| format!("invalid network '{value}'\n{}", usage()))?;
                network_set = true;
            }
            "--testnet" => {
                network = Network::Testnet;
                network_set = true;
            }
            "--regtest" => {
                network = Network::Regtest;
                network_set = true;
            }
            "--keypool" => {
                let value = value_for("--keypool")?;
                keypool_size = parse_keypool(&value)
                    .ok_or_else(|| format!("invalid keypool size '{value}'\n{}", usage()))?;
                keypool_set = true;
            }
            "--log-level" | "--loglevel" => {
                let value = value_for("--log-level")?;
                log_level = logging::Level::parse(&value)
                    .ok_or_else(|| format!("invalid log level '{value}'\n{}", usage()))?;
                log_level_set = true;
            }
            "--log-format" => {
                let value = value_for("--log-format")?;
                log_format = logging::Format::parse(&value)
                    .ok_or_else(|| format!("invalid log format '{value}'\n{}", usage()))?;
                log_format_set = true;
            }
            "--log-timestamps" => {
                log_timestamps = true;
                log_timestamps_set = true;
            }
            "--no-log-timestamps" => {
                log_timestamps = false;
                log_timestamps_set = true;
            }
            other => return Err(format!("unknown argument '{other}'\n{}", usage())),
        }
        if let Some(value) = inline {
            return Err(format!("{flag} does not take a value (got '{value}')\n{}", usage()));
        }
    }

    let data_dir = data_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
    let conf_file = conf_path.unwrap_or_else(|| data_dir.join(CONF_FILE_NAME));
    if let Some(conf) = load_conf(&conf_file)? {
        let last = |key: &str| conf.get(key).and_then(|values| values.last());

        if !network_set {
            if let Some(raw) = last("network") {
                network = Network::parse(raw).ok_or_else(|| {
                    format!("invalid network '{raw}' in {}", conf_file.display())
                })?;
            } else {
                for (key, candidate) in [("regtest", Network::Regtest), ("testnet", Network::Testnet)] {
                    let Some(raw) = last(key) else {
                        continue;
                    };
                    match parse_conf_bool(raw) {
                        Some(true) => {
                            network = candidate;
                            break;
                        }
                        Some(false) => {}
                        None => {
                            return Err(format!(
                                "invalid {key} value '{raw}' in {}",
                                conf_file.display()
                            ));
                        }
                    }
                }
            }
        }
        if !backend_set {
            if let Some(raw) = last("backend") {
                backend = Backend::parse(raw).ok_or_else(|| {
                    format!("invalid backend '{raw}' in {}", conf_file.display())
                })?;
            }
        }
        if !keypool_set {
            if let Some(raw) = last("keypool") {
                keypool_size = parse_keypool(raw).ok_or_else(|| {
                    format!("invalid keypool value '{raw}' in {}", conf_file.display())
                })?;
            }
        }
        if !log_level_set {
            if let Some(raw) = last("loglevel").or_else(|| last("log-level")) {
                log_level = logging::Level::parse(raw).ok_or_else(|| {
                    format!("invalid log level '{raw}' in {}", conf_file.display())
                })?;
            }
        }
        if !log_format_set {
            if let Some(raw) = last("logformat").or_else(|| last("log-format")) {
                log_format = logging::Format::parse(raw).ok_or_else(|| {
                    format!("invalid log format '{raw}' in {}", conf_file.display())
                })?;
            }
        }
        if !log_timestamps_set {
            if let Some(raw) = last("logtimestamps").or_else(|| last("log-timestamps")) {
                log_timestamps = parse_conf_bool(raw).ok_or_else(|| {
                    format!("invalid logtimestamps value '{raw}' in {}", conf_file.display())
                })?;
            }
        }
    }

    Ok(CliAction::Run(Config {
        backend,
        data_dir,
        conf_path: conf_file,
        network,
        keypool_size,
        log_level,
        log_format,
        log_timestamps,
    }))
}

/// Reads `key=value` lines; a bare `key` means `key=1`. Missing file is `None`.
pub fn load_conf(path: &Path) -> Result<Option<HashMap<String, Vec<String>>>, String> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(format!("failed to read {}: {err}", path.display())),
    };

    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    for raw_line in contents.lines() {
        let mut line = raw_line.trim();
        if let Some(idx) = line.find(['#', ';']) {
            line = &line[..idx];
        }
        line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = match line.split_once('=') {
            Some((key, value)) => (key.trim(), value.trim()),
            None => (line, "1"),
        };
        if key.is_empty() {
            continue;
        }
        out.entry(key.to_ascii_lowercase())
            .or_default()
            .push(value.to_string());
    }
    Ok(Some(out))
}

pub fn parse_conf_bool(value: &str) -> Option<bool> {
    let value = value.trim();
    if value.is_empty() {
        return Some(true);
    }
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

/// Zero is allowed: the pool then stays empty until an explicit refill.
fn parse_keypool(value: &str) -> Option<usize> {
    value.trim().parse::<usize>().ok()
}

pub fn usage() -> String {
    [
        "Usage:",
        "  keypoold [options]",
        "",
        "Reads one JSON-RPC request per line on stdin and writes one response per line on stdout.",
        "",
        "Commands:",
        "  help     Print this help and exit",
        "  version  Print version and exit",
        "",
        "Options:",
        "  --help, -h  Print this help and exit",
        "  --version, -V  Print version and exit",
        "  --backend  Wallet store backend (memory|fjall) (default: fjall)",
        "  --data-dir  Base data directory (default: ./data)",
        "  --conf  Config file path (default: <data-dir>/keypoold.conf)",
        "  --network  Network (mainnet|testnet|regtest) (default: mainnet)",
        "  --testnet  Alias for --network test",
        "  --regtest  Alias for --network regtest",
        "  --keypool  Target unused keys per chain; 0 disables automatic top-up (default: 100)",
        "  --log-level  Log verbosity (error|warn|info|debug|trace) (default: info)",
        "  --log-format  Log output format (text|json) (default: text)",
        "  --log-timestamps  Enable timestamps in text logs (default: on)",
        "  --no-log-timestamps  Disable timestamps in text logs",
    ]
    .join("\n")
}
