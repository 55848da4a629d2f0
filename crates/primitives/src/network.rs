#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "main" | "mainnet" => Some(Self::Mainnet),
            "test" | "testnet" => Some(Self::Testnet),
            "regtest" => Some(Self::Regtest),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mainnet => "main",
            Self::Testnet => "test",
            Self::Regtest => "regtest",
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            Self::Mainnet => 0,
            Self::Testnet => 1,
            Self::Regtest => 2,
        }
    }

    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Mainnet),
            1 => Some(Self::Testnet),
            2 => Some(Self::Regtest),
            _ => None,
        }
    }

    pub(crate) fn pubkey_address_prefix(self) -> u8 {
        match self {
            Self::Mainnet => 55,
            Self::Testnet | Self::Regtest => 65,
        }
    }

    pub(crate) fn secret_key_prefix(self) -> u8 {
        match self {
            Self::Mainnet => 120,
            Self::Testnet | Self::Regtest => 239,
        }
    }
}
