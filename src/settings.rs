use config::{Config, ConfigError, File};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Backend {
    pub url: String,
    pub blob_url: String,
    pub metadata_location: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletBridge {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chain {
    pub id: u64,
    pub confirm_poll_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Contracts {
    pub usdc: String,
    pub daily_horoscope: String,
    pub zodiac: String,
}

/// Unit costs in cents of a dollar; scaled to token units at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct Costs {
    pub daily_horoscope_cents: u64,
    pub zodiac_piece_cents: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub backend: Backend,
    pub wallet: WalletBridge,
    pub chain: Chain,
    pub contracts: Contracts,
    pub costs: Costs,
}

impl Settings {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .build()?;

        config.try_deserialize()
    }
}
