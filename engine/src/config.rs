use crate::types::MarketParams;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;

pub const FUNDING_FACTOR: Decimal = dec!(0.0003);
pub const MAX_FUNDING_RATE: Decimal = dec!(0.0075);
pub const LIQUIDATION_FEE_PCT: Decimal = dec!(0.005);
pub const INSURANCE_FUND_FEE_PCT: Decimal = dec!(0.01);
pub const ORACLE_CACHE_TTL_SECONDS: u64 = 30;
pub const ORACLE_TIMEOUT_SECONDS: u64 = 5;
pub const CHALLENGE_TTL_SECONDS: u64 = 300;

/// Runtime configuration, read from environment variables with the same
/// defaults the service has always shipped with.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    pub cors_origins: Vec<String>,
    /// Bank signing key (64-hex). A fresh key is generated when unset.
    pub bank_private_key_hex: Option<String>,
    pub nostr_relays: Vec<String>,
    pub bank_db_path: String,
    pub futures_db_path: String,
    pub oracle_url: String,
    pub min_deposit_msats: i64,
    pub max_deposit_msats: i64,
    pub max_leverage: u32,
    pub initial_margin_pct: Decimal,
    pub maintenance_margin_pct: Decimal,
    pub maker_fee_pct: Decimal,
    pub taker_fee_pct: Decimal,
    pub funding_interval_hours: u64,
    pub liq_scan_interval_seconds: u64,
    pub oracle_publish_interval_seconds: u64,
    pub event_queue_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".into(),
            cors_origins: vec![
                "http://localhost:5173".into(),
                "http://localhost:3000".into(),
            ],
            bank_private_key_hex: None,
            nostr_relays: vec!["wss://relay.damus.io".into(), "wss://nos.lol".into()],
            bank_db_path: "data/ledger.db".into(),
            futures_db_path: "data/futures.db".into(),
            oracle_url: "https://api.kraken.com/0/public/Ticker?pair=XBTUSD".into(),
            min_deposit_msats: 1_000,
            max_deposit_msats: 100_000_000,
            max_leverage: 10,
            initial_margin_pct: dec!(0.10),
            maintenance_margin_pct: dec!(0.05),
            maker_fee_pct: dec!(0.0002),
            taker_fee_pct: dec!(0.0005),
            funding_interval_hours: 8,
            liq_scan_interval_seconds: 60,
            oracle_publish_interval_seconds: 60,
            event_queue_capacity: 1024,
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_list(key: &str, default: Vec<String>) -> Vec<String> {
    match std::env::var(key) {
        Ok(v) => v
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Err(_) => default,
    }
}

impl Config {
    pub fn from_env() -> Self {
        let d = Config::default();
        Self {
            listen_addr: env_or("LISTEN_ADDR", d.listen_addr),
            cors_origins: env_list("CORS_ORIGINS", d.cors_origins),
            bank_private_key_hex: std::env::var("BANK_NOSTR_PRIVATE_KEY")
                .ok()
                .filter(|s| !s.is_empty()),
            nostr_relays: env_list("NOSTR_RELAYS", d.nostr_relays),
            bank_db_path: env_or("LEDGER_DB_PATH", d.bank_db_path),
            futures_db_path: env_or("FUTURES_DB_PATH", d.futures_db_path),
            oracle_url: env_or("ORACLE_URL", d.oracle_url),
            min_deposit_msats: env_or("MIN_DEPOSIT_MSATS", d.min_deposit_msats),
            max_deposit_msats: env_or("MAX_DEPOSIT_MSATS", d.max_deposit_msats),
            max_leverage: env_or("MAX_LEVERAGE", d.max_leverage),
            initial_margin_pct: env_or("INITIAL_MARGIN_PCT", d.initial_margin_pct),
            maintenance_margin_pct: env_or("MAINTENANCE_MARGIN_PCT", d.maintenance_margin_pct),
            maker_fee_pct: env_or("MAKER_FEE_PCT", d.maker_fee_pct),
            taker_fee_pct: env_or("TAKER_FEE_PCT", d.taker_fee_pct),
            funding_interval_hours: env_or("FUNDING_INTERVAL_HOURS", d.funding_interval_hours),
            liq_scan_interval_seconds: env_or(
                "LIQ_SCAN_INTERVAL_SECONDS",
                d.liq_scan_interval_seconds,
            ),
            oracle_publish_interval_seconds: env_or(
                "ORACLE_PUBLISH_INTERVAL_SECONDS",
                d.oracle_publish_interval_seconds,
            ),
            event_queue_capacity: env_or("EVENT_QUEUE_CAPACITY", d.event_queue_capacity),
        }
    }

    pub fn funding_interval_seconds(&self) -> u64 {
        self.funding_interval_hours * 3600
    }

    /// Supported markets. BTC-USD-PERP only for now.
    pub fn markets(&self) -> HashMap<String, MarketParams> {
        let btc = MarketParams {
            symbol: "BTC-USD-PERP".into(),
            base: "BTC".into(),
            quote: "USD".into(),
            max_leverage: self.max_leverage,
            initial_margin_pct: self.initial_margin_pct,
            maintenance_margin_pct: self.maintenance_margin_pct,
            maker_fee_pct: self.maker_fee_pct,
            taker_fee_pct: self.taker_fee_pct,
        };
        HashMap::from([(btc.symbol.clone(), btc)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let c = Config::default();
        assert_eq!(c.funding_interval_seconds(), 8 * 3600);
        let markets = c.markets();
        let m = markets.get("BTC-USD-PERP").unwrap();
        assert_eq!(m.max_leverage, 10);
        assert_eq!(m.maintenance_margin_pct, dec!(0.05));
    }
}
