// config.rs
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres connection string. Without it the service runs on the in-memory store.
    pub database_url: Option<String>,
    pub jwt_secret: String,
    pub jwt_maxage: i64,
    pub port: u16,
    pub max_db_connections: u32,
    /// Share of the budget captured as downpayment, in basis points.
    pub downpayment_bps: i64,
    pub settlement_interval_secs: u64,
    pub payment_gateway_url: Option<String>,
    pub payment_gateway_secret: String,
    pub payment_gateway_timeout_secs: u64,
}

impl Config {
    pub fn init() -> Config {
        let jwt_secret = std::env::var("JWT_SECRET_KEY").expect("JWT_SECRET_KEY must be set");

        Config {
            database_url: optional_var("DATABASE_URL"),
            jwt_secret,
            jwt_maxage: parsed_var("JWT_MAXAGE", 60),
            port: parsed_var("PORT", 8000),
            max_db_connections: parsed_var("DATABASE_MAX_CONNECTIONS", 20),
            downpayment_bps: parsed_var("DOWNPAYMENT_RATIO_BPS", 5_000),
            settlement_interval_secs: parsed_var("SETTLEMENT_INTERVAL_SECS", 30),
            payment_gateway_url: optional_var("PAYMENT_GATEWAY_URL"),
            payment_gateway_secret: std::env::var("PAYMENT_GATEWAY_SECRET").unwrap_or_default(),
            payment_gateway_timeout_secs: parsed_var("PAYMENT_GATEWAY_TIMEOUT_SECS", 10),
        }
    }

    /// Configuration for tests and local tooling: in-memory store, ledger-only gateway.
    pub fn for_memory(jwt_secret: &str) -> Config {
        Config {
            database_url: None,
            jwt_secret: jwt_secret.to_string(),
            jwt_maxage: 60,
            port: 0,
            max_db_connections: 1,
            downpayment_bps: 5_000,
            settlement_interval_secs: 30,
            payment_gateway_url: None,
            payment_gateway_secret: String::new(),
            payment_gateway_timeout_secs: 10,
        }
    }
}

pub(crate) fn optional_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Reads and parses `key`, falling back to `default` when unset. A value that
/// does not parse is a boot error.
pub(crate) fn parsed_var<T>(key: &str, default: T) -> T
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional_var(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .unwrap_or_else(|e| panic!("{} has an invalid value {:?}: {}", key, raw, e)),
        None => default,
    }
}
