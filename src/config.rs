//! Configuration for the paygate server.
//!
//! Non-secret values resolve through `clap`'s CLI/env overlay (`--host`, `--port`,
//! `--database-url`, ...); provider HMAC secrets are read directly from the
//! environment only, never accepted as CLI arguments, to keep them out of process
//! listings and shell history. Validation happens once at startup: a missing
//! secret or unparsable `DATABASE_URL` aborts the process before it binds a port.

use clap::Parser;
use std::net::IpAddr;

use crate::provider::{ProviderConfigError, ProviderRegistry};

/// CLI arguments for the paygate server. Every field also resolves from the
/// matching environment variable via `clap`'s `env` feature.
#[derive(Parser, Debug)]
#[command(name = "paygate")]
#[command(about = "Payments gateway and wallet ledger HTTP server")]
struct CliArgs {
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: IpAddr,

    #[arg(long, env = "PORT", default_value_t = 8080)]
    port: u16,

    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    #[arg(long, env = "PAYMENTS_MAX_RETRIES", default_value_t = 5)]
    payments_max_retries: u32,

    #[arg(long, env = "PAYMENTS_RETRY_BASE_DELAY_MS", default_value_t = 1_000)]
    payments_retry_base_delay_ms: u64,

    #[arg(long, env = "PAYMENTS_RETRY_MAX_DELAY_MS", default_value_t = 60_000)]
    payments_retry_max_delay_ms: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Cli(#[from] clap::Error),
    #[error("invalid DATABASE_URL: {0}")]
    InvalidDatabaseUrl(String),
    #[error(transparent)]
    Provider(#[from] ProviderConfigError),
}

/// Retry queue tuning. See [`crate::retry_queue::RetryQueue`].
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

/// Fully resolved, immutable server configuration. Built once in the composition
/// root and shared behind an `Arc`, never reintroduced as process-wide mutable
/// state.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    pub database_url: String,
    pub retry: RetryConfig,
}

impl Config {
    /// Parses CLI/env overlay and loads the provider registry from the
    /// environment. Fails fast on any fatal-config condition (§7).
    pub fn load() -> Result<(Self, ProviderRegistry), ConfigError> {
        let cli = CliArgs::try_parse()?;

        if cli.database_url.trim().is_empty() {
            return Err(ConfigError::InvalidDatabaseUrl(
                "DATABASE_URL must not be empty".to_string(),
            ));
        }

        let providers = ProviderRegistry::from_env()?;

        let config = Config {
            host: cli.host,
            port: cli.port,
            database_url: cli.database_url,
            retry: RetryConfig {
                max_retries: cli.payments_max_retries,
                base_delay_ms: cli.payments_retry_base_delay_ms,
                max_delay_ms: cli.payments_retry_max_delay_ms,
            },
        };

        Ok((config, providers))
    }
}
