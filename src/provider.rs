//! Per-provider configuration: HMAC secret, redirect base URL, webhook source-IP allowlist.
//!
//! Loaded once at startup from environment variables and held immutably for the
//! lifetime of the process; lookups are pure, no I/O.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use url::Url;

/// A third-party payment provider modelled by this gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Provider {
    JazzCash,
    Easypaisa,
    SadaPay,
}

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::JazzCash, Provider::Easypaisa, Provider::SadaPay];

    fn env_prefix(self) -> &'static str {
        match self {
            Provider::JazzCash => "JAZZCASH",
            Provider::Easypaisa => "EASYPAISA",
            Provider::SadaPay => "SADAPAY",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Provider::JazzCash => "JAZZCASH",
            Provider::Easypaisa => "EASYPAISA",
            Provider::SadaPay => "SADAPAY",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderConfigError {
    #[error("missing {0}_HMAC_SECRET for provider {0}")]
    MissingSecret(&'static str),
    #[error("missing {0}_BASE_URL for provider {0}")]
    MissingBaseUrl(&'static str),
    #[error("invalid {0}_BASE_URL: {1}")]
    InvalidBaseUrl(&'static str, url::ParseError),
}

/// Configuration held for a single provider.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub hmac_secret: Vec<u8>,
    pub redirect_base_url: Url,
    pub ip_allowlist: Vec<String>,
}

impl ProviderConfig {
    /// Reads `{PREFIX}_HMAC_SECRET`, `{PREFIX}_BASE_URL`, `{PREFIX}_WEBHOOK_IP_ALLOWLIST`
    /// from the environment for a single provider.
    ///
    /// EASYPAISA additionally accepts a mixed-case spelling of each key for backwards
    /// compatibility; when both are set, the all-caps name wins and a deprecation
    /// warning is logged for the mixed-case one.
    fn from_env(provider: Provider) -> Result<Self, ProviderConfigError> {
        let prefix = provider.env_prefix();

        let secret = Self::read_env_with_legacy_alias(provider, "HMAC_SECRET")
            .ok_or(ProviderConfigError::MissingSecret(prefix))?;
        let base_url_raw = Self::read_env_with_legacy_alias(provider, "BASE_URL")
            .ok_or(ProviderConfigError::MissingBaseUrl(prefix))?;
        let redirect_base_url = Url::parse(&base_url_raw)
            .map_err(|e| ProviderConfigError::InvalidBaseUrl(prefix, e))?;
        let ip_allowlist = Self::read_env_with_legacy_alias(provider, "WEBHOOK_IP_ALLOWLIST")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(ProviderConfig {
            hmac_secret: secret.into_bytes(),
            redirect_base_url,
            ip_allowlist,
        })
    }

    /// EASYPAISA's keys historically shipped in a mixed-case spelling
    /// (`Easypaisa_HMAC_SECRET`) alongside the all-caps one. Both are honored; the
    /// all-caps name takes precedence when both are present.
    fn read_env_with_legacy_alias(provider: Provider, suffix: &str) -> Option<String> {
        let canonical_key = format!("{}_{suffix}", provider.env_prefix());
        if let Ok(value) = std::env::var(&canonical_key) {
            return Some(value);
        }
        if provider == Provider::Easypaisa {
            let legacy_key = format!("Easypaisa_{suffix}");
            if let Ok(value) = std::env::var(&legacy_key) {
                tracing::warn!(
                    key = legacy_key,
                    "using deprecated mixed-case EASYPAISA config key; set {canonical_key} instead"
                );
                return Some(value);
            }
        }
        None
    }
}

/// Immutable, startup-loaded lookup table of provider configuration.
#[derive(Debug, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<Provider, ProviderConfig>,
}

impl ProviderRegistry {
    /// Loads configuration for every known provider from the environment.
    /// Fails fast: a missing secret or malformed allowlist aborts startup.
    pub fn from_env() -> Result<Self, ProviderConfigError> {
        let mut providers = HashMap::new();
        for provider in Provider::ALL {
            providers.insert(provider, ProviderConfig::from_env(provider)?);
        }
        Ok(ProviderRegistry { providers })
    }

    pub fn get(&self, provider: Provider) -> Option<&ProviderConfig> {
        self.providers.get(&provider)
    }

    #[cfg(test)]
    pub fn for_test(providers: HashMap<Provider, ProviderConfig>) -> Self {
        ProviderRegistry { providers }
    }
}

/// An empty allowlist is the permissive default for local development; a non-empty
/// list requires an exact string match. No CIDR parsing is performed (see DESIGN.md).
pub fn is_ip_allowed(ip: &str, allowlist: &[String]) -> bool {
    allowlist.is_empty() || allowlist.iter().any(|allowed| allowed == ip)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_allowlist_is_permissive() {
        assert!(is_ip_allowed("1.2.3.4", &[]));
    }

    #[test]
    fn exact_match_required() {
        let allowlist = vec!["10.0.0.1".to_string()];
        assert!(is_ip_allowed("10.0.0.1", &allowlist));
        assert!(!is_ip_allowed("10.0.0.2", &allowlist));
    }

    #[test]
    fn display_matches_wire_form() {
        assert_eq!(Provider::JazzCash.to_string(), "JAZZCASH");
        assert_eq!(Provider::Easypaisa.to_string(), "EASYPAISA");
        assert_eq!(Provider::SadaPay.to_string(), "SADAPAY");
    }
}
