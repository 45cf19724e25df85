//! Facilitator server configuration.
//!
//! Loaded once at start-up from a TOML file. String values may reference
//! environment variables as `$VAR` or `${VAR}`; unresolved references are
//! left untouched.
//!
//! # Example Configuration
//!
//! ```toml
//! host = "0.0.0.0"
//! port = 4021
//! master_secret = "$MASTER_SECRET"
//! default_network = "avalanche-fuji"
//! deactivation_threshold = "0"
//!
//! [networks.base-sepolia]
//! rpc_url = "https://sepolia.base.org"
//! rate_limit = 25
//! confirmation_timeout_secs = 20
//! ```
//!
//! # Environment Variables
//!
//! - `CONFIG`: path to the configuration file (default: `config.toml`)
//! - `HOST`, `PORT`: override the bind address
//! - any variable referenced by `$VAR` in the file

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::Deserialize;
use settle402::amount::TokenAmount;
use settle402::authorization::{CodecConfig, DEFAULT_CLOCK_SKEW_SECS, DEFAULT_WINDOW_SECS};
use settle402::chain::RpcEndpoint;
use settle402::networks::{
    DEFAULT_NETWORK_ID, NetworkDescriptor, NetworkRegistry, RegistryError, known_descriptors,
};
use url::Url;

use crate::crypto::{AesGcmCipher, DEFAULT_KDF_ITERATIONS};
use crate::directory::{DirectoryConfig, MasterSecret};
use crate::engine::EngineConfig;
use crate::monitor::FundingPolicy;

static ENV_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)")
        .expect("env reference pattern is valid")
});

/// Errors from loading or applying configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file exists but could not be read.
    #[error("cannot read {path}: {source}")]
    Io {
        /// Config path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The TOML did not parse.
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
    /// `master_secret` is empty or still an unresolved `$VAR`.
    #[error("master_secret is not set")]
    MissingMasterSecret,
    /// A `[networks.<id>]` table or `default_network` names an unknown network.
    #[error("unknown network `{0}` in configuration")]
    UnknownNetwork(String),
    /// The resulting network table is inconsistent.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Top-level facilitator configuration.
#[derive(Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FacilitatorConfig {
    /// Bind address (default: `0.0.0.0`).
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port (default: `4021`).
    #[serde(default = "default_port")]
    pub port: u16,

    /// Secret protecting the system copy of every facilitator key.
    #[serde(default)]
    pub master_secret: String,

    /// Network assigned to records created before network binding existed.
    #[serde(default = "default_network")]
    pub default_network: String,

    /// Wallet balance (wei) at or below which a facilitator needs funding.
    #[serde(default)]
    pub deactivation_threshold: TokenAmount,

    /// Lifetime of new authorizations in seconds.
    #[serde(default = "default_window")]
    pub authorization_window_secs: u64,

    /// Seconds `validAfter` is backdated to tolerate clock skew.
    #[serde(default = "default_skew")]
    pub clock_skew_secs: u64,

    /// Whether requests may name a token contract other than the network's.
    #[serde(default = "default_true")]
    pub allow_token_override: bool,

    /// PBKDF2 rounds for key encryption.
    #[serde(default = "default_kdf_iterations")]
    pub kdf_iterations: u32,

    /// Per-network overrides keyed by network id.
    #[serde(default)]
    pub networks: BTreeMap<String, NetworkConfig>,
}

impl std::fmt::Debug for FacilitatorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FacilitatorConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("default_network", &self.default_network)
            .field("deactivation_threshold", &self.deactivation_threshold)
            .field("allow_token_override", &self.allow_token_override)
            .field("networks", &self.networks)
            .finish_non_exhaustive()
    }
}

/// Overrides for one network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkConfig {
    /// HTTP RPC endpoint.
    pub rpc_url: Option<Url>,
    /// Requests per second against `rpc_url`.
    pub rate_limit: Option<u32>,
    /// Receipt wait bound in seconds.
    pub confirmation_timeout_secs: Option<u64>,
    /// Gas balance (wei) suggested to owners.
    pub recommended_balance: Option<TokenAmount>,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

const fn default_port() -> u16 {
    4021
}

fn default_network() -> String {
    DEFAULT_NETWORK_ID.to_owned()
}

const fn default_window() -> u64 {
    DEFAULT_WINDOW_SECS
}

const fn default_skew() -> u64 {
    DEFAULT_CLOCK_SKEW_SECS
}

const fn default_true() -> bool {
    true
}

const fn default_kdf_iterations() -> u32 {
    DEFAULT_KDF_ITERATIONS
}

impl FacilitatorConfig {
    /// Loads `path`, expanding references from the process environment and
    /// applying `HOST`/`PORT` overrides. A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = if path.exists() {
            std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.to_owned(),
                source,
            })?
        } else {
            tracing::warn!(path = %path.display(), "Config file not found; using defaults");
            String::new()
        };
        let mut config = Self::parse(&content, |name| std::env::var(name).ok())?;

        if let Some(host) = std::env::var("HOST").ok().and_then(|h| h.parse().ok()) {
            config.host = host;
        }
        if let Some(port) = std::env::var("PORT").ok().and_then(|p| p.parse().ok()) {
            config.port = port;
        }
        Ok(config)
    }

    /// Parses TOML after expanding `$VAR` references through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] on invalid TOML.
    pub fn parse(
        content: &str,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let expanded = expand_vars(content, lookup);
        Ok(toml::from_str(&expanded)?)
    }

    /// Returns the master secret, refusing an empty value or a `$VAR` whose
    /// variable was not set. Other values containing `$` are taken literally.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingMasterSecret`].
    pub fn master_secret(&self) -> Result<MasterSecret, ConfigError> {
        let secret = self.master_secret.trim();
        if secret.is_empty() || is_unexpanded_reference(secret) {
            return Err(ConfigError::MissingMasterSecret);
        }
        Ok(MasterSecret::new(secret.to_owned()))
    }

    /// Builds the network table: the built-in networks with overrides applied.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownNetwork`] for overrides or a default
    /// network outside the table, or [`ConfigError::Registry`] if the result
    /// is inconsistent.
    pub fn registry(&self) -> Result<NetworkRegistry, ConfigError> {
        let mut descriptors = known_descriptors()?;
        for id in self.networks.keys() {
            if !descriptors.iter().any(|d| &d.network_id == id) {
                return Err(ConfigError::UnknownNetwork(id.clone()));
            }
        }
        for descriptor in &mut descriptors {
            if let Some(overrides) = self.networks.get(&descriptor.network_id) {
                overrides.apply(descriptor);
            }
        }
        let registry = NetworkRegistry::new(descriptors)?;
        if !registry.is_supported(&self.default_network) {
            return Err(ConfigError::UnknownNetwork(self.default_network.clone()));
        }
        Ok(registry)
    }

    /// RPC endpoint for `network`, honouring a configured rate limit.
    #[must_use]
    pub fn endpoint(&self, network: &NetworkDescriptor) -> RpcEndpoint {
        RpcEndpoint {
            url: network.rpc_endpoint.clone(),
            rate_limit: self
                .networks
                .get(&network.network_id)
                .and_then(|n| n.rate_limit),
        }
    }

    /// Authorization timing.
    #[must_use]
    pub const fn codec_config(&self) -> CodecConfig {
        CodecConfig {
            window_secs: self.authorization_window_secs,
            clock_skew_secs: self.clock_skew_secs,
        }
    }

    /// Directory settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingMasterSecret`].
    pub fn directory_config(&self) -> Result<DirectoryConfig, ConfigError> {
        Ok(DirectoryConfig {
            default_network: self.default_network.clone(),
            master_secret: self.master_secret()?,
        })
    }

    /// Funding thresholds.
    #[must_use]
    pub const fn funding_policy(&self) -> FundingPolicy {
        FundingPolicy {
            deactivation_threshold: self.deactivation_threshold.inner(),
        }
    }

    /// Settlement settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingMasterSecret`].
    pub fn engine_config(&self) -> Result<EngineConfig, ConfigError> {
        Ok(EngineConfig {
            master_secret: self.master_secret()?,
            allow_token_override: self.allow_token_override,
        })
    }

    /// Key cipher.
    #[must_use]
    pub const fn cipher(&self) -> AesGcmCipher {
        AesGcmCipher::new(self.kdf_iterations)
    }
}

impl NetworkConfig {
    fn apply(&self, descriptor: &mut NetworkDescriptor) {
        if let Some(url) = &self.rpc_url {
            descriptor.rpc_endpoint = url.clone();
        }
        if let Some(timeout) = self.confirmation_timeout_secs {
            descriptor.confirmation_timeout_secs = timeout;
        }
        if let Some(balance) = self.recommended_balance {
            descriptor.recommended_balance = balance;
        }
    }
}

/// Replaces `$VAR` and `${VAR}` with `lookup(VAR)`, leaving unknown names as-is.
fn expand_vars(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    ENV_REFERENCE
        .replace_all(input, |caps: &Captures<'_>| {
            let name = caps.get(1).or_else(|| caps.get(2)).map_or("", |m| m.as_str());
            lookup(name).unwrap_or_else(|| caps[0].to_owned())
        })
        .into_owned()
}

/// Whether `value` is exactly one `$VAR` / `${VAR}` left behind by [`expand_vars`].
fn is_unexpanded_reference(value: &str) -> bool {
    ENV_REFERENCE
        .find(value)
        .is_some_and(|m| m.start() == 0 && m.end() == value.len())
}
