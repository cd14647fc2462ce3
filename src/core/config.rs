//! Configuration parsing and validation.
//!
//! Client configuration is loaded from TOML and may be adjusted with
//! [`ConfigOverrides`]. Each section maps onto one runtime component; the
//! `*_config()` accessors convert the serialized form (plain integers in
//! milliseconds) into the typed settings those components take.
//!
//! ```toml
//! target = "ip:///10.0.0.1:2379,10.0.0.2:2379"
//!
//! [retry]
//! max_retries = 4
//! base_delay_ms = 50
//!
//! [security.profiles.default]
//! tls = true
//! ca_file = "/etc/kv/ca.pem"
//!
//! [[endpoint_profiles]]
//! address = "10.0.0.2:2379"
//! profile = "default"
//! ```

use crate::cluster::{EndpointSpec, PoolConfig, Target};
use crate::lease::LeaseConfig;
use crate::net::grpc::GrpcConnectorConfig;
use crate::net::security::{SecurityConfig, DEFAULT_PROFILE};
use crate::net::tls::SecurityProfile;
use crate::policy::{Backoff, CircuitConfig, RetryPolicy};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Top-level client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Endpoint addresses (`host:port`). Mutually exclusive with `target`.
    #[serde(default)]
    pub endpoints: Vec<String>,

    /// Target string such as `ip:///a:2379,b:2379` or `https://kv.internal`.
    #[serde(default)]
    pub target: Option<String>,

    /// Per-endpoint security profile bindings.
    #[serde(default)]
    pub endpoint_profiles: Vec<EndpointProfileBinding>,

    /// Named security profiles and credential reload settings.
    #[serde(default)]
    pub security: SecuritySettings,

    /// Endpoint health accounting.
    #[serde(default)]
    pub pool: PoolSettings,

    /// Retry and backoff.
    #[serde(default)]
    pub retry: RetrySettings,

    /// Per-endpoint circuit breaker.
    #[serde(default)]
    pub circuit: CircuitSettings,

    /// Payload compression.
    #[serde(default)]
    pub compression: CompressionSettings,

    /// Lease keep-alive scheduling.
    #[serde(default)]
    pub lease: LeaseSettings,

    /// Watch streams.
    #[serde(default)]
    pub watch: WatchSettings,

    /// Logging.
    #[serde(default)]
    pub telemetry: TelemetrySettings,
}

/// Binds one endpoint address to a named security profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointProfileBinding {
    pub address: String,
    pub profile: String,
}

/// Security section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecuritySettings {
    /// Re-read PEM files when they change on disk.
    #[serde(default = "default_auto_reload")]
    pub auto_reload: bool,

    /// How often PEM files are checked, in seconds.
    #[serde(default = "default_check_interval_seconds")]
    pub check_interval_seconds: u64,

    /// Profiles by name. `default` applies to endpoints without a binding.
    #[serde(default)]
    pub profiles: HashMap<String, SecurityProfile>,
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            auto_reload: default_auto_reload(),
            check_interval_seconds: default_check_interval_seconds(),
            profiles: HashMap::new(),
        }
    }
}

/// Pool section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Consecutive unreachable outcomes before an endpoint is Dead.
    #[serde(default = "default_dead_threshold")]
    pub dead_threshold: u32,

    /// How long a Dead endpoint is skipped before it is retried, in milliseconds.
    #[serde(default = "default_dead_cooldown_ms")]
    pub dead_cooldown_ms: u64,

    /// Connection establishment timeout, in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            dead_threshold: default_dead_threshold(),
            dead_cooldown_ms: default_dead_cooldown_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

/// Retry section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Backoff growth factor.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Backoff cap, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Jitter fraction in `[0, 1]`.
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Overall call deadline when the caller gives none, in milliseconds.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,

    /// Leader redirects followed per call.
    #[serde(default = "default_redirect_cap")]
    pub redirect_cap: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
            call_timeout_ms: default_call_timeout_ms(),
            redirect_cap: default_redirect_cap(),
        }
    }
}

/// Circuit breaker section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Open-state duration, in milliseconds.
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

/// Compression section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionSettings {
    /// Codec preference, most preferred first. Empty disables compression.
    #[serde(default = "default_codecs")]
    pub codecs: Vec<String>,
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self {
            codecs: default_codecs(),
        }
    }
}

/// Lease section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseSettings {
    /// Fraction of the TTL left when a keep-alive is sent.
    #[serde(default = "default_keep_alive_fraction")]
    pub keep_alive_fraction: f64,

    /// Consecutive missed keep-alives before a lease is considered expired.
    #[serde(default = "default_missed_keep_alive_limit")]
    pub missed_keep_alive_limit: u32,
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            keep_alive_fraction: default_keep_alive_fraction(),
            missed_keep_alive_limit: default_missed_keep_alive_limit(),
        }
    }
}

/// Watch section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchSettings {
    /// Events buffered per subscription before the stream task waits.
    #[serde(default = "default_watch_buffer")]
    pub buffer_size: usize,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            buffer_size: default_watch_buffer(),
        }
    }
}

/// Telemetry section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySettings {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

// Default value functions

fn default_auto_reload() -> bool {
    true
}

fn default_check_interval_seconds() -> u64 {
    60
}

fn default_dead_threshold() -> u32 {
    3
}

fn default_dead_cooldown_ms() -> u64 {
    5_000
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_max_retries() -> u32 {
    4
}

fn default_base_delay_ms() -> u64 {
    50
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    1_000
}

fn default_jitter() -> f64 {
    0.2
}

fn default_call_timeout_ms() -> u64 {
    30_000
}

fn default_redirect_cap() -> u32 {
    1
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_ms() -> u64 {
    5_000
}

fn default_codecs() -> Vec<String> {
    vec!["snappy".to_string(), "gzip".to_string()]
}

fn default_keep_alive_fraction() -> f64 {
    0.5
}

fn default_missed_keep_alive_limit() -> u32 {
    2
}

fn default_watch_buffer() -> usize {
    256
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ClientConfig {
    /// Configuration for a static list of endpoints, everything else default.
    pub fn with_endpoints<I, S>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            endpoints: endpoints.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: ClientConfig =
            toml::from_str(&content).with_context(|| "failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: ClientConfig =
            toml::from_str(content).with_context(|| "failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides to the configuration.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(ref log_level) = overrides.log_level {
            self.telemetry.log_level = log_level.clone();
        }
        if let Some(ref endpoints) = overrides.endpoints {
            self.endpoints = endpoints.clone();
            self.target = None;
        }
        if let Some(max_retries) = overrides.max_retries {
            self.retry.max_retries = max_retries;
        }
        if let Some(call_timeout_ms) = overrides.call_timeout_ms {
            self.retry.call_timeout_ms = call_timeout_ms;
        }
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        self.validate_endpoints()?;
        self.validate_security()?;
        self.validate_retry()?;
        self.validate_pool()?;
        self.validate_lease()?;
        self.validate_telemetry()?;
        Ok(())
    }

    fn validate_endpoints(&self) -> Result<()> {
        if self.target.is_some() && !self.endpoints.is_empty() {
            anyhow::bail!("set either target or endpoints, not both");
        }
        let target = self.resolve_target()?;
        for binding in &self.endpoint_profiles {
            if binding.profile != DEFAULT_PROFILE
                && !self.security.profiles.contains_key(&binding.profile)
            {
                anyhow::bail!(
                    "endpoint_profiles: {} references unknown profile {}",
                    binding.address,
                    binding.profile
                );
            }
        }

        let default_is_tls = self
            .security
            .profiles
            .get(DEFAULT_PROFILE)
            .is_some_and(|p| p.tls);
        match target.tls {
            Some(true) if !default_is_tls => {
                anyhow::bail!("https target requires security.profiles.default with tls = true")
            }
            Some(false) if default_is_tls => {
                anyhow::bail!("http target conflicts with a TLS default profile")
            }
            _ => Ok(()),
        }
    }

    fn validate_security(&self) -> Result<()> {
        for (name, profile) in &self.security.profiles {
            profile
                .validate()
                .with_context(|| format!("security.profiles.{}", name))?;
        }
        if self.security.check_interval_seconds == 0 {
            anyhow::bail!("security.check_interval_seconds must be > 0");
        }
        Ok(())
    }

    fn validate_retry(&self) -> Result<()> {
        let retry = &self.retry;
        if retry.multiplier < 1.0 {
            anyhow::bail!("retry.multiplier must be >= 1.0, got: {}", retry.multiplier);
        }
        if !(0.0..=1.0).contains(&retry.jitter) {
            anyhow::bail!("retry.jitter must be in [0, 1], got: {}", retry.jitter);
        }
        if retry.base_delay_ms > retry.max_delay_ms {
            anyhow::bail!(
                "retry.base_delay_ms ({}) cannot exceed retry.max_delay_ms ({})",
                retry.base_delay_ms,
                retry.max_delay_ms
            );
        }
        if retry.call_timeout_ms == 0 {
            anyhow::bail!("retry.call_timeout_ms must be > 0");
        }
        Ok(())
    }

    fn validate_pool(&self) -> Result<()> {
        if self.pool.dead_threshold == 0 {
            anyhow::bail!("pool.dead_threshold must be > 0");
        }
        if self.circuit.failure_threshold == 0 {
            anyhow::bail!("circuit.failure_threshold must be > 0");
        }
        if self.pool.connect_timeout_ms == 0 {
            anyhow::bail!("pool.connect_timeout_ms must be > 0");
        }
        Ok(())
    }

    fn validate_lease(&self) -> Result<()> {
        let fraction = self.lease.keep_alive_fraction;
        if !(fraction > 0.0 && fraction < 1.0) {
            anyhow::bail!("lease.keep_alive_fraction must be in (0, 1), got: {}", fraction);
        }
        if self.lease.missed_keep_alive_limit == 0 {
            anyhow::bail!("lease.missed_keep_alive_limit must be > 0");
        }
        if self.watch.buffer_size == 0 {
            anyhow::bail!("watch.buffer_size must be > 0");
        }
        Ok(())
    }

    fn validate_telemetry(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.telemetry.log_level.as_str()) {
            anyhow::bail!(
                "telemetry.log_level must be one of {:?}, got: {}",
                valid_levels,
                self.telemetry.log_level
            );
        }
        Ok(())
    }

    /// The target the configuration describes.
    pub fn resolve_target(&self) -> Result<Target> {
        match &self.target {
            Some(target) => Ok(Target::parse(target)?),
            None if self.endpoints.is_empty() => {
                anyhow::bail!("no endpoints configured: set target or endpoints")
            }
            None => Ok(Target::parse(&self.endpoints.join(","))?),
        }
    }

    /// Endpoint addresses with their bound security profiles.
    pub fn endpoint_specs(&self) -> Result<Vec<EndpointSpec>> {
        let target = self.resolve_target()?;
        Ok(target
            .addresses
            .into_iter()
            .map(|address| {
                match self
                    .endpoint_profiles
                    .iter()
                    .find(|b| b.address == address)
                {
                    Some(binding) => EndpointSpec::with_profile(address, binding.profile.clone()),
                    None => EndpointSpec::new(address),
                }
            })
            .collect())
    }

    /// Default call deadline.
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.retry.call_timeout_ms)
    }

    /// Retry policy for unary calls.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: Some(self.retry.max_retries),
            backoff: Backoff {
                base: Duration::from_millis(self.retry.base_delay_ms),
                multiplier: self.retry.multiplier,
                cap: Duration::from_millis(self.retry.max_delay_ms),
                jitter: self.retry.jitter,
            },
            redirect_cap: self.retry.redirect_cap,
        }
    }

    /// Circuit breaker settings.
    pub fn circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.circuit.failure_threshold,
            cooldown: Duration::from_millis(self.circuit.cooldown_ms),
        }
    }

    /// Endpoint pool settings.
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            dead_threshold: self.pool.dead_threshold,
            dead_cooldown: Duration::from_millis(self.pool.dead_cooldown_ms),
            circuit: self.circuit_config(),
            default_profile: DEFAULT_PROFILE.to_string(),
        }
    }

    /// Credential reload settings.
    pub fn security_config(&self) -> SecurityConfig {
        SecurityConfig {
            auto_reload: self.security.auto_reload,
            check_interval: Duration::from_secs(self.security.check_interval_seconds),
        }
    }

    /// Settings for the default gRPC connector.
    pub fn connector_config(&self) -> GrpcConnectorConfig {
        GrpcConnectorConfig {
            connect_timeout: Duration::from_millis(self.pool.connect_timeout_ms),
            ..GrpcConnectorConfig::default()
        }
    }

    /// Lease keep-alive settings.
    pub fn lease_config(&self) -> LeaseConfig {
        LeaseConfig {
            keep_alive_fraction: self.lease.keep_alive_fraction,
            missed_limit: self.lease.missed_keep_alive_limit,
        }
    }
}

/// Override options that can be applied on top of a loaded configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Override log level.
    pub log_level: Option<String>,
    /// Replace the endpoint list (clears `target`).
    pub endpoints: Option<Vec<String>>,
    /// Override retry count.
    pub max_retries: Option<u32>,
    /// Override the default call deadline.
    pub call_timeout_ms: Option<u64>,
}
