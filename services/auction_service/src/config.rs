//! Configuration management for the auction service.
//!
//! All runtime behaviour is tuned through a hierarchical, multi-source
//! configuration backed by the `config` crate.
//!
//! Priority (lowest → highest):
//! 1. Compile-time defaults (`impl Default`).
//! 2. An optional TOML/YAML/JSON file passed at start-up.
//! 3. Environment variables with a `GAVEL` prefix:
//!
//!        GAVEL__LISTENER__PORT=8080     # double underscore = path separator
//!
//! Prefer returning an error from [`GavelConfig::validate`] over silently
//! fixing values at runtime.

use std::{net::SocketAddr, path::Path, time::Duration};

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use gavel_store::HotConfig;

/// Top-level configuration structure.
///
/// Keep this sectioned — a new concern gets a dedicated sub-struct instead of
/// more optional fields at the top level.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GavelConfig {
    pub service: ServiceSection,
    pub listener: ListenerSection,
    pub hot: HotSection,
    pub durable: DurableSection,
    pub sync: SyncSection,
    pub fanout: FanoutSection,
    pub anti_snipe: AntiSnipeSection,
    pub lifecycle: LifecycleSection,
    pub delivery: DeliverySection,
}

impl Default for GavelConfig {
    fn default() -> Self {
        Self {
            service: ServiceSection::default(),
            listener: ListenerSection::default(),
            hot: HotSection::default(),
            durable: DurableSection::default(),
            sync: SyncSection::default(),
            fanout: FanoutSection::default(),
            anti_snipe: AntiSnipeSection::default(),
            lifecycle: LifecycleSection::default(),
            delivery: DeliverySection::default(),
        }
    }
}

impl GavelConfig {
    /// Load configuration from defaults, an optional file and `GAVEL__` env
    /// vars, then validate.
    pub fn load(explicit: Option<impl AsRef<Path>>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            // At least one default keeps the builder non-empty even when no
            // file or env var is present.
            .set_default("service.name", "gavel-auction")?;

        if let Some(path) = explicit {
            builder = builder.add_source(File::from(path.as_ref()).required(true));
        } else {
            for ext in ["toml", "yaml", "json"] {
                let file_name = format!("gavel.{ext}");
                if Path::new(&file_name).exists() {
                    builder = builder.add_source(File::with_name(&file_name).required(false));
                    break;
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("GAVEL")
                .separator("__")
                .try_parsing(true),
        );

        let cfg: GavelConfig = builder.build()?.try_deserialize()?;
        cfg.validate().map_err(ConfigError::Message)?;
        Ok(cfg)
    }

    /// Validate internal consistency and invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.sync.cadence.is_zero() {
            return Err("sync.cadence must be > 0".into());
        }
        if self.lifecycle.reconcile_interval.is_zero() {
            return Err("lifecycle.reconcile_interval must be > 0".into());
        }
        if self.anti_snipe.window.is_zero() || self.anti_snipe.extension.is_zero() {
            return Err("anti_snipe window and extension must be > 0".into());
        }
        if self.fanout.top_bids_limit == 0 {
            return Err("fanout.top_bids_limit must be > 0".into());
        }
        if self.durable.path.trim().is_empty() {
            return Err("durable.path must not be empty".into());
        }
        Ok(())
    }
}

/// Metadata & housekeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSection {
    /// Logical service name — appears in logs.
    pub name: String,
    /// Graceful shutdown timeout.
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            name: "gavel-auction".into(),
            shutdown_timeout: Duration::from_secs(15),
        }
    }
}

/// Subscription-channel listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerSection {
    pub host: String,
    pub port: u16,
}

impl ListenerSection {
    pub fn addr(&self) -> SocketAddr {
        format!("{}:{}", self.host, self.port)
            .parse()
            .expect("listener host/port should form a valid socket address")
    }
}

impl Default for ListenerSection {
    fn default() -> Self {
        Self { host: "0.0.0.0".into(), port: 8080 }
    }
}

/// Hot-store TTLs and sweep cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HotSection {
    #[serde(with = "humantime_serde")]
    pub bid_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub idempotency_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub top_cache_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub evictor_interval: Duration,
}

impl Default for HotSection {
    fn default() -> Self {
        let defaults = HotConfig::default();
        Self {
            bid_ttl: defaults.bid_ttl,
            idempotency_ttl: defaults.idempotency_ttl,
            cache_ttl: defaults.cache_ttl,
            top_cache_ttl: defaults.top_cache_ttl,
            evictor_interval: defaults.evictor_interval,
        }
    }
}

impl From<&HotSection> for HotConfig {
    fn from(section: &HotSection) -> Self {
        Self {
            bid_ttl: section.bid_ttl,
            idempotency_ttl: section.idempotency_ttl,
            cache_ttl: section.cache_ttl,
            top_cache_ttl: section.top_cache_ttl,
            evictor_interval: section.evictor_interval,
        }
    }
}

/// Durable (sled) store location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DurableSection {
    pub path: String,
}

impl Default for DurableSection {
    fn default() -> Self {
        Self { path: "./data/gavel".into() }
    }
}

/// Hot → durable mirror cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSection {
    #[serde(with = "humantime_serde")]
    pub cadence: Duration,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self { cadence: Duration::from_millis(500) }
    }
}

/// Real-time fan-out tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FanoutSection {
    /// Cadence of lightweight time updates.
    #[serde(with = "humantime_serde")]
    pub time_tick: Duration,
    /// Cadence of snapshot re-evaluation.
    #[serde(with = "humantime_serde")]
    pub snapshot_tick: Duration,
    /// Minimum interval between identical snapshots.
    #[serde(with = "humantime_serde")]
    pub dedup_interval: Duration,
    /// Server heartbeat on subscription channels.
    #[serde(with = "humantime_serde")]
    pub heartbeat: Duration,
    /// Size of the top-bids section of a snapshot.
    pub top_bids_limit: usize,
}

impl Default for FanoutSection {
    fn default() -> Self {
        Self {
            time_tick: Duration::from_millis(100),
            snapshot_tick: Duration::from_millis(100),
            dedup_interval: Duration::from_millis(100),
            heartbeat: Duration::from_secs(10),
            top_bids_limit: 10,
        }
    }
}

/// Anti-sniping behaviour.
///
/// The source product extends only the opening round; `first_round_only`
/// exists so that widening the rule is an explicit product decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AntiSnipeSection {
    /// A qualifying bid inside this window before the effective end extends
    /// the round.
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// Length of each extension.
    #[serde(with = "humantime_serde")]
    pub extension: Duration,
    pub first_round_only: bool,
}

impl Default for AntiSnipeSection {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            extension: Duration::from_secs(30),
            first_round_only: true,
        }
    }
}

/// Lifecycle manager cadences.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleSection {
    /// Catch-up tick for missed change-feed events.
    #[serde(with = "humantime_serde")]
    pub reconcile_interval: Duration,
    /// Poll cadence of the carry-queue worker.
    #[serde(with = "humantime_serde")]
    pub carry_poll_interval: Duration,
}

impl Default for LifecycleSection {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(10),
            carry_poll_interval: Duration::from_millis(200),
        }
    }
}

/// Placeholder fulfillment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliverySection {
    /// Delay before a PENDING delivery flips to DELIVERED.
    #[serde(with = "humantime_serde")]
    pub fulfillment_delay: Duration,
}

impl Default for DeliverySection {
    fn default() -> Self {
        Self { fulfillment_delay: Duration::from_secs(5) }
    }
}
