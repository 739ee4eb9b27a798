use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

/// Logical grouping of cache entries sharing one TTL/retry policy.
///
/// One variant per call site. The set is static: adding a call site means
/// adding a variant, a default policy row and (if desired) a config
/// override field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Namespace {
    Wishlist,
    InventoryProduct,
    InventoryVariant,
    InventoryBatch,
    AnalyticsActivity,
    AnalyticsBrowsing,
    RecommendationsRelated,
    RecommendationsTopRated,
    RecommendationsBestsellers,
}

impl Namespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Wishlist => "wishlist",
            Namespace::InventoryProduct => "inventory-product",
            Namespace::InventoryVariant => "inventory-variant",
            Namespace::InventoryBatch => "inventory-batch",
            Namespace::AnalyticsActivity => "analytics-activity",
            Namespace::AnalyticsBrowsing => "analytics-browsing",
            Namespace::RecommendationsRelated => "recommendations-related",
            Namespace::RecommendationsTopRated => "recommendations-top-rated",
            Namespace::RecommendationsBestsellers => "recommendations-bestsellers",
        }
    }

    /// All namespaces, in durable-record order.
    pub fn all() -> &'static [Namespace] {
        &[
            Namespace::Wishlist,
            Namespace::InventoryProduct,
            Namespace::InventoryVariant,
            Namespace::InventoryBatch,
            Namespace::AnalyticsActivity,
            Namespace::AnalyticsBrowsing,
            Namespace::RecommendationsRelated,
            Namespace::RecommendationsTopRated,
            Namespace::RecommendationsBestsellers,
        ]
    }
}

impl AsRef<str> for Namespace {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// TTL/retry policy for one namespace. Read-only at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct NamespacePolicy {
    /// How long an entry stays fresh after it was stored.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    /// Total number of attempts for lookups failing transiently.
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Base delay between attempts; attempt `n` waits `n * backoff`.
    #[serde(with = "humantime_serde", default = "default_backoff")]
    pub backoff: Duration,

    /// Upper bound on entries held in memory for the namespace.
    #[serde(default = "default_in_memory_capacity")]
    pub in_memory_capacity: u64,
}

fn default_max_retries() -> usize {
    3
}

fn default_backoff() -> Duration {
    Duration::from_millis(250)
}

fn default_in_memory_capacity() -> u64 {
    4096
}

impl NamespacePolicy {
    /// The built-in policy row for a namespace.
    ///
    /// TTLs reflect how volatile the data is: inventory availability is
    /// the freshest, top-rated and bestseller lists barely move. These
    /// numbers are tuning knobs, not contracts; override them via
    /// [`PolicyConfigs`].
    pub fn defaults(namespace: Namespace) -> Self {
        let ttl = match namespace {
            Namespace::InventoryProduct
            | Namespace::InventoryVariant
            | Namespace::InventoryBatch => Duration::from_secs(10),
            Namespace::AnalyticsActivity => Duration::from_secs(60),
            Namespace::AnalyticsBrowsing => Duration::from_secs(120),
            Namespace::Wishlist => Duration::from_secs(300),
            Namespace::RecommendationsRelated => Duration::from_secs(900),
            Namespace::RecommendationsTopRated | Namespace::RecommendationsBestsellers => {
                Duration::from_secs(3600)
            }
        };

        NamespacePolicy {
            ttl,
            max_retries: default_max_retries(),
            backoff: default_backoff(),
            in_memory_capacity: default_in_memory_capacity(),
        }
    }
}

/// Per-namespace policy overrides. An absent row falls back to
/// [`NamespacePolicy::defaults`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PolicyConfigs {
    pub wishlist: Option<NamespacePolicy>,
    pub inventory_product: Option<NamespacePolicy>,
    pub inventory_variant: Option<NamespacePolicy>,
    pub inventory_batch: Option<NamespacePolicy>,
    pub analytics_activity: Option<NamespacePolicy>,
    pub analytics_browsing: Option<NamespacePolicy>,
    pub recommendations_related: Option<NamespacePolicy>,
    pub recommendations_top_rated: Option<NamespacePolicy>,
    pub recommendations_bestsellers: Option<NamespacePolicy>,
}

impl PolicyConfigs {
    fn row(&self, namespace: Namespace) -> Option<NamespacePolicy> {
        match namespace {
            Namespace::Wishlist => self.wishlist,
            Namespace::InventoryProduct => self.inventory_product,
            Namespace::InventoryVariant => self.inventory_variant,
            Namespace::InventoryBatch => self.inventory_batch,
            Namespace::AnalyticsActivity => self.analytics_activity,
            Namespace::AnalyticsBrowsing => self.analytics_browsing,
            Namespace::RecommendationsRelated => self.recommendations_related,
            Namespace::RecommendationsTopRated => self.recommendations_top_rated,
            Namespace::RecommendationsBestsellers => self.recommendations_bestsellers,
        }
    }
}

/// Controls the log format.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
        }
    }
}

fn deserialize_level_filter<'de, D>(deserializer: D) -> Result<LevelFilter, D::Error>
where
    D: Deserializer<'de>,
{
    let level = String::deserialize(deserializer)?;
    level.parse().map_err(de::Error::custom)
}

/// Durable snapshot storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotConfig {
    /// Directory holding one record file per namespace.
    ///
    /// When no snapshot section is configured at all, cache contents do
    /// not survive a restart.
    pub path: PathBuf,

    /// Bounded queue of outstanding snapshot writes. Writes beyond the
    /// bound are dropped (and logged), never awaited.
    #[serde(default = "default_write_queue_size")]
    pub max_write_queue_size: usize,
}

pub(crate) fn default_write_queue_size() -> usize {
    64
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Which namespace policies deviate from the defaults.
    pub policies: PolicyConfigs,

    /// Durable snapshot storage; `None` disables persistence.
    pub snapshot: Option<SnapshotConfig>,

    /// Logging configuration, consumed by [`crate::logging::init`].
    pub logging: Logging,
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }

    /// The effective policy row for a namespace.
    pub fn policy(&self, namespace: Namespace) -> NamespacePolicy {
        self.policies
            .row(namespace)
            .unwrap_or_else(|| NamespacePolicy::defaults(namespace))
    }
}
