//! Repository configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for a [`DataRepository`](crate::DataRepository).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Whether maps track materialized entities in the identity index unless
    /// they say otherwise.
    pub track_entities: bool,
    /// Background collector settings.
    pub collector: CollectorConfig,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            track_entities: true,
            collector: CollectorConfig::default(),
        }
    }
}

impl RepositoryConfig {
    /// Set the default tracking behaviour of new maps.
    #[must_use]
    pub fn track_entities(mut self, value: bool) -> Self {
        self.track_entities = value;
        self
    }

    /// Replace the collector settings.
    #[must_use]
    pub fn collector(mut self, collector: CollectorConfig) -> Self {
        self.collector = collector;
        self
    }
}

/// Settings for the background entity collector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Whether a collector thread is started with the repository.
    pub enabled: bool,
    /// Time between sweeps.
    pub interval: Duration,
}

impl CollectorConfig {
    /// Shortest interval a collector will run with.
    pub const MIN_INTERVAL: Duration = Duration::from_millis(100);

    /// Default time between sweeps.
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

    /// An enabled collector sweeping every `interval`.
    pub fn every(interval: Duration) -> Self {
        Self {
            enabled: true,
            interval,
        }
    }

    /// The configured interval, raised to [`Self::MIN_INTERVAL`] if shorter.
    pub fn effective_interval(&self) -> Duration {
        self.interval.max(Self::MIN_INTERVAL)
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: Self::DEFAULT_INTERVAL,
        }
    }
}
