use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use zlv_sources::DEFAULT_CHANNEL_CAPACITY;
use zlv_storage::BackoffPolicy;

use crate::conflict::FieldPriority;
use crate::ImportError;

/// Run settings read from the environment; CLI flags override them.
#[derive(Debug, Clone)]
pub struct ImportConfig {
    pub channel_capacity: usize,
    pub chunk_size: usize,
    pub sink_timeout: Duration,
    pub backoff: BackoffPolicy,
    pub abort_early: bool,
    pub database_url: Option<String>,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            chunk_size: 256,
            sink_timeout: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
            abort_early: false,
            database_url: None,
        }
    }
}

impl ImportConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            channel_capacity: env_parse("ZLV_CHANNEL_CAPACITY")
                .filter(|v: &usize| *v > 0)
                .unwrap_or(defaults.channel_capacity),
            chunk_size: env_parse("ZLV_CHUNK_SIZE")
                .filter(|v: &usize| *v > 0)
                .unwrap_or(defaults.chunk_size),
            sink_timeout: env_parse("ZLV_SINK_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.sink_timeout),
            backoff: defaults.backoff,
            abort_early: std::env::var("ZLV_ABORT_EARLY")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

/// Relative weight of each similarity component. Components missing on
/// either side are left out and the remaining weights renormalized.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimilarityWeights {
    pub name: f64,
    pub address: f64,
    pub birth_date: f64,
}

impl Default for SimilarityWeights {
    fn default() -> Self {
        Self {
            name: 0.6,
            address: 0.3,
            birth_date: 0.1,
        }
    }
}

/// Run-scoped matching policy, loadable from YAML:
///
/// ```yaml
/// match_threshold: 0.9
/// weights: { name: 0.6, address: 0.3, birth_date: 0.1 }
/// field_priority: keep_existing
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchPolicy {
    pub match_threshold: f64,
    pub weights: SimilarityWeights,
    pub field_priority: FieldPriority,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self {
            match_threshold: 0.9,
            weights: SimilarityWeights::default(),
            field_priority: FieldPriority::default(),
        }
    }
}

impl MatchPolicy {
    pub fn from_yaml_str(text: &str) -> Result<Self, ImportError> {
        let policy: MatchPolicy =
            serde_yaml::from_str(text).map_err(|e| ImportError::Config(e.to_string()))?;
        policy.validated()
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ImportError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ImportError::Config(format!("reading {}: {e}", path.display())))?;
        Self::from_yaml_str(&text)
    }

    pub fn validated(self) -> Result<Self, ImportError> {
        if !(0.0..=1.0).contains(&self.match_threshold) {
            return Err(ImportError::Config(format!(
                "match_threshold must be within [0, 1], got {}",
                self.match_threshold
            )));
        }
        let w = self.weights;
        if [w.name, w.address, w.birth_date].iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(ImportError::Config("similarity weights must be non-negative".into()));
        }
        if w.name + w.address + w.birth_date <= 0.0 {
            return Err(ImportError::Config("at least one similarity weight must be positive".into()));
        }
        Ok(self)
    }
}
