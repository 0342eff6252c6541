use crate::types::MAX_TIMEOUT_SECS;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use troupe_core::{TroupeError, TroupeResult};

/// How a decomposed parent turns its children's results into one result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SynthesisPolicy {
    /// Ask the gateway, falling back to concatenation when it fails.
    #[default]
    Gateway,
    /// Join child results in declared order.
    Concatenate,
}

/// Weights of the candidate scoring terms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringWeights {
    #[serde(default = "default_load_weight")]
    pub load: f64,
    #[serde(default = "default_success_weight")]
    pub success: f64,
    #[serde(default = "default_latency_weight")]
    pub latency: f64,
    #[serde(default = "default_type_priority_weight")]
    pub type_priority: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            load: default_load_weight(),
            success: default_success_weight(),
            latency: default_latency_weight(),
            type_priority: default_type_priority_weight(),
        }
    }
}

/// Engine configuration, usually read from the `[engine]` table of `troupe.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Default per-task timeout for each waiting or executing phase.
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    /// Upper bound on any single gateway call.
    #[serde(default = "default_gateway_timeout_secs")]
    pub gateway_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Results self-reporting less than this are discarded before consensus.
    #[serde(default = "default_confidence_floor")]
    pub confidence_floor: f64,
    /// Size of each agent's rolling performance window.
    #[serde(default = "default_performance_window")]
    pub performance_window: usize,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    #[serde(default = "default_message_log_capacity")]
    pub message_log_capacity: usize,
    /// Tasks needing more capability tags than this are offered for decomposition.
    #[serde(default = "default_decompose_capability_threshold")]
    pub decompose_capability_threshold: usize,
    #[serde(default = "default_max_subtasks")]
    pub max_subtasks: usize,
    #[serde(default)]
    pub tolerate_partial_failure: bool,
    #[serde(default = "default_redundancy")]
    pub default_redundancy: u32,
    #[serde(default)]
    pub synthesis: SynthesisPolicy,
    #[serde(default)]
    pub scoring: ScoringWeights,
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_task_timeout_secs() -> u64 {
    300
}

fn default_gateway_timeout_secs() -> u64 {
    120
}

fn default_max_retries() -> u32 {
    3
}

fn default_confidence_floor() -> f64 {
    0.7
}

fn default_performance_window() -> usize {
    50
}

fn default_event_capacity() -> usize {
    1000
}

fn default_message_log_capacity() -> usize {
    1000
}

fn default_decompose_capability_threshold() -> usize {
    2
}

fn default_max_subtasks() -> usize {
    8
}

fn default_redundancy() -> u32 {
    1
}

fn default_load_weight() -> f64 {
    0.3
}

fn default_success_weight() -> f64 {
    0.4
}

fn default_latency_weight() -> f64 {
    0.1
}

fn default_type_priority_weight() -> f64 {
    0.2
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            task_timeout_secs: default_task_timeout_secs(),
            gateway_timeout_secs: default_gateway_timeout_secs(),
            max_retries: default_max_retries(),
            confidence_floor: default_confidence_floor(),
            performance_window: default_performance_window(),
            event_capacity: default_event_capacity(),
            message_log_capacity: default_message_log_capacity(),
            decompose_capability_threshold: default_decompose_capability_threshold(),
            max_subtasks: default_max_subtasks(),
            tolerate_partial_failure: false,
            default_redundancy: default_redundancy(),
            synthesis: SynthesisPolicy::default(),
            scoring: ScoringWeights::default(),
        }
    }
}

impl EngineConfig {
    /// Parse a TOML document and validate it.
    pub fn from_toml_str(input: &str) -> TroupeResult<Self> {
        let config: EngineConfig =
            toml::from_str(input).map_err(|e| TroupeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: &Path) -> TroupeResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> TroupeResult<()> {
        if !(0.0..=1.0).contains(&self.confidence_floor) {
            return Err(TroupeError::Config(format!(
                "confidence_floor must be within [0, 1], got {}",
                self.confidence_floor
            )));
        }
        if self.tick_interval_ms == 0 {
            return Err(TroupeError::Config("tick_interval_ms must be positive".into()));
        }
        if self.task_timeout_secs == 0 || self.gateway_timeout_secs == 0 {
            return Err(TroupeError::Config("timeouts must be positive".into()));
        }
        if self.task_timeout_secs.max(self.gateway_timeout_secs) > MAX_TIMEOUT_SECS {
            return Err(TroupeError::Config(format!(
                "timeouts must not exceed {MAX_TIMEOUT_SECS}s"
            )));
        }
        if self.performance_window == 0 {
            return Err(TroupeError::Config("performance_window must be positive".into()));
        }
        if self.event_capacity == 0 {
            return Err(TroupeError::Config("event_capacity must be positive".into()));
        }
        if self.max_subtasks == 0 {
            return Err(TroupeError::Config("max_subtasks must be positive".into()));
        }
        if self.default_redundancy == 0 {
            return Err(TroupeError::Config("default_redundancy must be at least 1".into()));
        }
        let w = &self.scoring;
        if [w.load, w.success, w.latency, w.type_priority]
            .iter()
            .any(|v| !v.is_finite() || *v < 0.0)
        {
            return Err(TroupeError::Config(
                "scoring weights must be finite and non-negative".into(),
            ));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_secs(self.gateway_timeout_secs)
    }

    pub fn task_timeout_ms(&self) -> u64 {
        self.task_timeout_secs.saturating_mul(1000)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.tick_interval_ms, 1000);
        assert_eq!(config.max_retries, 3);
        assert!((config.confidence_floor - 0.7).abs() < f64::EPSILON);
        assert_eq!(config.synthesis, SynthesisPolicy::Gateway);
        assert!((config.scoring.success - 0.4).abs() < f64::EPSILON);
        config.validate().unwrap();
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config.task_timeout_secs, 300);
        assert_eq!(config.decompose_capability_threshold, 2);
        assert_eq!(config.default_redundancy, 1);
    }

    #[test]
    fn test_partial_toml() {
        let config = EngineConfig::from_toml_str(
            r#"
            confidence_floor = 0.5
            synthesis = "concatenate"

            [scoring]
            load = 0.5
            "#,
        )
        .unwrap();
        assert!((config.confidence_floor - 0.5).abs() < f64::EPSILON);
        assert_eq!(config.synthesis, SynthesisPolicy::Concatenate);
        assert!((config.scoring.load - 0.5).abs() < f64::EPSILON);
        assert!((config.scoring.type_priority - 0.2).abs() < f64::EPSILON);
    }

    #[test]
    fn test_invalid_floor_rejected() {
        let err = EngineConfig::from_toml_str("confidence_floor = 1.5").unwrap_err();
        assert!(matches!(err, TroupeError::Config(_)));
    }

    #[test]
    fn test_oversized_timeouts_rejected() {
        let err = EngineConfig::from_toml_str("task_timeout_secs = 10000000000000").unwrap_err();
        assert!(matches!(err, TroupeError::Config(_)));
        let err = EngineConfig::from_toml_str("gateway_timeout_secs = 2592001").unwrap_err();
        assert!(matches!(err, TroupeError::Config(_)));
        let config = EngineConfig::from_toml_str("task_timeout_secs = 2592000").unwrap();
        assert_eq!(config.task_timeout_ms(), 2_592_000_000);
    }

    #[test]
    fn test_malformed_toml_rejected() {
        let err = EngineConfig::from_toml_str("max_retries = \"three\"").unwrap_err();
        assert!(matches!(err, TroupeError::Config(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_retries = 5\ntick_interval_ms = 250").unwrap();
        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.tick_interval(), Duration::from_millis(250));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = EngineConfig::load(Path::new("/nonexistent/troupe.toml")).unwrap_err();
        assert!(matches!(err, TroupeError::Io(_)));
    }
}
