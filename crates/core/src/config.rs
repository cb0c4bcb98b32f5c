use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SchedulerError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

// ── Top-level config ──────────────────────────────────────────

/// Process-wide scheduler configuration.
///
/// Parsed from `taktgeber.toml`; every field can be overridden with a
/// `TAKTGEBER_*` environment variable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Retries allowed for a task that does not set its own `max_retries`.
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,

    /// Execution timeout applied to tasks without their own. `None` = unbounded.
    #[serde(default)]
    pub default_task_timeout_ms: Option<u64>,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub concurrency: ConcurrencyConfig,

    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

fn default_max_retries() -> u32 {
    3
}

// ── Sections ──────────────────────────────────────────────────

/// Backoff between retries: `min(base * 2^attempt, cap) * jitter`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_base_ms")]
    pub base_ms: u64,

    #[serde(default = "default_cap_ms")]
    pub cap_ms: u64,

    /// Multiply the delay by a uniform factor in `[jitter_min, jitter_max]`.
    #[serde(default = "default_true")]
    pub jitter: bool,

    #[serde(default = "default_jitter_min")]
    pub jitter_min: f64,

    #[serde(default = "default_jitter_max")]
    pub jitter_max: f64,
}

fn default_base_ms() -> u64 {
    100
}

fn default_cap_ms() -> u64 {
    10_000
}

fn default_true() -> bool {
    true
}

fn default_jitter_min() -> f64 {
    0.5
}

fn default_jitter_max() -> f64 {
    1.5
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_ms: default_base_ms(),
            cap_ms: default_cap_ms(),
            jitter: default_true(),
            jitter_min: default_jitter_min(),
            jitter_max: default_jitter_max(),
        }
    }
}

/// Adaptive (AIMD) in-flight limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Limit at startup.
    #[serde(default = "default_initial")]
    pub initial: usize,

    /// Floor for multiplicative decrease. Never below 1.
    #[serde(default = "default_min")]
    pub min: usize,

    /// Ceiling for additive increase.
    #[serde(default = "default_max")]
    pub max: usize,

    /// Consecutive successes needed before the limit grows.
    #[serde(default = "default_increase_after")]
    pub increase_after: u32,

    #[serde(default = "default_additive_step")]
    pub additive_step: usize,

    /// Factor applied to the limit on failure or timeout.
    #[serde(default = "default_decrease_factor")]
    pub decrease_factor: f64,

    /// Successes slower than this reset the success streak.
    #[serde(default)]
    pub slow_call_ms: Option<u64>,
}

fn default_initial() -> usize {
    4
}

fn default_min() -> usize {
    1
}

fn default_max() -> usize {
    32
}

fn default_increase_after() -> u32 {
    10
}

fn default_additive_step() -> usize {
    1
}

fn default_decrease_factor() -> f64 {
    0.5
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            initial: default_initial(),
            min: default_min(),
            max: default_max(),
            increase_after: default_increase_after(),
            additive_step: default_additive_step(),
            decrease_factor: default_decrease_factor(),
            slow_call_ms: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// How long `interrupt()` waits for in-flight work to finish.
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
}

fn default_grace_period_ms() -> u64 {
    5_000
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: default_grace_period_ms(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_max_retries: default_max_retries(),
            default_task_timeout_ms: None,
            retry: RetryConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            shutdown: ShutdownConfig::default(),
        }
    }
}

// ── Loading & Validation ──────────────────────────────────────

impl SchedulerConfig {
    /// Parse config from a TOML string, then apply env overrides and validate.
    pub fn from_toml(toml_str: &str) -> Result<Self, SchedulerError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SchedulerError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Defaults plus env overrides, for when no config file exists.
    pub fn from_env() -> Result<Self, SchedulerError> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.shutdown.grace_period_ms)
    }

    pub fn default_task_timeout(&self) -> Option<Duration> {
        self.default_task_timeout_ms.map(Duration::from_millis)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok().filter(|v| !v.is_empty()));
    }

    /// Apply `TAKTGEBER_*` overrides read through `lookup`. Unparseable values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
            let raw = lookup(key)?;
            match raw.parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!(key, value = %raw, "ignoring unparseable config override");
                    None
                }
            }
        }

        if let Some(v) = parsed(&lookup, "TAKTGEBER_DEFAULT_MAX_RETRIES") {
            self.default_max_retries = v;
        }
        if let Some(v) = parsed(&lookup, "TAKTGEBER_DEFAULT_TASK_TIMEOUT_MS") {
            self.default_task_timeout_ms = Some(v);
        }
        if let Some(v) = parsed(&lookup, "TAKTGEBER_RETRY_BASE_MS") {
            self.retry.base_ms = v;
        }
        if let Some(v) = parsed(&lookup, "TAKTGEBER_RETRY_CAP_MS") {
            self.retry.cap_ms = v;
        }
        if let Some(v) = parsed(&lookup, "TAKTGEBER_RETRY_JITTER") {
            self.retry.jitter = v;
        }
        if let Some(v) = parsed(&lookup, "TAKTGEBER_CONCURRENCY_INITIAL") {
            self.concurrency.initial = v;
        }
        if let Some(v) = parsed(&lookup, "TAKTGEBER_CONCURRENCY_MAX") {
            self.concurrency.max = v;
        }
        if let Some(v) = parsed(&lookup, "TAKTGEBER_GRACE_PERIOD_MS") {
            self.shutdown.grace_period_ms = v;
        }
    }

    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.default_task_timeout_ms == Some(0) {
            return Err(SchedulerError::Config(
                "default_task_timeout_ms must be > 0 when set".into(),
            ));
        }
        self.validate_retry()?;
        self.validate_concurrency()?;
        Ok(())
    }

    fn validate_retry(&self) -> Result<(), SchedulerError> {
        let r = &self.retry;
        if r.base_ms == 0 {
            return Err(SchedulerError::Config("retry.base_ms must be > 0".into()));
        }
        if r.base_ms > r.cap_ms {
            return Err(SchedulerError::Config(format!(
                "retry.base_ms ({}) exceeds retry.cap_ms ({})",
                r.base_ms, r.cap_ms
            )));
        }
        if !(r.jitter_min > 0.0 && r.jitter_min <= r.jitter_max) {
            return Err(SchedulerError::Config(format!(
                "invalid jitter band [{}, {}]",
                r.jitter_min, r.jitter_max
            )));
        }
        Ok(())
    }

    fn validate_concurrency(&self) -> Result<(), SchedulerError> {
        let c = &self.concurrency;
        if c.min == 0 {
            return Err(SchedulerError::Config("concurrency.min must be >= 1".into()));
        }
        if !(c.min <= c.initial && c.initial <= c.max) {
            return Err(SchedulerError::Config(format!(
                "concurrency limits must satisfy min <= initial <= max (got {} / {} / {})",
                c.min, c.initial, c.max
            )));
        }
        if !(c.decrease_factor > 0.0 && c.decrease_factor < 1.0) {
            return Err(SchedulerError::Config(format!(
                "concurrency.decrease_factor must be in (0, 1), got {}",
                c.decrease_factor
            )));
        }
        if c.increase_after == 0 {
            return Err(SchedulerError::Config("concurrency.increase_after must be >= 1".into()));
        }
        Ok(())
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Scheduler config:");
        tracing::info!(
            "  retry:       base={}ms, cap={}ms, jitter={}, default_max_retries={}",
            self.retry.base_ms, self.retry.cap_ms, self.retry.jitter, self.default_max_retries
        );
        tracing::info!(
            "  concurrency: initial={}, min={}, max={}",
            self.concurrency.initial, self.concurrency.min, self.concurrency.max
        );
        tracing::info!("  shutdown:    grace={}ms", self.shutdown.grace_period_ms);
    }

    /// JSON view for diagnostics endpoints.
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "default_max_retries": self.default_max_retries,
            "default_task_timeout_ms": self.default_task_timeout_ms,
            "retry": {
                "base_ms": self.retry.base_ms,
                "cap_ms": self.retry.cap_ms,
                "jitter": self.retry.jitter,
            },
            "concurrency": {
                "initial": self.concurrency.initial,
                "min": self.concurrency.min,
                "max": self.concurrency.max,
            },
            "shutdown": { "grace_period_ms": self.shutdown.grace_period_ms },
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn parse_empty_toml_uses_defaults() {
        let cfg: SchedulerConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.default_max_retries, 3);
        assert_eq!(cfg.retry.base_ms, 100);
        assert_eq!(cfg.retry.cap_ms, 10_000);
        assert!(cfg.retry.jitter);
        assert_eq!(cfg.concurrency.initial, 4);
        assert_eq!(cfg.shutdown.grace_period_ms, 5_000);
        assert!(cfg.default_task_timeout_ms.is_none());
    }

    #[test]
    fn parse_sections() {
        let toml = r#"
default_max_retries = 5
default_task_timeout_ms = 30000

[retry]
base_ms = 250
cap_ms = 60000
jitter = false

[concurrency]
initial = 2
max = 8
slow_call_ms = 1500

[shutdown]
grace_period_ms = 1000
"#;
        let cfg: SchedulerConfig = toml::from_str(toml).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.default_max_retries, 5);
        assert_eq!(cfg.default_task_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(cfg.retry.base_ms, 250);
        assert!(!cfg.retry.jitter);
        assert_eq!(cfg.concurrency.initial, 2);
        assert_eq!(cfg.concurrency.min, 1);
        assert_eq!(cfg.concurrency.slow_call_ms, Some(1500));
        assert_eq!(cfg.grace_period(), Duration::from_secs(1));
    }

    #[test]
    fn overrides_replace_file_values() {
        let vars: HashMap<&str, &str> = [
            ("TAKTGEBER_RETRY_CAP_MS", "20000"),
            ("TAKTGEBER_GRACE_PERIOD_MS", "250"),
            ("TAKTGEBER_RETRY_JITTER", "false"),
        ]
        .into_iter()
        .collect();

        let mut cfg = SchedulerConfig::default();
        cfg.apply_overrides(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(cfg.retry.cap_ms, 20_000);
        assert_eq!(cfg.shutdown.grace_period_ms, 250);
        assert!(!cfg.retry.jitter);
    }

    #[test]
    fn unparseable_override_is_ignored() {
        let mut cfg = SchedulerConfig::default();
        cfg.apply_overrides(|k| (k == "TAKTGEBER_CONCURRENCY_MAX").then(|| "lots".to_string()));
        assert_eq!(cfg.concurrency.max, 32);
    }

    #[test]
    fn reject_base_above_cap() {
        let toml = "[retry]\nbase_ms = 5000\ncap_ms = 100\n";
        let cfg: SchedulerConfig = toml::from_str(toml).unwrap();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }

    #[test]
    fn reject_initial_above_max() {
        let mut cfg = SchedulerConfig::default();
        cfg.concurrency.initial = 64;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn reject_zero_min() {
        let mut cfg = SchedulerConfig::default();
        cfg.concurrency.min = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn reject_bad_decrease_factor() {
        let mut cfg = SchedulerConfig::default();
        cfg.concurrency.decrease_factor = 1.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn reject_inverted_jitter_band() {
        let mut cfg = SchedulerConfig::default();
        cfg.retry.jitter_min = 2.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn reject_zero_default_timeout() {
        let mut cfg = SchedulerConfig::default();
        cfg.default_task_timeout_ms = Some(0);
        assert!(matches!(cfg.validate(), Err(SchedulerError::Config(_))));

        cfg.default_task_timeout_ms = Some(30_000);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn summary_has_sections() {
        let v = SchedulerConfig::default().summary();
        assert_eq!(v["retry"]["cap_ms"], 10_000);
        assert_eq!(v["shutdown"]["grace_period_ms"], 5_000);
    }

    #[test]
    fn from_file_missing_is_io_error() {
        let err = SchedulerConfig::from_file("/nonexistent/taktgeber.toml").unwrap_err();
        assert!(matches!(err, SchedulerError::ConfigIo(_)));
    }
}
