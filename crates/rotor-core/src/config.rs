//! Rotation policy configuration (spec §4.1).
//!
//! Pure value object. `Config::load()` reads the environment-variable
//! inputs listed in spec §6, substituting documented defaults for anything
//! missing or unparsable, then validates composite invariants. A failed
//! invariant falls back to a safe, disabled baseline rather than erroring —
//! configuration mistakes degrade to "rotation off", not a crash.

use std::env;
use std::time::Duration;

/// `{ enabled, maxConcurrentModels, rotationTimeoutMs, retryAttempts, retryDelayMs }`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationPolicy {
    pub enabled: bool,
    pub max_concurrent_models: usize,
    pub rotation_timeout_ms: u64,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
}

/// `{ warning, critical, cleanup }` percentages, `0 <= warning < critical < cleanup <= 100`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub warning: u8,
    pub critical: u8,
    pub cleanup: u8,
}

/// `{ maxSize, processingIntervalMs }`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuePolicy {
    pub max_size: usize,
    pub processing_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    rotation: RotationPolicy,
    thresholds: Thresholds,
    queue: QueuePolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self::safe_baseline()
    }
}

impl Config {
    /// The baseline used when validation fails: rotation disabled, but
    /// every other field still holds a usable value so callers that ignore
    /// `enabled` don't divide by zero or allocate an empty queue.
    fn safe_baseline() -> Self {
        Self {
            rotation: RotationPolicy {
                enabled: false,
                max_concurrent_models: 1,
                rotation_timeout_ms: 30_000,
                retry_attempts: 3,
                retry_delay_ms: 1_000,
            },
            thresholds: Thresholds {
                warning: 70,
                critical: 85,
                cleanup: 95,
            },
            queue: QueuePolicy {
                max_size: 50,
                processing_interval_ms: 1_000,
            },
        }
    }

    /// Read from environment-variable-style inputs (spec §6), substituting
    /// defaults and validating composite invariants.
    pub fn load() -> Self {
        let enabled = get_env_bool("MODEL_ROTATION_ENABLED", true);
        let max_concurrent_models =
            get_env_uint("MAX_CONCURRENT_MODELS", 1).clamp(1, u64::from(u32::MAX)) as usize;
        let rotation_timeout_ms = get_env_uint("ROTATION_TIMEOUT_MS", 30_000);
        let retry_attempts = get_env_uint("ROTATION_RETRY_ATTEMPTS", 3) as u32;
        let retry_delay_ms = get_env_uint("ROTATION_RETRY_DELAY_MS", 1_000);

        let warning = get_env_uint("MEMORY_WARNING_THRESHOLD", 70).min(100) as u8;
        let critical = get_env_uint("MEMORY_CRITICAL_THRESHOLD", 85).min(100) as u8;
        let cleanup = get_env_uint("MEMORY_CLEANUP_THRESHOLD", 95).min(100) as u8;

        let max_size = get_env_uint("MAX_QUEUE_SIZE", 50) as usize;
        let processing_interval_ms = get_env_uint("QUEUE_PROCESSING_INTERVAL_MS", 1_000);

        let cfg = Self {
            rotation: RotationPolicy {
                enabled,
                max_concurrent_models,
                rotation_timeout_ms,
                retry_attempts,
                retry_delay_ms,
            },
            thresholds: Thresholds {
                warning,
                critical,
                cleanup,
            },
            queue: QueuePolicy {
                max_size,
                processing_interval_ms,
            },
        };

        match cfg.validate() {
            Ok(()) => cfg,
            Err(reason) => {
                tracing::warn!(reason, "invalid rotation config, falling back to safe baseline");
                Self::safe_baseline()
            }
        }
    }

    fn validate(&self) -> Result<(), &'static str> {
        if self.thresholds.warning >= self.thresholds.critical
            || self.thresholds.critical >= self.thresholds.cleanup
        {
            return Err("threshold order invariant violated (warning < critical < cleanup)");
        }
        if self.queue.max_size == 0 {
            return Err("queue max_size must be positive");
        }
        if self.rotation.max_concurrent_models == 0 {
            return Err("max_concurrent_models must be positive");
        }
        Ok(())
    }

    pub fn get_rotation(&self) -> &RotationPolicy {
        &self.rotation
    }

    pub fn get_thresholds(&self) -> Thresholds {
        self.thresholds
    }

    pub fn get_queue(&self) -> QueuePolicy {
        self.queue
    }

    pub fn rotation_timeout(&self) -> Duration {
        Duration::from_millis(self.rotation.rotation_timeout_ms)
    }

    /// `{ isValid, errors, warnings }` (spec §6, `validateConfig`).
    pub fn validate_report(&self) -> ValidationReport {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if let Err(reason) = self.validate() {
            errors.push(reason.to_string());
        }
        if !self.rotation.enabled {
            warnings.push("rotation is disabled".to_string());
        }
        if self.rotation.retry_attempts == 0 {
            warnings.push("retry_attempts is 0: load failures will not be retried".to_string());
        }

        ValidationReport {
            is_valid: errors.is_empty(),
            errors,
            warnings,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

fn get_env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn get_env_uint(key: &str, default: u64) -> u64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let cfg = Config::safe_baseline();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn invalid_threshold_order_falls_back() {
        // SAFETY: test runs in a single thread per `cargo test`'s default
        // harness isolation is not guaranteed, so scope to unique var names.
        unsafe {
            env::set_var("MEMORY_WARNING_THRESHOLD", "90");
            env::set_var("MEMORY_CRITICAL_THRESHOLD", "50");
        }
        let cfg = Config::load();
        assert!(!cfg.get_rotation().enabled);
        assert_eq!(cfg.get_thresholds().warning, 70);
        unsafe {
            env::remove_var("MEMORY_WARNING_THRESHOLD");
            env::remove_var("MEMORY_CRITICAL_THRESHOLD");
        }
    }

    #[test]
    fn zero_queue_size_falls_back_to_baseline() {
        unsafe {
            env::set_var("MAX_QUEUE_SIZE", "0");
        }
        let cfg = Config::load();
        assert_eq!(cfg.get_queue().max_size, 50);
        unsafe {
            env::remove_var("MAX_QUEUE_SIZE");
        }
    }

    #[test]
    fn validate_report_flags_disabled_rotation() {
        let mut cfg = Config::safe_baseline();
        cfg.rotation.enabled = false;
        let report = cfg.validate_report();
        assert!(report.is_valid);
        assert!(report.warnings.iter().any(|w| w.contains("disabled")));
    }
}
