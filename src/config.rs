//! Runtime configuration and environment variable overrides.
//!
//! # Configuration Precedence
//!
//! Settings are resolved in this order (highest priority first):
//!
//! 1. **Programmatic** — values set on a [`RuntimeConfig`] before installing it
//! 2. **Environment variables** — values from `COFIBER_*` env vars
//! 3. **Defaults** — built-in defaults from [`RuntimeConfig::default()`]
//!
//! # Supported Environment Variables
//!
//! | Variable | Type | Maps to |
//! |----------|------|---------|
//! | `COFIBER_STACK_SIZE` | `usize` | `stack_size` |
//! | `COFIBER_STACK_POOL_CAPACITY` | `usize` | `stack_pool_capacity` |
//! | `COFIBER_MIN_THREADS` | `usize` | `min_threads` |
//! | `COFIBER_MAX_THREADS` | `usize` | `max_threads` |
//! | `COFIBER_THREAD_NAME_PREFIX` | `String` | `thread_name_prefix` |

use thiserror::Error;

/// Environment variable name for the coroutine stack size in bytes.
pub const ENV_STACK_SIZE: &str = "COFIBER_STACK_SIZE";
/// Environment variable name for the shared stack pool capacity.
pub const ENV_STACK_POOL_CAPACITY: &str = "COFIBER_STACK_POOL_CAPACITY";
/// Environment variable name for the global thread pool's minimum thread count.
pub const ENV_MIN_THREADS: &str = "COFIBER_MIN_THREADS";
/// Environment variable name for the global thread pool's maximum thread count.
pub const ENV_MAX_THREADS: &str = "COFIBER_MAX_THREADS";
/// Environment variable name for the worker thread name prefix.
pub const ENV_THREAD_NAME_PREFIX: &str = "COFIBER_THREAD_NAME_PREFIX";

/// Default usable stack size per coroutine (512 KiB).
pub const DEFAULT_STACK_SIZE: usize = 512 * 1024;
/// Default number of stacks retained by the shared pool.
pub const DEFAULT_STACK_POOL_CAPACITY: usize = 32;

/// Error produced when a configuration value cannot be parsed or is invalid.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// An environment variable was set but did not parse as the expected type.
    #[error("invalid value for {variable}: expected {expected}, got {value:?}")]
    InvalidValue {
        /// The environment variable name.
        variable: &'static str,
        /// The expected type description.
        expected: &'static str,
        /// The raw value found in the environment.
        value: String,
    },
    /// A value parsed but violates a constraint (e.g. zero threads).
    #[error("invalid configuration: {0}")]
    Constraint(String),
}

/// Configuration for the coroutine runtime's shared resources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Usable stack size per coroutine, in bytes. Rounded up to page size.
    pub stack_size: usize,
    /// Maximum number of stacks retained by the shared stack pool.
    pub stack_pool_capacity: usize,
    /// Minimum number of threads kept alive by the global thread pool.
    pub min_threads: usize,
    /// Maximum number of threads the global thread pool may spawn.
    pub max_threads: usize,
    /// Name prefix for spawned worker threads.
    pub thread_name_prefix: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let parallelism =
            std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get);
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            stack_pool_capacity: DEFAULT_STACK_POOL_CAPACITY,
            min_threads: 1,
            max_threads: parallelism.max(4),
            thread_name_prefix: "cofiber-worker".to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Builds the effective configuration: defaults plus environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        apply_env_overrides(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_threads == 0 {
            return Err(ConfigError::Constraint(
                "max_threads must be at least 1".to_string(),
            ));
        }
        if self.min_threads > self.max_threads {
            return Err(ConfigError::Constraint(format!(
                "min_threads ({}) exceeds max_threads ({})",
                self.min_threads, self.max_threads
            )));
        }
        if self.stack_size < 16 * 1024 {
            return Err(ConfigError::Constraint(format!(
                "stack_size ({}) below the 16 KiB minimum",
                self.stack_size
            )));
        }
        Ok(())
    }
}

/// Apply environment variable overrides to a [`RuntimeConfig`].
///
/// Only variables that are set in the environment are applied.
/// Returns an error if a variable is set but contains an unparseable value.
pub fn apply_env_overrides(config: &mut RuntimeConfig) -> Result<(), ConfigError> {
    if let Some(val) = read_env(ENV_STACK_SIZE) {
        config.stack_size = parse_usize(ENV_STACK_SIZE, &val)?;
    }
    if let Some(val) = read_env(ENV_STACK_POOL_CAPACITY) {
        config.stack_pool_capacity = parse_usize(ENV_STACK_POOL_CAPACITY, &val)?;
    }
    if let Some(val) = read_env(ENV_MIN_THREADS) {
        config.min_threads = parse_usize(ENV_MIN_THREADS, &val)?;
    }
    if let Some(val) = read_env(ENV_MAX_THREADS) {
        config.max_threads = parse_usize(ENV_MAX_THREADS, &val)?;
    }
    if let Some(val) = read_env(ENV_THREAD_NAME_PREFIX) {
        config.thread_name_prefix = val;
    }
    Ok(())
}

/// Read an environment variable, returning `None` if unset.
fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn parse_usize(variable: &'static str, val: &str) -> Result<usize, ConfigError> {
    val.trim()
        .parse::<usize>()
        .map_err(|_| ConfigError::InvalidValue {
            variable,
            expected: "unsigned integer",
            value: val.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Env mutation must not interleave across tests.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn defaults_are_valid() {
        let config = RuntimeConfig::default();
        config.validate().expect("defaults must validate");
        assert_eq!(config.stack_size, DEFAULT_STACK_SIZE);
        assert_eq!(config.stack_pool_capacity, DEFAULT_STACK_POOL_CAPACITY);
    }

    #[test]
    fn env_override_applies() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var(ENV_STACK_SIZE, "262144");
        let mut config = RuntimeConfig::default();
        apply_env_overrides(&mut config).expect("override failed");
        std::env::remove_var(ENV_STACK_SIZE);
        assert_eq!(config.stack_size, 262_144);
    }

    #[test]
    fn invalid_env_value_is_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var(ENV_MAX_THREADS, "many");
        let mut config = RuntimeConfig::default();
        let err = apply_env_overrides(&mut config).expect_err("expected parse failure");
        std::env::remove_var(ENV_MAX_THREADS);
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn constraint_violations_are_reported() {
        let config = RuntimeConfig {
            min_threads: 8,
            max_threads: 2,
            ..RuntimeConfig::default()
        };
        let err = config.validate().expect_err("expected constraint error");
        assert!(matches!(err, ConfigError::Constraint(_)));

        let config = RuntimeConfig {
            stack_size: 1024,
            ..RuntimeConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
