//! Process-wide linker configuration.

use std::env;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{OnceLock, RwLock};

pub const DEFAULT_MAX_STACK_BYTES: usize = 64 * 1024;
pub const DEFAULT_INVOKER_CACHE_CAPACITY: usize = 4_096;
pub const DEFAULT_MAX_ALLOCATION_BYTES: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkerConfig {
    /// Largest outgoing stack-argument area a plan may require.
    pub max_stack_bytes: usize,
    /// Invokers kept per linker before the cache is flushed.
    pub invoker_cache_capacity: usize,
    /// Largest single segment a scope hands out.
    ///
    /// Scopes are not tied to a linker: each one captures this limit from the
    /// process-wide configuration ([`install_linker_config`]) when it is
    /// created. The value carried by a config passed to
    /// [`crate::Linker::new`] is not consulted.
    pub max_allocation_bytes: usize,
    /// Emit a trace event for every native call.
    pub trace_calls: bool,
}

impl LinkerConfig {
    pub fn builder() -> LinkerConfigBuilder {
        LinkerConfigBuilder::new()
    }

    /// Defaults with `DOWNCALL_MAX_STACK_BYTES`, `DOWNCALL_INVOKER_CACHE` and
    /// `DOWNCALL_TRACE_CALLS` applied.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a variable is set but cannot be parsed or
    /// yields an invalid configuration.
    pub fn from_env() -> Result<Self, ConfigError> {
        let lookup = |key: &str| env::var(key).ok();
        let config = apply_env_overrides(Self::default(), lookup)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_stack_bytes == 0 {
            return Err(ConfigError::Invalid(
                "max_stack_bytes must be greater than zero",
            ));
        }
        if self.invoker_cache_capacity == 0 {
            return Err(ConfigError::Invalid(
                "invoker_cache_capacity must be greater than zero",
            ));
        }
        if self.max_allocation_bytes == 0 {
            return Err(ConfigError::Invalid(
                "max_allocation_bytes must be greater than zero",
            ));
        }
        Ok(())
    }
}

impl Default for LinkerConfig {
    fn default() -> Self {
        Self {
            max_stack_bytes: DEFAULT_MAX_STACK_BYTES,
            invoker_cache_capacity: DEFAULT_INVOKER_CACHE_CAPACITY,
            max_allocation_bytes: DEFAULT_MAX_ALLOCATION_BYTES,
            trace_calls: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LinkerConfigBuilder {
    inner: LinkerConfig,
}

impl LinkerConfigBuilder {
    pub fn new() -> Self {
        Self {
            inner: LinkerConfig::default(),
        }
    }

    pub fn max_stack_bytes(mut self, bytes: usize) -> Self {
        self.inner.max_stack_bytes = bytes;
        self
    }

    pub fn invoker_cache_capacity(mut self, capacity: usize) -> Self {
        self.inner.invoker_cache_capacity = capacity;
        self
    }

    pub fn max_allocation_bytes(mut self, bytes: usize) -> Self {
        self.inner.max_allocation_bytes = bytes;
        self
    }

    pub fn trace_calls(mut self, enabled: bool) -> Self {
        self.inner.trace_calls = enabled;
        self
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when a limit is zero.
    pub fn build(self) -> Result<LinkerConfig, ConfigError> {
        self.inner.validate()?;
        Ok(self.inner)
    }
}

impl Default for LinkerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_env_overrides(
    mut config: LinkerConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<LinkerConfig, ConfigError> {
    if let Some(value) = lookup("DOWNCALL_MAX_STACK_BYTES") {
        config.max_stack_bytes = parse_usize("DOWNCALL_MAX_STACK_BYTES", &value)?;
    }
    if let Some(value) = lookup("DOWNCALL_INVOKER_CACHE") {
        config.invoker_cache_capacity = parse_usize("DOWNCALL_INVOKER_CACHE", &value)?;
    }
    if let Some(value) = lookup("DOWNCALL_TRACE_CALLS") {
        config.trace_calls = match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" | "" => false,
            _ => {
                return Err(ConfigError::Env {
                    key: "DOWNCALL_TRACE_CALLS",
                    value,
                });
            }
        };
    }
    Ok(config)
}

fn parse_usize(key: &'static str, value: &str) -> Result<usize, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Env {
        key,
        value: value.to_string(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Invalid(&'static str),
    Env { key: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Invalid(message) => write!(f, "invalid linker configuration: {message}"),
            ConfigError::Env { key, value } => {
                write!(f, "environment variable {key} has unusable value `{value}`")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

struct LinkerConfigState {
    current: RwLock<LinkerConfig>,
    generation: AtomicU64,
}

impl LinkerConfigState {
    fn new() -> Self {
        let initial = LinkerConfig::from_env().unwrap_or_else(|err| {
            tracing::warn!(target: "downcall.link", error = %err, "ignoring environment overrides");
            LinkerConfig::default()
        });
        Self {
            current: RwLock::new(initial),
            generation: AtomicU64::new(0),
        }
    }
}

static CONFIG: OnceLock<LinkerConfigState> = OnceLock::new();

fn state() -> &'static LinkerConfigState {
    CONFIG.get_or_init(LinkerConfigState::new)
}

/// Replace the process-wide configuration used by [`crate::Linker::system`]
/// and by scopes created afterwards.
///
/// # Errors
///
/// Returns [`ConfigError::Invalid`] when a limit is zero.
pub fn install_linker_config(config: LinkerConfig) -> Result<(), ConfigError> {
    config.validate()?;
    let state = state();
    {
        let mut guard = state
            .current
            .write()
            .unwrap_or_else(|err| err.into_inner());
        *guard = config;
    }
    state.generation.fetch_add(1, Ordering::Relaxed);
    Ok(())
}

pub fn linker_config_snapshot() -> LinkerConfig {
    state()
        .current
        .read()
        .unwrap_or_else(|err| err.into_inner())
        .clone()
}

pub fn with_linker_config<R>(f: impl FnOnce(&LinkerConfig) -> R) -> R {
    let guard = state()
        .current
        .read()
        .unwrap_or_else(|err| err.into_inner());
    f(&guard)
}

pub fn linker_config_generation() -> u64 {
    state().generation.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_lock::config_test_guard;

    struct ConfigReset(LinkerConfig);

    impl ConfigReset {
        fn capture() -> Self {
            ConfigReset(linker_config_snapshot())
        }
    }

    impl Drop for ConfigReset {
        fn drop(&mut self) {
            let _ = install_linker_config(self.0.clone());
        }
    }

    #[test]
    fn builder_validates_limits() {
        assert!(matches!(
            LinkerConfig::builder().max_stack_bytes(0).build(),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            LinkerConfig::builder().invoker_cache_capacity(0).build(),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            LinkerConfig::builder().max_allocation_bytes(0).build(),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn env_overrides_are_parsed() {
        let vars = [
            ("DOWNCALL_MAX_STACK_BYTES", "1024"),
            ("DOWNCALL_INVOKER_CACHE", " 16 "),
            ("DOWNCALL_TRACE_CALLS", "yes"),
        ];
        let lookup = |key: &str| {
            vars.iter()
                .find(|(name, _)| *name == key)
                .map(|(_, value)| (*value).to_string())
        };
        let config = apply_env_overrides(LinkerConfig::default(), lookup).expect("overrides");
        assert_eq!(config.max_stack_bytes, 1024);
        assert_eq!(config.invoker_cache_capacity, 16);
        assert!(config.trace_calls);
        assert_eq!(config.max_allocation_bytes, DEFAULT_MAX_ALLOCATION_BYTES);
    }

    #[test]
    fn malformed_env_value_is_reported() {
        let lookup = |key: &str| (key == "DOWNCALL_MAX_STACK_BYTES").then(|| "lots".to_string());
        let err = apply_env_overrides(LinkerConfig::default(), lookup).expect_err("bad value");
        assert_eq!(
            err.to_string(),
            "environment variable DOWNCALL_MAX_STACK_BYTES has unusable value `lots`"
        );
    }

    #[test]
    fn install_updates_generation_and_snapshot() {
        let _guard = config_test_guard();
        let _reset = ConfigReset::capture();
        let start_generation = linker_config_generation();
        let config = LinkerConfig::builder()
            .max_stack_bytes(512)
            .invoker_cache_capacity(8)
            .max_allocation_bytes(4096)
            .trace_calls(true)
            .build()
            .expect("config");
        install_linker_config(config.clone()).expect("install");
        assert_eq!(linker_config_snapshot(), config);
        assert_eq!(with_linker_config(|cfg| cfg.max_allocation_bytes), 4096);
        assert_eq!(linker_config_generation(), start_generation + 1);
    }

    #[test]
    fn scopes_take_the_allocation_cap_from_the_installed_config() {
        use crate::error::Error;
        use crate::linker::Linker;
        use crate::memory::{AllocationError, Scope};

        let _guard = config_test_guard();
        let _reset = ConfigReset::capture();
        let installed = LinkerConfig::builder()
            .max_allocation_bytes(64 * 1024)
            .build()
            .expect("config");
        install_linker_config(installed).expect("install");

        let generous = LinkerConfig::builder()
            .max_allocation_bytes(1024 * 1024)
            .build()
            .expect("config");
        let linker = Linker::new(generous);
        assert_eq!(linker.config().max_allocation_bytes, 1024 * 1024);

        let scope = Scope::new_shared();
        assert!(matches!(
            scope.allocate_bytes(128 * 1024, 8),
            Err(Error::Allocation(AllocationError::TooLarge { limit: 65_536, .. }))
        ));
        scope.close().expect("close");
    }
}
