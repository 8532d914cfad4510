use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::error::{Result, SpaceError};
use crate::memory::manager::{DEFAULT_ARENA_BASE, DEFAULT_ARENA_LIMIT, DEFAULT_MAX_OBJECT_SIZE};

/// Candidate filtering applied by pointer resolution. Handed to each `AddressSpace` at
/// construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolutionConfig {
    /// Skip objects allocated after the object anchoring the pointer's base.
    pub use_timestamps: bool,
    /// Only consider objects registered as symbolic.
    pub skip_not_symbolic_objects: bool,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            use_timestamps: true,
            skip_not_symbolic_objects: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpaceConfig {
    pub resolution: ResolutionConfig,
    /// Cap on objects returned by `resolve`; 0 means unlimited.
    pub max_resolutions: usize,
    pub resolve_timeout_ms: Option<u64>,
    /// Binary-search the smallest total size when repairing symcretes.
    pub minimize_repairs: bool,
    pub solver_timeout_ms: Option<u64>,
    /// Queries slower than this are logged at info level.
    pub slow_query_ms: u64,
    pub arena_base: u64,
    pub arena_limit: u64,
    /// Largest object the memory manager hands out, growth reallocations included.
    pub max_object_size: u64,
}

impl Default for SpaceConfig {
    fn default() -> Self {
        Self {
            resolution: ResolutionConfig::default(),
            max_resolutions: 0,
            resolve_timeout_ms: None,
            minimize_repairs: true,
            solver_timeout_ms: Some(30_000),
            slow_query_ms: 1_000,
            arena_base: DEFAULT_ARENA_BASE,
            arena_limit: DEFAULT_ARENA_LIMIT,
            max_object_size: DEFAULT_MAX_OBJECT_SIZE,
        }
    }
}

fn env_bool(name: &str) -> Option<bool> {
    env::var(name)
        .ok()
        .and_then(|raw| match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        })
}

fn env_u64(name: &str) -> Option<u64> {
    env::var(name).ok().and_then(|raw| {
        let trimmed = raw.trim();
        match trimmed.strip_prefix("0x") {
            Some(hex) => u64::from_str_radix(hex, 16).ok(),
            None => trimmed.parse::<u64>().ok(),
        }
    })
}

/// `0` disables an optional timeout.
fn env_timeout(name: &str, fallback: Option<u64>) -> Option<u64> {
    match env_u64(name) {
        Some(0) => None,
        Some(ms) => Some(ms),
        None => fallback,
    }
}

impl SpaceConfig {
    /// Defaults overridden by `SYMSPACE_*` environment variables. Unparseable values fall
    /// back to the default.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let resolution = ResolutionConfig {
            use_timestamps: env_bool("SYMSPACE_USE_TIMESTAMPS")
                .unwrap_or(defaults.resolution.use_timestamps),
            skip_not_symbolic_objects: env_bool("SYMSPACE_SKIP_NOT_SYMBOLIC_OBJECTS")
                .unwrap_or(defaults.resolution.skip_not_symbolic_objects),
        };
        Self {
            resolution,
            max_resolutions: env_u64("SYMSPACE_MAX_RESOLUTIONS")
                .map(|v| v as usize)
                .unwrap_or(defaults.max_resolutions),
            resolve_timeout_ms: env_timeout(
                "SYMSPACE_RESOLVE_TIMEOUT_MS",
                defaults.resolve_timeout_ms,
            ),
            minimize_repairs: env_bool("SYMSPACE_MINIMIZE_REPAIRS")
                .unwrap_or(defaults.minimize_repairs),
            solver_timeout_ms: env_timeout(
                "SYMSPACE_SOLVER_TIMEOUT_MS",
                defaults.solver_timeout_ms,
            ),
            slow_query_ms: env_u64("SYMSPACE_SLOW_QUERY_MS").unwrap_or(defaults.slow_query_ms),
            arena_base: env_u64("SYMSPACE_ARENA_BASE").unwrap_or(defaults.arena_base),
            arena_limit: env_u64("SYMSPACE_ARENA_LIMIT").unwrap_or(defaults.arena_limit),
            max_object_size: env_u64("SYMSPACE_MAX_OBJECT_SIZE")
                .unwrap_or(defaults.max_object_size),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.arena_base == 0 {
            return Err(SpaceError::Config(
                "arena base must be non-zero so null never resolves".into(),
            ));
        }
        if self.arena_base >= self.arena_limit {
            return Err(SpaceError::Config(format!(
                "arena base {:#x} must be below arena limit {:#x}",
                self.arena_base, self.arena_limit
            )));
        }
        if self.max_object_size == 0 || self.max_object_size > self.arena_limit - self.arena_base {
            return Err(SpaceError::Config(format!(
                "max object size {:#x} must be non-zero and fit in the arena",
                self.max_object_size
            )));
        }
        if self.solver_timeout_ms.is_some_and(|ms| ms > u32::MAX as u64) {
            return Err(SpaceError::Config(
                "solver timeout must fit in 32 bits of milliseconds".into(),
            ));
        }
        Ok(())
    }

    pub fn resolve_timeout(&self) -> Option<Duration> {
        self.resolve_timeout_ms.map(Duration::from_millis)
    }

    pub fn solver_timeout(&self) -> Option<Duration> {
        self.solver_timeout_ms.map(Duration::from_millis)
    }

    pub fn slow_query_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_query_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn env_overrides_defaults() {
        let _guard = ENV_LOCK.lock().expect("env lock");
        env::set_var("SYMSPACE_USE_TIMESTAMPS", "off");
        env::set_var("SYMSPACE_MAX_RESOLUTIONS", " 4 ");
        env::set_var("SYMSPACE_SOLVER_TIMEOUT_MS", "0");
        env::set_var("SYMSPACE_ARENA_BASE", "0x2000");
        let config = SpaceConfig::from_env();
        env::remove_var("SYMSPACE_USE_TIMESTAMPS");
        env::remove_var("SYMSPACE_MAX_RESOLUTIONS");
        env::remove_var("SYMSPACE_SOLVER_TIMEOUT_MS");
        env::remove_var("SYMSPACE_ARENA_BASE");

        assert!(!config.resolution.use_timestamps);
        assert_eq!(config.max_resolutions, 4);
        assert_eq!(config.solver_timeout_ms, None);
        assert_eq!(config.arena_base, 0x2000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn garbage_falls_back_to_defaults() {
        let _guard = ENV_LOCK.lock().expect("env lock");
        env::set_var("SYMSPACE_MINIMIZE_REPAIRS", "maybe");
        let config = SpaceConfig::from_env();
        env::remove_var("SYMSPACE_MINIMIZE_REPAIRS");
        assert!(config.minimize_repairs);
    }

    #[test]
    fn validate_rejects_inverted_arena() {
        let config = SpaceConfig {
            arena_base: 0x9000,
            arena_limit: 0x1000,
            ..SpaceConfig::default()
        };
        assert!(matches!(config.validate(), Err(SpaceError::Config(_))));
    }

    #[test]
    fn validate_rejects_object_limit_outside_arena() {
        let empty = SpaceConfig {
            max_object_size: 0,
            ..SpaceConfig::default()
        };
        assert!(matches!(empty.validate(), Err(SpaceError::Config(_))));
        let oversized = SpaceConfig {
            arena_base: 0x1000,
            arena_limit: 0x2000,
            max_object_size: 0x2000,
            ..SpaceConfig::default()
        };
        assert!(matches!(oversized.validate(), Err(SpaceError::Config(_))));
        assert!(SpaceConfig::default().validate().is_ok());
    }

    #[test]
    fn deserializes_partial_json() {
        let config: SpaceConfig =
            serde_json::from_str(r#"{"resolution":{"skip_not_symbolic_objects":true}}"#).unwrap();
        assert!(config.resolution.skip_not_symbolic_objects);
        assert!(config.resolution.use_timestamps);
        assert_eq!(config.max_resolutions, 0);
        assert!(config.minimize_repairs);
    }
}
