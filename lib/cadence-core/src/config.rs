//! Runtime configuration.
use std::time::Duration;

use cadence_config::{ConfigurationError, ConfigurationLoader};
use serde::{Deserialize, Serialize};

/// Prefix of the environment variables read by [`RuntimeConfiguration::from_environment`].
pub const ENV_PREFIX: &str = "CADENCE";

/// Top-level runtime configuration.
///
/// Every field has a default, so an empty configuration source is valid.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct RuntimeConfiguration {
    /// Scheduler settings.
    pub scheduler: SchedulerConfiguration,

    /// Default supervisor retry settings.
    pub supervisor: SupervisorConfiguration,

    /// Default task scope settings.
    pub scope: ScopeConfiguration,
}

impl RuntimeConfiguration {
    /// Loads the configuration from a configuration loader, layered over the defaults.
    ///
    /// # Errors
    ///
    /// If the loaded configuration is not valid, an error will be returned.
    pub fn from_loader(loader: ConfigurationLoader) -> Result<Self, ConfigurationError> {
        loader.into_typed()
    }

    /// Loads the configuration from `CADENCE_`-prefixed environment variables, layered over the defaults.
    ///
    /// Nested fields are separated by a double underscore: `CADENCE_SUPERVISOR__MAX_ATTEMPTS=5`.
    ///
    /// # Errors
    ///
    /// If the environment contains invalid values, an error will be returned.
    pub fn from_environment() -> Result<Self, ConfigurationError> {
        let loader = ConfigurationLoader::default()
            .with_default(Self::default())
            .from_environment(ENV_PREFIX)?;
        Self::from_loader(loader)
    }
}

/// Scheduler settings.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct SchedulerConfiguration {
    /// Name of the scheduler, attached to its logs.
    ///
    /// Defaults to `cadence`.
    pub name: String,

    /// Maximum number of task steps a single call to `run` will execute.
    ///
    /// Defaults to unlimited.
    pub max_steps: Option<u64>,

    /// Maximum time, in milliseconds, to block on the inbox at once while waiting for external completions.
    ///
    /// Defaults to 50 milliseconds.
    pub park_timeout_ms: u64,

    /// Number of completed tasks whose terminal state is remembered, for reporting invalid operations on them by
    /// identifier.
    ///
    /// Defaults to 1024.
    pub completed_history: usize,
}

impl Default for SchedulerConfiguration {
    fn default() -> Self {
        Self {
            name: "cadence".to_string(),
            max_steps: None,
            park_timeout_ms: 50,
            completed_history: 1024,
        }
    }
}

/// Supervisor retry settings.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct SupervisorConfiguration {
    /// Maximum number of attempts, including the first one.
    ///
    /// Defaults to 3.
    pub max_attempts: u32,

    /// Minimum backoff between attempts, in milliseconds.
    ///
    /// Defaults to 10 milliseconds.
    pub min_backoff_ms: u64,

    /// Maximum backoff between attempts, in milliseconds.
    ///
    /// Defaults to 1000 milliseconds.
    pub max_backoff_ms: u64,

    /// Jitter factor applied to backoff durations.
    ///
    /// A factor of `F` spreads each backoff duration `D` over `[D/F, D]`. Values of 1.0 or less disable jitter.
    ///
    /// Defaults to 1.0.
    pub jitter_factor: f64,

    /// Whether a supervisor that runs out of attempts fails with a `MaxRetriesExceeded` error wrapping the last
    /// attempt's error, rather than with that error directly.
    ///
    /// Defaults to `false`.
    pub wrap_exhausted_error: bool,
}

impl SupervisorConfiguration {
    /// Returns the minimum backoff duration.
    pub fn min_backoff(&self) -> Duration {
        Duration::from_millis(self.min_backoff_ms)
    }

    /// Returns the maximum backoff duration.
    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

impl Default for SupervisorConfiguration {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_backoff_ms: 10,
            max_backoff_ms: 1000,
            jitter_factor: 1.0,
            wrap_exhausted_error: false,
        }
    }
}

/// Task scope settings.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct ScopeConfiguration {
    /// How a scope reacts to one of its tasks failing.
    pub policy: ScopePolicy,
}

/// How a [`TaskScope`][crate::group::TaskScope] reacts to one of its tasks failing.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopePolicy {
    /// Let every task run to completion, and report all failures together.
    #[default]
    WaitAll,

    /// Cancel the remaining tasks as soon as one fails.
    CancelOnFailure,
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn defaults() {
        let config = RuntimeConfiguration::default();
        assert_eq!(config.scheduler.name, "cadence");
        assert_eq!(config.scheduler.max_steps, None);
        assert_eq!(config.scheduler.completed_history, 1024);
        assert_eq!(config.supervisor.max_attempts, 3);
        assert_eq!(config.supervisor.min_backoff(), Duration::from_millis(10));
        assert_eq!(config.supervisor.max_backoff(), Duration::from_secs(1));
        assert_eq!(config.scope.policy, ScopePolicy::WaitAll);
    }

    #[test]
    fn partial_sources_keep_defaults() {
        let loader = ConfigurationLoader::default()
            .with_default(RuntimeConfiguration::default())
            .with_default(serde_json_like());
        let config = RuntimeConfiguration::from_loader(loader).unwrap();

        let mut expected = RuntimeConfiguration::default();
        expected.scheduler.max_steps = Some(500);
        expected.supervisor.wrap_exhausted_error = true;
        expected.scope.policy = ScopePolicy::CancelOnFailure;
        assert_eq!(config, expected);
    }

    // Partial override, shaped the way a YAML or JSON file would be.
    fn serde_json_like() -> std::collections::BTreeMap<&'static str, std::collections::BTreeMap<&'static str, Value>> {
        let mut root = std::collections::BTreeMap::new();
        root.insert("scheduler", [("max_steps", Value::Int(500))].into_iter().collect());
        root.insert("supervisor", [("wrap_exhausted_error", Value::Bool(true))].into_iter().collect());
        root.insert("scope", [("policy", Value::Str("cancel_on_failure"))].into_iter().collect());
        root
    }

    #[derive(Serialize)]
    #[serde(untagged)]
    enum Value {
        Int(u64),
        Bool(bool),
        Str(&'static str),
    }

    #[test]
    fn environment_overrides() {
        std::env::set_var("CADENCE_SUPERVISOR__MAX_ATTEMPTS", "7");
        std::env::set_var("CADENCE_SCOPE__POLICY", "cancel_on_failure");

        let config = RuntimeConfiguration::from_environment().unwrap();
        assert_eq!(config.supervisor.max_attempts, 7);
        assert_eq!(config.scope.policy, ScopePolicy::CancelOnFailure);
        assert_eq!(config.scheduler.park_timeout_ms, 50);

        std::env::remove_var("CADENCE_SUPERVISOR__MAX_ATTEMPTS");
        std::env::remove_var("CADENCE_SCOPE__POLICY");
    }
}
