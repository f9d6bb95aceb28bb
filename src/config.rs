use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::flag_value::{FlagType, FlagValue};

/// What an evaluation does when the requested type differs from the flag's declared type.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TypeMismatchPolicy {
    /// Return the emergency fallback for the requested type.
    #[default]
    EmergencyFallback,
    /// Return [crate::EvaluationError::TypeMismatch].
    Error,
}

/// How [crate::ClientEvent]s are delivered to the event recorder.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CallbackMode {
    /// Deliver from a task spawned on the ambient tokio runtime, so a slow recorder never holds up
    /// the triggering call.
    ///
    /// On a current-thread runtime the task first runs after the triggering call has returned. A
    /// multi-thread runtime may run it on another worker while the call is still in progress, so
    /// there only delivery off the calling task is guaranteed. Outside any runtime events are
    /// delivered inline.
    #[default]
    NonBlocking,
    /// Deliver inline, before the triggering call continues.
    Blocking,
}

/// Emergency fallback values per flag type.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TypeFallbacks {
    pub boolean: bool,
    pub number: f64,
    pub string: String,
}

impl Default for TypeFallbacks {
    fn default() -> Self {
        Self {
            boolean: false,
            number: 0.0,
            string: String::new(),
        }
    }
}

impl TypeFallbacks {
    pub fn value_for(&self, flag_type: FlagType) -> FlagValue {
        match flag_type {
            FlagType::Boolean => FlagValue::Bool(self.boolean),
            FlagType::Number => FlagValue::Number(self.number),
            FlagType::String => FlagValue::Str(self.string.clone()),
        }
    }
}

/// Client configuration.
///
/// Millisecond settings are signed where a negative value has a meaning of its own: a negative
/// loader timeout disables the timeout, and a negative stale time makes the cached specification
/// stale immediately.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientConfig {
    /// How long one loader try may take.
    pub loader_timeout_ms: i64,

    /// Tries after the first one before a load sequence gives up.
    pub max_retries: u32,

    /// Pause between two tries of a load sequence.
    pub retry_delay_ms: u64,

    /// Age after which the cached specification is refreshed.
    pub cache_stale_time_ms: i64,

    /// How long an evaluation waits for a refresh of a stale specification. Zero or less never
    /// waits.
    pub refresh_wait_ms: i64,

    /// Start loading as soon as the client is built.
    pub initial_load: bool,

    pub emergency_fallbacks_by_name: HashMap<String, FlagValue>,

    pub emergency_fallbacks_by_type: TypeFallbacks,

    pub type_mismatch_policy: TypeMismatchPolicy,

    pub callback_mode: CallbackMode,

    /// Accept any structurally well-formed specification without semantic validation.
    pub dangerously_skip_validation: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            loader_timeout_ms: 15_000,
            max_retries: 5,
            retry_delay_ms: 2_500,
            cache_stale_time_ms: 15_000,
            refresh_wait_ms: 1_500,
            initial_load: true,
            emergency_fallbacks_by_name: HashMap::new(),
            emergency_fallbacks_by_type: TypeFallbacks::default(),
            type_mismatch_policy: TypeMismatchPolicy::default(),
            callback_mode: CallbackMode::default(),
            dangerously_skip_validation: false,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-try loader timeout; negative disables it
    pub fn with_loader_timeout_ms(mut self, timeout_ms: i64) -> Self {
        self.loader_timeout_ms = timeout_ms;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay_ms(mut self, delay_ms: u64) -> Self {
        self.retry_delay_ms = delay_ms;
        self
    }

    /// Set the cache stale time; negative makes every cached specification stale
    pub fn with_cache_stale_time_ms(mut self, stale_time_ms: i64) -> Self {
        self.cache_stale_time_ms = stale_time_ms;
        self
    }

    pub fn with_refresh_wait_ms(mut self, wait_ms: i64) -> Self {
        self.refresh_wait_ms = wait_ms;
        self
    }

    pub fn with_initial_load(mut self, initial_load: bool) -> Self {
        self.initial_load = initial_load;
        self
    }

    /// Register a fallback for the flag named `flag_name`.
    pub fn with_emergency_fallback(
        mut self,
        flag_name: impl Into<String>,
        value: impl Into<FlagValue>,
    ) -> Self {
        self.emergency_fallbacks_by_name
            .insert(flag_name.into(), value.into());
        self
    }

    pub fn with_type_fallbacks(mut self, fallbacks: TypeFallbacks) -> Self {
        self.emergency_fallbacks_by_type = fallbacks;
        self
    }

    pub fn with_type_mismatch_policy(mut self, policy: TypeMismatchPolicy) -> Self {
        self.type_mismatch_policy = policy;
        self
    }

    pub fn with_callback_mode(mut self, mode: CallbackMode) -> Self {
        self.callback_mode = mode;
        self
    }

    pub fn with_dangerously_skip_validation(mut self, skip: bool) -> Self {
        self.dangerously_skip_validation = skip;
        self
    }

    pub(crate) fn loader_timeout(&self) -> Option<Duration> {
        u64::try_from(self.loader_timeout_ms)
            .ok()
            .map(Duration::from_millis)
    }

    pub(crate) fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// None when every cached specification is stale.
    pub(crate) fn cache_stale_time(&self) -> Option<Duration> {
        u64::try_from(self.cache_stale_time_ms)
            .ok()
            .map(Duration::from_millis)
    }

    pub(crate) fn refresh_wait(&self) -> Option<Duration> {
        u64::try_from(self.refresh_wait_ms)
            .ok()
            .filter(|&ms| ms > 0)
            .map(Duration::from_millis)
    }

    /// The emergency fallback for the flag named `flag_name` evaluated as `flag_type`.
    ///
    /// A by-name fallback is used only when `consult_by_name` is set and it has the requested
    /// type; otherwise the by-type fallback applies.
    pub(crate) fn emergency_fallback(
        &self,
        flag_name: &str,
        flag_type: FlagType,
        consult_by_name: bool,
    ) -> FlagValue {
        if consult_by_name {
            if let Some(value) = self.emergency_fallbacks_by_name.get(flag_name) {
                if value.is_type(flag_type) {
                    return value.clone();
                }
            }
        }
        self.emergency_fallbacks_by_type.value_for(flag_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::hashmap;
    use serde_json::json;
    use spectral::prelude::*;

    #[test]
    fn defaults() {
        let config = ClientConfig::default();
        assert_that!(config.loader_timeout()).contains_value(Duration::from_millis(15_000));
        assert_that!(config.max_retries).is_equal_to(5);
        assert_that!(config.retry_delay()).is_equal_to(Duration::from_millis(2_500));
        assert_that!(config.cache_stale_time()).contains_value(Duration::from_millis(15_000));
        assert_that!(config.refresh_wait()).contains_value(Duration::from_millis(1_500));
        assert!(config.initial_load);
        assert_that!(config.type_mismatch_policy).is_equal_to(TypeMismatchPolicy::EmergencyFallback);
        assert_that!(config.callback_mode).is_equal_to(CallbackMode::NonBlocking);
        assert!(!config.dangerously_skip_validation);
    }

    #[test]
    fn negative_sentinels() {
        let config = ClientConfig::new()
            .with_loader_timeout_ms(-1)
            .with_cache_stale_time_ms(-1)
            .with_refresh_wait_ms(0);
        assert_that!(config.loader_timeout()).is_none();
        assert_that!(config.cache_stale_time()).is_none();
        assert_that!(config.refresh_wait()).is_none();

        let config = ClientConfig::new().with_refresh_wait_ms(-5);
        assert_that!(config.refresh_wait()).is_none();
    }

    #[test]
    fn deserializes_partial_config() {
        let config: ClientConfig = serde_json::from_value(json!({
            "maxRetries": 0,
            "cacheStaleTimeMs": 250,
            "emergencyFallbacksByName": {"ai-pilot": true, "max-upload-mb": 10},
            "emergencyFallbacksByType": {"string": "unknown"},
            "typeMismatchPolicy": "error",
            "callbackMode": "blocking"
        }))
        .unwrap();

        assert_that!(config.max_retries).is_equal_to(0);
        assert_that!(config.cache_stale_time_ms).is_equal_to(250);
        assert_that!(config.loader_timeout_ms).is_equal_to(15_000);
        assert_that!(config.emergency_fallbacks_by_name).is_equal_to(hashmap! {
            "ai-pilot".to_string() => FlagValue::Bool(true),
            "max-upload-mb".to_string() => FlagValue::Number(10.0),
        });
        assert_that!(config.emergency_fallbacks_by_type).is_equal_to(TypeFallbacks {
            boolean: false,
            number: 0.0,
            string: "unknown".into(),
        });
        assert_that!(config.type_mismatch_policy).is_equal_to(TypeMismatchPolicy::Error);
        assert_that!(config.callback_mode).is_equal_to(CallbackMode::Blocking);
    }

    #[test]
    fn fallback_resolution() {
        let config = ClientConfig::new()
            .with_emergency_fallback("ai-pilot", true)
            .with_emergency_fallback("theme", "dark")
            .with_type_fallbacks(TypeFallbacks {
                boolean: false,
                number: -1.0,
                string: "none".into(),
            });

        assert_that!(config.emergency_fallback("ai-pilot", FlagType::Boolean, true))
            .is_equal_to(FlagValue::Bool(true));
        assert_that!(config.emergency_fallback("ai-pilot", FlagType::Boolean, false))
            .is_equal_to(FlagValue::Bool(false));
        assert_that!(config.emergency_fallback("ai-pilot", FlagType::Number, true))
            .is_equal_to(FlagValue::Number(-1.0));
        assert_that!(config.emergency_fallback("theme", FlagType::String, true))
            .is_equal_to(FlagValue::from("dark"));
        assert_that!(config.emergency_fallback("unknown", FlagType::String, true))
            .is_equal_to(FlagValue::from("none"));
    }
}
