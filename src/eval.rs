use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::context::EvaluationContext;
use crate::flag::FeatureFlag;
use crate::flag_value::FlagValue;
use crate::property::{LookupError, Property, PropertyType};
use crate::rollout::{rollout_group, select_value};
use crate::store::Store;

/// A data problem found while evaluating a condition. Warnings never change the outcome of an
/// evaluation beyond the affected condition evaluating to false.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum EvaluationWarning {
    /// The context has no value at the property's path.
    #[serde(rename_all = "camelCase")]
    PropertyValueNotFound {
        property_id: String,
        path: Vec<String>,
    },
    /// The context value at the property's path is not of the property's declared type.
    #[serde(rename_all = "camelCase")]
    PropertyValueIncorrectDataType {
        property_id: String,
        path: Vec<String>,
        expected_type: PropertyType,
    },
}

impl EvaluationWarning {
    pub(crate) fn new(property: &Property, error: LookupError) -> Self {
        match error {
            LookupError::NotFound => EvaluationWarning::PropertyValueNotFound {
                property_id: property.id.clone(),
                path: property.path.clone(),
            },
            LookupError::IncorrectDataType => EvaluationWarning::PropertyValueIncorrectDataType {
                property_id: property.id.clone(),
                path: property.path.clone(),
                expected_type: property.property_type,
            },
        }
    }
}

/// Trait used by [evaluate] to report [EvaluationWarning]s.
pub trait WarningRecorder {
    fn record(&self, warning: EvaluationWarning);
}

const PREALLOCATED_SEGMENT_CHAIN_SIZE: usize = 20;

/// State scoped to a single evaluation call.
///
/// The evaluation time is carried here rather than read from the clock inside the evaluator, and
/// the rollout group is computed once per call. The segment cache remembers each segment's result
/// for the rest of the call; it must not outlive the call, since the context it was computed for
/// does not.
pub struct EvaluationMetadata<'a> {
    pub evaluation_date_time: DateTime<Utc>,
    pub rollout_group: f64,
    segment_cache: Option<HashMap<String, bool>>,
    pub(crate) segment_chain: HashSet<String>,
    warning_recorder: Option<&'a dyn WarningRecorder>,
}

impl<'a> EvaluationMetadata<'a> {
    pub fn new(evaluation_date_time: DateTime<Utc>, rollout_group: f64) -> Self {
        Self {
            evaluation_date_time,
            rollout_group,
            segment_cache: Some(HashMap::new()),
            segment_chain: HashSet::with_capacity(PREALLOCATED_SEGMENT_CHAIN_SIZE),
            warning_recorder: None,
        }
    }

    /// Metadata for evaluating against `context` now, with the rollout group computed from it.
    pub fn for_context(store: &dyn Store, context: &EvaluationContext) -> Self {
        Self::new(Utc::now(), rollout_group(store, context))
    }

    pub fn without_segment_cache(mut self) -> Self {
        self.segment_cache = None;
        self
    }

    pub fn with_warning_recorder(mut self, recorder: &'a dyn WarningRecorder) -> Self {
        self.warning_recorder = Some(recorder);
        self
    }

    pub(crate) fn cached_segment(&self, segment_id: &str) -> Option<bool> {
        self.segment_cache.as_ref()?.get(segment_id).copied()
    }

    pub(crate) fn cache_segment(&mut self, segment_id: &str, result: bool) {
        if let Some(cache) = self.segment_cache.as_mut() {
            cache.insert(segment_id.to_string(), result);
        }
    }

    pub(crate) fn warn(&self, warning: EvaluationWarning) {
        if let Some(recorder) = self.warning_recorder {
            recorder.record(warning);
        }
    }
}

/// Evaluate a feature flag for the specified [EvaluationContext].
///
/// Rules are tried in declaration order and the first enabled rule whose condition set matches
/// selects the value from its rollout. When targeting is disabled or no rule matches, the flag's
/// default value is returned.
pub fn evaluate<'a>(
    store: &dyn Store,
    flag: &'a FeatureFlag,
    context: &EvaluationContext,
    metadata: &mut EvaluationMetadata,
) -> Detail<&'a FlagValue> {
    if !flag.targeting.enabled {
        return Detail::new(&flag.default_value, Reason::TargetingDisabled);
    }

    for (rule_index, rule) in flag.targeting.rules.iter().enumerate() {
        if !rule.enabled {
            continue;
        }
        if rule.condition_set.evaluate(store, context, metadata) {
            let value = select_value(
                &rule.values_on_match,
                metadata.rollout_group,
                &flag.default_value,
            );
            return Detail::new(value, Reason::RuleMatch { rule_index });
        }
    }

    Detail::new(&flag.default_value, Reason::Default)
}

/// A Detail instance is returned from [evaluate], combining the result of a flag evaluation with
/// an explanation of how it was calculated.
#[derive(Clone, Debug, PartialEq)]
pub struct Detail<T> {
    /// The result of the flag evaluation. Always present; when evaluation failed it holds the
    /// fallback and [Detail::reason] is a [Reason::Error].
    pub value: T,

    /// A reason struct describing the main factor that influenced the flag evaluation value.
    pub reason: Reason,
}

impl<T> Detail<T> {
    pub fn new(value: T, reason: Reason) -> Detail<T> {
        Detail { value, reason }
    }

    /// Returns a detail response using the provided fallback as the value and the provided error
    /// as the reason.
    pub fn err_default(error: Error, default: T) -> Detail<T> {
        Detail {
            value: default,
            reason: Reason::Error { error },
        }
    }

    /// Returns a new instance of this detail with the provided function `f` applied to
    /// [Detail::value].
    pub fn map<U, F>(self, f: F) -> Detail<U>
    where
        F: FnOnce(T) -> U,
    {
        Detail {
            value: f(self.value),
            reason: self.reason,
        }
    }
}

/// Reason describes the reason that a flag evaluation produced a particular value.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "kind")]
pub enum Reason {
    /// The flag's targeting was disabled, so its default value was returned.
    TargetingDisabled,
    /// The context matched one of the flag's rules.
    #[serde(rename_all = "camelCase")]
    RuleMatch {
        /// Zero-based index of the [crate::Rule] that was matched.
        rule_index: usize,
    },
    /// Targeting was enabled but no rule matched, so the flag's default value was returned.
    Default,
    /// The flag could not be evaluated and an emergency fallback was returned instead.
    Error {
        #[serde(rename = "errorKind")]
        error: Error,
    },
}

/// Error is returned via a [Reason::Error] when a flag could not be evaluated, and describes why.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Error {
    /// No specification has been loaded successfully yet.
    SpecNotAvailable,
    /// No flag with the requested name exists in the specification.
    FlagNotFound,
    /// The flag exists but is declared with a different type than was requested.
    WrongType,
    /// An unexpected failure stopped the evaluation; check the log for details.
    Exception,
}
