use std::collections::{HashMap, HashSet};

use serde::Deserialize;
use serde_json::error::Category;
use serde_json::Value;
use thiserror::Error;

use crate::condition::{Condition, ConditionSet};
use crate::flag_value::FlagType;
use crate::property::PropertyType;
use crate::spec::Specification;
use crate::store::Store;

/// The only schema version this crate understands.
pub const SUPPORTED_SCHEMA_VERSION: u32 = 1;

const ROLLOUT_SUM_TOLERANCE: f64 = 1e-9;

/// Why a raw payload could not become a [Specification].
#[derive(Clone, Debug, PartialEq, Error)]
pub enum ValidationError {
    #[error("malformed specification payload: {0}")]
    Malformed(String),

    #[error("specification does not match the schema: {0}")]
    Schema(String),

    #[error("unsupported schema version {0}, expected {expected}", expected = SUPPORTED_SCHEMA_VERSION)]
    UnsupportedSchemaVersion(u32),

    #[error("duplicate {kind} id '{id}'")]
    DuplicateId { kind: &'static str, id: String },

    #[error("duplicate feature flag name '{0}'")]
    DuplicateFlagName(String),

    #[error("feature flag '{flag_id}' has a value that is not of its type {expected}")]
    ValueTypeMismatch { flag_id: String, expected: FlagType },

    #[error("feature flag '{flag_id}' rule {rule_index} has rollout percentage {percentage} outside [0, 100]")]
    InvalidRolloutPercentage {
        flag_id: String,
        rule_index: usize,
        percentage: f64,
    },

    #[error("feature flag '{flag_id}' rule {rule_index} rollout percentages sum to {sum}, not 100")]
    RolloutPercentageSum {
        flag_id: String,
        rule_index: usize,
        sum: f64,
    },

    #[error("condition references unknown property '{0}'")]
    UnknownProperty(String),

    #[error("condition expects property '{property_id}' to be {expected} but it is declared {actual}")]
    PropertyTypeMismatch {
        property_id: String,
        expected: PropertyType,
        actual: PropertyType,
    },

    #[error("condition references unknown segment '{0}'")]
    UnknownSegment(String),

    #[error("segment '{0}' references itself through its conditions")]
    SegmentCycle(String),
}

impl From<serde_json::Error> for ValidationError {
    fn from(e: serde_json::Error) -> Self {
        match e.classify() {
            Category::Data => ValidationError::Schema(e.to_string()),
            Category::Syntax | Category::Eof | Category::Io => {
                ValidationError::Malformed(e.to_string())
            }
        }
    }
}

/// Structural validation of JSON text: the text must parse and have the shape of a
/// specification.
pub fn parse_str(json: &str) -> Result<Specification, ValidationError> {
    Ok(serde_json::from_str(json)?)
}

/// Structural validation of an already-parsed JSON value.
pub fn parse_value(json: &Value) -> Result<Specification, ValidationError> {
    Ok(Specification::deserialize(json)?)
}

/// Semantic validation: checks everything about `spec` that its shape alone cannot express.
///
/// Evaluation assumes a specification that passed this check: unique ids, well-typed flag values,
/// complete rollouts, resolvable references and no segment cycles.
pub fn validate(spec: &Specification) -> Result<(), ValidationError> {
    if spec.schema_version() != SUPPORTED_SCHEMA_VERSION {
        return Err(ValidationError::UnsupportedSchemaVersion(
            spec.schema_version(),
        ));
    }

    unique_ids("property", spec.properties().iter().map(|p| p.id.as_str()))?;
    unique_ids("segment", spec.segments().iter().map(|s| s.id.as_str()))?;
    unique_ids("feature flag", spec.feature_flags().iter().map(|f| f.id.as_str()))?;

    let mut names = HashSet::new();
    for flag in spec.feature_flags() {
        if !names.insert(flag.name.as_str()) {
            return Err(ValidationError::DuplicateFlagName(flag.name.clone()));
        }
    }

    for flag in spec.feature_flags() {
        if flag.values().any(|value| !value.is_type(flag.flag_type)) {
            return Err(ValidationError::ValueTypeMismatch {
                flag_id: flag.id.clone(),
                expected: flag.flag_type,
            });
        }

        for (rule_index, rule) in flag.targeting.rules.iter().enumerate() {
            let percentages = rule.values_on_match.iter().map(|v| v.rollout_percentage);
            check_rollout(&flag.id, rule_index, percentages)?;
            check_references(spec, &rule.condition_set)?;
        }
    }

    for segment in spec.segments() {
        check_references(spec, &segment.condition_set)?;
    }

    check_segment_cycles(spec)
}

fn unique_ids<'a>(
    kind: &'static str,
    ids: impl Iterator<Item = &'a str>,
) -> Result<(), ValidationError> {
    let mut seen = HashSet::new();
    for id in ids {
        if !seen.insert(id) {
            return Err(ValidationError::DuplicateId {
                kind,
                id: id.to_string(),
            });
        }
    }
    Ok(())
}

// An empty rollout is allowed: the rule then yields the flag's default value.
fn check_rollout(
    flag_id: &str,
    rule_index: usize,
    percentages: impl Iterator<Item = f64>,
) -> Result<(), ValidationError> {
    let mut sum = 0.0;
    let mut any = false;
    for percentage in percentages {
        if !(0.0..=100.0).contains(&percentage) {
            return Err(ValidationError::InvalidRolloutPercentage {
                flag_id: flag_id.to_string(),
                rule_index,
                percentage,
            });
        }
        sum += percentage;
        any = true;
    }
    if any && (sum - 100.0).abs() > ROLLOUT_SUM_TOLERANCE {
        return Err(ValidationError::RolloutPercentageSum {
            flag_id: flag_id.to_string(),
            rule_index,
            sum,
        });
    }
    Ok(())
}

fn check_references(
    spec: &Specification,
    condition_set: &ConditionSet,
) -> Result<(), ValidationError> {
    let mut result = Ok(());
    condition_set.walk(&mut |condition| {
        if result.is_err() {
            return;
        }
        result = check_reference(spec, condition);
    });
    result
}

fn check_reference(spec: &Specification, condition: &Condition) -> Result<(), ValidationError> {
    if let Some((property_id, expected)) = condition.property_reference() {
        let property = spec
            .property(property_id)
            .ok_or_else(|| ValidationError::UnknownProperty(property_id.to_string()))?;
        if property.property_type != expected {
            return Err(ValidationError::PropertyTypeMismatch {
                property_id: property_id.to_string(),
                expected,
                actual: property.property_type,
            });
        }
    }
    if let Condition::Segment(c) = condition {
        if spec.segment(&c.segment_id).is_none() {
            return Err(ValidationError::UnknownSegment(c.segment_id.clone()));
        }
    }
    Ok(())
}

#[derive(Clone, Copy, PartialEq)]
enum Visit {
    InProgress,
    Done,
}

fn check_segment_cycles(spec: &Specification) -> Result<(), ValidationError> {
    let mut edges: HashMap<&str, Vec<&str>> = HashMap::new();
    for segment in spec.segments() {
        let mut referenced = Vec::new();
        segment.condition_set.walk(&mut |condition| {
            if let Condition::Segment(c) = condition {
                referenced.push(c.segment_id.as_str());
            }
        });
        edges.insert(segment.id.as_str(), referenced);
    }

    let mut state: HashMap<&str, Visit> = HashMap::new();
    for segment in spec.segments() {
        visit_segment(segment.id.as_str(), &edges, &mut state)?;
    }
    Ok(())
}

fn visit_segment<'a>(
    id: &'a str,
    edges: &HashMap<&'a str, Vec<&'a str>>,
    state: &mut HashMap<&'a str, Visit>,
) -> Result<(), ValidationError> {
    match state.get(id) {
        Some(Visit::Done) => return Ok(()),
        Some(Visit::InProgress) => return Err(ValidationError::SegmentCycle(id.to_string())),
        None => {}
    }
    state.insert(id, Visit::InProgress);
    for &next in edges.get(id).into_iter().flatten() {
        visit_segment(next, edges, state)?;
    }
    state.insert(id, Visit::Done);
    Ok(())
}
