use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::condition::ConditionSet;
use crate::flag_value::{FlagType, FlagValue};

#[skip_serializing_none]
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureFlag {
    pub id: String,
    /// Unique, human-facing name that callers evaluate the flag by.
    pub name: String,
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub flag_type: FlagType,
    pub default_value: FlagValue,
    pub targeting: Targeting,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Targeting {
    pub enabled: bool,
    pub rules: Vec<Rule>,
}

/// A targeting rule. Rule order is significant: the first enabled rule that matches wins.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub enabled: bool,
    pub condition_set: ConditionSet,
    pub values_on_match: Vec<ValueOnMatch>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueOnMatch {
    pub value: FlagValue,
    pub rollout_percentage: f64,
}

impl FeatureFlag {
    /// Every value this flag can yield: its default value followed by each rule's rollout values.
    pub fn values(&self) -> impl Iterator<Item = &FlagValue> {
        std::iter::once(&self.default_value).chain(
            self.targeting
                .rules
                .iter()
                .flat_map(|rule| rule.values_on_match.iter().map(|v| &v.value)),
        )
    }

    #[cfg(test)]
    pub fn new_boolean_flag_with_rule(name: &str, condition_set: ConditionSet) -> Self {
        Self {
            id: format!("{}-id", name),
            name: name.to_string(),
            description: None,
            flag_type: FlagType::Boolean,
            default_value: FlagValue::Bool(false),
            targeting: Targeting {
                enabled: true,
                rules: vec![Rule {
                    enabled: true,
                    condition_set,
                    values_on_match: vec![ValueOnMatch {
                        value: FlagValue::Bool(true),
                        rollout_percentage: 100.0,
                    }],
                }],
            },
        }
    }
}
