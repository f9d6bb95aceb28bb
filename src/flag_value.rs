use std::cmp::Ordering;
use std::fmt;

use log::warn;
use serde::{Deserialize, Serialize};

/// The declared type of a feature flag. Every value a flag can yield has this type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FlagType {
    Boolean,
    Number,
    String,
}

impl fmt::Display for FlagType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FlagType::Boolean => write!(f, "boolean"),
            FlagType::Number => write!(f, "number"),
            FlagType::String => write!(f, "string"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum FlagValue {
    Bool(bool),
    Number(f64),
    Str(String),
}

impl From<bool> for FlagValue {
    fn from(b: bool) -> FlagValue {
        FlagValue::Bool(b)
    }
}

impl From<String> for FlagValue {
    fn from(s: String) -> FlagValue {
        FlagValue::Str(s)
    }
}

impl From<&str> for FlagValue {
    fn from(s: &str) -> FlagValue {
        FlagValue::Str(s.to_owned())
    }
}

impl From<f64> for FlagValue {
    fn from(f: f64) -> FlagValue {
        FlagValue::Number(f)
    }
}

impl From<i64> for FlagValue {
    fn from(i: i64) -> FlagValue {
        FlagValue::Number(i as f64)
    }
}

impl FlagValue {
    pub fn flag_type(&self) -> FlagType {
        match self {
            FlagValue::Bool(_) => FlagType::Boolean,
            FlagValue::Number(_) => FlagType::Number,
            FlagValue::Str(_) => FlagType::String,
        }
    }

    pub fn is_type(&self, flag_type: FlagType) -> bool {
        self.flag_type() == flag_type
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FlagValue::Bool(b) => Some(*b),
            _ => {
                warn!("flag value type is not bool but {:?}", self);
                None
            }
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            FlagValue::Number(f) => Some(*f),
            _ => {
                warn!("flag value type is not number but {:?}", self);
                None
            }
        }
    }

    pub fn as_string(&self) -> Option<String> {
        match self {
            FlagValue::Str(s) => Some(s.clone()),
            _ => {
                warn!("flag value type is not str but {:?}", self);
                None
            }
        }
    }

    /// Total ordering used to sort rollout values: values of one type order naturally (strings
    /// lexicographically, `false < true`, numbers by value); mixed types, which only occur in
    /// unvalidated data, order by type.
    pub fn total_cmp(&self, other: &FlagValue) -> Ordering {
        match (self, other) {
            (FlagValue::Bool(a), FlagValue::Bool(b)) => a.cmp(b),
            (FlagValue::Number(a), FlagValue::Number(b)) => a.total_cmp(b),
            (FlagValue::Str(a), FlagValue::Str(b)) => a.cmp(b),
            _ => type_rank(self).cmp(&type_rank(other)),
        }
    }
}

fn type_rank(v: &FlagValue) -> u8 {
    match v {
        FlagValue::Bool(_) => 0,
        FlagValue::Number(_) => 1,
        FlagValue::Str(_) => 2,
    }
}
