use std::fmt;

use serde::{Deserialize, Serialize};
use itertools::Itertools;
use serde_json::Value;

use crate::context::EvaluationContext;
use crate::util::{format_number, is_false};

/// The declared runtime type of a context property.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PropertyType {
    Boolean,
    Number,
    String,
    BooleanArray,
    NumberArray,
    StringArray,
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            PropertyType::Boolean => "boolean",
            PropertyType::Number => "number",
            PropertyType::String => "string",
            PropertyType::BooleanArray => "booleanArray",
            PropertyType::NumberArray => "numberArray",
            PropertyType::StringArray => "stringArray",
        };
        f.write_str(name)
    }
}

/// A property describes one typed value inside an [EvaluationContext]. Conditions refer to
/// properties by `id`; `path` says where the value lives in the context.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Property {
    pub id: String,
    pub name: String,
    pub path: Vec<String>,
    #[serde(rename = "type")]
    pub property_type: PropertyType,
    #[serde(default, skip_serializing_if = "is_false")]
    pub rollout_discriminator: bool,
}

/// A context value that passed the runtime type check for its property.
#[derive(Clone, Debug, PartialEq)]
pub enum PropertyValue<'a> {
    Boolean(bool),
    Number(f64),
    String(&'a str),
    BooleanArray(Vec<bool>),
    NumberArray(Vec<f64>),
    StringArray(Vec<&'a str>),
}

/// Why a property value could not be used.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LookupError {
    /// Nothing (or `null`) lives at the property's path.
    NotFound,
    /// Something lives at the path but it is not of the property's declared type.
    IncorrectDataType,
}

impl Property {
    /// Resolves this property's value from `context`, checking its runtime type.
    pub fn resolve<'a>(
        &self,
        context: &'a EvaluationContext,
    ) -> Result<PropertyValue<'a>, LookupError> {
        let raw = context.value_at(self.path.as_slice()).ok_or(LookupError::NotFound)?;
        let value = match self.property_type {
            PropertyType::Boolean => raw.as_bool().map(PropertyValue::Boolean),
            PropertyType::Number => raw.as_f64().map(PropertyValue::Number),
            PropertyType::String => raw.as_str().map(PropertyValue::String),
            PropertyType::BooleanArray => {
                array_of(raw, Value::as_bool).map(PropertyValue::BooleanArray)
            }
            PropertyType::NumberArray => array_of(raw, Value::as_f64).map(PropertyValue::NumberArray),
            PropertyType::StringArray => array_of(raw, Value::as_str).map(PropertyValue::StringArray),
        };
        value.ok_or(LookupError::IncorrectDataType)
    }
}

fn array_of<'a, T>(raw: &'a Value, element: impl Fn(&'a Value) -> Option<T>) -> Option<Vec<T>> {
    raw.as_array()?.iter().map(element).collect()
}

impl<'a> PropertyValue<'a> {
    /// The primitive serialization used to build rollout keys: scalars are trimmed, arrays are
    /// rendered as compact JSON. Numbers read the same on their own and inside an array, with no
    /// fractional part when integral.
    pub fn rollout_key(&self) -> String {
        match self {
            PropertyValue::Number(n) => format_number(*n).trim().to_string(),
            PropertyValue::String(s) => s.trim().to_string(),
            PropertyValue::Boolean(b) => b.to_string(),
            PropertyValue::BooleanArray(v) => json_text(v),
            PropertyValue::NumberArray(v) => {
                format!("[{}]", v.iter().map(|n| format_number(*n)).join(","))
            }
            PropertyValue::StringArray(v) => json_text(v),
        }
    }
}

fn json_text<T: Serialize>(value: &T) -> String {
    // Vec<bool | f64 | &str> always serializes; non-finite floats become null.
    serde_json::to_string(value).unwrap_or_default()
}
