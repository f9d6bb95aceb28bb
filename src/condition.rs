use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, Local, NaiveDate, NaiveTime, TimeZone, Utc};
use lazy_static::lazy_static;
use log::warn;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::context::EvaluationContext;
use crate::eval::{EvaluationMetadata, EvaluationWarning};
use crate::property::{PropertyType, PropertyValue};
use crate::segment::SegmentCondition;
use crate::store::Store;

lazy_static! {
    static ref UTC_OFFSET_REGEX: Regex = Regex::new(r"^([+-])(\d{2}):(\d{2})$").unwrap();
}

/// A node of a targeting expression tree.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Condition {
    Boolean(PropertyCondition<BooleanOperator>),
    Number(PropertyCondition<NumberOperator>),
    String(PropertyCondition<StringOperator>),
    BooleanArray(ArrayPropertyCondition<BooleanOperator>),
    NumberArray(ArrayPropertyCondition<NumberOperator>),
    StringArray(ArrayPropertyCondition<StringOperator>),
    AlwaysTrue,
    Segment(SegmentCondition),
    ConditionSet {
        #[serde(rename = "conditionSet")]
        condition_set: ConditionSet,
    },
    DateTime(DateTimeCondition),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SetOperator {
    And,
    Or,
    Nand,
    Nor,
}

/// A boolean combinator over a list of conditions. An empty list is always false.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ConditionSet {
    pub operator: SetOperator,
    pub conditions: Vec<Condition>,
}

/// Combines one test across a list of items. Every quantifier is false over an empty list.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
#[serde(rename_all = "camelCase")]
pub enum Quantifier {
    #[default]
    Some,
    Every,
    NotAny,
    NotEvery,
}

impl Quantifier {
    pub fn apply<I, F>(self, items: I, mut test: F) -> bool
    where
        I: IntoIterator,
        F: FnMut(I::Item) -> bool,
    {
        let mut items = items.into_iter().peekable();
        if items.peek().is_none() {
            return false;
        }
        match self {
            Quantifier::Some => items.any(|i| test(i)),
            Quantifier::Every => items.all(|i| test(i)),
            Quantifier::NotAny => !items.any(|i| test(i)),
            Quantifier::NotEvery => !items.all(|i| test(i)),
        }
    }
}

/// An operator comparing one context value, optionally against one operand.
pub trait ScalarOperator:
    Copy + fmt::Debug + PartialEq + Serialize + DeserializeOwned
{
    type Value: ?Sized;
    type Operand: Clone + fmt::Debug + PartialEq + Serialize + DeserializeOwned;

    /// Operators like `isEven` or `isBlank` test the value alone and ignore operands.
    fn takes_operand(self) -> bool;

    fn test(self, value: &Self::Value, operand: Option<&Self::Operand>) -> bool;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum BooleanOperator {
    IsTrue,
    IsFalse,
}

impl ScalarOperator for BooleanOperator {
    type Value = bool;
    type Operand = bool;

    fn takes_operand(self) -> bool {
        false
    }

    fn test(self, value: &bool, _operand: Option<&bool>) -> bool {
        match self {
            BooleanOperator::IsTrue => *value,
            BooleanOperator::IsFalse => !*value,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum NumberOperator {
    Equals,
    DoesNotEqual,
    IsLessThan,
    IsLessThanOrEquals,
    IsGreaterThan,
    IsGreaterThanOrEquals,
    IsEven,
    IsOdd,
}

impl ScalarOperator for NumberOperator {
    type Value = f64;
    type Operand = f64;

    fn takes_operand(self) -> bool {
        !matches!(self, NumberOperator::IsEven | NumberOperator::IsOdd)
    }

    fn test(self, value: &f64, operand: Option<&f64>) -> bool {
        let value = *value;
        match (self, operand) {
            (NumberOperator::IsEven, _) => value.abs() % 2.0 == 0.0,
            (NumberOperator::IsOdd, _) => value.abs() % 2.0 == 1.0,
            (NumberOperator::Equals, Some(o)) => value == *o,
            (NumberOperator::DoesNotEqual, Some(o)) => value != *o,
            (NumberOperator::IsLessThan, Some(o)) => value < *o,
            (NumberOperator::IsLessThanOrEquals, Some(o)) => value <= *o,
            (NumberOperator::IsGreaterThan, Some(o)) => value > *o,
            (NumberOperator::IsGreaterThanOrEquals, Some(o)) => value >= *o,
            (_, None) => false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum StringOperator {
    Equals,
    DoesNotEqual,
    StartsWith,
    DoesNotStartWith,
    EndsWith,
    DoesNotEndWith,
    Contains,
    DoesNotContain,
    IsBlank,
    IsNotBlank,
    MatchesRegex,
    DoesNotMatchRegex,
}

impl ScalarOperator for StringOperator {
    type Value = str;
    type Operand = String;

    fn takes_operand(self) -> bool {
        !matches!(self, StringOperator::IsBlank | StringOperator::IsNotBlank)
    }

    fn test(self, value: &str, operand: Option<&String>) -> bool {
        match (self, operand) {
            (StringOperator::IsBlank, _) => value.trim().is_empty(),
            (StringOperator::IsNotBlank, _) => !value.trim().is_empty(),
            (StringOperator::Equals, Some(o)) => value == o,
            (StringOperator::DoesNotEqual, Some(o)) => value != o,
            (StringOperator::StartsWith, Some(o)) => value.starts_with(o.as_str()),
            (StringOperator::DoesNotStartWith, Some(o)) => !value.starts_with(o.as_str()),
            (StringOperator::EndsWith, Some(o)) => value.ends_with(o.as_str()),
            (StringOperator::DoesNotEndWith, Some(o)) => !value.ends_with(o.as_str()),
            (StringOperator::Contains, Some(o)) => value.contains(o.as_str()),
            (StringOperator::DoesNotContain, Some(o)) => !value.contains(o.as_str()),
            (StringOperator::MatchesRegex, Some(o)) => regex_matches(value, o),
            (StringOperator::DoesNotMatchRegex, Some(o)) => !regex_matches(value, o),
            (_, None) => false,
        }
    }
}

fn regex_matches(value: &str, pattern: &str) -> bool {
    match Regex::new(pattern) {
        Ok(re) => re.is_match(value),
        Err(e) => {
            warn!("Invalid regex for 'matchesRegex' operator ({}): {}", e, pattern);
            false
        }
    }
}

/// A condition on a scalar property. Operators that take an operand are tested against every
/// entry of `operands` and combined with `operands_quantifier`.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", bound = "O: ScalarOperator")]
pub struct PropertyCondition<O: ScalarOperator> {
    pub property_id: String,
    pub operator: O,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operands: Vec<O::Operand>,
    #[serde(default)]
    pub operands_quantifier: Quantifier,
}

impl<O: ScalarOperator> PropertyCondition<O> {
    pub fn matches(&self, value: &O::Value) -> bool {
        scalar_matches(self.operator, &self.operands, self.operands_quantifier, value)
    }
}

fn scalar_matches<O: ScalarOperator>(
    operator: O,
    operands: &[O::Operand],
    quantifier: Quantifier,
    value: &O::Value,
) -> bool {
    if !operator.takes_operand() {
        return operator.test(value, None);
    }
    quantifier.apply(operands, |operand| operator.test(value, Some(operand)))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LengthOperator {
    HasElements,
    HasNoElements,
}

/// Array conditions either test the array's length or test its elements with a scalar operator.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize)]
#[serde(untagged, bound = "O: ScalarOperator")]
pub enum ArrayOperator<O: ScalarOperator> {
    Length(LengthOperator),
    Element(O),
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", bound = "O: ScalarOperator")]
pub struct ArrayPropertyCondition<O: ScalarOperator> {
    pub property_id: String,
    pub operator: ArrayOperator<O>,
    #[serde(default)]
    pub array_quantifier: Quantifier,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operands: Vec<O::Operand>,
    #[serde(default)]
    pub operands_quantifier: Quantifier,
}

impl<O: ScalarOperator> ArrayPropertyCondition<O> {
    pub fn matches<'v, I>(&self, elements: I) -> bool
    where
        I: ExactSizeIterator<Item = &'v O::Value>,
        O::Value: 'v,
    {
        match self.operator {
            ArrayOperator::Length(LengthOperator::HasElements) => elements.len() > 0,
            ArrayOperator::Length(LengthOperator::HasNoElements) => elements.len() == 0,
            ArrayOperator::Element(operator) => self.array_quantifier.apply(elements, |element| {
                scalar_matches(operator, &self.operands, self.operands_quantifier, element)
            }),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DateTimeOperator {
    Before,
    After,
    EqualsOrBefore,
    EqualsOrAfter,
}

/// The offset an operand instant's wall-clock date and time are read in: either an explicit
/// `±HH:MM` offset or the local offset of the evaluating host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub enum TimeZoneOffset {
    Fixed(FixedOffset),
    Local,
}

impl FromStr for TimeZoneOffset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "local" {
            return Ok(TimeZoneOffset::Local);
        }
        let captures = UTC_OFFSET_REGEX
            .captures(s)
            .ok_or_else(|| format!("invalid time zone offset '{}'", s))?;
        let hours: i32 = captures[2].parse().map_err(|_| format!("invalid hours in '{}'", s))?;
        let minutes: i32 = captures[3]
            .parse()
            .map_err(|_| format!("invalid minutes in '{}'", s))?;
        let seconds = (hours * 60 + minutes) * 60;
        let seconds = if &captures[1] == "-" { -seconds } else { seconds };
        FixedOffset::east_opt(seconds)
            .map(TimeZoneOffset::Fixed)
            .ok_or_else(|| format!("time zone offset '{}' out of range", s))
    }
}

impl TryFrom<String> for TimeZoneOffset {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<TimeZoneOffset> for String {
    fn from(offset: TimeZoneOffset) -> String {
        match offset {
            TimeZoneOffset::Local => "local".to_string(),
            TimeZoneOffset::Fixed(offset) => {
                let seconds = offset.local_minus_utc();
                let sign = if seconds < 0 { '-' } else { '+' };
                let minutes = seconds.abs() / 60;
                format!("{}{:02}:{:02}", sign, minutes / 60, minutes % 60)
            }
        }
    }
}

/// Compares the evaluation time against an absolute instant.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DateTimeCondition {
    pub operator: DateTimeOperator,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub time_zone_offset: TimeZoneOffset,
}

impl DateTimeCondition {
    /// The operand instant, or None when the wall-clock time does not exist at the local offset.
    pub fn instant(&self) -> Option<DateTime<Utc>> {
        let naive = self.date.and_time(self.time);
        let instant = match self.time_zone_offset {
            TimeZoneOffset::Fixed(offset) => offset
                .from_local_datetime(&naive)
                .single()
                .map(|dt| dt.with_timezone(&Utc)),
            TimeZoneOffset::Local => Local
                .from_local_datetime(&naive)
                .earliest()
                .map(|dt| dt.with_timezone(&Utc)),
        };
        if instant.is_none() {
            warn!("{} does not exist in time zone offset {:?}", naive, self.time_zone_offset);
        }
        instant
    }

    pub fn matches(&self, evaluation_date_time: DateTime<Utc>) -> bool {
        let instant = match self.instant() {
            Some(instant) => instant,
            None => return false,
        };
        match self.operator {
            DateTimeOperator::Before => evaluation_date_time < instant,
            DateTimeOperator::After => evaluation_date_time > instant,
            DateTimeOperator::EqualsOrBefore => evaluation_date_time <= instant,
            DateTimeOperator::EqualsOrAfter => evaluation_date_time >= instant,
        }
    }
}

impl ConditionSet {
    pub fn evaluate(
        &self,
        store: &dyn Store,
        context: &EvaluationContext,
        metadata: &mut EvaluationMetadata,
    ) -> bool {
        if self.conditions.is_empty() {
            return false;
        }
        let mut results = self
            .conditions
            .iter()
            .map(|condition| condition.evaluate(store, context, metadata));
        match self.operator {
            SetOperator::And => results.all(|r| r),
            SetOperator::Or => results.any(|r| r),
            SetOperator::Nand => !results.all(|r| r),
            SetOperator::Nor => !results.any(|r| r),
        }
    }
}

impl Condition {
    pub fn evaluate(
        &self,
        store: &dyn Store,
        context: &EvaluationContext,
        metadata: &mut EvaluationMetadata,
    ) -> bool {
        match self {
            Condition::AlwaysTrue => true,
            Condition::ConditionSet { condition_set } => {
                condition_set.evaluate(store, context, metadata)
            }
            Condition::Segment(condition) => condition.evaluate(store, context, metadata),
            Condition::DateTime(condition) => condition.matches(metadata.evaluation_date_time),
            Condition::Boolean(c) => {
                let id = &c.property_id;
                with_property_value(id, PropertyType::Boolean, store, context, metadata, |v| {
                    matches!(v, PropertyValue::Boolean(b) if c.matches(&b))
                })
            }
            Condition::Number(c) => {
                let id = &c.property_id;
                with_property_value(id, PropertyType::Number, store, context, metadata, |v| {
                    matches!(v, PropertyValue::Number(n) if c.matches(&n))
                })
            }
            Condition::String(c) => {
                let id = &c.property_id;
                with_property_value(id, PropertyType::String, store, context, metadata, |v| {
                    matches!(v, PropertyValue::String(s) if c.matches(s))
                })
            }
            Condition::BooleanArray(c) => {
                let id = &c.property_id;
                with_property_value(id, PropertyType::BooleanArray, store, context, metadata, |v| {
                    matches!(v, PropertyValue::BooleanArray(values) if c.matches(values.iter()))
                })
            }
            Condition::NumberArray(c) => {
                let id = &c.property_id;
                with_property_value(id, PropertyType::NumberArray, store, context, metadata, |v| {
                    matches!(v, PropertyValue::NumberArray(values) if c.matches(values.iter()))
                })
            }
            Condition::StringArray(c) => {
                let id = &c.property_id;
                with_property_value(id, PropertyType::StringArray, store, context, metadata, |v| {
                    matches!(v, PropertyValue::StringArray(values) if c.matches(values.iter().copied()))
                })
            }
        }
    }

    /// The property this condition reads and the type it expects, if it is a property condition.
    pub fn property_reference(&self) -> Option<(&str, PropertyType)> {
        match self {
            Condition::Boolean(c) => Some((&c.property_id, PropertyType::Boolean)),
            Condition::Number(c) => Some((&c.property_id, PropertyType::Number)),
            Condition::String(c) => Some((&c.property_id, PropertyType::String)),
            Condition::BooleanArray(c) => Some((&c.property_id, PropertyType::BooleanArray)),
            Condition::NumberArray(c) => Some((&c.property_id, PropertyType::NumberArray)),
            Condition::StringArray(c) => Some((&c.property_id, PropertyType::StringArray)),
            _ => None,
        }
    }

    /// Visits this condition and every condition nested below it through condition sets. Segment
    /// references are not followed.
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a Condition)) {
        visit(self);
        if let Condition::ConditionSet { condition_set } = self {
            condition_set.walk(visit);
        }
    }
}

impl ConditionSet {
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a Condition)) {
        for condition in &self.conditions {
            condition.walk(visit);
        }
    }
}

// A property that is missing from the specification, or declared with a different type than the
// condition expects, is an authoring error: it fails the condition without a warning.
fn with_property_value<F>(
    property_id: &str,
    expected: PropertyType,
    store: &dyn Store,
    context: &EvaluationContext,
    metadata: &mut EvaluationMetadata,
    test: F,
) -> bool
where
    F: FnOnce(PropertyValue) -> bool,
{
    let property = match store.property(property_id) {
        Some(property) if property.property_type == expected => property,
        _ => return false,
    };
    match property.resolve(context) {
        Ok(value) => test(value),
        Err(error) => {
            metadata.warn(EvaluationWarning::new(property, error));
            false
        }
    }
}
