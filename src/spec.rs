use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::ser::PrettyFormatter;
use serde_json::Value;

use crate::flag::FeatureFlag;
use crate::property::Property;
use crate::segment::Segment;
use crate::store::Store;
use crate::validation::{self, ValidationError};

/// The versioned aggregate of feature flags, segments and context properties that evaluation runs
/// against.
///
/// A specification never changes once built; loading a newer one produces a new value. It indexes
/// its contents by id (and flags by name) on construction, so lookups during evaluation are cheap.
/// Deserializing a `Specification` only checks its shape; use [Specification::from_json_str] or
/// [Specification::from_json_value] to also run semantic validation.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(from = "SpecificationData", into = "SpecificationData")]
pub struct Specification {
    schema_version: u32,
    feature_flags: Vec<FeatureFlag>,
    segments: Vec<Segment>,
    properties: Vec<Property>,

    flags_by_id: HashMap<String, usize>,
    flags_by_name: HashMap<String, usize>,
    segments_by_id: HashMap<String, usize>,
    properties_by_id: HashMap<String, usize>,
}

#[derive(Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct SpecificationData {
    schema_version: u32,
    feature_flags: Vec<FeatureFlag>,
    segments: Vec<Segment>,
    properties: Vec<Property>,
}

impl From<SpecificationData> for Specification {
    fn from(data: SpecificationData) -> Self {
        Specification::new(
            data.schema_version,
            data.feature_flags,
            data.segments,
            data.properties,
        )
    }
}

impl From<Specification> for SpecificationData {
    fn from(spec: Specification) -> Self {
        SpecificationData {
            schema_version: spec.schema_version,
            feature_flags: spec.feature_flags,
            segments: spec.segments,
            properties: spec.properties,
        }
    }
}

// The first declaration of a duplicated key wins; validation rejects duplicates anyway.
fn index_by<T>(items: &[T], key: impl Fn(&T) -> &str) -> HashMap<String, usize> {
    let mut index = HashMap::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        index.entry(key(item).to_string()).or_insert(i);
    }
    index
}

impl PartialEq for Specification {
    fn eq(&self, other: &Self) -> bool {
        self.schema_version == other.schema_version
            && self.feature_flags == other.feature_flags
            && self.segments == other.segments
            && self.properties == other.properties
    }
}

impl Specification {
    /// Builds a specification without validating it.
    pub fn new(
        schema_version: u32,
        feature_flags: Vec<FeatureFlag>,
        segments: Vec<Segment>,
        properties: Vec<Property>,
    ) -> Self {
        Self {
            flags_by_id: index_by(&feature_flags, |f| &f.id),
            flags_by_name: index_by(&feature_flags, |f| &f.name),
            segments_by_id: index_by(&segments, |s| &s.id),
            properties_by_id: index_by(&properties, |p| &p.id),
            schema_version,
            feature_flags,
            segments,
            properties,
        }
    }

    /// Parses and validates a specification from JSON text.
    pub fn from_json_str(json: &str) -> Result<Self, ValidationError> {
        let spec = validation::parse_str(json)?;
        validation::validate(&spec)?;
        Ok(spec)
    }

    /// Parses and validates a specification from an already-parsed JSON value.
    pub fn from_json_value(json: Value) -> Result<Self, ValidationError> {
        let spec = validation::parse_value(&json)?;
        validation::validate(&spec)?;
        Ok(spec)
    }

    /// Serializes the specification to JSON text, pretty-printed with four-space indentation when
    /// `pretty` is set.
    pub fn to_json(&self, pretty: bool) -> serde_json::Result<String> {
        if !pretty {
            return serde_json::to_string(self);
        }
        let mut buf = Vec::new();
        let mut serializer =
            serde_json::Serializer::with_formatter(&mut buf, PrettyFormatter::with_indent(b"    "));
        self.serialize(&mut serializer)?;
        String::from_utf8(buf).map_err(<serde_json::Error as serde::ser::Error>::custom)
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    pub fn feature_flags(&self) -> &[FeatureFlag] {
        &self.feature_flags
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }
}

impl Store for Specification {
    fn flag(&self, flag_id: &str) -> Option<&FeatureFlag> {
        self.flags_by_id.get(flag_id).map(|&i| &self.feature_flags[i])
    }

    fn flag_by_name(&self, flag_name: &str) -> Option<&FeatureFlag> {
        self.flags_by_name
            .get(flag_name)
            .map(|&i| &self.feature_flags[i])
    }

    fn segment(&self, segment_id: &str) -> Option<&Segment> {
        self.segments_by_id.get(segment_id).map(|&i| &self.segments[i])
    }

    fn property(&self, property_id: &str) -> Option<&Property> {
        self.properties_by_id
            .get(property_id)
            .map(|&i| &self.properties[i])
    }

    fn properties(&self) -> &[Property] {
        &self.properties
    }
}
