#![cfg(test)]

use std::cell::RefCell;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use parking_lot::Mutex;

use crate::context::EvaluationContext;
use crate::eval::{EvaluationMetadata, EvaluationWarning, WarningRecorder};
use crate::events::{ClientEvent, EventRecorder};
use crate::flag::FeatureFlag;
use crate::property::Property;
use crate::rollout::UNKNOWN_ROLLOUT_GROUP;
use crate::segment::Segment;
use crate::spec::Specification;
use crate::store::Store;

pub const FIXTURE_SPEC: &str = r#"{
    "schemaVersion": 1,
    "properties": [
        {"id": "email", "name": "email", "path": ["email"], "type": "string"},
        {"id": "age", "name": "age", "path": ["age"], "type": "number"},
        {"id": "beta", "name": "beta", "path": ["beta"], "type": "boolean"},
        {"id": "tags", "name": "tags", "path": ["tags"], "type": "stringArray"},
        {"id": "scores", "name": "scores", "path": ["scores"], "type": "numberArray"},
        {"id": "flags", "name": "flags", "path": ["flags"], "type": "booleanArray"},
        {
            "id": "userId",
            "name": "user id",
            "path": ["user", "id"],
            "type": "string",
            "rolloutDiscriminator": true
        }
    ],
    "segments": [
        {
            "id": "acme-employees",
            "name": "ACME employees",
            "conditionSet": {
                "operator": "and",
                "conditions": [
                    {"type": "string", "propertyId": "email", "operator": "endsWith", "operands": ["@acme.com"]}
                ]
            }
        },
        {
            "id": "acme-adults",
            "name": "Adult ACME employees",
            "description": "Employees old enough for the beta programme",
            "conditionSet": {
                "operator": "and",
                "conditions": [
                    {"type": "segment", "segmentId": "acme-employees", "operator": "isTrue"},
                    {"type": "number", "propertyId": "age", "operator": "isGreaterThanOrEquals", "operands": [18]}
                ]
            }
        }
    ],
    "featureFlags": [
        {
            "id": "ai-pilot-id",
            "name": "ai-pilot",
            "description": "AI assistant pilot for employees",
            "type": "boolean",
            "defaultValue": false,
            "targeting": {
                "enabled": true,
                "rules": [{
                    "enabled": true,
                    "conditionSet": {
                        "operator": "and",
                        "conditions": [
                            {"type": "segment", "segmentId": "acme-employees", "operator": "isTrue"}
                        ]
                    },
                    "valuesOnMatch": [{"value": true, "rolloutPercentage": 100}]
                }]
            }
        },
        {
            "id": "dark-launch-id",
            "name": "dark-launch",
            "type": "string",
            "defaultValue": "off",
            "targeting": {
                "enabled": false,
                "rules": [{
                    "enabled": true,
                    "conditionSet": {"operator": "and", "conditions": [{"type": "alwaysTrue"}]},
                    "valuesOnMatch": [{"value": "on", "rolloutPercentage": 100}]
                }]
            }
        },
        {
            "id": "max-upload-mb-id",
            "name": "max-upload-mb",
            "type": "number",
            "defaultValue": 10,
            "targeting": {
                "enabled": true,
                "rules": [
                    {
                        "enabled": false,
                        "conditionSet": {"operator": "and", "conditions": [{"type": "alwaysTrue"}]},
                        "valuesOnMatch": [{"value": 1000, "rolloutPercentage": 100}]
                    },
                    {
                        "enabled": true,
                        "conditionSet": {
                            "operator": "and",
                            "conditions": [
                                {"type": "number", "propertyId": "age", "operator": "isGreaterThanOrEquals", "operands": [18]}
                            ]
                        },
                        "valuesOnMatch": [{"value": 100, "rolloutPercentage": 100}]
                    },
                    {
                        "enabled": true,
                        "conditionSet": {"operator": "or", "conditions": [{"type": "alwaysTrue"}]},
                        "valuesOnMatch": [{"value": 25, "rolloutPercentage": 100}]
                    }
                ]
            }
        },
        {
            "id": "empty-rollout-id",
            "name": "empty-rollout",
            "type": "boolean",
            "defaultValue": false,
            "targeting": {
                "enabled": true,
                "rules": [{
                    "enabled": true,
                    "conditionSet": {"operator": "and", "conditions": [{"type": "alwaysTrue"}]},
                    "valuesOnMatch": []
                }]
            }
        },
        {
            "id": "checkout-variant-id",
            "name": "checkout-variant",
            "type": "string",
            "defaultValue": "a-classic",
            "targeting": {
                "enabled": true,
                "rules": [{
                    "enabled": true,
                    "conditionSet": {"operator": "and", "conditions": [{"type": "alwaysTrue"}]},
                    "valuesOnMatch": [
                        {"value": "c-express", "rolloutPercentage": 20},
                        {"value": "a-classic", "rolloutPercentage": 50},
                        {"value": "b-one-page", "rolloutPercentage": 30}
                    ]
                }]
            }
        }
    ]
}"#;

pub struct TestStore {
    spec: Specification,
}

impl TestStore {
    pub fn new() -> Self {
        Self {
            spec: Specification::from_json_str(FIXTURE_SPEC).unwrap(),
        }
    }
}

impl Store for TestStore {
    fn flag(&self, flag_id: &str) -> Option<&FeatureFlag> {
        self.spec.flag(flag_id)
    }

    fn flag_by_name(&self, flag_name: &str) -> Option<&FeatureFlag> {
        self.spec.flag_by_name(flag_name)
    }

    fn segment(&self, segment_id: &str) -> Option<&Segment> {
        self.spec.segment(segment_id)
    }

    fn property(&self, property_id: &str) -> Option<&Property> {
        self.spec.property(property_id)
    }

    fn properties(&self) -> &[Property] {
        self.spec.properties()
    }
}

pub fn context(json: serde_json::Value) -> EvaluationContext {
    EvaluationContext::try_from(json).unwrap()
}

/// Metadata pinned to a fixed instant with an unknown rollout group.
pub fn evaluation_metadata<'a>() -> EvaluationMetadata<'a> {
    EvaluationMetadata::new(
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        UNKNOWN_ROLLOUT_GROUP,
    )
}

#[derive(Default)]
pub struct RecordingWarnings {
    pub warnings: RefCell<Vec<EvaluationWarning>>,
}

impl WarningRecorder for RecordingWarnings {
    fn record(&self, warning: EvaluationWarning) {
        self.warnings.borrow_mut().push(warning);
    }
}

#[derive(Clone, Default)]
pub struct RecordingEvents {
    events: Arc<Mutex<Vec<ClientEvent>>>,
}

impl RecordingEvents {
    pub fn events(&self) -> Vec<ClientEvent> {
        self.events.lock().clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(ClientEvent::kind).collect()
    }
}

impl EventRecorder for RecordingEvents {
    fn record(&self, event: &ClientEvent) {
        self.events.lock().push(event.clone());
    }
}
