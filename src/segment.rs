use log::warn;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::condition::ConditionSet;
use crate::context::EvaluationContext;
use crate::eval::EvaluationMetadata;
use crate::store::Store;

/// A named, reusable condition set that conditions refer to by id.
#[skip_serializing_none]
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub condition_set: ConditionSet,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SegmentOperator {
    IsTrue,
    IsFalse,
}

/// Tests whether the context is (or is not) in a segment.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentCondition {
    pub segment_id: String,
    pub operator: SegmentOperator,
}

impl Segment {
    pub fn contains(
        &self,
        store: &dyn Store,
        context: &EvaluationContext,
        metadata: &mut EvaluationMetadata,
    ) -> bool {
        if let Some(cached) = metadata.cached_segment(&self.id) {
            return cached;
        }

        if !metadata.segment_chain.insert(self.id.clone()) {
            warn!(
                "segment {} references itself; this should have been rejected by validation",
                self.id
            );
            return false;
        }
        let result = self.condition_set.evaluate(store, context, metadata);
        metadata.segment_chain.remove(&self.id);

        metadata.cache_segment(&self.id, result);
        result
    }
}

impl SegmentCondition {
    pub fn evaluate(
        &self,
        store: &dyn Store,
        context: &EvaluationContext,
        metadata: &mut EvaluationMetadata,
    ) -> bool {
        let segment = match store.segment(&self.segment_id) {
            Some(segment) => segment,
            None => return false,
        };
        let contained = segment.contains(store, context, metadata);
        match self.operator {
            SegmentOperator::IsTrue => contained,
            SegmentOperator::IsFalse => !contained,
        }
    }
}
