use itertools::Itertools;

use crate::context::EvaluationContext;
use crate::flag::ValueOnMatch;
use crate::flag_value::FlagValue;
use crate::store::Store;

/// The rollout group of a context none of whose rollout discriminators have a value.
pub const UNKNOWN_ROLLOUT_GROUP: f64 = -1.0;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

const ROLLOUT_BUCKETS: u32 = 10_000;
const ROLLOUT_BUCKET_SCALE: f64 = 100.0;

/// 32-bit FNV-1a over the UTF-8 bytes of `input`.
pub fn fnv1a_32(input: &str) -> u32 {
    input.bytes().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Hashes `input` and folds the hash into `0..=max`.
pub fn hash_in_range(input: &str, max: u32) -> u32 {
    match max.checked_add(1) {
        Some(modulus) => fnv1a_32(input) % modulus,
        None => fnv1a_32(input),
    }
}

/// Computes the context's rollout group: a number in `[0, 100]` with two decimals, or
/// [UNKNOWN_ROLLOUT_GROUP].
///
/// The values of all rollout-discriminator properties are concatenated in ascending order of
/// property id, so the group depends only on (id, value) pairs: reordering, renaming or re-pathing
/// properties in the specification keeps every context in its group.
pub fn rollout_group(store: &dyn Store, context: &EvaluationContext) -> f64 {
    let key: String = store
        .properties()
        .iter()
        .filter(|property| property.rollout_discriminator)
        .sorted_by(|a, b| a.id.cmp(&b.id))
        .filter_map(|property| property.resolve(context).ok())
        .map(|value| value.rollout_key())
        .collect();

    if key.is_empty() {
        return UNKNOWN_ROLLOUT_GROUP;
    }
    f64::from(hash_in_range(&key, ROLLOUT_BUCKETS)) / ROLLOUT_BUCKET_SCALE
}

/// Picks the value for `rollout_group` from a rule's rollout.
///
/// Entries are ordered by value, not by declaration, so reordering them in the specification does
/// not move anyone between values. Percentages accumulate over that order and the first entry whose
/// running total reaches the rollout group is chosen. If the percentages fall short of 100 the last
/// entry absorbs the remainder. An empty rollout yields `fallback`.
pub fn select_value<'a>(
    values_on_match: &'a [ValueOnMatch],
    rollout_group: f64,
    fallback: &'a FlagValue,
) -> &'a FlagValue {
    let sorted = values_on_match
        .iter()
        .sorted_by(|a, b| a.value.total_cmp(&b.value))
        .collect_vec();

    let mut accumulated = 0.0;
    for entry in &sorted {
        accumulated += entry.rollout_percentage;
        if rollout_group <= accumulated {
            return &entry.value;
        }
    }
    sorted.last().map(|entry| &entry.value).unwrap_or(fallback)
}
