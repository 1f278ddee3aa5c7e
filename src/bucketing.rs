//! Consistent hashing of contexts into rollout buckets.
//!
//! The hash input is `{seed}.{value}` if the rollout has a seed and `{key}.{salt}.{value}`
//! otherwise, where `value` is the bucketing attribute of the context. The first 15 hex digits of
//! the SHA-1 digest are divided by `0xFFFFFFFFFFFFFFF` to get a value in `[0, 1)`. All SDKs
//! implementing the protocol use the same function, so they bucket contexts identically.
use std::borrow::Cow;

use serde_json::Value;
use sha1::{Digest, Sha1};

use crate::{
    attribute_ref::AttributeRef,
    context::{Context, DEFAULT_KIND},
    models::{Rollout, VariationIndex},
};

const LONG_SCALE: u64 = 0xFFF_FFFF_FFFF_FFFF;

/// Rollouts are expressed in parts per 100,000.
pub(crate) const WEIGHT_SCALE: f64 = 100_000.0;

/// Variation selected from a rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketResult {
    pub variation: VariationIndex,
    /// The context is part of an experiment and the result should be tracked.
    pub in_experiment: bool,
}

/// Compute the bucket value of `context` in `[0, 1)`.
///
/// `context_kind` selects the individual context (defaults to `user`) and `attribute` the
/// attribute to bucket by (defaults to `key`). Contexts without the requested kind, and attributes
/// that are neither strings nor integers, bucket to `0`.
pub fn bucket_value(
    seed: Option<i64>,
    context: &Context,
    context_kind: Option<&str>,
    key: &str,
    attribute: Option<&AttributeRef>,
    salt: &str,
) -> f64 {
    bucket_context(seed, context, context_kind, key, attribute, salt).unwrap_or(0.0)
}

/// Like [`bucket_value`] but returns `None` if the context doesn't have the requested kind.
pub(crate) fn bucket_context(
    seed: Option<i64>,
    context: &Context,
    context_kind: Option<&str>,
    key: &str,
    attribute: Option<&AttributeRef>,
    salt: &str,
) -> Option<f64> {
    let single = context.as_kind(context_kind.unwrap_or(DEFAULT_KIND))?;

    let value = match attribute {
        Some(attribute) => single.get_value(attribute),
        None => Some(Cow::Owned(Value::String(single.key().to_owned()))),
    };
    let Some(id) = value.as_deref().and_then(bucketable_string) else {
        return Some(0.0);
    };

    let input = match seed {
        Some(seed) => format!("{seed}.{id}"),
        None => format!("{key}.{salt}.{id}"),
    };
    Some(hash_to_unit_interval(input.as_bytes()))
}

/// Only strings and integers participate in bucketing.
fn bucketable_string(value: &Value) -> Option<Cow<'_, str>> {
    match value {
        Value::String(s) => Some(Cow::Borrowed(s)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(Cow::Owned(i.to_string()))
            } else if let Some(u) = n.as_u64() {
                Some(Cow::Owned(u.to_string()))
            } else {
                let f = n.as_f64()?;
                (f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                    .then(|| Cow::Owned((f as i64).to_string()))
            }
        }
        _ => None,
    }
}

fn hash_to_unit_interval(input: &[u8]) -> f64 {
    let digest = Sha1::digest(input);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    // 15 hex digits are the top 60 bits.
    let value = u64::from_be_bytes(prefix) >> 4;
    value as f64 / LONG_SCALE as f64
}

/// Select a variation from `rollout` for `context`.
///
/// Walks the weighted variations accumulating weight and picks the first one whose cumulative
/// upper bound exceeds the bucket value. If rounding leaves the bucket value past the last bound,
/// the last variation is selected. Returns `None` if the rollout has no variations.
///
/// Experiments always bucket by key; `bucket_by` only applies to plain rollouts.
pub fn variation_for_rollout(
    rollout: &Rollout,
    bucket_by: Option<&AttributeRef>,
    context: &Context,
    key: &str,
    salt: &str,
) -> Option<BucketResult> {
    let last = rollout.variations.last()?;
    let is_experiment = rollout.is_experiment();
    let attribute = if is_experiment { None } else { bucket_by };

    let bucket = bucket_context(
        rollout.seed,
        context,
        rollout.context_kind.as_deref(),
        key,
        attribute,
        salt,
    );
    let context_found = bucket.is_some();
    let bucket = bucket.unwrap_or(0.0);

    let mut sum = 0.0;
    let selected = rollout
        .variations
        .iter()
        .find(|wv| {
            sum += wv.weight as f64 / WEIGHT_SCALE;
            bucket < sum
        })
        .unwrap_or(last);

    Some(BucketResult {
        variation: selected.variation,
        in_experiment: is_experiment && !selected.untracked && context_found,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{bucket_value, variation_for_rollout, BucketResult};
    use crate::{
        attribute_ref::AttributeRef,
        context::ContextBuilder,
        models::{Rollout, RolloutKind, WeightedVariation},
    };

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-7,
            "{actual} should be close to {expected}"
        );
    }

    #[test]
    fn bucket_by_key_fixture() {
        let context = ContextBuilder::new("userKeyA").build().unwrap();
        assert_close(
            bucket_value(None, &context, None, "hashKey", None, "saltyA"),
            0.42157587,
        );
    }

    #[test]
    fn bucket_with_seed_fixture() {
        let context = ContextBuilder::new("userKeyA").build().unwrap();
        assert_close(
            bucket_value(Some(61), &context, None, "hashKey", None, "saltyA"),
            0.09801207,
        );
        // Seed replaces key and salt entirely.
        assert_eq!(
            bucket_value(Some(61), &context, None, "otherKey", None, "otherSalt"),
            bucket_value(Some(61), &context, None, "hashKey", None, "saltyA"),
        );
    }

    #[test]
    fn bucketing_is_deterministic() {
        let context = ContextBuilder::new("userKeyB").build().unwrap();
        let a = bucket_value(None, &context, None, "hashKey", None, "saltyA");
        let b = bucket_value(None, &context, None, "hashKey", None, "saltyA");
        assert_eq!(a, b);
        assert_close(a, 0.67084850);
    }

    #[test]
    fn integer_attribute_buckets_like_its_string() {
        let context = ContextBuilder::new("x")
            .set_value("intAttr", json!(33333))
            .set_value("stringAttr", json!("33333"))
            .set_value("floatAttr", json!(33333.0))
            .build()
            .unwrap();
        let int = bucket_value(
            None,
            &context,
            None,
            "hashKey",
            Some(&AttributeRef::new("intAttr")),
            "saltyA",
        );
        let string = bucket_value(
            None,
            &context,
            None,
            "hashKey",
            Some(&AttributeRef::new("stringAttr")),
            "saltyA",
        );
        assert_close(int, 0.54771423);
        assert_eq!(int, string);
        let float = bucket_value(
            None,
            &context,
            None,
            "hashKey",
            Some(&AttributeRef::new("floatAttr")),
            "saltyA",
        );
        assert_eq!(float, int);
    }

    #[test]
    fn unbucketable_values_bucket_to_zero() {
        let context = ContextBuilder::new("x")
            .set_value("floatAttr", json!(999.999))
            .set_value("boolAttr", json!(true))
            .build()
            .unwrap();
        for attr in ["floatAttr", "boolAttr", "missing"] {
            assert_eq!(
                bucket_value(
                    None,
                    &context,
                    None,
                    "hashKey",
                    Some(&AttributeRef::new(attr)),
                    "saltyA"
                ),
                0.0
            );
        }
    }

    #[test]
    fn missing_context_kind_buckets_to_zero() {
        let context = ContextBuilder::new("userKeyA").build().unwrap();
        assert_eq!(
            bucket_value(None, &context, Some("org"), "hashKey", None, "saltyA"),
            0.0
        );
    }

    fn rollout(kind: RolloutKind, variations: &[(usize, i64, bool)]) -> Rollout {
        Rollout {
            kind,
            variations: variations
                .iter()
                .map(|&(variation, weight, untracked)| WeightedVariation {
                    variation,
                    weight,
                    untracked,
                })
                .collect(),
            ..Rollout::default()
        }
    }

    #[test]
    fn selects_variation_by_cumulative_weight() {
        // userKeyA buckets to ~0.4216 under hashKey/saltyA.
        let context = ContextBuilder::new("userKeyA").build().unwrap();
        let r = rollout(
            RolloutKind::Rollout,
            &[(0, 42157, false), (1, 1, false), (2, 57842, false)],
        );
        assert_eq!(
            variation_for_rollout(&r, None, &context, "hashKey", "saltyA")
                .unwrap()
                .variation,
            1
        );
    }

    #[test]
    fn last_variation_absorbs_rounding() {
        let context = ContextBuilder::new("userKeyA").build().unwrap();
        let bucket = bucket_value(None, &context, None, "hashKey", None, "saltyA");
        let weight = (bucket * 100_000.0) as i64;
        let r = rollout(RolloutKind::Rollout, &[(0, weight, false)]);
        assert_eq!(
            variation_for_rollout(&r, None, &context, "hashKey", "saltyA"),
            Some(BucketResult {
                variation: 0,
                in_experiment: false
            })
        );
    }

    #[test]
    fn experiment_flags() {
        let context = ContextBuilder::new("userKeyA").build().unwrap();
        let tracked = rollout(RolloutKind::Experiment, &[(0, 100_000, false)]);
        assert!(
            variation_for_rollout(&tracked, None, &context, "hashKey", "saltyA")
                .unwrap()
                .in_experiment
        );

        let untracked = rollout(RolloutKind::Experiment, &[(0, 100_000, true)]);
        assert!(
            !variation_for_rollout(&untracked, None, &context, "hashKey", "saltyA")
                .unwrap()
                .in_experiment
        );

        let plain = rollout(RolloutKind::Rollout, &[(0, 100_000, false)]);
        assert!(
            !variation_for_rollout(&plain, None, &context, "hashKey", "saltyA")
                .unwrap()
                .in_experiment
        );

        // The context has no `org` kind, so it can't be part of the experiment.
        let other_kind = Rollout {
            context_kind: Some("org".into()),
            ..tracked
        };
        assert_eq!(
            variation_for_rollout(&other_kind, None, &context, "hashKey", "saltyA"),
            Some(BucketResult {
                variation: 0,
                in_experiment: false
            })
        );
    }

    #[test]
    fn empty_rollout_selects_nothing() {
        let context = ContextBuilder::new("userKeyA").build().unwrap();
        let r = rollout(RolloutKind::Rollout, &[]);
        assert_eq!(
            variation_for_rollout(&r, None, &context, "hashKey", "saltyA"),
            None
        );
    }
}
