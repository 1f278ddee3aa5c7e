//! Flag and segment data as received from the data source.
//!
//! These are plain data records. Before evaluation they are compiled into
//! [`FeatureFlag`](crate::FeatureFlag) and [`Segment`](crate::Segment), which carry precomputed
//! results alongside the data.
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::Str;

/// Index into [`FlagData::variations`].
pub type VariationIndex = usize;

/// Deserialize `null` the same way as an absent field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Feature flag definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct FlagData {
    pub key: Str,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub on: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub prerequisites: Vec<Prerequisite>,
    /// Individual targets for the `user` kind.
    #[serde(default, deserialize_with = "null_as_default")]
    pub targets: Vec<Target>,
    /// Individual targets for arbitrary context kinds.
    #[serde(default, deserialize_with = "null_as_default")]
    pub context_targets: Vec<Target>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub rules: Vec<FlagRule>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub fallthrough: VariationOrRollout,
    #[serde(default)]
    pub off_variation: Option<VariationIndex>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub variations: Vec<Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub salt: Str,
    #[serde(default)]
    pub track_events: bool,
    #[serde(default)]
    pub track_events_fallthrough: bool,
    #[serde(default)]
    pub deleted: bool,
}

/// A flag that must evaluate to a specific variation before the dependent flag is evaluated
/// normally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prerequisite {
    pub key: Str,
    pub variation: VariationIndex,
}

/// A list of context keys that receive a specific variation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    /// Context kind of the keys. Absent means `user`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_kind: Option<Str>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub values: Vec<Str>,
    pub variation: VariationIndex,
}

/// Either a fixed variation or a percentage rollout.
///
/// Exactly one of the fields is expected to be set. A rule that has neither is malformed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct VariationOrRollout {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variation: Option<VariationIndex>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollout: Option<Rollout>,
}

impl VariationOrRollout {
    pub fn fixed(variation: VariationIndex) -> VariationOrRollout {
        VariationOrRollout {
            variation: Some(variation),
            rollout: None,
        }
    }

    pub fn rollout(rollout: Rollout) -> VariationOrRollout {
        VariationOrRollout {
            variation: None,
            rollout: Some(rollout),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum RolloutKind {
    #[default]
    Rollout,
    /// Matches are reported as part of an experiment unless the variation is untracked.
    Experiment,
    #[serde(other)]
    Unknown,
}

/// Weighted assignment of contexts to variations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Rollout {
    #[serde(default)]
    pub kind: RolloutKind,
    /// Replaces flag key and salt in the hash input when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub variations: Vec<WeightedVariation>,
    /// Attribute to bucket by. Defaults to `key`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_kind: Option<Str>,
}

impl Rollout {
    pub fn is_experiment(&self) -> bool {
        self.kind == RolloutKind::Experiment
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightedVariation {
    pub variation: VariationIndex,
    /// Weight in parts per 100,000.
    pub weight: i64,
    #[serde(default)]
    pub untracked: bool,
}

/// A flag targeting rule. Matches if all clauses match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct FlagRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Str>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub clauses: Vec<Clause>,
    #[serde(flatten)]
    pub variation_or_rollout: VariationOrRollout,
    #[serde(default)]
    pub track_events: bool,
}

/// A condition on a context attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Clause {
    /// Kind of context the attribute is read from. When absent, the `user` kind is used and
    /// `attribute` is a plain attribute name rather than a path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_kind: Option<Str>,
    pub attribute: String,
    pub op: Operator,
    #[serde(default, deserialize_with = "null_as_default")]
    pub values: Vec<Value>,
    #[serde(default)]
    pub negate: bool,
}

/// Clause operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operator {
    /// Equality with any of the values.
    In,
    EndsWith,
    StartsWith,
    /// Regular expression search anywhere in the string.
    Matches,
    Contains,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    /// Date comparison. Values are RFC 3339 strings or epoch milliseconds.
    Before,
    After,
    SegmentMatch,
    SemVerEqual,
    SemVerLessThan,
    SemVerGreaterThan,
    /// Operator not known to this version. Never matches.
    #[serde(other)]
    Unknown,
}

/// Segment definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SegmentData {
    pub key: Str,
    #[serde(default)]
    pub version: u64,
    /// `user` keys that are always members.
    #[serde(default, deserialize_with = "null_as_default")]
    pub included: Vec<Str>,
    /// `user` keys that are never members, unless also included.
    #[serde(default, deserialize_with = "null_as_default")]
    pub excluded: Vec<Str>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub included_contexts: Vec<SegmentTarget>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub excluded_contexts: Vec<SegmentTarget>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub rules: Vec<SegmentRule>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub salt: Str,
    /// Membership is stored in an external big segment store.
    #[serde(default)]
    pub unbounded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unbounded_context_kind: Option<Str>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<i64>,
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentTarget {
    pub context_kind: Str,
    #[serde(default, deserialize_with = "null_as_default")]
    pub values: Vec<Str>,
}

/// A segment rule. Matches if all clauses match and the context falls within `weight`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SegmentRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Str>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub clauses: Vec<Clause>,
    /// Parts per 100,000 of matching contexts that are members. Absent means all of them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollout_context_kind: Option<Str>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{FlagData, Operator, RolloutKind, SegmentData};

    #[test]
    fn parse_flag() {
        let flag: FlagData = serde_json::from_value(json!({
            "key": "flag",
            "version": 3,
            "on": true,
            "rules": [{
                "id": "r1",
                "clauses": [{"attribute": "email", "op": "endsWith", "values": ["@example.com"]}],
                "rollout": {
                    "kind": "experiment",
                    "seed": 61,
                    "variations": [{"variation": 0, "weight": 50000}, {"variation": 1, "weight": 50000, "untracked": true}]
                }
            }],
            "fallthrough": {"variation": 1},
            "offVariation": 0,
            "variations": ["a", "b"],
            "salt": "salty"
        }))
        .unwrap();

        assert_eq!(flag.version, 3);
        assert_eq!(flag.rules[0].clauses[0].op, Operator::EndsWith);
        let rollout = flag.rules[0].variation_or_rollout.rollout.as_ref().unwrap();
        assert_eq!(rollout.kind, RolloutKind::Experiment);
        assert_eq!(rollout.seed, Some(61));
        assert!(rollout.variations[1].untracked);
        assert_eq!(flag.fallthrough.variation, Some(1));
    }

    #[test]
    fn null_and_absent_lists_are_empty() {
        let flag: FlagData = serde_json::from_value(json!({
            "key": "flag",
            "prerequisites": null,
            "rules": null,
        }))
        .unwrap();
        assert!(flag.prerequisites.is_empty());
        assert!(flag.rules.is_empty());
        assert!(flag.targets.is_empty());
        assert!(flag.variations.is_empty());

        let segment: SegmentData =
            serde_json::from_value(json!({"key": "s", "included": null})).unwrap();
        assert!(segment.included.is_empty());
        assert!(segment.rules.is_empty());
    }

    #[test]
    fn unknown_operator_is_tolerated() {
        let flag: FlagData = serde_json::from_value(json!({
            "key": "flag",
            "rules": [{"clauses": [{"attribute": "a", "op": "someNewOperator", "values": []}], "variation": 0}]
        }))
        .unwrap();
        assert_eq!(flag.rules[0].clauses[0].op, Operator::Unknown);
    }
}
