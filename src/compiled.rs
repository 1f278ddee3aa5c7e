//! Flags and segments compiled for evaluation.
//!
//! Compilation is a one-time pass over [`FlagData`]/[`SegmentData`] that precomputes everything the
//! evaluator would otherwise derive on each call: result objects for every outcome, key sets for
//! targets, value sets for `in` clauses, and parsed dates, semantic versions and regular
//! expressions. After compilation, evaluation does no parsing, no regex compilation, and no set
//! construction.
//!
//! Compiled values are immutable. The only way to get a [`FeatureFlag`] or [`Segment`] is to
//! compile data (directly or through deserialization), so partially compiled state cannot be
//! observed.
use std::{
    collections::{HashMap, HashSet},
    ops::Deref,
    sync::Arc,
};

use chrono::{DateTime, Utc};
use regex::Regex;
use semver::Version;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::{
    attribute_ref::AttributeRef,
    eval::{ErrorKind, EvalResult, Reason},
    models::{
        Clause, FlagData, Operator, SegmentData, SegmentTarget, Target, VariationIndex,
        VariationOrRollout,
    },
    rules::{parse_date, parse_semver},
    Str,
};

/// A feature flag ready for evaluation.
///
/// Dereferences to [`FlagData`]. Equality and serialization only consider the data.
#[derive(Debug, Clone, Deserialize)]
#[serde(from = "FlagData")]
pub struct FeatureFlag {
    data: FlagData,
    pub(crate) precomputed: FlagPrecomputed,
}

#[derive(Debug, Clone)]
pub(crate) struct FlagPrecomputed {
    pub off: EvalResult,
    pub fallthrough: OutcomePrecomputed,
    pub targets: Box<[TargetPrecomputed]>,
    pub context_targets: Box<[TargetPrecomputed]>,
    /// One per prerequisite, in declaration order.
    pub prerequisite_failed: Box<[EvalResult]>,
    pub rules: Box<[RulePrecomputed]>,
}

#[derive(Debug, Clone)]
pub(crate) struct TargetPrecomputed {
    pub keys: HashSet<Str>,
    pub result: EvalResult,
}

#[derive(Debug, Clone)]
pub(crate) struct RulePrecomputed {
    pub clauses: Box<[ClausePreprocessed]>,
    pub outcome: OutcomePrecomputed,
}

/// Results of a fixed variation or a rollout, keyed by `(variation, in_experiment)`.
#[derive(Debug, Clone, Default)]
pub(crate) struct OutcomePrecomputed {
    pub results: HashMap<(VariationIndex, bool), EvalResult>,
    pub bucket_by: Option<AttributeRef>,
}

impl OutcomePrecomputed {
    pub fn get(&self, variation: VariationIndex, in_experiment: bool) -> Option<&EvalResult> {
        self.results.get(&(variation, in_experiment))
    }
}

impl FeatureFlag {
    /// Compile flag data.
    pub fn new(data: FlagData) -> FeatureFlag {
        let precomputed = precompute_flag(&data);
        FeatureFlag { data, precomputed }
    }

    pub fn data(&self) -> &FlagData {
        &self.data
    }

    pub fn into_data(self) -> FlagData {
        self.data
    }
}

impl Deref for FeatureFlag {
    type Target = FlagData;

    fn deref(&self) -> &FlagData {
        &self.data
    }
}

impl PartialEq for FeatureFlag {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl Serialize for FeatureFlag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.data.serialize(serializer)
    }
}

impl From<FlagData> for FeatureFlag {
    fn from(data: FlagData) -> Self {
        FeatureFlag::new(data)
    }
}

fn precompute_flag(data: &FlagData) -> FlagPrecomputed {
    let variations: Box<[Arc<Value>]> = data.variations.iter().cloned().map(Arc::new).collect();

    let off = match data.off_variation {
        Some(index) => result_for(&variations, index, Reason::Off),
        None => EvalResult::no_variation(Reason::Off),
    };

    let precompute_targets = |targets: &[Target]| -> Box<[TargetPrecomputed]> {
        targets
            .iter()
            .map(|target| TargetPrecomputed {
                keys: target.values.iter().cloned().collect(),
                result: result_for(&variations, target.variation, Reason::TargetMatch),
            })
            .collect()
    };

    let prerequisite_failed = data
        .prerequisites
        .iter()
        .map(|prereq| {
            let reason = Reason::PrerequisiteFailed {
                prerequisite_key: prereq.key.clone(),
            };
            match data.off_variation {
                Some(index) => result_for(&variations, index, reason),
                None => EvalResult::no_variation(reason),
            }
        })
        .collect();

    let rules = data
        .rules
        .iter()
        .enumerate()
        .map(|(rule_index, rule)| RulePrecomputed {
            clauses: rule.clauses.iter().map(preprocess_clause).collect(),
            outcome: precompute_outcome(&variations, &rule.variation_or_rollout, |in_experiment| {
                Reason::RuleMatch {
                    rule_index,
                    rule_id: rule.id.clone(),
                    in_experiment,
                }
            }),
        })
        .collect();

    FlagPrecomputed {
        off,
        fallthrough: precompute_outcome(&variations, &data.fallthrough, |in_experiment| {
            Reason::Fallthrough { in_experiment }
        }),
        targets: precompute_targets(&data.targets),
        context_targets: precompute_targets(&data.context_targets),
        prerequisite_failed,
        rules,
    }
}

fn precompute_outcome(
    variations: &[Arc<Value>],
    outcome: &VariationOrRollout,
    reason: impl Fn(bool) -> Reason,
) -> OutcomePrecomputed {
    let mut results = HashMap::new();
    if let Some(index) = outcome.variation {
        results.insert((index, false), result_for(variations, index, reason(false)));
    } else if let Some(rollout) = &outcome.rollout {
        for wv in &rollout.variations {
            for in_experiment in [false, true] {
                results
                    .entry((wv.variation, in_experiment))
                    .or_insert_with(|| result_for(variations, wv.variation, reason(in_experiment)));
            }
        }
    }

    let bucket_by = outcome.rollout.as_ref().and_then(|rollout| {
        let attribute = rollout.bucket_by.as_deref()?;
        Some(attribute_ref(attribute, rollout.context_kind.is_some()))
    });

    OutcomePrecomputed { results, bucket_by }
}

/// Result for a variation index. Out-of-range indices produce a `MALFORMED_FLAG` error.
fn result_for(variations: &[Arc<Value>], index: VariationIndex, reason: Reason) -> EvalResult {
    match variations.get(index) {
        Some(value) => EvalResult::new(Arc::clone(value), index, reason),
        None => EvalResult::error(ErrorKind::MalformedFlag),
    }
}

/// Build an attribute reference. Attributes of clauses and rollouts that specify a context kind
/// are paths; older data without a context kind uses plain attribute names.
pub(crate) fn attribute_ref(attribute: &str, has_context_kind: bool) -> AttributeRef {
    if has_context_kind {
        AttributeRef::new(attribute)
    } else {
        AttributeRef::literal(attribute)
    }
}

/// A segment ready for evaluation.
///
/// Dereferences to [`SegmentData`]. Equality and serialization only consider the data.
#[derive(Debug, Clone, Deserialize)]
#[serde(from = "SegmentData")]
pub struct Segment {
    data: SegmentData,
    pub(crate) precomputed: SegmentPrecomputed,
}

#[derive(Debug, Clone)]
pub(crate) struct SegmentPrecomputed {
    pub included: HashSet<Str>,
    pub excluded: HashSet<Str>,
    pub included_contexts: Box<[KindKeys]>,
    pub excluded_contexts: Box<[KindKeys]>,
    pub rules: Box<[SegmentRulePrecomputed]>,
}

#[derive(Debug, Clone)]
pub(crate) struct KindKeys {
    pub kind: Str,
    pub keys: HashSet<Str>,
}

#[derive(Debug, Clone)]
pub(crate) struct SegmentRulePrecomputed {
    pub clauses: Box<[ClausePreprocessed]>,
    pub bucket_by: Option<AttributeRef>,
}

impl Segment {
    /// Compile segment data.
    pub fn new(data: SegmentData) -> Segment {
        let precomputed = precompute_segment(&data);
        Segment { data, precomputed }
    }

    pub fn data(&self) -> &SegmentData {
        &self.data
    }

    pub fn into_data(self) -> SegmentData {
        self.data
    }
}

impl Deref for Segment {
    type Target = SegmentData;

    fn deref(&self) -> &SegmentData {
        &self.data
    }
}

impl PartialEq for Segment {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl Serialize for Segment {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.data.serialize(serializer)
    }
}

impl From<SegmentData> for Segment {
    fn from(data: SegmentData) -> Self {
        Segment::new(data)
    }
}

fn precompute_segment(data: &SegmentData) -> SegmentPrecomputed {
    let kind_keys = |targets: &[SegmentTarget]| -> Box<[KindKeys]> {
        targets
            .iter()
            .map(|target| KindKeys {
                kind: target.context_kind.clone(),
                keys: target.values.iter().cloned().collect(),
            })
            .collect()
    };

    SegmentPrecomputed {
        included: data.included.iter().cloned().collect(),
        excluded: data.excluded.iter().cloned().collect(),
        included_contexts: kind_keys(&data.included_contexts),
        excluded_contexts: kind_keys(&data.excluded_contexts),
        rules: data
            .rules
            .iter()
            .map(|rule| SegmentRulePrecomputed {
                clauses: rule.clauses.iter().map(preprocess_clause).collect(),
                bucket_by: rule
                    .bucket_by
                    .as_deref()
                    .map(|attr| attribute_ref(attr, rule.rollout_context_kind.is_some())),
            })
            .collect(),
    }
}

/// Clause data derived once at compile time.
#[derive(Debug, Clone)]
pub struct ClausePreprocessed {
    pub(crate) attribute: AttributeRef,
    /// Set of values for `in` clauses with more than one value.
    pub(crate) value_set: Option<ValueSet>,
    /// Parsed clause values for date, semver and regex operators, aligned with
    /// [`Clause::values`]. `None` marks a value that failed to parse. Empty for other operators.
    pub(crate) parsed: Box<[Option<ParsedValue>]>,
}

#[derive(Debug, Clone)]
pub(crate) enum ParsedValue {
    Date(DateTime<Utc>),
    SemVer(Version),
    Regex(Regex),
}

/// Preprocess a clause. Never fails: values that cannot be parsed are recorded as such and never
/// match.
pub fn preprocess_clause(clause: &Clause) -> ClausePreprocessed {
    let value_set = (clause.op == Operator::In && clause.values.len() > 1)
        .then(|| ValueSet::new(&clause.values));

    let parse: Option<fn(&Value) -> Option<ParsedValue>> = match clause.op {
        Operator::Before | Operator::After => {
            Some(|v| parse_date(v).map(ParsedValue::Date))
        }
        Operator::SemVerEqual | Operator::SemVerLessThan | Operator::SemVerGreaterThan => {
            Some(|v| v.as_str().and_then(parse_semver).map(ParsedValue::SemVer))
        }
        Operator::Matches => Some(|v| {
            v.as_str()
                .and_then(|s| Regex::new(s).ok())
                .map(ParsedValue::Regex)
        }),
        _ => None,
    };
    let parsed = match parse {
        Some(parse) => clause.values.iter().map(parse).collect(),
        None => Box::default(),
    };

    ClausePreprocessed {
        attribute: clause.attribute_ref(),
        value_set,
        parsed,
    }
}

/// Set of JSON values for constant-time `in` lookups. Numbers are compared by value, so `1` and
/// `1.0` are the same element.
#[derive(Debug, Clone, Default)]
pub(crate) struct ValueSet {
    strings: HashSet<String>,
    numbers: HashSet<u64>,
    bools: [bool; 2],
    null: bool,
    /// Arrays and objects, compared linearly.
    others: Vec<Value>,
}

impl ValueSet {
    fn new(values: &[Value]) -> ValueSet {
        let mut set = ValueSet::default();
        for value in values {
            match value {
                Value::String(s) => {
                    set.strings.insert(s.clone());
                }
                Value::Number(n) => {
                    if let Some(f) = n.as_f64() {
                        set.numbers.insert(number_bits(f));
                    }
                }
                Value::Bool(b) => set.bools[usize::from(*b)] = true,
                Value::Null => set.null = true,
                other => set.others.push(other.clone()),
            }
        }
        set
    }

    pub fn contains(&self, value: &Value) -> bool {
        match value {
            Value::String(s) => self.strings.contains(s.as_str()),
            Value::Number(n) => n
                .as_f64()
                .is_some_and(|f| self.numbers.contains(&number_bits(f))),
            Value::Bool(b) => self.bools[usize::from(*b)],
            Value::Null => self.null,
            other => self.others.iter().any(|v| v == other),
        }
    }
}

fn number_bits(f: f64) -> u64 {
    // -0.0 == 0.0
    if f == 0.0 {
        0.0f64.to_bits()
    } else {
        f.to_bits()
    }
}
