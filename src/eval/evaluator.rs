use std::{collections::HashMap, sync::Arc};

use serde_json::Value;

use crate::{
    big_segments::{
        hash_context_key, segment_ref, BigSegmentMembership, BigSegmentsQueryResult,
        BigSegmentsStatus,
    },
    bucketing::{bucket_value, variation_for_rollout, WEIGHT_SCALE},
    compiled::{
        ClausePreprocessed, FeatureFlag, KindKeys, OutcomePrecomputed, Segment,
        SegmentRulePrecomputed,
    },
    context::{Context, DEFAULT_KIND},
    models::{Clause, Operator, SegmentRule, VariationOrRollout},
    rules::match_clause,
    Str,
};

use super::{ErrorKind, EvalResult, PrerequisiteEvent, PrerequisiteRecorder};

/// Data access for the evaluator.
///
/// Absence is a normal outcome: a missing prerequisite fails the prerequisite, a missing segment
/// doesn't match.
pub trait Getters {
    fn get_flag(&self, key: &str) -> Option<Arc<FeatureFlag>>;

    fn get_segment(&self, key: &str) -> Option<Arc<Segment>>;

    /// Look up big segment memberships by hashed context key. `None` means that big segments are
    /// not configured.
    #[allow(unused_variables)]
    fn get_big_segment_membership(&self, context_hash: &str) -> Option<BigSegmentsQueryResult> {
        None
    }
}

impl<T: Getters + ?Sized> Getters for &T {
    fn get_flag(&self, key: &str) -> Option<Arc<FeatureFlag>> {
        (**self).get_flag(key)
    }

    fn get_segment(&self, key: &str) -> Option<Arc<Segment>> {
        (**self).get_segment(key)
    }

    fn get_big_segment_membership(&self, context_hash: &str) -> Option<BigSegmentsQueryResult> {
        (**self).get_big_segment_membership(context_hash)
    }
}

impl<T: Getters + ?Sized> Getters for Arc<T> {
    fn get_flag(&self, key: &str) -> Option<Arc<FeatureFlag>> {
        (**self).get_flag(key)
    }

    fn get_segment(&self, key: &str) -> Option<Arc<Segment>> {
        (**self).get_segment(key)
    }

    fn get_big_segment_membership(&self, context_hash: &str) -> Option<BigSegmentsQueryResult> {
        (**self).get_big_segment_membership(context_hash)
    }
}

/// Evaluates flags.
///
/// The evaluator holds no mutable state and can be shared between threads if `G` can.
#[derive(Debug, Clone)]
pub struct Evaluator<G> {
    getters: G,
}

impl<G: Getters> Evaluator<G> {
    pub fn new(getters: G) -> Evaluator<G> {
        Evaluator { getters }
    }

    pub fn getters(&self) -> &G {
        &self.getters
    }

    /// Evaluate `flag` for `context`.
    ///
    /// Precedence, first applicable wins: flag off, failed prerequisite, individual target, first
    /// matching rule, fallthrough. Every prerequisite evaluation is reported to `recorder`.
    pub fn evaluate<R: PrerequisiteRecorder>(
        &self,
        flag: &FeatureFlag,
        context: &Context,
        recorder: &mut R,
    ) -> EvalResult {
        let mut state = EvalState {
            getters: &self.getters,
            context,
            recorder,
            prerequisite_stack: Vec::new(),
            segment_stack: Vec::new(),
            big_segment_memberships: HashMap::new(),
            big_segments_status: None,
        };

        let mut result = state
            .evaluate_flag(flag)
            .unwrap_or_else(EvalResult::error);
        result.big_segments_status = state.big_segments_status;

        match result.error_kind() {
            None => {
                log::trace!(target: "flag_engine",
                            flag_key:display = flag.key,
                            context_key:display = context.canonical_key(),
                            variation:? = result.variation_index,
                            reason:serde = result.reason;
                            "evaluated a flag");
            }
            Some(error_kind) => {
                log::warn!(target: "flag_engine",
                           flag_key:display = flag.key,
                           context_key:display = context.canonical_key();
                           "error occurred while evaluating a flag: {error_kind}");
            }
        }

        result
    }

    /// Look up a flag and evaluate it. A missing flag produces a `FLAG_NOT_FOUND` error result.
    pub fn evaluate_key<R: PrerequisiteRecorder>(
        &self,
        flag_key: &str,
        context: &Context,
        recorder: &mut R,
    ) -> EvalResult {
        match self.getters.get_flag(flag_key) {
            Some(flag) => self.evaluate(&flag, context, recorder),
            None => {
                log::warn!(target: "flag_engine", flag_key; "evaluating unknown flag");
                EvalResult::error(ErrorKind::FlagNotFound)
            }
        }
    }
}

/// State of a single top-level evaluation.
struct EvalState<'a, G, R> {
    getters: &'a G,
    context: &'a Context,
    recorder: &'a mut R,
    /// Flags whose prerequisites are being evaluated, for cycle detection.
    prerequisite_stack: Vec<Str>,
    /// Segments being evaluated, for cycle detection.
    segment_stack: Vec<Str>,
    /// Memberships looked up during this evaluation, by context key.
    big_segment_memberships: HashMap<String, Option<Arc<BigSegmentMembership>>>,
    big_segments_status: Option<BigSegmentsStatus>,
}

impl<G: Getters, R: PrerequisiteRecorder> EvalState<'_, G, R> {
    fn evaluate_flag(&mut self, flag: &FeatureFlag) -> Result<EvalResult, ErrorKind> {
        let precomputed = &flag.precomputed;

        if !flag.on {
            return Ok(precomputed.off.clone());
        }

        if let Some(failed) = self.check_prerequisites(flag)? {
            return Ok(failed);
        }

        if let Some(result) = self.match_targets(flag) {
            return Ok(result.clone());
        }

        for (rule, rule_precomputed) in flag.rules.iter().zip(precomputed.rules.iter()) {
            if self.clauses_match(&rule.clauses, &rule_precomputed.clauses)? {
                return self.outcome_result(
                    flag,
                    &rule.variation_or_rollout,
                    &rule_precomputed.outcome,
                );
            }
        }

        self.outcome_result(flag, &flag.fallthrough, &precomputed.fallthrough)
    }

    /// Returns the precomputed `PREREQUISITE_FAILED` result of the first failing prerequisite.
    fn check_prerequisites(&mut self, flag: &FeatureFlag) -> Result<Option<EvalResult>, ErrorKind> {
        if flag.prerequisites.is_empty() {
            return Ok(None);
        }
        if self.prerequisite_stack.contains(&flag.key) {
            log::warn!(target: "flag_engine",
                       flag_key:display = flag.key;
                       "prerequisite cycle detected");
            return Err(ErrorKind::MalformedFlag);
        }

        self.prerequisite_stack.push(flag.key.clone());
        let result = self.check_prerequisites_in_order(flag);
        self.prerequisite_stack.pop();
        result
    }

    fn check_prerequisites_in_order(
        &mut self,
        flag: &FeatureFlag,
    ) -> Result<Option<EvalResult>, ErrorKind> {
        let failed_results = flag.precomputed.prerequisite_failed.iter();
        for (prereq, failed) in flag.prerequisites.iter().zip(failed_results) {
            let Some(prereq_flag) = self.getters.get_flag(&prereq.key) else {
                log::debug!(target: "flag_engine",
                            flag_key:display = flag.key,
                            prerequisite_key:display = prereq.key;
                            "prerequisite flag not found");
                return Ok(Some(failed.clone()));
            };

            let result = match self.evaluate_flag(&prereq_flag) {
                Ok(result) => result,
                Err(error_kind) => {
                    self.record(flag, &prereq_flag, &EvalResult::error(error_kind));
                    return Err(error_kind);
                }
            };
            self.record(flag, &prereq_flag, &result);

            // An off prerequisite fails even if its off variation is the required one.
            if !prereq_flag.on || result.variation_index != Some(prereq.variation) {
                return Ok(Some(failed.clone()));
            }
        }
        Ok(None)
    }

    fn record(&mut self, flag: &FeatureFlag, prereq_flag: &FeatureFlag, result: &EvalResult) {
        self.recorder.record(PrerequisiteEvent {
            target_flag_key: &flag.key,
            prerequisite_flag: prereq_flag,
            context: self.context,
            result,
        });
    }

    fn match_targets<'f>(&self, flag: &'f FeatureFlag) -> Option<&'f EvalResult> {
        let precomputed = &flag.precomputed;
        let user_key = self.context.as_kind(DEFAULT_KIND).map(|c| c.key());

        if flag.context_targets.is_empty() {
            let user_key = user_key?;
            return precomputed
                .targets
                .iter()
                .find(|target| target.keys.contains(user_key))
                .map(|target| &target.result);
        }

        let context_targets = flag
            .context_targets
            .iter()
            .zip(precomputed.context_targets.iter());
        for (target, target_precomputed) in context_targets {
            let kind = target.context_kind.as_deref().unwrap_or(DEFAULT_KIND);
            if kind == DEFAULT_KIND && target.values.is_empty() {
                // Placeholder for the `user` targets of the same variation, kept in `targets`.
                let Some(user_key) = user_key else {
                    continue;
                };
                let found = flag
                    .targets
                    .iter()
                    .zip(precomputed.targets.iter())
                    .find(|(t, t_precomputed)| {
                        t.variation == target.variation && t_precomputed.keys.contains(user_key)
                    });
                if let Some((_, t_precomputed)) = found {
                    return Some(&t_precomputed.result);
                }
            } else if let Some(single) = self.context.as_kind(kind) {
                if target_precomputed.keys.contains(single.key()) {
                    return Some(&target_precomputed.result);
                }
            }
        }
        None
    }

    fn clauses_match(
        &mut self,
        clauses: &[Clause],
        preprocessed: &[ClausePreprocessed],
    ) -> Result<bool, ErrorKind> {
        for (clause, clause_preprocessed) in clauses.iter().zip(preprocessed) {
            if !self.clause_matches(clause, clause_preprocessed)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn clause_matches(
        &mut self,
        clause: &Clause,
        preprocessed: &ClausePreprocessed,
    ) -> Result<bool, ErrorKind> {
        if clause.op != Operator::SegmentMatch {
            return match_clause(clause, Some(preprocessed), self.context);
        }

        for segment_key in clause.values.iter().filter_map(Value::as_str) {
            if let Some(segment) = self.getters.get_segment(segment_key) {
                if self.segment_contains(&segment)? {
                    return Ok(!clause.negate);
                }
            }
        }
        Ok(clause.negate)
    }

    fn segment_contains(&mut self, segment: &Segment) -> Result<bool, ErrorKind> {
        if self.segment_stack.contains(&segment.key) {
            log::warn!(target: "flag_engine",
                       segment_key:display = segment.key;
                       "segment rule cycle detected");
            return Err(ErrorKind::MalformedFlag);
        }

        self.segment_stack.push(segment.key.clone());
        let result = self.segment_contains_unchecked(segment);
        self.segment_stack.pop();
        result
    }

    fn segment_contains_unchecked(&mut self, segment: &Segment) -> Result<bool, ErrorKind> {
        let explicit = if segment.unbounded {
            self.big_segment_match(segment)
        } else {
            self.segment_targets_match(segment)
        };
        if let Some(included) = explicit {
            return Ok(included);
        }

        let rules = segment.rules.iter().zip(segment.precomputed.rules.iter());
        for (rule, rule_precomputed) in rules {
            if self.segment_rule_matches(segment, rule, rule_precomputed)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// `Some(true)` if explicitly included, `Some(false)` if explicitly excluded. Inclusion wins.
    fn segment_targets_match(&self, segment: &Segment) -> Option<bool> {
        let precomputed = &segment.precomputed;
        let context = self.context;
        let user_key = context.as_kind(DEFAULT_KIND).map(|c| c.key());
        let listed = |targets: &[KindKeys]| {
            targets.iter().any(|target| {
                context
                    .as_kind(&target.kind)
                    .is_some_and(|c| target.keys.contains(c.key()))
            })
        };

        if user_key.is_some_and(|key| precomputed.included.contains(key))
            || listed(&precomputed.included_contexts)
        {
            return Some(true);
        }
        if user_key.is_some_and(|key| precomputed.excluded.contains(key))
            || listed(&precomputed.excluded_contexts)
        {
            return Some(false);
        }
        None
    }

    /// Explicit membership of an unbounded segment, from the big segment store.
    fn big_segment_match(&mut self, segment: &Segment) -> Option<bool> {
        let Some(generation) = segment.generation else {
            // Segment data predates big segment support, so the store can't answer.
            self.add_big_segments_status(BigSegmentsStatus::NotConfigured);
            return Some(false);
        };

        let context = self.context;
        let kind = segment
            .unbounded_context_kind
            .as_deref()
            .unwrap_or(DEFAULT_KIND);
        let Some(single) = context.as_kind(kind) else {
            return Some(false);
        };

        let membership = self.big_segment_membership(single.key())?;
        membership.check(&segment_ref(&segment.key, generation))
    }

    fn big_segment_membership(&mut self, context_key: &str) -> Option<Arc<BigSegmentMembership>> {
        if let Some(cached) = self.big_segment_memberships.get(context_key) {
            return cached.clone();
        }

        let query = self
            .getters
            .get_big_segment_membership(&hash_context_key(context_key));
        let (membership, status) = match query {
            Some(result) => (result.membership, result.status),
            None => (None, BigSegmentsStatus::NotConfigured),
        };
        self.add_big_segments_status(status);
        self.big_segment_memberships
            .insert(context_key.to_owned(), membership.clone());
        membership
    }

    fn add_big_segments_status(&mut self, status: BigSegmentsStatus) {
        self.big_segments_status = Some(match self.big_segments_status {
            Some(current) => current.worst(status),
            None => status,
        });
    }

    fn segment_rule_matches(
        &mut self,
        segment: &Segment,
        rule: &SegmentRule,
        precomputed: &SegmentRulePrecomputed,
    ) -> Result<bool, ErrorKind> {
        if !self.clauses_match(&rule.clauses, &precomputed.clauses)? {
            return Ok(false);
        }
        let Some(weight) = rule.weight else {
            return Ok(true);
        };

        if let Some(err) = precomputed.bucket_by.as_ref().and_then(|r| r.error()) {
            log::warn!(target: "flag_engine",
                       segment_key:display = segment.key;
                       "invalid bucketBy in segment rule: {err}");
            return Err(ErrorKind::MalformedFlag);
        }
        let bucket = bucket_value(
            None,
            self.context,
            rule.rollout_context_kind.as_deref(),
            &segment.key,
            precomputed.bucket_by.as_ref(),
            &segment.salt,
        );
        Ok(bucket < weight as f64 / WEIGHT_SCALE)
    }

    fn outcome_result(
        &self,
        flag: &FeatureFlag,
        outcome: &VariationOrRollout,
        precomputed: &OutcomePrecomputed,
    ) -> Result<EvalResult, ErrorKind> {
        let (variation, in_experiment) = if let Some(variation) = outcome.variation {
            (variation, false)
        } else if let Some(rollout) = &outcome.rollout {
            if let Some(err) = precomputed.bucket_by.as_ref().and_then(|r| r.error()) {
                log::warn!(target: "flag_engine",
                           flag_key:display = flag.key;
                           "invalid bucketBy in rollout: {err}");
                return Err(ErrorKind::MalformedFlag);
            }
            let Some(bucket) = variation_for_rollout(
                rollout,
                precomputed.bucket_by.as_ref(),
                self.context,
                &flag.key,
                &flag.salt,
            ) else {
                log::warn!(target: "flag_engine",
                           flag_key:display = flag.key;
                           "rollout has no variations");
                return Err(ErrorKind::MalformedFlag);
            };
            (bucket.variation, bucket.in_experiment)
        } else {
            log::warn!(target: "flag_engine",
                       flag_key:display = flag.key;
                       "rule or fallthrough has neither variation nor rollout");
            return Err(ErrorKind::MalformedFlag);
        };

        precomputed
            .get(variation, in_experiment)
            .cloned()
            .ok_or(ErrorKind::MalformedFlag)
    }
}
