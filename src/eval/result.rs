use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{big_segments::BigSegmentsStatus, models::VariationIndex, Str};

/// Error kinds reported through [`Reason::Error`].
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Flag data is not available yet.
    #[error("client not ready")]
    ClientNotReady,
    /// The requested flag does not exist.
    #[error("flag not found")]
    FlagNotFound,
    /// Flag data is invalid: variation index out of range, empty rollout, prerequisite or segment
    /// cycle, invalid attribute reference.
    #[error("malformed flag")]
    MalformedFlag,
    /// Context was missing or invalid.
    #[error("user not specified")]
    UserNotSpecified,
    /// The flag value has an unexpected type.
    #[error("wrong type")]
    WrongType,
    /// Unexpected failure.
    #[error("exception")]
    Exception,
}

/// Explains why an evaluation produced its result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "kind",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum Reason {
    /// Flag is off.
    Off,
    /// No target or rule matched.
    Fallthrough {
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        in_experiment: bool,
    },
    /// Context key was individually targeted.
    TargetMatch,
    /// Context matched a rule.
    RuleMatch {
        rule_index: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rule_id: Option<Str>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        in_experiment: bool,
    },
    /// A prerequisite flag did not return the required variation.
    PrerequisiteFailed { prerequisite_key: Str },
    /// Evaluation could not produce a result.
    Error { error_kind: ErrorKind },
}

impl Reason {
    /// Returns `true` if the result is part of an experiment.
    pub fn in_experiment(&self) -> bool {
        match self {
            Reason::Fallthrough { in_experiment } | Reason::RuleMatch { in_experiment, .. } => {
                *in_experiment
            }
            _ => false,
        }
    }
}

/// Result of a flag evaluation.
///
/// Cloning is cheap: the value is shared. Most results handed out by the evaluator are clones of
/// results precomputed when the flag was compiled.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvalResult {
    /// Selected variation value. `None` if no variation was selected.
    pub value: Option<Arc<Value>>,
    pub variation_index: Option<VariationIndex>,
    pub reason: Reason,
    /// Set if evaluation consulted a big segment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub big_segments_status: Option<BigSegmentsStatus>,
}

impl EvalResult {
    /// A result that carries a variation.
    pub fn new(value: Arc<Value>, variation_index: VariationIndex, reason: Reason) -> EvalResult {
        EvalResult {
            value: Some(value),
            variation_index: Some(variation_index),
            reason,
            big_segments_status: None,
        }
    }

    /// A result without a variation. The caller's default value applies.
    pub fn no_variation(reason: Reason) -> EvalResult {
        EvalResult {
            value: None,
            variation_index: None,
            reason,
            big_segments_status: None,
        }
    }

    pub fn error(error_kind: ErrorKind) -> EvalResult {
        EvalResult::no_variation(Reason::Error { error_kind })
    }

    /// Returns the selected value, or `default` if no variation was selected.
    pub fn value_or(&self, default: Value) -> Value {
        match &self.value {
            Some(value) => value.as_ref().clone(),
            None => default,
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self.reason {
            Reason::Error { error_kind } => Some(error_kind),
            _ => None,
        }
    }

    pub fn in_experiment(&self) -> bool {
        self.reason.in_experiment()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::{ErrorKind, EvalResult, Reason};

    #[test]
    fn reason_serialization() {
        assert_eq!(serde_json::to_value(Reason::Off).unwrap(), json!({"kind": "OFF"}));
        assert_eq!(
            serde_json::to_value(Reason::Fallthrough {
                in_experiment: false
            })
            .unwrap(),
            json!({"kind": "FALLTHROUGH"})
        );
        assert_eq!(
            serde_json::to_value(Reason::RuleMatch {
                rule_index: 1,
                rule_id: Some("id".into()),
                in_experiment: true
            })
            .unwrap(),
            json!({"kind": "RULE_MATCH", "ruleIndex": 1, "ruleId": "id", "inExperiment": true})
        );
        assert_eq!(
            serde_json::to_value(Reason::PrerequisiteFailed {
                prerequisite_key: "p".into()
            })
            .unwrap(),
            json!({"kind": "PREREQUISITE_FAILED", "prerequisiteKey": "p"})
        );
        assert_eq!(
            serde_json::to_value(Reason::Error {
                error_kind: ErrorKind::MalformedFlag
            })
            .unwrap(),
            json!({"kind": "ERROR", "errorKind": "MALFORMED_FLAG"})
        );
    }

    #[test]
    fn value_or_default() {
        let result = EvalResult::error(ErrorKind::FlagNotFound);
        assert_eq!(result.value_or(json!("default")), json!("default"));

        let result = EvalResult::new(Arc::new(json!(true)), 0, Reason::TargetMatch);
        assert_eq!(result.value_or(json!(false)), json!(true));
    }
}
