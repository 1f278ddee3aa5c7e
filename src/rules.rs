//! Clause matching.
//!
//! Every function here takes optional [`ClausePreprocessed`] data. With it, `in` clauses use a
//! hash set and date/semver/regex clause values come pre-parsed. Without it, the same work is
//! done on the fly. Both paths produce identical results.
use std::{borrow::Cow, cmp::Ordering};

use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use semver::Version;
use serde_json::Value;

use crate::{
    attribute_ref::AttributeRef,
    compiled::{attribute_ref, ClausePreprocessed, ParsedValue},
    context::{Context, DEFAULT_KIND},
    eval::ErrorKind,
    models::{Clause, Operator},
};

impl Clause {
    /// Attribute this clause reads.
    pub fn attribute_ref(&self) -> AttributeRef {
        attribute_ref(&self.attribute, self.context_kind.is_some())
    }

    /// Match a context attribute value against the clause, applying `negate`.
    ///
    /// If `value` is an array, the clause matches when any element matches. `null` never
    /// matches, whatever `negate` says.
    pub fn matches_value(&self, preprocessed: Option<&ClausePreprocessed>, value: &Value) -> bool {
        let matched = match value {
            Value::Null => return false,
            Value::Array(values) => values
                .iter()
                .filter(|v| !matches!(v, Value::Array(_) | Value::Object(_)))
                .any(|v| self.matches_single(preprocessed, v)),
            value => self.matches_single(preprocessed, value),
        };
        matched != self.negate
    }

    fn matches_single(&self, preprocessed: Option<&ClausePreprocessed>, value: &Value) -> bool {
        if self.op == Operator::In {
            if let Some(set) = preprocessed.and_then(|p| p.value_set.as_ref()) {
                return set.contains(value);
            }
        }

        self.values.iter().enumerate().any(|(i, clause_value)| {
            let parsed = preprocessed.and_then(|p| p.parsed.get(i));
            self.op.eval(value, clause_value, parsed)
        })
    }
}

/// Match a clause against a context. Segment-match clauses are not handled here and never match.
///
/// The context of the clause's kind (`user` if unspecified) is selected. A missing context or
/// attribute is a non-match regardless of `negate`. An invalid attribute reference is an error.
pub fn match_clause(
    clause: &Clause,
    preprocessed: Option<&ClausePreprocessed>,
    context: &Context,
) -> Result<bool, ErrorKind> {
    let owned;
    let attribute = match preprocessed {
        Some(p) => &p.attribute,
        None => {
            owned = clause.attribute_ref();
            &owned
        }
    };

    if let Some(err) = attribute.error() {
        log::warn!(target: "flag_engine",
                   attribute = clause.attribute.as_str();
                   "invalid attribute reference in clause: {err}");
        return Err(ErrorKind::MalformedFlag);
    }

    // `kind` matches against every kind of a multi-kind context.
    if attribute.components() == ["kind"] {
        let matched = context
            .kinds()
            .any(|kind| clause.matches_single(preprocessed, &Value::String(kind.to_owned())));
        return Ok(matched != clause.negate);
    }

    let kind = clause.context_kind.as_deref().unwrap_or(DEFAULT_KIND);
    let Some(single) = context.as_kind(kind) else {
        return Ok(false);
    };
    let Some(value) = single.get_value(attribute) else {
        return Ok(false);
    };
    Ok(clause.matches_value(preprocessed, &value))
}

impl Operator {
    /// Apply the operator to a context value and a single clause value. Returns `false` if the
    /// operator cannot be applied to these values.
    ///
    /// `parsed` is the preprocessed form of the clause value: `None` if the clause was not
    /// preprocessed, `Some(None)` if the value failed to parse.
    fn eval(
        self,
        context_value: &Value,
        clause_value: &Value,
        parsed: Option<&Option<ParsedValue>>,
    ) -> bool {
        self.try_eval(context_value, clause_value, parsed)
            .unwrap_or(false)
    }

    fn try_eval(
        self,
        context_value: &Value,
        clause_value: &Value,
        parsed: Option<&Option<ParsedValue>>,
    ) -> Option<bool> {
        match self {
            Self::In => Some(values_equal(context_value, clause_value)),

            Self::StartsWith => Some(context_value.as_str()?.starts_with(clause_value.as_str()?)),
            Self::EndsWith => Some(context_value.as_str()?.ends_with(clause_value.as_str()?)),
            Self::Contains => Some(context_value.as_str()?.contains(clause_value.as_str()?)),

            Self::Matches => {
                let haystack = context_value.as_str()?;
                let regex = clause_regex(clause_value, parsed)?;
                Some(regex.is_match(haystack))
            }

            Self::LessThan
            | Self::LessThanOrEqual
            | Self::GreaterThan
            | Self::GreaterThanOrEqual => {
                let a = context_value.as_f64()?;
                let b = clause_value.as_f64()?;
                Some(self.accepts(a.partial_cmp(&b)?))
            }

            Self::Before | Self::After => {
                let a = parse_date(context_value)?;
                let b = clause_date(clause_value, parsed)?;
                Some(self.accepts(a.cmp(&b)))
            }

            Self::SemVerEqual | Self::SemVerLessThan | Self::SemVerGreaterThan => {
                let a = parse_semver(context_value.as_str()?)?;
                let b = clause_semver(clause_value, parsed)?;
                Some(self.accepts(cmp_precedence(&a, &b)))
            }

            Self::SegmentMatch | Self::Unknown => None,
        }
    }

    fn accepts(self, ordering: Ordering) -> bool {
        match self {
            Self::LessThan | Self::Before | Self::SemVerLessThan => ordering.is_lt(),
            Self::LessThanOrEqual => ordering.is_le(),
            Self::GreaterThan | Self::After | Self::SemVerGreaterThan => ordering.is_gt(),
            Self::GreaterThanOrEqual => ordering.is_ge(),
            Self::SemVerEqual => ordering.is_eq(),
            _ => false,
        }
    }
}

/// JSON equality, except that numbers compare by value (`1 == 1.0`).
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn clause_regex<'a>(
    value: &Value,
    parsed: Option<&'a Option<ParsedValue>>,
) -> Option<Cow<'a, Regex>> {
    match parsed {
        Some(Some(ParsedValue::Regex(regex))) => Some(Cow::Borrowed(regex)),
        Some(_) => None,
        None => Regex::new(value.as_str()?).ok().map(Cow::Owned),
    }
}

fn clause_date(value: &Value, parsed: Option<&Option<ParsedValue>>) -> Option<DateTime<Utc>> {
    match parsed {
        Some(Some(ParsedValue::Date(date))) => Some(*date),
        Some(_) => None,
        None => parse_date(value),
    }
}

fn clause_semver<'a>(
    value: &Value,
    parsed: Option<&'a Option<ParsedValue>>,
) -> Option<Cow<'a, Version>> {
    match parsed {
        Some(Some(ParsedValue::SemVer(version))) => Some(Cow::Borrowed(version)),
        Some(_) => None,
        None => parse_semver(value.as_str()?).map(Cow::Owned),
    }
}

/// Parse a date given as an RFC 3339 string or as milliseconds since the Unix epoch.
pub(crate) fn parse_date(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => Utc.timestamp_millis_opt(n.as_f64()? as i64).single(),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|date| date.with_timezone(&Utc)),
        _ => None,
    }
}

/// Parse a semantic version, accepting versions with missing minor or patch components
/// (`2` is `2.0.0`, `2.1-beta` is `2.1.0-beta`).
pub(crate) fn parse_semver(s: &str) -> Option<Version> {
    if let Ok(version) = Version::parse(s) {
        return Some(version);
    }

    let (core, suffix) = s.split_at(s.find(['-', '+']).unwrap_or(s.len()));
    if core
        .split('.')
        .any(|part| part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()))
    {
        return None;
    }
    let padding = match core.split('.').count() {
        1 => ".0.0",
        2 => ".0",
        _ => return None,
    };
    Version::parse(&format!("{core}{padding}{suffix}")).ok()
}

/// Semver precedence: build metadata is ignored.
fn cmp_precedence(a: &Version, b: &Version) -> Ordering {
    (a.major, a.minor, a.patch)
        .cmp(&(b.major, b.minor, b.patch))
        .then_with(|| a.pre.cmp(&b.pre))
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::{match_clause, parse_semver};
    use crate::{
        compiled::preprocess_clause,
        context::{ContextBuilder, MultiContextBuilder},
        eval::ErrorKind,
        models::{Clause, Operator},
    };

    fn clause(op: Operator, values: Vec<Value>) -> Clause {
        Clause {
            context_kind: None,
            attribute: "attr".to_owned(),
            op,
            values,
            negate: false,
        }
    }

    /// Match with and without preprocessing and check that both agree.
    fn check(op: Operator, values: Vec<Value>, context_value: Value) -> bool {
        let clause = clause(op, values);
        let preprocessed = preprocess_clause(&clause);
        let plain = clause.matches_value(None, &context_value);
        let fast = clause.matches_value(Some(&preprocessed), &context_value);
        assert_eq!(
            plain, fast,
            "{op:?} {:?} {context_value}: results differ with preprocessing",
            clause.values
        );
        plain
    }

    #[test]
    fn in_operator() {
        assert!(check(Operator::In, vec![json!("a")], json!("a")));
        assert!(check(Operator::In, vec![json!("a"), json!("b")], json!("b")));
        assert!(!check(Operator::In, vec![json!("a"), json!("b")], json!("c")));
        assert!(check(Operator::In, vec![json!(1), json!(2)], json!(2.0)));
        assert!(check(Operator::In, vec![json!(true), json!("x")], json!(true)));
        assert!(!check(Operator::In, vec![json!(true), json!("x")], json!(false)));
        assert!(!check(Operator::In, vec![json!("1"), json!("2")], json!(1)));
        assert!(check(
            Operator::In,
            vec![json!({"a": 1}), json!("x")],
            json!({"a": 1})
        ));
    }

    #[test]
    fn string_operators() {
        assert!(check(Operator::StartsWith, vec![json!("ab")], json!("abc")));
        assert!(!check(Operator::StartsWith, vec![json!("bc")], json!("abc")));
        assert!(check(Operator::EndsWith, vec![json!("bc")], json!("abc")));
        assert!(check(Operator::Contains, vec![json!("b")], json!("abc")));
        assert!(!check(Operator::Contains, vec![json!("b")], json!(123)));
        assert!(!check(Operator::StartsWith, vec![json!(1)], json!("1")));
    }

    #[test]
    fn regex_operator() {
        assert!(check(Operator::Matches, vec![json!("^test.*")], json!("test@example.com")));
        assert!(!check(Operator::Matches, vec![json!("^test.*")], json!("example@test.com")));
        // Find anywhere, not full match.
        assert!(check(Operator::Matches, vec![json!("test")], json!("a test string")));
        // Invalid pattern is a non-match, other values still apply.
        assert!(!check(Operator::Matches, vec![json!("***")], json!("***")));
        assert!(check(Operator::Matches, vec![json!("("), json!("x")], json!("xyz")));
    }

    #[test]
    fn numeric_operators() {
        assert!(check(Operator::LessThan, vec![json!(10)], json!(9.5)));
        assert!(!check(Operator::LessThan, vec![json!(10)], json!(10)));
        assert!(check(Operator::LessThanOrEqual, vec![json!(10)], json!(10.0)));
        assert!(check(Operator::GreaterThan, vec![json!(10)], json!(11)));
        assert!(check(Operator::GreaterThanOrEqual, vec![json!(10)], json!(10)));
        assert!(!check(Operator::GreaterThan, vec![json!(10)], json!("11")));
    }

    #[test]
    fn date_operators() {
        let early = json!("2020-01-01T00:00:00Z");
        let late_ms = json!(1_600_000_000_000i64); // 2020-09-13
        assert!(check(Operator::Before, vec![late_ms.clone()], early.clone()));
        assert!(check(Operator::After, vec![early.clone()], late_ms.clone()));
        assert!(!check(Operator::After, vec![late_ms.clone()], early.clone()));
        assert!(check(
            Operator::Before,
            vec![json!("2020-01-01T01:00:00+02:00")],
            json!("2019-12-31T22:00:00Z")
        ));
        assert!(!check(Operator::Before, vec![json!("not a date")], early.clone()));
        assert!(!check(Operator::Before, vec![late_ms], json!(true)));
    }

    #[test]
    fn semver_operators() {
        assert!(check(Operator::SemVerEqual, vec![json!("2.0.0")], json!("2")));
        assert!(check(Operator::SemVerEqual, vec![json!("2.0")], json!("2.0.0")));
        assert!(check(Operator::SemVerEqual, vec![json!("2.0.0+build1")], json!("2.0.0+build2")));
        assert!(check(Operator::SemVerLessThan, vec![json!("2.0.1")], json!("2.0.0")));
        assert!(check(Operator::SemVerLessThan, vec![json!("2.0.0")], json!("2.0.0-rc.1")));
        assert!(check(Operator::SemVerGreaterThan, vec![json!("2.1-beta")], json!("2.1.0")));
        assert!(!check(Operator::SemVerEqual, vec![json!("x.y.z")], json!("x.y.z")));
        assert!(!check(Operator::SemVerEqual, vec![json!("2.0.0")], json!("nope")));
        assert!(!check(Operator::SemVerLessThan, vec![json!("2.0.0")], json!(1)));
    }

    #[test]
    fn semver_normalization() {
        assert_eq!(parse_semver("2").unwrap().to_string(), "2.0.0");
        assert_eq!(parse_semver("2.1-beta.1").unwrap().to_string(), "2.1.0-beta.1");
        assert!(parse_semver("2.").is_none());
        assert!(parse_semver("1.2.3.4").is_none());
        assert!(parse_semver("").is_none());
    }

    #[test]
    fn unknown_and_segment_operators_never_match() {
        assert!(!check(Operator::Unknown, vec![json!("a")], json!("a")));
        assert!(!check(Operator::SegmentMatch, vec![json!("a")], json!("a")));
    }

    #[test]
    fn negate_and_arrays() {
        let mut c = clause(Operator::In, vec![json!("a"), json!("b")]);
        assert!(c.matches_value(None, &json!(["x", "b"])));
        assert!(!c.matches_value(None, &json!(["x", "y"])));
        c.negate = true;
        assert!(c.matches_value(None, &json!("x")));
        assert!(!c.matches_value(None, &json!(["x", "a"])));
        assert!(!c.matches_value(None, &Value::Null));
    }

    #[test]
    fn clause_against_context() {
        let user = ContextBuilder::new("u")
            .set_value("attr", json!("yes"))
            .set_value("address", json!({"city": "Oslo"}))
            .build()
            .unwrap();

        let c = clause(Operator::In, vec![json!("yes")]);
        assert_eq!(match_clause(&c, None, &user), Ok(true));

        // Missing attributes don't match even when negated.
        let c = Clause {
            attribute: "missing".to_owned(),
            negate: true,
            ..c
        };
        assert_eq!(match_clause(&c, None, &user), Ok(false));

        // Without a context kind, the attribute is a literal name.
        let c = Clause {
            attribute: "/address/city".to_owned(),
            negate: false,
            ..clause(Operator::In, vec![json!("Oslo")])
        };
        assert_eq!(match_clause(&c, None, &user), Ok(false));
        let c = Clause {
            context_kind: Some("user".into()),
            ..c
        };
        let pre = preprocess_clause(&c);
        assert_eq!(match_clause(&c, None, &user), Ok(true));
        assert_eq!(match_clause(&c, Some(&pre), &user), Ok(true));
    }

    #[test]
    fn clause_selects_context_by_kind() {
        let user = ContextBuilder::new("u").build().unwrap();
        let org = ContextBuilder::new("o")
            .kind("org")
            .set_value("tier", json!("gold"))
            .build()
            .unwrap();
        let multi = MultiContextBuilder::new()
            .add_context(user.clone())
            .add_context(org)
            .build()
            .unwrap();

        let c = Clause {
            context_kind: Some("org".into()),
            ..clause(Operator::In, vec![json!("gold")])
        };
        let c = Clause {
            attribute: "tier".to_owned(),
            ..c
        };
        assert_eq!(match_clause(&c, None, &multi), Ok(true));
        assert_eq!(match_clause(&c, None, &user), Ok(false));

        let kind_clause = Clause {
            attribute: "kind".to_owned(),
            ..clause(Operator::In, vec![json!("org")])
        };
        assert_eq!(match_clause(&kind_clause, None, &multi), Ok(true));
        assert_eq!(match_clause(&kind_clause, None, &user), Ok(false));
    }

    #[test]
    fn invalid_reference_is_malformed() {
        let user = ContextBuilder::new("u").build().unwrap();
        let c = Clause {
            context_kind: Some("user".into()),
            attribute: "/".to_owned(),
            ..clause(Operator::In, vec![json!("x")])
        };
        assert_eq!(match_clause(&c, None, &user), Err(ErrorKind::MalformedFlag));
        let pre = preprocess_clause(&c);
        assert_eq!(
            match_clause(&c, Some(&pre), &user),
            Err(ErrorKind::MalformedFlag)
        );
    }
}
