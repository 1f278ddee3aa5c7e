//! Evaluation contexts.
//!
//! A [`Context`] is either a single context of one kind (e.g., a `user`) or a multi-kind context
//! that bundles several single contexts of distinct kinds (e.g., a `user` and an `org`).
use std::{borrow::Cow, collections::HashMap};

use serde_json::Value;

use crate::{attribute_ref::AttributeRef, Error, Result, Str};

/// Kind used when none is specified.
pub const DEFAULT_KIND: &str = "user";
const MULTI_KIND: &str = "multi";

/// A single context of one kind.
#[derive(Debug, Clone, PartialEq)]
pub struct SingleContext {
    kind: Str,
    key: Str,
    name: Option<Str>,
    anonymous: bool,
    attributes: HashMap<String, Value>,
}

impl SingleContext {
    /// Context kind, e.g. `user`.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Context key. Unique within the kind.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn anonymous(&self) -> bool {
        self.anonymous
    }

    /// Look up an attribute value by reference.
    ///
    /// The first path component may name one of the built-in attributes (`kind`, `key`, `name`,
    /// `anonymous`). Remaining components index into nested JSON objects. Returns `None` if the
    /// attribute is absent or the reference is invalid.
    pub fn get_value(&self, reference: &AttributeRef) -> Option<Cow<'_, Value>> {
        let (first, rest) = reference.components().split_first()?;

        let top: Cow<'_, Value> = match first.as_str() {
            "kind" => Cow::Owned(Value::String(self.kind.to_string())),
            "key" => Cow::Owned(Value::String(self.key.to_string())),
            "name" => Cow::Owned(Value::String(self.name.as_ref()?.to_string())),
            "anonymous" => Cow::Owned(Value::Bool(self.anonymous)),
            name => Cow::Borrowed(self.attributes.get(name)?),
        };

        if rest.is_empty() {
            return Some(top);
        }

        match top {
            Cow::Borrowed(mut value) => {
                for component in rest {
                    value = value.as_object()?.get(component)?;
                }
                Some(Cow::Borrowed(value))
            }
            // Built-in attributes are never objects.
            Cow::Owned(_) => None,
        }
    }
}

/// A context to evaluate flags against.
#[derive(Debug, Clone, PartialEq)]
pub enum Context {
    /// A context of a single kind.
    Single(SingleContext),
    /// Several contexts of distinct kinds, sorted by kind.
    Multi(Box<[SingleContext]>),
}

impl Context {
    /// Kind of the context. `multi` for multi-kind contexts.
    pub fn kind(&self) -> &str {
        match self {
            Context::Single(c) => c.kind(),
            Context::Multi(_) => MULTI_KIND,
        }
    }

    /// All single contexts contained in this context.
    pub fn contexts(&self) -> &[SingleContext] {
        match self {
            Context::Single(c) => std::slice::from_ref(c),
            Context::Multi(contexts) => contexts,
        }
    }

    /// Kinds present in this context.
    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.contexts().iter().map(|c| c.kind())
    }

    /// Select a single context of the given kind.
    pub fn as_kind(&self, kind: &str) -> Option<&SingleContext> {
        self.contexts().iter().find(|c| c.kind() == kind)
    }

    /// Key of the context. For a single context of kind `user` this is just the key; other kinds
    /// are prefixed with kind, and multi-kind contexts concatenate all kinds.
    pub fn canonical_key(&self) -> String {
        match self {
            Context::Single(c) if c.kind() == DEFAULT_KIND => c.key().to_owned(),
            _ => self
                .contexts()
                .iter()
                .map(|c| format!("{}:{}", c.kind(), escape_key(c.key())))
                .collect::<Vec<_>>()
                .join(":"),
        }
    }
}

fn escape_key(key: &str) -> Cow<'_, str> {
    if key.contains(['%', ':']) {
        Cow::Owned(key.replace('%', "%25").replace(':', "%3A"))
    } else {
        Cow::Borrowed(key)
    }
}

fn validate_kind(kind: &str) -> Result<()> {
    if kind.is_empty() {
        return Err(Error::InvalidContext("context kind must not be empty".to_owned()));
    }
    if kind == "kind" || kind == MULTI_KIND {
        return Err(Error::InvalidContext(format!(
            "context kind cannot be {kind:?}"
        )));
    }
    if !kind
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
    {
        return Err(Error::InvalidContext(format!(
            "context kind {kind:?} contains disallowed characters"
        )));
    }
    Ok(())
}

/// Builder for a single-kind [`Context`].
///
/// # Examples
/// ```
/// # use flag_engine::ContextBuilder;
/// let context = ContextBuilder::new("user-key")
///     .name("Alice")
///     .set_value("country", "US".into())
///     .build()
///     .unwrap();
/// assert_eq!(context.kind(), "user");
/// ```
#[derive(Debug, Clone)]
pub struct ContextBuilder {
    kind: Str,
    key: Str,
    name: Option<Str>,
    anonymous: bool,
    attributes: HashMap<String, Value>,
}

impl ContextBuilder {
    pub fn new(key: impl Into<Str>) -> ContextBuilder {
        ContextBuilder {
            kind: Str::from_static_str(DEFAULT_KIND),
            key: key.into(),
            name: None,
            anonymous: false,
            attributes: HashMap::new(),
        }
    }

    pub fn kind(mut self, kind: impl Into<Str>) -> ContextBuilder {
        self.kind = kind.into();
        self
    }

    pub fn key(mut self, key: impl Into<Str>) -> ContextBuilder {
        self.key = key.into();
        self
    }

    pub fn name(mut self, name: impl Into<Str>) -> ContextBuilder {
        self.name = Some(name.into());
        self
    }

    pub fn anonymous(mut self, anonymous: bool) -> ContextBuilder {
        self.anonymous = anonymous;
        self
    }

    /// Set an attribute. Built-in attribute names update the corresponding field when the value
    /// has the right type and are ignored otherwise.
    pub fn set_value(mut self, name: &str, value: Value) -> ContextBuilder {
        match (name, value) {
            ("kind", Value::String(kind)) => self.kind = kind.into(),
            ("key", Value::String(key)) => self.key = key.into(),
            ("name", Value::String(n)) => self.name = Some(n.into()),
            ("name", Value::Null) => self.name = None,
            ("anonymous", Value::Bool(b)) => self.anonymous = b,
            ("kind" | "key" | "name" | "anonymous", _) => {}
            (_, Value::Null) => {
                self.attributes.remove(name);
            }
            (_, value) => {
                self.attributes.insert(name.to_owned(), value);
            }
        }
        self
    }

    /// Validate and build the context.
    pub fn build(self) -> Result<Context> {
        validate_kind(&self.kind)?;
        if self.key.is_empty() {
            return Err(Error::InvalidContext("context key must not be empty".to_owned()));
        }
        Ok(Context::Single(SingleContext {
            kind: self.kind,
            key: self.key,
            name: self.name,
            anonymous: self.anonymous,
            attributes: self.attributes,
        }))
    }
}

/// Builder for a multi-kind [`Context`].
#[derive(Debug, Clone, Default)]
pub struct MultiContextBuilder {
    contexts: Vec<SingleContext>,
}

impl MultiContextBuilder {
    pub fn new() -> MultiContextBuilder {
        MultiContextBuilder::default()
    }

    /// Add a context. Adding a multi-kind context adds each of its single contexts.
    pub fn add_context(mut self, context: Context) -> MultiContextBuilder {
        match context {
            Context::Single(c) => self.contexts.push(c),
            Context::Multi(contexts) => self.contexts.extend(contexts.into_vec()),
        }
        self
    }

    /// Build the context. A builder with exactly one context produces a single context.
    pub fn build(mut self) -> Result<Context> {
        if self.contexts.is_empty() {
            return Err(Error::InvalidContext(
                "multi-kind context must contain at least one context".to_owned(),
            ));
        }
        if self.contexts.len() == 1 {
            return Ok(Context::Single(self.contexts.remove(0)));
        }

        self.contexts.sort_by(|a, b| a.kind.cmp(&b.kind));
        if let Some(w) = self.contexts.windows(2).find(|w| w[0].kind == w[1].kind) {
            return Err(Error::InvalidContext(format!(
                "multi-kind context contains kind {:?} more than once",
                w[0].kind()
            )));
        }
        Ok(Context::Multi(self.contexts.into_boxed_slice()))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{ContextBuilder, MultiContextBuilder};
    use crate::attribute_ref::AttributeRef;

    #[test]
    fn default_kind_is_user() {
        let c = ContextBuilder::new("a").build().unwrap();
        assert_eq!(c.kind(), "user");
        assert_eq!(c.canonical_key(), "a");
    }

    #[test]
    fn rejects_invalid_kinds_and_keys() {
        assert!(ContextBuilder::new("").build().is_err());
        assert!(ContextBuilder::new("a").kind("multi").build().is_err());
        assert!(ContextBuilder::new("a").kind("kind").build().is_err());
        assert!(ContextBuilder::new("a").kind("no spaces").build().is_err());
        assert!(ContextBuilder::new("a").kind("org.v2_x-y").build().is_ok());
    }

    #[test]
    fn builtin_and_nested_attributes() {
        let c = ContextBuilder::new("a")
            .name("Alice")
            .set_value("address", json!({"city": "Oslo"}))
            .build()
            .unwrap();
        let c = &c.contexts()[0];
        assert_eq!(
            c.get_value(&AttributeRef::new("key")).unwrap().as_ref(),
            &json!("a")
        );
        assert_eq!(
            c.get_value(&AttributeRef::new("name")).unwrap().as_ref(),
            &json!("Alice")
        );
        assert_eq!(
            c.get_value(&AttributeRef::new("/address/city"))
                .unwrap()
                .as_ref(),
            &json!("Oslo")
        );
        assert!(c.get_value(&AttributeRef::new("/address/zip")).is_none());
        assert!(c.get_value(&AttributeRef::new("/key/nested")).is_none());
    }

    #[test]
    fn multi_context_sorted_and_deduplicated() {
        let user = ContextBuilder::new("u").build().unwrap();
        let org = ContextBuilder::new("o:1").kind("org").build().unwrap();
        let multi = MultiContextBuilder::new()
            .add_context(user.clone())
            .add_context(org.clone())
            .build()
            .unwrap();
        assert_eq!(multi.kind(), "multi");
        assert_eq!(multi.kinds().collect::<Vec<_>>(), ["org", "user"]);
        assert_eq!(multi.as_kind("org").unwrap().key(), "o:1");
        assert_eq!(multi.canonical_key(), "org:o%3A1:user:u");

        assert!(MultiContextBuilder::new()
            .add_context(user.clone())
            .add_context(user)
            .build()
            .is_err());
    }

    #[test]
    fn multi_builder_with_one_context_is_single() {
        let org = ContextBuilder::new("o").kind("org").build().unwrap();
        let c = MultiContextBuilder::new().add_context(org).build().unwrap();
        assert_eq!(c.kind(), "org");
    }
}
