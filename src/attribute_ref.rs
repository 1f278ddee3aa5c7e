//! References to context attributes.
//!
//! A reference is either a literal attribute name (clauses that predate context kinds) or a
//! slash-delimited path into nested JSON objects, e.g. `/address/city`. In a path, `~1` stands for
//! `/` and `~0` for `~`.
use std::fmt;

/// A parsed reference to a context attribute.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AttributeRef {
    raw: String,
    parsed: Parsed,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Parsed {
    Components(Box<[String]>),
    Invalid(InvalidRef),
}

/// Reason why an attribute reference cannot be used.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvalidRef {
    /// Reference was an empty string or a single `/`.
    #[error("attribute reference is empty")]
    Empty,
    /// Path contained `//` or a trailing `/`.
    #[error("attribute reference contains an empty path component")]
    EmptyComponent,
    /// `~` was followed by something other than `0` or `1`.
    #[error("attribute reference contains an invalid escape sequence")]
    InvalidEscape,
}

impl AttributeRef {
    /// Parse an attribute reference that may be a slash-delimited path.
    ///
    /// Strings that don't start with `/` are treated as a single attribute name.
    pub fn new(reference: impl Into<String>) -> AttributeRef {
        let raw = reference.into();
        let parsed = parse_path(&raw);
        AttributeRef { raw, parsed }
    }

    /// Create a reference to a top-level attribute, without interpreting `/` or `~`.
    pub fn literal(name: impl Into<String>) -> AttributeRef {
        let raw = name.into();
        let parsed = if raw.is_empty() {
            Parsed::Invalid(InvalidRef::Empty)
        } else {
            Parsed::Components(Box::new([raw.clone()]))
        };
        AttributeRef { raw, parsed }
    }

    /// Returns `true` if the reference can be used to look up attributes.
    pub fn is_valid(&self) -> bool {
        matches!(self.parsed, Parsed::Components(_))
    }

    /// Returns the reason this reference is invalid, if it is.
    pub fn error(&self) -> Option<InvalidRef> {
        match self.parsed {
            Parsed::Components(_) => None,
            Parsed::Invalid(err) => Some(err),
        }
    }

    /// Path components (unescaped). Empty for invalid references.
    pub fn components(&self) -> &[String] {
        match &self.parsed {
            Parsed::Components(components) => components,
            Parsed::Invalid(_) => &[],
        }
    }

    /// The string this reference was created from.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

fn parse_path(raw: &str) -> Parsed {
    if raw.is_empty() || raw == "/" {
        return Parsed::Invalid(InvalidRef::Empty);
    }
    let Some(path) = raw.strip_prefix('/') else {
        return Parsed::Components(Box::new([raw.to_owned()]));
    };

    let mut components = Vec::new();
    for component in path.split('/') {
        if component.is_empty() {
            return Parsed::Invalid(InvalidRef::EmptyComponent);
        }
        match unescape(component) {
            Some(c) => components.push(c),
            None => return Parsed::Invalid(InvalidRef::InvalidEscape),
        }
    }
    Parsed::Components(components.into_boxed_slice())
}

fn unescape(component: &str) -> Option<String> {
    if !component.contains('~') {
        return Some(component.to_owned());
    }
    let mut out = String::with_capacity(component.len());
    let mut chars = component.chars();
    while let Some(c) = chars.next() {
        if c == '~' {
            match chars.next() {
                Some('0') => out.push('~'),
                Some('1') => out.push('/'),
                _ => return None,
            }
        } else {
            out.push(c);
        }
    }
    Some(out)
}

impl fmt::Display for AttributeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl From<&str> for AttributeRef {
    fn from(value: &str) -> Self {
        AttributeRef::new(value)
    }
}
