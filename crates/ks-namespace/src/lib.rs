//! Deterministic key encoding for tenant/adapter isolation.
//!
//! `Namespace` implements the `root:rootId:key` scheme from the data
//! model: two namespaces with a different `root` or `root_id` never
//! produce colliding encoded keys for any input key.

use std::fmt;

/// A cache/lock/rate-limiter key: either a single segment or an ordered
/// sequence of segments joined with the namespace's `key_delim`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Key {
    Single(String),
    Sequence(Vec<String>),
}

impl Key {
    fn parts(&self) -> Vec<&str> {
        match self {
            Key::Single(s) => vec![s.as_str()],
            Key::Sequence(parts) => parts.iter().map(String::as_str).collect(),
        }
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Key::Single(value.to_owned())
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Key::Single(value)
    }
}

impl From<Vec<String>> for Key {
    fn from(value: Vec<String>) -> Self {
        Key::Sequence(value)
    }
}

impl<'a> From<&'a [&'a str]> for Key {
    fn from(value: &'a [&'a str]) -> Self {
        Key::Sequence(value.iter().map(|s| (*s).to_owned()).collect())
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.parts().join("/"))
    }
}

/// The encoded form of a key as stored by an adapter.
pub type EncodedKey = String;

/// Deterministic key encoding: `join(root) + idDelim + rootId + idDelim + join(key)`.
///
/// Immutable: every builder method (`with_root`, `append_root`,
/// `with_root_id`, `with_delims`) consumes `self` and returns a new
/// `Namespace`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    root: Vec<String>,
    root_id: String,
    id_delim: String,
    key_delim: String,
}

impl Default for Namespace {
    /// A namespace with an empty root, empty root id, and `:` delimiters.
    fn default() -> Self {
        Self {
            root: Vec::new(),
            root_id: String::new(),
            id_delim: ":".to_owned(),
            key_delim: ":".to_owned(),
        }
    }
}

impl Namespace {
    pub fn new(root: Vec<String>, root_id: impl Into<String>) -> Self {
        Self {
            root,
            root_id: root_id.into(),
            ..Self::default()
        }
    }

    /// The default pass-through namespace: encodes a single-segment key
    /// as itself, so callers that never configured a namespace still get
    /// a usable adapter key. Sequence keys are still joined, since a
    /// pass-through namespace has no way to losslessly flatten them.
    pub fn no_op() -> Self {
        Self {
            root: Vec::new(),
            root_id: String::new(),
            id_delim: String::new(),
            key_delim: String::new(),
        }
    }

    pub fn with_root(self, root: Vec<String>) -> Self {
        Self { root, ..self }
    }

    pub fn append_root(mut self, segment: impl Into<String>) -> Self {
        self.root.push(segment.into());
        self
    }

    pub fn with_root_id(self, root_id: impl Into<String>) -> Self {
        Self {
            root_id: root_id.into(),
            ..self
        }
    }

    pub fn with_delims(self, id_delim: impl Into<String>, key_delim: impl Into<String>) -> Self {
        Self {
            id_delim: id_delim.into(),
            key_delim: key_delim.into(),
            ..self
        }
    }

    pub fn root(&self) -> &[String] {
        &self.root
    }

    pub fn root_id(&self) -> &str {
        &self.root_id
    }

    /// The concatenation up to and including the root-id delimiter, used
    /// for bulk `clear`/`removeByPrefix` on adapters.
    pub fn prefix(&self) -> String {
        format!(
            "{}{}{}{}",
            self.root.join(&self.key_delim),
            self.id_delim,
            self.root_id,
            self.id_delim
        )
    }

    /// Deterministic encoding per the data model.
    pub fn create(&self, key: impl Into<Key>) -> EncodedKey {
        let key = key.into();
        format!("{}{}", self.prefix(), key.parts().join(&self.key_delim))
    }

    /// Strip this namespace's prefix from an encoded key, recovering the
    /// original sequence of key segments. Returns `None` if `encoded`
    /// does not carry this namespace's prefix.
    pub fn decode(&self, encoded: &str) -> Option<Key> {
        let prefix = self.prefix();
        let rest = encoded.strip_prefix(&prefix)?;
        if self.key_delim.is_empty() {
            return Some(Key::Single(rest.to_owned()));
        }
        let parts: Vec<String> = rest.split(&self.key_delim).map(str::to_owned).collect();
        Some(Key::Sequence(parts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_encoding() {
        let ns = Namespace::new(vec!["cache".into(), "user".into()], "root1");
        assert_eq!(ns.create("profile"), "cache:user:root1:profile");
    }

    #[test]
    fn sequence_key_joined() {
        let ns = Namespace::new(vec!["cache".into()], "root1");
        let key: Key = vec!["a".to_owned(), "b".to_owned()].into();
        assert_eq!(ns.create(key), "cache:root1:a:b");
    }

    #[test]
    fn decode_round_trips_through_create() {
        let ns = Namespace::new(vec!["cache".into()], "root1");
        let encoded = ns.create("profile");
        assert_eq!(ns.decode(&encoded), Some(Key::Single("profile".into())));
    }

    #[test]
    fn different_root_id_never_collides() {
        let a = Namespace::new(vec!["cache".into()], "tenantA");
        let b = Namespace::new(vec!["cache".into()], "tenantB");
        assert_ne!(a.create("k"), b.create("k"));
        assert!(a.decode(&b.create("k")).is_none());
    }

    #[test]
    fn different_root_never_collides() {
        let a = Namespace::new(vec!["cache".into(), "user".into()], "root1");
        let b = Namespace::new(vec!["cache".into(), "product".into()], "root1");
        assert_ne!(a.create("1"), b.create("1"));
    }

    #[test]
    fn custom_delims() {
        let ns = Namespace::new(vec!["cache".into()], "r").with_delims("::", "/");
        assert_eq!(ns.create("a"), "cache::r::a");
    }

    #[test]
    fn no_op_passes_single_key_through() {
        let ns = Namespace::no_op();
        assert_eq!(ns.create("profile"), "profile");
    }

    #[test]
    fn append_root_is_immutable() {
        let base = Namespace::new(vec!["cache".into()], "r");
        let extended = base.clone().append_root("user");
        assert_ne!(base.prefix(), extended.prefix());
        assert_eq!(base.create("k"), "cache:r:k");
        assert_eq!(extended.create("k"), "cache:user:r:k");
    }

    #[test]
    fn prefix_used_for_bulk_clear_matching() {
        let ns = Namespace::new(vec!["cache".into(), "user".into()], "root1");
        let key = ns.create("1");
        assert!(key.starts_with(&ns.prefix()));
    }
}
