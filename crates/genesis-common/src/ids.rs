//! Identifier types for stages, content, and sub-entity kinds.

use crate::error::IdentifierError;
use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

/// Namespace assumed when an identifier is written without one.
pub const DEFAULT_NAMESPACE: &str = "genesis";

/// Compact id of a content value stored in a cell section.
///
/// `ContentId::EMPTY` (0) is the value of every unmaterialized block.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize, Pod, Zeroable,
)]
#[repr(transparent)]
pub struct ContentId(u16);

impl ContentId {
    /// The empty content value.
    pub const EMPTY: Self = Self(0);

    /// Creates a content ID from a raw value.
    #[must_use]
    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn raw(self) -> u16 {
        self.0
    }

    /// Checks if this is the empty content value.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Namespaced string identifier, written `namespace:path`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identifier {
    namespace: String,
    path: String,
}

impl Identifier {
    /// Creates an identifier from its two components.
    pub fn new(namespace: &str, path: &str) -> Result<Self, IdentifierError> {
        let full = format!("{namespace}:{path}");
        if namespace.is_empty() || path.is_empty() {
            return Err(IdentifierError::Empty(full));
        }
        let valid = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || "_.-".contains(c);
        if let Some(ch) = namespace.chars().find(|&c| !valid(c)) {
            return Err(IdentifierError::InvalidChar { input: full, ch });
        }
        if let Some(ch) = path.chars().find(|&c| !valid(c) && c != '/') {
            return Err(IdentifierError::InvalidChar { input: full, ch });
        }
        Ok(Self {
            namespace: namespace.to_owned(),
            path: path.to_owned(),
        })
    }

    /// Creates an identifier from literals known to be valid.
    ///
    /// Validity is only checked in debug builds.
    #[must_use]
    pub fn from_static(namespace: &'static str, path: &'static str) -> Self {
        debug_assert!(Self::new(namespace, path).is_ok(), "invalid identifier {namespace}:{path}");
        Self {
            namespace: namespace.to_owned(),
            path: path.to_owned(),
        }
    }

    /// Parses `namespace:path`, or `path` in the default namespace.
    pub fn parse(input: &str) -> Result<Self, IdentifierError> {
        match input.split_once(':') {
            Some((namespace, path)) => Self::new(namespace, path),
            None => Self::new(DEFAULT_NAMESPACE, input),
        }
    }

    /// Creates an identifier in the default namespace.
    pub fn genesis(path: &str) -> Result<Self, IdentifierError> {
        Self::new(DEFAULT_NAMESPACE, path)
    }

    /// Namespace component.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Path component.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Checks whether `input` names this identifier, with or without the
    /// namespace.
    #[must_use]
    pub fn matches(&self, input: &str) -> bool {
        match input.split_once(':') {
            Some((namespace, path)) => namespace == self.namespace && path == self.path,
            None => self.namespace == DEFAULT_NAMESPACE && input == self.path,
        }
    }
}

impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.namespace, self.path)
    }
}

impl std::str::FromStr for Identifier {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Identifier {
    type Error = IdentifierError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Identifier> for String {
    fn from(id: Identifier) -> Self {
        id.to_string()
    }
}
