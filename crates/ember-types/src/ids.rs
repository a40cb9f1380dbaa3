//! Identity types for monitored workloads and tracked countries.
//!
//! A [`ContainerKey`] never changes once observed: every measurement,
//! block, and persisted row is addressed by it. A [`CountryCode`] is a
//! validated, upper-cased ISO 3166-1 alpha-2 code.

use core::fmt;

use serde::{Deserialize, Serialize};

/// Identity of a monitored workload.
///
/// Ordering is lexicographic over `(pod, container, namespace)`, which
/// gives stable listings in the API.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContainerKey {
    /// Pod name.
    pub pod: String,
    /// Container name within the pod.
    pub container: String,
    /// Namespace the pod runs in.
    pub namespace: String,
}

impl ContainerKey {
    /// Create a key from its three parts.
    pub fn new(
        pod: impl Into<String>,
        container: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            pod: pod.into(),
            container: container.into(),
            namespace: namespace.into(),
        }
    }
}

impl fmt::Display for ContainerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.pod, self.container)
    }
}

/// A code that is not a two-letter ISO country code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid country code: {0:?}")]
pub struct CountryCodeError(pub String);

/// ISO 3166-1 alpha-2 country code, always upper case.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CountryCode(String);

impl CountryCode {
    /// Parse and normalise a country code.
    ///
    /// Surrounding whitespace is trimmed and letters are upper-cased, so
    /// `" de"` parses as `DE`.
    ///
    /// # Errors
    ///
    /// Returns [`CountryCodeError`] unless the input is exactly two ASCII
    /// letters.
    pub fn parse(raw: &str) -> Result<Self, CountryCodeError> {
        let trimmed = raw.trim();
        if trimmed.len() == 2 && trimmed.chars().all(|c| c.is_ascii_alphabetic()) {
            Ok(Self(trimmed.to_ascii_uppercase()))
        } else {
            Err(CountryCodeError(raw.to_owned()))
        }
    }

    /// The code as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CountryCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for CountryCode {
    type Error = CountryCodeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<CountryCode> for String {
    fn from(code: CountryCode) -> Self {
        code.0
    }
}
