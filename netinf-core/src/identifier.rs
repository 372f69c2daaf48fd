//! Content identifiers: hash algorithm + hash value, rendered as `ni:///alg;value`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Scheme prefix of a named-information URI without authority.
pub const NI_SCHEME: &str = "ni:///";

/// Names one piece of content. Equality is by (algorithm, value).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentIdentifier {
    hash_algorithm: String,
    hash_value: String,
}

impl ContentIdentifier {
    pub fn new(hash_algorithm: impl Into<String>, hash_value: impl Into<String>) -> Self {
        Self {
            hash_algorithm: hash_algorithm.into(),
            hash_value: hash_value.into(),
        }
    }

    pub fn hash_algorithm(&self) -> &str {
        &self.hash_algorithm
    }

    pub fn hash_value(&self) -> &str {
        &self.hash_value
    }

    /// URI carried in publish requests: `ni:///alg;value?ct=<content_type>`.
    pub fn to_uri_with_content_type(&self, content_type: &str) -> String {
        format!("{}?ct={}", self, content_type)
    }
}

impl fmt::Display for ContentIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{};{}", NI_SCHEME, self.hash_algorithm, self.hash_value)
    }
}

/// Accepts `ni:///alg;value`, `ni://authority/alg;value`, an optional `?query`, or a bare `alg;value`.
impl FromStr for ContentIdentifier {
    type Err = IdentifierParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = match s.strip_prefix("ni://") {
            Some(after) => after
                .split_once('/')
                .map(|(_, path)| path)
                .ok_or(IdentifierParseError::MissingPath)?,
            None => s,
        };
        let rest = rest.split('?').next().unwrap_or(rest);
        let (alg, value) = rest
            .split_once(';')
            .ok_or(IdentifierParseError::MissingSeparator)?;
        if alg.is_empty() {
            return Err(IdentifierParseError::EmptyAlgorithm);
        }
        if value.is_empty() {
            return Err(IdentifierParseError::EmptyHash);
        }
        Ok(Self::new(alg, value))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentifierParseError {
    #[error("ni uri has no path after the authority")]
    MissingPath,
    #[error("missing ';' between hash algorithm and value")]
    MissingSeparator,
    #[error("empty hash algorithm")]
    EmptyAlgorithm,
    #[error("empty hash value")]
    EmptyHash,
}
