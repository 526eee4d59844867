//! Fully-qualified key identifiers: `org.env.key`

use crate::error::{KeyrackError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The env bucket whose keys are visible from every declared env
pub const ALL_ENV: &str = "all";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Slug {
    pub org: String,
    pub env: String,
    pub name: String,
}

impl Slug {
    pub fn new(org: &str, env: &str, name: &str) -> Result<Self> {
        validate_segment("org", org)?;
        validate_segment("env", env)?;
        validate_segment("key", name)?;
        Ok(Self {
            org: org.to_string(),
            env: env.to_string(),
            name: name.to_string(),
        })
    }

    /// Same key, filed under the `all` bucket
    pub fn in_all(&self) -> Self {
        Self {
            org: self.org.clone(),
            env: ALL_ENV.to_string(),
            name: self.name.clone(),
        }
    }

    pub fn is_all(&self) -> bool {
        self.env == ALL_ENV
    }

    /// True when `raw` looks like a slug rather than a bare key name
    pub fn looks_like(raw: &str) -> bool {
        raw.split('.').count() == 3
    }
}

/// Segments are non-empty and free of dots and whitespace
pub fn validate_segment(what: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(KeyrackError::InvalidKey(format!("{} cannot be empty", what)));
    }

    for c in value.chars() {
        if !c.is_ascii_alphanumeric() && c != '_' && c != '-' {
            return Err(KeyrackError::InvalidKey(format!(
                "invalid character '{}' in {} '{}'",
                c, what, value
            )));
        }
    }

    Ok(())
}

impl fmt::Display for Slug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.org, self.env, self.name)
    }
}

impl FromStr for Slug {
    type Err = KeyrackError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('.').collect();
        match parts.as_slice() {
            [org, env, name] => Self::new(org, env, name),
            _ => Err(KeyrackError::InvalidKey(format!(
                "expected org.env.key, got '{}'",
                s
            ))),
        }
    }
}

impl TryFrom<String> for Slug {
    type Error = KeyrackError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Slug> for String {
    fn from(slug: Slug) -> Self {
        slug.to_string()
    }
}
