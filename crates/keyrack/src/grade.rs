//! Grade guard
//!
//! A grade is the `{protection, duration}` classification of where and how a
//! key is stored. Grades only ever move up: once a key has been encrypted it
//! may not be moved to plaintext storage, and once it has been ephemeral it
//! may not become permanent.

use crate::error::{KeyrackError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How a stored value is protected at rest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protection {
    Plaintext,
    Encrypted,
}

impl Protection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plaintext => "plaintext",
            Self::Encrypted => "encrypted",
        }
    }
}

/// How long a granted credential stays valid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Duration {
    /// Lives only in session memory
    Transient,
    /// Short-lived, exchanged at grant time
    Ephemeral,
    /// Valid until someone revokes it
    Permanent,
}

impl Duration {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Ephemeral => "ephemeral",
            Self::Permanent => "permanent",
        }
    }

    /// Lifetime rank (higher = longer-lived = weaker)
    pub fn rank(&self) -> u8 {
        match self {
            Self::Transient => 0,
            Self::Ephemeral => 1,
            Self::Permanent => 2,
        }
    }
}

/// Security classification of a stored key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grade {
    pub protection: Protection,
    pub duration: Duration,
}

impl Grade {
    pub fn new(protection: Protection, duration: Duration) -> Self {
        Self {
            protection,
            duration,
        }
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.protection.as_str(), self.duration.as_str())
    }
}

/// Minimum grade a repo declares for a key
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GradeRequirement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protection: Option<Protection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<Duration>,
}

impl GradeRequirement {
    pub fn is_empty(&self) -> bool {
        self.protection.is_none() && self.duration.is_none()
    }

    /// Parse the keyword form used in keyrack.yml (`encrypted`, `ephemeral`,
    /// or both joined by `,`, `+` or whitespace)
    pub fn from_keywords(s: &str) -> Option<Self> {
        let mut requirement = Self::default();
        let words = s
            .split(|c: char| c == ',' || c == '+' || c.is_whitespace())
            .filter(|w| !w.is_empty());

        for word in words {
            match word.to_lowercase().as_str() {
                "encrypted" => requirement.protection = Some(Protection::Encrypted),
                "ephemeral" => requirement.duration = Some(Duration::Ephemeral),
                _ => return None,
            }
        }

        if requirement.is_empty() {
            None
        } else {
            Some(requirement)
        }
    }

    /// Keyword form, inverse of `from_keywords`
    pub fn to_keywords(&self) -> String {
        let mut words = vec![];
        if self.protection == Some(Protection::Encrypted) {
            words.push("encrypted");
        }
        if self.duration == Some(Duration::Ephemeral) {
            words.push("ephemeral");
        }
        words.join(",")
    }
}

/// Result of comparing two grades
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GradeChange {
    pub degrades: bool,
    pub reason: Option<String>,
}

/// Compare a key's current grade against a proposed one
pub fn detect_change(source: &Grade, target: &Grade) -> GradeChange {
    let mut reasons = vec![];

    if source.protection == Protection::Encrypted && target.protection == Protection::Plaintext {
        reasons.push("protection would degrade from encrypted to plaintext".to_string());
    }

    if target.duration.rank() > source.duration.rank() {
        reasons.push(format!(
            "duration would degrade from {} to {}",
            source.duration.as_str(),
            target.duration.as_str()
        ));
    }

    GradeChange {
        degrades: !reasons.is_empty(),
        reason: if reasons.is_empty() {
            None
        } else {
            Some(reasons.join("; "))
        },
    }
}

/// Reject any change that weakens a key's grade
pub fn assert_protected(slug: &str, source: &Grade, target: &Grade) -> Result<()> {
    let change = detect_change(source, target);
    if change.degrades {
        return Err(KeyrackError::GradeDegraded {
            slug: slug.to_string(),
            reason: change.reason.unwrap_or_default(),
        });
    }
    Ok(())
}

/// Reject storage that does not meet the repo's declared minimum grade
pub fn assert_satisfies(slug: &str, required: &GradeRequirement, actual: &Grade) -> Result<()> {
    if required.protection == Some(Protection::Encrypted)
        && actual.protection != Protection::Encrypted
    {
        return Err(KeyrackError::GradeUnsatisfied {
            slug: slug.to_string(),
            reason: format!("requires encrypted storage, got {}", actual.protection.as_str()),
        });
    }

    if let Some(duration) = required.duration {
        if actual.duration.rank() > duration.rank() {
            return Err(KeyrackError::GradeUnsatisfied {
                slug: slug.to_string(),
                reason: format!(
                    "requires {} credentials, got {}",
                    duration.as_str(),
                    actual.duration.as_str()
                ),
            });
        }
    }

    Ok(())
}
