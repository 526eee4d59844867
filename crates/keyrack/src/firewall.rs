//! Firewall for dangerous long-lived tokens
//!
//! Every value is checked immediately before it is handed to a caller, no
//! matter which vault or mechanism produced it. A value that looks like a
//! long-lived platform token is blocked unless the caller passes
//! `allow_dangerous` for that one invocation.
//!
//! Short-lived shapes (GitHub installation tokens `ghs_`, AWS session keys
//! `ASIA`) are not blocked.

use crate::secret::SecretValue;
use regex::Regex;
use std::sync::OnceLock;

/// A recognized dangerous token shape
#[derive(Debug, Clone, Copy)]
pub struct FirewallRule {
    pub label: &'static str,
    pub pattern: &'static str,
}

pub const RULES: &[FirewallRule] = &[
    FirewallRule {
        label: "github classic personal access token",
        pattern: r"\bghp_[A-Za-z0-9]{30,}",
    },
    FirewallRule {
        label: "github oauth access token",
        pattern: r"\bgho_[A-Za-z0-9]{30,}",
    },
    FirewallRule {
        label: "github fine-grained personal access token",
        pattern: r"\bgithub_pat_[A-Za-z0-9_]{22,}",
    },
    FirewallRule {
        label: "aws long-lived access key id",
        pattern: r"\bAKIA[0-9A-Z]{16}",
    },
    FirewallRule {
        label: "gitlab personal access token",
        pattern: r"\bglpat-[A-Za-z0-9_\-]{20,}",
    },
    FirewallRule {
        label: "slack bot or user token",
        pattern: r"\bxox[bp]-[A-Za-z0-9\-]{10,}",
    },
];

fn compiled() -> &'static [(Regex, &'static str)] {
    static COMPILED: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    COMPILED.get_or_init(|| {
        RULES
            .iter()
            .map(|rule| {
                let regex = Regex::new(rule.pattern).expect("firewall patterns are valid");
                (regex, rule.label)
            })
            .collect()
    })
}

/// Outcome of a firewall check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallVerdict {
    pub blocked: bool,
    /// Matched labels, also reported when bypassed
    pub matches: Vec<&'static str>,
    /// Human-readable reasons, set only when blocked
    pub reasons: Vec<String>,
}

/// Labels of every dangerous shape found in the value
pub fn inspect(value: &SecretValue) -> Vec<&'static str> {
    compiled()
        .iter()
        .filter(|(regex, _)| regex.is_match(value.expose()))
        .map(|(_, label)| *label)
        .collect()
}

/// Decide whether a resolved value may be returned
pub fn check(value: &SecretValue, allow_dangerous: bool) -> FirewallVerdict {
    let matches = inspect(value);

    if matches.is_empty() || allow_dangerous {
        return FirewallVerdict {
            blocked: false,
            matches,
            reasons: vec![],
        };
    }

    let reasons = matches
        .iter()
        .map(|label| {
            format!(
                "value looks like a {}; long-lived tokens are blocked, prefer an ephemeral mechanism or pass --allow-dangerous",
                label
            )
        })
        .collect();

    FirewallVerdict {
        blocked: true,
        matches,
        reasons,
    }
}
