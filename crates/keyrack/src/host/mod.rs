//! Host manifest
//!
//! Per-machine (and optionally per-owner) index of where each key is
//! stored. The whole manifest is one age file encrypted to its own
//! recipient list; it is decrypted only for the length of one operation.

mod store;

pub use store::{HostStore, InitOutcome};

use crate::envelope::RecipientMech;
use crate::grade::Grade;
use crate::mech::Mechanism;
use crate::slug::Slug;
use crate::vault::{self, VaultKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostManifest {
    pub uri: String,
    pub owner: Option<String>,
    pub recipients: Vec<Recipient>,
    #[serde(default)]
    pub hosts: BTreeMap<Slug, KeyHost>,
}

impl HostManifest {
    pub fn pubkeys(&self) -> Vec<String> {
        self.recipients.iter().map(|r| r.pubkey.clone()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipient {
    pub mech: RecipientMech,
    pub pubkey: String,
    pub label: String,
    pub added_at: DateTime<Utc>,
}

/// Where and how one key is stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyHost {
    pub slug: Slug,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exid: Option<String>,
    pub vault: VaultKind,
    pub mech: Mechanism,
    pub env: String,
    pub org: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vault_recipient: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl KeyHost {
    pub fn grade(&self) -> Grade {
        vault::grade_of(self.vault, self.mech)
    }

    /// Same storage attributes, timestamps ignored
    pub fn same_storage(&self, input: &KeyHostInput) -> bool {
        self.vault == input.vault
            && self.mech == input.mech
            && self.env == input.slug.env
            && self.org == input.slug.org
            && self.exid == input.exid
            && self.vault_recipient == input.vault_recipient
            && self.max_duration == input.max_duration
    }
}

/// Requested storage for a key
#[derive(Debug, Clone)]
pub struct KeyHostInput {
    pub slug: Slug,
    pub vault: VaultKind,
    pub mech: Mechanism,
    pub exid: Option<String>,
    pub vault_recipient: Option<String>,
    pub max_duration: Option<String>,
}

impl KeyHostInput {
    pub fn grade(&self) -> Grade {
        vault::grade_of(self.vault, self.mech)
    }
}

/// Outcome of a find-or-insert
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Findsert {
    /// Identical record already present, returned unchanged
    Found(KeyHost),
    Created(KeyHost),
    Updated(KeyHost),
}

impl Findsert {
    pub fn host(&self) -> &KeyHost {
        match self {
            Self::Found(h) | Self::Created(h) | Self::Updated(h) => h,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Found(_) => "found",
            Self::Created(_) => "created",
            Self::Updated(_) => "updated",
        }
    }
}
