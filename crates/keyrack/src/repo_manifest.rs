//! Repo manifest (`keyrack.yml`)
//!
//! Declares which keys a repository may ask for:
//!
//! ```yaml
//! org: acme
//! extends:
//!   - ../shared/keyrack.yml
//! env.all:
//!   - SENTRY_DSN
//! env.test:
//!   - DB_PASSWORD: encrypted
//!   - GITHUB_TOKEN:
//!       grade: ephemeral
//!       mech: EPHEMERAL_VIA_GITHUB_APP
//! env.prod:
//!   - DB_PASSWORD: encrypted
//! ```
//!
//! `extends` targets are resolved depth-first, each into a partial key set.
//! Later extends override earlier ones and the root overrides everything it
//! inherits. The root's `org` is the only org that counts.

use crate::error::{KeyrackError, Result};
use crate::grade::GradeRequirement;
use crate::mech::Mechanism;
use crate::slug::{self, Slug, ALL_ENV};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const MANIFEST_FILE: &str = "keyrack.yml";
const AGENT_DIR: &str = ".agent";
const ENV_PREFIX: &str = "env.";

/// One declared key
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeySpec {
    /// Where the key is stored; `org.all.NAME` for `env.all` keys
    pub slug: Slug,
    pub env: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mech: Option<Mechanism>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grade: Option<GradeRequirement>,
}

/// A fully resolved repo manifest
#[derive(Debug, Clone, Serialize)]
pub struct RepoManifest {
    pub path: PathBuf,
    pub org: String,
    /// Declared envs, `all` excluded
    pub envs: Vec<String>,
    pub keys: BTreeMap<Slug, KeySpec>,
}

#[derive(Debug, Clone)]
struct Entry {
    name: String,
    grade: Option<GradeRequirement>,
    mech: Option<Mechanism>,
}

/// Keys contributed by one file and everything it extends
#[derive(Debug, Default)]
struct Partial {
    org: Option<String>,
    envs: BTreeSet<String>,
    keys: BTreeMap<(String, String), Entry>,
}

impl Partial {
    fn overlay(&mut self, other: Partial) {
        self.envs.extend(other.envs);
        self.keys.extend(other.keys);
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LongEntry {
    #[serde(default)]
    grade: Option<String>,
    #[serde(default)]
    mech: Option<Mechanism>,
}

/// Resolve a repo manifest and its extends chain
pub fn resolve(path: &Path) -> Result<RepoManifest> {
    if !path.exists() {
        return Err(KeyrackError::RepoManifestNotFound(path.to_path_buf()));
    }

    let mut chain = Vec::new();
    let partial = collect(path, &mut chain)?;

    let org = partial
        .org
        .ok_or_else(|| KeyrackError::malformed(path, "missing `org`"))?;
    slug::validate_segment("org", &org).map_err(|e| KeyrackError::malformed(path, e.to_string()))?;

    let mut keys = BTreeMap::new();
    for ((env, name), entry) in partial.keys {
        let slug = Slug::new(&org, &env, &name)
            .map_err(|e| KeyrackError::malformed(path, e.to_string()))?;
        keys.insert(
            slug.clone(),
            KeySpec {
                slug,
                env,
                name: entry.name,
                mech: entry.mech,
                grade: entry.grade,
            },
        );
    }

    let envs: Vec<String> = partial
        .envs
        .into_iter()
        .filter(|env| env != ALL_ENV)
        .collect();

    debug!(
        path = %path.display(),
        org = %org,
        envs = envs.len(),
        keys = keys.len(),
        "resolved repo manifest"
    );

    Ok(RepoManifest {
        path: path.to_path_buf(),
        org,
        envs,
        keys,
    })
}

/// Resolve one file into a partial key set
///
/// `chain` holds every file currently being resolved, root first. Meeting
/// one of them again is a cycle no matter how deep it is.
fn collect(path: &Path, chain: &mut Vec<PathBuf>) -> Result<Partial> {
    let canonical = path
        .canonicalize()
        .map_err(|_| KeyrackError::ExtendsNotFound(path.to_path_buf()))?;

    if chain.contains(&canonical) {
        let cycle = chain
            .iter()
            .chain(std::iter::once(&canonical))
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(" -> ");
        return Err(KeyrackError::CircularExtends(cycle));
    }

    let content = std::fs::read_to_string(&canonical)?;
    let (extends, own) = parse(&canonical, &content)?;

    chain.push(canonical.clone());

    let base = canonical.parent().unwrap_or_else(|| Path::new("."));
    let mut merged = Partial::default();
    for relative in extends {
        let target = base.join(&relative);
        if !target.exists() {
            return Err(KeyrackError::ExtendsNotFound(target));
        }
        debug!(from = %canonical.display(), target = %target.display(), "following extends");
        merged.overlay(collect(&target, chain)?);
    }

    chain.pop();

    merged.org = own.org.clone();
    merged.overlay(own);
    Ok(merged)
}

fn parse(path: &Path, content: &str) -> Result<(Vec<String>, Partial)> {
    let root: Value =
        serde_yaml::from_str(content).map_err(|e| KeyrackError::malformed(path, e.to_string()))?;

    let mapping = match root {
        Value::Mapping(m) => m,
        Value::Null => Mapping::new(),
        _ => return Err(KeyrackError::malformed(path, "expected a mapping at the top level")),
    };

    let mut extends = vec![];
    let mut partial = Partial::default();

    for (key, value) in mapping {
        let key = key
            .as_str()
            .ok_or_else(|| KeyrackError::malformed(path, "top-level keys must be strings"))?;

        match key {
            "org" => {
                let org = value
                    .as_str()
                    .ok_or_else(|| KeyrackError::malformed(path, "`org` must be a string"))?;
                partial.org = Some(org.to_string());
            }
            "extends" => {
                extends = serde_yaml::from_value(value).map_err(|_| {
                    KeyrackError::malformed(path, "`extends` must be a list of paths")
                })?;
            }
            _ => {
                let env = key.strip_prefix(ENV_PREFIX).ok_or_else(|| {
                    KeyrackError::malformed(path, format!("unknown field `{}`", key))
                })?;
                slug::validate_segment("env", env)
                    .map_err(|e| KeyrackError::malformed(path, e.to_string()))?;

                partial.envs.insert(env.to_string());
                for entry in parse_entries(path, key, value)? {
                    partial.keys.insert((env.to_string(), entry.name.clone()), entry);
                }
            }
        }
    }

    Ok((extends, partial))
}

fn parse_entries(path: &Path, field: &str, value: Value) -> Result<Vec<Entry>> {
    let items = match value {
        Value::Null => return Ok(vec![]),
        Value::Sequence(items) => items,
        _ => {
            return Err(KeyrackError::malformed(
                path,
                format!("`{}` must be a list of keys", field),
            ))
        }
    };

    items
        .into_iter()
        .map(|item| parse_entry(path, field, item))
        .collect()
}

fn parse_entry(path: &Path, field: &str, item: Value) -> Result<Entry> {
    let bad = |reason: String| KeyrackError::malformed(path, format!("{}: {}", field, reason));

    let entry = match item {
        Value::String(name) => Entry {
            name,
            grade: None,
            mech: None,
        },
        Value::Mapping(m) if m.len() == 1 => {
            let (name, spec) = m.into_iter().next().ok_or_else(|| bad("empty entry".into()))?;
            let name = name
                .as_str()
                .ok_or_else(|| bad("key names must be strings".into()))?
                .to_string();

            match spec {
                Value::Null => Entry {
                    name,
                    grade: None,
                    mech: None,
                },
                Value::String(keyword) => Entry {
                    grade: Some(parse_grade(&keyword).ok_or_else(|| {
                        bad(format!("unknown grade '{}' for {}", keyword, name))
                    })?),
                    name,
                    mech: None,
                },
                other => {
                    let long: LongEntry = serde_yaml::from_value(other)
                        .map_err(|e| bad(format!("{}: {}", name, e)))?;
                    let grade = match long.grade {
                        Some(keyword) => Some(parse_grade(&keyword).ok_or_else(|| {
                            bad(format!("unknown grade '{}' for {}", keyword, name))
                        })?),
                        None => None,
                    };
                    Entry {
                        name,
                        grade,
                        mech: long.mech,
                    }
                }
            }
        }
        _ => return Err(bad("entries are a key name or `NAME: grade`".into())),
    };

    slug::validate_segment("key", &entry.name).map_err(|e| bad(e.to_string()))?;
    Ok(entry)
}

fn parse_grade(keyword: &str) -> Option<GradeRequirement> {
    GradeRequirement::from_keywords(keyword)
}

impl RepoManifest {
    /// Find the declaration visible as `env.name`, falling back to `env.all`
    pub fn lookup(&self, env: &str, name: &str) -> Option<&KeySpec> {
        let direct = Slug::new(&self.org, env, name).ok()?;
        self.keys
            .get(&direct)
            .or_else(|| self.keys.get(&direct.in_all()))
    }

    /// Whether a fully-qualified slug is on the allowlist
    pub fn allows(&self, slug: &Slug) -> Option<&KeySpec> {
        if slug.org != self.org {
            return None;
        }
        self.lookup(&slug.env, &slug.name)
    }

    /// Every key visible from `env`, `env.all` keys included
    pub fn keys_for_env(&self, env: &str) -> Vec<&KeySpec> {
        let mut visible: BTreeMap<&str, &KeySpec> = BTreeMap::new();
        for spec in self.keys.values().filter(|s| s.env == ALL_ENV) {
            visible.insert(&spec.name, spec);
        }
        if env != ALL_ENV {
            for spec in self.keys.values().filter(|s| s.env == env) {
                visible.insert(&spec.name, spec);
            }
        }
        visible.into_values().collect()
    }

    /// Envs (including `all`) that declare `name`
    pub fn envs_declaring(&self, name: &str) -> Vec<String> {
        self.keys
            .values()
            .filter(|s| s.name == name)
            .map(|s| s.env.clone())
            .collect()
    }

    /// Pick the env for a bare key name
    ///
    /// An explicit env always wins. Otherwise an `env.all` key needs no env,
    /// a key declared in exactly one env uses it, and anything else is
    /// ambiguous. `None` means the key is not declared at all.
    pub fn resolve_env(&self, name: &str, env: Option<&str>) -> Result<Option<String>> {
        if let Some(env) = env {
            return Ok(Some(env.to_string()));
        }

        let envs = self.envs_declaring(name);
        if envs.iter().any(|e| e == ALL_ENV) {
            return Ok(Some(ALL_ENV.to_string()));
        }

        match envs.as_slice() {
            [] => Ok(None),
            [only] => Ok(Some(only.clone())),
            _ => Err(KeyrackError::AmbiguousEnv {
                key: name.to_string(),
                envs: envs.join(", "),
            }),
        }
    }
}

/// Walk up from `start` looking for `keyrack.yml` or `.agent/keyrack.yml`
pub fn discover(start: &Path) -> Result<PathBuf> {
    for dir in start.ancestors() {
        for candidate in [dir.join(MANIFEST_FILE), dir.join(AGENT_DIR).join(MANIFEST_FILE)] {
            if candidate.is_file() {
                debug!(path = %candidate.display(), "found repo manifest");
                return Ok(candidate);
            }
        }
    }
    Err(KeyrackError::RepoManifestNotFound(start.join(MANIFEST_FILE)))
}

/// Add a key to `env.<env>` in the manifest at `path`
///
/// Creates the file when missing (which needs `org`). Returns false when the
/// key was already declared in that env.
pub fn declare_key(
    path: &Path,
    org: Option<&str>,
    env: &str,
    name: &str,
    grade: Option<GradeRequirement>,
    mech: Option<Mechanism>,
) -> Result<bool> {
    slug::validate_segment("env", env)?;
    slug::validate_segment("key", name)?;

    let mut root = if path.exists() {
        let content = std::fs::read_to_string(path)?;
        match serde_yaml::from_str(&content).map_err(|e| KeyrackError::malformed(path, e.to_string()))? {
            Value::Mapping(m) => m,
            Value::Null => Mapping::new(),
            _ => return Err(KeyrackError::malformed(path, "expected a mapping at the top level")),
        }
    } else {
        Mapping::new()
    };

    let org_key = Value::from("org");
    match (root.get(&org_key).and_then(Value::as_str), org) {
        (Some(existing), Some(wanted)) if existing != wanted => {
            return Err(KeyrackError::InvalidInput(format!(
                "{} belongs to org '{}', not '{}'",
                path.display(),
                existing,
                wanted
            )));
        }
        (Some(_), _) => {}
        (None, Some(wanted)) => {
            slug::validate_segment("org", wanted)?;
            root.insert(org_key, Value::from(wanted));
        }
        (None, None) => {
            return Err(KeyrackError::InvalidInput(format!(
                "{} has no org; pass --org",
                path.display()
            )));
        }
    }

    let field = Value::from(format!("{}{}", ENV_PREFIX, env));
    let entries = root
        .entry(field)
        .or_insert(Value::Sequence(vec![]));
    if entries.is_null() {
        *entries = Value::Sequence(vec![]);
    }
    let list = entries.as_sequence_mut().ok_or_else(|| {
        KeyrackError::malformed(path, format!("`env.{}` must be a list of keys", env))
    })?;

    let declared = list.iter().any(|item| match item {
        Value::String(s) => s == name,
        Value::Mapping(m) => m.contains_key(name),
        _ => false,
    });
    if declared {
        return Ok(false);
    }

    let entry = match (grade.filter(|g| !g.is_empty()), mech) {
        (None, None) => Value::from(name),
        (Some(grade), None) => {
            let mut m = Mapping::new();
            m.insert(Value::from(name), Value::from(grade.to_keywords()));
            Value::Mapping(m)
        }
        (grade, Some(mech)) => {
            let mut long = Mapping::new();
            if let Some(grade) = grade {
                long.insert(Value::from("grade"), Value::from(grade.to_keywords()));
            }
            long.insert(Value::from("mech"), Value::from(mech.as_str()));
            let mut m = Mapping::new();
            m.insert(Value::from(name), Value::Mapping(long));
            Value::Mapping(m)
        }
    };
    list.push(entry);

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let yaml = serde_yaml::to_string(&Value::Mapping(root))
        .map_err(|e| KeyrackError::Serialization(e.to_string()))?;
    std::fs::write(path, yaml)?;

    debug!(path = %path.display(), env = env, key = name, "declared key");
    Ok(true)
}

/// Create an empty manifest for `org`; false when one already exists
pub fn init_manifest(path: &Path, org: &str) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    slug::validate_segment("org", org)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, format!("org: {}\n", org))?;
    debug!(path = %path.display(), org = org, "created repo manifest");
    Ok(true)
}
