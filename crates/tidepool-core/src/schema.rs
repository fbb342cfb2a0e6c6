//! Bucket schema validation, version diffing, and reindex bookkeeping.

use std::collections::{BTreeMap, BTreeSet};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::catalog::TriggerRegistry;
use crate::error::{ConfigError, Error};
use crate::types::{BucketConfig, IndexField, RESERVED_BUCKETS};

static BUCKET_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]{0,62}$").unwrap());

static FIELD_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").unwrap());

/// Validate a bucket name and configuration.
///
/// Checks the name against the identifier pattern and the reserved set,
/// every indexed field name against the column-identifier pattern (which
/// also excludes the `_`-prefixed system columns), and every trigger name
/// against the registry.
pub fn validate_bucket(
    name: &str,
    config: &BucketConfig,
    triggers: &TriggerRegistry,
) -> Result<(), Error> {
    if !BUCKET_NAME_RE.is_match(name) {
        return Err(ConfigError::InvalidBucketName(name.to_string()).into());
    }
    if RESERVED_BUCKETS.contains(&name) {
        return Err(ConfigError::InvalidBucketName(format!("{name} is reserved")).into());
    }

    for field in config.index.keys() {
        if !FIELD_NAME_RE.is_match(field) {
            return Err(ConfigError::InvalidBucketConfig(format!(
                "invalid index field name '{field}'"
            ))
            .into());
        }
    }

    for trigger in config.pre.iter().chain(config.post.iter()) {
        if !triggers.contains(trigger) {
            return Err(ConfigError::NotFunction(trigger.clone()).into());
        }
    }

    Ok(())
}

/// The difference between two versions of a bucket's index map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaDiff {
    /// Fields present only in the new index.
    pub added: Vec<String>,
    /// Fields present only in the old index.
    pub removed: Vec<String>,
    /// Fields present in both whose declaration differs. Recorded but not
    /// acted on: the column keeps its existing type.
    pub modified: Vec<String>,
}

impl SchemaDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }
}

/// Compute the diff between a stored index map and an incoming one.
pub fn diff_indexes(
    old: &BTreeMap<String, IndexField>,
    new: &BTreeMap<String, IndexField>,
) -> SchemaDiff {
    let mut diff = SchemaDiff::default();

    for (field, def) in new {
        match old.get(field) {
            None => diff.added.push(field.clone()),
            Some(old_def) if old_def != def => diff.modified.push(field.clone()),
            Some(_) => {}
        }
    }
    for field in old.keys() {
        if !new.contains_key(field) {
            diff.removed.push(field.clone());
        }
    }

    diff
}

/// Merge newly added fields into the reindex bookkeeping under the given
/// version, preserving set semantics.
pub fn consolidate_reindex(
    reindex: &mut BTreeMap<u32, BTreeSet<String>>,
    version: u32,
    added: &[String],
) {
    if added.is_empty() {
        return;
    }
    let entry = reindex.entry(version).or_default();
    for field in added {
        entry.insert(field.clone());
    }
}

/// The union of all fields currently being backfilled, across versions.
pub fn reindexing_fields(reindex: &BTreeMap<u32, BTreeSet<String>>) -> BTreeSet<String> {
    reindex.values().flatten().cloned().collect()
}
