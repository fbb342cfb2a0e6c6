//! Bucket catalog: descriptor cache, trigger registry, descriptor parsing.
//!
//! Descriptors are persisted in the `buckets_config` relation (see
//! [`ops`]) and fronted by a bounded LRU cache shared by all concurrent
//! requests. Cached descriptors are immutable; replacements swap the whole
//! `Arc` so readers never observe a partially built descriptor.

pub mod ops;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value;

use crate::error::{ConfigError, DbError, Error};
use crate::schema::reindexing_fields;
use crate::session::{Session, SqlRow, SqlValue};
use crate::types::{BucketOptions, IndexField};

/// Default descriptor cache capacity.
const DEFAULT_CACHE_CAPACITY: usize = 100;

/// The state handed to a pre/post trigger.
///
/// Triggers share the request's session, so any statements they issue join
/// the request's transaction.
pub struct TriggerCookie<'a> {
    pub bucket: &'a str,
    pub key: Option<&'a str>,
    pub id: Option<i64>,
    pub value: Option<&'a Value>,
    pub headers: &'a HashMap<String, String>,
    pub schema: &'a BTreeMap<String, IndexField>,
    /// True when a previous row exists and the write is an update.
    pub update: bool,
    pub session: &'a mut dyn Session,
}

/// A registered trigger callback.
pub type Trigger =
    Arc<dyn for<'a> Fn(TriggerCookie<'a>) -> BoxFuture<'a, Result<(), Error>> + Send + Sync>;

/// Named trigger callbacks, registered out-of-band. Bucket definitions
/// carry ordered lists of names which are resolved against this registry
/// when the descriptor is loaded.
#[derive(Clone, Default)]
pub struct TriggerRegistry {
    map: HashMap<String, Trigger>,
}

impl TriggerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a trigger under a name, replacing any previous registration.
    pub fn register<F>(&mut self, name: &str, trigger: F)
    where
        F: for<'a> Fn(TriggerCookie<'a>) -> BoxFuture<'a, Result<(), Error>>
            + Send
            + Sync
            + 'static,
    {
        self.map.insert(name.to_string(), Arc::new(trigger));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    /// Resolve an ordered list of trigger names to callables.
    pub fn resolve(&self, names: &[String]) -> Result<Vec<Trigger>, Error> {
        names
            .iter()
            .map(|name| {
                self.map
                    .get(name)
                    .cloned()
                    .ok_or_else(|| ConfigError::NotFunction(name.clone()).into())
            })
            .collect()
    }
}

impl fmt::Debug for TriggerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerRegistry")
            .field("names", &self.map.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// The loaded, resolved schema of a bucket.
#[derive(Clone)]
pub struct BucketDescriptor {
    pub name: String,
    pub index: BTreeMap<String, IndexField>,
    pub pre: Vec<String>,
    pub post: Vec<String>,
    pub options: BucketOptions,
    /// Version number to fields whose backing columns are still being
    /// backfilled.
    pub reindex_active: BTreeMap<u32, BTreeSet<String>>,
    pub mtime: DateTime<Utc>,
    pub pre_triggers: Vec<Trigger>,
    pub post_triggers: Vec<Trigger>,
}

impl BucketDescriptor {
    /// Whether rows of this bucket carry the `_rver` row-version stamp.
    pub fn has_row_version(&self) -> bool {
        !self.reindex_active.is_empty()
    }

    /// The union of all fields currently being backfilled.
    pub fn reindexing_fields(&self) -> BTreeSet<String> {
        reindexing_fields(&self.reindex_active)
    }
}

impl fmt::Debug for BucketDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BucketDescriptor")
            .field("name", &self.name)
            .field("index", &self.index)
            .field("pre", &self.pre)
            .field("post", &self.post)
            .field("options", &self.options)
            .field("reindex_active", &self.reindex_active)
            .field("mtime", &self.mtime)
            .finish()
    }
}

/// Bounded LRU cache of bucket descriptors, keyed by `'/' + name`.
pub struct BucketCache {
    inner: Mutex<LruCache<String, Arc<BucketDescriptor>>>,
}

impl BucketCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity)
            .unwrap_or_else(|| NonZeroUsize::new(DEFAULT_CACHE_CAPACITY).unwrap());
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn key(name: &str) -> String {
        format!("/{name}")
    }

    pub fn get(&self, name: &str) -> Option<Arc<BucketDescriptor>> {
        self.inner.lock().get(&Self::key(name)).cloned()
    }

    pub fn put(&self, name: &str, descriptor: Arc<BucketDescriptor>) {
        self.inner.lock().put(Self::key(name), descriptor);
    }

    /// Shootdown: drop the cached descriptor so the next lookup reloads it
    /// from the catalog relation.
    pub fn invalidate(&self, name: &str) {
        self.inner.lock().pop(&Self::key(name));
    }
}

impl Default for BucketCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

/// Parse a `buckets_config` row into a descriptor, resolving trigger names
/// against the registry.
pub fn parse_descriptor(
    row: &SqlRow,
    triggers: &TriggerRegistry,
) -> Result<BucketDescriptor, Error> {
    let name = row.text("name")?.to_string();

    let corrupt = |what: &str, e: &dyn fmt::Display| {
        DbError::Internal(format!("malformed {what} in bucket descriptor '{name}': {e}"))
    };

    let index: BTreeMap<String, IndexField> =
        serde_json::from_str(row.opt_text("index").unwrap_or("{}"))
            .map_err(|e| corrupt("index", &e))?;
    let pre: Vec<String> = serde_json::from_str(row.opt_text("pre").unwrap_or("[]"))
        .map_err(|e| corrupt("pre", &e))?;
    let post: Vec<String> = serde_json::from_str(row.opt_text("post").unwrap_or("[]"))
        .map_err(|e| corrupt("post", &e))?;
    let options: BucketOptions = serde_json::from_str(row.opt_text("options").unwrap_or("{}"))
        .map_err(|e| corrupt("options", &e))?;
    let reindex_active: BTreeMap<u32, BTreeSet<String>> =
        serde_json::from_str(row.opt_text("reindex_active").unwrap_or("{}"))
            .map_err(|e| corrupt("reindex_active", &e))?;

    let mtime = match row.get("mtime") {
        Some(SqlValue::Timestamp(t)) => *t,
        _ => Utc::now(),
    };

    let pre_triggers = triggers.resolve(&pre)?;
    let post_triggers = triggers.resolve(&post)?;

    Ok(BucketDescriptor {
        name,
        index,
        pre,
        post,
        options,
        reindex_active,
        mtime,
        pre_triggers,
        post_triggers,
    })
}
