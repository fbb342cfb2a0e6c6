//! The per-request pipeline: request record, handlers, and the executor.
//!
//! Every client operation materialises a [`Request`] that is threaded
//! through a fixed, ordered list of [`Handler`]s. The executor begins the
//! transaction up front, runs each handler in sequence, and commits on
//! success; any handler error short-circuits the remainder and rolls the
//! transaction back. Read-only pipelines always roll back at the end to
//! release locks early.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, warn};

use crate::catalog::{BucketCache, BucketDescriptor, TriggerRegistry};
use crate::error::Error;
use crate::filter::compile::CompiledFilter;
use crate::filter::decorate::Decorated;
use crate::filter::Filter;
use crate::schema::SchemaDiff;
use crate::session::{Session, TxnMode};
use crate::types::{BucketConfig, EtagSpec, StoredObject};

/// Sort direction for a find attribute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// One attribute of a find's ORDER BY list.
#[derive(Debug, Clone)]
pub struct SortKey {
    pub attr: String,
    pub order: SortOrder,
}

/// Per-request options supplied by the caller.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Etag precondition for conditional writes.
    pub etag: EtagSpec,
    /// Opaque request headers, surfaced to triggers.
    pub headers: HashMap<String, String>,
    /// Row limit for finds; also the batch size for reindexing.
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    /// Lift the default find limit entirely.
    pub no_limit: bool,
    pub sort: Vec<SortKey>,
    /// Indexed fields whose columns are not applied during row
    /// reconstruction. Extended internally with every reindex-active field.
    pub ignore: Vec<String>,
    /// Bypass the descriptor cache for this request.
    pub no_cache: bool,
    /// Skip reindex bookkeeping during a bucket update.
    pub no_reindex: bool,
}

/// One operation of an atomic batch.
#[derive(Debug, Clone)]
pub enum BatchOp {
    Put {
        bucket: String,
        key: String,
        value: Value,
        etag: EtagSpec,
    },
    Update {
        bucket: String,
        fields: BTreeMap<String, Value>,
        filter: String,
    },
    Delete {
        bucket: String,
        key: String,
        etag: EtagSpec,
    },
    DeleteMany {
        bucket: String,
        filter: String,
    },
}

/// The per-operation outcome of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchResult {
    /// Etag of the written row (put).
    Etag(String),
    /// Number of rows affected (update / delete variants).
    Count(u64),
}

/// The in-flight record threaded through a pipeline. Handlers read the
/// fields populated by their predecessors and install their own results.
pub struct Request {
    // Caller inputs.
    pub bucket_name: String,
    pub key: Option<String>,
    pub value: Option<Value>,
    pub filter: Option<String>,
    pub fields: Option<BTreeMap<String, Value>>,
    pub config: Option<BucketConfig>,
    pub batch: Vec<BatchOp>,
    pub opts: RequestOptions,

    // Collaborators.
    pub session: Box<dyn Session>,
    pub cache: Arc<BucketCache>,
    pub triggers: Arc<TriggerRegistry>,

    // Populated by handlers.
    pub bucket: Option<Arc<BucketDescriptor>>,
    pub previous: Option<StoredObject>,
    pub parsed: Option<Filter>,
    pub decorated: Option<Decorated>,
    pub compiled: Option<CompiledFilter>,
    pub diff: Option<SchemaDiff>,

    /// Row id of the written row, surfaced to post-triggers.
    pub row_id: Option<i64>,

    // Response sink.
    pub objects: Vec<StoredObject>,
    pub buckets: Vec<BucketDescriptor>,
    pub batch_results: Vec<BatchResult>,
    pub etag: Option<String>,
    pub affected: u64,
}

impl Request {
    pub fn new(
        session: Box<dyn Session>,
        cache: Arc<BucketCache>,
        triggers: Arc<TriggerRegistry>,
        bucket_name: impl Into<String>,
    ) -> Self {
        Self {
            bucket_name: bucket_name.into(),
            key: None,
            value: None,
            filter: None,
            fields: None,
            config: None,
            batch: Vec::new(),
            opts: RequestOptions::default(),
            session,
            cache,
            triggers,
            bucket: None,
            previous: None,
            parsed: None,
            decorated: None,
            compiled: None,
            diff: None,
            row_id: None,
            objects: Vec::new(),
            buckets: Vec::new(),
            batch_results: Vec::new(),
            etag: None,
            affected: 0,
        }
    }

    /// Reset per-operation state, keeping the session and collaborators.
    /// Used between the steps of a batch.
    pub fn reset_for(&mut self, bucket_name: impl Into<String>) {
        self.bucket_name = bucket_name.into();
        self.key = None;
        self.value = None;
        self.filter = None;
        self.fields = None;
        self.opts = RequestOptions::default();
        self.bucket = None;
        self.previous = None;
        self.parsed = None;
        self.decorated = None;
        self.compiled = None;
        self.row_id = None;
    }

    /// The loaded descriptor; handlers that run after `load_bucket` may
    /// assume it is present.
    pub fn bucket(&self) -> Result<&Arc<BucketDescriptor>, Error> {
        self.bucket.as_ref().ok_or_else(|| {
            crate::error::DbError::Internal("bucket descriptor not loaded".to_string()).into()
        })
    }
}

/// A pipeline step: a named function borrowing the request.
#[derive(Clone, Copy)]
pub struct Handler {
    pub name: &'static str,
    run: for<'a> fn(&'a mut Request) -> BoxFuture<'a, Result<(), Error>>,
}

impl Handler {
    pub const fn new(
        name: &'static str,
        run: for<'a> fn(&'a mut Request) -> BoxFuture<'a, Result<(), Error>>,
    ) -> Self {
        Self { name, run }
    }
}

/// Run a pipeline to completion inside one transaction.
pub async fn run_pipeline(
    req: &mut Request,
    mode: TxnMode,
    handlers: &[Handler],
) -> Result<(), Error> {
    req.session.begin(mode).await?;

    for handler in handlers {
        debug!(handler = handler.name, bucket = %req.bucket_name, "pipeline step");
        if let Err(e) = (handler.run)(req).await {
            warn!(
                handler = handler.name,
                bucket = %req.bucket_name,
                error = %e,
                "pipeline aborted, rolling back"
            );
            if let Err(rb) = req.session.rollback().await {
                warn!(error = %rb, "rollback failed");
            }
            return Err(e);
        }
    }

    match mode {
        // Read-only work holds no results hostage in the transaction;
        // rolling back releases snapshot and locks immediately.
        TxnMode::ReadOnly => req.session.rollback().await?,
        TxnMode::ReadWrite => req.session.commit().await?,
    }
    Ok(())
}
