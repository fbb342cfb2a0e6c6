//! The operation surface: a [`Tidepool`] handle exposing the bucket and
//! object operations, each materialised as a request run through its
//! canonical pipeline.

pub mod common;
pub mod read;
pub mod reindex;
pub mod write;

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::catalog::{ops, BucketCache, BucketDescriptor, TriggerRegistry};
use crate::error::{DbError, Error};
use crate::pipeline::{run_pipeline, Handler, Request};
use crate::schema::SchemaDiff;
use crate::session::TxnMode;
use crate::types::{BucketConfig, StoredObject};

pub use crate::pipeline::{BatchOp, BatchResult, RequestOptions, SortKey, SortOrder};
pub use crate::session::SessionPool;

// ---------------------------------------------------------------------------
// Bucket-operation handlers
// ---------------------------------------------------------------------------

fn exec_create_bucket(req: &mut Request) -> BoxFuture<'_, Result<(), Error>> {
    Box::pin(async move {
        let config = req
            .config
            .take()
            .ok_or_else(|| DbError::Internal("request has no config".to_string()))?;
        let bucket =
            ops::create_bucket(req.session.as_mut(), &req.bucket_name, &config, &req.triggers)
                .await?;
        req.cache.put(&req.bucket_name, Arc::new(bucket.clone()));
        req.buckets.push(bucket);
        Ok(())
    })
}

fn exec_update_bucket(req: &mut Request) -> BoxFuture<'_, Result<(), Error>> {
    Box::pin(async move {
        let config = req
            .config
            .take()
            .ok_or_else(|| DbError::Internal("request has no config".to_string()))?;
        let (bucket, diff) = ops::update_bucket(
            req.session.as_mut(),
            &req.bucket_name,
            &config,
            &req.triggers,
            req.opts.no_reindex,
        )
        .await?;
        // Replace the cache entry wholesale; concurrent readers keep their
        // Arc to the old descriptor.
        req.cache.put(&req.bucket_name, Arc::new(bucket.clone()));
        req.diff = Some(diff);
        req.buckets.push(bucket);
        Ok(())
    })
}

fn exec_get_bucket(req: &mut Request) -> BoxFuture<'_, Result<(), Error>> {
    Box::pin(async move {
        let bucket =
            ops::get_bucket(req.session.as_mut(), &req.bucket_name, &req.triggers).await?;
        req.buckets.push(bucket);
        Ok(())
    })
}

fn exec_del_bucket(req: &mut Request) -> BoxFuture<'_, Result<(), Error>> {
    Box::pin(async move {
        ops::del_bucket(req.session.as_mut(), &req.bucket_name).await?;
        req.cache.invalidate(&req.bucket_name);
        Ok(())
    })
}

fn exec_list_buckets(req: &mut Request) -> BoxFuture<'_, Result<(), Error>> {
    Box::pin(async move {
        req.buckets = ops::list_buckets(req.session.as_mut(), &req.triggers).await?;
        Ok(())
    })
}

// ---------------------------------------------------------------------------
// The handle
// ---------------------------------------------------------------------------

/// A handle on the store. Cheaply clonable; all clones share the
/// descriptor cache and trigger registry.
#[derive(Clone)]
pub struct Tidepool {
    pool: Arc<dyn SessionPool>,
    cache: Arc<BucketCache>,
    triggers: Arc<TriggerRegistry>,
}

impl Tidepool {
    pub fn new(pool: Arc<dyn SessionPool>, triggers: TriggerRegistry) -> Self {
        Self {
            pool,
            cache: Arc::new(BucketCache::default()),
            triggers: Arc::new(triggers),
        }
    }

    /// Ensure the catalog relation exists. Run once at start-up.
    pub async fn init(&self) -> Result<(), Error> {
        let mut session = self.pool.acquire().await?;
        ops::init_catalog(session.as_mut()).await
    }

    async fn request(&self, bucket: &str) -> Result<Request, Error> {
        let session = self.pool.acquire().await?;
        Ok(Request::new(
            session,
            Arc::clone(&self.cache),
            Arc::clone(&self.triggers),
            bucket,
        ))
    }

    pub async fn create_bucket(&self, name: &str, config: BucketConfig) -> Result<(), Error> {
        let mut req = self.request(name).await?;
        req.config = Some(config);
        let handlers = [Handler::new("createBucket", exec_create_bucket)];
        run_pipeline(&mut req, TxnMode::ReadWrite, &handlers).await
    }

    pub async fn update_bucket(
        &self,
        name: &str,
        config: BucketConfig,
        no_reindex: bool,
    ) -> Result<SchemaDiff, Error> {
        let mut req = self.request(name).await?;
        req.config = Some(config);
        req.opts.no_reindex = no_reindex;
        let handlers = [Handler::new("updateBucket", exec_update_bucket)];
        run_pipeline(&mut req, TxnMode::ReadWrite, &handlers).await?;
        req.diff
            .take()
            .ok_or_else(|| DbError::Internal("update produced no diff".to_string()).into())
    }

    pub async fn get_bucket(&self, name: &str) -> Result<BucketDescriptor, Error> {
        let mut req = self.request(name).await?;
        let handlers = [Handler::new("getBucket", exec_get_bucket)];
        run_pipeline(&mut req, TxnMode::ReadOnly, &handlers).await?;
        req.buckets
            .pop()
            .ok_or_else(|| DbError::Internal("no descriptor loaded".to_string()).into())
    }

    pub async fn del_bucket(&self, name: &str) -> Result<(), Error> {
        let mut req = self.request(name).await?;
        let handlers = [Handler::new("delBucket", exec_del_bucket)];
        run_pipeline(&mut req, TxnMode::ReadWrite, &handlers).await
    }

    pub async fn list_buckets(&self) -> Result<Vec<BucketDescriptor>, Error> {
        let mut req = self.request("").await?;
        let handlers = [Handler::new("listBuckets", exec_list_buckets)];
        run_pipeline(&mut req, TxnMode::ReadOnly, &handlers).await?;
        Ok(req.buckets)
    }

    /// Write an object, returning its new etag.
    pub async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        value: Value,
        opts: Option<RequestOptions>,
    ) -> Result<String, Error> {
        let mut req = self.request(bucket).await?;
        req.key = Some(key.to_string());
        req.value = Some(value);
        req.opts = opts.unwrap_or_default();
        let handlers = [
            Handler::new("loadBucket", common::load_bucket),
            Handler::new("loadPrevious", common::load_previous),
            Handler::new("checkEtag", common::check_etag),
            Handler::new("runPreTriggers", common::run_pre_triggers),
            Handler::new("putRow", write::exec_put),
            Handler::new("runPostTriggers", common::run_post_triggers),
        ];
        run_pipeline(&mut req, TxnMode::ReadWrite, &handlers).await?;
        req.etag
            .take()
            .ok_or_else(|| DbError::Internal("write produced no etag".to_string()).into())
    }

    pub async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        opts: Option<RequestOptions>,
    ) -> Result<StoredObject, Error> {
        let mut req = self.request(bucket).await?;
        req.key = Some(key.to_string());
        req.opts = opts.unwrap_or_default();
        let handlers = [
            Handler::new("loadBucket", common::load_bucket),
            Handler::new("fetchObject", read::fetch_object),
        ];
        run_pipeline(&mut req, TxnMode::ReadOnly, &handlers).await?;
        req.objects
            .pop()
            .ok_or_else(|| DbError::Internal("no object loaded".to_string()).into())
    }

    pub async fn del_object(
        &self,
        bucket: &str,
        key: &str,
        opts: Option<RequestOptions>,
    ) -> Result<(), Error> {
        let mut req = self.request(bucket).await?;
        req.key = Some(key.to_string());
        req.opts = opts.unwrap_or_default();
        let handlers = [
            Handler::new("loadBucket", common::load_bucket),
            Handler::new("loadPrevious", common::load_previous),
            Handler::new("requirePrevious", write::require_previous),
            Handler::new("checkEtag", common::check_etag),
            Handler::new("runPreTriggers", common::run_pre_triggers),
            Handler::new("deleteRow", write::exec_del),
            Handler::new("runPostTriggers", common::run_post_triggers),
        ];
        run_pipeline(&mut req, TxnMode::ReadWrite, &handlers).await
    }

    /// Evaluate a filter and stream back matching objects.
    pub async fn find_objects(
        &self,
        bucket: &str,
        filter: &str,
        opts: Option<RequestOptions>,
    ) -> Result<Vec<StoredObject>, Error> {
        let mut req = self.request(bucket).await?;
        req.filter = Some(filter.to_string());
        req.opts = opts.unwrap_or_default();
        let handlers = [
            Handler::new("loadBucket", common::load_bucket),
            Handler::new("parseFilter", read::parse_filter),
            Handler::new("decorateFilter", read::decorate_filter),
            Handler::new("buildWhere", read::build_where),
            Handler::new("fetchRows", read::fetch_rows),
        ];
        run_pipeline(&mut req, TxnMode::ReadOnly, &handlers).await?;
        Ok(req.objects)
    }

    /// Bulk-update indexed columns on every row matching the filter,
    /// returning the affected-row count.
    pub async fn update_objects(
        &self,
        bucket: &str,
        fields: BTreeMap<String, Value>,
        filter: &str,
    ) -> Result<u64, Error> {
        let mut req = self.request(bucket).await?;
        req.fields = Some(fields);
        req.filter = Some(filter.to_string());
        let handlers = [
            Handler::new("loadBucket", common::load_bucket),
            Handler::new("parseFilter", read::parse_filter),
            Handler::new("decorateFilter", read::decorate_filter),
            Handler::new("updateRows", write::exec_update_fields),
        ];
        run_pipeline(&mut req, TxnMode::ReadWrite, &handlers).await?;
        Ok(req.affected)
    }

    /// Run an atomic sequence of write operations in a single transaction.
    pub async fn batch(&self, ops: Vec<BatchOp>) -> Result<Vec<BatchResult>, Error> {
        let mut req = self.request("").await?;
        req.batch = ops;
        let handlers = [Handler::new("execBatch", write::exec_batch)];
        run_pipeline(&mut req, TxnMode::ReadWrite, &handlers).await?;
        Ok(req.batch_results)
    }

    /// Backfill up to `count` rows written under older schema versions,
    /// returning how many were processed.
    pub async fn reindex_objects(&self, bucket: &str, count: u64) -> Result<u64, Error> {
        let mut req = self.request(bucket).await?;
        req.opts.limit = Some(count);
        let handlers = [Handler::new("reindexRows", reindex::exec_reindex)];
        run_pipeline(&mut req, TxnMode::ReadWrite, &handlers).await?;
        Ok(req.affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FilterError, ObjectError};
    use crate::session::mem::{ScriptedPool, ScriptedSession};
    use crate::session::{SqlRow, SqlValue};
    use crate::types::EtagSpec;
    use serde_json::json;

    fn store(pool: ScriptedPool) -> Tidepool {
        Tidepool::new(Arc::new(pool), TriggerRegistry::new())
    }

    fn config_row(index: &str, version: u32) -> SqlRow {
        SqlRow::new(vec![
            ("name".to_string(), SqlValue::Text("people".to_string())),
            ("index".to_string(), SqlValue::Text(index.to_string())),
            ("pre".to_string(), SqlValue::Text("[]".to_string())),
            ("post".to_string(), SqlValue::Text("[]".to_string())),
            (
                "options".to_string(),
                SqlValue::Text(format!(r#"{{"version":{version}}}"#)),
            ),
            ("reindex_active".to_string(), SqlValue::Null),
        ])
    }

    fn object_row(key: &str, value: &str, age: i64) -> SqlRow {
        SqlRow::new(vec![
            ("_id".to_string(), SqlValue::Int(1)),
            ("_key".to_string(), SqlValue::Text(key.to_string())),
            ("_value".to_string(), SqlValue::Text(value.to_string())),
            ("_etag".to_string(), SqlValue::Text("feedface".to_string())),
            ("_mtime".to_string(), SqlValue::Int(1700000000000)),
            ("_txn_snap".to_string(), SqlValue::Null),
            ("age".to_string(), SqlValue::Int(age)),
        ])
    }

    #[tokio::test]
    async fn test_create_put_get_flow() {
        let pool = ScriptedPool::new();
        // createBucket
        pool.push(
            ScriptedSession::new()
                .expect_exec("INSERT INTO buckets_config", 1)
                .expect_exec("CREATE TABLE people", 0)
                .expect_exec("CREATE INDEX people_age_idx", 0),
        );
        // putObject (descriptor now cached, so no catalog read)
        pool.push(
            ScriptedSession::new()
                .expect("SELECT * FROM people WHERE _key = $1 FOR UPDATE", vec![])
                .expect(
                    "INSERT INTO people",
                    vec![SqlRow::new(vec![("_id".to_string(), SqlValue::Int(1))])],
                ),
        );
        // getObject
        pool.push(ScriptedSession::new().expect(
            "SELECT * FROM people WHERE _key = $1",
            vec![object_row("p1", r#"{"name":"a","age":30}"#, 30)],
        ));

        let store = store(pool);
        let config = BucketConfig::from_value(json!({
            "index": { "age": { "type": "number" } },
            "options": { "version": 1 }
        }))
        .unwrap();

        store.create_bucket("people", config).await.unwrap();

        let etag = store
            .put_object("people", "p1", json!({"name": "a", "age": 30}), None)
            .await
            .unwrap();
        assert_eq!(etag.len(), 16);

        let obj = store.get_object("people", "p1", None).await.unwrap();
        assert_eq!(obj.value, json!({"name": "a", "age": 30}));
        assert_eq!(obj.etag, "feedface");
        assert!(obj.mtime > 0);
    }

    #[tokio::test]
    async fn test_find_on_indexed_field() {
        let pool = ScriptedPool::new();
        pool.push(
            ScriptedSession::new()
                .expect(
                    "FROM buckets_config",
                    vec![config_row(r#"{"age":{"type":"number"}}"#, 1)],
                )
                .expect(
                    "WHERE (age >= $1 AND age IS NOT NULL)",
                    vec![object_row("p1", r#"{"name":"a","age":30}"#, 30)],
                ),
        );
        pool.push(
            ScriptedSession::new().expect("WHERE (age >= $1 AND age IS NOT NULL)", vec![]),
        );

        let store = store(pool);
        let found = store
            .find_objects("people", "(age>=18)", None)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].key, "p1");

        let found = store
            .find_objects("people", "(age>=40)", None)
            .await
            .unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_find_on_unindexed_field_fails() {
        let pool = ScriptedPool::new();
        pool.push(ScriptedSession::new().expect(
            "FROM buckets_config",
            vec![config_row(r#"{"age":{"type":"number"}}"#, 1)],
        ));

        let store = store(pool);
        let err = store
            .find_objects("people", "(name=a)", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Filter(FilterError::NotIndexed(_))));
    }

    #[tokio::test]
    async fn test_put_etag_conflict_rolls_back() {
        let pool = ScriptedPool::new();
        pool.push(
            ScriptedSession::new()
                .expect(
                    "FROM buckets_config",
                    vec![config_row(r#"{"age":{"type":"number"}}"#, 1)],
                )
                .expect(
                    "FOR UPDATE",
                    vec![object_row("p1", r#"{"age":30}"#, 30)],
                ),
        );

        let store = store(pool);
        let opts = RequestOptions {
            etag: EtagSpec::Null,
            ..Default::default()
        };
        let err = store
            .put_object("people", "p1", json!({"age": 31}), Some(opts))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Object(ObjectError::EtagConflict { .. })));
    }

    #[tokio::test]
    async fn test_del_object_missing_key() {
        let pool = ScriptedPool::new();
        pool.push(
            ScriptedSession::new()
                .expect("FROM buckets_config", vec![config_row("{}", 1)])
                .expect("FOR UPDATE", vec![]),
        );

        let store = store(pool);
        let err = store.del_object("people", "ghost", None).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Object(ObjectError::ObjectNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_list_buckets() {
        let pool = ScriptedPool::new();
        pool.push(ScriptedSession::new().expect(
            "FROM buckets_config ORDER BY name",
            vec![config_row("{}", 1)],
        ));

        let store = store(pool);
        let buckets = store.list_buckets().await.unwrap();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].name, "people");
    }

    #[tokio::test]
    async fn test_del_bucket_invalidates_cache() {
        let pool = ScriptedPool::new();
        pool.push(
            ScriptedSession::new()
                .expect("FROM buckets_config", vec![config_row("{}", 1)])
                .expect("FROM people WHERE (_key IS NOT NULL)", vec![]),
        );
        pool.push(
            ScriptedSession::new()
                .expect_exec("DELETE FROM buckets_config", 1)
                .expect_exec("DROP TABLE people", 0),
        );
        pool.push(ScriptedSession::new().expect("FROM buckets_config", vec![]));

        let store = store(pool);
        // Warm the cache through a find's load_bucket (get_bucket reads
        // the catalog directly and does not populate the cache).
        store
            .find_objects("people", "(_key=*)", None)
            .await
            .unwrap();

        store.del_bucket("people").await.unwrap();

        // The next operation misses the cache and hits the catalog.
        let err = store.get_bucket("people").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Config(crate::error::ConfigError::BucketNotFound(_))
        ));
    }
}
