//! Handlers shared across the object pipelines: descriptor loading with
//! cache admission, row locking, etag preconditions, the row-version
//! guard, and trigger invocation.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::debug;

use crate::catalog::{ops, BucketDescriptor, TriggerCookie};
use crate::error::{DbError, Error, ObjectError};
use crate::pipeline::Request;
use crate::session::{SqlRow, SqlValue};
use crate::types::{EtagSpec, StoredObject};

/// Merge every reindex-active field into the request's ignore list, so row
/// reconstruction never trusts a column that may still be backfilling.
fn extend_ignore(req: &mut Request, bucket: &BucketDescriptor) {
    for field in bucket.reindexing_fields() {
        if !req.opts.ignore.contains(&field) {
            req.opts.ignore.push(field);
        }
    }
}

/// Install a freshly loaded descriptor on the request and cache it.
fn install_bucket(req: &mut Request, bucket: Arc<BucketDescriptor>) {
    req.cache.put(&req.bucket_name, Arc::clone(&bucket));
    extend_ignore(req, &bucket);
    req.bucket = Some(bucket);
}

/// Load the bucket descriptor, preferring the cache unless the caller
/// opted out.
pub fn load_bucket(req: &mut Request) -> BoxFuture<'_, Result<(), Error>> {
    Box::pin(async move {
        if !req.opts.no_cache {
            if let Some(bucket) = req.cache.get(&req.bucket_name) {
                debug!(bucket = %req.bucket_name, "descriptor cache hit");
                extend_ignore(req, &bucket);
                req.bucket = Some(bucket);
                return Ok(());
            }
        }
        let bucket = Arc::new(
            ops::get_bucket(req.session.as_mut(), &req.bucket_name, &req.triggers).await?,
        );
        install_bucket(req, bucket);
        Ok(())
    })
}

/// Parse a backing-relation row into a [`StoredObject`] without applying
/// column reconstruction. The raw `_value` JSON is carried as stored.
pub(crate) fn object_from_row(bucket: &str, row: &SqlRow) -> Result<StoredObject, Error> {
    let value: Value = serde_json::from_str(row.text("_value")?).map_err(|e| {
        Error::from(DbError::Internal(format!(
            "malformed _value in bucket '{bucket}': {e}"
        )))
    })?;
    Ok(StoredObject {
        bucket: bucket.to_string(),
        key: row.text("_key")?.to_string(),
        value,
        id: row.int("_id")?,
        etag: row.text("_etag")?.to_string(),
        mtime: row.int("_mtime")?,
        txn_snap: row.opt_int("_txn_snap"),
        count: row.opt_int("_count"),
        rver: row.opt_int("_rver").map(|v| v as i32),
    })
}

/// If the row was written under a newer schema version than the loaded
/// descriptor, the cache is stale: shoot it down and reload the descriptor
/// before continuing.
pub(crate) async fn guard_row_version(req: &mut Request, rver: Option<i32>) -> Result<(), Error> {
    let stale = match (rver, &req.bucket) {
        (Some(rv), Some(bucket)) => rv > bucket.options.version as i32,
        _ => false,
    };
    if !stale {
        return Ok(());
    }
    debug!(bucket = %req.bucket_name, rver, "row version ahead of descriptor, reloading");
    req.cache.invalidate(&req.bucket_name);
    let bucket = Arc::new(
        ops::get_bucket(req.session.as_mut(), &req.bucket_name, &req.triggers).await?,
    );
    install_bucket(req, bucket);
    Ok(())
}

/// Load and lock the previous row for the request's key, then run the
/// row-version guard against it.
pub fn load_previous(req: &mut Request) -> BoxFuture<'_, Result<(), Error>> {
    Box::pin(async move {
        let bucket = Arc::clone(req.bucket()?);
        let key = req
            .key
            .clone()
            .ok_or_else(|| DbError::Internal("request has no key".to_string()))?;

        let sql = format!("SELECT * FROM {} WHERE _key = $1 FOR UPDATE", bucket.name);
        let mut rows = req
            .session
            .query(&sql, &[SqlValue::Text(key.clone())])
            .await?;
        req.previous = match rows.pop() {
            Some(row) => Some(object_from_row(&bucket.name, &row)?),
            None => None,
        };

        let rver = req.previous.as_ref().and_then(|p| p.rver);
        guard_row_version(req, rver).await
    })
}

/// Enforce the caller's etag precondition against the previous row.
pub fn check_etag(req: &mut Request) -> BoxFuture<'_, Result<(), Error>> {
    Box::pin(async move {
        let conflict = |expected: String, actual: String| -> Error {
            ObjectError::EtagConflict {
                bucket: req.bucket_name.clone(),
                key: req.key.clone().unwrap_or_default(),
                expected,
                actual,
            }
            .into()
        };

        match (&req.opts.etag, &req.previous) {
            (EtagSpec::Unspecified, _) => Ok(()),
            (EtagSpec::Null, None) => Ok(()),
            (EtagSpec::Null, Some(prev)) => {
                Err(conflict("null".to_string(), prev.etag.clone()))
            }
            (EtagSpec::Value(etag), None) => {
                Err(conflict(etag.clone(), "<absent>".to_string()))
            }
            (EtagSpec::Value(etag), Some(prev)) => {
                if prev.etag == *etag {
                    Ok(())
                } else {
                    Err(conflict(etag.clone(), prev.etag.clone()))
                }
            }
        }
    })
}

async fn run_triggers(req: &mut Request, pre: bool) -> Result<(), Error> {
    let bucket = match &req.bucket {
        Some(b) => Arc::clone(b),
        None => return Ok(()),
    };
    let triggers = if pre {
        &bucket.pre_triggers
    } else {
        &bucket.post_triggers
    };
    let update = req.previous.is_some();
    let id = req.row_id.or_else(|| req.previous.as_ref().map(|p| p.id));

    for trigger in triggers {
        let cookie = TriggerCookie {
            bucket: &bucket.name,
            key: req.key.as_deref(),
            id,
            value: req.value.as_ref(),
            headers: &req.opts.headers,
            schema: &bucket.index,
            update,
            session: req.session.as_mut(),
        };
        (trigger.as_ref())(cookie).await?;
    }
    Ok(())
}

/// Invoke the bucket's pre-triggers, in order.
pub fn run_pre_triggers(req: &mut Request) -> BoxFuture<'_, Result<(), Error>> {
    Box::pin(run_triggers(req, true))
}

/// Invoke the bucket's post-triggers, in order.
pub fn run_post_triggers(req: &mut Request) -> BoxFuture<'_, Result<(), Error>> {
    Box::pin(run_triggers(req, false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{BucketCache, TriggerRegistry};
    use crate::pipeline::RequestOptions;
    use crate::session::mem::ScriptedSession;
    use crate::types::{BucketConfig, BucketOptions};
    use serde_json::json;
    use std::collections::{BTreeMap, BTreeSet};

    fn descriptor(index: serde_json::Value, version: u32) -> Arc<BucketDescriptor> {
        let config = BucketConfig::from_value(json!({ "index": index })).unwrap();
        Arc::new(BucketDescriptor {
            name: "people".to_string(),
            index: config.index,
            pre: vec![],
            post: vec![],
            options: BucketOptions { version },
            reindex_active: BTreeMap::new(),
            mtime: chrono::Utc::now(),
            pre_triggers: vec![],
            post_triggers: vec![],
        })
    }

    fn request(session: ScriptedSession) -> Request {
        Request::new(
            Box::new(session),
            Arc::new(BucketCache::default()),
            Arc::new(TriggerRegistry::new()),
            "people",
        )
    }

    fn object_row(key: &str, etag: &str, rver: Option<i64>) -> SqlRow {
        let mut cols = vec![
            ("_id".to_string(), SqlValue::Int(1)),
            ("_key".to_string(), SqlValue::Text(key.to_string())),
            (
                "_value".to_string(),
                SqlValue::Text(r#"{"age":30}"#.to_string()),
            ),
            ("_etag".to_string(), SqlValue::Text(etag.to_string())),
            ("_mtime".to_string(), SqlValue::Int(1700000000000)),
            ("_txn_snap".to_string(), SqlValue::Null),
        ];
        if let Some(rv) = rver {
            cols.push(("_rver".to_string(), SqlValue::Int(rv)));
        }
        SqlRow::new(cols)
    }

    #[tokio::test]
    async fn test_load_bucket_cache_hit_skips_sql() {
        let mut req = request(ScriptedSession::new());
        req.cache.put("people", descriptor(json!({}), 1));
        load_bucket(&mut req).await.unwrap();
        assert_eq!(req.bucket.as_ref().unwrap().name, "people");
    }

    #[tokio::test]
    async fn test_load_bucket_no_cache_option_reads_db() {
        let session = ScriptedSession::new().expect(
            "FROM buckets_config WHERE name = $1",
            vec![SqlRow::new(vec![
                ("name".to_string(), SqlValue::Text("people".to_string())),
                ("index".to_string(), SqlValue::Text("{}".to_string())),
                ("pre".to_string(), SqlValue::Text("[]".to_string())),
                ("post".to_string(), SqlValue::Text("[]".to_string())),
                (
                    "options".to_string(),
                    SqlValue::Text(r#"{"version":4}"#.to_string()),
                ),
                ("reindex_active".to_string(), SqlValue::Null),
            ]),],
        );
        let mut req = request(session);
        req.opts.no_cache = true;
        req.cache.put("people", descriptor(json!({}), 1));

        load_bucket(&mut req).await.unwrap();
        // The DB copy (version 4) wins over the cached version 1.
        assert_eq!(req.bucket.as_ref().unwrap().options.version, 4);
    }

    #[tokio::test]
    async fn test_load_bucket_extends_ignore_with_reindexing_fields() {
        let mut desc = (*descriptor(json!({ "name": { "type": "string" } }), 2)).clone();
        let mut fields = BTreeSet::new();
        fields.insert("name".to_string());
        desc.reindex_active.insert(2, fields);

        let mut req = request(ScriptedSession::new());
        req.cache.put("people", Arc::new(desc));
        load_bucket(&mut req).await.unwrap();
        assert!(req.opts.ignore.contains(&"name".to_string()));
    }

    #[tokio::test]
    async fn test_load_previous_locks_row() {
        let session = ScriptedSession::new().expect(
            "SELECT * FROM people WHERE _key = $1 FOR UPDATE",
            vec![object_row("p1", "abcd", None)],
        );
        let mut req = request(session);
        req.bucket = Some(descriptor(json!({}), 1));
        req.key = Some("p1".to_string());

        load_previous(&mut req).await.unwrap();
        let prev = req.previous.as_ref().unwrap();
        assert_eq!(prev.key, "p1");
        assert_eq!(prev.etag, "abcd");
        assert_eq!(prev.value, json!({"age": 30}));
    }

    #[tokio::test]
    async fn test_load_previous_row_version_shootdown() {
        // The row carries _rver 3, but the cached descriptor is version 1:
        // the handler must invalidate and reload from buckets_config.
        let session = ScriptedSession::new()
            .expect(
                "FOR UPDATE",
                vec![object_row("p1", "abcd", Some(3))],
            )
            .expect(
                "FROM buckets_config WHERE name = $1",
                vec![SqlRow::new(vec![
                    ("name".to_string(), SqlValue::Text("people".to_string())),
                    ("index".to_string(), SqlValue::Text("{}".to_string())),
                    ("pre".to_string(), SqlValue::Text("[]".to_string())),
                    ("post".to_string(), SqlValue::Text("[]".to_string())),
                    (
                        "options".to_string(),
                        SqlValue::Text(r#"{"version":3}"#.to_string()),
                    ),
                    ("reindex_active".to_string(), SqlValue::Null),
                ]),],
            );
        let mut req = request(session);
        req.cache.put("people", descriptor(json!({}), 1));
        req.bucket = Some(descriptor(json!({}), 1));
        req.key = Some("p1".to_string());

        load_previous(&mut req).await.unwrap();
        assert_eq!(req.bucket.as_ref().unwrap().options.version, 3);
        // The refreshed descriptor replaced the stale cache entry.
        assert_eq!(req.cache.get("people").unwrap().options.version, 3);
    }

    #[tokio::test]
    async fn test_check_etag_trichotomy() {
        let mut req = request(ScriptedSession::new());
        req.key = Some("p1".to_string());

        // Unspecified always passes.
        req.opts = RequestOptions::default();
        check_etag(&mut req).await.unwrap();

        // Null passes only when no row exists.
        req.opts.etag = EtagSpec::Null;
        check_etag(&mut req).await.unwrap();

        let session = ScriptedSession::new();
        let mut req2 = request(session);
        req2.key = Some("p1".to_string());
        req2.previous = Some(StoredObject {
            bucket: "people".to_string(),
            key: "p1".to_string(),
            value: json!({}),
            id: 1,
            etag: "aaaa".to_string(),
            mtime: 1,
            txn_snap: None,
            count: None,
            rver: None,
        });

        req2.opts.etag = EtagSpec::Null;
        assert!(check_etag(&mut req2).await.is_err());

        req2.opts.etag = EtagSpec::Value("stale".to_string());
        let err = check_etag(&mut req2).await.unwrap_err();
        assert!(format!("{err}").contains("etag conflict"));

        req2.opts.etag = EtagSpec::Value("aaaa".to_string());
        check_etag(&mut req2).await.unwrap();
    }

    #[tokio::test]
    async fn test_triggers_receive_cookie_and_share_session() {
        use futures::future::BoxFuture;

        fn audit(cookie: TriggerCookie<'_>) -> BoxFuture<'_, Result<(), Error>> {
            Box::pin(async move {
                assert_eq!(cookie.bucket, "people");
                assert_eq!(cookie.key, Some("p1"));
                assert!(!cookie.update);
                cookie
                    .session
                    .execute("INSERT INTO audit_log (_key) VALUES ($1)", &[])
                    .await?;
                Ok(())
            })
        }

        let session = ScriptedSession::new().expect_exec("INSERT INTO audit_log", 1);
        let mut req = request(session);
        req.key = Some("p1".to_string());

        let mut reg = TriggerRegistry::new();
        reg.register("audit", audit);
        let mut desc = (*descriptor(json!({}), 1)).clone();
        desc.pre = vec!["audit".to_string()];
        desc.pre_triggers = reg.resolve(&desc.pre).unwrap();
        req.bucket = Some(Arc::new(desc));

        run_pre_triggers(&mut req).await.unwrap();
    }

    #[tokio::test]
    async fn test_trigger_error_propagates() {
        use futures::future::BoxFuture;

        fn deny(_cookie: TriggerCookie<'_>) -> BoxFuture<'_, Result<(), Error>> {
            Box::pin(async move {
                Err(ObjectError::UniqueAttribute("denied by trigger".to_string()).into())
            })
        }

        let mut req = request(ScriptedSession::new());
        let mut reg = TriggerRegistry::new();
        reg.register("deny", deny);
        let mut desc = (*descriptor(json!({}), 1)).clone();
        desc.post = vec!["deny".to_string()];
        desc.post_triggers = reg.resolve(&desc.post).unwrap();
        req.bucket = Some(Arc::new(desc));

        let err = run_post_triggers(&mut req).await.unwrap_err();
        assert!(format!("{err}").contains("denied by trigger"));
    }
}
