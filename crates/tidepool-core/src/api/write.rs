//! The write path: projection, etag stamping, and the `putObject`,
//! `delObject`, `updateObjects`, and `batch` executors.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use xxhash_rust::xxh64::xxh64;

use crate::coerce::coerce_field;
use crate::error::{DbError, Error, FilterError, ObjectError};
use crate::filter::compile::compile_from;
use crate::pipeline::{BatchOp, BatchResult, Request};
use crate::session::SqlValue;
use crate::types::IndexField;

use super::common::{
    check_etag, load_bucket, load_previous, run_post_triggers, run_pre_triggers,
};
use super::read::{decorate_filter, parse_filter};

/// Project an object's indexed fields into column values. Every declared
/// field appears in the result; fields absent from the object project to
/// NULL, clearing any stale column on update.
pub(crate) fn index_object(
    index: &BTreeMap<String, IndexField>,
    value: &Value,
) -> Result<Vec<(String, SqlValue)>, Error> {
    let mut projection = Vec::with_capacity(index.len());
    for (field, def) in index {
        let col = match value.get(field) {
            Some(Value::Null) | None => SqlValue::Null,
            Some(v) => coerce_field(def.field_type, v)?,
        };
        projection.push((field.clone(), col));
    }
    Ok(projection)
}

/// The stable etag of a write: a hash of `(bucket, key, value)`, so an
/// unchanged write produces an unchanged etag.
pub(crate) fn compute_etag(bucket: &str, key: &str, value: &Value) -> String {
    let mut buf = Vec::with_capacity(bucket.len() + key.len() + 32);
    buf.extend_from_slice(bucket.as_bytes());
    buf.push(0);
    buf.extend_from_slice(key.as_bytes());
    buf.push(0);
    buf.extend_from_slice(serde_json::to_string(value).unwrap_or_default().as_bytes());
    format!("{:016x}", xxh64(&buf, 0))
}

/// The refreshed etag of a bulk column update. The stored `_value` is
/// untouched by `updateObjects`, so the tag derives from the bucket, the
/// updated fields, and the write time instead; it only needs to mark the
/// rows as changed.
fn update_etag(bucket: &str, fields: &BTreeMap<String, Value>, mtime: i64) -> String {
    let mut buf = Vec::new();
    buf.extend_from_slice(bucket.as_bytes());
    buf.push(0);
    buf.extend_from_slice(
        serde_json::to_string(fields)
            .unwrap_or_default()
            .as_bytes(),
    );
    buf.extend_from_slice(&mtime.to_be_bytes());
    format!("{:016x}", xxh64(&buf, 0))
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn missing(what: &str) -> Error {
    DbError::Internal(format!("request has no {what}")).into()
}

/// Fail with `ObjectNotFound` unless a previous row was loaded.
pub fn require_previous(req: &mut Request) -> BoxFuture<'_, Result<(), Error>> {
    Box::pin(async move {
        if req.previous.is_none() {
            return Err(ObjectError::ObjectNotFound {
                bucket: req.bucket_name.clone(),
                key: req.key.clone().unwrap_or_default(),
            }
            .into());
        }
        Ok(())
    })
}

/// Write the object row: INSERT when no previous row exists, UPDATE
/// otherwise. Projects indexed columns, stamps `_etag` and `_mtime`, and
/// stamps `_rver` when the bucket tracks row versions.
pub fn exec_put(req: &mut Request) -> BoxFuture<'_, Result<(), Error>> {
    Box::pin(async move {
        let bucket = Arc::clone(req.bucket()?);
        let key = req.key.clone().ok_or_else(|| missing("key"))?;
        let value = req.value.clone().ok_or_else(|| missing("value"))?;

        let etag = compute_etag(&bucket.name, &key, &value);
        let mtime = now_ms();
        let value_text = serde_json::to_string(&value)
            .map_err(|e| DbError::Internal(format!("unserialisable value: {e}")))?;
        let projection = index_object(&bucket.index, &value)?;

        let mut args = vec![
            SqlValue::Text(key),
            SqlValue::Text(value_text),
            SqlValue::Text(etag.clone()),
            SqlValue::Int(mtime),
        ];

        let sql = if req.previous.is_none() {
            let mut columns = String::from("_key, _value, _etag, _mtime");
            if bucket.has_row_version() {
                args.push(SqlValue::Int(i64::from(bucket.options.version)));
                columns.push_str(", _rver");
            }
            for (field, col) in projection {
                args.push(col);
                columns.push_str(", ");
                columns.push_str(&field);
            }
            let placeholders: Vec<String> = (1..=args.len()).map(|n| format!("${n}")).collect();
            format!(
                "INSERT INTO {} ({columns}) VALUES ({}) RETURNING _id",
                bucket.name,
                placeholders.join(", ")
            )
        } else {
            let mut sets = vec![
                "_value = $2".to_string(),
                "_etag = $3".to_string(),
                "_mtime = $4".to_string(),
            ];
            if bucket.has_row_version() {
                args.push(SqlValue::Int(i64::from(bucket.options.version)));
                sets.push(format!("_rver = ${}", args.len()));
            }
            for (field, col) in projection {
                args.push(col);
                sets.push(format!("{field} = ${}", args.len()));
            }
            format!(
                "UPDATE {} SET {} WHERE _key = $1 RETURNING _id",
                bucket.name,
                sets.join(", ")
            )
        };

        let mut rows = match req.session.query(&sql, &args).await {
            Err(DbError::UniqueViolation(msg)) => {
                return Err(ObjectError::UniqueAttribute(msg).into());
            }
            other => other?,
        };
        req.row_id = match rows.pop() {
            Some(row) => Some(row.int("_id")?),
            None => None,
        };
        req.etag = Some(etag);
        req.affected = 1;
        Ok(())
    })
}

/// Delete the previously loaded row.
pub fn exec_del(req: &mut Request) -> BoxFuture<'_, Result<(), Error>> {
    Box::pin(async move {
        let bucket = Arc::clone(req.bucket()?);
        let key = req.key.clone().ok_or_else(|| missing("key"))?;
        req.affected = req
            .session
            .execute(
                &format!("DELETE FROM {} WHERE _key = $1", bucket.name),
                &[SqlValue::Text(key)],
            )
            .await?;
        Ok(())
    })
}

/// Bulk update of indexed columns for every row matching the filter. The
/// stored JSON `_value` is untouched; `_etag` and `_mtime` are refreshed.
pub fn exec_update_fields(req: &mut Request) -> BoxFuture<'_, Result<(), Error>> {
    Box::pin(async move {
        let bucket = Arc::clone(req.bucket()?);
        let fields = req.fields.clone().ok_or_else(|| missing("fields"))?;
        let decorated = req
            .decorated
            .take()
            .ok_or_else(|| missing("decorated filter"))?;

        let mtime = now_ms();
        let mut sets = Vec::with_capacity(fields.len() + 3);
        let mut args = Vec::with_capacity(fields.len() + 3);

        for (field, value) in &fields {
            let def = bucket.index.get(field).ok_or_else(|| {
                Error::from(FilterError::NotIndexed(format!(
                    "cannot update unindexed field '{field}'"
                )))
            })?;
            args.push(coerce_field(def.field_type, value)?);
            sets.push(format!("{field} = ${}", args.len()));
        }

        args.push(SqlValue::Text(update_etag(&bucket.name, &fields, mtime)));
        sets.push(format!("_etag = ${}", args.len()));
        args.push(SqlValue::Int(mtime));
        sets.push(format!("_mtime = ${}", args.len()));
        if bucket.has_row_version() {
            args.push(SqlValue::Int(i64::from(bucket.options.version)));
            sets.push(format!("_rver = ${}", args.len()));
        }

        let compiled = compile_from(&decorated, args.len())?;
        args.extend(compiled.args);

        let sql = format!(
            "UPDATE {name} SET {} WHERE _key IN (SELECT _key FROM {name} WHERE {})",
            sets.join(", "),
            compiled.clause,
            name = bucket.name,
        );
        req.affected = req.session.execute(&sql, &args).await?;
        Ok(())
    })
}

/// Delete every row matching the compiled filter.
pub fn exec_delete_many(req: &mut Request) -> BoxFuture<'_, Result<(), Error>> {
    Box::pin(async move {
        let bucket = Arc::clone(req.bucket()?);
        let decorated = req
            .decorated
            .take()
            .ok_or_else(|| missing("decorated filter"))?;
        let compiled = compile_from(&decorated, 0)?;

        let sql = format!(
            "DELETE FROM {name} WHERE _key IN (SELECT _key FROM {name} WHERE {})",
            compiled.clause,
            name = bucket.name,
        );
        req.affected = req.session.execute(&sql, &compiled.args).await?;
        Ok(())
    })
}

/// Run an atomic sequence of operations inside the surrounding pipeline's
/// transaction, re-threading the request through the same handlers each
/// single-operation pipeline uses.
pub fn exec_batch(req: &mut Request) -> BoxFuture<'_, Result<(), Error>> {
    Box::pin(async move {
        let ops = std::mem::take(&mut req.batch);
        for op in ops {
            match op {
                BatchOp::Put {
                    bucket,
                    key,
                    value,
                    etag,
                } => {
                    req.reset_for(bucket);
                    req.key = Some(key);
                    req.value = Some(value);
                    req.opts.etag = etag;
                    load_bucket(req).await?;
                    load_previous(req).await?;
                    check_etag(req).await?;
                    run_pre_triggers(req).await?;
                    exec_put(req).await?;
                    run_post_triggers(req).await?;
                    let etag = req.etag.clone().unwrap_or_default();
                    req.batch_results.push(BatchResult::Etag(etag));
                }
                BatchOp::Update {
                    bucket,
                    fields,
                    filter,
                } => {
                    req.reset_for(bucket);
                    req.fields = Some(fields);
                    req.filter = Some(filter);
                    load_bucket(req).await?;
                    parse_filter(req).await?;
                    decorate_filter(req).await?;
                    exec_update_fields(req).await?;
                    req.batch_results.push(BatchResult::Count(req.affected));
                }
                BatchOp::Delete { bucket, key, etag } => {
                    req.reset_for(bucket);
                    req.key = Some(key);
                    req.opts.etag = etag;
                    load_bucket(req).await?;
                    load_previous(req).await?;
                    require_previous(req).await?;
                    check_etag(req).await?;
                    run_pre_triggers(req).await?;
                    exec_del(req).await?;
                    run_post_triggers(req).await?;
                    req.batch_results.push(BatchResult::Count(req.affected));
                }
                BatchOp::DeleteMany { bucket, filter } => {
                    req.reset_for(bucket);
                    req.filter = Some(filter);
                    load_bucket(req).await?;
                    parse_filter(req).await?;
                    decorate_filter(req).await?;
                    exec_delete_many(req).await?;
                    req.batch_results.push(BatchResult::Count(req.affected));
                }
            }
        }
        Ok(())
    })
}
