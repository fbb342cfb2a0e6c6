//! The read path: row reconstruction, `getObject`, and `findObjects`.

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::catalog::BucketDescriptor;
use crate::coerce::column_to_json;
use crate::error::{DbError, Error, FilterError, ObjectError};
use crate::filter;
use crate::filter::compile::compile;
use crate::filter::decorate::decorate;
use crate::pipeline::{Request, SortOrder};
use crate::session::{SqlRow, SqlValue};
use crate::types::{internal_field_type, StoredObject, DEFAULT_FIND_LIMIT};

use super::common::{guard_row_version, object_from_row};

/// Reconstruct a JSON object from a row.
///
/// The stored `_value` is authoritative for fields in `ignore`; for every
/// other indexed field the projected column wins: a NULL column deletes
/// the key, a non-NULL column overwrites it unless the JSON already holds
/// an array (the native array column cannot be told apart from a scalar
/// promoted on write, so a stored array is preserved as written).
pub(crate) fn row_to_object(
    bucket: &BucketDescriptor,
    ignore: &[String],
    row: &SqlRow,
) -> Result<StoredObject, Error> {
    let mut object = object_from_row(&bucket.name, row)?;

    if let serde_json::Value::Object(map) = &mut object.value {
        for (field, def) in &bucket.index {
            if ignore.iter().any(|f| f == field) {
                continue;
            }
            match row.get(field) {
                None => {}
                Some(SqlValue::Null) => {
                    map.remove(field);
                }
                Some(col) => {
                    let keep_stored =
                        matches!(map.get(field), Some(serde_json::Value::Array(_)));
                    if !keep_stored {
                        if let Some(v) = column_to_json(def.field_type, col) {
                            map.insert(field.clone(), v);
                        }
                    }
                }
            }
        }
    }

    Ok(object)
}

/// Fetch a single object by key. Read analogue of the write path's
/// previous-row load, including the row-version guard.
pub fn fetch_object(req: &mut Request) -> BoxFuture<'_, Result<(), Error>> {
    Box::pin(async move {
        let bucket = Arc::clone(req.bucket()?);
        let key = req
            .key
            .clone()
            .ok_or_else(|| DbError::Internal("request has no key".to_string()))?;

        let sql = format!("SELECT * FROM {} WHERE _key = $1", bucket.name);
        let mut rows = req
            .session
            .query(&sql, &[SqlValue::Text(key.clone())])
            .await?;
        let row = rows.pop().ok_or_else(|| {
            Error::from(ObjectError::ObjectNotFound {
                bucket: bucket.name.clone(),
                key: key.clone(),
            })
        })?;

        let rver = row.opt_int("_rver").map(|v| v as i32);
        guard_row_version(req, rver).await?;

        // Reconstruct under whichever descriptor survived the guard.
        let bucket = Arc::clone(req.bucket()?);
        let object = row_to_object(&bucket, &req.opts.ignore, &row)?;
        req.objects.push(object);
        Ok(())
    })
}

/// Parse the request's filter string.
pub fn parse_filter(req: &mut Request) -> BoxFuture<'_, Result<(), Error>> {
    Box::pin(async move {
        let raw = req
            .filter
            .as_deref()
            .ok_or_else(|| FilterError::InvalidQuery("missing filter".to_string()))?;
        req.parsed = Some(filter::parse(raw)?);
        Ok(())
    })
}

/// Decorate the parsed filter against the loaded bucket.
pub fn decorate_filter(req: &mut Request) -> BoxFuture<'_, Result<(), Error>> {
    Box::pin(async move {
        let bucket = Arc::clone(req.bucket()?);
        let parsed = req
            .parsed
            .as_ref()
            .ok_or_else(|| DbError::Internal("filter not parsed".to_string()))?;
        req.decorated = Some(decorate(parsed, &bucket)?);
        Ok(())
    })
}

/// Compile the decorated filter to a WHERE clause.
pub fn build_where(req: &mut Request) -> BoxFuture<'_, Result<(), Error>> {
    Box::pin(async move {
        let decorated = req
            .decorated
            .as_ref()
            .ok_or_else(|| DbError::Internal("filter not decorated".to_string()))?;
        req.compiled = Some(compile(decorated)?);
        Ok(())
    })
}

/// Assemble the full find SELECT for a compiled filter and options.
fn build_find_sql(bucket: &BucketDescriptor, req: &Request, clause: &str) -> Result<String, Error> {
    let mut columns = String::from("_id, _key, _value, _etag, _mtime, _txn_snap, \
                                    COUNT(*) OVER() AS _count");
    for field in bucket.index.keys() {
        columns.push_str(", ");
        columns.push_str(field);
    }

    let mut sql = format!("SELECT {columns} FROM {} WHERE {clause}", bucket.name);

    if !req.opts.sort.is_empty() {
        let mut terms = Vec::with_capacity(req.opts.sort.len());
        for key in &req.opts.sort {
            if !bucket.index.contains_key(&key.attr) && internal_field_type(&key.attr).is_none() {
                return Err(FilterError::InvalidQuery(format!(
                    "cannot sort on unindexed attribute '{}'",
                    key.attr
                ))
                .into());
            }
            let dir = match key.order {
                SortOrder::Asc => "ASC",
                SortOrder::Desc => "DESC",
            };
            terms.push(format!("{} {dir}", key.attr));
        }
        sql.push_str(" ORDER BY ");
        sql.push_str(&terms.join(", "));
    }

    if !req.opts.no_limit {
        let limit = req.opts.limit.unwrap_or(DEFAULT_FIND_LIMIT);
        sql.push_str(&format!(" LIMIT {limit}"));
    }
    if let Some(offset) = req.opts.offset {
        sql.push_str(&format!(" OFFSET {offset}"));
    }

    Ok(sql)
}

/// Run the compiled find and reconstruct each returned row.
pub fn fetch_rows(req: &mut Request) -> BoxFuture<'_, Result<(), Error>> {
    Box::pin(async move {
        let bucket = Arc::clone(req.bucket()?);
        let compiled = req
            .compiled
            .take()
            .ok_or_else(|| DbError::Internal("filter not compiled".to_string()))?;

        let sql = build_find_sql(&bucket, req, &compiled.clause)?;
        let rows = req.session.query(&sql, &compiled.args).await?;
        for row in &rows {
            req.objects.push(row_to_object(&bucket, &req.opts.ignore, row)?);
        }
        Ok(())
    })
}
