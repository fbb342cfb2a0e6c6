//! Online reindexing: backfill projected columns for rows written under
//! older schema versions.

use futures::future::BoxFuture;
use tracing::{debug, info};

use crate::catalog::ops;
use crate::error::{DbError, Error};
use crate::pipeline::Request;
use crate::session::SqlValue;

use super::common::object_from_row;
use super::write::index_object;

/// Default number of rows processed per call when the caller does not
/// supply a batch size.
const DEFAULT_REINDEX_BATCH: u64 = 100;

/// Backfill up to the requested number of rows whose `_rver` trails the
/// bucket's current version, re-projecting every indexed column from the
/// stored JSON. When the batch comes up short the backlog is drained:
/// completed versions are cleared from the descriptor's bookkeeping and
/// the cache entry is shot down so readers pick up the fully indexed
/// schema.
pub fn exec_reindex(req: &mut Request) -> BoxFuture<'_, Result<(), Error>> {
    Box::pin(async move {
        let count = req.opts.limit.unwrap_or(DEFAULT_REINDEX_BATCH);

        // Fresh, locked read: reindexing must see the current schema and
        // exclude concurrent bucket updates.
        let bucket =
            ops::get_bucket_locked(req.session.as_mut(), &req.bucket_name, &req.triggers).await?;
        if bucket.reindex_active.is_empty() {
            req.affected = 0;
            return Ok(());
        }
        let version = bucket.options.version;

        let rows = req
            .session
            .query(
                &format!(
                    "SELECT * FROM {} WHERE _rver IS NULL OR _rver < $1 \
                     LIMIT $2 FOR UPDATE",
                    bucket.name
                ),
                &[
                    SqlValue::Int(i64::from(version)),
                    SqlValue::Int(count as i64),
                ],
            )
            .await?;
        let processed = rows.len() as u64;

        for row in &rows {
            let object = object_from_row(&bucket.name, row)?;
            let projection = index_object(&bucket.index, &object.value)?;

            let mut sets = Vec::with_capacity(projection.len() + 1);
            let mut args = Vec::with_capacity(projection.len() + 2);
            for (field, col) in projection {
                args.push(col);
                sets.push(format!("{field} = ${}", args.len()));
            }
            args.push(SqlValue::Int(i64::from(version)));
            sets.push(format!("_rver = ${}", args.len()));
            args.push(SqlValue::Int(object.id));

            req.session
                .execute(
                    &format!(
                        "UPDATE {} SET {} WHERE _id = ${}",
                        bucket.name,
                        sets.join(", "),
                        args.len()
                    ),
                    &args,
                )
                .await?;
        }

        if processed < count {
            // Backlog drained: every version up to the current one is now
            // fully projected.
            let remaining: std::collections::BTreeMap<_, _> = bucket
                .reindex_active
                .iter()
                .filter(|(v, _)| **v > version)
                .map(|(v, fields)| (*v, fields.clone()))
                .collect();
            let serialised = serde_json::to_string(&remaining)
                .map_err(|e| DbError::Internal(format!("failed to serialise reindex state: {e}")))?;
            req.session
                .execute(
                    "UPDATE buckets_config SET reindex_active = $2, mtime = NOW() \
                     WHERE name = $1",
                    &[
                        SqlValue::Text(bucket.name.clone()),
                        SqlValue::Text(serialised),
                    ],
                )
                .await?;
            req.cache.invalidate(&req.bucket_name);
            info!(bucket = %bucket.name, version, processed, "reindex drained");
        } else {
            debug!(bucket = %bucket.name, version, processed, "reindex batch");
        }

        req.affected = processed;
        Ok(())
    })
}
