//! Catalog operations: create, update, get, delete, and list buckets.
//!
//! Descriptors live in the `buckets_config` relation as JSON-serialised
//! text columns. Each bucket also owns a backing relation named after it,
//! carrying the system columns plus one typed column per indexed field and
//! one partial index per field.

use tracing::{debug, info};

use crate::error::{ConfigError, DbError, Error};
use crate::schema::{consolidate_reindex, diff_indexes, validate_bucket, SchemaDiff};
use crate::session::{Session, SqlRow, SqlValue};
use crate::types::{BucketConfig, IndexField};

use super::{parse_descriptor, BucketDescriptor, TriggerRegistry};

const CONFIG_COLUMNS: &str = "name, index, pre, post, options, reindex_active, mtime";

/// Create the `buckets_config` relation if it does not exist. Run once at
/// store start-up.
pub async fn init_catalog(session: &mut dyn Session) -> Result<(), Error> {
    session
        .execute(
            "CREATE TABLE IF NOT EXISTS buckets_config (\
             name TEXT PRIMARY KEY, \
             index TEXT NOT NULL, \
             pre TEXT NOT NULL, \
             post TEXT NOT NULL, \
             options TEXT NOT NULL, \
             reindex_active TEXT, \
             mtime TIMESTAMPTZ NOT NULL DEFAULT NOW())",
            &[],
        )
        .await?;
    Ok(())
}

fn to_json_text<T: serde::Serialize>(what: &str, value: &T) -> Result<String, Error> {
    serde_json::to_string(value)
        .map_err(|e| DbError::Internal(format!("failed to serialise {what}: {e}")).into())
}

/// The CREATE INDEX statement for one indexed field: partial, named
/// `<bucket>_<field>_idx`, GIN for array types and BTREE otherwise, UNIQUE
/// when the field demands it.
fn index_statement(bucket: &str, field: &str, def: &IndexField) -> String {
    if def.unique {
        format!(
            "CREATE UNIQUE INDEX {bucket}_{field}_idx ON {bucket} ({field}) \
             WHERE {field} IS NOT NULL"
        )
    } else {
        format!(
            "CREATE INDEX {bucket}_{field}_idx ON {bucket} USING {} ({field}) \
             WHERE {field} IS NOT NULL",
            def.field_type.index_method()
        )
    }
}

/// Fetch the raw descriptor row for a bucket, optionally locking it
/// against concurrent schema changes.
async fn load_config_row(
    session: &mut dyn Session,
    name: &str,
    for_update: bool,
) -> Result<SqlRow, Error> {
    let suffix = if for_update { " FOR UPDATE" } else { "" };
    let sql = format!("SELECT {CONFIG_COLUMNS} FROM buckets_config WHERE name = $1{suffix}");
    let mut rows = session
        .query(&sql, &[SqlValue::Text(name.to_string())])
        .await?;
    match rows.pop() {
        Some(row) => Ok(row),
        None => Err(ConfigError::BucketNotFound(name.to_string()).into()),
    }
}

/// Create a bucket: insert its descriptor and build the backing relation
/// with its per-field indexes.
pub async fn create_bucket(
    session: &mut dyn Session,
    name: &str,
    config: &BucketConfig,
    triggers: &TriggerRegistry,
) -> Result<BucketDescriptor, Error> {
    validate_bucket(name, config, triggers)?;

    let args = [
        SqlValue::Text(name.to_string()),
        SqlValue::Text(to_json_text("index", &config.index)?),
        SqlValue::Text(to_json_text("pre", &config.pre)?),
        SqlValue::Text(to_json_text("post", &config.post)?),
        SqlValue::Text(to_json_text("options", &config.options)?),
        SqlValue::Text("{}".to_string()),
    ];
    let insert = format!(
        "INSERT INTO buckets_config ({CONFIG_COLUMNS}) \
         VALUES ($1, $2, $3, $4, $5, $6, NOW())"
    );
    match session.execute(&insert, &args).await {
        Err(DbError::UniqueViolation(_)) => {
            return Err(ConfigError::BucketExists(name.to_string()).into());
        }
        Err(e) => return Err(e.into()),
        Ok(_) => {}
    }

    let mut columns = String::new();
    for (field, def) in &config.index {
        columns.push_str(&format!(", {field} {}", def.field_type.pg_type()));
    }
    session
        .execute(
            &format!(
                "CREATE TABLE {name} (\
                 _id BIGSERIAL NOT NULL, \
                 _txn_snap BIGINT, \
                 _key TEXT PRIMARY KEY, \
                 _value TEXT NOT NULL, \
                 _etag TEXT NOT NULL, \
                 _mtime BIGINT NOT NULL{columns})"
            ),
            &[],
        )
        .await?;

    for (field, def) in &config.index {
        session.execute(&index_statement(name, field, def), &[]).await?;
    }

    info!(bucket = name, version = config.options.version, "bucket created");

    let pre_triggers = triggers.resolve(&config.pre)?;
    let post_triggers = triggers.resolve(&config.post)?;
    Ok(BucketDescriptor {
        name: name.to_string(),
        index: config.index.clone(),
        pre: config.pre.clone(),
        post: config.post.clone(),
        options: config.options,
        reindex_active: Default::default(),
        mtime: chrono::Utc::now(),
        pre_triggers,
        post_triggers,
    })
}

/// Load a bucket descriptor from the catalog relation.
pub async fn get_bucket(
    session: &mut dyn Session,
    name: &str,
    triggers: &TriggerRegistry,
) -> Result<BucketDescriptor, Error> {
    let row = load_config_row(session, name, false).await?;
    parse_descriptor(&row, triggers)
}

/// Load a bucket descriptor with its catalog row locked for the rest of
/// the transaction, serialising against concurrent schema changes.
pub async fn get_bucket_locked(
    session: &mut dyn Session,
    name: &str,
    triggers: &TriggerRegistry,
) -> Result<BucketDescriptor, Error> {
    let row = load_config_row(session, name, true).await?;
    parse_descriptor(&row, triggers)
}

/// List every bucket descriptor, ordered by name.
pub async fn list_buckets(
    session: &mut dyn Session,
    triggers: &TriggerRegistry,
) -> Result<Vec<BucketDescriptor>, Error> {
    let rows = session
        .query(
            &format!("SELECT {CONFIG_COLUMNS} FROM buckets_config ORDER BY name"),
            &[],
        )
        .await?;
    rows.iter().map(|row| parse_descriptor(row, triggers)).collect()
}

/// Delete a bucket: drop its catalog row and its backing relation.
pub async fn del_bucket(session: &mut dyn Session, name: &str) -> Result<(), Error> {
    let deleted = session
        .execute(
            "DELETE FROM buckets_config WHERE name = $1",
            &[SqlValue::Text(name.to_string())],
        )
        .await?;
    if deleted == 0 {
        return Err(ConfigError::BucketNotFound(name.to_string()).into());
    }
    session.execute(&format!("DROP TABLE {name}"), &[]).await?;
    info!(bucket = name, "bucket deleted");
    Ok(())
}

/// Apply a new schema version to an existing bucket, in one logical step:
/// gate on the version, record reindex bookkeeping, then add/drop columns
/// and indexes to match the incoming index map.
///
/// The descriptor row is read `FOR UPDATE`, so concurrent updates to the
/// same bucket serialise on the row lock.
pub async fn update_bucket(
    session: &mut dyn Session,
    name: &str,
    config: &BucketConfig,
    triggers: &TriggerRegistry,
    no_reindex: bool,
) -> Result<(BucketDescriptor, SchemaDiff), Error> {
    validate_bucket(name, config, triggers)?;

    let row = load_config_row(session, name, true).await?;
    let current = parse_descriptor(&row, triggers)?;

    let v_old = current.options.version;
    let v_new = config.options.version;
    // Version 0 is legacy: it always overwrites and may itself be
    // overwritten.
    if v_old != 0 && v_old >= v_new {
        return Err(ConfigError::BucketVersion {
            bucket: name.to_string(),
            current: v_old,
            proposed: v_new,
        }
        .into());
    }

    // Older deployments predate the bookkeeping column.
    session
        .execute(
            "ALTER TABLE buckets_config ADD COLUMN IF NOT EXISTS reindex_active TEXT",
            &[],
        )
        .await?;

    let diff = diff_indexes(&current.index, &config.index);
    debug!(bucket = name, ?diff, "schema diff");

    let mut reindex_active = current.reindex_active.clone();
    let track_reindex = !no_reindex && v_new > 0;
    if track_reindex {
        session
            .execute(
                &format!("ALTER TABLE {name} ADD COLUMN IF NOT EXISTS _rver INTEGER"),
                &[],
            )
            .await?;
        session
            .execute(
                &format!(
                    "CREATE INDEX IF NOT EXISTS {name}__rver_idx ON {name} (_rver) \
                     WHERE _rver IS NOT NULL"
                ),
                &[],
            )
            .await?;
        consolidate_reindex(&mut reindex_active, v_new, &diff.added);
    }

    session
        .execute(
            "UPDATE buckets_config SET index = $2, pre = $3, post = $4, options = $5, \
             reindex_active = $6, mtime = NOW() WHERE name = $1",
            &[
                SqlValue::Text(name.to_string()),
                SqlValue::Text(to_json_text("index", &config.index)?),
                SqlValue::Text(to_json_text("pre", &config.pre)?),
                SqlValue::Text(to_json_text("post", &config.post)?),
                SqlValue::Text(to_json_text("options", &config.options)?),
                SqlValue::Text(to_json_text("reindex_active", &reindex_active)?),
            ],
        )
        .await?;

    for field in &diff.removed {
        session
            .execute(&format!("ALTER TABLE {name} DROP COLUMN {field}"), &[])
            .await?;
    }
    for field in &diff.added {
        let def = &config.index[field];
        session
            .execute(
                &format!(
                    "ALTER TABLE {name} ADD COLUMN {field} {}",
                    def.field_type.pg_type()
                ),
                &[],
            )
            .await?;
    }
    for field in &diff.added {
        session
            .execute(&index_statement(name, field, &config.index[field]), &[])
            .await?;
    }

    info!(
        bucket = name,
        from = v_old,
        to = v_new,
        added = diff.added.len(),
        removed = diff.removed.len(),
        modified = diff.modified.len(),
        "bucket updated"
    );

    let pre_triggers = triggers.resolve(&config.pre)?;
    let post_triggers = triggers.resolve(&config.post)?;
    Ok((
        BucketDescriptor {
            name: name.to_string(),
            index: config.index.clone(),
            pre: config.pre.clone(),
            post: config.post.clone(),
            options: config.options,
            reindex_active,
            mtime: chrono::Utc::now(),
            pre_triggers,
            post_triggers,
        },
        diff,
    ))
}
