//! Core types: semantic field types, bucket configuration, stored objects.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ConfigError, Error};

/// Bucket names that can never be created by clients.
pub const RESERVED_BUCKETS: &[&str] = &["moray", "search"];

/// Default page size applied to find results when the caller sets neither
/// `limit` nor `no_limit`.
pub const DEFAULT_FIND_LIMIT: u64 = 1000;

/// The semantic type of an indexed field.
///
/// Scalar types project into a single typed column; array types project into
/// the native PostgreSQL array representation of the element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    #[serde(rename = "string")]
    String,
    #[serde(rename = "number")]
    Number,
    #[serde(rename = "boolean")]
    Boolean,
    #[serde(rename = "ip")]
    Ip,
    #[serde(rename = "subnet")]
    Subnet,
    #[serde(rename = "[string]")]
    StringArray,
    #[serde(rename = "[number]")]
    NumberArray,
    #[serde(rename = "[boolean]")]
    BooleanArray,
    #[serde(rename = "[ip]")]
    IpArray,
    #[serde(rename = "[subnet]")]
    SubnetArray,
}

impl FieldType {
    /// Whether this is an array variant.
    pub fn is_array(&self) -> bool {
        matches!(
            self,
            FieldType::StringArray
                | FieldType::NumberArray
                | FieldType::BooleanArray
                | FieldType::IpArray
                | FieldType::SubnetArray
        )
    }

    /// The scalar type of this field: identity for scalars, the element
    /// type for arrays.
    pub fn element(&self) -> FieldType {
        match self {
            FieldType::StringArray => FieldType::String,
            FieldType::NumberArray => FieldType::Number,
            FieldType::BooleanArray => FieldType::Boolean,
            FieldType::IpArray => FieldType::Ip,
            FieldType::SubnetArray => FieldType::Subnet,
            scalar => *scalar,
        }
    }

    /// The PostgreSQL column type backing this field.
    pub fn pg_type(&self) -> &'static str {
        match self {
            FieldType::String => "TEXT",
            FieldType::Number => "BIGINT",
            FieldType::Boolean => "BOOLEAN",
            FieldType::Ip => "INET",
            FieldType::Subnet => "CIDR",
            FieldType::StringArray => "TEXT[]",
            FieldType::NumberArray => "BIGINT[]",
            FieldType::BooleanArray => "BOOLEAN[]",
            FieldType::IpArray => "INET[]",
            FieldType::SubnetArray => "CIDR[]",
        }
    }

    /// The index access method used for this field's partial index: GIN for
    /// array containment, BTREE otherwise.
    pub fn index_method(&self) -> &'static str {
        if self.is_array() { "GIN" } else { "BTREE" }
    }

    /// Human-readable name, matching the declaration syntax.
    pub fn name(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Ip => "ip",
            FieldType::Subnet => "subnet",
            FieldType::StringArray => "[string]",
            FieldType::NumberArray => "[number]",
            FieldType::BooleanArray => "[boolean]",
            FieldType::IpArray => "[ip]",
            FieldType::SubnetArray => "[subnet]",
        }
    }
}

/// Declaration of a single indexed field within a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IndexField {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub unique: bool,
}

/// Bucket-level options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketOptions {
    /// Schema version. Monotonically non-decreasing across updates; `0` is
    /// treated as legacy / always overwrite.
    #[serde(default)]
    pub version: u32,
}

/// A bucket configuration as supplied by a caller to create or update a
/// bucket. Trigger hooks are carried as ordered lists of registered
/// trigger names.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BucketConfig {
    #[serde(default)]
    pub index: BTreeMap<String, IndexField>,
    #[serde(default)]
    pub pre: Vec<String>,
    #[serde(default)]
    pub post: Vec<String>,
    #[serde(default)]
    pub options: BucketOptions,
}

impl BucketConfig {
    /// Parse a configuration from free-form JSON, rejecting structural
    /// problems (non-object `index`/`options`, unknown keys under a field
    /// declaration, non-integer `version`, non-boolean `unique`, unknown
    /// `type` values).
    pub fn from_value(value: Value) -> Result<Self, Error> {
        serde_json::from_value(value)
            .map_err(|e| ConfigError::InvalidBucketConfig(e.to_string()).into())
    }
}

/// The etag precondition supplied with a conditional write.
///
/// Distinguishes "no precondition" from "require that no row exists" from
/// "require the stored etag to match".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum EtagSpec {
    /// No precondition; the write always proceeds.
    #[default]
    Unspecified,
    /// The write only proceeds if no previous row exists.
    Null,
    /// The write only proceeds if the stored etag equals this value.
    Value(String),
}

/// An object as returned by the read path: the reconstructed JSON value
/// plus the row's system fields.
#[derive(Debug, Clone, Serialize)]
pub struct StoredObject {
    pub bucket: String,
    pub key: String,
    pub value: Value,
    pub id: i64,
    pub etag: String,
    pub mtime: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub txn_snap: Option<i64>,
    /// Windowed total match count, present on find results.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<i64>,
    #[serde(skip)]
    pub rver: Option<i32>,
}

/// The type of an internal (system) field usable in filters, or `None` if
/// the attribute is not an internal field.
pub fn internal_field_type(attr: &str) -> Option<FieldType> {
    match attr {
        "_key" | "_etag" => Some(FieldType::String),
        "_id" | "_mtime" | "_txn_snap" => Some(FieldType::Number),
        _ => None,
    }
}
