//! Error types for all tidepool operations.

use thiserror::Error;

/// Top-level error type for tidepool operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Coerce(#[from] CoerceError),

    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error(transparent)]
    Object(#[from] ObjectError),

    #[error(transparent)]
    Db(#[from] DbError),
}

impl Error {
    /// Whether the operation may be retried as-is. Only database errors
    /// classified as transient qualify; validation and compilation errors
    /// are fatal for the request.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Db(DbError::Transient(_)) | Error::Db(DbError::Connection(_))
        )
    }
}

/// Errors raised while validating or evolving bucket configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid bucket name: {0}")]
    InvalidBucketName(String),

    #[error("invalid bucket config: {0}")]
    InvalidBucketConfig(String),

    #[error("trigger is not a registered function: {0}")]
    NotFunction(String),

    #[error("bucket not found: {0}")]
    BucketNotFound(String),

    #[error("bucket already exists: {0}")]
    BucketExists(String),

    #[error("version {proposed} is not greater than current version {current} of bucket '{bucket}'")]
    BucketVersion {
        bucket: String,
        current: u32,
        proposed: u32,
    },
}

/// Errors raised while coercing JSON values to indexed column values.
#[derive(Debug, Error)]
pub enum CoerceError {
    #[error("value '{value}' is not a valid {ftype}")]
    InvalidIndexType { ftype: String, value: String },
}

/// Errors raised while parsing or compiling a filter string.
#[derive(Debug, Error)]
pub enum FilterError {
    #[error("invalid filter: {0}")]
    InvalidQuery(String),

    #[error("filter requires a scan of unindexed fields: {0}")]
    NotIndexed(String),
}

/// Errors raised on the object read/write paths.
#[derive(Debug, Error)]
pub enum ObjectError {
    #[error("object not found: {bucket}::{key}")]
    ObjectNotFound { bucket: String, key: String },

    #[error("etag conflict on {bucket}::{key}: expected {expected}, actual {actual}")]
    EtagConflict {
        bucket: String,
        key: String,
        expected: String,
        actual: String,
    },

    #[error("unique attribute constraint violated: {0}")]
    UniqueAttribute(String),
}

/// Errors surfaced by the database session.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("transient database error: {0}")]
    Transient(String),

    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("internal database error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::from(DbError::Transient("deadlock".to_string())).is_transient());
        assert!(Error::from(DbError::Connection("reset".to_string())).is_transient());
        assert!(!Error::from(DbError::Query("syntax".to_string())).is_transient());
        assert!(
            !Error::from(FilterError::NotIndexed("name".to_string())).is_transient()
        );
    }

    #[test]
    fn test_error_messages() {
        let err = Error::from(ConfigError::BucketVersion {
            bucket: "people".to_string(),
            current: 3,
            proposed: 2,
        });
        let msg = format!("{err}");
        assert!(msg.contains("people"), "message: {msg}");
        assert!(msg.contains('3'), "message: {msg}");

        let err = Error::from(ObjectError::EtagConflict {
            bucket: "people".to_string(),
            key: "p1".to_string(),
            expected: "aaaa".to_string(),
            actual: "bbbb".to_string(),
        });
        assert!(format!("{err}").contains("etag conflict"));
    }
}
