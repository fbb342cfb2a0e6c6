//! # tidepool
//!
//! A schema-aware JSON object store layered on PostgreSQL.
//!
//! Clients create named *buckets* whose records are JSON objects identified
//! by a string key. Each bucket declares a set of *indexed fields* that are
//! projected from the JSON into typed relational columns, so that clients
//! can issue LDAP-style filter queries, sort, paginate, and perform
//! etag-conditional updates. Bucket schemas are versioned; adding indexed
//! fields triggers an online reindex that backfills the new columns.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use tidepool_core::api::{SessionPool, Tidepool};
//! use tidepool_core::catalog::TriggerRegistry;
//! use tidepool_core::types::BucketConfig;
//!
//! async fn demo(pool: Arc<dyn SessionPool>) -> tidepool_core::Result<()> {
//!     let store = Tidepool::new(pool, TriggerRegistry::new());
//!
//!     let config = BucketConfig::from_value(json!({
//!         "index": { "age": { "type": "number" } },
//!         "options": { "version": 1 }
//!     }))?;
//!     store.create_bucket("people", config).await?;
//!
//!     store
//!         .put_object("people", "p1", json!({"name": "ann", "age": 30}), None)
//!         .await?;
//!
//!     let found = store.find_objects("people", "(age>=18)", None).await?;
//!     assert_eq!(found.len(), 1);
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod catalog;
pub mod coerce;
pub mod error;
pub mod filter;
pub mod pipeline;
pub mod schema;
pub mod session;
pub mod types;

pub use error::{Error, Result};
