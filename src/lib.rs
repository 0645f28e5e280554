//! Cushion Adapter connects the cushion ODM to a document bucket.
//!
//! It sits between application model code and the bucket client, and does two jobs:
//! fanning key-addressed CRUD out into concurrent per-key operations, and funnelling
//! every kind of search (views, spatial indexes, N1QL statements, pre-built queries)
//! through one execution path that ends in hydrated models.
//!
//! ## Core Components
//! - [`engine`]: An in-memory bucket with Couchbase-like semantics, plus fixture loading.
//! - [`sdk`]: The adapter, query dispatch, response normalization and model hydration.

pub mod engine;
pub mod sdk;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::sdk::options::{OptionSet, Timeouts};
use crate::sdk::query::Query;

/// Errors returned by the adapter and by bucket implementations.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid or missing configuration. Raised before any network activity.
    #[error("invalid options given for connection: {0}")]
    Config(String),
    /// The requested model kind is not registered.
    #[error("requested model type `{0}` not found")]
    ModelNotFound(String),
    /// A read or remove targeted a key that is not stored.
    #[error("key not found")]
    KeyNotFound(String),
    /// An insert targeted a key that is already stored.
    #[error("key already exists")]
    KeyExists(String),
    /// A replace targeted a key that is not stored.
    #[error("key does not exist")]
    KeyDoesNotExist(String),
    /// A response row could not be turned into a model. Carries the raw response.
    #[error("could not hydrate `{kind}` models: {source}")]
    Hydration {
        kind: String,
        source: Box<Error>,
        response: serde_json::Value,
    },
    /// The query succeeded but produced no envelope at all.
    #[error("could not get documents from bucket")]
    NoDocuments,
    /// The operation did not complete within the configured timeout.
    #[error("operation timed out")]
    Timeout,
    /// The bucket or query service rejected a query.
    #[error("query failed: {0}")]
    Query(String),
    /// The bucket does not support the requested query type.
    #[error("unsupported: {0}")]
    Unsupported(String),
    /// A failure in the HTTP query-service fallback.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    /// An I/O error while reading or writing fixtures.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Error during JSON serialization or deserialization.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// An internal error occurred.
    #[error("internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for adapter operations.
pub type Result<T> = std::result::Result<T, Error>;

/// A stored document as returned by a read.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Document {
    pub value: serde_json::Value,
    pub cas: u64,
}

/// The result of a single-key write.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MutationResult {
    pub key: String,
    pub cas: u64,
}

/// Single-key read primitives.
#[async_trait]
pub trait DocumentReader: Send + Sync {
    /// Retrieves one document.
    async fn get(&self, key: &str) -> Result<Document>;

    /// Retrieves several documents, keyed by their document key.
    ///
    /// Buckets without a native multi-get inherit this version, which issues one
    /// read per key and fails with the first error in key order.
    async fn get_multi(&self, keys: &[String]) -> Result<HashMap<String, Document>> {
        let reads = join_all(keys.iter().map(|key| self.get(key))).await;
        let mut out = HashMap::with_capacity(keys.len());
        for (key, doc) in keys.iter().zip(reads) {
            out.insert(key.clone(), doc?);
        }
        Ok(out)
    }
}

/// Single-key write primitives.
#[async_trait]
pub trait DocumentWriter: Send + Sync {
    /// Stores a document whether or not the key exists.
    async fn upsert(&self, key: &str, value: serde_json::Value) -> Result<MutationResult>;
    /// Stores a document only if the key does not exist yet.
    async fn insert(&self, key: &str, value: serde_json::Value) -> Result<MutationResult>;
    /// Overwrites a document only if the key already exists.
    async fn replace(&self, key: &str, value: serde_json::Value) -> Result<MutationResult>;
    /// Removes a document.
    async fn remove(&self, key: &str) -> Result<MutationResult>;
}

/// Query execution primitive.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Runs a query and returns its response envelope.
    ///
    /// `Ok(None)` means the bucket answered without any envelope, which callers treat
    /// differently from an empty row set.
    async fn query(&self, query: &Query) -> Result<Option<serde_json::Value>>;
}

/// An open bucket: the full storage contract the adapter consumes.
pub trait Bucket: DocumentReader + DocumentWriter + QueryExecutor {
    /// The bucket's name.
    fn name(&self) -> &str;
    /// Applies per-operation timeouts chosen at connect time.
    fn configure(&self, timeouts: &Timeouts);
}

/// A bucket handle shared by every operation issued against it.
pub type SharedBucket = Arc<dyn Bucket>;

/// Opens buckets from an option set.
pub trait Connector: Send + Sync {
    fn open_bucket(&self, options: &OptionSet) -> Result<SharedBucket>;
}
