use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use log::{debug, info};
use serde::Serialize;
use serde_json::Value;

use crate::sdk::options::OptionSet;
use crate::sdk::query::Query;
use crate::{
    Bucket, Connector, Document, DocumentReader, DocumentWriter, Error, MutationResult, QueryExecutor, Result,
    SharedBucket,
};

/// One key or an ordered batch of keys.
///
/// The variant decides the shape of the result: one key gives one result, a batch
/// gives one result per key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Keys {
    One(String),
    Many(Vec<String>),
}

impl Keys {
    pub fn len(&self) -> usize {
        match self {
            Keys::One(_) => 1,
            Keys::Many(keys) => keys.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<&str> for Keys {
    fn from(key: &str) -> Self {
        Keys::One(key.to_string())
    }
}

impl From<String> for Keys {
    fn from(key: String) -> Self {
        Keys::One(key)
    }
}

impl From<&String> for Keys {
    fn from(key: &String) -> Self {
        Keys::One(key.clone())
    }
}

impl From<Vec<String>> for Keys {
    fn from(keys: Vec<String>) -> Self {
        Keys::Many(keys)
    }
}

impl From<Vec<&str>> for Keys {
    fn from(keys: Vec<&str>) -> Self {
        Keys::Many(keys.into_iter().map(str::to_string).collect())
    }
}

impl From<&[&str]> for Keys {
    fn from(keys: &[&str]) -> Self {
        Keys::Many(keys.iter().map(|k| k.to_string()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for Keys {
    fn from(keys: [&str; N]) -> Self {
        Keys::Many(keys.iter().map(|k| k.to_string()).collect())
    }
}

/// Write results shaped like the keys that produced them.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum Outcome<T> {
    One(T),
    /// One result per key, in key order.
    Many(Vec<T>),
}

impl<T> Outcome<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            Outcome::One(result) => vec![result],
            Outcome::Many(results) => results,
        }
    }
}

/// Read results: one document, or documents by key.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum Fetched {
    One(Document),
    Many(HashMap<String, Document>),
}

/// A single-key write primitive with its payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Upsert(Value),
    Insert(Value),
    Replace(Value),
    Remove,
}

impl Mutation {
    pub fn name(&self) -> &'static str {
        match self {
            Mutation::Upsert(_) => "save",
            Mutation::Insert(_) => "insert",
            Mutation::Replace(_) => "update",
            Mutation::Remove => "delete",
        }
    }

    async fn apply(&self, bucket: &SharedBucket, key: &str) -> Result<MutationResult> {
        match self {
            Mutation::Upsert(value) => bucket.upsert(key, value.clone()).await,
            Mutation::Insert(value) => bucket.insert(key, value.clone()).await,
            Mutation::Replace(value) => bucket.replace(key, value.clone()).await,
            Mutation::Remove => bucket.remove(key).await,
        }
    }
}

/// The CRUD verbs a host can call by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Get,
    Save,
    Insert,
    Update,
    Delete,
}

impl FromStr for Verb {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "get" => Ok(Verb::Get),
            "save" | "upsert" => Ok(Verb::Save),
            "insert" => Ok(Verb::Insert),
            "update" | "replace" => Ok(Verb::Update),
            "del" | "remove" | "delete" => Ok(Verb::Delete),
            other => Err(Error::Config(format!("unknown verb `{}`", other))),
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Verb::Get => "get",
            Verb::Save => "save",
            Verb::Insert => "insert",
            Verb::Update => "update",
            Verb::Delete => "del",
        };
        write!(f, "{}", name)
    }
}

/// Counts a dispatched operation until it finishes, however it finishes.
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn bounded<T, F>(limit: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match limit {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(res) => res,
            Err(_) => Err(Error::Timeout),
        },
        None => fut.await,
    }
}

/// Key-addressed access to one bucket.
///
/// Batches fan out into one concurrent task per key. Batches are not atomic: the
/// first failure is reported as soon as it is seen, the other tasks keep running,
/// and writes that succeed are not undone.
pub struct Adapter {
    bucket: SharedBucket,
    options: RwLock<OptionSet>,
    in_flight: Arc<AtomicUsize>,
}

impl Adapter {
    /// Validates `options` and opens the bucket they name.
    pub fn connect(connector: &dyn Connector, options: OptionSet) -> Result<Self> {
        options.validate_connect()?;
        let bucket = connector.open_bucket(&options)?;
        info!(
            "connected to bucket `{}` on {}",
            bucket.name(),
            options.host.as_deref().unwrap_or_default()
        );
        Ok(Self::with_bucket(bucket, options))
    }

    /// Wraps an already open bucket. No validation is done.
    pub fn with_bucket(bucket: SharedBucket, options: OptionSet) -> Self {
        Self {
            bucket,
            options: RwLock::new(options),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn bucket(&self) -> &SharedBucket {
        &self.bucket
    }

    /// A snapshot of the current options.
    pub fn options(&self) -> Result<OptionSet> {
        self.options
            .read()
            .map(|o| o.clone())
            .map_err(|_| Error::Internal("options lock poisoned".to_string()))
    }

    pub fn get_option(&self, name: &str) -> Option<Value> {
        self.options.read().ok()?.get_option(name)
    }

    pub fn set_option(&self, name: &str, value: Value) -> Result<&Self> {
        self.options
            .write()
            .map_err(|_| Error::Internal("options lock poisoned".to_string()))?
            .set_option(name, value)?;
        Ok(self)
    }

    fn operation_timeout(&self) -> Result<Option<Duration>> {
        Ok(self.options()?.timeouts().operation)
    }

    /// Reads one document, or several as a key-indexed map.
    pub async fn get(&self, keys: impl Into<Keys>) -> Result<Fetched> {
        let limit = self.operation_timeout()?;
        match keys.into() {
            Keys::One(key) => {
                debug!("get (1) doc: {}", key);
                Ok(Fetched::One(bounded(limit, self.bucket.get(&key)).await?))
            }
            Keys::Many(keys) => {
                if keys.is_empty() {
                    return Err(Error::Config("get needs at least one key".to_string()));
                }
                debug!("get ({}) docs", keys.len());
                Ok(Fetched::Many(bounded(limit, self.bucket.get_multi(&keys)).await?))
            }
        }
    }

    pub async fn save(&self, keys: impl Into<Keys>, value: Value) -> Result<Outcome<MutationResult>> {
        self.execute(keys, Mutation::Upsert(value)).await
    }

    /// Like [`Adapter::save`], but fails for keys that already exist.
    pub async fn insert(&self, keys: impl Into<Keys>, value: Value) -> Result<Outcome<MutationResult>> {
        self.execute(keys, Mutation::Insert(value)).await
    }

    /// Like [`Adapter::save`], but fails for keys that do not exist.
    pub async fn update(&self, keys: impl Into<Keys>, value: Value) -> Result<Outcome<MutationResult>> {
        self.execute(keys, Mutation::Replace(value)).await
    }

    pub async fn del(&self, keys: impl Into<Keys>) -> Result<Outcome<MutationResult>> {
        self.execute(keys, Mutation::Remove).await
    }

    /// Applies `mutation` to every key.
    ///
    /// A single key is passed straight to the bucket. A batch spawns every per-key
    /// write before awaiting any of them, and reassembles the results in key order.
    pub async fn execute(&self, keys: impl Into<Keys>, mutation: Mutation) -> Result<Outcome<MutationResult>> {
        let limit = self.operation_timeout()?;
        match keys.into() {
            Keys::One(key) => {
                debug!("{} (1) doc: {}", mutation.name(), key);
                let _guard = InFlight::enter(&self.in_flight);
                Ok(Outcome::One(bounded(limit, mutation.apply(&self.bucket, &key)).await?))
            }
            Keys::Many(keys) => {
                if keys.is_empty() {
                    return Err(Error::Config(format!("{} needs at least one key", mutation.name())));
                }
                debug!("{} ({}) docs", mutation.name(), keys.len());
                Ok(Outcome::Many(self.fan_out(keys, mutation, limit).await?))
            }
        }
    }

    async fn fan_out(&self, keys: Vec<String>, mutation: Mutation, limit: Option<Duration>) -> Result<Vec<MutationResult>> {
        let count = keys.len();
        let mutation = Arc::new(mutation);
        let mut pending = FuturesUnordered::new();

        for (index, key) in keys.into_iter().enumerate() {
            let bucket = self.bucket.clone();
            let mutation = mutation.clone();
            let guard = InFlight::enter(&self.in_flight);
            let handle = tokio::spawn(async move {
                let _guard = guard;
                bounded(limit, mutation.apply(&bucket, &key)).await
            });
            pending.push(async move { (index, handle.await) });
        }

        let mut results: Vec<Option<MutationResult>> = vec![None; count];
        while let Some((index, joined)) = pending.next().await {
            let result = joined.map_err(|e| Error::Internal(format!("write task failed: {}", e)))?;
            match result {
                Ok(res) => results[index] = Some(res),
                Err(e) => {
                    debug!("{} batch failed at index {}: {}", mutation.name(), index, e);
                    return Err(e);
                }
            }
        }

        results
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| Error::Internal("batch finished with missing results".to_string()))
    }

    /// Runs a named verb. Write verbs need a value, except delete.
    pub async fn run(&self, verb: Verb, keys: impl Into<Keys>, value: Option<Value>) -> Result<Value> {
        let keys = keys.into();
        let out = match (verb, value) {
            (Verb::Get, _) => serde_json::to_value(self.get(keys).await?)?,
            (Verb::Delete, _) => serde_json::to_value(self.del(keys).await?)?,
            (Verb::Save, Some(value)) => serde_json::to_value(self.save(keys, value).await?)?,
            (Verb::Insert, Some(value)) => serde_json::to_value(self.insert(keys, value).await?)?,
            (Verb::Update, Some(value)) => serde_json::to_value(self.update(keys, value).await?)?,
            (verb, None) => return Err(Error::Config(format!("`{}` needs a value", verb))),
        };
        Ok(out)
    }

    /// Runs a query against the adapter's bucket.
    pub async fn query(&self, query: &Query) -> Result<Option<Value>> {
        self.query_on(&self.bucket, query).await
    }

    /// Runs a query against `bucket`, bounded by the view timeout for view and
    /// spatial queries and by the operation timeout otherwise.
    pub async fn query_on(&self, bucket: &SharedBucket, query: &Query) -> Result<Option<Value>> {
        let timeouts = self.options()?.timeouts();
        let limit = match query {
            Query::View(_) | Query::Spatial(_) => timeouts.view,
            _ => timeouts.operation,
        };
        debug!("running {} query on `{}`", query.kind(), bucket.name());
        bounded(limit, bucket.query(query)).await
    }

    /// Waits until every dispatched operation has finished, including batch
    /// members still running after their batch already reported an error.
    pub async fn settle(&self) {
        while self.in_flight.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
