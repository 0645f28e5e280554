use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::sdk::options::Timeouts;
use crate::sdk::query::{N1qlQuery, Query, SpatialQuery, ViewQuery};
use crate::{Bucket, Document, DocumentReader, DocumentWriter, Error, MutationResult, QueryExecutor, Result};

/// A view map function: `(doc key, doc) -> [(emitted key, emitted value)]`.
pub type ViewFn = Arc<dyn Fn(&str, &Value) -> Vec<(Value, Value)> + Send + Sync>;
/// A spatial map function: `(doc key, doc) -> ([lon, lat], emitted value)`.
pub type SpatialFn = Arc<dyn Fn(&str, &Value) -> Option<([f64; 2], Value)> + Send + Sync>;

type IndexName = (String, String);

/// An in-memory bucket with Couchbase-style write semantics.
///
/// Views and spatial indexes are Rust closures registered up front; N1QL is not
/// parsed, statements are answered from stubs. Per-key latency can be injected to
/// control completion order in tests.
pub struct MemStore {
    name: String,
    data: RwLock<BTreeMap<String, Document>>,
    cas: AtomicU64,
    views: RwLock<HashMap<IndexName, ViewFn>>,
    spatial: RwLock<HashMap<IndexName, SpatialFn>>,
    statements: RwLock<HashMap<String, Vec<Value>>>,
    latency: RwLock<HashMap<String, Duration>>,
    timeouts: RwLock<Timeouts>,
}

fn poisoned<T>(_: T) -> Error {
    Error::Internal("bucket lock poisoned".to_string())
}

impl MemStore {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            data: RwLock::new(BTreeMap::new()),
            cas: AtomicU64::new(0),
            views: RwLock::new(HashMap::new()),
            spatial: RwLock::new(HashMap::new()),
            statements: RwLock::new(HashMap::new()),
            latency: RwLock::new(HashMap::new()),
            timeouts: RwLock::new(Timeouts::default()),
        }
    }

    /// Creates a bucket pre-populated with documents.
    pub fn with_documents(name: &str, docs: BTreeMap<String, Value>) -> Self {
        let store = Self::new(name);
        if let Ok(mut data) = store.data.write() {
            for (key, value) in docs {
                let cas = store.next_cas();
                data.insert(key, Document { value, cas });
            }
        }
        store
    }

    fn next_cas(&self) -> u64 {
        self.cas.fetch_add(1, AtomicOrdering::SeqCst) + 1
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, BTreeMap<String, Document>>> {
        self.data.read().map_err(poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<String, Document>>> {
        self.data.write().map_err(poisoned)
    }

    pub fn define_view(&self, design_doc: &str, view: &str, map: ViewFn) -> Result<()> {
        self.views
            .write()
            .map_err(poisoned)?
            .insert((design_doc.to_string(), view.to_string()), map);
        Ok(())
    }

    /// Defines a view that emits `doc[field]` as the key and the whole document as value.
    pub fn define_field_view(&self, design_doc: &str, view: &str, field: &str) -> Result<()> {
        let field = field.to_string();
        self.define_view(
            design_doc,
            view,
            Arc::new(move |_: &str, doc: &Value| match doc.get(&field) {
                Some(key) if !key.is_null() => vec![(key.clone(), doc.clone())],
                _ => Vec::new(),
            }),
        )
    }

    pub fn define_spatial(&self, design_doc: &str, index: &str, map: SpatialFn) -> Result<()> {
        self.spatial
            .write()
            .map_err(poisoned)?
            .insert((design_doc.to_string(), index.to_string()), map);
        Ok(())
    }

    /// Answers `statement` with `rows` from now on.
    pub fn stub_statement(&self, statement: &str, rows: Vec<Value>) -> Result<()> {
        self.statements
            .write()
            .map_err(poisoned)?
            .insert(statement.to_string(), rows);
        Ok(())
    }

    /// Delays every operation on `key` by `delay`.
    pub fn set_latency(&self, key: &str, delay: Duration) -> Result<()> {
        self.latency
            .write()
            .map_err(poisoned)?
            .insert(key.to_string(), delay);
        Ok(())
    }

    pub fn timeouts(&self) -> Timeouts {
        self.timeouts.read().map(|t| *t).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.data.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A copy of every stored document value, in key order.
    pub fn snapshot(&self) -> Result<BTreeMap<String, Value>> {
        Ok(self
            .read()?
            .iter()
            .map(|(k, d)| (k.clone(), d.value.clone()))
            .collect())
    }

    async fn delay(&self, key: &str) {
        let delay = self.latency.read().ok().and_then(|l| l.get(key).copied());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn store(&self, key: &str, value: Value) -> Result<MutationResult> {
        let cas = self.next_cas();
        self.write()?.insert(key.to_string(), Document { value, cas });
        Ok(MutationResult { key: key.to_string(), cas })
    }

    fn run_view(&self, q: &ViewQuery) -> Result<Value> {
        let index = (q.design_doc.clone().unwrap_or_default(), q.view.clone());
        let map = self
            .views
            .read()
            .map_err(poisoned)?
            .get(&index)
            .cloned()
            .ok_or_else(|| Error::Query(format!("view `{}/{}` not found", index.0, index.1)))?;

        let mut emitted = Vec::new();
        for (id, doc) in self.read()?.iter() {
            for (key, value) in map(id.as_str(), &doc.value) {
                emitted.push((id.clone(), key, value));
            }
        }
        emitted.sort_by(|a, b| collate(&a.1, &b.1).then_with(|| a.0.cmp(&b.0)));
        let total = emitted.len();

        let rows: Vec<Value> = emitted
            .into_iter()
            .filter(|(_, key, _)| q.filter.matches(key))
            .skip(q.skip.unwrap_or(0))
            .take(q.limit.unwrap_or(usize::MAX))
            .map(|(id, key, value)| json!({ "id": id, "key": key, "value": value }))
            .collect();
        Ok(json!({ "total_rows": total, "rows": rows }))
    }

    fn run_spatial(&self, q: &SpatialQuery) -> Result<Value> {
        let index = (q.design_doc.clone(), q.index.clone());
        let map = self
            .spatial
            .read()
            .map_err(poisoned)?
            .get(&index)
            .cloned()
            .ok_or_else(|| Error::Query(format!("spatial index `{}/{}` not found", index.0, index.1)))?;

        let rows: Vec<Value> = self
            .read()?
            .iter()
            .filter_map(|(id, doc)| map(id.as_str(), &doc.value).map(|(point, value)| (id, point, value)))
            .filter(|(_, point, _)| q.contains(*point))
            .take(q.limit.unwrap_or(usize::MAX))
            .map(|(id, point, value)| {
                json!({
                    "id": id,
                    "geometry": { "type": "Point", "coordinates": point },
                    "value": value,
                })
            })
            .collect();
        Ok(json!({ "rows": rows }))
    }

    fn run_n1ql(&self, q: &N1qlQuery) -> Result<Value> {
        self.statements
            .read()
            .map_err(poisoned)?
            .get(&q.statement)
            .cloned()
            .map(Value::Array)
            .ok_or_else(|| Error::Unsupported(format!("no stub for statement `{}`", q.statement)))
    }
}

/// Reads an opaque view query: `{from: [ddoc, view], key, keys}` plus optional
/// `limit` and `skip`. Null `key`/`keys` mean no filter.
fn opaque_view(raw: &Value) -> Option<ViewQuery> {
    let (ddoc, view) = match raw.get("from")?.as_array()?.as_slice() {
        [ddoc, view] => (ddoc.as_str()?, view.as_str()?),
        _ => return None,
    };

    let mut q = ViewQuery::from(ddoc, view);
    if let Some(keys) = raw.get("keys").and_then(Value::as_array) {
        q = q.keys(keys.clone());
    } else if let Some(key) = raw.get("key").filter(|k| !k.is_null()) {
        q = q.key(key.clone());
    }
    q.limit = raw.get("limit").and_then(Value::as_u64).map(|n| n as usize);
    q.skip = raw.get("skip").and_then(Value::as_u64).map(|n| n as usize);
    Some(q)
}

/// Orders emitted view keys: null, booleans, numbers, strings, arrays, objects.
fn collate(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => x
            .iter()
            .zip(y)
            .map(|(l, r)| collate(l, r))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        _ => rank(a).cmp(&rank(b)).then_with(|| a.to_string().cmp(&b.to_string())),
    }
}

#[async_trait]
impl DocumentReader for MemStore {
    async fn get(&self, key: &str) -> Result<Document> {
        self.delay(key).await;
        self.read()?
            .get(key)
            .cloned()
            .ok_or_else(|| Error::KeyNotFound(key.to_string()))
    }

    async fn get_multi(&self, keys: &[String]) -> Result<HashMap<String, Document>> {
        let data = self.read()?;
        keys.iter()
            .map(|key| {
                data.get(key)
                    .cloned()
                    .map(|doc| (key.clone(), doc))
                    .ok_or_else(|| Error::KeyNotFound(key.clone()))
            })
            .collect()
    }
}

#[async_trait]
impl DocumentWriter for MemStore {
    async fn upsert(&self, key: &str, value: Value) -> Result<MutationResult> {
        self.delay(key).await;
        self.store(key, value)
    }

    async fn insert(&self, key: &str, value: Value) -> Result<MutationResult> {
        self.delay(key).await;
        let cas = self.next_cas();
        let mut data = self.write()?;
        if data.contains_key(key) {
            return Err(Error::KeyExists(key.to_string()));
        }
        data.insert(key.to_string(), Document { value, cas });
        Ok(MutationResult { key: key.to_string(), cas })
    }

    async fn replace(&self, key: &str, value: Value) -> Result<MutationResult> {
        self.delay(key).await;
        let cas = self.next_cas();
        let mut data = self.write()?;
        match data.get_mut(key) {
            Some(doc) => {
                *doc = Document { value, cas };
                Ok(MutationResult { key: key.to_string(), cas })
            }
            None => Err(Error::KeyDoesNotExist(key.to_string())),
        }
    }

    async fn remove(&self, key: &str) -> Result<MutationResult> {
        self.delay(key).await;
        let doc = self
            .write()?
            .remove(key)
            .ok_or_else(|| Error::KeyNotFound(key.to_string()))?;
        Ok(MutationResult { key: key.to_string(), cas: doc.cas })
    }
}

#[async_trait]
impl QueryExecutor for MemStore {
    async fn query(&self, query: &Query) -> Result<Option<Value>> {
        let res = match query {
            Query::View(q) => self.run_view(q)?,
            Query::Spatial(q) => self.run_spatial(q)?,
            Query::N1ql(q) => self.run_n1ql(q)?,
            Query::Raw(raw) => {
                let q = opaque_view(raw)
                    .or_else(|| serde_json::from_value::<ViewQuery>(raw.clone()).ok())
                    .ok_or_else(|| Error::Unsupported("raw queries other than views".to_string()))?;
                self.run_view(&q)?
            }
        };
        Ok(Some(res))
    }
}

impl Bucket for MemStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&self, timeouts: &Timeouts) {
        if let Ok(mut current) = self.timeouts.write() {
            *current = *timeouts;
        }
    }
}
