use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use log::debug;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::sdk::results::{self, RowShape};
use crate::{Bucket, DocumentWriter, Error, MutationResult, Result, SharedBucket};

/// The capability the adapter needs from a host model.
///
/// A model is created empty by its factory, bound to the bucket that produced its
/// data, and filled through [`Model::set`].
pub trait Model: Any + Send + Sync + fmt::Debug {
    /// The registered kind name.
    fn kind(&self) -> &str;
    /// Assigns decoded document data.
    fn set(&mut self, data: Value) -> Result<()>;
    fn to_value(&self) -> Result<Value>;
    /// The bucket this instance reads from and writes to.
    fn bucket(&self) -> &SharedBucket;
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync>;

    /// The document's `id` field, if it has a non-null one.
    fn id(&self) -> Option<Value> {
        self.to_value()
            .ok()?
            .get("id")
            .filter(|id| !id.is_null())
            .cloned()
    }
}

/// A model whose data is any serde type.
pub struct Record<T> {
    kind: String,
    data: T,
    bucket: SharedBucket,
}

impl<T> Record<T>
where
    T: Serialize + DeserializeOwned + Default + fmt::Debug + Send + Sync + 'static,
{
    pub fn new(kind: impl Into<String>, bucket: SharedBucket) -> Self {
        Self {
            kind: kind.into(),
            data: T::default(),
            bucket,
        }
    }

    pub fn data(&self) -> &T {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut T {
        &mut self.data
    }

    pub fn into_inner(self) -> T {
        self.data
    }

    /// Upserts this record under `key` in its own bucket.
    pub async fn save(&self, key: &str) -> Result<MutationResult> {
        let value = serde_json::to_value(&self.data)?;
        self.bucket.upsert(key, value).await
    }

    /// Removes `key` from this record's bucket.
    pub async fn delete(&self, key: &str) -> Result<MutationResult> {
        self.bucket.remove(key).await
    }
}

impl<T: fmt::Debug> fmt::Debug for Record<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("kind", &self.kind)
            .field("data", &self.data)
            .field("bucket", &self.bucket.name())
            .finish()
    }
}

impl<T> Model for Record<T>
where
    T: Serialize + DeserializeOwned + Default + fmt::Debug + Send + Sync + 'static,
{
    fn kind(&self) -> &str {
        &self.kind
    }

    fn set(&mut self, data: Value) -> Result<()> {
        self.data = serde_json::from_value(data)?;
        Ok(())
    }

    fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(&self.data)?)
    }

    fn bucket(&self) -> &SharedBucket {
        &self.bucket
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync> {
        self
    }
}

/// Recovers the concrete record type behind a hydrated model.
pub fn downcast<T>(model: Box<dyn Model>) -> Option<Record<T>>
where
    T: Serialize + DeserializeOwned + Default + fmt::Debug + Send + Sync + 'static,
{
    model.into_any().downcast::<Record<T>>().ok().map(|r| *r)
}

/// Builds an empty model bound to a bucket.
pub type ModelFactory = Arc<dyn Fn(SharedBucket) -> Box<dyn Model> + Send + Sync>;

/// Names the model kind a search should produce.
#[derive(Clone)]
pub enum ModelKind {
    /// Looked up in the registry.
    Name(String),
    /// Already resolved; no lookup needed.
    Resolved { name: String, factory: ModelFactory },
}

impl ModelKind {
    pub fn name(&self) -> &str {
        match self {
            ModelKind::Name(name) | ModelKind::Resolved { name, .. } => name,
        }
    }
}

impl fmt::Debug for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelKind::Name(name) => f.debug_tuple("Name").field(name).finish(),
            ModelKind::Resolved { name, .. } => f.debug_struct("Resolved").field("name", name).finish(),
        }
    }
}

impl From<&str> for ModelKind {
    fn from(name: &str) -> Self {
        ModelKind::Name(name.to_string())
    }
}

impl From<String> for ModelKind {
    fn from(name: String) -> Self {
        ModelKind::Name(name)
    }
}

/// A row value as it comes off the wire.
///
/// Some storage paths return document bodies still serialized as JSON text.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Decoded(Value),
    Encoded(String),
}

impl From<Value> for RawValue {
    fn from(value: Value) -> Self {
        match value {
            Value::String(text) => RawValue::Encoded(text),
            other => RawValue::Decoded(other),
        }
    }
}

impl RawValue {
    pub fn decode(self) -> Result<Value> {
        match self {
            RawValue::Decoded(value) => Ok(value),
            RawValue::Encoded(text) => Ok(serde_json::from_str(&text)?),
        }
    }
}

/// Hydrated models together with the raw response they came from.
#[derive(Debug)]
pub struct Hydrated<T> {
    pub models: T,
    pub response: Value,
}

/// Maps model kind names to factories. Populated once at setup.
#[derive(Clone, Default)]
pub struct ModelRegistry {
    factories: HashMap<String, ModelFactory>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, factory: ModelFactory) -> &mut Self {
        let name = name.into();
        debug!("registered model kind `{}`", name);
        self.factories.insert(name, factory);
        self
    }

    /// Registers a [`Record`] kind backed by the serde type `T`.
    pub fn register_record<T>(&mut self, name: &str) -> &mut Self
    where
        T: Serialize + DeserializeOwned + Default + fmt::Debug + Send + Sync + 'static,
    {
        let kind = name.to_string();
        let factory: ModelFactory =
            Arc::new(move |bucket| Box::new(Record::<T>::new(kind.clone(), bucket)) as Box<dyn Model>);
        self.register(name, factory)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Turns a kind into a resolved one, or fails with [`Error::ModelNotFound`].
    pub fn resolve(&self, kind: &ModelKind) -> Result<ModelKind> {
        match kind {
            ModelKind::Resolved { .. } => Ok(kind.clone()),
            ModelKind::Name(name) => self
                .factories
                .get(name)
                .map(|factory| ModelKind::Resolved {
                    name: name.clone(),
                    factory: factory.clone(),
                })
                .ok_or_else(|| Error::ModelNotFound(name.clone())),
        }
    }

    fn factory(&self, kind: &ModelKind) -> Result<ModelFactory> {
        match self.resolve(kind)? {
            ModelKind::Resolved { factory, .. } => Ok(factory),
            ModelKind::Name(name) => Err(Error::ModelNotFound(name)),
        }
    }

    /// Builds one model per row of `response`.
    ///
    /// A missing envelope is an error; an envelope with no rows is an empty result.
    /// A row that fails to decode fails the whole call, and the error carries the
    /// raw response.
    pub fn hydrate_many(
        &self,
        kind: &ModelKind,
        response: Option<Value>,
        shape: RowShape,
        bucket: &SharedBucket,
    ) -> Result<Hydrated<Vec<Box<dyn Model>>>> {
        let factory = self.factory(kind)?;
        let response = envelope(response)?;

        let models = results::rows(&response, shape)
            .into_iter()
            .map(|row| build(&factory, row, bucket))
            .collect::<Result<Vec<_>>>();
        let models = match models {
            Ok(models) => models,
            Err(e) => return Err(hydration_error(kind, e, response)),
        };

        debug!("hydrated {} `{}` models", models.len(), kind.name());
        Ok(Hydrated { models, response })
    }

    /// Builds a model from the first row of `response`, if there is one.
    pub fn hydrate_one(
        &self,
        kind: &ModelKind,
        response: Option<Value>,
        shape: RowShape,
        bucket: &SharedBucket,
    ) -> Result<Hydrated<Option<Box<dyn Model>>>> {
        let factory = self.factory(kind)?;
        let response = envelope(response)?;

        let model = match results::first_row(&response, shape) {
            None | Some(Value::Null) => None,
            Some(row) => match build(&factory, row, bucket) {
                Ok(model) => Some(model),
                Err(e) => return Err(hydration_error(kind, e, response)),
            },
        };
        Ok(Hydrated { models: model, response })
    }
}

fn hydration_error(kind: &ModelKind, source: Error, response: Value) -> Error {
    Error::Hydration {
        kind: kind.name().to_string(),
        source: Box::new(source),
        response,
    }
}

fn envelope(response: Option<Value>) -> Result<Value> {
    match response {
        None | Some(Value::Null) => Err(Error::NoDocuments),
        Some(value) => Ok(value),
    }
}

fn build(factory: &ModelFactory, row: Value, bucket: &SharedBucket) -> Result<Box<dyn Model>> {
    let data = RawValue::from(row).decode()?;
    let mut model = factory(bucket.clone());
    model.set(data)?;
    Ok(model)
}
