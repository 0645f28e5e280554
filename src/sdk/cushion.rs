use std::sync::Arc;

use serde_json::Value;

use crate::sdk::adapter::Adapter;
use crate::sdk::dispatch::{Dispatcher, Search, ViewSearch};
use crate::sdk::model::{Hydrated, Model, ModelKind, ModelRegistry};
use crate::sdk::query::{N1qlQuery, Query, QueryBuilders};
use crate::{Result, SharedBucket};

/// Many hydrated models.
pub type Models = Hydrated<Vec<Box<dyn Model>>>;
/// At most one hydrated model.
pub type OneModel = Hydrated<Option<Box<dyn Model>>>;

/// The search-and-hydrate surface installed on a [`Cushion`].
///
/// Every method takes an optional bucket; without one, the adapter's bucket is
/// used. Hydrated models are bound to whichever bucket answered the query. The
/// model kind is resolved before anything is sent to the bucket.
pub struct QueryMethods {
    adapter: Arc<Adapter>,
    registry: Arc<ModelRegistry>,
    dispatcher: Dispatcher,
}

impl QueryMethods {
    /// Fails when the configured query endpoints cannot back an HTTP client.
    pub fn new(adapter: Arc<Adapter>, registry: Arc<ModelRegistry>) -> Result<Self> {
        let dispatcher = Dispatcher::new();
        dispatcher.service_for(&adapter.options()?)?;
        Ok(Self {
            adapter,
            registry,
            dispatcher,
        })
    }

    fn target<'b>(&'b self, bucket: Option<&'b SharedBucket>) -> &'b SharedBucket {
        bucket.unwrap_or_else(|| self.adapter.bucket())
    }

    /// Finds the first model matching a search.
    pub async fn get_one<'a>(
        &self,
        kind: impl Into<ModelKind>,
        search: impl Into<Search<'a>>,
        bucket: Option<&SharedBucket>,
    ) -> Result<OneModel> {
        let kind = self.registry.resolve(&kind.into())?;
        let bucket = self.target(bucket);
        let search: Search<'a> = search.into();
        let shape = search.row_shape();
        let response = self.dispatcher.dispatch(&self.adapter, bucket, search).await?;
        self.registry.hydrate_one(&kind, response, shape, bucket)
    }

    /// Finds every model matching a search.
    pub async fn get_many<'a>(
        &self,
        kind: impl Into<ModelKind>,
        search: impl Into<Search<'a>>,
        bucket: Option<&SharedBucket>,
    ) -> Result<Models> {
        let kind = self.registry.resolve(&kind.into())?;
        let bucket = self.target(bucket);
        let search: Search<'a> = search.into();
        let shape = search.row_shape();
        let response = self.dispatcher.dispatch(&self.adapter, bucket, search).await?;
        self.registry.hydrate_many(&kind, response, shape, bucket)
    }

    pub async fn from_query(&self, kind: impl Into<ModelKind>, query: Query, bucket: Option<&SharedBucket>) -> Result<Models> {
        self.get_many(kind, Search::Query(query), bucket).await
    }

    pub async fn one_from_query(
        &self,
        kind: impl Into<ModelKind>,
        query: Query,
        bucket: Option<&SharedBucket>,
    ) -> Result<OneModel> {
        self.get_one(kind, Search::Query(query), bucket).await
    }

    pub async fn from_view<'a>(
        &self,
        kind: impl Into<ModelKind>,
        view: ViewSearch<'a>,
        bucket: Option<&SharedBucket>,
    ) -> Result<Models> {
        self.get_many(kind, Search::View(view), bucket).await
    }

    pub async fn one_from_view<'a>(
        &self,
        kind: impl Into<ModelKind>,
        view: ViewSearch<'a>,
        bucket: Option<&SharedBucket>,
    ) -> Result<OneModel> {
        self.get_one(kind, Search::View(view), bucket).await
    }

    /// Runs a N1QL statement and hydrates every result row.
    pub async fn n1ql(
        &self,
        kind: impl Into<ModelKind>,
        statement: impl Into<N1qlQuery>,
        bucket: Option<&SharedBucket>,
    ) -> Result<Models> {
        self.get_many(kind, Search::Statement(statement.into()), bucket).await
    }

    /// Runs a N1QL statement and returns the raw response, unhydrated.
    pub async fn raw_query(&self, statement: impl Into<N1qlQuery>, bucket: Option<&SharedBucket>) -> Result<Option<Value>> {
        let bucket = self.target(bucket);
        self.dispatcher
            .dispatch(&self.adapter, bucket, Search::Statement(statement.into()))
            .await
    }
}

/// The host an adapter is installed on.
///
/// The adapter and the model registry are always present. The query surface and
/// the query builders are present unless installation skipped them.
pub struct Cushion {
    adapter: Arc<Adapter>,
    registry: Arc<ModelRegistry>,
    methods: Option<QueryMethods>,
    builders: Option<QueryBuilders>,
}

impl Cushion {
    pub(crate) fn new(
        adapter: Arc<Adapter>,
        registry: Arc<ModelRegistry>,
        methods: Option<QueryMethods>,
        builders: Option<QueryBuilders>,
    ) -> Self {
        Self {
            adapter,
            registry,
            methods,
            builders,
        }
    }

    pub fn adapter(&self) -> &Arc<Adapter> {
        &self.adapter
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn methods(&self) -> Option<&QueryMethods> {
        self.methods.as_ref()
    }

    pub fn builders(&self) -> Option<QueryBuilders> {
        self.builders
    }
}
