use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::debug;
use serde::Deserialize;
use serde_json::Value;

use crate::sdk::adapter::Adapter;
use crate::sdk::http::QueryService;
use crate::sdk::options::OptionSet;
use crate::sdk::query::{N1qlQuery, Query, QueryBuilders, SpatialQuery, Staleness, ViewKey, ViewQuery};
use crate::sdk::results::RowShape;
use crate::{Error, Result, SharedBucket};

/// A bounding-box search in its plain-object form.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct SpatialFilter {
    pub ddoc: String,
    pub name: String,
    pub bbox: [f64; 4],
}

impl From<SpatialFilter> for SpatialQuery {
    fn from(filter: SpatialFilter) -> Self {
        SpatialQuery::from(filter.ddoc, filter.name).bbox(filter.bbox)
    }
}

/// A view query in the plain-object shape produced by [`QueryBuilders::describe`].
#[derive(Deserialize)]
struct ViewDescriptor {
    ddoc: String,
    view: String,
    #[serde(default)]
    key: Option<Value>,
    #[serde(default)]
    keys: Option<Vec<Value>>,
    #[serde(default)]
    stale: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    skip: Option<usize>,
}

impl ViewDescriptor {
    fn into_query(self) -> Result<ViewQuery> {
        let mut query = ViewQuery::from(self.ddoc, self.view);
        if let Some(keys) = self.keys {
            query = query.keys(keys);
        } else if let Some(key) = self.key {
            query = query.key(key);
        }
        if let Some(stale) = self.stale {
            query = query.stale(stale.parse()?);
        }
        query.limit = self.limit;
        query.skip = self.skip;
        Ok(query)
    }
}

/// A view lookup by name, with the optional key, design document and staleness.
pub struct ViewSearch<'a> {
    pub view: String,
    pub key: Option<ViewKey<'a>>,
    pub design_doc: Option<String>,
    pub multi_key: bool,
    pub stale: Option<Staleness>,
}

impl<'a> ViewSearch<'a> {
    pub fn new(view: impl Into<String>) -> Self {
        Self {
            view: view.into(),
            key: None,
            design_doc: None,
            multi_key: false,
            stale: None,
        }
    }

    pub fn key(mut self, key: impl Into<ViewKey<'a>>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Matches any of `keys`.
    pub fn keys(mut self, keys: Vec<Value>) -> Self {
        self.key = Some(ViewKey::Value(Value::Array(keys)));
        self.multi_key = true;
        self
    }

    pub fn design_doc(mut self, design_doc: impl Into<String>) -> Self {
        self.design_doc = Some(design_doc.into());
        self
    }

    pub fn stale(mut self, stale: Staleness) -> Self {
        self.stale = Some(stale);
        self
    }

    fn build(self, default_stale: Option<Staleness>) -> ViewQuery {
        ViewQuery::build(
            self.view,
            self.key,
            self.design_doc,
            self.multi_key,
            self.stale.or(default_stale),
        )
    }
}

/// Everything a caller may search with, classified once at the API boundary.
pub enum Search<'a> {
    /// A query descriptor built by the caller.
    Query(Query),
    Spatial(SpatialFilter),
    Statement(N1qlQuery),
    View(ViewSearch<'a>),
}

impl Search<'_> {
    /// Classifies a loosely-shaped JSON search input.
    ///
    /// In priority order: a serialized query descriptor, or an object exposing
    /// `keys`, `key` and `from` (an opaque view query) is run as is, and an object
    /// with `ddoc` and `view` becomes a view query; an object with `bbox` is a
    /// spatial search; an object with `statement` is N1QL; a string is a view name.
    pub fn classify(input: Value) -> Result<Self> {
        let fields = match &input {
            Value::String(view) => return Ok(Search::View(ViewSearch::new(view.clone()))),
            Value::Object(fields) => fields,
            other => return Err(Error::Config(format!("cannot search with `{}`", other))),
        };

        if let Ok(query) = serde_json::from_value::<Query>(input.clone()) {
            return Ok(Search::Query(query));
        }
        if ["keys", "key", "from"].iter().all(|f| fields.contains_key(*f)) {
            return Ok(Search::Query(Query::Raw(input)));
        }
        if fields.contains_key("ddoc") && fields.contains_key("view") {
            let descriptor: ViewDescriptor = serde_json::from_value(input)
                .map_err(|e| Error::Config(format!("invalid view query: {}", e)))?;
            return Ok(Search::Query(Query::View(descriptor.into_query()?)));
        }
        if fields.contains_key("bbox") {
            let filter = serde_json::from_value(input)
                .map_err(|e| Error::Config(format!("invalid spatial search: {}", e)))?;
            return Ok(Search::Spatial(filter));
        }
        if fields.contains_key("statement") {
            let statement = serde_json::from_value(input)
                .map_err(|e| Error::Config(format!("invalid N1QL statement: {}", e)))?;
            return Ok(Search::Statement(statement));
        }
        Err(Error::Config("search input matches no query type".to_string()))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Search::Query(_) => "query",
            Search::Spatial(_) => "spatial",
            Search::Statement(_) => "n1ql",
            Search::View(_) => "view",
        }
    }

    /// How the response rows of this search carry their documents.
    pub fn row_shape(&self) -> RowShape {
        match self {
            Search::Statement(_) | Search::Query(Query::N1ql(_)) => RowShape::Bare,
            _ => RowShape::Enveloped,
        }
    }
}

impl From<Query> for Search<'_> {
    fn from(query: Query) -> Self {
        Search::Query(query)
    }
}

impl From<ViewQuery> for Search<'_> {
    fn from(query: ViewQuery) -> Self {
        Search::Query(Query::View(query))
    }
}

impl From<SpatialQuery> for Search<'_> {
    fn from(query: SpatialQuery) -> Self {
        Search::Query(Query::Spatial(query))
    }
}

impl From<SpatialFilter> for Search<'_> {
    fn from(filter: SpatialFilter) -> Self {
        Search::Spatial(filter)
    }
}

impl From<N1qlQuery> for Search<'_> {
    fn from(query: N1qlQuery) -> Self {
        Search::Statement(query)
    }
}

impl<'a> From<ViewSearch<'a>> for Search<'a> {
    fn from(search: ViewSearch<'a>) -> Self {
        Search::View(search)
    }
}

/// A bare string is a view name. N1QL text goes through [`N1qlQuery`].
impl From<&str> for Search<'_> {
    fn from(view: &str) -> Self {
        Search::View(ViewSearch::new(view))
    }
}

struct CachedService {
    endpoints: Vec<String>,
    timeout: Option<Duration>,
    service: Arc<QueryService>,
}

/// Turns searches into query descriptors and runs them.
///
/// The HTTP query service is resolved from the adapter's options on every
/// dispatch, so `query_endpoints` and `operation_timeout` changes made through
/// `set_option` apply to the next search.
#[derive(Default)]
pub struct Dispatcher {
    cached: Mutex<Option<CachedService>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// The query service for `options`, or `None` when no endpoint is configured.
    ///
    /// The service is reused until the endpoints or the operation timeout change.
    pub fn service_for(&self, options: &OptionSet) -> Result<Option<Arc<QueryService>>> {
        if options.query_endpoints.is_empty() {
            return Ok(None);
        }
        let timeout = options.timeouts().operation;
        let mut cached = self
            .cached
            .lock()
            .map_err(|_| Error::Internal("query service lock poisoned".to_string()))?;

        if let Some(current) = cached.as_ref() {
            if current.endpoints == options.query_endpoints && current.timeout == timeout {
                return Ok(Some(current.service.clone()));
            }
        }

        debug!("setting up query service for {} endpoint(s)", options.query_endpoints.len());
        let service = Arc::new(QueryService::new(options.query_endpoints.clone(), timeout)?);
        *cached = Some(CachedService {
            endpoints: options.query_endpoints.clone(),
            timeout,
            service: service.clone(),
        });
        Ok(Some(service))
    }

    /// The concrete descriptor for a search.
    pub fn prepare(search: Search<'_>, default_stale: Option<Staleness>) -> Query {
        match search {
            Search::Query(query) => query,
            Search::Spatial(filter) => Query::Spatial(filter.into()),
            Search::Statement(statement) => Query::N1ql(statement),
            Search::View(view) => Query::View(view.build(default_stale)),
        }
    }

    /// Runs a search on `bucket` and returns the raw response envelope.
    pub async fn dispatch(&self, adapter: &Adapter, bucket: &SharedBucket, search: Search<'_>) -> Result<Option<Value>> {
        let options = adapter.options()?;
        let kind = search.kind();
        let query = Self::prepare(search, options.stale);

        if let Query::N1ql(statement) = &query {
            if let Some(service) = self.service_for(&options)? {
                debug!("dispatching {} search to the query service", kind);
                return service.execute(statement).await;
            }
        }
        debug!("dispatching {} search as {}", kind, QueryBuilders.describe(&query));
        adapter.query_on(bucket, &query).await
    }
}
