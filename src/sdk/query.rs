use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::sdk::model::Model;
use crate::{Error, Result};

/// How a view query treats an index that has not caught up with recent writes.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Staleness {
    /// Read the index as it is. The default: read latency wins over freshness.
    #[default]
    Ok,
    /// Update the index before reading.
    Before,
    /// Read the index as it is, then trigger an update.
    After,
}

impl FromStr for Staleness {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ok" | "none" => Ok(Staleness::Ok),
            "before" | "false" => Ok(Staleness::Before),
            "after" | "update_after" => Ok(Staleness::After),
            other => Err(Error::Config(format!("unknown staleness `{}`", other))),
        }
    }
}

impl fmt::Display for Staleness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Staleness::Ok => write!(f, "ok"),
            Staleness::Before => write!(f, "false"),
            Staleness::After => write!(f, "update_after"),
        }
    }
}

/// Which emitted keys a view query matches.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub enum KeyFilter {
    /// No filter: a full view scan.
    #[default]
    All,
    /// Exact match on one key.
    Key(Value),
    /// Exact match on any of the given keys.
    Keys(Vec<Value>),
}

impl KeyFilter {
    pub fn matches(&self, key: &Value) -> bool {
        match self {
            KeyFilter::All => true,
            KeyFilter::Key(k) => k == key,
            KeyFilter::Keys(ks) => ks.contains(key),
        }
    }
}

/// A caller-supplied view key.
pub enum ViewKey<'a> {
    Value(Value),
    /// A model instance; its `id` is read when the query is built.
    Model(&'a dyn Model),
}

impl From<Value> for ViewKey<'_> {
    fn from(value: Value) -> Self {
        ViewKey::Value(value)
    }
}

impl From<&str> for ViewKey<'_> {
    fn from(value: &str) -> Self {
        ViewKey::Value(Value::String(value.to_string()))
    }
}

impl<'a> From<&'a dyn Model> for ViewKey<'a> {
    fn from(model: &'a dyn Model) -> Self {
        ViewKey::Model(model)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ViewQuery {
    pub design_doc: Option<String>,
    pub view: String,
    pub filter: KeyFilter,
    pub stale: Staleness,
    pub limit: Option<usize>,
    pub skip: Option<usize>,
}

impl ViewQuery {
    pub fn from(design_doc: impl Into<String>, view: impl Into<String>) -> Self {
        Self {
            design_doc: Some(design_doc.into()),
            view: view.into(),
            filter: KeyFilter::All,
            stale: Staleness::default(),
            limit: None,
            skip: None,
        }
    }

    /// Builds a view query from loosely-shaped caller input.
    ///
    /// A key with an `id` field (or a model instance) is narrowed to that id, so a
    /// partially-hydrated model and a bare scalar can be passed interchangeably.
    /// Without an explicit `stale`, stale index reads are allowed.
    pub fn build(
        view: impl Into<String>,
        key: Option<ViewKey<'_>>,
        design_doc: Option<String>,
        multi_key: bool,
        stale: Option<Staleness>,
    ) -> Self {
        let filter = match key {
            None => KeyFilter::All,
            Some(ViewKey::Value(Value::Array(keys))) if multi_key => KeyFilter::Keys(keys),
            Some(ViewKey::Value(value)) => match value.get("id") {
                Some(id) if !id.is_null() => KeyFilter::Key(id.clone()),
                _ => KeyFilter::Key(value),
            },
            Some(ViewKey::Model(model)) => match model.id() {
                Some(id) => KeyFilter::Key(id),
                None => KeyFilter::Key(model.to_value().unwrap_or(Value::Null)),
            },
        };

        Self {
            design_doc,
            view: view.into(),
            filter,
            stale: stale.unwrap_or_default(),
            limit: None,
            skip: None,
        }
    }

    pub fn key(mut self, key: impl Into<Value>) -> Self {
        self.filter = KeyFilter::Key(key.into());
        self
    }

    pub fn keys(mut self, keys: Vec<Value>) -> Self {
        self.filter = KeyFilter::Keys(keys);
        self
    }

    pub fn stale(mut self, stale: Staleness) -> Self {
        self.stale = stale;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScanConsistency {
    NotBounded,
    RequestPlus,
    StatementPlus,
}

impl ScanConsistency {
    fn as_param(&self) -> &'static str {
        match self {
            ScanConsistency::NotBounded => "not_bounded",
            ScanConsistency::RequestPlus => "request_plus",
            ScanConsistency::StatementPlus => "statement_plus",
        }
    }
}

/// A N1QL statement with its positional arguments.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct N1qlQuery {
    pub statement: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub consistency: Option<ScanConsistency>,
    #[serde(default = "default_adhoc")]
    pub adhoc: bool,
}

fn default_adhoc() -> bool {
    true
}

impl N1qlQuery {
    pub fn from_string(statement: impl Into<String>) -> Self {
        Self {
            statement: statement.into(),
            args: Vec::new(),
            consistency: None,
            adhoc: true,
        }
    }

    pub fn args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn consistency(mut self, consistency: ScanConsistency) -> Self {
        self.consistency = Some(consistency);
        self
    }

    pub fn adhoc(mut self, adhoc: bool) -> Self {
        self.adhoc = adhoc;
        self
    }

    /// The query-service request parameters for this statement.
    pub fn to_params(&self) -> Result<Vec<(String, String)>> {
        let mut params = vec![("statement".to_string(), self.statement.clone())];
        if !self.args.is_empty() {
            params.push(("args".to_string(), serde_json::to_string(&self.args)?));
        }
        if let Some(consistency) = &self.consistency {
            params.push(("scan_consistency".to_string(), consistency.as_param().to_string()));
        }
        if !self.adhoc {
            params.push(("prepared".to_string(), "true".to_string()));
        }
        Ok(params)
    }
}

impl From<&str> for N1qlQuery {
    fn from(statement: &str) -> Self {
        N1qlQuery::from_string(statement)
    }
}

impl From<String> for N1qlQuery {
    fn from(statement: String) -> Self {
        N1qlQuery::from_string(statement)
    }
}

/// A bounding-box query against a spatial index.
///
/// `bbox` is `[min_lon, min_lat, max_lon, max_lat]`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SpatialQuery {
    pub design_doc: String,
    pub index: String,
    pub bbox: Option<[f64; 4]>,
    pub limit: Option<usize>,
}

impl SpatialQuery {
    pub fn from(design_doc: impl Into<String>, index: impl Into<String>) -> Self {
        Self {
            design_doc: design_doc.into(),
            index: index.into(),
            bbox: None,
            limit: None,
        }
    }

    pub fn bbox(mut self, bbox: [f64; 4]) -> Self {
        self.bbox = Some(bbox);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether a point `[lon, lat]` lies inside the bounding box.
    pub fn contains(&self, point: [f64; 2]) -> bool {
        match self.bbox {
            None => true,
            Some([min_x, min_y, max_x, max_y]) => {
                point[0] >= min_x && point[0] <= max_x && point[1] >= min_y && point[1] <= max_y
            }
        }
    }
}

/// A concrete query descriptor, ready for a bucket's query primitive.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Query {
    View(ViewQuery),
    N1ql(N1qlQuery),
    Spatial(SpatialQuery),
    /// Already constructed by the caller and passed through untouched.
    Raw(Value),
}

impl Query {
    pub fn kind(&self) -> &'static str {
        match self {
            Query::View(_) => "view",
            Query::N1ql(_) => "n1ql",
            Query::Spatial(_) => "spatial",
            Query::Raw(_) => "raw",
        }
    }
}

impl From<ViewQuery> for Query {
    fn from(q: ViewQuery) -> Self {
        Query::View(q)
    }
}

impl From<N1qlQuery> for Query {
    fn from(q: N1qlQuery) -> Self {
        Query::N1ql(q)
    }
}

impl From<SpatialQuery> for Query {
    fn from(q: SpatialQuery) -> Self {
        Query::Spatial(q)
    }
}

/// Constructors for the query descriptors, exposed on an installed host.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryBuilders;

impl QueryBuilders {
    pub fn view(&self, design_doc: &str, view: &str) -> ViewQuery {
        ViewQuery::from(design_doc, view)
    }

    pub fn spatial(&self, design_doc: &str, index: &str) -> SpatialQuery {
        SpatialQuery::from(design_doc, index)
    }

    pub fn n1ql(&self, statement: &str) -> N1qlQuery {
        N1qlQuery::from_string(statement)
    }

    /// Describes a query in the shape the HTTP view/spatial endpoints accept.
    pub fn describe(&self, query: &Query) -> Value {
        match query {
            Query::View(q) => json!({
                "ddoc": q.design_doc,
                "view": q.view,
                "stale": q.stale.to_string(),
                "limit": q.limit,
                "skip": q.skip,
            }),
            Query::Spatial(q) => json!({ "ddoc": q.design_doc, "name": q.index, "bbox": q.bbox }),
            Query::N1ql(q) => json!({ "statement": q.statement, "args": q.args }),
            Query::Raw(v) => v.clone(),
        }
    }
}
