/// Fan-out CRUD over a bucket.
pub mod adapter;
/// The host surface: search-and-hydrate methods bound onto a [`Cushion`].
pub mod cushion;
/// Classification of search inputs and query execution.
pub mod dispatch;
/// N1QL over HTTP, for deployments that expose a query-service endpoint.
pub mod http;
/// Installation of an adapter onto a host.
pub mod installer;
pub mod model;
pub mod options;
pub mod query;
pub mod results;

pub use adapter::{Adapter, Fetched, Keys, Mutation, Outcome, Verb};
pub use cushion::{Cushion, QueryMethods};
pub use dispatch::{Search, SpatialFilter, ViewSearch};
pub use installer::Installer;
pub use model::{Model, ModelKind, ModelRegistry, Record};
pub use options::OptionSet;
pub use query::{N1qlQuery, Query, SpatialQuery, Staleness, ViewQuery};
