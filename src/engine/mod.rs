pub mod cluster;
pub mod fixtures;
pub mod memstore;

pub use cluster::MemCluster;
pub use fixtures::Fixtures;
pub use memstore::MemStore;
