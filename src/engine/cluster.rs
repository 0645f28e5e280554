use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::debug;

use crate::engine::fixtures::Fixtures;
use crate::engine::MemStore;
use crate::sdk::options::OptionSet;
use crate::{Bucket, Connector, Error, Result, SharedBucket};

const DEFAULT_BUCKET: &str = "default";

/// A connector for in-memory buckets.
///
/// Unlike a real cluster it needs no host; opening the same bucket name twice
/// returns the same bucket.
#[derive(Default)]
pub struct MemCluster {
    buckets: Mutex<HashMap<String, Arc<MemStore>>>,
    fixtures: Option<Arc<Fixtures>>,
}

impl MemCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens every bucket found in a fixture directory. Buckets opened later are
    /// seeded from the same directory.
    pub fn with_fixtures(fixtures: Arc<Fixtures>) -> Result<Self> {
        let buckets: HashMap<String, Arc<MemStore>> = fixtures
            .load_all()?
            .into_iter()
            .map(|(name, docs)| {
                debug!("opening mock bucket `{}` with {} documents", name, docs.len());
                let bucket = Arc::new(MemStore::with_documents(&name, docs));
                (name, bucket)
            })
            .collect();

        Ok(Self {
            buckets: Mutex::new(buckets),
            fixtures: Some(fixtures),
        })
    }

    /// The concrete bucket behind a name, opening it if needed.
    pub fn bucket(&self, name: &str) -> Result<Arc<MemStore>> {
        let mut buckets = self
            .buckets
            .lock()
            .map_err(|_| Error::Internal("cluster lock poisoned".to_string()))?;
        if let Some(bucket) = buckets.get(name) {
            return Ok(bucket.clone());
        }

        let docs = match &self.fixtures {
            Some(fixtures) => fixtures.load_bucket(name)?,
            None => Default::default(),
        };
        debug!("opening mock bucket `{}` with {} documents", name, docs.len());
        let bucket = Arc::new(MemStore::with_documents(name, docs));
        buckets.insert(name.to_string(), bucket.clone());
        Ok(bucket)
    }

    /// Writes a bucket's current documents back to the fixture directory.
    pub fn flush(&self, name: &str) -> Result<()> {
        match &self.fixtures {
            Some(fixtures) => fixtures.save_bucket(name, &self.bucket(name)?.snapshot()?),
            None => Ok(()),
        }
    }
}

impl Connector for MemCluster {
    fn open_bucket(&self, options: &OptionSet) -> Result<SharedBucket> {
        let name = options.bucket.as_deref().unwrap_or(DEFAULT_BUCKET);
        let bucket = self.bucket(name)?;
        bucket.configure(&options.timeouts());
        Ok(bucket)
    }
}
