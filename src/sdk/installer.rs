use std::sync::Arc;

use log::debug;
use serde_json::Value;

use crate::sdk::adapter::Adapter;
use crate::sdk::cushion::{Cushion, QueryMethods};
use crate::sdk::model::ModelRegistry;
use crate::sdk::options::OptionSet;
use crate::sdk::query::QueryBuilders;
use crate::{Bucket, Connector, Result};

/// Binds an adapter onto a [`Cushion`] host.
///
/// `skip_methods` leaves the query surface off the host; `skip_properties`
/// leaves the query builders off. The adapter itself is always installed.
pub struct Installer {
    options: OptionSet,
}

impl Installer {
    pub fn new(options: OptionSet) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &OptionSet {
        &self.options
    }

    pub fn get_option(&self, name: &str) -> Option<Value> {
        self.options.get_option(name)
    }

    pub fn set_option(&mut self, name: &str, value: Value) -> Result<&mut Self> {
        self.options.set_option(name, value)?;
        Ok(self)
    }

    /// Connects with this installer's options, then installs.
    pub fn connect(&self, connector: &dyn Connector, registry: ModelRegistry) -> Result<Cushion> {
        let adapter = Adapter::connect(connector, self.options.clone())?;
        self.install(adapter, registry)
    }

    pub fn install(&self, adapter: Adapter, registry: ModelRegistry) -> Result<Cushion> {
        let adapter = Arc::new(adapter);
        debug!(
            "set cushion adapter to bucket `{}` with model kinds {:?}",
            adapter.bucket().name(),
            registry.names()
        );
        let registry = Arc::new(registry);

        let methods = if self.options.skip_methods {
            None
        } else {
            debug!("bound query methods to cushion");
            Some(QueryMethods::new(adapter.clone(), registry.clone())?)
        };
        let builders = if self.options.skip_properties {
            None
        } else {
            Some(QueryBuilders)
        };

        Ok(Cushion::new(adapter, registry, methods, builders))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemCluster;
    use serde_json::json;

    fn install_with(skip_methods: bool, skip_properties: bool) -> Cushion {
        let mut installer = Installer::new(OptionSet::new());
        installer.set_option("skip_methods", json!(skip_methods)).unwrap();
        installer.set_option("skip_properties", json!(skip_properties)).unwrap();
        let bucket = MemCluster::new().open_bucket(installer.options()).unwrap();
        let adapter = Adapter::with_bucket(bucket, installer.options().clone());
        installer.install(adapter, ModelRegistry::new()).unwrap()
    }

    #[test]
    fn test_install() {
        let cushion = install_with(false, false);
        assert_eq!(cushion.adapter().bucket().name(), "default");
        assert!(cushion.methods().is_some());
        assert!(cushion.builders().is_some());
    }

    #[test]
    fn test_skip_properties() {
        let cushion = install_with(false, true);
        assert!(cushion.methods().is_some());
        assert!(cushion.builders().is_none());
    }

    #[test]
    fn test_skip_methods() {
        let cushion = install_with(true, false);
        assert!(cushion.methods().is_none());
        assert!(cushion.builders().is_some());
    }

    #[test]
    fn test_skip_methods_and_properties() {
        let cushion = install_with(true, true);
        assert!(cushion.methods().is_none());
        assert!(cushion.builders().is_none());
    }

    #[test]
    fn test_connect_validates_before_opening() {
        let installer = Installer::new(OptionSet::new());
        let res = installer.connect(&MemCluster::new(), ModelRegistry::new());
        assert!(res.is_err());
    }

    #[test]
    fn test_get_option() {
        let mut installer = Installer::new(OptionSet::new());
        installer.set_option("host", json!("couchbase://db")).unwrap();
        assert_eq!(installer.get_option("host"), Some(json!("couchbase://db")));
    }
}
