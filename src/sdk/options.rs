use std::env;
use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::sdk::query::Staleness;
use crate::{Error, Result};

/// Adapter-wide configuration.
///
/// Populated once before connecting and read-only afterwards, except through
/// [`OptionSet::set_option`]. Timeouts are in milliseconds.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct OptionSet {
    pub host: Option<String>,
    pub bucket: Option<String>,
    pub bucket_password: Option<String>,
    pub connection_timeout: Option<u64>,
    pub operation_timeout: Option<u64>,
    pub view_timeout: Option<u64>,
    pub management_timeout: Option<u64>,
    /// Query-service endpoints for N1QL over HTTP. Empty means the bucket's own
    /// query primitive is used.
    pub query_endpoints: Vec<String>,
    pub stale: Option<Staleness>,
    pub skip_methods: bool,
    pub skip_properties: bool,
}

/// Per-operation timeouts applied to an opened bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timeouts {
    pub connection: Option<Duration>,
    pub operation: Option<Duration>,
    pub view: Option<Duration>,
    pub management: Option<Duration>,
}

impl OptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds an option set from `CUSHION_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut options = Self::default();
        options.host = non_empty_var("CUSHION_HOST");
        options.bucket = non_empty_var("CUSHION_BUCKET");
        options.bucket_password = non_empty_var("CUSHION_BUCKET_PASSWORD");
        options.connection_timeout = millis_var("CUSHION_CONNECTION_TIMEOUT")?;
        options.operation_timeout = millis_var("CUSHION_OPERATION_TIMEOUT")?;
        options.view_timeout = millis_var("CUSHION_VIEW_TIMEOUT")?;
        options.management_timeout = millis_var("CUSHION_MANAGEMENT_TIMEOUT")?;
        if let Some(endpoints) = non_empty_var("CUSHION_QUERY_ENDPOINT") {
            options.query_endpoints = endpoints
                .split(',')
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(stale) = non_empty_var("CUSHION_STALE") {
            options.stale = Some(stale.parse()?);
        }
        Ok(options)
    }

    /// Reads one option by name. Unset options and unknown names yield `None`.
    pub fn get_option(&self, name: &str) -> Option<Value> {
        debug!("getting option: {}", name);
        let value = serde_json::to_value(self).ok()?;
        match value.get(name) {
            Some(Value::Null) | None => None,
            Some(v) => Some(v.clone()),
        }
    }

    /// Sets one option by name.
    ///
    /// The new value is checked against the option's type; unknown names and
    /// ill-typed values are rejected and leave the set unchanged.
    pub fn set_option(&mut self, name: &str, value: Value) -> Result<&mut Self> {
        debug!("setting option: {} = {}", name, value);
        let mut current = serde_json::to_value(&*self)?;
        let fields = current
            .as_object_mut()
            .ok_or_else(|| Error::Internal("option set is not an object".to_string()))?;
        if !fields.contains_key(name) {
            return Err(Error::Config(format!("unknown option `{}`", name)));
        }
        fields.insert(name.to_string(), value);
        *self = serde_json::from_value(current)
            .map_err(|e| Error::Config(format!("invalid value for `{}`: {}", name, e)))?;
        Ok(self)
    }

    /// Checks the parameters a real connection needs.
    pub fn validate_connect(&self) -> Result<()> {
        match (&self.host, &self.bucket) {
            (Some(host), Some(bucket)) if !host.is_empty() && !bucket.is_empty() => Ok(()),
            _ => Err(Error::Config("host and bucket are required".to_string())),
        }
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            connection: self.connection_timeout.map(Duration::from_millis),
            operation: self.operation_timeout.map(Duration::from_millis),
            view: self.view_timeout.map(Duration::from_millis),
            management: self.management_timeout.map(Duration::from_millis),
        }
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

fn millis_var(name: &str) -> Result<Option<u64>> {
    match non_empty_var(name) {
        Some(v) => v
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{} must be a number of milliseconds", name))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_and_get_option() {
        let mut options = OptionSet::new();
        options.set_option("operation_timeout", json!(20)).unwrap();
        assert_eq!(options.operation_timeout, Some(20));
        assert_eq!(options.get_option("operation_timeout"), Some(json!(20)));
    }

    #[test]
    fn test_unset_option_reads_as_none() {
        let options = OptionSet::new();
        assert_eq!(options.get_option("host"), None);
        assert_eq!(options.get_option("no_such_option"), None);
    }

    #[test]
    fn test_unknown_option_is_rejected() {
        let mut options = OptionSet::new();
        let res = options.set_option("test_option", json!(20));
        assert!(matches!(res, Err(Error::Config(_))));
    }

    #[test]
    fn test_ill_typed_option_leaves_set_unchanged() {
        let mut options = OptionSet::new();
        options.set_option("view_timeout", json!(5)).unwrap();
        assert!(options.set_option("view_timeout", json!("soon")).is_err());
        assert_eq!(options.view_timeout, Some(5));
    }

    #[test]
    fn test_stale_option_by_name() {
        let mut options = OptionSet::new();
        options.set_option("stale", json!("before")).unwrap();
        assert_eq!(options.stale, Some(Staleness::Before));
    }

    #[test]
    fn test_validate_connect() {
        let mut options = OptionSet::new();
        assert!(matches!(options.validate_connect(), Err(Error::Config(_))));
        options.host = Some("couchbase://localhost".to_string());
        options.bucket = Some("default".to_string());
        assert!(options.validate_connect().is_ok());
    }

    #[test]
    fn test_timeouts() {
        let mut options = OptionSet::new();
        options.operation_timeout = Some(250);
        let timeouts = options.timeouts();
        assert_eq!(timeouts.operation, Some(Duration::from_millis(250)));
        assert_eq!(timeouts.view, None);
    }
}
