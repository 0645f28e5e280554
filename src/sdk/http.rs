use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use log::{debug, warn};
use reqwest::StatusCode;
use serde_json::Value;

use crate::sdk::query::N1qlQuery;
use crate::{Error, Result};

/// Runs N1QL statements against a query service over plain HTTP GET.
///
/// Used instead of the bucket's own query primitive when query endpoints are
/// configured. With several endpoints, requests rotate between them.
pub struct QueryService {
    client: reqwest::Client,
    endpoints: Vec<String>,
    next: AtomicUsize,
}

impl QueryService {
    pub fn new(endpoints: Vec<String>, timeout: Option<Duration>) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(Error::Config("query service needs at least one endpoint".to_string()));
        }
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            client: builder.build()?,
            endpoints,
            next: AtomicUsize::new(0),
        })
    }

    fn endpoint(&self) -> &str {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.endpoints.len();
        &self.endpoints[i]
    }

    /// Sends the statement and returns the `results` of the response.
    pub async fn execute(&self, query: &N1qlQuery) -> Result<Option<Value>> {
        let url = self.endpoint();
        let params = query.to_params()?;
        debug!("sending N1QL statement to {}", url);

        let response = self.client.get(url).query(&params).send().await?;
        let status = response.status();
        let body = response.text().await?;
        interpret(status, body)
    }
}

/// Reads a query-service response body.
///
/// Bodies that are not JSON are kept as text when the request succeeded, so the
/// caller still sees what the service said.
fn interpret(status: StatusCode, body: String) -> Result<Option<Value>> {
    let json: Value = match serde_json::from_str(&body) {
        Ok(json) => json,
        Err(e) => {
            warn!("query service returned a non-JSON body ({}): {}", status, e);
            if status.is_success() {
                return Ok(Some(Value::String(body)));
            }
            return Err(Error::Query(format!("{}: {}", status, body.trim())));
        }
    };

    let errors = json
        .get("errors")
        .and_then(Value::as_array)
        .filter(|errors| !errors.is_empty());
    if let Some(errors) = errors {
        let messages: Vec<String> = errors
            .iter()
            .map(|e| e.get("msg").and_then(Value::as_str).map(str::to_string).unwrap_or_else(|| e.to_string()))
            .collect();
        return Err(Error::Query(messages.join("; ")));
    }
    if !status.is_success() {
        return Err(Error::Query(format!("{}: {}", status, json)));
    }

    match json.get("results") {
        Some(results) => Ok(Some(results.clone())),
        None => Ok(Some(json)),
    }
}
