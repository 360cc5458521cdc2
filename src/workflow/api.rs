//! Generic outward API dispatch for API_CALL steps and finalization
//! submissions.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::session::ContextMap;

#[async_trait]
pub trait ApiDispatcher: Send + Sync {
    /// Fire one call with resolved parameters and return the response body.
    async fn call(
        &self,
        endpoint: &str,
        method: &str,
        params: &ContextMap,
    ) -> Result<Value, EngineError>;
}

pub struct HttpApiDispatcher {
    client: reqwest::Client,
}

impl HttpApiDispatcher {
    pub fn new(timeout: Duration) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::Configuration(format!("api http client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ApiDispatcher for HttpApiDispatcher {
    async fn call(
        &self,
        endpoint: &str,
        method: &str,
        params: &ContextMap,
    ) -> Result<Value, EngineError> {
        debug!(endpoint = %endpoint, method = %method, "outward api call");

        let request = match method.to_ascii_uppercase().as_str() {
            "GET" => {
                let query: Vec<(String, String)> = params
                    .iter()
                    .map(|(k, v)| {
                        let rendered = match v {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        (k.clone(), rendered)
                    })
                    .collect();
                self.client.get(endpoint).query(&query)
            }
            _ => self.client.post(endpoint).json(&Value::Object(params.clone())),
        };

        let response = request.send().await.map_err(|e| {
            warn!(endpoint = %endpoint, error = %e, "outward api call failed");
            EngineError::ExternalService(format!("api call to {}: {}", endpoint, e))
        })?;

        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);

        if !status.is_success() {
            return Err(EngineError::ExternalService(format!(
                "api call to {} returned {}: {}",
                endpoint,
                status.as_u16(),
                body.get("error")
                    .or_else(|| body.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("no detail")
            )));
        }

        Ok(body)
    }
}

/// Scriptable dispatcher for tests: queued responses, recorded calls,
/// auto-accepts when unscripted.
pub struct MockApiDispatcher {
    script: Mutex<VecDeque<Result<Value, String>>>,
    calls: Mutex<Vec<(String, String, ContextMap)>>,
}

impl MockApiDispatcher {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn push_response(&self, response: Value) {
        self.script.lock().unwrap().push_back(Ok(response));
    }

    pub fn fail_next(&self, error: &str) {
        self.script.lock().unwrap().push_back(Err(error.to_string()));
    }

    pub fn calls(&self) -> Vec<(String, String, ContextMap)> {
        self.calls.lock().unwrap().clone()
    }
}

impl Default for MockApiDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ApiDispatcher for MockApiDispatcher {
    async fn call(
        &self,
        endpoint: &str,
        method: &str,
        params: &ContextMap,
    ) -> Result<Value, EngineError> {
        self.calls
            .lock()
            .unwrap()
            .push((endpoint.to_string(), method.to_string(), params.clone()));

        match self.script.lock().unwrap().pop_front() {
            Some(Ok(response)) => Ok(response),
            Some(Err(error)) => Err(EngineError::ExternalService(error)),
            None => Ok(serde_json::json!({"ok": true})),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_mock_records_and_scripts() {
        let api = MockApiDispatcher::new();
        api.push_response(json!({"valid": true}));
        api.fail_next("endpoint down");

        let mut params = ContextMap::new();
        params.insert("a".to_string(), json!(1));

        let first = api.call("http://x/validate", "POST", &params).await.unwrap();
        assert_eq!(first, json!({"valid": true}));

        let second = api.call("http://x/validate", "POST", &params).await;
        assert!(second.is_err());

        // Unscripted auto-accepts
        let third = api.call("http://x/validate", "POST", &params).await.unwrap();
        assert_eq!(third, json!({"ok": true}));

        assert_eq!(api.calls().len(), 3);
    }
}
