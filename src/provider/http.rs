//! HTTP-backed provider adapter.
//!
//! Posts the normalized payment request to a biller integration endpoint
//! and maps the JSON response back to [`PaymentOutcome`]. Each call carries
//! an explicit timeout; the caller treats a timeout as a failure requiring
//! compensation.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use super::{PaymentOutcome, PaymentRequest, ProviderGateway};
use crate::error::EngineError;

pub struct HttpProviderGateway {
    name: String,
    endpoint: String,
    client: reqwest::Client,
    debit_override: bool,
}

impl HttpProviderGateway {
    pub fn new(
        name: &str,
        endpoint: &str,
        timeout: Duration,
        debit_override: bool,
    ) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::Configuration(format!("provider http client: {}", e)))?;

        Ok(Self {
            name: name.to_string(),
            endpoint: endpoint.to_string(),
            client,
            debit_override,
        })
    }
}

/// Map a provider HTTP response to the normalized outcome shape.
///
/// Accepts both `{"ok": true}` and `{"success": true}` envelopes; anything
/// non-2xx or unparseable is a decline carrying the status code.
fn outcome_from_response(status: u16, body: Value) -> PaymentOutcome {
    let ok_flag = body
        .get("ok")
        .or_else(|| body.get("success"))
        .and_then(Value::as_bool)
        .unwrap_or(false);

    if (200..300).contains(&status) && ok_flag {
        let external_reference = body
            .get("external_reference")
            .or_else(|| body.get("reference"))
            .and_then(Value::as_str)
            .map(str::to_string);
        PaymentOutcome {
            ok: true,
            external_reference,
            data: body.get("data").cloned(),
            error: None,
            status_code: Some(status),
        }
    } else {
        let error = body
            .get("error")
            .or_else(|| body.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("provider declined the payment")
            .to_string();
        PaymentOutcome::declined(error, Some(status))
    }
}

#[async_trait]
impl ProviderGateway for HttpProviderGateway {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_debit_override(&self) -> bool {
        self.debit_override
    }

    async fn process_payment(
        &self,
        request: PaymentRequest,
    ) -> Result<PaymentOutcome, EngineError> {
        debug!(
            provider = %self.name,
            reference = %request.reference,
            amount = %request.amount,
            "dispatching provider payment"
        );

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                warn!(provider = %self.name, reference = %request.reference, error = %e, "provider call failed");
                EngineError::ExternalService(format!("provider {}: {}", self.name, e))
            })?;

        let status = response.status().as_u16();
        let body: Value = response.json().await.unwrap_or(Value::Null);

        Ok(outcome_from_response(status, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_envelope_mapped() {
        let outcome = outcome_from_response(
            200,
            json!({"ok": true, "external_reference": "WTR-991", "data": {"units": 12}}),
        );
        assert!(outcome.ok);
        assert_eq!(outcome.external_reference.as_deref(), Some("WTR-991"));
        assert_eq!(outcome.data, Some(json!({"units": 12})));
    }

    #[test]
    fn test_alternate_success_keys() {
        let outcome = outcome_from_response(201, json!({"success": true, "reference": "AIR-5"}));
        assert!(outcome.ok);
        assert_eq!(outcome.external_reference.as_deref(), Some("AIR-5"));
    }

    #[test]
    fn test_decline_carries_error_and_status() {
        let outcome = outcome_from_response(422, json!({"error": "Invalid meter number"}));
        assert!(!outcome.ok);
        assert_eq!(outcome.error.as_deref(), Some("Invalid meter number"));
        assert_eq!(outcome.status_code, Some(422));
    }

    #[test]
    fn test_2xx_without_ok_flag_is_decline() {
        let outcome = outcome_from_response(200, json!({"message": "queued"}));
        assert!(!outcome.ok);
        assert_eq!(outcome.error.as_deref(), Some("queued"));
    }

    #[test]
    fn test_unparseable_body_is_decline() {
        let outcome = outcome_from_response(502, Value::Null);
        assert!(!outcome.ok);
        assert_eq!(outcome.status_code, Some(502));
    }
}
