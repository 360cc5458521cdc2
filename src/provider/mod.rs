//! Provider Gateway Adapter
//!
//! Biller/airtime provider payment APIs (water boards, mobile-money,
//! airtime top-up) normalized to one contract. Adapter implementations are
//! external collaborators; the engine only sees [`PaymentOutcome`].
//!
//! Providers are at best idempotent-by-reference; the engine never assumes
//! exactly-once delivery. A call that times out is treated as a failure
//! requiring compensation, not as "unknown" (see the coordinator).

pub mod http;
pub mod mock;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;

pub use http::HttpProviderGateway;
pub use mock::MockProvider;

/// One payment request toward a biller.
#[derive(Debug, Clone, Serialize)]
pub struct PaymentRequest {
    /// Customer's account/meter/phone number at the biller.
    pub account_number: String,
    pub amount: Decimal,
    pub currency: String,
    /// Our transaction reference (the hold's gateway reference).
    pub reference: String,
    /// Debit source for billers that pull funds themselves.
    pub debit_account: Option<String>,
    /// Biller-specific fields, passed through untouched.
    pub metadata: serde_json::Map<String, Value>,
}

/// Normalized provider response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentOutcome {
    pub ok: bool,
    pub external_reference: Option<String>,
    pub data: Option<Value>,
    pub error: Option<String>,
    pub status_code: Option<u16>,
}

impl PaymentOutcome {
    pub fn accepted(external_reference: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            ok: true,
            external_reference: Some(external_reference.into()),
            data,
            error: None,
            status_code: Some(200),
        }
    }

    pub fn declined(error: impl Into<String>, status_code: Option<u16>) -> Self {
        Self {
            ok: false,
            external_reference: None,
            data: None,
            error: Some(error.into()),
            status_code,
        }
    }
}

#[async_trait]
pub trait ProviderGateway: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this biller's API accepts a debit-account override, letting
    /// it pull directly from the suspense account.
    fn supports_debit_override(&self) -> bool {
        false
    }

    async fn process_payment(&self, request: PaymentRequest)
        -> Result<PaymentOutcome, EngineError>;
}

/// Maps biller codes to their gateway adapters.
///
/// An unknown biller is a validation failure surfaced before any money
/// moves.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ProviderGateway>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    pub fn register(&mut self, biller: &str, provider: Arc<dyn ProviderGateway>) {
        self.providers.insert(biller.to_string(), provider);
    }

    pub fn resolve(&self, biller: &str) -> Result<Arc<dyn ProviderGateway>, EngineError> {
        self.providers
            .get(biller)
            .cloned()
            .ok_or_else(|| EngineError::Validation(format!("unknown biller: {}", biller)))
    }

    pub fn contains(&self, biller: &str) -> bool {
        self.providers.contains_key(biller)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_registry_resolves_known_biller() {
        let mut registry = ProviderRegistry::new();
        registry.register("water-board", Arc::new(MockProvider::new("water-board")));

        assert!(registry.contains("water-board"));
        let provider = registry.resolve("water-board").unwrap();
        assert_eq!(provider.name(), "water-board");
    }

    #[tokio::test]
    async fn test_registry_rejects_unknown_biller() {
        let registry = ProviderRegistry::new();
        match registry.resolve("nope") {
            Err(EngineError::Validation(msg)) => assert!(msg.contains("nope")),
            other => panic!("expected validation error, got {:?}", other.map(|p| p.name().to_string())),
        }
    }
}
