//! HTTP-backed core-banking gateway client.
//!
//! Posts transfer instructions to the core-banking integration endpoint.
//! Transport failures surface as `ExternalService`; the caller's timeout
//! policy decides how long to wait.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{CoreBankClient, TransferInstruction, TransferOutcome};
use crate::error::EngineError;

pub struct HttpBankClient {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpBankClient {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::Configuration(format!("corebank http client: {}", e)))?;
        Ok(Self {
            endpoint: endpoint.to_string(),
            client,
        })
    }
}

#[async_trait]
impl CoreBankClient for HttpBankClient {
    async fn transfer(
        &self,
        instruction: TransferInstruction,
    ) -> Result<TransferOutcome, EngineError> {
        debug!(
            from = %instruction.from_account,
            to = %instruction.to_account,
            amount = %instruction.amount,
            transfer_type = %instruction.transfer_type,
            "core-banking transfer"
        );

        let response = self
            .client
            .post(&self.endpoint)
            .json(&instruction)
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "core-banking call failed");
                EngineError::ExternalService(format!("core-banking gateway: {}", e))
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::ExternalService(format!(
                "core-banking gateway returned {}",
                status.as_u16()
            )));
        }

        response.json::<TransferOutcome>().await.map_err(|e| {
            EngineError::ExternalService(format!("core-banking gateway response: {}", e))
        })
    }
}
