//! Fund Movement Coordinator
//!
//! Saga engine for money movement: hold, external call, settle-or-reverse.
//! The central invariant: *every successful hold ends with exactly one of
//! {a terminal transaction record, a completed reversal}*. All gateway and
//! provider results travel as explicit values, so no compensation step can
//! be skipped by an escaped error path.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde_json::Value;
use tokio::time::timeout;
use tracing::{error, info, warn};

use super::store::TransactionStore;
use super::types::{BillerTransaction, FinancialTransaction, FundFlow, TransactionStatus};
use crate::config::{FundsConfig, RetryConfig};
use crate::corebank::{CoreBankClient, LedgerTransferType, TransferInstruction, TransferOutcome};
use crate::error::EngineError;
use crate::provider::{PaymentRequest, ProviderRegistry};

/// Same-ledger transfer request (direct flow).
#[derive(Debug, Clone)]
pub struct DirectTransferRequest {
    pub from_account: String,
    pub to_account: String,
    pub amount: Decimal,
    pub currency: String,
    pub description: String,
    pub execution_id: Option<String>,
    /// Step-level override of the configured retry ceiling.
    pub max_retries: Option<u32>,
}

/// Provider-backed payment request (reservation flow).
#[derive(Debug, Clone)]
pub struct BillPaymentRequest {
    /// Customer ledger account to debit.
    pub user_account: String,
    /// Biller code resolved through the provider registry.
    pub biller: String,
    /// Customer's account/meter/phone number at the biller.
    pub account_number: String,
    pub amount: Decimal,
    pub currency: String,
    pub metadata: serde_json::Map<String, Value>,
    pub execution_id: Option<String>,
}

pub struct FundCoordinator {
    bank: Arc<dyn CoreBankClient>,
    providers: ProviderRegistry,
    store: Arc<dyn TransactionStore>,
    funds: FundsConfig,
    retry: RetryConfig,
}

impl FundCoordinator {
    pub fn new(
        bank: Arc<dyn CoreBankClient>,
        providers: ProviderRegistry,
        store: Arc<dyn TransactionStore>,
        funds: FundsConfig,
        retry: RetryConfig,
    ) -> Self {
        Self {
            bank,
            providers,
            store,
            funds,
            retry,
        }
    }

    pub fn store(&self) -> &Arc<dyn TransactionStore> {
        &self.store
    }

    /// Direct flow: one synchronous core-banking transfer.
    ///
    /// The returned transaction is terminal COMPLETED on success, or FAILED
    /// (retry-eligible) when the gateway rejected or timed out. `Err` is
    /// reserved for validation and storage problems.
    pub async fn transfer_direct(
        &self,
        req: DirectTransferRequest,
    ) -> Result<FinancialTransaction, EngineError> {
        if req.amount <= Decimal::ZERO {
            return Err(EngineError::Validation("amount must be positive".to_string()));
        }
        if req.from_account == req.to_account {
            return Err(EngineError::Validation(
                "source and destination accounts are the same".to_string(),
            ));
        }

        let max_retries = req.max_retries.unwrap_or(self.retry.max_retries);
        let instruction = TransferInstruction {
            from_account: req.from_account.clone(),
            to_account: req.to_account.clone(),
            amount: req.amount,
            currency: req.currency.clone(),
            reference: None,
            description: req.description.clone(),
            transfer_type: LedgerTransferType::Internal,
        };

        match self.call_bank(instruction).await {
            BankCall::Settled(outcome) => {
                let reference = outcome
                    .gateway_reference
                    .clone()
                    .unwrap_or_else(local_reference);
                let tx = FinancialTransaction::pending(
                    &reference,
                    FundFlow::Direct,
                    req.amount,
                    &req.currency,
                    &req.from_account,
                    &req.to_account,
                    max_retries,
                    &req.description,
                )
                .with_execution(req.execution_id.clone());
                self.store.insert(&tx).await?;
                self.store
                    .complete(&reference, TransactionStatus::Pending, None, "core transfer settled")
                    .await?;

                info!(reference = %reference, amount = %req.amount, "direct transfer settled");
                self.fetch(&reference).await
            }
            BankCall::Rejected(code, message) => {
                // No completed row for a failed leg; the FAILED record exists
                // so the retry scheduler can re-drive it.
                let reference = local_reference();
                let tx = FinancialTransaction::pending(
                    &reference,
                    FundFlow::Direct,
                    req.amount,
                    &req.currency,
                    &req.from_account,
                    &req.to_account,
                    max_retries,
                    &req.description,
                )
                .with_execution(req.execution_id.clone());
                self.store.insert(&tx).await?;
                let next_retry_at =
                    chrono::Utc::now() + backoff_delay(self.retry.base_interval(), 0);
                self.store
                    .fail(
                        &reference,
                        TransactionStatus::Pending,
                        code.as_deref(),
                        &message,
                        Some(next_retry_at),
                        "core transfer failed",
                    )
                    .await?;

                warn!(reference = %reference, error = %message, "direct transfer failed");
                self.fetch(&reference).await
            }
        }
    }

    /// Reservation flow: hold, record, execute, settle-or-reverse.
    ///
    /// The returned transaction is COMPLETED when the provider accepted the
    /// payment, or FAILED with the refund status embedded in its error
    /// message. `Err(ExternalService)` means the hold itself failed (no
    /// record, no money moved); `Err(Consistency)` means the record phase
    /// failed after the hold and the compensating reversal has already run.
    pub async fn pay_biller(
        &self,
        req: BillPaymentRequest,
    ) -> Result<FinancialTransaction, EngineError> {
        if req.amount <= Decimal::ZERO {
            return Err(EngineError::Validation("amount must be positive".to_string()));
        }
        // Resolve the provider before any money moves: an unknown biller
        // must surface with zero side effects.
        let provider = self.providers.resolve(&req.biller)?;

        // --- Phase 1: hold -------------------------------------------------
        let hold = TransferInstruction {
            from_account: req.user_account.clone(),
            to_account: self.funds.suspense_account.clone(),
            amount: req.amount,
            currency: req.currency.clone(),
            reference: None,
            description: format!("Hold for {} {}", req.biller, req.account_number),
            transfer_type: LedgerTransferType::Hold,
        };

        let reference = match self.call_bank(hold).await {
            BankCall::Settled(outcome) => match outcome.gateway_reference {
                Some(reference) => reference,
                None => {
                    // Held funds without a durable key cannot be tracked;
                    // undo the hold and refuse.
                    let refund = self
                        .reverse_hold(&req.user_account, req.amount, &req.currency, "UNKEYED")
                        .await;
                    return Err(EngineError::Consistency(format!(
                        "gateway returned no reference for hold. Refund status: {}",
                        refund
                    )));
                }
            },
            BankCall::Rejected(code, message) => {
                return Err(EngineError::ExternalService(format!(
                    "hold failed: {}{}",
                    message,
                    code.map(|c| format!(" ({})", c)).unwrap_or_default()
                )));
            }
        };

        // --- Phase 2: record ----------------------------------------------
        let tx = FinancialTransaction::pending(
            &reference,
            FundFlow::Reservation,
            req.amount,
            &req.currency,
            &req.user_account,
            &req.account_number,
            0,
            &format!("{} payment for {}", req.biller, req.account_number),
        )
        .with_execution(req.execution_id.clone());

        match self.store.insert(&tx).await {
            Ok(true) => {}
            Ok(false) => {
                // Hold already recorded under this reference: another call
                // got here first. Not a double-spend; defer to that record
                // and only resume the provider leg for a still-open one.
                if let Some(existing) = self.store.get(&reference).await? {
                    if !matches!(
                        existing.status,
                        TransactionStatus::Pending | TransactionStatus::Processing
                    ) {
                        return Ok(existing);
                    }
                }
            }
            Err(e) => {
                // The one place compensation is mandatory by construction:
                // money sits in suspense with no record pointing at it.
                let refund = self
                    .reverse_hold(&req.user_account, req.amount, &req.currency, &reference)
                    .await;
                return Err(EngineError::Consistency(format!(
                    "failed to record transaction after hold {}: {}. Refund status: {}",
                    reference, e, refund
                )));
            }
        }

        let audit = BillerTransaction::pending(
            &reference,
            &req.biller,
            &req.account_number,
            req.amount,
            &req.currency,
        );
        if let Err(e) = self.store.insert_biller(&audit).await {
            let refund = self
                .reverse_hold(&req.user_account, req.amount, &req.currency, &reference)
                .await;
            self.store
                .fail(
                    &reference,
                    TransactionStatus::Pending,
                    None,
                    &format!("audit record failed: {}. Refund status: {}", e, refund),
                    None,
                    "audit record failed, hold reversed",
                )
                .await?;
            return Err(EngineError::Consistency(format!(
                "failed to record biller audit for {}: {}. Refund status: {}",
                reference, e, refund
            )));
        }

        // --- Phase 3: execute ---------------------------------------------
        self.store
            .mark_processing(&reference, TransactionStatus::Pending, "provider dispatch")
            .await?;

        let payment = PaymentRequest {
            account_number: req.account_number.clone(),
            amount: req.amount,
            currency: req.currency.clone(),
            reference: reference.clone(),
            debit_account: if provider.supports_debit_override() {
                Some(self.funds.suspense_account.clone())
            } else {
                None
            },
            metadata: req.metadata.clone(),
        };

        let provider_result = match timeout(
            self.funds.provider_timeout(),
            provider.process_payment(payment),
        )
        .await
        {
            Err(_) => Err((
                Some("PROVIDER_TIMEOUT".to_string()),
                format!("provider {} did not respond in time", req.biller),
            )),
            Ok(Err(e)) => Err((None, e.to_string())),
            Ok(Ok(outcome)) if outcome.ok => Ok(outcome),
            Ok(Ok(outcome)) => Err((
                outcome.status_code.map(|s| s.to_string()),
                outcome
                    .error
                    .unwrap_or_else(|| "provider declined the payment".to_string()),
            )),
        };

        match provider_result {
            Ok(outcome) => {
                self.store
                    .complete(
                        &reference,
                        TransactionStatus::Processing,
                        outcome.external_reference.as_deref(),
                        "provider settled",
                    )
                    .await?;
                self.store
                    .update_biller(
                        &reference,
                        TransactionStatus::Completed,
                        outcome.external_reference.as_deref(),
                    )
                    .await?;
                info!(
                    reference = %reference,
                    biller = %req.biller,
                    external_reference = ?outcome.external_reference,
                    "bill payment settled"
                );
                self.fetch(&reference).await
            }
            Err((code, provider_error)) => {
                // Failure after debit: the reversal is mandatory and runs
                // exactly once, synchronously, before anything is surfaced.
                let refund = self
                    .reverse_hold(&req.user_account, req.amount, &req.currency, &reference)
                    .await;
                let message = format!("{}. Refund status: {}", provider_error, refund);
                self.store
                    .fail(
                        &reference,
                        TransactionStatus::Processing,
                        code.as_deref(),
                        &message,
                        None,
                        "provider failed, hold reversed",
                    )
                    .await?;
                let audit_status = if refund == REFUND_SUCCESS {
                    TransactionStatus::Reversed
                } else {
                    TransactionStatus::Failed
                };
                self.store
                    .update_biller(&reference, audit_status, None)
                    .await?;

                warn!(
                    reference = %reference,
                    biller = %req.biller,
                    error = %provider_error,
                    refund = %refund,
                    "bill payment failed"
                );
                self.fetch(&reference).await
            }
        }
    }

    /// Compensating reversal: suspense back to the customer, tagged with
    /// the original reference. Attempted exactly once; its own failure is a
    /// critical, manually-reconcilable condition and is never retried here.
    async fn reverse_hold(
        &self,
        user_account: &str,
        amount: Decimal,
        currency: &str,
        original_reference: &str,
    ) -> String {
        let instruction = TransferInstruction {
            from_account: self.funds.suspense_account.clone(),
            to_account: user_account.to_string(),
            amount,
            currency: currency.to_string(),
            reference: Some(format!("{}-RVSL", original_reference)),
            description: format!("Reversal of {}", original_reference),
            transfer_type: LedgerTransferType::Reversal,
        };

        match self.call_bank(instruction).await {
            BankCall::Settled(_) => {
                info!(
                    reference = %original_reference,
                    account = %user_account,
                    amount = %amount,
                    "hold reversed to customer"
                );
                REFUND_SUCCESS.to_string()
            }
            BankCall::Rejected(code, message) => {
                error!(
                    reference = %original_reference,
                    account = %user_account,
                    amount = %amount,
                    error = %message,
                    error_code = ?code,
                    "CRITICAL: compensating reversal failed; funds stranded in suspense, manual reconciliation required"
                );
                format!("Failed - {}", message)
            }
        }
    }

    /// One bank call under the configured timeout, collapsed to an explicit
    /// settled/rejected value. A timeout is a rejection, never "unknown".
    async fn call_bank(&self, instruction: TransferInstruction) -> BankCall {
        match timeout(self.funds.bank_timeout(), self.bank.transfer(instruction)).await {
            Ok(Ok(outcome)) if outcome.success => BankCall::Settled(outcome),
            Ok(Ok(outcome)) => BankCall::Rejected(outcome.error_code, outcome.message),
            Ok(Err(e)) => BankCall::Rejected(None, e.to_string()),
            Err(_) => BankCall::Rejected(
                Some("GATEWAY_TIMEOUT".to_string()),
                "core-banking gateway did not respond in time".to_string(),
            ),
        }
    }

    async fn fetch(&self, reference: &str) -> Result<FinancialTransaction, EngineError> {
        self.store.get(reference).await?.ok_or_else(|| {
            EngineError::System(format!("transaction {} vanished after write", reference))
        })
    }
}

const REFUND_SUCCESS: &str = "Success";

enum BankCall {
    Settled(TransferOutcome),
    Rejected(Option<String>, String),
}

fn local_reference() -> String {
    format!("TXN-{}", ulid::Ulid::new())
}

/// Exponential backoff delay: base interval doubled per completed attempt.
pub(crate) fn backoff_delay(base: std::time::Duration, retry_count: u32) -> chrono::Duration {
    // Exponent capped: past ~20 doublings the deadline is academic.
    let factor = 2u64.saturating_pow(retry_count.min(20));
    chrono::Duration::from_std(base.saturating_mul(factor as u32))
        .unwrap_or_else(|_| chrono::Duration::days(365))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_backoff_doubles_per_attempt() {
        let base = Duration::from_secs(120);
        assert_eq!(backoff_delay(base, 0), chrono::Duration::minutes(2));
        assert_eq!(backoff_delay(base, 1), chrono::Duration::minutes(4));
        assert_eq!(backoff_delay(base, 2), chrono::Duration::minutes(8));
        assert_eq!(backoff_delay(base, 3), chrono::Duration::minutes(16));
    }

    #[test]
    fn test_backoff_exponent_is_capped() {
        let base = Duration::from_secs(120);
        // Must not overflow for absurd counts
        let delay = backoff_delay(base, 10_000);
        assert!(delay > chrono::Duration::zero());
    }

    #[test]
    fn test_local_reference_shape() {
        let reference = local_reference();
        assert!(reference.starts_with("TXN-"));
        assert_ne!(local_reference(), local_reference());
    }
}
