//! Financial transaction types.
//!
//! A [`FinancialTransaction`] is one movement of money tied to a workflow
//! (or any other context). Its `reference` is the gateway-assigned,
//! globally-unique idempotency key; the paired [`BillerTransaction`] audit
//! record shares it for cross-referencing.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Transaction lifecycle status.
///
/// COMPLETED, FAILED_PERMANENT and REVERSED are terminal: no further status
/// mutation is permitted once reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i16)]
pub enum TransactionStatus {
    Pending = 1,
    Processing = 2,
    Completed = 3,
    Failed = 4,
    FailedPermanent = 5,
    Reversed = 6,
}

impl TransactionStatus {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(TransactionStatus::Pending),
            2 => Some(TransactionStatus::Processing),
            3 => Some(TransactionStatus::Completed),
            4 => Some(TransactionStatus::Failed),
            5 => Some(TransactionStatus::FailedPermanent),
            6 => Some(TransactionStatus::Reversed),
            _ => None,
        }
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Completed
                | TransactionStatus::FailedPermanent
                | TransactionStatus::Reversed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::Processing => "PROCESSING",
            TransactionStatus::Completed => "COMPLETED",
            TransactionStatus::Failed => "FAILED",
            TransactionStatus::FailedPermanent => "FAILED_PERMANENT",
            TransactionStatus::Reversed => "REVERSED",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which saga shape produced the transaction.
///
/// Only DIRECT transactions are retry-eligible: a RESERVATION transaction
/// that failed has already been compensated and must stay FAILED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i16)]
pub enum FundFlow {
    Direct = 1,
    Reservation = 2,
}

impl FundFlow {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(FundFlow::Direct),
            2 => Some(FundFlow::Reservation),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FundFlow::Direct => "DIRECT",
            FundFlow::Reservation => "RESERVATION",
        }
    }
}

impl fmt::Display for FundFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One movement of money, durably recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinancialTransaction {
    /// Gateway-assigned reference; globally unique idempotency key.
    pub reference: String,
    pub flow: FundFlow,
    pub status: TransactionStatus,
    pub amount: Decimal,
    pub currency: String,
    pub from_account: String,
    pub to_account: String,
    pub retry_count: u32,
    pub max_retries: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Provider-side reference, once the external leg completes.
    pub external_reference: Option<String>,
    pub error_message: Option<String>,
    pub error_code: Option<String>,
    /// Workflow execution that produced this transaction, if any.
    pub execution_id: Option<String>,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FinancialTransaction {
    /// New PENDING transaction under the given reference.
    #[allow(clippy::too_many_arguments)]
    pub fn pending(
        reference: &str,
        flow: FundFlow,
        amount: Decimal,
        currency: &str,
        from_account: &str,
        to_account: &str,
        max_retries: u32,
        description: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            reference: reference.to_string(),
            flow,
            status: TransactionStatus::Pending,
            amount,
            currency: currency.to_string(),
            from_account: from_account.to_string(),
            to_account: to_account.to_string(),
            retry_count: 0,
            max_retries,
            next_retry_at: None,
            external_reference: None,
            error_message: None,
            error_code: None,
            execution_id: None,
            description: description.to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_execution(mut self, execution_id: Option<String>) -> Self {
        self.execution_id = execution_id;
        self
    }
}

impl fmt::Display for FinancialTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Txn[{}] {} {} {} -> {} status={}",
            self.reference, self.amount, self.currency, self.from_account, self.to_account, self.status
        )
    }
}

/// Provider-side audit record, 1:1 with certain FinancialTransactions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillerTransaction {
    /// Same reference as the paired FinancialTransaction.
    pub reference: String,
    pub biller: String,
    pub account_number: String,
    pub amount: Decimal,
    pub currency: String,
    pub status: TransactionStatus,
    pub external_reference: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BillerTransaction {
    pub fn pending(
        reference: &str,
        biller: &str,
        account_number: &str,
        amount: Decimal,
        currency: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            reference: reference.to_string(),
            biller: biller.to_string(),
            account_number: account_number.to_string(),
            amount,
            currency: currency.to_string(),
            status: TransactionStatus::Pending,
            external_reference: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Append-only audit row. Never mutated or deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusTransition {
    pub reference: String,
    pub from_status: TransactionStatus,
    pub to_status: TransactionStatus,
    pub reason: String,
    pub retry_number: u32,
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_id_roundtrip() {
        for status in [
            TransactionStatus::Pending,
            TransactionStatus::Processing,
            TransactionStatus::Completed,
            TransactionStatus::Failed,
            TransactionStatus::FailedPermanent,
            TransactionStatus::Reversed,
        ] {
            assert_eq!(TransactionStatus::from_id(status.id()), Some(status));
        }
        assert_eq!(TransactionStatus::from_id(0), None);
        assert_eq!(TransactionStatus::from_id(7), None);
    }

    #[test]
    fn test_terminal_states() {
        assert!(TransactionStatus::Completed.is_terminal());
        assert!(TransactionStatus::FailedPermanent.is_terminal());
        assert!(TransactionStatus::Reversed.is_terminal());
        assert!(!TransactionStatus::Pending.is_terminal());
        assert!(!TransactionStatus::Processing.is_terminal());
        assert!(!TransactionStatus::Failed.is_terminal());
    }

    #[test]
    fn test_flow_roundtrip() {
        assert_eq!(FundFlow::from_id(1), Some(FundFlow::Direct));
        assert_eq!(FundFlow::from_id(2), Some(FundFlow::Reservation));
        assert_eq!(FundFlow::from_id(3), None);
    }

    #[test]
    fn test_pending_constructor() {
        let tx = FinancialTransaction::pending(
            "CBS-0000001",
            FundFlow::Reservation,
            Decimal::from(5000),
            "MWK",
            "1001",
            "METER-77",
            3,
            "water bill",
        );
        assert_eq!(tx.status, TransactionStatus::Pending);
        assert_eq!(tx.retry_count, 0);
        assert!(tx.next_retry_at.is_none());
        assert!(tx.error_message.is_none());
    }
}
