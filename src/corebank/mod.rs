//! Core-Banking Gateway Client
//!
//! Thin abstraction over the core-banking system's funds-transfer API.
//! The engine only ever moves money through this seam: direct transfers,
//! holds into the suspense account, and compensating reversals out of it.
//!
//! The gateway assigns its own reference on success; that reference becomes
//! the durable idempotency key for the whole saga. Callers may also supply
//! their own reference where the gateway supports request deduplication
//! (the retry scheduler relies on this).

pub mod http;
pub mod mock;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::EngineError;

pub use http::HttpBankClient;
pub use mock::MockBankClient;

/// Ledger-level categorization of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerTransferType {
    /// Same-ledger transfer between customer accounts.
    Internal,
    /// Customer account into the suspense account, reserving funds.
    Hold,
    /// Suspense account back to the customer, undoing a hold.
    Reversal,
}

impl fmt::Display for LedgerTransferType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LedgerTransferType::Internal => "INTERNAL",
            LedgerTransferType::Hold => "HOLD",
            LedgerTransferType::Reversal => "REVERSAL",
        };
        write!(f, "{}", s)
    }
}

/// One funds movement request against the core-banking ledger.
#[derive(Debug, Clone, Serialize)]
pub struct TransferInstruction {
    pub from_account: String,
    pub to_account: String,
    pub amount: Decimal,
    pub currency: String,
    /// Caller-supplied idempotency key; `None` lets the gateway assign one.
    pub reference: Option<String>,
    pub description: String,
    pub transfer_type: LedgerTransferType,
}

/// Normalized gateway response.
///
/// Transport-level failures (timeouts, broken connections) surface as
/// `EngineError::ExternalService` from the client instead; this shape only
/// carries responses the gateway actually produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferOutcome {
    pub success: bool,
    pub gateway_reference: Option<String>,
    pub message: String,
    pub error_code: Option<String>,
}

impl TransferOutcome {
    pub fn settled(reference: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: true,
            gateway_reference: Some(reference.into()),
            message: message.into(),
            error_code: None,
        }
    }

    pub fn rejected(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            gateway_reference: None,
            message: message.into(),
            error_code: Some(code.into()),
        }
    }
}

#[async_trait]
pub trait CoreBankClient: Send + Sync {
    /// Execute one ledger transfer.
    ///
    /// Implementations must be safe to call twice with the same caller
    /// reference where the backing gateway deduplicates by reference.
    async fn transfer(&self, instruction: TransferInstruction)
        -> Result<TransferOutcome, EngineError>;
}
