//! kwachaflow - Transactional Workflow Orchestration Engine
//!
//! Drives multi-step, user-facing financial workflows (wallet top-ups,
//! biller payments, transfers) to completion while coordinating money
//! movement against a core-banking ledger and external payment providers.
//!
//! # Modules
//!
//! - [`workflow`] - Step state machine, definitions, OTP sub-engine
//! - [`funds`] - Fund movement saga, transaction store, retry scheduler
//! - [`corebank`] - Core-banking gateway client seam
//! - [`provider`] - Biller/provider gateway adapters and registry
//! - [`session`] - TTL-bound session context store
//! - [`notify`] - Notification dispatch seam (SMS/email)
//! - [`service`] - HTTP invocation surface
//! - [`config`] / [`logging`] - Process configuration and tracing setup

pub mod config;
pub mod corebank;
pub mod error;
pub mod funds;
pub mod logging;
pub mod money;
pub mod notify;
pub mod provider;
pub mod service;
pub mod session;
pub mod workflow;

// Convenient re-exports at crate root
pub use config::AppConfig;
pub use corebank::{CoreBankClient, LedgerTransferType, MockBankClient, TransferInstruction, TransferOutcome};
pub use error::{EngineError, StructuredError};
pub use funds::{
    BillPaymentRequest, DirectTransferRequest, FinancialTransaction, FundCoordinator, FundFlow,
    MemoryTransactionStore, RetryScheduler, RetryWorker, TransactionStatus, TransactionStore,
};
pub use notify::{Channel, MockNotifier, NotificationGateway};
pub use provider::{MockProvider, PaymentOutcome, PaymentRequest, ProviderGateway, ProviderRegistry};
pub use session::{ContextMap, MemorySessionStore, SessionStore};
pub use workflow::{
    ExecutionId, ExecutionStatus, StepOutcome, TriggerPhase, WorkflowDefinition, WorkflowEngine,
    WorkflowExecution,
};
