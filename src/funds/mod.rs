//! Fund movement: saga coordinator, durable transaction store, retry
//! scheduler.

pub mod coordinator;
pub mod retry;
pub mod store;
pub mod types;

pub use coordinator::{BillPaymentRequest, DirectTransferRequest, FundCoordinator};
pub use retry::{RetryScheduler, RetrySweep, RetryWorker};
pub use store::{MemoryTransactionStore, PgTransactionStore, TransactionStore};
pub use types::{
    BillerTransaction, FinancialTransaction, FundFlow, StatusTransition, TransactionStatus,
};
