//! Transaction Retry Scheduler
//!
//! Re-drives FAILED direct-flow transactions on exponential backoff,
//! independently of any live workflow execution. Only the core-banking leg
//! is ever re-attempted; reservation-flow transactions were already
//! compensated and stay FAILED.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::timeout;
use tracing::{error, info, warn};

use super::coordinator::backoff_delay;
use super::store::TransactionStore;
use super::types::FinancialTransaction;
use crate::config::RetryConfig;
use crate::corebank::{CoreBankClient, LedgerTransferType, TransferInstruction};
use crate::error::EngineError;

/// Counters from one sweep.
#[derive(Debug, Default, Clone, Copy, serde::Serialize)]
pub struct RetrySweep {
    pub scanned: usize,
    pub completed: usize,
    pub rescheduled: usize,
    pub exhausted: usize,
    /// Claim lost to a concurrent sweep, or eligibility changed under us.
    pub skipped: usize,
}

pub struct RetryScheduler {
    bank: Arc<dyn CoreBankClient>,
    store: Arc<dyn TransactionStore>,
    config: RetryConfig,
    bank_timeout: Duration,
}

impl RetryScheduler {
    pub fn new(
        bank: Arc<dyn CoreBankClient>,
        store: Arc<dyn TransactionStore>,
        config: RetryConfig,
        bank_timeout: Duration,
    ) -> Self {
        Self {
            bank,
            store,
            config,
            bank_timeout,
        }
    }

    /// One sweep over all currently-due transactions.
    pub async fn run_due_retries(&self) -> Result<RetrySweep, EngineError> {
        let now = Utc::now();
        let due = self.store.due_retries(now, self.config.sweep_limit).await?;

        let mut sweep = RetrySweep::default();
        for tx in due {
            sweep.scanned += 1;

            // Claim with a CAS that re-checks eligibility; losing the race
            // to a concurrent sweep is normal, not an error.
            if !self.store.claim_for_retry(&tx.reference, now).await? {
                sweep.skipped += 1;
                continue;
            }

            match self.retry_transfer(&tx).await {
                Ok(()) => sweep.completed += 1,
                Err(message) => {
                    let new_count = tx.retry_count + 1;
                    if new_count < tx.max_retries {
                        let next_retry_at =
                            Utc::now() + backoff_delay(self.config.base_interval(), tx.retry_count);
                        self.store
                            .reschedule_retry(&tx.reference, new_count, next_retry_at, &message)
                            .await?;
                        warn!(
                            reference = %tx.reference,
                            retry_count = new_count,
                            next_retry_at = %next_retry_at,
                            "retry failed, rescheduled"
                        );
                        sweep.rescheduled += 1;
                    } else {
                        self.store
                            .exhaust_retries(&tx.reference, new_count, &message)
                            .await?;
                        error!(
                            reference = %tx.reference,
                            retry_count = new_count,
                            "retries exhausted, transaction permanently failed"
                        );
                        sweep.exhausted += 1;
                    }
                }
            }
        }

        Ok(sweep)
    }

    /// One re-attempt of the core-banking leg. The stored reference rides
    /// along as the idempotency key, so a transfer that actually landed on
    /// a previous attempt is collapsed by the gateway instead of repeated.
    async fn retry_transfer(&self, tx: &FinancialTransaction) -> Result<(), String> {
        let instruction = TransferInstruction {
            from_account: tx.from_account.clone(),
            to_account: tx.to_account.clone(),
            amount: tx.amount,
            currency: tx.currency.clone(),
            reference: Some(tx.reference.clone()),
            description: tx.description.clone(),
            transfer_type: LedgerTransferType::Internal,
        };

        let outcome = match timeout(self.bank_timeout, self.bank.transfer(instruction)).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => return Err(e.to_string()),
            Err(_) => return Err("core-banking gateway did not respond in time".to_string()),
        };

        if !outcome.success {
            return Err(outcome.message);
        }

        self.store
            .complete(
                &tx.reference,
                super::types::TransactionStatus::Processing,
                None,
                "retry succeeded",
            )
            .await
            .map_err(|e| e.to_string())?;

        info!(reference = %tx.reference, retry_count = tx.retry_count, "retry settled transfer");
        Ok(())
    }
}

/// Background loop invoking the scheduler on a fixed interval.
pub struct RetryWorker {
    scheduler: Arc<RetryScheduler>,
    interval: Duration,
}

impl RetryWorker {
    pub fn new(scheduler: Arc<RetryScheduler>, interval: Duration) -> Self {
        Self {
            scheduler,
            interval,
        }
    }

    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.scheduler.run_due_retries().await {
                Ok(sweep) if sweep.scanned > 0 => {
                    info!(
                        scanned = sweep.scanned,
                        completed = sweep.completed,
                        rescheduled = sweep.rescheduled,
                        exhausted = sweep.exhausted,
                        skipped = sweep.skipped,
                        "retry sweep finished"
                    );
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "retry sweep failed"),
            }
        }
    }
}
