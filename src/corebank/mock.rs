//! In-memory core-banking gateway for tests and local development.
//!
//! Keeps a real (if tiny) double-entry ledger so the balance-conservation
//! properties can be asserted against it, deduplicates caller references
//! the way the production gateway does, and exposes scripted failure knobs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;

use super::{CoreBankClient, TransferInstruction, TransferOutcome};
use crate::error::EngineError;

pub struct MockBankClient {
    balances: DashMap<String, Decimal>,
    /// Successful transfers keyed by caller reference, for dedup.
    completed: DashMap<String, TransferOutcome>,
    /// Scripted hard failures keyed by destination account.
    fail_credits_to: DashMap<String, String>,
    /// Every instruction seen, in order.
    journal: Mutex<Vec<TransferInstruction>>,
    ref_seq: AtomicU64,
}

impl MockBankClient {
    pub fn new() -> Self {
        Self {
            balances: DashMap::new(),
            completed: DashMap::new(),
            fail_credits_to: DashMap::new(),
            journal: Mutex::new(Vec::new()),
            ref_seq: AtomicU64::new(1),
        }
    }

    /// Seed an account balance.
    pub fn credit(&self, account: &str, amount: Decimal) {
        *self.balances.entry(account.to_string()).or_insert(Decimal::ZERO) += amount;
    }

    pub fn balance(&self, account: &str) -> Decimal {
        self.balances
            .get(account)
            .map(|b| *b)
            .unwrap_or(Decimal::ZERO)
    }

    /// Script a gateway rejection for any transfer crediting `account`.
    pub fn fail_credits_to(&self, account: &str, error_code: &str) {
        self.fail_credits_to
            .insert(account.to_string(), error_code.to_string());
    }

    /// Remove a scripted rejection.
    pub fn heal_credits_to(&self, account: &str) {
        self.fail_credits_to.remove(account);
    }

    /// All instructions seen so far.
    pub fn journal(&self) -> Vec<TransferInstruction> {
        self.journal.lock().unwrap().clone()
    }

    /// Count of instructions matching a predicate.
    pub fn count_transfers<F: Fn(&TransferInstruction) -> bool>(&self, pred: F) -> usize {
        self.journal.lock().unwrap().iter().filter(|i| pred(i)).count()
    }

    fn next_reference(&self) -> String {
        format!("CBS-{:07}", self.ref_seq.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for MockBankClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoreBankClient for MockBankClient {
    async fn transfer(
        &self,
        instruction: TransferInstruction,
    ) -> Result<TransferOutcome, EngineError> {
        self.journal.lock().unwrap().push(instruction.clone());

        // Reference dedup: a repeated caller reference returns the recorded
        // outcome without moving funds again.
        if let Some(reference) = &instruction.reference {
            if let Some(prior) = self.completed.get(reference) {
                return Ok(prior.clone());
            }
        }

        if let Some(code) = self.fail_credits_to.get(&instruction.to_account) {
            return Ok(TransferOutcome::rejected(
                code.clone(),
                format!("gateway rejected credit to {}", instruction.to_account),
            ));
        }

        let available = self.balance(&instruction.from_account);
        if available < instruction.amount {
            return Ok(TransferOutcome::rejected(
                "INSUFFICIENT_FUNDS",
                format!(
                    "available {} is less than requested {}",
                    available, instruction.amount
                ),
            ));
        }

        *self
            .balances
            .entry(instruction.from_account.clone())
            .or_insert(Decimal::ZERO) -= instruction.amount;
        *self
            .balances
            .entry(instruction.to_account.clone())
            .or_insert(Decimal::ZERO) += instruction.amount;

        let gateway_reference = instruction
            .reference
            .clone()
            .unwrap_or_else(|| self.next_reference());

        let outcome = TransferOutcome::settled(
            gateway_reference.clone(),
            format!("{} transfer settled", instruction.transfer_type),
        );
        self.completed.insert(gateway_reference, outcome.clone());

        Ok(outcome)
    }
}
