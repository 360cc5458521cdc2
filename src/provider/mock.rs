//! Scriptable in-memory provider for tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{PaymentOutcome, PaymentRequest, ProviderGateway};
use crate::error::EngineError;

pub struct MockProvider {
    name: String,
    debit_override: AtomicBool,
    /// Scripted outcomes consumed in order; empty means auto-accept.
    script: Mutex<VecDeque<PaymentOutcome>>,
    /// Artificial latency before answering, for timeout tests.
    delay: Mutex<Option<Duration>>,
    requests: Mutex<Vec<PaymentRequest>>,
    ref_seq: AtomicU64,
}

impl MockProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            debit_override: AtomicBool::new(false),
            script: Mutex::new(VecDeque::new()),
            delay: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
            ref_seq: AtomicU64::new(1),
        }
    }

    pub fn with_debit_override(self) -> Self {
        self.debit_override.store(true, Ordering::Relaxed);
        self
    }

    /// Queue an outcome for the next call.
    pub fn push_outcome(&self, outcome: PaymentOutcome) {
        self.script.lock().unwrap().push_back(outcome);
    }

    /// Make the next calls decline with `error`.
    pub fn fail_next(&self, error: &str, status_code: Option<u16>) {
        self.push_outcome(PaymentOutcome::declined(error, status_code));
    }

    /// Delay every response; pair with a short coordinator timeout.
    pub fn respond_after(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn requests(&self) -> Vec<PaymentRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl ProviderGateway for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_debit_override(&self) -> bool {
        self.debit_override.load(Ordering::Relaxed)
    }

    async fn process_payment(
        &self,
        request: PaymentRequest,
    ) -> Result<PaymentOutcome, EngineError> {
        self.requests.lock().unwrap().push(request);

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(scripted) = self.script.lock().unwrap().pop_front() {
            return Ok(scripted);
        }

        let n = self.ref_seq.fetch_add(1, Ordering::Relaxed);
        Ok(PaymentOutcome::accepted(
            format!("{}-{:05}", self.name.to_uppercase(), n),
            None,
        ))
    }
}
