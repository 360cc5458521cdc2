//! Shared test harness: the full engine wired against in-memory
//! collaborators, with every failure knob exposed.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;

use kwachaflow::config::{FundsConfig, OtpConfig, RetryConfig};
use kwachaflow::corebank::MockBankClient;
use kwachaflow::funds::{FundCoordinator, MemoryTransactionStore, RetryScheduler};
use kwachaflow::notify::MockNotifier;
use kwachaflow::provider::{MockProvider, ProviderGateway, ProviderRegistry};
use kwachaflow::session::{ContextMap, MemorySessionStore};
use kwachaflow::workflow::{
    ExecutionMode, MemoryWorkflowStore, MockApiDispatcher, OtpEngine, StepConfig, TriggerTiming,
    WorkflowDefinition, WorkflowEngine, WorkflowStep,
};

pub const SUSPENSE: &str = "SUSPENSE-001";
pub const USER_ACCOUNT: &str = "1001";
pub const USER_ID: i64 = 42;

pub fn dec(s: &str) -> Decimal {
    Decimal::from_str_exact(s).unwrap()
}

pub fn funds_config() -> FundsConfig {
    FundsConfig {
        suspense_account: SUSPENSE.to_string(),
        currency: "MWK".to_string(),
        corebank_endpoint: "http://unused".to_string(),
        bank_timeout_ms: 2_000,
        // Short so timeout tests stay fast
        provider_timeout_ms: 100,
    }
}

pub fn retry_config() -> RetryConfig {
    RetryConfig {
        base_interval_secs: 120,
        max_retries: 3,
        sweep_interval_secs: 60,
        sweep_limit: 100,
    }
}

pub struct Harness {
    pub bank: Arc<MockBankClient>,
    pub provider: Arc<MockProvider>,
    pub notifier: Arc<MockNotifier>,
    pub sessions: Arc<MemorySessionStore>,
    pub transactions: Arc<MemoryTransactionStore>,
    pub workflows: Arc<MemoryWorkflowStore>,
    pub api: Arc<MockApiDispatcher>,
    pub coordinator: Arc<FundCoordinator>,
    pub engine: WorkflowEngine,
    pub scheduler: RetryScheduler,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_provider(Arc::new(MockProvider::new("water-board")))
    }

    pub fn with_provider(provider: Arc<MockProvider>) -> Self {
        let bank = Arc::new(MockBankClient::new());
        let notifier = Arc::new(MockNotifier::new());
        let sessions = Arc::new(MemorySessionStore::new());
        let transactions = Arc::new(MemoryTransactionStore::new());
        let workflows = Arc::new(MemoryWorkflowStore::new());
        let api = Arc::new(MockApiDispatcher::new());

        let mut registry = ProviderRegistry::new();
        registry.register(provider.name(), provider.clone());

        let coordinator = Arc::new(FundCoordinator::new(
            bank.clone(),
            registry,
            transactions.clone(),
            funds_config(),
            retry_config(),
        ));

        let otp = OtpEngine::new(sessions.clone(), notifier.clone(), OtpConfig::default());
        let engine = WorkflowEngine::new(
            workflows.clone(),
            sessions.clone(),
            coordinator.clone(),
            otp,
            api.clone(),
            Duration::from_secs(300),
            "MWK",
        );

        let scheduler = RetryScheduler::new(
            bank.clone(),
            transactions.clone(),
            retry_config(),
            Duration::from_secs(2),
        );

        Self {
            bank,
            provider,
            notifier,
            sessions,
            transactions,
            workflows,
            api,
            coordinator,
            engine,
            scheduler,
        }
    }

    /// Seed the customer account and enable SMS for the test user.
    pub fn seed_defaults(&self) {
        self.bank.credit(USER_ACCOUNT, dec("10000"));
        self.notifier
            .enable(USER_ID, &[kwachaflow::notify::Channel::Sms]);
    }

    /// Starting context every workflow test uses.
    pub fn initial_context(&self) -> ContextMap {
        let mut context = ContextMap::new();
        context.insert(
            "user_account".to_string(),
            serde_json::Value::String(USER_ACCOUNT.to_string()),
        );
        context
    }
}

fn step(
    id: i64,
    key: &str,
    order: u32,
    execution_mode: ExecutionMode,
    trigger_timing: TriggerTiming,
    config: StepConfig,
) -> WorkflowStep {
    WorkflowStep {
        id,
        key: key.to_string(),
        step_type: config.step_type(),
        order,
        execution_mode,
        trigger_timing,
        config,
        retry: None,
        is_active: true,
    }
}

pub fn form_step(id: i64, order: u32) -> WorkflowStep {
    step(
        id,
        "form",
        order,
        ExecutionMode::ClientOnly,
        TriggerTiming::AfterStep,
        StepConfig::Form {},
    )
}

pub fn otp_step(id: i64, order: u32) -> WorkflowStep {
    step(
        id,
        "verify",
        order,
        ExecutionMode::ServerSync,
        TriggerTiming::Both,
        StepConfig::Otp { message: None },
    )
}

pub fn bill_step(id: i64, order: u32) -> WorkflowStep {
    step(
        id,
        "payment",
        order,
        ExecutionMode::ServerSync,
        TriggerTiming::AfterStep,
        StepConfig::BillTransaction {
            biller: "water-board".to_string(),
            account_number: "{form.meter}".to_string(),
            amount: "{form.amount}".to_string(),
        },
    )
}

pub fn transfer_step(id: i64, order: u32) -> WorkflowStep {
    step(
        id,
        "payment",
        order,
        ExecutionMode::ServerSync,
        TriggerTiming::AfterStep,
        StepConfig::PostTransaction {
            transfer_type: "INTERNAL".to_string(),
            from_account: "{user_account}".to_string(),
            to_account: "{form.to_account}".to_string(),
            amount: "{form.amount}".to_string(),
            description: None,
        },
    )
}

pub fn definition(id: i64, steps: Vec<WorkflowStep>) -> WorkflowDefinition {
    WorkflowDefinition {
        id,
        name: "pay-water-bill".to_string(),
        version: 1,
        is_active: true,
        steps,
        finalization: None,
    }
}

/// The canonical FORM -> OTP -> BILL_TRANSACTION definition.
pub fn bill_workflow() -> WorkflowDefinition {
    definition(1, vec![form_step(1, 10), otp_step(2, 20), bill_step(3, 30)])
}

pub fn form_input(amount: &str, meter: &str) -> ContextMap {
    let mut input = ContextMap::new();
    input.insert("amount".to_string(), serde_json::Value::String(amount.to_string()));
    input.insert("meter".to_string(), serde_json::Value::String(meter.to_string()));
    input
}

pub fn otp_input(code: &str) -> ContextMap {
    let mut input = ContextMap::new();
    input.insert("otp".to_string(), serde_json::Value::String(code.to_string()));
    input
}

/// Pull the issued code back out of the captured notification.
pub fn issued_code(notifier: &MockNotifier) -> String {
    notifier
        .last_message_to(USER_ID)
        .expect("an OTP message was dispatched")
        .chars()
        .filter(|c| c.is_ascii_digit())
        .take(6)
        .collect()
}
