//! Workflow definition and execution types.
//!
//! Definitions are immutable-per-version and consumed read-only; the step
//! list's strictly-increasing `order` is the only valid progression path.
//! Step behavior is driven by a tagged config variant checked at load time,
//! so configuration mistakes fail when a definition is loaded instead of
//! mid-payment.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, StructuredError};

/// Workflow execution id. ULID-based: sortable and needs no coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExecutionId(ulid::Ulid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(ulid::Ulid::new())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ExecutionId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(ulid::Ulid::from_string(s)?))
    }
}

impl Serialize for ExecutionId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ExecutionId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

pub type WorkflowId = i64;
pub type StepId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepType {
    Form,
    Otp,
    ApiCall,
    PostTransaction,
    BillTransaction,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::Form => "FORM",
            StepType::Otp => "OTP",
            StepType::ApiCall => "API_CALL",
            StepType::PostTransaction => "POST_TRANSACTION",
            StepType::BillTransaction => "BILL_TRANSACTION",
        }
    }

    /// Steps that move money. At most one per definition, and it must be
    /// the final active step (cancellation relies on this).
    pub fn moves_funds(&self) -> bool {
        matches!(self, StepType::PostTransaction | StepType::BillTransaction)
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    ClientOnly,
    ServerSync,
    ServerAsync,
    ServerValidation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerTiming {
    BeforeStep,
    AfterStep,
    Both,
    Immediate,
}

/// Which leg of a step interaction is being executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerPhase {
    Before,
    After,
}

impl TriggerTiming {
    /// Whether a step configured with this timing fires at `phase`.
    /// IMMEDIATE is served on the BEFORE leg, as soon as the step is current.
    pub fn fires_at(&self, phase: TriggerPhase) -> bool {
        match self {
            TriggerTiming::BeforeStep | TriggerTiming::Immediate => phase == TriggerPhase::Before,
            TriggerTiming::AfterStep => phase == TriggerPhase::After,
            TriggerTiming::Both => true,
        }
    }
}

/// Direct-flow transfer categories accepted in POST_TRANSACTION configs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    InternalTransfer,
    WalletTopup,
    OwnAccount,
}

impl FromStr for TransferKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INTERNAL" => Ok(TransferKind::InternalTransfer),
            "WALLET_TOPUP" => Ok(TransferKind::WalletTopup),
            "OWN_ACCOUNT" => Ok(TransferKind::OwnAccount),
            _ => Err(()),
        }
    }
}

/// Per-type step configuration. Template strings (`{key}` / `{key.path}`)
/// are resolved against the session context at execution time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepConfig {
    Form {},
    Otp {
        #[serde(default)]
        message: Option<String>,
    },
    ApiCall {
        endpoint: String,
        #[serde(default = "default_method")]
        method: String,
        #[serde(default)]
        params: BTreeMap<String, String>,
    },
    PostTransaction {
        transfer_type: String,
        from_account: String,
        to_account: String,
        amount: String,
        #[serde(default)]
        description: Option<String>,
    },
    BillTransaction {
        biller: String,
        account_number: String,
        amount: String,
    },
}

fn default_method() -> String {
    "POST".to_string()
}

impl StepConfig {
    pub fn step_type(&self) -> StepType {
        match self {
            StepConfig::Form {} => StepType::Form,
            StepConfig::Otp { .. } => StepType::Otp,
            StepConfig::ApiCall { .. } => StepType::ApiCall,
            StepConfig::PostTransaction { .. } => StepType::PostTransaction,
            StepConfig::BillTransaction { .. } => StepType::BillTransaction,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: StepId,
    /// Session-context key this step's input and result are stored under.
    pub key: String,
    pub step_type: StepType,
    pub order: u32,
    pub execution_mode: ExecutionMode,
    pub trigger_timing: TriggerTiming,
    pub config: StepConfig,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    pub is_active: bool,
}

impl WorkflowStep {
    /// Whether this step needs a server trigger at `phase`.
    pub fn requires_trigger(&self, phase: TriggerPhase) -> bool {
        self.execution_mode != ExecutionMode::ClientOnly && self.trigger_timing.fires_at(phase)
    }
}

/// Optional final API submission run at completion when no fund-moving step
/// already produced the final result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizationConfig {
    pub endpoint: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: WorkflowId,
    pub name: String,
    /// Incremented on structural edits by the configuration tooling.
    pub version: u32,
    pub is_active: bool,
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub finalization: Option<FinalizationConfig>,
}

impl WorkflowDefinition {
    /// Load-time validation. A definition that passes can only fail at
    /// execution time for external reasons, not configuration ones.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.steps.is_empty() {
            return Err(EngineError::Configuration(format!(
                "workflow {} has no steps",
                self.id
            )));
        }

        let mut seen_keys = HashSet::new();
        let mut last_order: Option<u32> = None;
        for step in &self.steps {
            if let Some(prev) = last_order {
                if step.order <= prev {
                    return Err(EngineError::Configuration(format!(
                        "workflow {}: step order must be strictly increasing (step {} has order {})",
                        self.id, step.id, step.order
                    )));
                }
            }
            last_order = Some(step.order);

            if !seen_keys.insert(step.key.as_str()) {
                return Err(EngineError::Configuration(format!(
                    "workflow {}: duplicate step key '{}'",
                    self.id, step.key
                )));
            }

            if step.config.step_type() != step.step_type {
                return Err(EngineError::Configuration(format!(
                    "workflow {}: step {} is {} but its config is {}",
                    self.id,
                    step.id,
                    step.step_type,
                    step.config.step_type()
                )));
            }

            match &step.config {
                StepConfig::Form {} => {
                    if step.execution_mode != ExecutionMode::ClientOnly {
                        return Err(EngineError::Configuration(format!(
                            "workflow {}: FORM step {} must be CLIENT_ONLY",
                            self.id, step.id
                        )));
                    }
                }
                StepConfig::Otp { .. } => {
                    if step.trigger_timing != TriggerTiming::Both {
                        return Err(EngineError::Configuration(format!(
                            "workflow {}: OTP step {} must trigger on BOTH legs",
                            self.id, step.id
                        )));
                    }
                }
                StepConfig::ApiCall { endpoint, .. } => {
                    if endpoint.is_empty() {
                        return Err(EngineError::Configuration(format!(
                            "workflow {}: API_CALL step {} has no endpoint",
                            self.id, step.id
                        )));
                    }
                }
                StepConfig::PostTransaction { transfer_type, .. } => {
                    if TransferKind::from_str(transfer_type).is_err() {
                        return Err(EngineError::Configuration(format!(
                            "workflow {}: step {} has unknown transfer type '{}'",
                            self.id, step.id, transfer_type
                        )));
                    }
                }
                StepConfig::BillTransaction { biller, .. } => {
                    if biller.is_empty() {
                        return Err(EngineError::Configuration(format!(
                            "workflow {}: step {} has no biller",
                            self.id, step.id
                        )));
                    }
                }
            }
        }

        // Any active fund-moving step must be the last active step:
        // cancellation never has to compensate because nothing irreversible
        // can have happened before the final step.
        let active: Vec<&WorkflowStep> = self.steps.iter().filter(|s| s.is_active).collect();
        for (idx, step) in active.iter().enumerate() {
            if step.step_type.moves_funds() && idx + 1 != active.len() {
                return Err(EngineError::Configuration(format!(
                    "workflow {}: fund-moving step {} must be the final active step",
                    self.id, step.id
                )));
            }
        }

        Ok(())
    }

    pub fn step(&self, step_id: StepId) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    /// First active step by ascending order.
    pub fn first_active_step(&self) -> Option<&WorkflowStep> {
        self.steps.iter().filter(|s| s.is_active).min_by_key(|s| s.order)
    }

    /// Next active step strictly after `order`, skipping inactive steps.
    pub fn next_active_step_after(&self, order: u32) -> Option<&WorkflowStep> {
        self.steps
            .iter()
            .filter(|s| s.is_active && s.order > order)
            .min_by_key(|s| s.order)
    }

    /// Active fund-moving steps, in order. Used at completion to pick the
    /// final result from context.
    pub fn fund_steps(&self) -> Vec<&WorkflowStep> {
        self.steps
            .iter()
            .filter(|s| s.is_active && s.step_type.moves_funds())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i16)]
pub enum ExecutionStatus {
    InProgress = 1,
    Completed = 2,
    Failed = 3,
    Cancelled = 4,
}

impl ExecutionStatus {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(ExecutionStatus::InProgress),
            2 => Some(ExecutionStatus::Completed),
            3 => Some(ExecutionStatus::Failed),
            4 => Some(ExecutionStatus::Cancelled),
            _ => None,
        }
    }

    /// Status transitions are monotonic: nothing leaves a terminal state.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        *self != ExecutionStatus::InProgress
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::InProgress => "IN_PROGRESS",
            ExecutionStatus::Completed => "COMPLETED",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One in-flight or completed workflow run. Never deleted, only terminated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub user_id: i64,
    pub session_id: String,
    pub status: ExecutionStatus,
    /// The single advancing cursor.
    pub current_step_id: StepId,
    pub final_result: Option<Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowExecution {
    pub fn new(
        workflow_id: WorkflowId,
        user_id: i64,
        session_id: &str,
        first_step_id: StepId,
    ) -> Self {
        Self {
            id: ExecutionId::new(),
            workflow_id,
            user_id,
            session_id: session_id.to_string(),
            status: ExecutionStatus::InProgress,
            current_step_id: first_step_id,
            final_result: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// Result of one `execute_step` call, serialized straight to the client.
#[derive(Debug, Clone, Serialize)]
pub struct StepOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured_error: Option<StructuredError>,
    /// Whether the client should move to the next step.
    pub should_proceed: bool,
}

impl StepOutcome {
    pub fn ok(output: Option<Value>, should_proceed: bool) -> Self {
        Self {
            success: true,
            output,
            error: None,
            structured_error: None,
            should_proceed,
        }
    }

    pub fn failed(err: &EngineError) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(err.to_string()),
            structured_error: Some(err.to_structured()),
            should_proceed: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: StepId, order: u32, config: StepConfig) -> WorkflowStep {
        let step_type = config.step_type();
        let (execution_mode, trigger_timing) = match step_type {
            StepType::Form => (ExecutionMode::ClientOnly, TriggerTiming::AfterStep),
            StepType::Otp => (ExecutionMode::ServerSync, TriggerTiming::Both),
            _ => (ExecutionMode::ServerSync, TriggerTiming::AfterStep),
        };
        WorkflowStep {
            id,
            key: format!("step_{}", id),
            step_type,
            order,
            execution_mode,
            trigger_timing,
            config,
            retry: None,
            is_active: true,
        }
    }

    fn transfer_config() -> StepConfig {
        StepConfig::PostTransaction {
            transfer_type: "INTERNAL".to_string(),
            from_account: "{user_account}".to_string(),
            to_account: "{form.to_account}".to_string(),
            amount: "{form.amount}".to_string(),
            description: None,
        }
    }

    fn definition(steps: Vec<WorkflowStep>) -> WorkflowDefinition {
        WorkflowDefinition {
            id: 1,
            name: "transfer".to_string(),
            version: 1,
            is_active: true,
            steps,
            finalization: None,
        }
    }

    #[test]
    fn test_valid_definition_passes() {
        let def = definition(vec![
            step(1, 10, StepConfig::Form {}),
            step(2, 20, StepConfig::Otp { message: None }),
            step(3, 30, transfer_config()),
        ]);
        assert!(def.validate().is_ok());
    }

    #[test]
    fn test_non_increasing_order_rejected() {
        let def = definition(vec![
            step(1, 20, StepConfig::Form {}),
            step(2, 20, StepConfig::Otp { message: None }),
        ]);
        let err = def.validate().unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
        assert!(err.to_string().contains("strictly increasing"));
    }

    #[test]
    fn test_fund_step_must_be_last() {
        let def = definition(vec![
            step(1, 10, transfer_config()),
            step(2, 20, StepConfig::Form {}),
        ]);
        let err = def.validate().unwrap_err();
        assert!(err.to_string().contains("final active step"));

        // An inactive trailing step does not save it
        let mut def = definition(vec![
            step(1, 10, transfer_config()),
            step(2, 20, StepConfig::Form {}),
        ]);
        def.steps[1].is_active = false;
        assert!(def.validate().is_ok());
    }

    #[test]
    fn test_unknown_transfer_type_rejected_at_load() {
        let mut config = transfer_config();
        if let StepConfig::PostTransaction { transfer_type, .. } = &mut config {
            *transfer_type = "TELEPORT".to_string();
        }
        let def = definition(vec![step(1, 10, config)]);
        assert!(def.validate().unwrap_err().to_string().contains("TELEPORT"));
    }

    #[test]
    fn test_config_type_mismatch_rejected() {
        let mut s = step(1, 10, StepConfig::Form {});
        s.step_type = StepType::Otp;
        s.trigger_timing = TriggerTiming::Both;
        let def = definition(vec![s]);
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_next_active_step_skips_inactive() {
        let mut steps = vec![
            step(1, 10, StepConfig::Form {}),
            step(2, 20, StepConfig::Otp { message: None }),
            step(3, 30, transfer_config()),
        ];
        steps[1].is_active = false;
        let def = definition(steps);

        assert_eq!(def.first_active_step().unwrap().id, 1);
        assert_eq!(def.next_active_step_after(10).unwrap().id, 3);
        assert!(def.next_active_step_after(30).is_none());
    }

    #[test]
    fn test_trigger_timing_phases() {
        assert!(TriggerTiming::BeforeStep.fires_at(TriggerPhase::Before));
        assert!(!TriggerTiming::BeforeStep.fires_at(TriggerPhase::After));
        assert!(TriggerTiming::AfterStep.fires_at(TriggerPhase::After));
        assert!(TriggerTiming::Both.fires_at(TriggerPhase::Before));
        assert!(TriggerTiming::Both.fires_at(TriggerPhase::After));
        assert!(TriggerTiming::Immediate.fires_at(TriggerPhase::Before));
    }

    #[test]
    fn test_step_config_serde_tags() {
        let config: StepConfig = serde_json::from_value(serde_json::json!({
            "type": "BILL_TRANSACTION",
            "biller": "water-board",
            "account_number": "{form.meter}",
            "amount": "{form.amount}"
        }))
        .unwrap();
        assert_eq!(config.step_type(), StepType::BillTransaction);

        let json = serde_json::to_value(StepConfig::Form {}).unwrap();
        assert_eq!(json.get("type").unwrap(), "FORM");
    }

    #[test]
    fn test_execution_id_roundtrip() {
        let id = ExecutionId::new();
        let parsed: ExecutionId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_execution_status_monotonic_terminals() {
        assert!(!ExecutionStatus::InProgress.is_terminal());
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
    }
}
