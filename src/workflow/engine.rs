//! Workflow Step State Machine
//!
//! Drives one execution through its definition's ordered steps, invoking
//! the OTP sub-engine and the fund movement coordinator as step handlers.
//! Cursor advancement and terminal transition are the only two durable
//! mutations; everything else lives in the session context, so a crash
//! before cursor persistence safely replays the same step.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{info, warn};

use super::api::ApiDispatcher;
use super::otp::{OtpEngine, OtpVerdict};
use super::store::WorkflowStore;
use super::template::{resolve_params, resolve_template};
use super::types::{
    ExecutionId, ExecutionStatus, StepConfig, StepId, StepOutcome, StepType, TriggerPhase,
    WorkflowDefinition, WorkflowExecution, WorkflowId, WorkflowStep,
};
use crate::error::EngineError;
use crate::funds::{BillPaymentRequest, DirectTransferRequest, FundCoordinator, TransactionStatus};
use crate::session::{ContextMap, SessionStore};

pub struct WorkflowEngine {
    store: Arc<dyn WorkflowStore>,
    sessions: Arc<dyn SessionStore>,
    funds: Arc<FundCoordinator>,
    otp: OtpEngine,
    api: Arc<dyn ApiDispatcher>,
    session_ttl: Duration,
    default_currency: String,
}

impl WorkflowEngine {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        sessions: Arc<dyn SessionStore>,
        funds: Arc<FundCoordinator>,
        otp: OtpEngine,
        api: Arc<dyn ApiDispatcher>,
        session_ttl: Duration,
        default_currency: &str,
    ) -> Self {
        Self {
            store,
            sessions,
            funds,
            otp,
            api,
            session_ttl,
            default_currency: default_currency.to_string(),
        }
    }

    /// Create a persisted execution positioned at the first active step and
    /// seed the session context.
    pub async fn start_execution(
        &self,
        workflow_id: WorkflowId,
        user_id: i64,
        session_id: &str,
        initial_context: ContextMap,
    ) -> Result<WorkflowExecution, EngineError> {
        let definition = self
            .store
            .definition(workflow_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("workflow {}", workflow_id)))?;
        definition.validate()?;
        if !definition.is_active {
            return Err(EngineError::Configuration(format!(
                "workflow {} is not active",
                workflow_id
            )));
        }

        let first_step = definition.first_active_step().ok_or_else(|| {
            EngineError::Configuration(format!("workflow {} has no active steps", workflow_id))
        })?;

        let execution = WorkflowExecution::new(workflow_id, user_id, session_id, first_step.id);
        self.store.insert_execution(&execution).await?;
        self.sessions
            .set(session_id, initial_context, self.session_ttl)
            .await?;

        info!(
            execution_id = %execution.id,
            workflow_id,
            user_id,
            first_step = first_step.id,
            "workflow execution started"
        );
        Ok(execution)
    }

    /// Single entry point for BEFORE and AFTER step triggers.
    ///
    /// Pre-dispatch rejections (unknown execution, terminal status, stale
    /// cursor, expired session, unresolved templates) surface as `Err`;
    /// handler-level failures (wrong OTP, declined payment) come back as
    /// `Ok(StepOutcome { success: false, .. })` so the caller can render
    /// them without losing the refund/attempt detail.
    pub async fn execute_step(
        &self,
        execution_id: ExecutionId,
        step_id: StepId,
        input: ContextMap,
        phase: TriggerPhase,
    ) -> Result<StepOutcome, EngineError> {
        let execution = self
            .store
            .execution(execution_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("execution {}", execution_id)))?;

        if execution.status != ExecutionStatus::InProgress {
            return Err(EngineError::Concurrency(format!(
                "execution {} is {}",
                execution_id, execution.status
            )));
        }

        let mut context = self
            .sessions
            .get(&execution.session_id)
            .await?
            .ok_or_else(|| {
                EngineError::Concurrency("session expired; execution abandoned".to_string())
            })?;
        // Sliding TTL: every step interaction keeps the session alive.
        self.sessions
            .extend(&execution.session_id, self.session_ttl)
            .await?;

        let definition = self
            .store
            .definition(execution.workflow_id)
            .await?
            .ok_or_else(|| {
                EngineError::Configuration(format!(
                    "workflow {} missing for execution {}",
                    execution.workflow_id, execution_id
                ))
            })?;
        let step = definition
            .step(step_id)
            .ok_or_else(|| EngineError::NotFound(format!("step {}", step_id)))?;

        if step.id != execution.current_step_id {
            return Err(EngineError::Concurrency(format!(
                "step {} is not the active step (cursor at {})",
                step_id, execution.current_step_id
            )));
        }

        // AFTER submissions carry the step's input; record it before any
        // handler so parameter templates can see it.
        if phase == TriggerPhase::After && !input.is_empty() {
            let mut partial = ContextMap::new();
            partial.insert(step.key.clone(), Value::Object(input.clone()));
            self.sessions.update(&execution.session_id, partial).await?;
            context.insert(step.key.clone(), Value::Object(input.clone()));
        }

        if !step.requires_trigger(phase) {
            return match phase {
                TriggerPhase::Before => Ok(StepOutcome::ok(None, false)),
                TriggerPhase::After => {
                    let completed = self.advance(&execution, &definition, step, &context).await?;
                    Ok(StepOutcome::ok(completed, true))
                }
            };
        }

        match step.step_type {
            StepType::Otp => self.handle_otp(&execution, &definition, step, &input, phase, &context).await,
            StepType::PostTransaction | StepType::BillTransaction => {
                if phase == TriggerPhase::Before {
                    return Ok(StepOutcome::ok(None, false));
                }
                self.handle_fund_step(&execution, &definition, step, &context).await
            }
            StepType::ApiCall | StepType::Form => {
                self.handle_api_step(&execution, &definition, step, phase, &context).await
            }
        }
    }

    /// Cancel an IN_PROGRESS execution. No compensating fund action is
    /// needed here: fund-moving steps are always last, so a cancellable
    /// execution has not moved money yet.
    pub async fn cancel_execution(
        &self,
        execution_id: ExecutionId,
        reason: &str,
    ) -> Result<WorkflowExecution, EngineError> {
        let execution = self
            .store
            .execution(execution_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("execution {}", execution_id)))?;

        if execution.status != ExecutionStatus::InProgress {
            return Err(EngineError::Concurrency(format!(
                "execution {} is already {}",
                execution_id, execution.status
            )));
        }

        if !self
            .store
            .finish_execution(execution_id, ExecutionStatus::Cancelled, None, Some(reason))
            .await?
        {
            return Err(EngineError::Concurrency(format!(
                "execution {} reached a terminal state concurrently",
                execution_id
            )));
        }
        self.sessions.clear(&execution.session_id).await?;

        info!(execution_id = %execution_id, reason = %reason, "execution cancelled");
        self.store
            .execution(execution_id)
            .await?
            .ok_or_else(|| EngineError::System(format!("execution {} vanished", execution_id)))
    }

    /// Explicitly finalize an IN_PROGRESS execution from whatever context
    /// has accumulated. Step exhaustion calls the same path internally;
    /// this surface exists for callers that drive the last step client-side.
    pub async fn complete_execution(
        &self,
        execution_id: ExecutionId,
    ) -> Result<Value, EngineError> {
        let execution = self
            .store
            .execution(execution_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("execution {}", execution_id)))?;

        if execution.status != ExecutionStatus::InProgress {
            return Err(EngineError::Concurrency(format!(
                "execution {} is {}",
                execution_id, execution.status
            )));
        }

        let context = self
            .sessions
            .get(&execution.session_id)
            .await?
            .ok_or_else(|| {
                EngineError::Concurrency("session expired; execution abandoned".to_string())
            })?;
        let definition = self
            .store
            .definition(execution.workflow_id)
            .await?
            .ok_or_else(|| {
                EngineError::Configuration(format!(
                    "workflow {} missing for execution {}",
                    execution.workflow_id, execution_id
                ))
            })?;

        self.complete_workflow(&execution, &definition, &context).await
    }

    pub async fn execution(
        &self,
        execution_id: ExecutionId,
    ) -> Result<Option<WorkflowExecution>, EngineError> {
        self.store.execution(execution_id).await
    }

    // ------------------------------------------------------------------
    // Step handlers
    // ------------------------------------------------------------------

    async fn handle_otp(
        &self,
        execution: &WorkflowExecution,
        definition: &WorkflowDefinition,
        step: &WorkflowStep,
        input: &ContextMap,
        phase: TriggerPhase,
        context: &ContextMap,
    ) -> Result<StepOutcome, EngineError> {
        match phase {
            TriggerPhase::Before => {
                self.otp.issue(execution, step).await?;
                Ok(StepOutcome::ok(Some(json!({ "issued": true })), false))
            }
            TriggerPhase::After => {
                let submitted = input
                    .get("otp")
                    .and_then(Value::as_str)
                    .ok_or_else(|| EngineError::Validation("missing 'otp' field".to_string()))?;

                match self.otp.verify(execution, step, submitted).await {
                    Ok(OtpVerdict::Verified) => {
                        let result = json!({ "verified": true });
                        let mut context = context.clone();
                        self.record_result(execution, step, &result, &mut context).await?;
                        let completed =
                            self.advance(execution, definition, step, &context).await?;
                        Ok(StepOutcome::ok(completed.or(Some(result)), true))
                    }
                    Ok(OtpVerdict::Rejected { attempts_remaining }) => {
                        let err = EngineError::Validation(format!(
                            "incorrect one-time code; {} attempts remaining",
                            attempts_remaining
                        ));
                        Ok(StepOutcome::failed(&err))
                    }
                    // Retriable-by-user-action, not workflow-fatal
                    Err(err @ (EngineError::OtpExpired | EngineError::OtpLocked)) => {
                        Ok(StepOutcome::failed(&err))
                    }
                    Err(other) => Err(other),
                }
            }
        }
    }

    async fn handle_fund_step(
        &self,
        execution: &WorkflowExecution,
        definition: &WorkflowDefinition,
        step: &WorkflowStep,
        context: &ContextMap,
    ) -> Result<StepOutcome, EngineError> {
        let transaction = match &step.config {
            StepConfig::PostTransaction {
                from_account,
                to_account,
                amount,
                description,
                ..
            } => {
                let amount = crate::money::parse_amount(&resolve_template(amount, context)?)
                    .map_err(|e| EngineError::Validation(e.to_string()))?;
                let description = match description {
                    Some(template) => resolve_template(template, context)?,
                    None => format!("{} transfer", definition.name),
                };
                let request = DirectTransferRequest {
                    from_account: resolve_template(from_account, context)?,
                    to_account: resolve_template(to_account, context)?,
                    amount,
                    currency: self.currency(context),
                    description,
                    execution_id: Some(execution.id.to_string()),
                    max_retries: step.retry.map(|r| r.max_retries),
                };
                self.funds.transfer_direct(request).await?
            }
            StepConfig::BillTransaction {
                biller,
                account_number,
                amount,
            } => {
                let amount = crate::money::parse_amount(&resolve_template(amount, context)?)
                    .map_err(|e| EngineError::Validation(e.to_string()))?;
                let user_account = context
                    .get("user_account")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        EngineError::Validation("missing 'user_account' in context".to_string())
                    })?
                    .to_string();
                let metadata = context
                    .get(&step.key)
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();

                let request = BillPaymentRequest {
                    user_account,
                    biller: biller.clone(),
                    account_number: resolve_template(account_number, context)?,
                    amount,
                    currency: self.currency(context),
                    metadata,
                    execution_id: Some(execution.id.to_string()),
                };
                match self.funds.pay_biller(request).await {
                    Ok(transaction) => transaction,
                    // Hold or record failed: nothing durable points at this
                    // step, surface the failure as retriable step feedback.
                    Err(err @ (EngineError::ExternalService(_) | EngineError::Consistency(_))) => {
                        return Ok(StepOutcome::failed(&err));
                    }
                    Err(other) => return Err(other),
                }
            }
            _ => {
                return Err(EngineError::Configuration(format!(
                    "step {} has no fund-movement config",
                    step.id
                )))
            }
        };

        if transaction.status == TransactionStatus::Completed {
            let result = json!({
                "reference": transaction.reference,
                "external_reference": transaction.external_reference,
                "status": transaction.status.as_str(),
                "amount": transaction.amount.to_string(),
                "currency": transaction.currency,
                "from_account": transaction.from_account,
                "to_account": transaction.to_account,
            });
            let mut context = context.clone();
            self.record_result(execution, step, &result, &mut context).await?;
            let completed = self.advance(execution, definition, step, &context).await?;
            Ok(StepOutcome::ok(completed.or(Some(result)), true))
        } else {
            // Financial failures always say whether funds came back.
            let message = transaction
                .error_message
                .clone()
                .unwrap_or_else(|| "transaction failed".to_string());
            warn!(
                execution_id = %execution.id,
                step_id = step.id,
                reference = %transaction.reference,
                error = %message,
                "fund-moving step failed"
            );
            Ok(StepOutcome::failed(&EngineError::ExternalService(message)))
        }
    }

    async fn handle_api_step(
        &self,
        execution: &WorkflowExecution,
        definition: &WorkflowDefinition,
        step: &WorkflowStep,
        phase: TriggerPhase,
        context: &ContextMap,
    ) -> Result<StepOutcome, EngineError> {
        let (endpoint, method, params) = match &step.config {
            StepConfig::ApiCall {
                endpoint,
                method,
                params,
            } => (endpoint.clone(), method.clone(), resolve_params(params, context)?),
            _ => {
                return Err(EngineError::Configuration(format!(
                    "step {} has no trigger endpoint",
                    step.id
                )))
            }
        };

        match self.api.call(&endpoint, &method, &params).await {
            Ok(response) => {
                let mut context = context.clone();
                self.record_result(execution, step, &response, &mut context).await?;
                if phase == TriggerPhase::After {
                    let completed = self.advance(execution, definition, step, &context).await?;
                    Ok(StepOutcome::ok(completed.or(Some(response)), true))
                } else {
                    Ok(StepOutcome::ok(Some(response), false))
                }
            }
            // A failed call rejects the step input, not the workflow; the
            // client may correct and resubmit.
            Err(err) => Ok(StepOutcome::failed(&err)),
        }
    }

    // ------------------------------------------------------------------
    // Cursor movement and completion
    // ------------------------------------------------------------------

    /// Store a handler's output under `<key>_result`, durably in the
    /// session and in the local view used by later templates.
    async fn record_result(
        &self,
        execution: &WorkflowExecution,
        step: &WorkflowStep,
        result: &Value,
        context: &mut ContextMap,
    ) -> Result<(), EngineError> {
        let key = format!("{}_result", step.key);
        let mut partial = ContextMap::new();
        partial.insert(key.clone(), result.clone());
        self.sessions.update(&execution.session_id, partial).await?;
        context.insert(key, result.clone());
        Ok(())
    }

    /// Advance the cursor to the next active step, or complete the workflow
    /// when none remains. Returns the final result on completion.
    async fn advance(
        &self,
        execution: &WorkflowExecution,
        definition: &WorkflowDefinition,
        step: &WorkflowStep,
        context: &ContextMap,
    ) -> Result<Option<Value>, EngineError> {
        match definition.next_active_step_after(step.order) {
            Some(next) => {
                if !self
                    .store
                    .advance_cursor(execution.id, step.id, next.id)
                    .await?
                {
                    return Err(EngineError::Concurrency(format!(
                        "cursor for execution {} moved concurrently",
                        execution.id
                    )));
                }
                Ok(None)
            }
            None => {
                let final_result = self.complete_workflow(execution, definition, context).await?;
                Ok(Some(final_result))
            }
        }
    }

    /// Resolve the final representation and terminate the execution. The
    /// session context is always cleared on terminal transition; clearing
    /// runs after the outcome is already fixed and is idempotent.
    async fn complete_workflow(
        &self,
        execution: &WorkflowExecution,
        definition: &WorkflowDefinition,
        context: &ContextMap,
    ) -> Result<Value, EngineError> {
        // Prefer the last financial/biller result a step handler computed.
        let mut final_result = definition
            .fund_steps()
            .iter()
            .rev()
            .find_map(|step| context.get(&format!("{}_result", step.key)).cloned());

        // Fall back to an explicit final submission when configured.
        if final_result.is_none() {
            if let Some(finalization) = &definition.finalization {
                let params = match resolve_params(&finalization.params, context) {
                    Ok(params) => params,
                    Err(err) => {
                        self.finish_failed(execution, &err).await?;
                        return Err(err);
                    }
                };
                match self
                    .api
                    .call(&finalization.endpoint, &finalization.method, &params)
                    .await
                {
                    Ok(response) => final_result = Some(response),
                    Err(err) => {
                        self.finish_failed(execution, &err).await?;
                        return Err(err);
                    }
                }
            }
        }

        let final_result = final_result.unwrap_or(Value::Null);
        self.store
            .finish_execution(
                execution.id,
                ExecutionStatus::Completed,
                Some(&final_result),
                None,
            )
            .await?;
        self.sessions.clear(&execution.session_id).await?;

        info!(execution_id = %execution.id, "workflow execution completed");
        Ok(final_result)
    }

    async fn finish_failed(
        &self,
        execution: &WorkflowExecution,
        err: &EngineError,
    ) -> Result<(), EngineError> {
        self.store
            .finish_execution(
                execution.id,
                ExecutionStatus::Failed,
                None,
                Some(&err.to_string()),
            )
            .await?;
        self.sessions.clear(&execution.session_id).await?;
        warn!(execution_id = %execution.id, error = %err, "workflow execution failed to finalize");
        Ok(())
    }

    fn currency(&self, context: &ContextMap) -> String {
        context
            .get("currency")
            .and_then(Value::as_str)
            .unwrap_or(&self.default_currency)
            .to_string()
    }
}
