//! OTP Challenge Sub-Engine
//!
//! Per `(execution, step)` state machine:
//! `NONE -> ISSUED -> {VERIFIED | EXPIRED | LOCKED}`. Codes and attempt
//! counts live in the session context store only; an OTP challenge is
//! bound to one live session and dies with it.

use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::types::{StepConfig, WorkflowExecution, WorkflowStep};
use crate::config::OtpConfig;
use crate::error::EngineError;
use crate::notify::NotificationGateway;
use crate::session::{ContextMap, SessionStore};

const DEFAULT_MESSAGE: &str = "Your one-time code is {code}. It expires in 10 minutes.";

/// Sub-state stored under `otp_<step_id>` in the session context.
#[derive(Debug, Serialize, Deserialize)]
struct OtpState {
    code: String,
    /// Unix millis.
    expires_at: i64,
    attempts: u32,
}

#[derive(Debug, PartialEq, Eq)]
pub enum OtpVerdict {
    Verified,
    /// Wrong code; the challenge stays live for another attempt.
    Rejected { attempts_remaining: u32 },
}

pub struct OtpEngine {
    sessions: Arc<dyn SessionStore>,
    notify: Arc<dyn NotificationGateway>,
    config: OtpConfig,
}

impl OtpEngine {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        notify: Arc<dyn NotificationGateway>,
        config: OtpConfig,
    ) -> Self {
        Self {
            sessions,
            notify,
            config,
        }
    }

    fn context_key(step: &WorkflowStep) -> String {
        format!("otp_{}", step.id)
    }

    /// Issue a fresh 6-digit code and dispatch it through every enabled
    /// channel. Fails closed when the user has no channel or every dispatch
    /// fails.
    pub async fn issue(
        &self,
        execution: &WorkflowExecution,
        step: &WorkflowStep,
    ) -> Result<(), EngineError> {
        let code = format!("{:06}", rand::thread_rng().gen_range(0..1_000_000u32));
        let state = OtpState {
            code: code.clone(),
            expires_at: Utc::now().timestamp_millis() + self.config.code_ttl().as_millis() as i64,
            attempts: 0,
        };

        let mut partial = ContextMap::new();
        partial.insert(
            Self::context_key(step),
            serde_json::to_value(&state)
                .map_err(|e| EngineError::System(format!("serialize otp state: {}", e)))?,
        );
        if !self.sessions.update(&execution.session_id, partial).await? {
            return Err(EngineError::Concurrency(
                "session expired; execution abandoned".to_string(),
            ));
        }

        let template = match &step.config {
            StepConfig::Otp {
                message: Some(message),
            } => message.as_str(),
            _ => DEFAULT_MESSAGE,
        };
        let message = template.replace("{code}", &code);

        let channels = self.notify.channels(execution.user_id).await?;
        if channels.is_empty() {
            return Err(EngineError::ExternalService(
                "no notification channel enabled for user".to_string(),
            ));
        }

        // Every enabled channel fires; one landing is enough.
        let dispatches = futures::future::join_all(
            channels
                .iter()
                .map(|channel| self.notify.send(*channel, execution.user_id, &message)),
        )
        .await;

        let mut delivered = 0usize;
        let mut last_error = None;
        for (channel, result) in channels.iter().zip(dispatches) {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(
                        execution_id = %execution.id,
                        step_id = step.id,
                        channel = %channel,
                        error = %e,
                        "one-time code dispatch failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        if delivered == 0 {
            return Err(last_error.unwrap_or_else(|| {
                EngineError::ExternalService("one-time code dispatch failed".to_string())
            }));
        }

        info!(
            execution_id = %execution.id,
            step_id = step.id,
            channels = delivered,
            "one-time code issued"
        );
        Ok(())
    }

    /// Verify a submitted code. Expiry is checked first, then the attempt
    /// lock (a correct code after five misses still locks), then the match.
    /// A match consumes the challenge: the sub-state is cleared and a
    /// second verification reports expiry.
    pub async fn verify(
        &self,
        execution: &WorkflowExecution,
        step: &WorkflowStep,
        submitted: &str,
    ) -> Result<OtpVerdict, EngineError> {
        let key = Self::context_key(step);
        let context = self
            .sessions
            .get(&execution.session_id)
            .await?
            .ok_or_else(|| {
                EngineError::Concurrency("session expired; execution abandoned".to_string())
            })?;

        let state: OtpState = match context.get(&key) {
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| EngineError::System(format!("corrupt otp state: {}", e)))?,
            // No live challenge: never issued, or already consumed.
            None => return Err(EngineError::OtpExpired),
        };

        if Utc::now().timestamp_millis() > state.expires_at {
            return Err(EngineError::OtpExpired);
        }

        if state.attempts >= self.config.max_attempts {
            return Err(EngineError::OtpLocked);
        }

        if submitted.trim() != state.code {
            let attempts = state.attempts + 1;
            let mut partial = ContextMap::new();
            partial.insert(
                key,
                serde_json::to_value(OtpState {
                    code: state.code,
                    expires_at: state.expires_at,
                    attempts,
                })
                .map_err(|e| EngineError::System(format!("serialize otp state: {}", e)))?,
            );
            self.sessions.update(&execution.session_id, partial).await?;

            warn!(
                execution_id = %execution.id,
                step_id = step.id,
                attempts,
                "one-time code mismatch"
            );
            return Ok(OtpVerdict::Rejected {
                attempts_remaining: self.config.max_attempts.saturating_sub(attempts),
            });
        }

        // Single use: clear the sub-state before reporting success.
        let mut partial = ContextMap::new();
        partial.insert(key, serde_json::Value::Null);
        self.sessions.update(&execution.session_id, partial).await?;

        info!(execution_id = %execution.id, step_id = step.id, "one-time code verified");
        Ok(OtpVerdict::Verified)
    }
}
