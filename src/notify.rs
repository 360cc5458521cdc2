//! Notification dispatch interface.
//!
//! The OTP sub-engine is the only in-crate caller: it asks which channels a
//! user has enabled and fires the code through every one of them. Delivery
//! itself (SMS aggregator, mail relay, push) is an external collaborator.

use async_trait::async_trait;
use dashmap::DashMap;
use std::fmt;
use std::sync::Mutex;

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Sms,
    Email,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Sms => write!(f, "SMS"),
            Channel::Email => write!(f, "EMAIL"),
        }
    }
}

#[async_trait]
pub trait NotificationGateway: Send + Sync {
    /// Channels the user has enabled, in dispatch order.
    async fn channels(&self, user_id: i64) -> Result<Vec<Channel>, EngineError>;

    async fn send(&self, channel: Channel, user_id: i64, message: &str)
        -> Result<(), EngineError>;
}

/// Stand-in dispatcher that writes messages to the process log instead of
/// an aggregator. Used when no real SMS/email integration is wired up.
pub struct LogNotifier;

#[async_trait]
impl NotificationGateway for LogNotifier {
    async fn channels(&self, _user_id: i64) -> Result<Vec<Channel>, EngineError> {
        Ok(vec![Channel::Sms])
    }

    async fn send(
        &self,
        channel: Channel,
        user_id: i64,
        message: &str,
    ) -> Result<(), EngineError> {
        tracing::info!(channel = %channel, user_id, message = %message, "notification dispatched");
        Ok(())
    }
}

/// Recording notifier for tests: per-user channel sets, per-channel
/// scripted failures, and a log of everything sent.
pub struct MockNotifier {
    enabled: DashMap<i64, Vec<Channel>>,
    failing: DashMap<Channel, String>,
    sent: Mutex<Vec<(Channel, i64, String)>>,
}

impl MockNotifier {
    pub fn new() -> Self {
        Self {
            enabled: DashMap::new(),
            failing: DashMap::new(),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn enable(&self, user_id: i64, channels: &[Channel]) {
        self.enabled.insert(user_id, channels.to_vec());
    }

    pub fn fail_channel(&self, channel: Channel, error: &str) {
        self.failing.insert(channel, error.to_string());
    }

    pub fn sent(&self) -> Vec<(Channel, i64, String)> {
        self.sent.lock().unwrap().clone()
    }

    /// Last message delivered to the user over any channel.
    pub fn last_message_to(&self, user_id: i64) -> Option<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(_, uid, _)| *uid == user_id)
            .map(|(_, _, msg)| msg.clone())
    }
}

impl Default for MockNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationGateway for MockNotifier {
    async fn channels(&self, user_id: i64) -> Result<Vec<Channel>, EngineError> {
        Ok(self
            .enabled
            .get(&user_id)
            .map(|c| c.clone())
            .unwrap_or_default())
    }

    async fn send(
        &self,
        channel: Channel,
        user_id: i64,
        message: &str,
    ) -> Result<(), EngineError> {
        if let Some(error) = self.failing.get(&channel) {
            return Err(EngineError::ExternalService(format!(
                "{} dispatch failed: {}",
                channel,
                error.clone()
            )));
        }
        self.sent
            .lock()
            .unwrap()
            .push((channel, user_id, message.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channels_default_empty() {
        let notifier = MockNotifier::new();
        assert!(notifier.channels(7).await.unwrap().is_empty());

        notifier.enable(7, &[Channel::Sms, Channel::Email]);
        assert_eq!(
            notifier.channels(7).await.unwrap(),
            vec![Channel::Sms, Channel::Email]
        );
    }

    #[tokio::test]
    async fn test_send_records_and_scripted_failure() {
        let notifier = MockNotifier::new();
        notifier.send(Channel::Sms, 7, "code 123456").await.unwrap();
        assert_eq!(notifier.last_message_to(7).unwrap(), "code 123456");

        notifier.fail_channel(Channel::Email, "relay down");
        let err = notifier.send(Channel::Email, 7, "x").await.unwrap_err();
        assert!(matches!(err, EngineError::ExternalService(_)));
    }
}
