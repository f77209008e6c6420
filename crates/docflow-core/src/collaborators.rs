//! Seams to the identity and notification-delivery systems that live outside
//! the engine.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::{Notification, RoleId, UserId, WorkflowError};

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Actor {
    pub user_id: UserId,
    pub role_ids: Vec<RoleId>,
}

pub trait IdentityProvider {
    #[allow(clippy::missing_errors_doc)]
    fn authenticate(&self, credential: &str) -> Result<Actor, WorkflowError>;
}

/// Token table for tests and embedded hosts that resolve identity upstream.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity {
    tokens: BTreeMap<String, Actor>,
}

impl StaticIdentity {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>, actor: Actor) -> Self {
        self.tokens.insert(token.into(), actor);
        self
    }
}

impl IdentityProvider for StaticIdentity {
    fn authenticate(&self, credential: &str) -> Result<Actor, WorkflowError> {
        self.tokens
            .get(credential)
            .cloned()
            .ok_or(WorkflowError::Unauthenticated)
    }
}

pub type SinkError = Box<dyn std::error::Error + Send + Sync>;

/// Receives notifications after the transaction that created them commits.
pub trait NotificationSink: Send + Sync {
    #[allow(clippy::missing_errors_doc)]
    fn deliver(&self, notifications: &[Notification]) -> Result<(), SinkError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl NotificationSink for NoopSink {
    fn deliver(&self, _notifications: &[Notification]) -> Result<(), SinkError> {
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemorySink {
    delivered: Mutex<Vec<Notification>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drains everything delivered so far.
    #[must_use]
    pub fn take(&self) -> Vec<Notification> {
        match self.delivered.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }
}

impl NotificationSink for MemorySink {
    fn deliver(&self, notifications: &[Notification]) -> Result<(), SinkError> {
        let mut guard = self
            .delivered
            .lock()
            .map_err(|_| "notification buffer lock poisoned")?;
        guard.extend_from_slice(notifications);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_identity_rejects_unknown_tokens() {
        let actor = Actor {
            user_id: UserId::new(),
            role_ids: vec![RoleId::new()],
        };
        let identity = StaticIdentity::new().with_token("token-a", actor.clone());

        match identity.authenticate("token-a") {
            Ok(found) => assert_eq!(found, actor),
            Err(err) => panic!("expected actor, got {err}"),
        }
        assert_eq!(
            identity.authenticate("token-b"),
            Err(WorkflowError::Unauthenticated)
        );
    }
}
