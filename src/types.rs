use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single entry in a conversation's persisted history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Outcome of a permission request, either decided by the user or forced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionDecision {
    Allow,
    Deny { reason: String },
}

impl PermissionDecision {
    pub fn deny(reason: impl Into<String>) -> Self {
        Self::Deny {
            reason: reason.into(),
        }
    }
}

/// Traffic from the permission broker to the front end.
///
/// `Requested` asks the channel to render an approve/deny prompt;
/// `Expired` tells it to rewrite a prompt whose request timed out.
#[derive(Debug, Clone)]
pub enum ApprovalEvent {
    Requested {
        correlation_id: String,
        conversation_id: String,
        tool_name: String,
        summary: String,
    },
    Expired {
        correlation_id: String,
        conversation_id: String,
    },
}
