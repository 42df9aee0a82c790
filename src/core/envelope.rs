use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Logical destination of a notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Target {
    All,
    User(String),
    Group(String),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::User(user) => write!(f, "user:{}", user),
            Self::Group(group) => write!(f, "group:{}", group),
        }
    }
}

/// An ephemeral notification, never persisted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    pub target: Target,
    /// Label of whoever originated the notification; `None` for hub announcements
    pub from: Option<String>,
    pub payload: String,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    pub fn new(target: Target, payload: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            target,
            from: None,
            payload: payload.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_sender(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }
}
