//! Message types exchanged with notification clients

use serde::{Deserialize, Serialize};

use crate::core::envelope::{Envelope, Target};

/// Client-to-server commands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    /// Join a group
    Join { group: String },

    /// Leave a group
    Leave { group: String },

    /// Notify every connected client
    SendAll {
        message: String,
        /// Display label for the sender; defaults to the bound user
        user: Option<String>,
    },

    /// Notify every connection of one user
    SendUser { user: String, message: String },

    /// Notify every member of a group
    SendGroup { group: String, message: String },
}

impl ClientCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::Leave { .. } => "leave",
            Self::SendAll { .. } => "send_all",
            Self::SendUser { .. } => "send_user",
            Self::SendGroup { .. } => "send_group",
        }
    }
}

/// Server-to-client message types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Session established
    Connected { connection_id: String },

    /// A notification routed to this client
    Notification {
        id: String,
        target: Target,
        from: Option<String>,
        message: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Command accepted
    Ack {
        command: String,
        /// Connections the command's notification was delivered to
        delivered: usize,
    },

    /// Error message
    Error { code: String, message: String },
}

impl From<&Envelope> for ServerMessage {
    fn from(envelope: &Envelope) -> Self {
        Self::Notification {
            id: envelope.id.to_string(),
            target: envelope.target.clone(),
            from: envelope.from.clone(),
            message: envelope.payload.clone(),
            timestamp: envelope.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_client_commands() {
        let join: ClientCommand = serde_json::from_str(r#"{"type":"join","group":"team"}"#).unwrap();
        assert_eq!(join, ClientCommand::Join { group: "team".to_string() });

        let all: ClientCommand =
            serde_json::from_str(r#"{"type":"send_all","message":"hi"}"#).unwrap();
        assert_eq!(all.name(), "send_all");
        assert!(matches!(all, ClientCommand::SendAll { user: None, .. }));
    }

    #[test]
    fn test_unknown_command_rejected() {
        let parsed = serde_json::from_str::<ClientCommand>(r#"{"type":"create_room","name":"x"}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_notification_from_envelope() {
        let envelope = Envelope::new(Target::Group("team".to_string()), "hi").with_sender("alice");
        let value = serde_json::to_value(ServerMessage::from(&envelope)).unwrap();
        assert_eq!(value["type"], "notification");
        assert_eq!(value["message"], "hi");
        assert_eq!(value["from"], "alice");
        assert_eq!(value["target"]["kind"], "group");
    }
}
