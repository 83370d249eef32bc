//! Control commands received on the command topic.
//!
//! Payloads are JSON objects with an `action` field:
//! `{"action": "load_map"}` or `{"action": "shutdown"}`. Other fields are
//! accepted and ignored.

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("invalid command payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("command payload must be a JSON object")]
    NotAnObject,

    #[error("`action` must be a string")]
    ActionNotAString,
}

/// A decoded control command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Start the worker if it is not already running.
    LoadMap,
    /// Stop the worker if it is running.
    Shutdown,
    /// Anything else, including a missing or empty action. Logged and ignored.
    Unknown(String),
}

impl ControlCommand {
    pub const LOAD_MAP: &'static str = "load_map";
    pub const SHUTDOWN: &'static str = "shutdown";

    /// Decode a raw bus payload. The action is matched after trimming
    /// surrounding whitespace.
    pub fn from_payload(payload: &[u8]) -> Result<Self, CommandError> {
        let serde_json::Value::Object(fields) = serde_json::from_slice::<serde_json::Value>(payload)?
        else {
            return Err(CommandError::NotAnObject);
        };
        match fields.get("action") {
            None | Some(serde_json::Value::Null) => Ok(Self::from_action("")),
            Some(serde_json::Value::String(action)) => Ok(Self::from_action(action.trim())),
            Some(_) => Err(CommandError::ActionNotAString),
        }
    }

    pub fn from_action(action: &str) -> Self {
        match action {
            Self::LOAD_MAP => Self::LoadMap,
            Self::SHUTDOWN => Self::Shutdown,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn action(&self) -> &str {
        match self {
            Self::LoadMap => Self::LOAD_MAP,
            Self::Shutdown => Self::SHUTDOWN,
            Self::Unknown(action) => action,
        }
    }
}
