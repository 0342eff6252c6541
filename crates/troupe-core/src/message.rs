use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// The kind of a [`Message`] exchanged between agents.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// A request for an agent to take on work.
    TaskRequest,
    /// An agent's answer to a task request.
    TaskResponse,
    /// An invitation to collaborate on a task.
    Collaboration,
    /// A progress or status notice.
    StatusUpdate,
    /// An error report.
    Error,
}

/// A single message exchanged between agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier for this message.
    pub id: Uuid,
    /// The agent that sent the message.
    pub sender_id: Uuid,
    /// The receiving agent, or `None` for a broadcast.
    pub receiver_id: Option<Uuid>,
    /// The task the message is about, if any.
    pub task_id: Option<Uuid>,
    /// The kind of message.
    pub message_type: MessageType,
    /// The textual content of the message.
    pub content: String,
    /// UTC timestamp of when the message was created.
    pub timestamp: DateTime<Utc>,
    /// Arbitrary key-value metadata attached to the message.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Message {
    /// Creates a new message from `sender_id` with the given type and content.
    pub fn new(sender_id: Uuid, message_type: MessageType, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender_id,
            receiver_id: None,
            task_id: None,
            message_type,
            content: content.into(),
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    /// Addresses the message to a single agent.
    pub fn to(mut self, receiver_id: Uuid) -> Self {
        self.receiver_id = Some(receiver_id);
        self
    }

    /// Associates the message with a task.
    pub fn about(mut self, task_id: Uuid) -> Self {
        self.task_id = Some(task_id);
        self
    }

    /// Attaches a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Whether the message has no specific receiver.
    pub fn is_broadcast(&self) -> bool {
        self.receiver_id.is_none()
    }
}
