//! Inter-agent collaboration requests and the bounded message log.

use crate::engine::Orchestrator;
use crate::types::{AgentRef, CapabilitySet};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info};
use troupe_core::{Message, MessageType, TroupeError, TroupeResult};
use uuid::Uuid;

/// An open collaboration between a requesting agent and its helpers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collaboration {
    pub id: Uuid,
    pub task_id: Uuid,
    pub requesting_agent: Uuid,
    pub participants: Vec<AgentRef>,
    pub kind: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Default)]
struct OpenCollaborations {
    by_id: HashMap<Uuid, Collaboration>,
    order: VecDeque<Uuid>,
}

/// Holds open collaborations and the most recent messages. Both are bounded
/// by the same capacity, oldest evicted first.
pub struct CollaborationDesk {
    messages: Mutex<VecDeque<Message>>,
    collaborations: Mutex<OpenCollaborations>,
    capacity: usize,
}

impl CollaborationDesk {
    pub fn new(capacity: usize) -> Self {
        Self {
            messages: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            collaborations: Mutex::new(OpenCollaborations::default()),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, message: Message) {
        let mut log = self.messages.lock();
        while log.len() >= self.capacity {
            log.pop_front();
        }
        debug!(
            sender_id = %message.sender_id,
            message_type = ?message.message_type,
            "Message logged"
        );
        log.push_back(message);
    }

    /// The last `limit` messages, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<Message> {
        let log = self.messages.lock();
        let skip = log.len().saturating_sub(limit);
        log.iter().skip(skip).cloned().collect()
    }

    pub fn open(&self, collaboration: Collaboration) {
        let mut open = self.collaborations.lock();
        while open.order.len() >= self.capacity {
            let Some(oldest) = open.order.pop_front() else {
                break;
            };
            open.by_id.remove(&oldest);
            debug!(collaboration_id = %oldest, "Collaboration evicted");
        }
        open.order.push_back(collaboration.id);
        open.by_id.insert(collaboration.id, collaboration);
    }

    pub fn close(&self, id: Uuid) -> Option<Collaboration> {
        let mut open = self.collaborations.lock();
        let closed = open.by_id.remove(&id)?;
        open.order.retain(|c| *c != id);
        Some(closed)
    }

    pub fn get(&self, id: Uuid) -> Option<Collaboration> {
        self.collaborations.lock().by_id.get(&id).cloned()
    }

    pub fn active_count(&self) -> usize {
        self.collaborations.lock().by_id.len()
    }
}

impl Orchestrator {
    /// Invite every other non-offline agent holding one of `capabilities` to
    /// help `requesting_agent` with `task_id`.
    pub async fn request_collaboration(
        &self,
        requesting_agent: Uuid,
        task_id: Uuid,
        capabilities: &[&str],
        kind: &str,
        message: &str,
    ) -> TroupeResult<Collaboration> {
        if self.shared.registry.get(requesting_agent).is_none() {
            return Err(TroupeError::AgentNotFound(requesting_agent));
        }
        if self.task(task_id).await.is_none() {
            return Err(TroupeError::TaskNotFound(task_id));
        }
        let wanted: CapabilitySet = capabilities
            .iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        if wanted.is_empty() {
            return Err(TroupeError::Validation(
                "collaboration needs at least one capability".into(),
            ));
        }

        let participants = self.shared.registry.holders_of_any(&wanted, requesting_agent);
        if participants.is_empty() {
            return Err(TroupeError::Orchestrator(
                "no suitable agents available for collaboration".into(),
            ));
        }

        let collaboration = Collaboration {
            id: Uuid::new_v4(),
            task_id,
            requesting_agent,
            participants,
            kind: kind.to_string(),
            created_at: Utc::now(),
        };
        for participant in &collaboration.participants {
            self.shared.desk.record(
                Message::new(
                    requesting_agent,
                    MessageType::Collaboration,
                    format!("Collaboration request: {message}"),
                )
                .to(participant.id)
                .about(task_id)
                .with_metadata("collaboration_id", serde_json::json!(collaboration.id))
                .with_metadata("collaboration_type", serde_json::json!(kind)),
            );
        }
        info!(
            collaboration_id = %collaboration.id,
            task_id = %task_id,
            participants = collaboration.participants.len(),
            "Collaboration opened"
        );
        self.shared.desk.open(collaboration.clone());
        Ok(collaboration)
    }

    /// Log a message between agents.
    pub fn send_message(&self, message: Message) {
        self.shared.desk.record(message);
    }

    pub fn recent_messages(&self, limit: usize) -> Vec<Message> {
        self.shared.desk.recent(limit)
    }

    pub fn collaboration(&self, id: Uuid) -> Option<Collaboration> {
        self.shared.desk.get(id)
    }

    /// Close a collaboration, notifying its participants.
    pub fn close_collaboration(&self, id: Uuid) -> TroupeResult<Collaboration> {
        let collaboration = self
            .shared
            .desk
            .close(id)
            .ok_or_else(|| TroupeError::Orchestrator(format!("no open collaboration {id}")))?;
        for participant in &collaboration.participants {
            self.shared.desk.record(
                Message::new(
                    collaboration.requesting_agent,
                    MessageType::Collaboration,
                    "Collaboration closed",
                )
                .to(participant.id)
                .about(collaboration.task_id)
                .with_metadata("collaboration_id", serde_json::json!(collaboration.id)),
            );
        }
        info!(collaboration_id = %id, "Collaboration closed");
        Ok(collaboration)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_log_is_bounded() {
        let desk = CollaborationDesk::new(3);
        let sender = Uuid::new_v4();
        for i in 0..5 {
            desk.record(Message::new(sender, MessageType::StatusUpdate, format!("m{i}")));
        }
        let recent: Vec<String> = desk.recent(10).into_iter().map(|m| m.content).collect();
        assert_eq!(recent, vec!["m2", "m3", "m4"]);
        let last: Vec<String> = desk.recent(1).into_iter().map(|m| m.content).collect();
        assert_eq!(last, vec!["m4"]);
    }

    fn collaboration(kind: &str) -> Collaboration {
        Collaboration {
            id: Uuid::new_v4(),
            task_id: Uuid::new_v4(),
            requesting_agent: Uuid::new_v4(),
            participants: Vec::new(),
            kind: kind.into(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_open_and_get() {
        let desk = CollaborationDesk::new(10);
        let collab = collaboration("review");
        desk.open(collab.clone());
        assert_eq!(desk.active_count(), 1);
        assert_eq!(desk.get(collab.id).unwrap().kind, "review");
    }

    #[test]
    fn test_open_collaborations_are_bounded() {
        let desk = CollaborationDesk::new(2);
        let ids: Vec<Uuid> = (0..4)
            .map(|i| {
                let collab = collaboration(&format!("c{i}"));
                let id = collab.id;
                desk.open(collab);
                id
            })
            .collect();
        assert_eq!(desk.active_count(), 2);
        assert!(desk.get(ids[0]).is_none());
        assert!(desk.get(ids[1]).is_none());
        assert_eq!(desk.get(ids[3]).unwrap().kind, "c3");

        assert!(desk.close(ids[2]).is_some());
        assert!(desk.close(ids[2]).is_none());
        assert_eq!(desk.active_count(), 1);

        // A closed slot is reused without evicting the survivor.
        desk.open(collaboration("c4"));
        assert_eq!(desk.active_count(), 2);
        assert!(desk.get(ids[3]).is_some());
    }
}
