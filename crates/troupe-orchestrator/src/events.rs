//! Lifecycle event fan-out.
//!
//! Backed by a bounded Tokio broadcast channel: publishing never blocks, and a
//! subscriber that falls behind loses the oldest events rather than stalling
//! the engine.

use crate::types::TaskStatus;
use chrono::{DateTime, Utc};
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};
use uuid::Uuid;

/// One task state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub task_id: Uuid,
    /// `None` for the creation event.
    pub previous_status: Option<TaskStatus>,
    pub new_status: TaskStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub detail: Option<String>,
}

impl LifecycleEvent {
    pub fn new(
        task_id: Uuid,
        previous_status: Option<TaskStatus>,
        new_status: TaskStatus,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id,
            previous_status,
            new_status,
            timestamp,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Broadcasts lifecycle events to every live subscription. Publishing never
/// blocks; a subscriber that falls more than `capacity` events behind skips
/// the oldest ones.
pub struct EventBus {
    sender: broadcast::Sender<LifecycleEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Best-effort delivery to current subscribers.
    pub fn publish(&self, event: LifecycleEvent) {
        let task_id = event.task_id;
        let status = event.new_status;
        match self.sender.send(event) {
            Ok(receivers) => {
                debug!(task_id = %task_id, status = %status, receivers, "Event published")
            }
            // No subscribers.
            Err(_) => debug!(task_id = %task_id, status = %status, "Event dropped"),
        }
    }

    pub fn publish_all(&self, events: impl IntoIterator<Item = LifecycleEvent>) {
        for event in events {
            self.publish(event);
        }
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// A live view of the event stream.
pub struct EventSubscription {
    receiver: broadcast::Receiver<LifecycleEvent>,
}

impl EventSubscription {
    /// Wait for the next event. Returns `None` once the bus is gone.
    pub async fn next(&mut self) -> Option<LifecycleEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event subscriber lagged; oldest events dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next buffered event without waiting.
    pub fn try_next(&mut self) -> Option<LifecycleEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event subscriber lagged; oldest events dropped");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Drain everything currently buffered.
    pub fn drain(&mut self) -> Vec<LifecycleEvent> {
        std::iter::from_fn(|| self.try_next()).collect()
    }

    pub fn into_stream(self) -> impl Stream<Item = LifecycleEvent> {
        BroadcastStream::new(self.receiver).filter_map(|item| async move {
            match item {
                Ok(event) => Some(event),
                Err(e) => {
                    warn!(error = %e, "Event stream lagged");
                    None
                }
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn event(status: TaskStatus) -> LifecycleEvent {
        LifecycleEvent::new(Uuid::new_v4(), None, status, Utc::now())
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = EventBus::new(4);
        bus.publish(event(TaskStatus::Submitted));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscriber_sees_only_later_events() {
        let bus = EventBus::new(8);
        bus.publish(event(TaskStatus::Submitted));
        let mut sub = bus.subscribe();
        bus.publish(event(TaskStatus::Ready));
        let got = sub.next().await.unwrap();
        assert_eq!(got.new_status, TaskStatus::Ready);
        assert!(sub.try_next().is_none());
    }

    #[tokio::test]
    async fn test_slow_subscriber_loses_oldest() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe();
        let statuses = [
            TaskStatus::Submitted,
            TaskStatus::Ready,
            TaskStatus::Assigned,
            TaskStatus::InProgress,
            TaskStatus::Completed,
        ];
        for s in statuses {
            bus.publish(event(s));
        }
        let got: Vec<TaskStatus> = sub.drain().into_iter().map(|e| e.new_status).collect();
        assert_eq!(got, vec![TaskStatus::InProgress, TaskStatus::Completed]);
    }

    #[tokio::test]
    async fn test_stream_yields_events() {
        let bus = EventBus::new(8);
        let sub = bus.subscribe();
        bus.publish(event(TaskStatus::Submitted).with_detail("created"));
        bus.publish(event(TaskStatus::Ready));
        drop(bus);
        let events: Vec<LifecycleEvent> = sub.into_stream().collect().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].detail.as_deref(), Some("created"));
    }

    #[test]
    fn test_event_serialization() {
        let e = LifecycleEvent::new(
            Uuid::new_v4(),
            Some(TaskStatus::Ready),
            TaskStatus::Assigned,
            Utc::now(),
        );
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["previous_status"], "ready");
        assert_eq!(json["new_status"], "assigned");
    }
}
