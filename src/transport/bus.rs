use log::warn;
use tokio::sync::broadcast;

use crate::events::Notice;

const DEFAULT_CAPACITY: usize = 256;

/// Document-level pub/sub: every decoded frame from every subscription is
/// republished here under its `event_type`, so views that do not own a
/// socket (status badges, buildset lists) can follow along.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Notice>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishing with no listeners is fine; the notice is simply dropped.
    pub fn publish(&self, notice: Notice) {
        let _ = self.sender.send(notice);
    }

    /// Listens to one event type.
    pub fn listen_to(&self, event_type: impl Into<String>) -> Listener {
        Listener {
            event_type: event_type.into(),
            receiver: self.sender.subscribe(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

pub struct Listener {
    event_type: String,
    receiver: broadcast::Receiver<Notice>,
}

impl Listener {
    /// Next matching notice, or `None` once every publisher is gone.
    pub async fn recv(&mut self) -> Option<Notice> {
        loop {
            match self.receiver.recv().await {
                Ok(notice) if notice.event_type == self.event_type => return Some(notice),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Event listener fell behind, skipped {skipped} notices");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn notice(event_type: &str) -> Notice {
        Notice {
            event_type: event_type.to_string(),
            payload: json!({"event_type": event_type}),
        }
    }

    #[tokio::test]
    async fn test_listener_filters_by_event_type() {
        let bus = EventBus::default();
        let mut builds = bus.listen_to("build_finished");
        let mut statuses = bus.listen_to("repo_status_changed");

        bus.publish(notice("repo_status_changed"));
        bus.publish(notice("build_finished"));
        drop(bus);

        assert_eq!(builds.recv().await.unwrap().event_type, "build_finished");
        assert!(builds.recv().await.is_none());

        assert_eq!(statuses.recv().await.unwrap().event_type, "repo_status_changed");
        assert!(statuses.recv().await.is_none());
    }

    #[test]
    fn test_publish_without_listeners() {
        let bus = EventBus::new(4);
        bus.publish(notice("build_added"));
    }
}
