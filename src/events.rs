//! In-process event fan-out for live dashboards.

use crate::db::TranscodingJobStatus;
use crate::jobs::JobState;
use serde::Serialize;
use tokio::sync::broadcast;

/// Per-subscriber queue depth. When a subscriber falls behind, the oldest
/// buffered event is dropped before the new one is enqueued.
pub const EVENT_QUEUE_CAPACITY: usize = 20;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerEvent {
    JobState {
        state: JobState,
    },
    TranscodingState {
        job_id: String,
        status: TranscodingJobStatus,
    },
    TranscodingProgress {
        job_id: String,
        progress_percent: Option<f64>,
        transcoded_duration: Option<f64>,
        current_fps: Option<f64>,
        current_bitrate: Option<i64>,
    },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ServerEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_QUEUE_CAPACITY);
        Self { tx }
    }

    /// Non-blocking; safe to call from scheduler callbacks. Events published
    /// with no subscribers are discarded.
    pub fn publish(&self, event: ServerEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobStatus;

    #[tokio::test]
    async fn test_publish_and_subscribe() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(ServerEvent::TranscodingState {
            job_id: "abc".into(),
            status: TranscodingJobStatus::Running,
        });

        match rx.recv().await.unwrap() {
            ServerEvent::TranscodingState { job_id, status } => {
                assert_eq!(job_id, "abc");
                assert_eq!(status, TranscodingJobStatus::Running);
            }
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_does_not_block() {
        let bus = EventBus::new();
        for _ in 0..100 {
            bus.publish(ServerEvent::TranscodingProgress {
                job_id: "abc".into(),
                progress_percent: Some(1.0),
                transcoded_duration: None,
                current_fps: None,
                current_bitrate: None,
            });
        }
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        for i in 0..(EVENT_QUEUE_CAPACITY + 5) {
            bus.publish(ServerEvent::TranscodingProgress {
                job_id: format!("job-{}", i),
                progress_percent: None,
                transcoded_duration: None,
                current_fps: None,
                current_bitrate: None,
            });
        }

        // The first read reports the lag, then the oldest retained event.
        let lagged = rx.recv().await;
        assert!(matches!(
            lagged,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
        let next = rx.recv().await.unwrap();
        match next {
            ServerEvent::TranscodingProgress { job_id, .. } => {
                assert_eq!(job_id, format!("job-{}", 5));
            }
            other => panic!("Unexpected event: {:?}", other),
        }
        let _ = bus.subscriber_count();
    }

    #[test]
    fn test_job_state_event_serializes() {
        let state = JobState::new_for_test("library_scanner", "Library Scanner");
        assert_eq!(state.status, JobStatus::Pending);
        let event = ServerEvent::JobState { state };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("library_scanner"));
    }
}
