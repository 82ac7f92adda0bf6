//! Pipeline event broadcasting
//!
//! Status changes are published on a `tokio::sync::broadcast` channel. Sending
//! never fails the caller: with no subscribers the event is simply dropped.

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::db::{DownloadStatus, JobStatus};

/// Events emitted by the completion and import pipeline
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    DownloadProgress {
        download_id: Uuid,
        progress: f64,
        status: DownloadStatus,
    },
    DownloadCompleted {
        download_id: Uuid,
        title: String,
    },
    JobQueued {
        job_id: Uuid,
        download_id: Uuid,
        source_path: String,
    },
    JobStatusChanged {
        job_id: Uuid,
        download_id: Uuid,
        status: JobStatus,
        message: Option<String>,
    },
    FileImported {
        download_id: Uuid,
        item_id: Uuid,
        path: String,
    },
    ImportRefused {
        download_id: Uuid,
        item_id: Option<Uuid>,
        path: String,
        reason: String,
    },
}

/// Fire-and-forget event bus
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: PipelineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::new(4);
        bus.publish(PipelineEvent::DownloadCompleted {
            download_id: Uuid::new_v4(),
            title: "nobody listening".to_string(),
        });
    }

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();
        let download_id = Uuid::new_v4();
        bus.publish(PipelineEvent::DownloadCompleted {
            download_id,
            title: "Dune".to_string(),
        });

        assert_matches!(
            rx.recv().await,
            Ok(PipelineEvent::DownloadCompleted { download_id: id, .. }) if id == download_id
        );
    }
}
