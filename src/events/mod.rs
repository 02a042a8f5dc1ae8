use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 1024;

/// Lifecycle of one download, as seen by a result row.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum DownloadState {
    #[default]
    Idle,
    Queued,
    Downloading,
    Completed,
    Failed,
    Cancelled,
}

impl DownloadState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadState::Completed | DownloadState::Failed | DownloadState::Cancelled
        )
    }
}

/// Phase of a catalog load, for status text.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum CatalogPhase {
    ReadingCache,
    Connecting,
    /// Waiting before the next attempt, typically while the OS asks the user
    /// to allow outbound connections.
    WaitingForNetwork,
    Decrypting,
    Ready,
    Offline,
    Cancelled,
    Failed,
}

impl fmt::Display for CatalogPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CatalogPhase::ReadingCache => "reading cache",
            CatalogPhase::Connecting => "connecting",
            CatalogPhase::WaitingForNetwork => "waiting for network",
            CatalogPhase::Decrypting => "decrypting",
            CatalogPhase::Ready => "ready",
            CatalogPhase::Offline => "offline",
            CatalogPhase::Cancelled => "cancelled",
            CatalogPhase::Failed => "failed",
        };
        write!(f, "{text}")
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum EngineEvent {
    DownloadProgress {
        key: String,
        bytes: u64,
        total: Option<u64>,
        /// Host the bytes come from
        source: String,
    },
    DownloadCompleted {
        key: String,
        path: PathBuf,
        size: u64,
    },
    DownloadError {
        key: String,
        message: String,
    },
    DownloadStateChanged {
        key: String,
        state: DownloadState,
    },
    CatalogStatus {
        phase: CatalogPhase,
        detail: String,
    },
    ResultUpdated {
        requested_name: String,
        revision: u64,
    },
}

/// Fan-out channel the engine publishes to; any number of subscribers.
///
/// Publishing never blocks. Slow subscribers lose the oldest events.
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        EventBus { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: EngineEvent) {
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn catalog_status(&self, phase: CatalogPhase, detail: impl Into<String>) {
        self.publish(EngineEvent::CatalogStatus {
            phase,
            detail: detail.into(),
        });
    }

    pub fn download_state(&self, key: &str, state: DownloadState) {
        self.publish(EngineEvent::DownloadStateChanged {
            key: key.to_string(),
            state,
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_subscriber_sees_events() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        bus.catalog_status(CatalogPhase::Connecting, "attempt 1 of 5");

        for receiver in [&mut first, &mut second] {
            match receiver.recv().await.unwrap() {
                EngineEvent::CatalogStatus { phase, detail } => {
                    assert_eq!(phase, CatalogPhase::Connecting);
                    assert_eq!(detail, "attempt 1 of 5");
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[test]
    fn test_publish_without_subscribers() {
        EventBus::new().download_state("A.B.1", DownloadState::Queued);
    }
}
