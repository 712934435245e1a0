use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::info;
use serde::Serialize;
use tokio::time;

/// One entry of the progress stream handed to the host UI.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProgressEvent {
    pub message: String,
}

/// Append-only, insertion-ordered log of milestone strings for one
/// session. Cheap to clone; every clone appends to the same log.
/// Entries are never rewound, readers keep their own cursor.
#[derive(Clone, Default)]
pub struct ProgressLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl ProgressLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, message: impl Into<String>) {
        let message = message.into();
        info!("{}", message);
        self.entries
            .lock()
            .expect("progress log poisoned")
            .push(message);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("progress log poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, index: usize) -> Option<String> {
        self.entries
            .lock()
            .expect("progress log poisoned")
            .get(index)
            .cloned()
    }

    /// A fresh read cursor starting at the beginning of the log.
    pub fn cursor(&self) -> ProgressCursor {
        ProgressCursor {
            log: self.clone(),
            index: 0,
        }
    }
}

/// Streaming reader over a [`ProgressLog`]. `next` samples the log once
/// per second and never finishes on its own; the consumer cancels it.
pub struct ProgressCursor {
    log: ProgressLog,
    index: usize,
}

impl ProgressCursor {
    pub async fn next(&mut self) -> ProgressEvent {
        loop {
            if let Some(message) = self.log.get(self.index) {
                self.index += 1;
                return ProgressEvent { message };
            }
            time::sleep(Duration::from_secs(1)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn cursor_yields_entries_in_insertion_order() {
        let log = ProgressLog::new();
        log.append("Requesting t3.medium non spot instance");
        log.append("Instance running");

        let mut cursor = log.cursor();
        assert_eq!(cursor.next().await.message, "Requesting t3.medium non spot instance");
        assert_eq!(cursor.next().await.message, "Instance running");
    }

    #[tokio::test]
    async fn cursor_picks_up_entries_appended_after_creation() {
        let log = ProgressLog::new();
        let mut cursor = log.cursor();
        log.append("Creating ECS task");
        assert_eq!(cursor.next().await.message, "Creating ECS task");
    }

    #[tokio::test]
    async fn stream_never_finishes_on_its_own() {
        let log = ProgressLog::new();
        log.append("only entry");

        let mut cursor = log.cursor();
        cursor.next().await;

        // a drained cursor keeps waiting for more entries forever
        let waited = time::timeout(Duration::from_millis(50), cursor.next()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn independent_cursors_do_not_share_position() {
        let log = ProgressLog::new();
        log.append("first");

        let mut one = log.cursor();
        let mut two = log.cursor();
        assert_eq!(one.next().await.message, "first");
        assert_eq!(two.next().await.message, "first");
        assert_eq!(log.len(), 1);
    }
}
