//! Progress reporting for long-running transitions.
//!
//! Reconcilers report status lines through a [`Progress`]; the worker decides
//! whether they become progress replies or log lines.

use std::sync::Mutex;

use corral_events::{Event, Reply};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Sink for status updates of one event.
pub trait Progress: Send + Sync {
    fn update(&self, message: &str, data: Option<Value>);
}

/// Forwards updates as progress replies to the event's issuer.
pub struct ReplyProgress {
    event: Event,
    replies: mpsc::UnboundedSender<Reply>,
}

impl ReplyProgress {
    pub fn new(event: &Event, replies: mpsc::UnboundedSender<Reply>) -> Self {
        let mut event = event.clone();
        // Only the envelope is needed to address replies.
        event.data = Default::default();
        Self { event, replies }
    }
}

impl Progress for ReplyProgress {
    fn update(&self, message: &str, data: Option<Value>) {
        match Reply::progress(&self.event, message, data) {
            Some(reply) => {
                if self.replies.send(reply).is_err() {
                    debug!(event_id = %self.event.id, "Reply channel closed, dropping progress");
                }
            }
            None => debug!(event_id = %self.event.id, status = message, "Progress (no reply expected)"),
        }
    }
}

/// Logs updates only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl Progress for LogProgress {
    fn update(&self, message: &str, _data: Option<Value>) {
        info!(status = message, "Progress");
    }
}

/// Keeps every update in memory.
#[derive(Debug, Default)]
pub struct RecordingProgress {
    updates: Mutex<Vec<(String, Option<Value>)>>,
}

impl RecordingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<String> {
        self.updates
            .lock()
            .map(|u| u.iter().map(|(m, _)| m.clone()).collect())
            .unwrap_or_default()
    }

    pub fn updates(&self) -> Vec<(String, Option<Value>)> {
        self.updates.lock().map(|u| u.clone()).unwrap_or_default()
    }
}

impl Progress for RecordingProgress {
    fn update(&self, message: &str, data: Option<Value>) {
        if let Ok(mut updates) = self.updates.lock() {
            updates.push((message.to_string(), data));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_progress_addresses_issuer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let event = Event::new("storage.image.activate").with_reply_to("reply.5");
        let progress = ReplyProgress::new(&event, tx);

        progress.update("Pulling fs layer", None);

        let reply = rx.try_recv().unwrap();
        assert_eq!(reply.name, "reply.5");
        assert_eq!(reply.previous_ids, vec![event.id.clone()]);
        assert_eq!(reply.transitioning_message.as_deref(), Some("Pulling fs layer"));
    }

    #[test]
    fn test_reply_progress_without_reply_to_sends_nothing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let progress = ReplyProgress::new(&Event::new("storage.image.activate"), tx);

        progress.update("Pulling fs layer", None);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_recording_progress() {
        let progress = RecordingProgress::new();
        progress.update("a", None);
        progress.update("b", Some(serde_json::json!({"exitCode": 1})));

        assert_eq!(progress.messages(), vec!["a", "b"]);
        assert_eq!(progress.updates()[1].1.as_ref().unwrap()["exitCode"], 1);
    }
}
