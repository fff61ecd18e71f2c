use crate::domain::events::{RunEvent, RunEventListener};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Fans run diagnostics out to every subscribed listener, in subscription order.
#[derive(Clone, Default)]
pub struct EventBus {
    listeners: Arc<RwLock<Vec<Arc<dyn RunEventListener>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, listener: Arc<dyn RunEventListener>) {
        self.listeners.write().await.push(listener);
    }

    pub async fn publish(&self, event: &RunEvent) {
        let listeners = self.listeners.read().await;
        for listener in listeners.iter() {
            listener.on_event(event);
        }
    }

    pub async fn publish_all(&self, events: &[RunEvent]) {
        if events.is_empty() {
            return;
        }
        let listeners = self.listeners.read().await;
        for event in events {
            for listener in listeners.iter() {
                listener.on_event(event);
            }
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.listeners.read().await.len()
    }
}

/// Keeps every event it sees; handy for assertions and end-of-run reports.
#[derive(Default)]
pub struct RecordingListener {
    events: std::sync::Mutex<Vec<RunEvent>>,
}

impl RecordingListener {
    pub fn events(&self) -> Vec<RunEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl RunEventListener for RecordingListener {
    fn on_event(&self, event: &RunEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
