//! A typed event bus: every cluster-visible occurrence (node added/removed, leader elected,
//! failover started/completed/failed, health status changed, snapshot created) becomes a lazy
//! stream any number of subscribers can consume, built on `mpb`'s multi-producer broadcast.

use std::time::{SystemTime, UNIX_EPOCH};

use mpb::MPB;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    NodeAdded,
    NodeRemoved,
    LeaderElected,
    TermChanged,
    FailoverStarted,
    FailoverCompleted,
    FailoverFailed,
    HealthStatusChanged,
    SnapshotCreated,
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub kind_name: String,
    pub node_id: u32,
    pub cluster_id: String,
    pub timestamp: u64,
    pub opaque: Value,
}

impl Event {
    pub fn new(kind: EventKind, node_id: u32, cluster_id: impl Into<String>, opaque: Value) -> Self {
        Event {
            kind_name: format!("{:?}", kind),
            node_id,
            cluster_id: cluster_id.into(),
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            opaque,
        }
    }
}

/// Synchronous subscribers run inline, before the orchestrator's next step; asynchronous ones
/// consume from a cloned receiver on their own task. `EventBus` only provides the broadcast
/// itself — the "synchronous" vs "asynchronous" distinction is a property of how a subscriber
/// drains its receiver, not of the bus.
pub struct EventBus {
    bus: MPB<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        EventBus { bus: MPB::new() }
    }

    pub fn publish(&self, event: Event) {
        let _ = self.bus.sender().send(event);
    }

    pub fn subscribe(&self) -> crossbeam_channel::Receiver<Event> {
        self.bus.receiver()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        bus.publish(Event::new(
            EventKind::LeaderElected,
            1,
            "pgraft_cluster",
            json!({"term": 4}),
        ));
        let event = rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap();
        assert_eq!(event.node_id, 1);
        assert_eq!(event.kind_name, "LeaderElected");
    }
}
