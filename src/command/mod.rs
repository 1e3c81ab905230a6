//! The command pipeline: a bounded circular queue of typed commands with a parallel status ring,
//! fed by any caller (SQL shim, CLI, auto-recovery) and drained only by the consensus worker —
//! the single point through which every state transition is serialized.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use crate::error::{Error, Result};

pub const QUEUE_CAPACITY: usize = 100;
pub const STATUS_CAPACITY: usize = 100;

/// A timestamp used both to order commands and to key their status-ring entry. Nanosecond
/// resolution makes collisions between two commands enqueued in the same tick vanishingly
/// unlikely without requiring a dedicated ID generator.
pub type CommandTimestamp = u128;

fn now() -> CommandTimestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandType {
    Init,
    AddNode,
    RemoveNode,
    LogAppend,
    LogCommit,
    LogApply,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct Command {
    pub kind: CommandType,
    pub node_id: Option<u32>,
    pub address: Option<String>,
    pub port: Option<u16>,
    pub cluster_id: Option<String>,
    pub log_data: Option<Bytes>,
    pub log_index: Option<u64>,
    pub timestamp: CommandTimestamp,
}

impl Command {
    fn new(kind: CommandType) -> Self {
        Command {
            kind,
            node_id: None,
            address: None,
            port: None,
            cluster_id: None,
            log_data: None,
            log_index: None,
            timestamp: now(),
        }
    }

    pub fn init() -> Self {
        Command::new(CommandType::Init)
    }

    pub fn add_node(node_id: u32, address: impl Into<String>, port: u16) -> Self {
        let mut c = Command::new(CommandType::AddNode);
        c.node_id = Some(node_id);
        c.address = Some(address.into());
        c.port = Some(port);
        c
    }

    pub fn remove_node(node_id: u32) -> Self {
        let mut c = Command::new(CommandType::RemoveNode);
        c.node_id = Some(node_id);
        c
    }

    pub fn log_append(data: Bytes) -> Self {
        let mut c = Command::new(CommandType::LogAppend);
        c.log_data = Some(data);
        c
    }

    pub fn log_commit(index: u64) -> Self {
        let mut c = Command::new(CommandType::LogCommit);
        c.log_index = Some(index);
        c
    }

    pub fn log_apply(index: u64) -> Self {
        let mut c = Command::new(CommandType::LogApply);
        c.log_index = Some(index);
        c
    }

    pub fn shutdown() -> Self {
        Command::new(CommandType::Shutdown)
    }
}

#[derive(Debug, Clone)]
pub struct CommandStatusEntry {
    pub status: CommandStatus,
    pub error_message: Option<String>,
}

/// The pending command ring. Uses a `Mutex` rather than the status ring's lock-free indices
/// because multiple producers enqueue concurrently.
struct PendingRing {
    entries: VecDeque<Command>,
}

/// The per-command status ring, keyed by enqueue timestamp.
struct StatusRing {
    entries: VecDeque<(CommandTimestamp, CommandStatusEntry)>,
}

impl StatusRing {
    fn new() -> Self {
        StatusRing {
            entries: VecDeque::new(),
        }
    }

    fn insert(&mut self, ts: CommandTimestamp) {
        if self.entries.len() >= STATUS_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back((
            ts,
            CommandStatusEntry {
                status: CommandStatus::Pending,
                error_message: None,
            },
        ));
    }

    fn get(&self, ts: CommandTimestamp) -> Option<CommandStatusEntry> {
        self.entries
            .iter()
            .find(|(t, _)| *t == ts)
            .map(|(_, e)| e.clone())
    }

    fn update(&mut self, ts: CommandTimestamp, status: CommandStatus, error_message: Option<String>) {
        if let Some((_, entry)) = self.entries.iter_mut().find(|(t, _)| *t == ts) {
            entry.status = status;
            entry.error_message = error_message;
        }
    }

    fn remove_completed(&mut self) {
        self.entries
            .retain(|(_, e)| !matches!(e.status, CommandStatus::Completed | CommandStatus::Failed));
    }
}

/// The command pipeline: backpressure by rejection, never by blocking.
pub struct CommandQueue {
    pending: Mutex<PendingRing>,
    status: Mutex<StatusRing>,
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandQueue {
    pub fn new() -> Self {
        CommandQueue {
            pending: Mutex::new(PendingRing {
                entries: VecDeque::new(),
            }),
            status: Mutex::new(StatusRing::new()),
        }
    }

    /// Appends `cmd` to the tail of the queue. Fails `QueueFull` without side effects once
    /// `count >= QUEUE_CAPACITY`.
    pub fn enqueue(&self, cmd: Command) -> Result<CommandTimestamp> {
        let mut pending = self.pending.lock().unwrap();
        if pending.entries.len() >= QUEUE_CAPACITY {
            return Err(Error::QueueFull);
        }
        let ts = cmd.timestamp;
        pending.entries.push_back(cmd);
        drop(pending);
        self.status.lock().unwrap().insert(ts);
        Ok(ts)
    }

    /// Returns and removes the head of the queue, or `None` if empty. Never blocks.
    pub fn dequeue(&self) -> Option<Command> {
        self.pending.lock().unwrap().entries.pop_front()
    }

    pub fn get_status(&self, ts: CommandTimestamp) -> Option<CommandStatusEntry> {
        self.status.lock().unwrap().get(ts)
    }

    pub fn update_status(
        &self,
        ts: CommandTimestamp,
        status: CommandStatus,
        error_message: Option<String>,
    ) {
        self.status.lock().unwrap().update(ts, status, error_message);
    }

    pub fn remove_completed(&self) {
        self.status.lock().unwrap().remove_completed();
    }

    pub fn len(&self) -> usize {
        self.pending.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_rejects_past_capacity() {
        let q = CommandQueue::new();
        for _ in 0..QUEUE_CAPACITY {
            q.enqueue(Command::init()).unwrap();
        }
        assert!(matches!(q.enqueue(Command::init()), Err(Error::QueueFull)));
        assert_eq!(q.len(), QUEUE_CAPACITY);
    }

    #[test]
    fn fifo_ordering() {
        let q = CommandQueue::new();
        let a = q.enqueue(Command::add_node(1, "a", 1)).unwrap();
        let b = q.enqueue(Command::add_node(2, "b", 2)).unwrap();
        let first = q.dequeue().unwrap();
        assert_eq!(first.node_id, Some(1));
        let second = q.dequeue().unwrap();
        assert_eq!(second.node_id, Some(2));
        assert!(a < b || a == b);
    }

    #[test]
    fn status_tracks_and_prunes() {
        let q = CommandQueue::new();
        let ts = q.enqueue(Command::init()).unwrap();
        q.update_status(ts, CommandStatus::Completed, None);
        assert!(matches!(
            q.get_status(ts).unwrap().status,
            CommandStatus::Completed
        ));
        q.remove_completed();
        assert!(q.get_status(ts).is_none());
    }
}
