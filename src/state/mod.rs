//! The shared state store: cluster view, Raft durable state, and the mirrored log, each behind
//! its own spinlock. `Core` is the single context value, built once at startup and passed
//! explicitly to every component rather than living behind process-wide mutable singletons.

pub mod spinlock;

use std::collections::VecDeque;
use std::fmt;
use std::time::{Instant, SystemTime};

use bytes::Bytes;
use log::{debug, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;

use raft::log::memory::InMemoryLog;
use raft::message::{ConfChange, LogEntry as RaftLogEntry, Message, SendableMessage};
use raft::node::{AppendError, Config as RaftConfig, Node as RaftNode};

use crate::config::ClusterConfig;
use crate::error::{Error, Result};
use crate::state::spinlock::Spinlock;

/// Maximum number of nodes in a cluster.
pub const MAX_NODES: usize = 16;
/// Maximum number of log entries retained in memory.
pub const MAX_LOG_ENTRIES: usize = 1000;
/// Maximum size, in bytes, of a single log entry's payload.
pub const MAX_ENTRY_BYTES: usize = 1024;

pub type RaftNodeId = u32;
pub type RaftHandle = RaftNode<InMemoryLog, StdRng, RaftNodeId>;

/// The role PostgreSQL plays on a given node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    Standby,
    Unknown,
}

impl Default for Role {
    fn default() -> Self {
        Role::Unknown
    }
}

/// This node's view of the Raft state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Leader,
    Candidate,
    Follower,
}

impl fmt::Display for RaftRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RaftRole::Leader => write!(f, "leader"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Follower => write!(f, "follower"),
        }
    }
}

/// A cluster member, created when its add-node conf-change commits and destroyed when its
/// remove-node conf-change commits.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: u32,
    pub address: String,
    pub port: u16,
    pub role: Role,
    pub healthy: bool,
    pub health_score: f64,
    pub last_seen: SystemTime,
    pub wal_lsn: u64,
    pub replication_lag_ms: i32,
}

impl Node {
    pub fn new(id: u32, address: impl Into<String>, port: u16) -> Self {
        Node {
            id,
            address: address.into(),
            port,
            role: Role::Unknown,
            healthy: false,
            health_score: 0.0,
            last_seen: SystemTime::now(),
            wal_lsn: 0,
            replication_lag_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Counters {
    pub messages_processed: u64,
    pub heartbeats_sent: u64,
    pub elections_triggered: u64,
}

/// The singleton cluster view.
#[derive(Debug, Clone)]
pub struct ClusterView {
    pub cluster_name: String,
    pub local_node_id: u32,
    pub leader_id: u32,
    pub current_term: u64,
    pub state: RaftRole,
    pub nodes: Vec<Node>,
    pub primary_node_id: u32,
    pub counters: Counters,
}

impl ClusterView {
    fn new(cluster_name: String, local_node_id: u32) -> Self {
        ClusterView {
            cluster_name,
            local_node_id,
            leader_id: 0,
            current_term: 0,
            state: RaftRole::Follower,
            nodes: Vec::new(),
            primary_node_id: 0,
            counters: Counters::default(),
        }
    }

    pub fn node(&self, id: u32) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn node_mut(&mut self, id: u32) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| n.id == id)
    }

    pub fn healthy_nodes(&self) -> usize {
        self.nodes.iter().filter(|n| n.healthy).count()
    }

    pub fn has_quorum(&self) -> bool {
        let total = self.nodes.len().max(1);
        self.healthy_nodes() >= total / 2 + 1
    }
}

/// A mirrored log entry, recorded by the consensus worker as Raft ready-sets and committed
/// entries are processed. This is deliberately separate from the Raft engine's own backing `Log`
/// (`raft::log::memory::InMemoryLog`): the Raft log stores exactly what the protocol needs to
/// replicate, while this mirror carries externally-visible fields (`timestamp`, `applied`) and is
/// what `log_get`/`log_last_index`/etc. expose.
#[derive(Debug, Clone)]
pub struct LogEntryRecord {
    pub index: u64,
    pub term: u64,
    pub timestamp: SystemTime,
    pub data: Bytes,
    pub committed: bool,
    pub applied: bool,
}

struct LogBook {
    entries: VecDeque<LogEntryRecord>,
    base_index: u64,
    commit_index: u64,
    last_applied: u64,
}

impl LogBook {
    fn new() -> Self {
        LogBook {
            entries: VecDeque::new(),
            base_index: 0,
            commit_index: 0,
            last_applied: 0,
        }
    }

    fn position(&self, index: u64) -> Option<usize> {
        if index <= self.base_index {
            return None;
        }
        let offset = index - self.base_index - 1;
        let offset = usize::try_from(offset).ok()?;
        if offset < self.entries.len() {
            Some(offset)
        } else {
            None
        }
    }
}

/// The single `Core` context value: owns the cluster view, the mirrored log, and the Raft
/// engine, each behind its own spinlock, acquired only across a single accessor call.
pub struct Core {
    cluster_view: Spinlock<ClusterView>,
    log: Spinlock<LogBook>,
    raft: Spinlock<RaftHandle>,
}

impl Core {
    pub fn new(config: &ClusterConfig) -> Self {
        let heartbeat_ticks = (config.heartbeat_interval_ms / 100).max(1) as u32;
        let election_ticks = ((config.election_timeout_ms / 100).max(heartbeat_ticks as u64 * 2))
            as u32;

        let raft_config = RaftConfig {
            election_timeout_ticks: election_ticks,
            heartbeat_interval_ticks: heartbeat_ticks,
            replication_chunk_size: 8192,
        };

        let peers = config.peers.iter().map(|p| p.node_id).collect();

        let raft = RaftNode::new(
            config.node_id,
            peers,
            InMemoryLog::with_capacity(MAX_LOG_ENTRIES, MAX_LOG_ENTRIES * MAX_ENTRY_BYTES),
            StdRng::from_entropy(),
            raft_config,
        );

        Core {
            cluster_view: Spinlock::new(ClusterView::new(
                config.cluster_name.clone(),
                config.node_id,
            )),
            log: Spinlock::new(LogBook::new()),
            raft: Spinlock::new(raft),
        }
    }

    //
    // Cluster view accessors
    //

    pub fn get_cluster_view(&self) -> ClusterView {
        self.cluster_view.lock().clone()
    }

    pub fn update_cluster_view(&self, leader_id: u32, term: u64, state: RaftRole) {
        let mut view = self.cluster_view.lock();
        view.leader_id = leader_id;
        if term >= view.current_term {
            view.current_term = term;
        }
        view.state = state;
    }

    pub fn add_node(&self, node: Node) -> Result<()> {
        let mut view = self.cluster_view.lock();
        if view.nodes.iter().any(|n| n.id == node.id) {
            return Ok(());
        }
        if view.nodes.len() >= MAX_NODES {
            return Err(Error::ClusterFull(MAX_NODES));
        }
        view.nodes.push(node);
        Ok(())
    }

    pub fn remove_node(&self, id: u32) -> Result<()> {
        let mut view = self.cluster_view.lock();
        let before = view.nodes.len();
        view.nodes.retain(|n| n.id != id);
        if view.primary_node_id == id {
            view.primary_node_id = 0;
        }
        if before == view.nodes.len() {
            return Err(Error::NodeNotFound(id));
        }
        Ok(())
    }

    pub fn set_primary(&self, id: u32) {
        let mut view = self.cluster_view.lock();
        view.primary_node_id = id;
        if let Some(node) = view.node_mut(id) {
            node.role = Role::Primary;
        }
    }

    pub fn update_node_liveness(
        &self,
        id: u32,
        healthy: bool,
        health_score: f64,
        wal_lsn: u64,
        replication_lag_ms: i32,
    ) {
        let mut view = self.cluster_view.lock();
        if let Some(node) = view.node_mut(id) {
            node.healthy = healthy;
            node.health_score = health_score;
            node.wal_lsn = wal_lsn;
            node.replication_lag_ms = replication_lag_ms;
            node.last_seen = SystemTime::now();
        }
    }

    pub fn bump_counter_message(&self) {
        self.cluster_view.lock().counters.messages_processed += 1;
    }

    pub fn bump_counter_heartbeat(&self) {
        self.cluster_view.lock().counters.heartbeats_sent += 1;
    }

    pub fn bump_counter_election(&self) {
        self.cluster_view.lock().counters.elections_triggered += 1;
    }

    //
    // Log accessors (mirrored book-keeping, see `LogEntryRecord` docs)
    //

    pub fn log_append(&self, term: u64, data: Bytes) -> Result<u64> {
        if data.len() > MAX_ENTRY_BYTES {
            return Err(Error::InvalidParameter(format!(
                "log entry exceeds {} bytes",
                MAX_ENTRY_BYTES
            )));
        }
        let mut log = self.log.lock();
        let index = log.base_index + log.entries.len() as u64 + 1;
        log.entries.push_back(LogEntryRecord {
            index,
            term,
            timestamp: SystemTime::now(),
            data,
            committed: false,
            applied: false,
        });
        if log.entries.len() > MAX_LOG_ENTRIES {
            log.entries.pop_front();
            log.base_index += 1;
        }
        Ok(index)
    }

    pub fn log_commit(&self, index: u64) {
        let mut log = self.log.lock();
        if let Some(pos) = log.position(index) {
            log.entries[pos].committed = true;
        }
        if index > log.commit_index {
            log.commit_index = index;
        }
    }

    pub fn log_apply(&self, index: u64) -> Result<()> {
        let mut log = self.log.lock();
        match log.position(index) {
            Some(pos) => {
                if !log.entries[pos].committed {
                    return Err(Error::InvalidParameter(
                        "cannot apply an uncommitted entry".to_string(),
                    ));
                }
                log.entries[pos].applied = true;
                if index > log.last_applied {
                    log.last_applied = index;
                }
                Ok(())
            }
            None => Err(Error::InvalidParameter(format!(
                "no such log entry: {}",
                index
            ))),
        }
    }

    pub fn log_get(&self, index: u64) -> Option<LogEntryRecord> {
        let mut log = self.log.lock();
        log.position(index).map(|pos| log.entries[pos].clone())
    }

    pub fn log_last_index(&self) -> u64 {
        let log = self.log.lock();
        log.base_index + log.entries.len() as u64
    }

    pub fn log_commit_index(&self) -> u64 {
        self.log.lock().commit_index
    }

    pub fn log_last_applied(&self) -> u64 {
        self.log.lock().last_applied
    }

    pub fn log_reset(&self) {
        let mut log = self.log.lock();
        *log = LogBook::new();
    }

    pub fn log_cleanup_before(&self, index: u64) {
        let mut log = self.log.lock();
        while log.base_index < index {
            if log.entries.pop_front().is_none() {
                break;
            }
            log.base_index += 1;
        }
        debug!("pruned log entries up to index {}", index);
    }

    //
    // Raft engine accessors — the consensus worker is the sole caller, per the single-writer
    // discipline. Each call locks for its duration only; message iterators are drained to owned
    // `Vec`s before the lock is released.
    //

    pub fn raft_tick(&self) -> Vec<SendableMessage<RaftNodeId>> {
        self.raft.lock().timer_tick().collect()
    }

    pub fn raft_step(&self, message: Message, from: RaftNodeId) -> Vec<SendableMessage<RaftNodeId>> {
        self.raft.lock().receive(message, from).collect()
    }

    pub fn raft_propose(&self, data: Bytes) -> Result<Vec<SendableMessage<RaftNodeId>>> {
        let mut raft = self.raft.lock();
        match raft.append(data) {
            Ok(iter) => Ok(iter.collect()),
            Err(AppendError::Cancelled { .. }) => Err(Error::NotLeader),
            Err(AppendError::LogErr(_)) => {
                Err(Error::Internal("log append failed".to_string()))
            }
        }
    }

    pub fn raft_propose_conf_change(
        &self,
        change: ConfChange,
    ) -> Result<Vec<SendableMessage<RaftNodeId>>> {
        let mut raft = self.raft.lock();
        match raft.propose_conf_change(change) {
            Ok(iter) => Ok(iter.collect()),
            Err(AppendError::Cancelled { .. }) => Err(Error::NotLeader),
            Err(AppendError::LogErr(_)) => {
                Err(Error::Internal("log append failed".to_string()))
            }
        }
    }

    pub fn raft_take_committed(&self) -> Vec<RaftLogEntry> {
        self.raft.lock().take_committed().collect()
    }

    pub fn raft_is_leader(&self) -> bool {
        self.raft.lock().is_leader()
    }

    pub fn raft_leader(&self) -> (u32, u64) {
        let raft = self.raft.lock();
        let (leader, term) = raft.leader();
        (leader.copied().unwrap_or(0), term.id)
    }

    pub fn raft_node_id(&self) -> u32 {
        *self.raft.lock().node_id()
    }

    pub fn raft_peers(&self) -> Vec<u32> {
        self.raft.lock().peers().iter().copied().collect()
    }

    pub fn raft_last_committed_log_index(&self) -> u64 {
        self.raft.lock().last_committed_log_index().id
    }
}

/// Monotonic tick source for the 100ms Raft cadence, kept separate from `Core` so tests can
/// drive ticks manually without a real clock.
pub struct Ticker {
    last: Instant,
    period_ms: u64,
}

impl Ticker {
    pub fn new(period_ms: u64) -> Self {
        Ticker {
            last: Instant::now(),
            period_ms,
        }
    }

    pub fn due(&mut self) -> bool {
        if self.last.elapsed().as_millis() as u64 >= self.period_ms {
            self.last = Instant::now();
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ClusterConfig {
        ClusterConfig {
            node_id: 1,
            ..ClusterConfig::default()
        }
    }

    #[test]
    fn add_node_rejects_past_capacity() {
        let core = Core::new(&test_config());
        for id in 1..=MAX_NODES as u32 {
            core.add_node(Node::new(id, "127.0.0.1", 7000 + id as u16))
                .unwrap();
        }
        let err = core.add_node(Node::new(200, "127.0.0.1", 9999));
        assert!(matches!(err, Err(Error::ClusterFull(16))));
    }

    #[test]
    fn add_node_is_idempotent() {
        let core = Core::new(&test_config());
        core.add_node(Node::new(2, "127.0.0.1", 7002)).unwrap();
        core.add_node(Node::new(2, "127.0.0.1", 7002)).unwrap();
        assert_eq!(core.get_cluster_view().nodes.len(), 1);
    }

    #[test]
    fn log_apply_requires_commit() {
        let core = Core::new(&test_config());
        let idx = core.log_append(1, Bytes::from_static(b"hello")).unwrap();
        assert!(core.log_apply(idx).is_err());
        core.log_commit(idx);
        assert!(core.log_apply(idx).is_ok());
        assert_eq!(core.log_last_applied(), idx);
    }

    #[test]
    fn log_rejects_oversized_entry() {
        let core = Core::new(&test_config());
        let data = Bytes::from(vec![0u8; MAX_ENTRY_BYTES + 1]);
        assert!(core.log_append(1, data).is_err());
    }
}
