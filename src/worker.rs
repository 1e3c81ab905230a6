//! The consensus worker: the sole thread of control that touches the Raft engine and applies
//! committed entries. Every other task communicates with it only by enqueuing commands to the
//! command pipeline, preserving single-writer discipline over cluster state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde_json::json;

use raft::message::{ConfChange, EntryType, MessageDestination, SendableMessage};

use crate::command::{Command, CommandQueue, CommandStatus, CommandType};
use crate::config::ClusterConfig;
use crate::error::Error;
use crate::events::{Event, EventBus, EventKind};
use crate::state::{Core, Node, RaftRole, Ticker};
use crate::transport::codec::{decode_message, encode_message};
use crate::transport::TcpTransport;

/// Number of ticks between draining `Transport::recv`.
const MESSAGE_POLL_EVERY_N_TICKS: u32 = 1;
/// Maximum commands drained from the pipeline per tick.
const MAX_COMMANDS_PER_TICK: usize = 10;

pub struct ConsensusWorker {
    core: Arc<Core>,
    commands: Arc<CommandQueue>,
    transport: Arc<TcpTransport>,
    events: Arc<EventBus>,
    config: ClusterConfig,
    shutdown: Arc<AtomicBool>,
}

impl ConsensusWorker {
    pub fn new(
        core: Arc<Core>,
        commands: Arc<CommandQueue>,
        transport: Arc<TcpTransport>,
        events: Arc<EventBus>,
        config: ClusterConfig,
    ) -> Self {
        ConsensusWorker {
            core,
            commands,
            transport,
            events,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Runs the 100ms-cadence loop until shutdown. Intended to be the body of a dedicated thread.
    pub fn run(&self) {
        let mut ticker = Ticker::new(100);
        let mut tick_count: u32 = 0;

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }

            if !ticker.due() {
                std::thread::sleep(Duration::from_millis(5));
                continue;
            }

            self.tick(tick_count);
            tick_count = tick_count.wrapping_add(1);
        }

        self.transport.shutdown();
        info!("consensus worker stopped");
    }

    /// One 100ms tick: tick raft, dispatch outbound messages, apply committed entries, drain
    /// pending commands, process incoming transport messages, and check for a snapshot point.
    fn tick(&self, tick_count: u32) {
        // 1. tick raft, dispatching any messages it wants sent.
        let outbound = self.core.raft_tick();
        self.dispatch_outbound(outbound);

        // 2-3. drain committed entries and apply them.
        self.apply_committed();

        // 4. drain up to a fixed number of commands.
        self.drain_commands();

        // 5. process incoming transport messages every N ticks.
        if tick_count % MESSAGE_POLL_EVERY_N_TICKS == 0 {
            self.process_incoming_messages();
        }

        // 6. snapshot request on the leader at the configured interval.
        if self.core.raft_is_leader() {
            let last_index = self.core.raft_last_committed_log_index();
            if self.config.snapshot_interval > 0
                && last_index > 0
                && last_index % self.config.snapshot_interval == 0
            {
                debug!("snapshot interval reached at index {}", last_index);
                self.events.publish(Event::new(
                    EventKind::SnapshotCreated,
                    self.config.node_id,
                    self.config.cluster_name.clone(),
                    json!({"index": last_index}),
                ));
            }
        }

        self.update_cluster_view_from_raft();
    }

    fn update_cluster_view_from_raft(&self) {
        let (leader_id, term) = self.core.raft_leader();
        let state = if self.core.raft_is_leader() {
            RaftRole::Leader
        } else {
            RaftRole::Follower
        };
        let view_before = self.core.get_cluster_view();
        if view_before.leader_id != leader_id {
            self.events.publish(Event::new(
                EventKind::LeaderElected,
                leader_id,
                self.config.cluster_name.clone(),
                json!({"term": term}),
            ));
        }
        self.core.update_cluster_view(leader_id, term, state);
    }

    fn dispatch_outbound(&self, messages: Vec<SendableMessage<u32>>) {
        for sendable in messages {
            let encoded = encode_message(&sendable.message);
            match sendable.dest {
                MessageDestination::Broadcast => {
                    self.core.bump_counter_heartbeat();
                    for (peer, result) in self.transport.broadcast(&encoded) {
                        if let Err(err) = result {
                            debug!("broadcast to peer {} failed: {}", peer, err);
                        }
                    }
                }
                MessageDestination::To(peer_id) => {
                    if let Err(err) = self.transport.send(peer_id, &encoded) {
                        debug!("send to peer {} failed: {}", peer_id, err);
                    }
                }
            }
        }
    }

    fn apply_committed(&self) {
        for entry in self.core.raft_take_committed() {
            let data = entry.data().cloned().unwrap_or_default();
            let index = match self.core.log_append(entry.term.id, data.clone()) {
                Ok(index) => index,
                Err(err) => {
                    warn!("failed to mirror committed entry: {}", err);
                    continue;
                }
            };
            self.core.log_commit(index);
            self.core.bump_counter_message();

            match entry.entry_type {
                EntryType::Noop => {
                    let _ = self.core.log_apply(index);
                }
                EntryType::Normal(_) => {
                    info!("applying committed log entry {} ({} bytes)", index, data.len());
                    let _ = self.core.log_apply(index);
                }
                EntryType::ConfChange(change) => {
                    self.apply_conf_change(change);
                    let _ = self.core.log_apply(index);
                }
            }
        }
    }

    fn apply_conf_change(&self, change: ConfChange) {
        if change.is_add {
            let node = Node::new(change.node_id, change.address.clone(), change.port as u16);
            match self.core.add_node(node) {
                Ok(()) => {
                    if let Err(err) =
                        self.transport
                            .connect(change.node_id, &change.address, change.port as u16)
                    {
                        warn!("failed to connect to newly added peer {}: {}", change.node_id, err);
                    }
                    self.events.publish(Event::new(
                        EventKind::NodeAdded,
                        change.node_id,
                        self.config.cluster_name.clone(),
                        json!({"address": change.address, "port": change.port}),
                    ));
                }
                Err(err) => warn!("failed to apply add-node for {}: {}", change.node_id, err),
            }
        } else {
            match self.core.remove_node(change.node_id) {
                Ok(()) => {
                    self.transport.disconnect(change.node_id);
                    self.events.publish(Event::new(
                        EventKind::NodeRemoved,
                        change.node_id,
                        self.config.cluster_name.clone(),
                        json!({}),
                    ));
                }
                Err(err) => warn!("failed to apply remove-node for {}: {}", change.node_id, err),
            }
        }
    }

    fn drain_commands(&self) {
        for _ in 0..MAX_COMMANDS_PER_TICK {
            let cmd = match self.commands.dequeue() {
                Some(cmd) => cmd,
                None => break,
            };
            self.commands
                .update_status(cmd.timestamp, CommandStatus::Processing, None);
            let result = self.dispatch_command(&cmd);
            match result {
                Ok(()) => self
                    .commands
                    .update_status(cmd.timestamp, CommandStatus::Completed, None),
                Err(err) => self.commands.update_status(
                    cmd.timestamp,
                    CommandStatus::Failed,
                    Some(err.to_string()),
                ),
            }
            if cmd.kind == CommandType::Shutdown {
                self.shutdown.store(true, Ordering::Relaxed);
                break;
            }
        }
    }

    fn dispatch_command(&self, cmd: &Command) -> crate::error::Result<()> {
        match cmd.kind {
            CommandType::Init => Ok(()),
            CommandType::AddNode => {
                let node_id = cmd.node_id.ok_or_else(|| {
                    Error::InvalidParameter("ADD_NODE missing node_id".to_string())
                })?;
                let address = cmd
                    .address
                    .clone()
                    .ok_or_else(|| Error::InvalidParameter("ADD_NODE missing address".to_string()))?;
                let port = cmd
                    .port
                    .ok_or_else(|| Error::InvalidParameter("ADD_NODE missing port".to_string()))?;
                let change = ConfChange {
                    is_add: true,
                    node_id,
                    address,
                    port: port as u32,
                };
                let outbound = self.core.raft_propose_conf_change(change)?;
                self.dispatch_outbound(outbound);
                Ok(())
            }
            CommandType::RemoveNode => {
                let node_id = cmd.node_id.ok_or_else(|| {
                    Error::InvalidParameter("REMOVE_NODE missing node_id".to_string())
                })?;
                let change = ConfChange {
                    is_add: false,
                    node_id,
                    address: String::new(),
                    port: 0,
                };
                let outbound = self.core.raft_propose_conf_change(change)?;
                self.dispatch_outbound(outbound);
                Ok(())
            }
            CommandType::LogAppend => {
                let data = cmd
                    .log_data
                    .clone()
                    .ok_or_else(|| Error::InvalidParameter("LOG_APPEND missing data".to_string()))?;
                let outbound = self.core.raft_propose(data)?;
                self.dispatch_outbound(outbound);
                Ok(())
            }
            // Advisory only: actual commit is driven by Raft.
            CommandType::LogCommit => Ok(()),
            CommandType::LogApply => {
                let index = cmd
                    .log_index
                    .ok_or_else(|| Error::InvalidParameter("LOG_APPLY missing index".to_string()))?;
                self.core.log_apply(index)
            }
            CommandType::Shutdown => Ok(()),
        }
    }

    fn process_incoming_messages(&self) {
        for (peer_id, payload) in self.transport.try_recv_all() {
            match decode_message(&payload) {
                Ok(message) => {
                    let outbound = self.core.raft_step(message, peer_id);
                    self.dispatch_outbound(outbound);
                }
                Err(err) => warn!("dropping malformed frame from {}: {}", peer_id, err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;

    fn worker() -> ConsensusWorker {
        let config = ClusterConfig::default();
        let core = Arc::new(Core::new(&config));
        let commands = Arc::new(CommandQueue::new());
        let transport = Arc::new(TcpTransport::new(config.node_id));
        let events = Arc::new(EventBus::new());
        ConsensusWorker::new(core, commands, transport, events, config)
    }

    #[test]
    fn init_command_completes() {
        let w = worker();
        let ts = w.commands.enqueue(Command::init()).unwrap();
        w.drain_commands();
        assert!(matches!(
            w.commands.get_status(ts).unwrap().status,
            CommandStatus::Completed
        ));
    }

    #[test]
    fn add_node_fails_without_leadership() {
        let w = worker();
        let ts = w.commands.enqueue(Command::add_node(2, "127.0.0.1", 7002)).unwrap();
        w.drain_commands();
        assert!(matches!(
            w.commands.get_status(ts).unwrap().status,
            CommandStatus::Failed
        ));
    }

    #[test]
    fn tick_advances_without_panicking() {
        let w = worker();
        for i in 0..5 {
            w.tick(i);
        }
    }
}
