//! The failover orchestrator: deterministic, auditable promotion of a standby to primary when
//! the current primary is lost.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use log::{info, warn};
use serde_json::json;

use crate::config::ClusterConfig;
use crate::db::DatabaseAdmin;
use crate::error::{Error, Result};
use crate::events::{Event, EventBus, EventKind};
use crate::replication::ReplicationController;
use crate::state::{ClusterView, Core, Node, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverState {
    Normal,
    Detecting,
    Promoting,
    Completed,
    Failed,
}

/// One failover episode; created at the start of `execute` and dropped at episode end.
#[derive(Debug, Clone)]
pub struct FailoverContext {
    pub state: FailoverState,
    pub failed_node_id: u32,
    pub new_primary_node_id: u32,
    pub reason: String,
    pub started_at: SystemTime,
    pub completed_at: Option<SystemTime>,
}

/// Whether an automatic failover should be attempted right now.
pub fn should_trigger(
    view: &ClusterView,
    config: &ClusterConfig,
    primary_failure_detected: bool,
) -> bool {
    config.auto_failover_enabled
        && view.nodes.len() >= 2
        && primary_failure_detected
        && view.has_quorum()
}

/// Selects the failover candidate: among healthy standbys, the one with greatest observed WAL
/// LSN, tie-broken by lowest node ID.
pub fn select_candidate(view: &ClusterView, failed_node_id: u32) -> Result<u32> {
    view.nodes
        .iter()
        .filter(|n| n.id != failed_node_id && n.healthy && n.role != Role::Primary)
        .max_by(|a, b| a.wal_lsn.cmp(&b.wal_lsn).then(b.id.cmp(&a.id)))
        .map(|n| n.id)
        .ok_or(Error::NoCandidate)
}

/// Validates a cluster-state invariant: exactly one primary, any number (including zero) of
/// healthy standbys.
pub fn validate_cluster_state(view: &ClusterView) -> Result<()> {
    let primaries = view.nodes.iter().filter(|n| n.role == Role::Primary).count();
    if primaries != 1 {
        return Err(Error::Internal(format!(
            "invariant violated: expected exactly one primary, found {}",
            primaries
        )));
    }
    Ok(())
}

pub struct FailoverOrchestrator<'a, D: DatabaseAdmin> {
    core: &'a Core,
    db: &'a D,
    replication: &'a ReplicationController<D>,
    events: &'a EventBus,
    cluster_name: String,
}

impl<'a, D: DatabaseAdmin> FailoverOrchestrator<'a, D> {
    pub fn new(
        core: &'a Core,
        db: &'a D,
        replication: &'a ReplicationController<D>,
        events: &'a EventBus,
        cluster_name: impl Into<String>,
    ) -> Self {
        FailoverOrchestrator {
            core,
            db,
            replication,
            events,
            cluster_name: cluster_name.into(),
        }
    }

    /// Runs the full nine-step promotion sequence.
    pub fn execute(&self, failed_node_id: u32, reason: impl Into<String>) -> Result<FailoverContext> {
        let mut ctx = FailoverContext {
            state: FailoverState::Detecting,
            failed_node_id,
            new_primary_node_id: 0,
            reason: reason.into(),
            started_at: SystemTime::now(),
            completed_at: None,
        };

        self.publish(EventKind::FailoverStarted, failed_node_id, json!({"reason": ctx.reason}));

        let view = self.core.get_cluster_view();
        let candidate_id = match select_candidate(&view, failed_node_id) {
            Ok(id) => id,
            Err(err) => {
                ctx.state = FailoverState::Failed;
                ctx.completed_at = Some(SystemTime::now());
                self.publish(EventKind::FailoverFailed, failed_node_id, json!({"reason": "no_candidate"}));
                return Err(err);
            }
        };
        ctx.new_primary_node_id = candidate_id;
        ctx.state = FailoverState::Promoting;

        // Step 4: stop replication on the candidate (pause WAL replay) before promoting.
        if let Err(err) = self.db.stop() {
            warn!("failed to pause replication before promotion: {}", err);
        }

        // Step 5: promote.
        if let Err(err) = self.db.promote() {
            ctx.state = FailoverState::Failed;
            ctx.completed_at = Some(SystemTime::now());
            self.publish(EventKind::FailoverFailed, candidate_id, json!({"reason": err.to_string()}));
            return Err(err);
        }

        // Step 6: update local cluster view.
        self.demote_failed_primary(failed_node_id);
        self.core.set_primary(candidate_id);

        // Step 7: wait, then validate.
        std::thread::sleep(Duration::from_secs(3));
        let status = self.db.status()?;
        if !(status.is_running && status.is_primary && status.accepts_connections && !status.is_in_recovery) {
            ctx.state = FailoverState::Failed;
            ctx.completed_at = Some(SystemTime::now());
            self.publish(EventKind::FailoverFailed, candidate_id, json!({"reason": "validation_failed"}));
            return Err(Error::PromotionFailed("post-promotion validation failed".to_string()));
        }

        // Step 8: rewire synchronous_standby_names.
        let view = self.core.get_cluster_view();
        for node in view.nodes.iter().filter(|n| n.id != candidate_id && n.healthy) {
            let _ = self
                .replication
                .add_standby(node.id, format!("node_{}", node.id));
        }
        self.db.reload_configuration()?;

        ctx.state = FailoverState::Completed;
        ctx.completed_at = Some(SystemTime::now());
        self.publish(
            EventKind::FailoverCompleted,
            candidate_id,
            json!({"failed_node_id": failed_node_id}),
        );

        let view = self.core.get_cluster_view();
        validate_cluster_state(&view)?;

        Ok(ctx)
    }

    /// Best-effort stop of the old primary's database; no coordination with the old primary is
    /// required.
    fn demote_failed_primary(&self, failed_node_id: u32) {
        let view = self.core.get_cluster_view();
        if let Some(node) = view.node(failed_node_id) {
            let mut updated = node.clone();
            updated.role = Role::Standby;
            updated.healthy = false;
            let _ = self.core.remove_node(failed_node_id);
            let _ = self.core.add_node(updated);
        }
    }

    /// Rebuild a failed standby from the current primary's basebackup.
    pub fn rebuild_replica_node(&self, primary_conninfo: &str, trigger_file: PathBuf) -> Result<()> {
        self.db.stop()?;
        self.db.basebackup(primary_conninfo)?;
        self.db.set_recovery_mode(primary_conninfo, &trigger_file)?;
        self.db.start()?;
        std::thread::sleep(Duration::from_secs(5));
        let status = self.db.status()?;
        if !status.is_in_recovery {
            return Err(Error::RecoveryConfigFailed(
                "standby did not enter recovery mode".to_string(),
            ));
        }
        Ok(())
    }

    fn publish(&self, kind: EventKind, node_id: u32, opaque: serde_json::Value) {
        info!("failover event: {:?} node={}", kind, node_id);
        self.events
            .publish(Event::new(kind, node_id, self.cluster_name.clone(), opaque));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;
    use crate::db::mock::MockDatabaseAdmin;
    use crate::replication::SyncMode;

    fn setup() -> (Core, MockDatabaseAdmin, ReplicationController<MockDatabaseAdmin>, EventBus) {
        let core = Core::new(&ClusterConfig::default());
        core.add_node(Node::new(1, "127.0.0.1", 7001)).unwrap();
        let mut n2 = Node::new(2, "127.0.0.1", 7002);
        n2.healthy = true;
        n2.wal_lsn = 100;
        core.add_node(n2).unwrap();
        let mut n3 = Node::new(3, "127.0.0.1", 7003);
        n3.healthy = true;
        n3.wal_lsn = 50;
        core.add_node(n3).unwrap();
        core.set_primary(1);
        (
            core,
            MockDatabaseAdmin::default(),
            ReplicationController::new(MockDatabaseAdmin::default(), SyncMode::RemoteApply, 1),
            EventBus::new(),
        )
    }

    #[test]
    fn selects_candidate_with_highest_wal_lsn() {
        let (core, _, _, _) = setup();
        let view = core.get_cluster_view();
        let candidate = select_candidate(&view, 1).unwrap();
        assert_eq!(candidate, 2);
    }

    #[test]
    fn no_candidate_when_no_healthy_standbys() {
        let core = Core::new(&ClusterConfig::default());
        core.add_node(Node::new(1, "127.0.0.1", 7001)).unwrap();
        let view = core.get_cluster_view();
        assert!(matches!(select_candidate(&view, 1), Err(Error::NoCandidate)));
    }

    #[test]
    fn execute_promotes_highest_lsn_standby() {
        let (core, db, repl, events) = setup();
        let orchestrator = FailoverOrchestrator::new(&core, &db, &repl, &events, "pgraft_cluster");
        let ctx = orchestrator.execute(1, "primary unreachable").unwrap();
        assert_eq!(ctx.state, FailoverState::Completed);
        assert_eq!(ctx.new_primary_node_id, 2);
        assert_eq!(core.get_cluster_view().primary_node_id, 2);
    }

    #[test]
    fn execute_fails_when_promotion_fails() {
        let (core, _, repl, events) = setup();
        let mut db = MockDatabaseAdmin::default();
        db.fail_promote = true;
        let orchestrator = FailoverOrchestrator::new(&core, &db, &repl, &events, "pgraft_cluster");
        let result = orchestrator.execute(1, "primary unreachable");
        assert!(result.is_err());
    }
}
