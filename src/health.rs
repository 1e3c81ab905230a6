//! The health monitor: periodic liveness probing of the local and remote database instances,
//! feeding observations to the cluster view and, on sustained primary loss, to the failover
//! orchestrator via a typed channel of health events.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use crossbeam_channel::Sender;
use log::{info, warn};

use crate::db::DatabaseAdmin;
use crate::state::{Core, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Ok,
    Warning,
    Error,
    Critical,
}

/// Sent to the failover orchestrator once the known primary has failed `failover_threshold`
/// consecutive checks.
#[derive(Debug, Clone, Copy)]
pub struct PrimaryLossEvent {
    pub failed_node_id: u32,
}

pub struct HealthMonitorConfig {
    pub period: Duration,
    pub failover_threshold: u32,
    pub max_replication_lag_ms: i64,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        HealthMonitorConfig {
            period: Duration::from_secs(5),
            failover_threshold: 3,
            max_replication_lag_ms: 10_000,
        }
    }
}

/// A probe of one remote node's liveness. The health monitor owns probing; `RemoteProbe` is the
/// seam so tests can substitute a scripted probe instead of a real TCP dial.
pub trait RemoteProbe: Send + Sync {
    fn probe(&self, node_id: u32, address: &str, port: u16) -> Option<RemoteObservation>;
}

#[derive(Debug, Clone, Copy)]
pub struct RemoteObservation {
    pub wal_lsn: u64,
    pub replication_lag_ms: i32,
}

/// Dials the remote node's control port with a bounded timeout. Returns `None` on any failure —
/// the monitor treats that as unhealthy rather than propagating the error.
pub struct TcpRemoteProbe {
    pub timeout: Duration,
}

impl Default for TcpRemoteProbe {
    fn default() -> Self {
        TcpRemoteProbe {
            timeout: Duration::from_millis(500),
        }
    }
}

impl RemoteProbe for TcpRemoteProbe {
    fn probe(&self, _node_id: u32, address: &str, port: u16) -> Option<RemoteObservation> {
        use std::net::TcpStream;
        let addr = format!("{}:{}", address, port).parse().ok()?;
        TcpStream::connect_timeout(&addr, self.timeout).ok()?;
        // A real deployment reads WAL LSN and lag off the peer's status channel; absent that
        // channel here, reachability alone is treated as "caught up" for liveness purposes.
        Some(RemoteObservation {
            wal_lsn: 0,
            replication_lag_ms: 0,
        })
    }
}

/// The subset of health state the HTTP control surface reads, shared across threads
/// independently of the monitor's generic parameters.
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub last_check: SystemTime,
}

impl Default for HealthSnapshot {
    fn default() -> Self {
        HealthSnapshot {
            status: HealthStatus::Ok,
            last_check: SystemTime::now(),
        }
    }
}

pub struct HealthMonitor<D: DatabaseAdmin, P: RemoteProbe> {
    local_db: D,
    probe: P,
    config: HealthMonitorConfig,
    consecutive_primary_failures: AtomicU32,
    last_activity: std::sync::Mutex<Instant>,
    checks_total: AtomicU32,
    checks_succeeded: AtomicU32,
    snapshot: Arc<Mutex<HealthSnapshot>>,
}

impl<D: DatabaseAdmin, P: RemoteProbe> HealthMonitor<D, P> {
    pub fn new(local_db: D, probe: P, config: HealthMonitorConfig) -> Self {
        HealthMonitor {
            local_db,
            probe,
            config,
            consecutive_primary_failures: AtomicU32::new(0),
            last_activity: std::sync::Mutex::new(Instant::now()),
            checks_total: AtomicU32::new(0),
            checks_succeeded: AtomicU32::new(0),
            snapshot: Arc::new(Mutex::new(HealthSnapshot::default())),
        }
    }

    /// A clone of the shared handle the HTTP control surface reads from.
    pub fn snapshot_handle(&self) -> Arc<Mutex<HealthSnapshot>> {
        self.snapshot.clone()
    }

    /// Runs one monitoring cycle against `core`, publishing a `PrimaryLossEvent` through
    /// `on_primary_loss` if the known primary has now failed `failover_threshold` consecutive
    /// checks in a row.
    pub fn run_cycle(&self, core: &Core, on_primary_loss: &Sender<PrimaryLossEvent>) -> HealthStatus {
        self.checks_total.fetch_add(1, Ordering::Relaxed);
        *self.last_activity.lock().unwrap() = Instant::now();

        let view = core.get_cluster_view();
        let local_id = view.local_node_id;

        let local_ok = self.check_local(&view, local_id);
        if local_ok {
            self.checks_succeeded.fetch_add(1, Ordering::Relaxed);
        }

        let remote_ids: Vec<u32> = view.nodes.iter().map(|n| n.id).filter(|&id| id != local_id).collect();

        for node_id in remote_ids {
            let (address, port) = match view.node(node_id) {
                Some(n) => (n.address.clone(), n.port),
                None => continue,
            };
            match self.probe.probe(node_id, &address, port) {
                Some(obs) => {
                    let healthy = (obs.replication_lag_ms as i64) <= self.config.max_replication_lag_ms;
                    let score = if healthy { 1.0 } else { 0.5 };
                    core.update_node_liveness(node_id, true, score, obs.wal_lsn, obs.replication_lag_ms);
                }
                None => {
                    core.update_node_liveness(node_id, false, 0.0, 0, 0);
                }
            }
        }

        core.update_node_liveness(
            local_id,
            local_ok,
            if local_ok { 1.0 } else { 0.0 },
            0,
            0,
        );

        let view = core.get_cluster_view();
        let healthy_nodes = view.healthy_nodes();
        let has_quorum = view.has_quorum();
        info!(
            "health cycle: {}/{} nodes healthy, quorum={}",
            healthy_nodes,
            view.nodes.len(),
            has_quorum
        );

        self.detect_primary_loss(&view, on_primary_loss);

        let status = self.overall_status();
        *self.snapshot.lock().unwrap() = HealthSnapshot {
            status,
            last_check: SystemTime::now(),
        };
        status
    }

    /// Accepting connections alone isn't enough: a primary stuck in recovery, or a standby that
    /// somehow promoted itself, answers the socket but is in the wrong role.
    fn check_local(&self, view: &crate::state::ClusterView, local_id: u32) -> bool {
        let status = match self.local_db.status() {
            Ok(status) => status,
            Err(_) => return false,
        };
        if !status.is_running || !status.accepts_connections {
            return false;
        }
        if view.primary_node_id == 0 {
            return true;
        }
        let expect_primary = view.primary_node_id == local_id;
        if expect_primary {
            status.is_primary && !status.is_in_recovery
        } else {
            status.is_in_recovery
        }
    }

    fn detect_primary_loss(&self, view: &crate::state::ClusterView, on_primary_loss: &Sender<PrimaryLossEvent>) {
        if view.primary_node_id == 0 {
            self.consecutive_primary_failures.store(0, Ordering::Relaxed);
            return;
        }
        let primary_healthy = view
            .node(view.primary_node_id)
            .map(|n| n.healthy || n.role == Role::Primary && n.id == view.local_node_id)
            .unwrap_or(false);

        if primary_healthy {
            self.consecutive_primary_failures.store(0, Ordering::Relaxed);
            return;
        }

        let failures = self.consecutive_primary_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= self.config.failover_threshold {
            warn!(
                "primary node {} failed {} consecutive checks, notifying failover orchestrator",
                view.primary_node_id, failures
            );
            let _ = on_primary_loss.send(PrimaryLossEvent {
                failed_node_id: view.primary_node_id,
            });
            self.consecutive_primary_failures.store(0, Ordering::Relaxed);
        }
    }

    /// Overall health status: time since last activity and observed request success rate.
    fn overall_status(&self) -> HealthStatus {
        let since_activity = self.last_activity.lock().unwrap().elapsed();
        let total = self.checks_total.load(Ordering::Relaxed).max(1);
        let succeeded = self.checks_succeeded.load(Ordering::Relaxed);
        let success_rate = succeeded as f64 / total as f64;

        if since_activity > Duration::from_secs(30) {
            return HealthStatus::Error;
        }
        if success_rate < 0.5 {
            return HealthStatus::Critical;
        }
        if since_activity > Duration::from_secs(10) || success_rate < 0.8 {
            return HealthStatus::Warning;
        }
        HealthStatus::Ok
    }

    pub fn last_check(&self) -> SystemTime {
        self.snapshot.lock().unwrap().last_check
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;
    use crate::db::mock::MockDatabaseAdmin;
    use crate::state::Node;
    use crossbeam_channel::unbounded;

    struct AlwaysFailProbe;
    impl RemoteProbe for AlwaysFailProbe {
        fn probe(&self, _node_id: u32, _address: &str, _port: u16) -> Option<RemoteObservation> {
            None
        }
    }

    #[test]
    fn primary_loss_fires_after_threshold() {
        let core = Core::new(&ClusterConfig::default());
        core.add_node(Node::new(1, "127.0.0.1", 7001)).unwrap();
        core.add_node(Node::new(2, "127.0.0.1", 7002)).unwrap();
        core.set_primary(2);

        let monitor = HealthMonitor::new(
            MockDatabaseAdmin::default(),
            AlwaysFailProbe,
            HealthMonitorConfig {
                failover_threshold: 2,
                ..HealthMonitorConfig::default()
            },
        );
        let (tx, rx) = unbounded();

        monitor.run_cycle(&core, &tx);
        assert!(rx.try_recv().is_err());
        monitor.run_cycle(&core, &tx);
        let event = rx.try_recv().expect("primary loss event");
        assert_eq!(event.failed_node_id, 2);
    }

    #[test]
    fn check_local_flags_role_mismatch() {
        let core = Core::new(&ClusterConfig::default());
        core.add_node(Node::new(1, "127.0.0.1", 7001)).unwrap();
        core.set_primary(1);
        let view = core.get_cluster_view();

        let monitor = HealthMonitor::new(
            MockDatabaseAdmin::default(),
            AlwaysFailProbe,
            HealthMonitorConfig::default(),
        );
        // MockDatabaseAdmin defaults to a standby's status (is_in_recovery); the view expects
        // this node to be primary, so the local check must fail despite accepting connections.
        assert!(!monitor.check_local(&view, view.local_node_id));
    }
}
