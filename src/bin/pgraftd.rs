//! The `pgraft` daemon: loads configuration, brings up the transport, the consensus worker, the
//! health monitor, and the HTTP control surface, then runs until the worker processes a SHUTDOWN
//! command.

use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::unbounded;
use log::{error, info, warn};

use pgraft::command::{Command, CommandQueue};
use pgraft::config::ClusterConfig;
use pgraft::control::{self, ControlServer};
use pgraft::db::{ServerVersion, ShellDatabaseAdmin};
use pgraft::events::EventBus;
use pgraft::failover::{should_trigger, FailoverOrchestrator};
use pgraft::health::{HealthMonitor, HealthMonitorConfig, TcpRemoteProbe};
use pgraft::replication::ReplicationController;
use pgraft::state::Core;
use pgraft::worker::ConsensusWorker;

fn local_db() -> ShellDatabaseAdmin {
    let data_dir = std::env::var("PGRAFT_DATA_DIR").unwrap_or_else(|_| "/var/lib/postgresql/data".to_string());
    let bin_dir = std::env::var("PGRAFT_PG_BIN_DIR").unwrap_or_else(|_| "/usr/lib/postgresql/bin".to_string());
    ShellDatabaseAdmin::new(data_dir, bin_dir, ServerVersion::Modern)
}

fn main() {
    env_logger::init();

    let config = match ClusterConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!("invalid configuration: {}", err);
            process::exit(2);
        }
    };
    info!(
        "starting pgraft node {} in cluster '{}'",
        config.node_id, config.cluster_name
    );

    let core = Arc::new(Core::new(&config));
    let commands = Arc::new(CommandQueue::new());
    let transport = Arc::new(pgraft::transport::TcpTransport::new(config.node_id));
    let events = Arc::new(EventBus::new());

    if let Err(err) = transport.listen(&config.address, config.port) {
        error!("failed to bind transport listener: {}", err);
        process::exit(1);
    }

    if config.auto_cluster_formation {
        for peer in &config.peers {
            let _ = commands.enqueue(Command::add_node(peer.node_id, peer.address.clone(), peer.port));
        }
    }

    let worker = Arc::new(ConsensusWorker::new(
        core.clone(),
        commands.clone(),
        transport.clone(),
        events.clone(),
        config.clone(),
    ));
    let worker_for_thread = worker.clone();
    let worker_handle = thread::Builder::new()
        .name("consensus-worker".to_string())
        .spawn(move || worker_for_thread.run())
        .expect("spawn consensus-worker thread");

    let replication = Arc::new(ReplicationController::new(
        local_db(),
        config.sync_mode,
        config.num_sync_standbys,
    ));

    let health_monitor = Arc::new(HealthMonitor::new(
        local_db(),
        TcpRemoteProbe::default(),
        HealthMonitorConfig {
            period: Duration::from_millis(config.health_period_ms),
            failover_threshold: 3,
            max_replication_lag_ms: config.max_replication_lag_ms,
        },
    ));
    let health_snapshot = health_monitor.snapshot_handle();

    let (primary_loss_tx, primary_loss_rx) = unbounded();
    let health_core = core.clone();
    let health_monitor_thread = health_monitor.clone();
    let health_period = Duration::from_millis(config.health_period_ms);
    thread::Builder::new()
        .name("health-monitor".to_string())
        .spawn(move || loop {
            health_monitor_thread.run_cycle(&health_core, &primary_loss_tx);
            thread::sleep(health_period);
        })
        .expect("spawn health-monitor thread");

    let failover_core = core.clone();
    let failover_events = events.clone();
    let failover_config = config.clone();
    let failover_db = local_db();
    let failover_replication = replication.clone();
    thread::Builder::new()
        .name("failover-listener".to_string())
        .spawn(move || {
            for event in primary_loss_rx.iter() {
                let view = failover_core.get_cluster_view();
                if !should_trigger(&view, &failover_config, true) {
                    warn!(
                        "primary loss reported for node {} but failover preconditions not met",
                        event.failed_node_id
                    );
                    continue;
                }
                let orchestrator = FailoverOrchestrator::new(
                    &failover_core,
                    &failover_db,
                    &failover_replication,
                    &failover_events,
                    failover_config.cluster_name.clone(),
                );
                match orchestrator.execute(event.failed_node_id, "primary health check failed") {
                    Ok(ctx) => info!("failover completed: new primary {}", ctx.new_primary_node_id),
                    Err(err) => error!("failover failed: {}", err),
                }
            }
        })
        .expect("spawn failover-listener thread");

    let control_server = Arc::new(ControlServer::new(core.clone(), commands.clone(), health_snapshot));
    let control_addr = config.address.clone();
    let control_port = config.port.saturating_add(1000);
    control::spawn(control_server, control_addr, control_port);

    if worker_handle.join().is_err() {
        error!("consensus worker thread panicked");
        process::exit(1);
    }
    info!("pgraft node {} shut down", config.node_id);
}
