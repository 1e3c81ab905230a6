//! The replication controller: synchronous-replication policy, standby set management, and
//! basebackup + recovery-mode streaming setup.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use crate::db::DatabaseAdmin;
use crate::error::{Error, Result};

/// Synchronous-commit policy, each variant mapping directly to PostgreSQL's `synchronous_commit`
/// GUC value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Off,
    Local,
    RemoteWrite,
    RemoteApply,
}

impl SyncMode {
    pub fn as_guc(&self) -> &'static str {
        match self {
            SyncMode::Off => "off",
            SyncMode::Local => "local",
            SyncMode::RemoteWrite => "remote_write",
            SyncMode::RemoteApply => "remote_apply",
        }
    }
}

impl FromStr for SyncMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "off" => Ok(SyncMode::Off),
            "local" => Ok(SyncMode::Local),
            "remote_write" => Ok(SyncMode::RemoteWrite),
            "remote_apply" => Ok(SyncMode::RemoteApply),
            other => Err(Error::InvalidParameter(format!("unknown sync_mode: {}", other))),
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_guc())
    }
}

/// A standby's replication state, as tracked by the replication controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StandbyState {
    Startup,
    Catchup,
    Streaming,
    Backup,
    Stopping,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct StandbyDescriptor {
    pub node_id: u32,
    pub application_name: String,
    pub is_sync: bool,
    pub is_connected: bool,
    pub flush_lag_bytes: u64,
    pub replay_lag_bytes: u64,
    pub last_sync_time: Option<std::time::SystemTime>,
    pub state: StandbyState,
}

impl StandbyDescriptor {
    fn new(node_id: u32, application_name: impl Into<String>) -> Self {
        StandbyDescriptor {
            node_id,
            application_name: application_name.into(),
            is_sync: false,
            is_connected: false,
            flush_lag_bytes: 0,
            replay_lag_bytes: 0,
            last_sync_time: None,
            state: StandbyState::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamingError {
    Basebackup,
    RecoveryConfig,
    StartFailed,
    NotInRecovery,
}

#[derive(Debug, Clone)]
pub struct ReplicationStatus {
    pub mode: SyncMode,
    pub configured: String,
    pub connected: usize,
    pub all_healthy: bool,
}

/// Owns the standby set and synchronous-replication policy for the local primary.
pub struct ReplicationController<D: DatabaseAdmin> {
    db: D,
    mode: Mutex<SyncMode>,
    num_sync_standbys: Mutex<i32>,
    standbys: Mutex<Vec<StandbyDescriptor>>,
}

impl<D: DatabaseAdmin> ReplicationController<D> {
    pub fn new(db: D, mode: SyncMode, num_sync_standbys: i32) -> Self {
        ReplicationController {
            db,
            mode: Mutex::new(mode),
            num_sync_standbys: Mutex::new(num_sync_standbys),
            standbys: Mutex::new(Vec::new()),
        }
    }

    pub fn add_standby(&self, node_id: u32, application_name: impl Into<String>) -> Result<()> {
        {
            let mut standbys = self.standbys.lock().unwrap();
            if standbys.iter().any(|s| s.node_id == node_id) {
                return Ok(());
            }
            let mut descriptor = StandbyDescriptor::new(node_id, application_name);
            descriptor.is_sync = true;
            standbys.push(descriptor);
        }
        self.regenerate_and_reload()
    }

    pub fn remove_standby(&self, node_id: u32) -> Result<()> {
        self.standbys.lock().unwrap().retain(|s| s.node_id != node_id);
        self.regenerate_and_reload()
    }

    pub fn set_mode(&self, mode: SyncMode) -> Result<()> {
        *self.mode.lock().unwrap() = mode;
        self.regenerate_and_reload()
    }

    pub fn set_num_sync_standbys(&self, n: i32) -> Result<()> {
        *self.num_sync_standbys.lock().unwrap() = n;
        self.regenerate_and_reload()
    }

    /// Builds `FIRST <k> (<name1>,<name2>,...)` from standbys with `is_sync = true`, in
    /// insertion order. Empty when `k <= 0`.
    pub fn synchronous_standby_names(&self) -> String {
        let k = *self.num_sync_standbys.lock().unwrap();
        if k <= 0 {
            return String::new();
        }
        let names: Vec<String> = self
            .standbys
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.is_sync)
            .map(|s| s.application_name.clone())
            .collect();
        if names.is_empty() {
            return String::new();
        }
        format!("FIRST {} ({})", k, names.join(","))
    }

    fn regenerate_and_reload(&self) -> Result<()> {
        let value = self.synchronous_standby_names();
        self.db.set_synchronous_standby_names(&value)
    }

    pub fn get_status(&self) -> ReplicationStatus {
        let standbys = self.standbys.lock().unwrap();
        let connected = standbys.iter().filter(|s| s.is_connected).count();
        let all_healthy = standbys.iter().all(|s| s.is_connected);
        ReplicationStatus {
            mode: *self.mode.lock().unwrap(),
            configured: self.synchronous_standby_names(),
            connected,
            all_healthy,
        }
    }

    pub fn check_health(&self) -> bool {
        self.get_status().all_healthy
    }

    pub fn update_standby_observation(
        &self,
        node_id: u32,
        is_connected: bool,
        flush_lag_bytes: u64,
        replay_lag_bytes: u64,
        state: StandbyState,
    ) {
        let mut standbys = self.standbys.lock().unwrap();
        if let Some(s) = standbys.iter_mut().find(|s| s.node_id == node_id) {
            s.is_connected = is_connected;
            s.flush_lag_bytes = flush_lag_bytes;
            s.replay_lag_bytes = replay_lag_bytes;
            s.state = state;
            if is_connected {
                s.last_sync_time = Some(std::time::SystemTime::now());
            }
        }
    }

    /// Streaming setup: stop the local database, pg_basebackup from `primary_conninfo`, write
    /// recovery configuration, create the trigger file, start the database, wait, then verify
    /// recovery mode.
    pub fn setup_streaming_replica(
        &self,
        primary_conninfo: &str,
        trigger_file: &Path,
        wait: impl Fn(std::time::Duration),
    ) -> std::result::Result<(), StreamingError> {
        self.db.stop().map_err(|_| StreamingError::StartFailed)?;
        self.db
            .basebackup(primary_conninfo)
            .map_err(|_| StreamingError::Basebackup)?;
        self.db
            .set_recovery_mode(primary_conninfo, trigger_file)
            .map_err(|_| StreamingError::RecoveryConfig)?;
        self.db.start().map_err(|_| StreamingError::StartFailed)?;
        wait(std::time::Duration::from_secs(5));
        let status = self.db.status().map_err(|_| StreamingError::StartFailed)?;
        if !status.is_in_recovery {
            return Err(StreamingError::NotInRecovery);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::mock::MockDatabaseAdmin;

    fn controller(num_sync: i32) -> ReplicationController<MockDatabaseAdmin> {
        ReplicationController::new(MockDatabaseAdmin::default(), SyncMode::RemoteApply, num_sync)
    }

    #[test]
    fn generates_first_k_standby_list() {
        let ctrl = controller(1);
        ctrl.add_standby(2, "r2").unwrap();
        ctrl.add_standby(3, "r3").unwrap();
        assert_eq!(ctrl.synchronous_standby_names(), "FIRST 1 (r2,r3)");

        ctrl.remove_standby(2).unwrap();
        assert_eq!(ctrl.synchronous_standby_names(), "FIRST 1 (r3)");
    }

    #[test]
    fn zero_sync_standbys_is_empty() {
        let ctrl = controller(0);
        ctrl.add_standby(2, "r2").unwrap();
        assert_eq!(ctrl.synchronous_standby_names(), "");
    }

    #[test]
    fn add_standby_is_idempotent() {
        let ctrl = controller(1);
        ctrl.add_standby(2, "r2").unwrap();
        ctrl.add_standby(2, "r2").unwrap();
        assert_eq!(ctrl.synchronous_standby_names(), "FIRST 1 (r2)");
    }

    #[test]
    fn streaming_setup_surfaces_basebackup_failure() {
        let mut db = MockDatabaseAdmin::default();
        db.fail_basebackup = true;
        let ctrl = ReplicationController::new(db, SyncMode::Off, 0);
        let result = ctrl.setup_streaming_replica("host=primary", Path::new("/tmp/trigger"), |_| {});
        assert_eq!(result, Err(StreamingError::Basebackup));
    }
}
