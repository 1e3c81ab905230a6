//! Contract for the database engine administrative operations. The database engine itself is
//! out of scope here, accessed solely through a documented set of administrative operations.
//! `DatabaseAdmin` is the seam: the failover orchestrator and replication controller depend only
//! on this trait, never on a concrete PostgreSQL client.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{Error, Result};

/// A snapshot of the local database's running state, as observed by the health monitor and the
/// failover orchestrator's validation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbStatus {
    pub is_running: bool,
    pub is_primary: bool,
    pub accepts_connections: bool,
    pub is_in_recovery: bool,
}

/// The administrative operations a cluster member can perform against its local PostgreSQL
/// instance. Implementations talk to the database by whatever means is appropriate (CLI tools,
/// a local client connection); the core only ever calls through this trait.
pub trait DatabaseAdmin: Send + Sync {
    fn start(&self) -> Result<()>;
    fn stop(&self) -> Result<()>;
    fn promote(&self) -> Result<()>;
    fn status(&self) -> Result<DbStatus>;
    fn basebackup(&self, primary_conninfo: &str) -> Result<()>;
    fn reload_configuration(&self) -> Result<()>;
    fn set_recovery_mode(&self, primary_conninfo: &str, trigger_file: &Path) -> Result<()>;
    fn set_synchronous_standby_names(&self, value: &str) -> Result<()>;
}

/// Drives a real PostgreSQL instance through `pg_ctl`/`pg_basebackup` shell invocations, the
/// external-process style used for a rebuild-replica's data directory replacement.
pub struct ShellDatabaseAdmin {
    pub data_dir: PathBuf,
    pub bin_dir: PathBuf,
    pub server_version: ServerVersion,
}

/// Whether recovery configuration belongs in `recovery.conf` (pre-12) or `postgresql.auto.conf`
/// plus a `standby.signal` trigger file (12+). The caller selects the branch by server version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerVersion {
    Pre12,
    Modern,
}

impl ShellDatabaseAdmin {
    pub fn new(data_dir: impl Into<PathBuf>, bin_dir: impl Into<PathBuf>, server_version: ServerVersion) -> Self {
        ShellDatabaseAdmin {
            data_dir: data_dir.into(),
            bin_dir: bin_dir.into(),
            server_version,
        }
    }

    fn tool(&self, name: &str) -> PathBuf {
        self.bin_dir.join(name)
    }

    fn run(&self, mut cmd: Command) -> Result<()> {
        let output = cmd.output().map_err(|e| Error::Internal(e.to_string()))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::Internal(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ))
        }
    }

    /// Atomically replaces the data directory: builds alongside the existing one under a
    /// temporary name, then renames over it, rather than wiping in place.
    fn replace_data_dir<F: FnOnce(&Path) -> Result<()>>(&self, populate: F) -> Result<()> {
        let staging = self.data_dir.with_extension("rebuild-staging");
        if staging.exists() {
            std::fs::remove_dir_all(&staging).map_err(|e| Error::Internal(e.to_string()))?;
        }
        populate(&staging)?;
        if self.data_dir.exists() {
            std::fs::remove_dir_all(&self.data_dir).map_err(|e| Error::Internal(e.to_string()))?;
        }
        std::fs::rename(&staging, &self.data_dir).map_err(|e| Error::Internal(e.to_string()))?;
        Ok(())
    }
}

impl DatabaseAdmin for ShellDatabaseAdmin {
    fn start(&self) -> Result<()> {
        let mut cmd = Command::new(self.tool("pg_ctl"));
        cmd.args(["start", "-w", "-D"]).arg(&self.data_dir);
        self.run(cmd)
    }

    fn stop(&self) -> Result<()> {
        let mut cmd = Command::new(self.tool("pg_ctl"));
        cmd.args(["stop", "-w", "-m", "fast", "-D"]).arg(&self.data_dir);
        self.run(cmd)
    }

    fn promote(&self) -> Result<()> {
        let mut cmd = Command::new(self.tool("pg_ctl"));
        cmd.args(["promote", "-w", "-D"]).arg(&self.data_dir);
        self.run(cmd).map_err(|e| Error::PromotionFailed(e.to_string()))
    }

    fn status(&self) -> Result<DbStatus> {
        let running = Command::new(self.tool("pg_ctl"))
            .args(["status", "-D"])
            .arg(&self.data_dir)
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false);

        let recovery_signal = self.data_dir.join("standby.signal").exists()
            || self.data_dir.join("recovery.conf").exists();

        Ok(DbStatus {
            is_running: running,
            is_primary: running && !recovery_signal,
            accepts_connections: running,
            is_in_recovery: recovery_signal,
        })
    }

    fn basebackup(&self, primary_conninfo: &str) -> Result<()> {
        let conninfo = primary_conninfo.to_string();
        self.replace_data_dir(|staging| {
            let mut cmd = Command::new(self.tool("pg_basebackup"));
            cmd.args(["-D"])
                .arg(staging)
                .args(["-d", &conninfo, "-Fp", "-X", "stream", "-P"]);
            self.run(cmd)
                .map_err(|e| Error::BasebackupFailed(e.to_string()))
        })
    }

    fn reload_configuration(&self) -> Result<()> {
        let mut cmd = Command::new(self.tool("pg_ctl"));
        cmd.args(["reload", "-D"]).arg(&self.data_dir);
        self.run(cmd)
    }

    fn set_recovery_mode(&self, primary_conninfo: &str, trigger_file: &Path) -> Result<()> {
        match self.server_version {
            ServerVersion::Modern => {
                let contents = format!(
                    "primary_conninfo = '{}'\nrecovery_target_timeline = 'latest'\npromote_trigger_file = '{}'\n",
                    primary_conninfo,
                    trigger_file.display(),
                );
                std::fs::write(self.data_dir.join("postgresql.auto.conf.pgraft"), contents)
                    .map_err(|e| Error::RecoveryConfigFailed(e.to_string()))?;
                std::fs::write(self.data_dir.join("standby.signal"), b"")
                    .map_err(|e| Error::RecoveryConfigFailed(e.to_string()))?;
            }
            ServerVersion::Pre12 => {
                let contents = format!(
                    "standby_mode = 'on'\nprimary_conninfo = '{}'\nrecovery_target_timeline = 'latest'\ntrigger_file = '{}'\n",
                    primary_conninfo,
                    trigger_file.display(),
                );
                std::fs::write(self.data_dir.join("recovery.conf"), contents)
                    .map_err(|e| Error::RecoveryConfigFailed(e.to_string()))?;
            }
        }
        Ok(())
    }

    fn set_synchronous_standby_names(&self, value: &str) -> Result<()> {
        let line = format!("synchronous_standby_names = '{}'\n", value);
        std::fs::write(self.data_dir.join("pgraft_sync_standbys.conf"), line)
            .map_err(|e| Error::Internal(e.to_string()))?;
        self.reload_configuration()
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::Mutex;

    /// An in-memory `DatabaseAdmin` for orchestrator/controller tests: records calls and lets
    /// tests script a scripted status and failure points.
    pub struct MockDatabaseAdmin {
        pub status: Mutex<DbStatus>,
        pub calls: Mutex<Vec<String>>,
        pub fail_promote: bool,
        pub fail_basebackup: bool,
    }

    impl Default for MockDatabaseAdmin {
        fn default() -> Self {
            MockDatabaseAdmin {
                status: Mutex::new(DbStatus {
                    is_running: true,
                    is_primary: false,
                    accepts_connections: true,
                    is_in_recovery: true,
                }),
                calls: Mutex::new(Vec::new()),
                fail_promote: false,
                fail_basebackup: false,
            }
        }
    }

    impl DatabaseAdmin for MockDatabaseAdmin {
        fn start(&self) -> Result<()> {
            self.calls.lock().unwrap().push("start".to_string());
            self.status.lock().unwrap().is_running = true;
            Ok(())
        }

        fn stop(&self) -> Result<()> {
            self.calls.lock().unwrap().push("stop".to_string());
            self.status.lock().unwrap().is_running = false;
            Ok(())
        }

        fn promote(&self) -> Result<()> {
            self.calls.lock().unwrap().push("promote".to_string());
            if self.fail_promote {
                return Err(Error::PromotionFailed("mock failure".to_string()));
            }
            let mut status = self.status.lock().unwrap();
            status.is_primary = true;
            status.is_in_recovery = false;
            Ok(())
        }

        fn status(&self) -> Result<DbStatus> {
            Ok(*self.status.lock().unwrap())
        }

        fn basebackup(&self, _primary_conninfo: &str) -> Result<()> {
            self.calls.lock().unwrap().push("basebackup".to_string());
            if self.fail_basebackup {
                return Err(Error::BasebackupFailed("mock failure".to_string()));
            }
            Ok(())
        }

        fn reload_configuration(&self) -> Result<()> {
            self.calls.lock().unwrap().push("reload".to_string());
            Ok(())
        }

        fn set_recovery_mode(&self, _primary_conninfo: &str, _trigger_file: &Path) -> Result<()> {
            self.calls.lock().unwrap().push("set_recovery_mode".to_string());
            self.status.lock().unwrap().is_in_recovery = true;
            Ok(())
        }

        fn set_synchronous_standby_names(&self, _value: &str) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push("set_synchronous_standby_names".to_string());
            Ok(())
        }
    }
}
