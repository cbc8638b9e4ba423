//! End-of-run cleanup.
//!
//! Every node registers the server it lives on and the user it connects as.
//! At the end of the run `cleanup()` visits each remote server once over a
//! fresh connection and runs the configured cleanup commands with sudo, so
//! placeholder devices and tunnel processes left behind by a failed run are
//! removed. Nothing here ever fails: problems are logged and counted.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Once};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{ClusterConfig, SshConfig};
use crate::infrastructure::Spawner;
use crate::node::LOCALHOST;
use crate::remote::{RemoteConnection, RemoteExecutor, RunOptions};
use crate::topology::Topology;


/// What a cleanup pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Remote servers visited.
    pub servers: Vec<String>,
    /// Commands attempted across all servers.
    pub attempted: usize,
    /// Commands that could not be spawned or exited non-zero.
    pub failed: usize,
}


pub struct CleanupRegistry {
    servers: Mutex<BTreeMap<String, String>>,
    hook: Once,
    hook_registrations: AtomicUsize,
    armed: AtomicBool,
    done: AtomicBool,
    spawner: Arc<dyn Spawner>,
    ssh: SshConfig,
    commands: Vec<String>,
    invoking_user: String,
}

impl CleanupRegistry {
    pub fn new(spawner: Arc<dyn Spawner>, config: &ClusterConfig, invoking_user: &str) -> Self {
        CleanupRegistry {
            servers: Mutex::new(BTreeMap::new()),
            hook: Once::new(),
            hook_registrations: AtomicUsize::new(0),
            armed: AtomicBool::new(false),
            done: AtomicBool::new(false),
            spawner,
            ssh: config.ssh.clone(),
            commands: config.cleanup.commands_for(&config.tunnel),
            invoking_user: invoking_user.to_string(),
        }
    }

    /// Record `user` for `server`, replacing any earlier user. The first call
    /// arms the end-of-run hook.
    pub fn add(&self, server: &str, user: &str) {
        self.lock().insert(server.to_string(), user.to_string());
        self.hook.call_once(|| {
            self.hook_registrations.fetch_add(1, Ordering::SeqCst);
            self.armed.store(true, Ordering::SeqCst);
            debug!("cleanup hook armed");
        });
    }

    /// Register every node of a topology without constructing it.
    pub fn add_topology(&self, topology: &Topology) {
        for spec in topology.hosts.iter().chain(topology.switches.iter()) {
            let user = spec.user.as_deref().unwrap_or(&self.invoking_user);
            self.add(&spec.server, user);
        }
    }

    pub fn servers(&self) -> BTreeMap<String, String> {
        self.lock().clone()
    }

    pub fn user_for(&self, server: &str) -> Option<String> {
        self.lock().get(server).cloned()
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    /// How many times the hook has been armed. Never more than one.
    pub fn hook_registrations(&self) -> usize {
        self.hook_registrations.load(Ordering::SeqCst)
    }

    /// Run the cleanup commands on every registered remote server. Only the
    /// first call does any work.
    pub fn cleanup(&self) -> CleanupReport {
        let mut report = CleanupReport::default();
        if self.done.swap(true, Ordering::SeqCst) {
            return report;
        }
        let servers = self.servers();
        for (server, user) in servers.iter().filter(|(s, _)| s.as_str() != LOCALHOST) {
            info!(server = %server, user = %user, "cleaning up");
            report.servers.push(server.clone());
            let connection = RemoteConnection::new(server, user, &self.invoking_user, &self.ssh)
                .without_control_path();
            let executor = RemoteExecutor::new(connection, self.spawner.clone());
            for cmd in &self.commands {
                report.attempted += 1;
                match executor.run(cmd, RunOptions::root_no_tty()) {
                    Ok(out) if out.success() => {}
                    Ok(out) => {
                        report.failed += 1;
                        debug!(server = %server, command = %cmd, exit_code = out.exit_code,
                               "cleanup command failed");
                    }
                    Err(e) => {
                        report.failed += 1;
                        warn!(server = %server, command = %cmd, error = %e,
                              "cleanup command could not run");
                    }
                }
            }
        }
        report
    }

    pub fn has_run(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.servers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for CleanupRegistry {
    fn drop(&mut self) {
        if self.is_armed() && !self.has_run() {
            self.cleanup();
        }
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
