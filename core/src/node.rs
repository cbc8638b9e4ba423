//! Emulated nodes pinned to physical servers.
//!
//! A `ClusterNode` is a host (its shell runs in a fresh network namespace) or
//! a switch (its shell runs in the server's root namespace). The node owns the
//! executor for its server and, once started, the persistent shell whose pid
//! identifies its namespace.

use std::net::Ipv4Addr;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::cleanup::CleanupRegistry;
use crate::config::ClusterConfig;
use crate::error::{ClusterError, Result};
use crate::infrastructure::Spawner;
use crate::remote::{resolve, RemoteConnection, RemoteExecutor, ShellSession};
use crate::topology::NodeSpec;


/// Server name that means "this machine".
pub const LOCALHOST: &str = "localhost";


#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Host,
    Switch,
}


/// What a node needs from its surroundings at construction.
pub struct NodeContext<'a> {
    pub config: &'a ClusterConfig,
    pub spawner: Arc<dyn Spawner>,
    pub invoking_user: &'a str,
    pub cleanup: &'a CleanupRegistry,
}


pub struct ClusterNode {
    name: String,
    role: NodeRole,
    ip: Ipv4Addr,
    executor: RemoteExecutor,
    shell: Option<ShellSession>,
    ports: Vec<String>,
    next_port: u32,
}

impl std::fmt::Debug for ClusterNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterNode")
            .field("name", &self.name)
            .field("role", &self.role)
            .field("server", &self.server())
            .field("ip", &self.ip)
            .field("user", &self.user())
            .field("shell", &self.shell)
            .finish()
    }
}

impl ClusterNode {
    /// Build a node from its descriptor. Fails when the server cannot be
    /// resolved; on success the server is registered for cleanup.
    pub fn new(spec: &NodeSpec, role: NodeRole, ctx: &NodeContext<'_>) -> Result<ClusterNode> {
        let user = spec.user.as_deref().unwrap_or(ctx.invoking_user);
        let ip = match spec.ip {
            Some(ip) => ip,
            None => resolve(&spec.server).ok_or_else(|| ClusterError::Resolve {
                node: spec.name.clone(),
                server: spec.server.clone(),
            })?,
        };
        let connection =
            RemoteConnection::new(&spec.server, user, ctx.invoking_user, &ctx.config.ssh)
                .with_key(spec.key.clone());
        ctx.cleanup.add(&spec.server, user);
        debug!(node = %spec.name, server = %spec.server, %ip, user, "node created");
        Ok(ClusterNode {
            name: spec.name.clone(),
            role,
            ip,
            executor: RemoteExecutor::new(connection, ctx.spawner.clone()),
            shell: None,
            ports: Vec::new(),
            next_port: match role {
                NodeRole::Host => 0,
                NodeRole::Switch => 1,
            },
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn server(&self) -> &str {
        self.executor.connection().server()
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub fn user(&self) -> &str {
        self.executor.connection().user()
    }

    pub fn is_remote(&self) -> bool {
        self.executor.connection().is_remote()
    }

    /// `user@server`, empty for local nodes.
    pub fn dest(&self) -> String {
        self.executor.connection().destination()
    }

    pub fn executor(&self) -> &RemoteExecutor {
        &self.executor
    }

    /// Root-namespace command on this node's server (sudo, pseudo-tty).
    pub fn rcmd(&self, cmd: &str) -> Result<String> {
        self.executor.rcmd(cmd)
    }

    // -- Shell --

    /// Launch the node's shell without waiting for its pid.
    pub fn start_shell(&mut self, config: &ClusterConfig) -> Result<()> {
        if self.shell.is_some() {
            return Ok(());
        }
        let mut argv = Vec::new();
        if self.role == NodeRole::Host {
            argv.extend(config.shell.namespace_wrapper.iter().cloned());
        }
        argv.extend(config.shell.command.iter().cloned());
        self.shell = Some(self.executor.start_interactive_shell(&self.name, &argv)?);
        Ok(())
    }

    /// Collect the pid from a started shell.
    pub fn wait_ready(&mut self) -> Result<u32> {
        self.shell_mut()?.wait_ready()
    }

    /// Pid of the node's shell; the handle for its network namespace.
    pub fn pid(&self) -> Result<u32> {
        self.shell
            .as_ref()
            .and_then(|s| s.pid())
            .ok_or_else(|| ClusterError::NotStarted(self.name.clone()))
    }

    /// Run `text` inside the node's namespace.
    pub fn cmd(&mut self, text: &str) -> Result<String> {
        self.shell_mut()?.cmd(text)
    }

    pub fn is_started(&self) -> bool {
        self.shell.is_some()
    }

    pub fn stop_shell(&mut self) {
        if let Some(mut shell) = self.shell.take() {
            shell.close();
        }
    }

    fn shell_mut(&mut self) -> Result<&mut ShellSession> {
        let name = &self.name;
        self.shell
            .as_mut()
            .ok_or_else(|| ClusterError::NotStarted(name.clone()))
    }

    // -- Ports --

    /// Allocate the next port number. Host ports count from 0, switch ports
    /// from 1.
    pub fn new_port(&mut self) -> u32 {
        let port = self.next_port;
        self.next_port += 1;
        port
    }

    /// Default interface name for a port.
    pub fn intf_name(&self, port: u32) -> String {
        format!("{}-eth{}", self.name, port)
    }

    pub fn add_port(&mut self, intf: &str) {
        self.ports.push(intf.to_string());
    }

    pub fn ports(&self) -> &[String] {
        &self.ports
    }
}


// ---------------------------------------------------------------------------
// NodeTable
// ---------------------------------------------------------------------------

/// Nodes in construction order, looked up by name.
#[derive(Debug, Default)]
pub struct NodeTable {
    nodes: Vec<ClusterNode>,
}

impl NodeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, node: ClusterNode) -> Result<()> {
        if self.index(node.name()).is_some() {
            return Err(ClusterError::Topology(format!(
                "duplicate node name '{}'",
                node.name()
            )));
        }
        self.nodes.push(node);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&ClusterNode> {
        self.index(name)
            .map(|i| &self.nodes[i])
            .ok_or_else(|| ClusterError::Topology(format!("unknown node '{}'", name)))
    }

    pub fn get_mut(&mut self, name: &str) -> Result<&mut ClusterNode> {
        let i = self
            .index(name)
            .ok_or_else(|| ClusterError::Topology(format!("unknown node '{}'", name)))?;
        Ok(&mut self.nodes[i])
    }

    /// Borrow two distinct nodes mutably at once.
    pub fn pair_mut(&mut self, a: &str, b: &str) -> Result<(&mut ClusterNode, &mut ClusterNode)> {
        let ia = self
            .index(a)
            .ok_or_else(|| ClusterError::Topology(format!("unknown node '{}'", a)))?;
        let ib = self
            .index(b)
            .ok_or_else(|| ClusterError::Topology(format!("unknown node '{}'", b)))?;
        if ia == ib {
            return Err(ClusterError::Topology(format!(
                "link connects '{}' to itself",
                a
            )));
        }
        if ia < ib {
            let (left, right) = self.nodes.split_at_mut(ib);
            Ok((&mut left[ia], &mut right[0]))
        } else {
            let (left, right) = self.nodes.split_at_mut(ia);
            Ok((&mut right[0], &mut left[ib]))
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClusterNode> {
        self.nodes.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ClusterNode> {
        self.nodes.iter_mut()
    }

    pub fn switches_mut(&mut self) -> Vec<&mut ClusterNode> {
        self.nodes
            .iter_mut()
            .filter(|n| n.role() == NodeRole::Switch)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn index(&self, name: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.name() == name)
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
