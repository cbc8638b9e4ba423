//! A topology realized across servers.
//!
//! `ClusterNetwork` owns the nodes, links, placeholder locks and cleanup
//! registry of one run. Lifecycle:
//!
//! - `build` resolves every server and registers it for cleanup.
//! - `start` launches every shell, then collects every pid, then realizes the
//!   links, then starts the switches in per-server batches.
//! - `stop` tears down links, stops switches and closes shells.
//! - `cleanup` runs the registry's end-of-run pass.

use std::sync::Arc;

use tracing::info;

use crate::cleanup::{CleanupRegistry, CleanupReport};
use crate::config::ClusterConfig;
use crate::error::{ClusterError, Result};
use crate::infrastructure::Spawner;
use crate::link::{Link, LinkEnd, PlaceholderLocks, TunnelBridge};
use crate::netns::validate_intf_name;
use crate::node::{ClusterNode, NodeContext, NodeRole, NodeTable};
use crate::remote::current_user;
use crate::switch::SwitchBatchController;
use crate::topology::Topology;


pub struct ClusterNetwork {
    config: ClusterConfig,
    nodes: NodeTable,
    links: Vec<Link>,
    locks: PlaceholderLocks,
    cleanup: CleanupRegistry,
    started: bool,
}

impl ClusterNetwork {
    /// Build as the user running this process.
    pub fn build(
        topology: &Topology,
        config: ClusterConfig,
        spawner: Arc<dyn Spawner>,
    ) -> Result<ClusterNetwork> {
        Self::build_with_user(topology, config, spawner, &current_user())
    }

    pub fn build_with_user(
        topology: &Topology,
        config: ClusterConfig,
        spawner: Arc<dyn Spawner>,
        invoking_user: &str,
    ) -> Result<ClusterNetwork> {
        topology.validate()?;
        config.validate()?;
        let cleanup = CleanupRegistry::new(spawner.clone(), &config, invoking_user);
        let mut nodes = NodeTable::new();
        {
            let ctx = NodeContext {
                config: &config,
                spawner,
                invoking_user,
                cleanup: &cleanup,
            };
            for spec in &topology.hosts {
                nodes.insert(ClusterNode::new(spec, NodeRole::Host, &ctx)?)?;
            }
            for spec in &topology.switches {
                nodes.insert(ClusterNode::new(spec, NodeRole::Switch, &ctx)?)?;
            }
        }

        let mut links = Vec::with_capacity(topology.links.len());
        for spec in &topology.links {
            let end1 = link_end(&mut nodes, &spec.node1, spec.intf1.as_deref(), spec.mac1.as_deref())?;
            let end2 = link_end(&mut nodes, &spec.node2, spec.intf2.as_deref(), spec.mac2.as_deref())?;
            links.push(Link::new(end1, end2, spec.params.clone()));
        }
        info!(nodes = nodes.len(), links = links.len(), "network built");
        Ok(ClusterNetwork {
            config,
            nodes,
            links,
            locks: PlaceholderLocks::new(),
            cleanup,
            started: false,
        })
    }

    pub fn start(&mut self) -> Result<()> {
        self.started = true;
        for node in self.nodes.iter_mut() {
            node.start_shell(&self.config)?;
        }
        for node in self.nodes.iter_mut() {
            node.wait_ready()?;
        }
        let bridge = TunnelBridge::new(&self.config.tunnel, &self.locks);
        for link in &mut self.links {
            link.realize(&mut self.nodes, &bridge)?;
        }
        let batches = SwitchBatchController::new(self.config.switch.parallel_batches)
            .batch_start(self.nodes.switches_mut())?;
        info!(
            links = self.links.len(),
            tunnels = self.tunnel_count(),
            switch_batches = batches,
            "network started"
        );
        Ok(())
    }

    /// Best-effort teardown of everything `start` created.
    pub fn stop(&mut self) {
        if !self.started {
            return;
        }
        self.started = false;
        for link in &mut self.links {
            link.stop(&mut self.nodes);
        }
        SwitchBatchController::new(self.config.switch.parallel_batches)
            .batch_stop(self.nodes.switches_mut());
        for node in self.nodes.iter_mut() {
            node.stop_shell();
        }
        info!("network stopped");
    }

    /// One line per link: `n1:i1 <-> n2:i2 (<s1> <s2>) <link status>`.
    pub fn status(&mut self) -> Vec<String> {
        let mut lines = Vec::with_capacity(self.links.len());
        for link in &mut self.links {
            let (a, b) = link.ends();
            let label = format!("{}:{} <-> {}:{}", a.node, a.intf, b.node, b.intf);
            lines.push(format!("{} {}", label, link.status(&mut self.nodes)));
        }
        lines
    }

    pub fn cleanup(&self) -> CleanupReport {
        self.cleanup.cleanup()
    }

    pub fn tunnel_count(&self) -> usize {
        self.links.iter().filter(|l| l.is_tunnel()).count()
    }

    pub fn nodes(&self) -> &NodeTable {
        &self.nodes
    }

    pub fn node_mut(&mut self, name: &str) -> Result<&mut ClusterNode> {
        self.nodes.get_mut(name)
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn registry(&self) -> &CleanupRegistry {
        &self.cleanup
    }

    pub fn is_started(&self) -> bool {
        self.started
    }
}

impl Drop for ClusterNetwork {
    fn drop(&mut self) {
        self.stop();
    }
}


/// Resolve one end of a link, allocating the node's next port.
fn link_end(
    nodes: &mut NodeTable,
    name: &str,
    intf: Option<&str>,
    mac: Option<&str>,
) -> Result<LinkEnd> {
    let node = nodes.get_mut(name)?;
    let port = node.new_port();
    let intf = match intf {
        Some(explicit) => explicit.to_string(),
        None => node.intf_name(port),
    };
    validate_intf_name(&intf).map_err(|_| {
        ClusterError::Topology(format!(
            "interface name '{}' for node '{}' is not a valid device name",
            intf, name
        ))
    })?;
    Ok(LinkEnd {
        node: name.to_string(),
        intf,
        mac: mac.map(String::from),
    })
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
