//! Topology descriptors.
//!
//! A `Topology` lists hosts, switches and links, each node pinned to a server.
//! It is normally loaded from YAML:
//!
//! ```text
//! hosts:
//!   - name: h1
//!     server: 10.0.0.1
//!     user: alice
//!   - name: h2
//!     server: lab-b
//! switches:
//!   - name: s1
//!     server: 10.0.0.1
//! links:
//!   - { node1: h1, node2: s1, bw: 10 }
//!   - { node1: h2, node2: s1, intf1: h2-uplink, mac1: "02:00:00:00:00:02" }
//! ```
//!
//! Keys a link carries beyond its endpoints (bandwidth, delay, ...) are kept
//! verbatim in `LinkSpec::params` for the traffic-shaping layer and never
//! interpreted here.

use std::collections::{BTreeMap, HashSet};
use std::net::Ipv4Addr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ClusterError, Result};
use crate::netns::validate_intf_name;
use crate::node::{NodeRole, LOCALHOST};
use crate::switch::group_by_server;


#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub name: String,
    #[serde(default = "default_server")]
    pub server: String,
    /// Connecting user. Defaults to the invoking user.
    #[serde(default)]
    pub user: Option<String>,
    /// Skip resolution and use this address for the server.
    #[serde(default)]
    pub ip: Option<Ipv4Addr>,
    /// Identity file for this node's ssh connection, overriding the config.
    #[serde(default)]
    pub key: Option<String>,
}

impl NodeSpec {
    pub fn new(name: &str, server: &str) -> Self {
        NodeSpec {
            name: name.to_string(),
            server: server.to_string(),
            user: None,
            ip: None,
            key: None,
        }
    }

    pub fn with_user(mut self, user: &str) -> Self {
        self.user = Some(user.to_string());
        self
    }
}


#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkSpec {
    pub node1: String,
    pub node2: String,
    #[serde(default)]
    pub intf1: Option<String>,
    #[serde(default)]
    pub intf2: Option<String>,
    #[serde(default)]
    pub mac1: Option<String>,
    #[serde(default)]
    pub mac2: Option<String>,
    /// Shaping parameters, passed through untouched.
    #[serde(flatten)]
    pub params: BTreeMap<String, serde_yaml::Value>,
}

impl LinkSpec {
    pub fn new(node1: &str, node2: &str) -> Self {
        LinkSpec {
            node1: node1.to_string(),
            node2: node2.to_string(),
            intf1: None,
            intf2: None,
            mac1: None,
            mac2: None,
            params: BTreeMap::new(),
        }
    }
}


#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    #[serde(default)]
    pub hosts: Vec<NodeSpec>,
    #[serde(default)]
    pub switches: Vec<NodeSpec>,
    #[serde(default)]
    pub links: Vec<LinkSpec>,
}


fn default_server() -> String {
    LOCALHOST.to_string()
}


impl Topology {
    pub fn load(path: &Path) -> Result<Topology> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ClusterError::Topology(format!("cannot read '{}': {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Topology> {
        let topo: Topology = serde_yaml::from_str(content)
            .map_err(|e| ClusterError::Topology(format!("invalid topology file: {}", e)))?;
        topo.validate()?;
        Ok(topo)
    }

    /// Check names are unique, links reference known nodes, and explicit
    /// interface names are usable.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for spec in self.hosts.iter().chain(self.switches.iter()) {
            if spec.name.is_empty() {
                return Err(ClusterError::Topology("node with empty name".into()));
            }
            if !seen.insert(spec.name.as_str()) {
                return Err(ClusterError::Topology(format!(
                    "duplicate node name '{}'",
                    spec.name
                )));
            }
        }
        let mut intfs = HashSet::new();
        for link in &self.links {
            for end in [&link.node1, &link.node2] {
                if !seen.contains(end.as_str()) {
                    return Err(ClusterError::Topology(format!(
                        "link {} <-> {} references unknown node '{}'",
                        link.node1, link.node2, end
                    )));
                }
            }
            if link.node1 == link.node2 {
                return Err(ClusterError::Topology(format!(
                    "link connects '{}' to itself",
                    link.node1
                )));
            }
            for intf in [&link.intf1, &link.intf2].into_iter().flatten() {
                validate_intf_name(intf)?;
                if !intfs.insert(intf.as_str()) {
                    return Err(ClusterError::Topology(format!(
                        "interface name '{}' used twice",
                        intf
                    )));
                }
            }
        }
        Ok(())
    }

    /// Look up a node by name.
    pub fn node(&self, name: &str) -> Option<(&NodeSpec, NodeRole)> {
        self.hosts
            .iter()
            .find(|n| n.name == name)
            .map(|n| (n, NodeRole::Host))
            .or_else(|| {
                self.switches
                    .iter()
                    .find(|n| n.name == name)
                    .map(|n| (n, NodeRole::Switch))
            })
    }

    /// How the topology will be realized, without touching any server.
    pub fn plan(&self) -> Result<Plan> {
        let mut links = Vec::new();
        for link in &self.links {
            let (a, _) = self
                .node(&link.node1)
                .ok_or_else(|| ClusterError::Topology(format!("unknown node '{}'", link.node1)))?;
            let (b, _) = self
                .node(&link.node2)
                .ok_or_else(|| ClusterError::Topology(format!("unknown node '{}'", link.node2)))?;
            let kind = if a.server == b.server {
                LinkKind::Pair
            } else {
                LinkKind::Tunnel
            };
            // Tunnels originate from the side ssh can be launched from.
            let origin = match kind {
                LinkKind::Tunnel if b.server == LOCALHOST => b.name.clone(),
                _ => a.name.clone(),
            };
            links.push(PlannedLink {
                node1: a.name.clone(),
                server1: a.server.clone(),
                node2: b.name.clone(),
                server2: b.server.clone(),
                kind,
                origin,
            });
        }
        let switches: Vec<&NodeSpec> = self.switches.iter().collect();
        let switch_groups = group_by_server(switches, |s| s.server.as_str())
            .into_iter()
            .map(|(server, members)| SwitchGroupPlan {
                server,
                switches: members.iter().map(|s| s.name.clone()).collect(),
            })
            .collect();
        let mut servers: Vec<String> = self
            .hosts
            .iter()
            .chain(self.switches.iter())
            .map(|n| n.server.clone())
            .collect();
        servers.sort();
        servers.dedup();
        Ok(Plan {
            servers,
            links,
            switch_groups,
        })
    }
}


// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkKind {
    /// Both ends on one server: a veth pair.
    Pair,
    /// Ends on different servers: an ssh Ethernet tunnel.
    Tunnel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedLink {
    pub node1: String,
    pub server1: String,
    pub node2: String,
    pub server2: String,
    pub kind: LinkKind,
    /// Node whose server launches the tunnel ssh (or builds the pair).
    pub origin: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SwitchGroupPlan {
    pub server: String,
    pub switches: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Plan {
    pub servers: Vec<String>,
    pub links: Vec<PlannedLink>,
    pub switch_groups: Vec<SwitchGroupPlan>,
}

impl Plan {
    pub fn tunnel_count(&self) -> usize {
        self.links
            .iter()
            .filter(|l| l.kind == LinkKind::Tunnel)
            .count()
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
