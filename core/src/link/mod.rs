//! Links between nodes.
//!
//! A link whose ends share a server becomes a veth pair; otherwise it becomes
//! an ssh Ethernet tunnel. Never both.

pub mod placeholder;
pub mod tunnel;
pub mod veth;

use std::collections::BTreeMap;

use tracing::warn;

use crate::error::Result;
use crate::netns::{delete_intf, intf_present};
use crate::node::NodeTable;

pub use placeholder::{PlaceholderGuard, PlaceholderLocks};
pub use tunnel::{check_liveness, Liveness, Tunnel, TunnelBridge, TunnelStatus};


/// One side of a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEnd {
    pub node: String,
    pub intf: String,
    pub mac: Option<String>,
}


#[derive(Debug)]
pub enum Realization {
    Pair,
    Tunnel(Tunnel),
}


#[derive(Debug)]
pub struct Link {
    end1: LinkEnd,
    end2: LinkEnd,
    params: BTreeMap<String, serde_yaml::Value>,
    realization: Option<Realization>,
}

impl Link {
    pub fn new(end1: LinkEnd, end2: LinkEnd, params: BTreeMap<String, serde_yaml::Value>) -> Self {
        Link {
            end1,
            end2,
            params,
            realization: None,
        }
    }

    pub fn ends(&self) -> (&LinkEnd, &LinkEnd) {
        (&self.end1, &self.end2)
    }

    /// Shaping parameters from the topology, uninterpreted.
    pub fn params(&self) -> &BTreeMap<String, serde_yaml::Value> {
        &self.params
    }

    pub fn is_realized(&self) -> bool {
        self.realization.is_some()
    }

    pub fn is_tunnel(&self) -> bool {
        matches!(self.realization, Some(Realization::Tunnel(_)))
    }

    pub fn tunnel(&self) -> Option<&Tunnel> {
        match self.realization {
            Some(Realization::Tunnel(ref t)) => Some(t),
            _ => None,
        }
    }

    /// Create the link's interfaces and attach them to both nodes.
    pub fn realize(&mut self, nodes: &mut NodeTable, bridge: &TunnelBridge<'_>) -> Result<()> {
        if self.realization.is_some() {
            return Ok(());
        }
        let (node1, node2) = nodes.pair_mut(&self.end1.node, &self.end2.node)?;
        let realization = if node1.server() == node2.server() {
            veth::make_pair(node1, node2, &self.end1, &self.end2)?;
            Realization::Pair
        } else {
            Realization::Tunnel(bridge.establish(node1, node2, &self.end1, &self.end2)?)
        };
        node1.add_port(&self.end1.intf);
        node2.add_port(&self.end2.intf);
        self.realization = Some(realization);
        Ok(())
    }

    /// Tear the link down. Tunnels stop their ssh process and delete both
    /// interfaces; pairs delete one end, which takes the peer with it.
    pub fn stop(&mut self, nodes: &mut NodeTable) {
        let Some(realization) = self.realization.take() else {
            return;
        };
        match realization {
            Realization::Tunnel(mut tunnel) => {
                tunnel.terminate();
                self.delete_end(nodes, true);
                self.delete_end(nodes, false);
            }
            Realization::Pair => self.delete_end(nodes, true),
        }
    }

    /// `(<s1> <s2>) <tunnel>`, where each `sN` is `OK` or `MISSING`.
    pub fn status(&mut self, nodes: &mut NodeTable) -> String {
        let s1 = end_status(nodes, &self.end1);
        let s2 = end_status(nodes, &self.end2);
        let link = match self.realization {
            Some(Realization::Tunnel(ref mut t)) => t.status().to_string(),
            Some(Realization::Pair) => "OK".to_string(),
            None => "NOT REALIZED".to_string(),
        };
        format!("({} {}) {}", s1, s2, link)
    }

    fn delete_end(&self, nodes: &mut NodeTable, first: bool) {
        let end = if first { &self.end1 } else { &self.end2 };
        let result = nodes
            .get_mut(&end.node)
            .and_then(|node| delete_intf(node, &end.intf));
        match result {
            Ok(out) if out.trim().is_empty() => {}
            Ok(out) => warn!(node = %end.node, intf = %end.intf, output = %out.trim(), "delete failed"),
            Err(e) => warn!(node = %end.node, intf = %end.intf, error = %e, "delete failed"),
        }
    }
}


fn end_status(nodes: &mut NodeTable, end: &LinkEnd) -> &'static str {
    let present = nodes
        .get_mut(&end.node)
        .and_then(|node| intf_present(node, &end.intf));
    match present {
        Ok(true) => "OK",
        _ => "MISSING",
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
