//! Moving interfaces between network namespaces.
//!
//! Interfaces are created in a server's root namespace and then moved into a
//! node's namespace, named by the pid of the node's shell. Kernel tooling
//! reports failure by printing, so any output from these commands is an
//! error.

use tracing::debug;

use crate::error::{ClusterError, Result};
use crate::node::ClusterNode;


/// Longest interface name the kernel accepts (IFNAMSIZ - 1).
pub const MAX_INTF_NAME: usize = 15;


pub fn validate_intf_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.len() <= MAX_INTF_NAME
        && !name.chars().any(|c| c.is_whitespace() || c == '/');
    if ok {
        Ok(())
    } else {
        Err(ClusterError::InterfaceName(name.to_string()))
    }
}


/// Move `intf` from the root namespace of `node`'s server into the node.
pub fn move_intf(intf: &str, node: &ClusterNode) -> Result<()> {
    let cmd = format!("ip link set {} netns {}", intf, node.pid()?);
    let output = node.rcmd(&cmd)?;
    if !output.trim().is_empty() {
        return Err(ClusterError::NamespaceMove {
            node: node.name().to_string(),
            command: cmd,
            output,
        });
    }
    debug!(node = %node.name(), intf, "moved interface");
    Ok(())
}


/// Rename `from` to `to` inside the node, optionally setting its MAC.
pub fn rename_intf(node: &mut ClusterNode, from: &str, to: &str, mac: Option<&str>) -> Result<()> {
    let mut cmd = format!("ip link set {} name {}", from, to);
    if let Some(mac) = mac {
        cmd.push_str(&format!(" address {}", mac));
    }
    let output = node.cmd(&cmd)?;
    if !output.trim().is_empty() {
        return Err(ClusterError::Rename {
            intf: to.to_string(),
            output,
        });
    }
    Ok(())
}


/// Delete `intf` inside the node. Returns whatever the command printed.
pub fn delete_intf(node: &mut ClusterNode, intf: &str) -> Result<String> {
    node.cmd(&format!("ip link del {}", intf))
}


/// Whether `intf` shows up in `ip link show` inside the node.
pub fn intf_present(node: &mut ClusterNode, intf: &str) -> Result<bool> {
    let listing = node.cmd("ip link show")?;
    Ok(listing
        .lines()
        .filter_map(|line| line.split(':').nth(1))
        .any(|name| name.trim().split('@').next() == Some(intf)))
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::cleanup::CleanupRegistry;
    use crate::config::ClusterConfig;
    use crate::infrastructure::mock::{MockBehavior, MockSpawner};
    use crate::node::{NodeContext, NodeRole};
    use crate::topology::NodeSpec;

    fn started_node(mock: &MockSpawner, server: &str) -> ClusterNode {
        let cfg = ClusterConfig::default();
        let reg = CleanupRegistry::new(Arc::new(mock.clone()), &cfg, "root");
        let ctx = NodeContext {
            config: &cfg,
            spawner: Arc::new(mock.clone()),
            invoking_user: "root",
            cleanup: &reg,
        };
        let mut node = ClusterNode::new(&NodeSpec::new("h1", server), NodeRole::Host, &ctx).unwrap();
        node.start_shell(&cfg).unwrap();
        node.wait_ready().unwrap();
        // Keep the registry from visiting the server when it drops.
        reg.cleanup();
        node
    }

    // -- Names --

    #[test]
    fn interface_name_rules() {
        assert!(validate_intf_name("h1-eth0").is_ok());
        assert!(validate_intf_name("fifteen-chars-x").is_ok());
        assert!(validate_intf_name("sixteen-chars-xx").is_err());
        assert!(validate_intf_name("").is_err());
        assert!(validate_intf_name("a b").is_err());
        assert!(validate_intf_name("a/b").is_err());
    }

    // -- Move --

    #[test]
    fn move_uses_shell_pid() {
        let mock = MockSpawner::new();
        let node = started_node(&mock, "10.0.0.1");
        move_intf("tap9", &node).unwrap();
        let last = mock.spawned().pop().unwrap();
        assert!(last.ends_with("sudo -E ip link set tap9 netns 1000"));
    }

    #[test]
    fn move_output_is_fatal_and_names_node() {
        let mock = MockSpawner::new();
        mock.on("netns", MockBehavior::exit("RTNETLINK answers: No such device", 2));
        let node = started_node(&mock, "10.0.0.1");
        let err = move_intf("tap9", &node).unwrap_err();
        assert!(matches!(err, ClusterError::NamespaceMove { .. }));
        assert!(err.to_string().contains("node h1"));
    }

    // -- Rename --

    #[test]
    fn rename_with_and_without_mac() {
        let mock = MockSpawner::new();
        let mut node = started_node(&mock, "10.0.0.1");
        rename_intf(&mut node, "tap9", "h1-eth0", None).unwrap();
        rename_intf(&mut node, "tap9", "h1-eth1", Some("02:00:00:00:00:01")).unwrap();
        let lines = mock.shell_lines();
        assert!(lines[1].starts_with("ip link set tap9 name h1-eth0;"));
        assert!(lines[2].starts_with("ip link set tap9 name h1-eth1 address 02:00:00:00:00:01;"));
        node.stop_shell();
    }

    #[test]
    fn rename_output_is_fatal_and_names_interface() {
        let mock = MockSpawner::new();
        mock.on_shell("name h1-eth0", "RTNETLINK answers: File exists\n");
        let mut node = started_node(&mock, "10.0.0.1");
        let err = rename_intf(&mut node, "tap9", "h1-eth0", None).unwrap_err();
        assert!(err.to_string().contains("error renaming h1-eth0"));
        node.stop_shell();
    }

    // -- Status --

    #[test]
    fn presence_matches_whole_names() {
        let mock = MockSpawner::new();
        mock.on_shell(
            "ip link show",
            "1: lo: <LOOPBACK,UP> mtu 65536\n    link/loopback 00:00:00:00:00:00\n\
             5: h1-eth0@if6: <BROADCAST,UP> mtu 1500\n",
        );
        let mut node = started_node(&mock, "10.0.0.1");
        assert!(intf_present(&mut node, "h1-eth0").unwrap());
        assert!(!intf_present(&mut node, "h1-eth").unwrap());
        assert!(!intf_present(&mut node, "h1-eth1").unwrap());
        node.stop_shell();
    }
}
