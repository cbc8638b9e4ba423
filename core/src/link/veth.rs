//! Same-server links as veth pairs.

use tracing::debug;

use crate::error::{ClusterError, Result};
use crate::netns::move_intf;
use crate::node::ClusterNode;

use super::LinkEnd;


/// Create a veth pair in the shared server's root namespace and move each
/// end into its node.
pub fn make_pair(
    node1: &ClusterNode,
    node2: &ClusterNode,
    end1: &LinkEnd,
    end2: &LinkEnd,
) -> Result<()> {
    let mut cmd = format!("ip link add name {}", end1.intf);
    if let Some(ref mac) = end1.mac {
        cmd.push_str(&format!(" address {}", mac));
    }
    cmd.push_str(&format!(" type veth peer name {}", end2.intf));
    if let Some(ref mac) = end2.mac {
        cmd.push_str(&format!(" address {}", mac));
    }
    let output = node1.rcmd(&cmd)?;
    if !output.trim().is_empty() {
        return Err(ClusterError::Pair {
            server: node1.server().to_string(),
            intf1: end1.intf.clone(),
            intf2: end2.intf.clone(),
            output,
        });
    }
    move_intf(&end1.intf, node1)?;
    move_intf(&end2.intf, node2)?;
    debug!(intf1 = %end1.intf, intf2 = %end2.intf, server = %node1.server(), "veth pair up");
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::cleanup::CleanupRegistry;
    use crate::config::ClusterConfig;
    use crate::infrastructure::mock::{MockBehavior, MockSpawner};
    use crate::node::{NodeContext, NodeRole};
    use crate::topology::NodeSpec;

    fn started(name: &str, mock: &MockSpawner) -> ClusterNode {
        let cfg = ClusterConfig::default();
        let reg = CleanupRegistry::new(Arc::new(MockSpawner::new()), &cfg, "root");
        let ctx = NodeContext {
            config: &cfg,
            spawner: Arc::new(mock.clone()),
            invoking_user: "root",
            cleanup: &reg,
        };
        let mut node = ClusterNode::new(&NodeSpec::new(name, "10.0.0.1"), NodeRole::Host, &ctx).unwrap();
        node.start_shell(&cfg).unwrap();
        node.wait_ready().unwrap();
        reg.cleanup();
        node
    }

    fn end(node: &str, intf: &str, mac: Option<&str>) -> LinkEnd {
        LinkEnd {
            node: node.into(),
            intf: intf.into(),
            mac: mac.map(String::from),
        }
    }

    #[test]
    fn pair_created_on_first_node_then_moved() {
        let mock = MockSpawner::new();
        let a = started("a", &mock);
        let b = started("b", &mock);
        make_pair(&a, &b, &end("a", "a-eth0", None), &end("b", "b-eth0", Some("02:00:00:00:00:0b"))).unwrap();
        let spawned = mock.spawned();
        assert!(spawned[2].ends_with(
            "sudo -E ip link add name a-eth0 type veth peer name b-eth0 address 02:00:00:00:00:0b"
        ));
        assert!(spawned[3].ends_with("ip link set a-eth0 netns 1000"));
        assert!(spawned[4].ends_with("ip link set b-eth0 netns 1001"));
        assert_eq!(mock.spawned_matching("Tunnel=Ethernet"), 0);
    }

    #[test]
    fn pair_output_is_fatal() {
        let mock = MockSpawner::new();
        mock.on("type veth", MockBehavior::exit("RTNETLINK answers: File exists", 2));
        let a = started("a", &mock);
        let b = started("b", &mock);
        let err = make_pair(&a, &b, &end("a", "x0", None), &end("b", "x1", None)).unwrap_err();
        assert!(err.to_string().contains("error pairing x0 with x1 on 10.0.0.1"));
        assert_eq!(mock.spawned_matching("netns"), 0);
    }
}
