//! Batched switch lifecycle.
//!
//! Switches sharing a server are started and stopped with one `ovs-vsctl`
//! call per server. Groups are formed by a stable sort on server name, so the
//! order of calls is deterministic. Groups touch disjoint servers and can run
//! on separate threads.

use std::thread;

use tracing::{info, warn};

use crate::error::{ClusterError, Result};
use crate::node::ClusterNode;
use crate::remote::RunOptions;


/// Sort `items` by server (stable) and split them into runs sharing a server.
pub fn group_by_server<T, F>(mut items: Vec<T>, key: F) -> Vec<(String, Vec<T>)>
where
    F: Fn(&T) -> &str,
{
    items.sort_by(|a, b| key(a).cmp(key(b)));
    let mut groups: Vec<(String, Vec<T>)> = Vec::new();
    for item in items {
        let server = key(&item).to_string();
        match groups.last_mut() {
            Some((current, members)) if *current == server => members.push(item),
            _ => groups.push((server, vec![item])),
        }
    }
    groups
}


/// `ovs-vsctl` arguments creating each bridge in standalone mode with its
/// ports attached.
pub fn start_command(switches: &[&mut ClusterNode]) -> String {
    let mut cmd = String::from("ovs-vsctl");
    for switch in switches {
        let name = switch.name();
        cmd.push_str(&format!(
            " -- --may-exist add-br {} -- set bridge {} fail-mode=standalone",
            name, name
        ));
        for port in switch.ports() {
            cmd.push_str(&format!(" -- --may-exist add-port {} {}", name, port));
        }
    }
    cmd
}


pub fn stop_command(switches: &[&mut ClusterNode]) -> String {
    let mut cmd = String::from("ovs-vsctl");
    for switch in switches {
        cmd.push_str(&format!(" -- --if-exists del-br {}", switch.name()));
    }
    cmd
}


#[derive(Debug, Clone, Copy, Default)]
pub struct SwitchBatchController {
    parallel: bool,
}

impl SwitchBatchController {
    pub fn new(parallel: bool) -> Self {
        SwitchBatchController { parallel }
    }

    /// Start every switch, one call per server through the group's first
    /// switch shell. Returns the number of batch calls made.
    pub fn batch_start(&self, switches: Vec<&mut ClusterNode>) -> Result<usize> {
        let groups = group_by_server(switches, |s| s.server());
        let calls = groups.len();
        let results = self.each_group(groups, start_group);
        results.into_iter().collect::<Result<Vec<()>>>()?;
        Ok(calls)
    }

    /// Delete every switch bridge, one fresh root command per server. Never
    /// fails; problems are logged. Returns the number of batch calls made.
    pub fn batch_stop(&self, switches: Vec<&mut ClusterNode>) -> usize {
        let groups = group_by_server(switches, |s| s.server());
        let calls = groups.len();
        for result in self.each_group(groups, stop_group) {
            if let Err(e) = result {
                warn!(error = %e, "switch batch stop failed");
            }
        }
        calls
    }

    fn each_group<'n, F>(&self, groups: Vec<(String, Vec<&'n mut ClusterNode>)>, f: F) -> Vec<Result<()>>
    where
        F: Fn(&str, &mut [&'n mut ClusterNode]) -> Result<()> + Sync,
    {
        if !self.parallel || groups.len() < 2 {
            return groups
                .into_iter()
                .map(|(server, mut members)| f(&server, &mut members))
                .collect();
        }
        let f = &f;
        thread::scope(|scope| {
            let handles: Vec<_> = groups
                .into_iter()
                .map(|(server, mut members)| scope.spawn(move || f(&server, &mut members)))
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join().unwrap_or_else(|_| {
                        Err(ClusterError::Io(std::io::Error::new(
                            std::io::ErrorKind::Other,
                            "switch batch thread panicked",
                        )))
                    })
                })
                .collect()
        })
    }
}


fn start_group(server: &str, members: &mut [&mut ClusterNode]) -> Result<()> {
    let cmd = start_command(members);
    let count = members.len();
    let Some(first) = members.first_mut() else {
        return Ok(());
    };
    info!(server, switches = count, "starting switches");
    let output = first.cmd(&cmd)?;
    if !output.trim().is_empty() {
        return Err(ClusterError::SwitchBatch {
            server: server.to_string(),
            command: cmd,
            output,
        });
    }
    Ok(())
}


fn stop_group(server: &str, members: &mut [&mut ClusterNode]) -> Result<()> {
    let cmd = stop_command(members);
    let Some(first) = members.first() else {
        return Ok(());
    };
    info!(server, "stopping switches");
    let out = first.executor().run(&cmd, RunOptions::root())?;
    if !out.is_quiet() {
        return Err(ClusterError::SwitchBatch {
            server: server.to_string(),
            command: cmd,
            output: out.output,
        });
    }
    Ok(())
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

    fn switches(mock: &MockSpawner, placement: &[(&str, &str)]) -> Vec<ClusterNode> {
        let cfg = ClusterConfig::default();
        let reg = CleanupRegistry::new(Arc::new(MockSpawner::new()), &cfg, "root");
        let ctx = NodeContext {
            config: &cfg,
            spawner: Arc::new(mock.clone()),
            invoking_user: "root",
            cleanup: &reg,
        };
        let nodes = placement
            .iter()
            .map(|(name, server)| {
                let mut node =
                    ClusterNode::new(&NodeSpec::new(name, server), NodeRole::Switch, &ctx).unwrap();
                node.start_shell(&cfg).unwrap();
                node.wait_ready().unwrap();
                node
            })
            .collect();
        reg.cleanup();
        nodes
    }

    // -- Grouping --

    #[test]
    fn groups_by_server_in_sorted_order() {
        let items = vec![("s1", "h1"), ("s2", "h2"), ("s3", "h1")];
        let groups = group_by_server(items, |item| item.1);
        assert_eq!(
            groups,
            vec![
                ("h1".to_string(), vec![("s1", "h1"), ("s3", "h1")]),
                ("h2".to_string(), vec![("s2", "h2")]),
            ]
        );
    }

    #[test]
    fn grouping_empty_input() {
        let groups = group_by_server(Vec::<(&str, &str)>::new(), |item| item.1);
        assert!(groups.is_empty());
    }

    // -- Commands --

    #[test]
    fn start_command_adds_bridges_and_ports() {
        let mock = MockSpawner::new();
        let mut nodes = switches(&mock, &[("s1", "10.0.0.1"), ("s3", "10.0.0.1")]);
        nodes[0].add_port("s1-eth1");
        nodes[0].add_port("s1-eth2");
        let refs: Vec<&mut ClusterNode> = nodes.iter_mut().collect();
        assert_eq!(
            start_command(&refs),
            "ovs-vsctl -- --may-exist add-br s1 -- set bridge s1 fail-mode=standalone \
             -- --may-exist add-port s1 s1-eth1 -- --may-exist add-port s1 s1-eth2 \
             -- --may-exist add-br s3 -- set bridge s3 fail-mode=standalone"
        );
        assert_eq!(
            stop_command(&refs),
            "ovs-vsctl -- --if-exists del-br s1 -- --if-exists del-br s3"
        );
    }

    // -- Batches --

    #[test]
    fn one_start_call_per_server_through_first_switch_shell() {
        let mock = MockSpawner::new();
        let mut nodes = switches(&mock, &[("s1", "10.0.0.1"), ("s2", "10.0.0.2"), ("s3", "10.0.0.1")]);
        let calls = SwitchBatchController::new(false)
            .batch_start(nodes.iter_mut().collect())
            .unwrap();
        assert_eq!(calls, 2);
        assert_eq!(mock.shell_lines_matching("ovs-vsctl"), 2);
        // s1 leads the 10.0.0.1 group (pid 1000), s2 its own (pid 1001).
        let s1_lines = mock.shell_lines_for(1000);
        assert!(s1_lines[1].contains("add-br s1"));
        assert!(s1_lines[1].contains("add-br s3"));
        assert!(mock.shell_lines_for(1002).iter().all(|l| !l.contains("ovs-vsctl")));
        assert!(mock.shell_lines_for(1001)[1].contains("add-br s2"));
    }

    #[test]
    fn parallel_start_makes_same_calls() {
        let mock = MockSpawner::new();
        let mut nodes = switches(&mock, &[("s1", "10.0.0.1"), ("s2", "10.0.0.2"), ("s3", "10.0.0.1")]);
        let calls = SwitchBatchController::new(true)
            .batch_start(nodes.iter_mut().collect())
            .unwrap();
        assert_eq!(calls, 2);
        assert_eq!(mock.shell_lines_matching("ovs-vsctl"), 2);
    }

    #[test]
    fn start_output_is_an_error() {
        let mock = MockSpawner::new();
        mock.on_shell("ovs-vsctl", "ovs-vsctl: unix:/var/run/openvswitch/db.sock: database connection failed\n");
        let mut nodes = switches(&mock, &[("s1", "10.0.0.1")]);
        let err = SwitchBatchController::new(false)
            .batch_start(nodes.iter_mut().collect())
            .unwrap_err();
        assert!(matches!(err, ClusterError::SwitchBatch { .. }));
        assert!(err.to_string().contains("10.0.0.1"));
    }

    #[test]
    fn stop_uses_fresh_root_command() {
        let mock = MockSpawner::new();
        let mut nodes = switches(&mock, &[("s1", "10.0.0.1"), ("s2", "10.0.0.2"), ("s3", "10.0.0.1")]);
        let calls = SwitchBatchController::new(false).batch_stop(nodes.iter_mut().collect());
        assert_eq!(calls, 2);
        assert_eq!(mock.shell_lines_matching("del-br"), 0);
        let stops: Vec<String> = mock
            .spawned()
            .into_iter()
            .filter(|c| c.contains("del-br"))
            .collect();
        assert_eq!(stops.len(), 2);
        assert!(stops[0].ends_with("root@10.0.0.1 sudo -E ovs-vsctl -- --if-exists del-br s1 -- --if-exists del-br s3"));
        assert!(stops[1].ends_with("root@10.0.0.2 sudo -E ovs-vsctl -- --if-exists del-br s2"));
    }

    #[test]
    fn stop_failures_are_swallowed() {
        let mock = MockSpawner::new();
        mock.on("del-br", MockBehavior::exit("ssh: connect to host: No route", 255));
        let mut nodes = switches(&mock, &[("s1", "10.0.0.1")]);
        assert_eq!(
            SwitchBatchController::new(true).batch_stop(nodes.iter_mut().collect()),
            1
        );
    }
}
