//! SSH command construction.
//!
//! `RemoteConnection` is computed once per node and turns a command into the
//! argument vector that runs it on the node's server: wrapped in ssh when the
//! server is remote, and in `sudo` according to the privilege rules below.
//! Nothing here spawns processes, so every rule is a pure function of the
//! connection and its inputs.

use crate::config::SshConfig;
use crate::node::LOCALHOST;


/// How to reach one server as one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteConnection {
    server: String,
    user: String,
    is_remote: bool,
    /// The connecting user differs from the invoking user, so ssh (and local
    /// unprivileged commands) run under `sudo -E -u <user>`.
    sudo_wrap: bool,
    key: Option<String>,
    control_path: Option<String>,
    options: Vec<String>,
}

impl RemoteConnection {
    pub fn new(server: &str, user: &str, invoking_user: &str, ssh: &SshConfig) -> Self {
        RemoteConnection {
            server: server.to_string(),
            user: user.to_string(),
            is_remote: server != LOCALHOST,
            sudo_wrap: !user.is_empty() && user != invoking_user,
            key: ssh.key.clone(),
            control_path: ssh.control_path.clone(),
            options: ssh.options.clone(),
        }
    }

    /// Replace the identity file, e.g. with a per-node key.
    pub fn with_key(mut self, key: Option<String>) -> Self {
        if key.is_some() {
            self.key = key;
        }
        self
    }

    /// Drop connection multiplexing. Cleanup uses this so a stale control
    /// master cannot take the cleanup commands down with it.
    pub fn without_control_path(mut self) -> Self {
        self.control_path = None;
        self
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn is_remote(&self) -> bool {
        self.is_remote
    }

    pub fn sudo_wrap(&self) -> bool {
        self.sudo_wrap
    }

    /// `user@server` for remote connections, empty for local ones.
    pub fn destination(&self) -> String {
        if self.is_remote {
            format!("{}@{}", self.user, self.server)
        } else {
            String::new()
        }
    }

    /// The full ssh prefix, ending with the destination. Empty when local.
    pub fn ssh_command(&self, tty: bool) -> Vec<String> {
        if !self.is_remote {
            return Vec::new();
        }
        let mut args: Vec<String> = Vec::new();
        if self.sudo_wrap {
            args.extend(["sudo", "-E", "-u"].map(String::from));
            args.push(self.user.clone());
        }
        args.extend(
            ["ssh", "-q", "-o", "BatchMode=yes", "-o", "ForwardAgent=yes"].map(String::from),
        );
        if tty {
            args.push("-tt".to_string());
        }
        if let Some(ref key) = self.key {
            args.push("-i".to_string());
            args.push(key.clone());
        }
        if let Some(ref path) = self.control_path {
            args.push("-o".to_string());
            args.push(format!("ControlPath={}", path));
            args.extend(["-o", "ControlMaster=auto", "-o", "ControlPersist=1"].map(String::from));
        }
        for opt in &self.options {
            args.push("-o".to_string());
            args.push(opt.clone());
        }
        args.push(self.destination());
        args
    }

    /// Wrap `cmd` so it runs on this connection's server.
    ///
    /// Remote: `sudo -E` goes in front of the command when `sudo` is set, then
    /// the ssh prefix (with or without `-tt`). Local: the command runs as is,
    /// except that an unprivileged command for a distinct user is wrapped in
    /// `sudo -E -u <user>`.
    pub fn build_command(&self, cmd: &[String], sudo: bool, tty: bool) -> Vec<String> {
        let mut argv = Vec::with_capacity(cmd.len() + 16);
        if self.is_remote {
            argv.extend(self.ssh_command(tty));
            if sudo {
                argv.extend(["sudo", "-E"].map(String::from));
            }
        } else if !sudo && self.sudo_wrap {
            argv.extend(["sudo", "-E", "-u"].map(String::from));
            argv.push(self.user.clone());
        }
        argv.extend(cmd.iter().cloned());
        argv
    }
}


/// Split a command line on whitespace. No quoting is honoured; commands that
/// need it are passed as an argument vector instead.
pub fn split_command(cmd: &str) -> Vec<String> {
    cmd.split_whitespace().map(String::from).collect()
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn ssh() -> SshConfig {
        SshConfig::default()
    }

    fn remote(user: &str, invoking: &str) -> RemoteConnection {
        RemoteConnection::new("10.0.0.2", user, invoking, &ssh())
    }

    fn cmd(s: &str) -> Vec<String> {
        split_command(s)
    }

    fn joined(argv: Vec<String>) -> String {
        argv.join(" ")
    }

    // -- Identity --

    #[test]
    fn localhost_is_local() {
        let conn = RemoteConnection::new("localhost", "alice", "alice", &ssh());
        assert!(!conn.is_remote());
        assert_eq!(conn.destination(), "");
        assert!(conn.ssh_command(true).is_empty());
    }

    #[test]
    fn remote_destination() {
        let conn = remote("bob", "bob");
        assert!(conn.is_remote());
        assert_eq!(conn.destination(), "bob@10.0.0.2");
    }

    // -- ssh prefix --

    #[test]
    fn ssh_command_same_user() {
        assert_eq!(
            joined(remote("bob", "bob").ssh_command(true)),
            "ssh -q -o BatchMode=yes -o ForwardAgent=yes -tt bob@10.0.0.2"
        );
    }

    #[test]
    fn ssh_command_distinct_user_drops_privilege() {
        assert_eq!(
            joined(remote("bob", "root").ssh_command(true)),
            "sudo -E -u bob ssh -q -o BatchMode=yes -o ForwardAgent=yes -tt bob@10.0.0.2"
        );
    }

    #[test]
    fn ssh_command_without_tty() {
        let argv = remote("bob", "bob").ssh_command(false);
        assert!(!argv.contains(&"-tt".to_string()));
        assert_eq!(argv.len(), 7);
    }

    #[test]
    fn ssh_command_with_key_and_control_path() {
        let cfg = SshConfig {
            key: Some("/keys/lab".into()),
            control_path: Some("/tmp/cn-%r@%h".into()),
            options: vec!["StrictHostKeyChecking=no".into()],
        };
        let conn = RemoteConnection::new("lab-b", "bob", "bob", &cfg);
        assert_eq!(
            joined(conn.ssh_command(true)),
            "ssh -q -o BatchMode=yes -o ForwardAgent=yes -tt -i /keys/lab \
             -o ControlPath=/tmp/cn-%r@%h -o ControlMaster=auto -o ControlPersist=1 \
             -o StrictHostKeyChecking=no bob@lab-b"
        );
    }

    #[test]
    fn node_key_overrides_config_key() {
        let cfg = SshConfig {
            key: Some("/keys/default".into()),
            ..SshConfig::default()
        };
        let conn = RemoteConnection::new("lab-b", "bob", "bob", &cfg)
            .with_key(Some("/keys/node".into()));
        assert!(conn.ssh_command(false).contains(&"/keys/node".to_string()));
        let kept = RemoteConnection::new("lab-b", "bob", "bob", &cfg).with_key(None);
        assert!(kept.ssh_command(false).contains(&"/keys/default".to_string()));
    }

    #[test]
    fn without_control_path_strips_multiplexing() {
        let cfg = SshConfig {
            control_path: Some("/tmp/cm".into()),
            ..SshConfig::default()
        };
        let conn = RemoteConnection::new("lab-b", "bob", "bob", &cfg).without_control_path();
        assert!(!joined(conn.ssh_command(false)).contains("ControlPath"));
    }

    // -- build_command --

    #[test]
    fn remote_sudo_tty() {
        assert_eq!(
            joined(remote("bob", "bob").build_command(&cmd("ip link show"), true, true)),
            "ssh -q -o BatchMode=yes -o ForwardAgent=yes -tt bob@10.0.0.2 sudo -E ip link show"
        );
    }

    #[test]
    fn remote_sudo_no_tty() {
        assert_eq!(
            joined(remote("bob", "bob").build_command(&cmd("ip link show"), true, false)),
            "ssh -q -o BatchMode=yes -o ForwardAgent=yes bob@10.0.0.2 sudo -E ip link show"
        );
    }

    #[test]
    fn remote_unprivileged() {
        assert_eq!(
            joined(remote("bob", "bob").build_command(&cmd("uptime"), false, false)),
            "ssh -q -o BatchMode=yes -o ForwardAgent=yes bob@10.0.0.2 uptime"
        );
    }

    #[test]
    fn local_sudo_runs_as_is() {
        let conn = RemoteConnection::new("localhost", "alice", "root", &ssh());
        assert_eq!(
            joined(conn.build_command(&cmd("ip link show"), true, true)),
            "ip link show"
        );
    }

    #[test]
    fn local_unprivileged_distinct_user_drops_privilege() {
        let conn = RemoteConnection::new("localhost", "alice", "root", &ssh());
        assert_eq!(
            joined(conn.build_command(&cmd("ssh -n host"), false, false)),
            "sudo -E -u alice ssh -n host"
        );
    }

    #[test]
    fn local_unprivileged_same_user_runs_as_is() {
        let conn = RemoteConnection::new("localhost", "alice", "alice", &ssh());
        assert_eq!(
            joined(conn.build_command(&cmd("ssh -n host"), false, false)),
            "ssh -n host"
        );
    }

    #[test]
    fn construction_is_deterministic() {
        let conn = remote("bob", "alice");
        let a = conn.build_command(&cmd("echo hi"), true, true);
        let b = conn.build_command(&cmd("echo hi"), true, true);
        assert_eq!(a, b);
    }

    #[test]
    fn split_command_collapses_whitespace() {
        assert_eq!(split_command("  ip   link\tshow "), vec!["ip", "link", "show"]);
        assert!(split_command("").is_empty());
    }
}
