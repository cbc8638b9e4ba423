//! Cross-server links over ssh Ethernet tunnels.
//!
//! Establishing a tunnel between node A (server X) and node B (server Y):
//!
//! 1. Create the placeholder TAP device in the root namespace of X and Y.
//! 2. From X, start `ssh -n -o Tunnel=Ethernet -w N:N user@Y echo <marker>`.
//! 3. Read one byte. The marker means the tunnel is up; anything else is the
//!    start of an error message.
//! 4. Move each placeholder into its node's namespace.
//! 5. Rename each placeholder to the link's interface name.
//!
//! Both servers stay reserved in `PlaceholderLocks` from step 1 to step 5.
//! If any later step fails, ssh is stopped and a placeholder on a local end
//! is deleted at once; remote placeholders go in the end-of-run cleanup.
//! The marker is a bare byte with no framing, so a remote login banner that
//! happens to start with it would be mistaken for success.

use std::fmt;
use std::io::{self, Read};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::TunnelConfig;
use crate::error::{ClusterError, Result};
use crate::infrastructure::Process;
use crate::netns::{move_intf, rename_intf};
use crate::node::{ClusterNode, LOCALHOST};

use super::placeholder::PlaceholderLocks;
use super::LinkEnd;


pub struct TunnelBridge<'a> {
    config: &'a TunnelConfig,
    locks: &'a PlaceholderLocks,
}

impl<'a> TunnelBridge<'a> {
    pub fn new(config: &'a TunnelConfig, locks: &'a PlaceholderLocks) -> Self {
        TunnelBridge { config, locks }
    }

    /// Build a tunnel between two nodes on different servers.
    ///
    /// ssh cannot be pointed at `localhost` from elsewhere, so when the second
    /// node is local the ends are swapped and the local side launches ssh.
    pub fn establish(
        &self,
        node1: &mut ClusterNode,
        node2: &mut ClusterNode,
        end1: &LinkEnd,
        end2: &LinkEnd,
    ) -> Result<Tunnel> {
        if node2.server() == LOCALHOST {
            return self.establish(node2, node1, end2, end1);
        }
        let _guard = self.locks.acquire(&[node1.server(), node2.server()]);
        let device = self.config.placeholder();

        for node in [&*node1, &*node2] {
            if let Err(e) = create_placeholder(node, &device) {
                release_local_placeholders(node1, node2, &device);
                return Err(e);
            }
        }

        let unit = self.config.placeholder_index;
        let command: Vec<String> = vec![
            "ssh".into(),
            "-n".into(),
            "-o".into(),
            "Tunnel=Ethernet".into(),
            "-w".into(),
            format!("{}:{}", unit, unit),
            format!("{}@{}", node2.user(), node2.ip()),
            format!("echo {}", self.config.marker),
        ];
        let command_line = command.join(" ");
        let mut process = node1.executor().spawn_background(&command, false)?;
        let output = process.take_output().ok_or_else(|| {
            io::Error::new(io::ErrorKind::BrokenPipe, "tunnel process has no output")
        })?;

        let marker = self.config.marker as u8;
        let output = match check_liveness(output, marker, self.config.liveness_timeout()) {
            Liveness::Live(rest) => rest,
            Liveness::Mismatch { first, mut rest } => {
                stop_process(process.as_mut());
                let mut text = first;
                let _ = rest.read_to_end(&mut text);
                release_local_placeholders(node1, node2, &device);
                return Err(ClusterError::TunnelNegotiation {
                    node1: node1.name().to_string(),
                    dest1: node1.dest(),
                    node2: node2.name().to_string(),
                    dest2: node2.dest(),
                    command: command_line,
                    output: String::from_utf8_lossy(&text).into_owned(),
                });
            }
            Liveness::TimedOut => {
                stop_process(process.as_mut());
                release_local_placeholders(node1, node2, &device);
                return Err(ClusterError::LivenessTimeout {
                    command: command_line,
                    timeout_ms: self.config.liveness_timeout_ms.unwrap_or_default(),
                });
            }
        };

        if let Err(e) = graft(&device, node1, node2, end1, end2) {
            stop_process(process.as_mut());
            release_local_placeholders(node1, node2, &device);
            return Err(e);
        }
        info!(
            node1 = %node1.name(),
            node2 = %node2.name(),
            pid = process.pid(),
            "tunnel up"
        );
        Ok(Tunnel {
            process,
            command,
            _output: output,
            node1: node1.name().to_string(),
            node2: node2.name().to_string(),
            terminated: false,
        })
    }
}


fn create_placeholder(node: &ClusterNode, device: &str) -> Result<()> {
    let cmd = format!("ip tuntap add dev {} mode tap user {}", device, node.user());
    let output = node.rcmd(&cmd)?;
    if !output.trim().is_empty() {
        return Err(ClusterError::Placeholder {
            node: node.name().to_string(),
            device: device.to_string(),
            output,
        });
    }
    Ok(())
}


/// Delete the placeholder on any local end of a failed tunnel. Remote ends
/// are left to the end-of-run cleanup pass, which never visits localhost.
fn release_local_placeholders(node1: &ClusterNode, node2: &ClusterNode, device: &str) {
    for node in [node1, node2].into_iter().filter(|n| !n.is_remote()) {
        match node.rcmd(&format!("ip link delete {}", device)) {
            Ok(out) if out.trim().is_empty() => {
                debug!(node = %node.name(), device, "released local placeholder");
            }
            Ok(out) => debug!(node = %node.name(), device, output = %out.trim(), "placeholder not released"),
            Err(e) => warn!(node = %node.name(), device, error = %e, "placeholder not released"),
        }
    }
}


fn graft(
    device: &str,
    node1: &mut ClusterNode,
    node2: &mut ClusterNode,
    end1: &LinkEnd,
    end2: &LinkEnd,
) -> Result<()> {
    move_intf(device, node1)?;
    move_intf(device, node2)?;
    rename_intf(node1, device, &end1.intf, end1.mac.as_deref())?;
    rename_intf(node2, device, &end2.intf, end2.mac.as_deref())?;
    Ok(())
}


fn stop_process(process: &mut dyn Process) {
    if let Err(e) = process.terminate() {
        warn!(pid = process.pid(), error = %e, "failed to terminate tunnel");
        return;
    }
    if let Err(e) = process.wait() {
        warn!(pid = process.pid(), error = %e, "failed to reap tunnel");
    }
}


// ---------------------------------------------------------------------------
// Liveness
// ---------------------------------------------------------------------------

pub enum Liveness {
    /// The marker arrived. Holds the rest of the stream, which must stay open
    /// for as long as the tunnel runs.
    Live(Box<dyn Read + Send>),
    /// Something else arrived (or the stream ended). `first` holds what was
    /// read so far.
    Mismatch {
        first: Vec<u8>,
        rest: Box<dyn Read + Send>,
    },
    TimedOut,
}

impl fmt::Debug for Liveness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Liveness::Live(_) => write!(f, "Live"),
            Liveness::Mismatch { first, .. } => {
                write!(f, "Mismatch({:?})", String::from_utf8_lossy(first))
            }
            Liveness::TimedOut => write!(f, "TimedOut"),
        }
    }
}


/// Read the first byte of `output` and compare it with `marker`.
///
/// The read happens on a helper thread so it can be abandoned after
/// `timeout`. With no timeout it blocks until a byte or EOF arrives. An
/// abandoned reader ends once its process is terminated.
pub fn check_liveness(
    output: Box<dyn Read + Send>,
    marker: u8,
    timeout: Option<Duration>,
) -> Liveness {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut output = output;
        let mut byte = [0u8; 1];
        let first = match output.read(&mut byte) {
            Ok(0) => Vec::new(),
            Ok(_) => byte.to_vec(),
            Err(e) => format!("read error: {}", e).into_bytes(),
        };
        let _ = tx.send((first, output));
    });
    let received = match timeout {
        Some(limit) => rx.recv_timeout(limit).ok(),
        None => rx.recv().ok(),
    };
    match received {
        Some((first, rest)) if first == [marker] => Liveness::Live(rest),
        Some((first, rest)) => {
            debug!(first = ?String::from_utf8_lossy(&first), "unexpected tunnel output");
            Liveness::Mismatch { first, rest }
        }
        None => Liveness::TimedOut,
    }
}


// ---------------------------------------------------------------------------
// Tunnel
// ---------------------------------------------------------------------------

/// State of a tunnel's ssh process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelStatus {
    Running { pid: u32, command: String },
    Exited(i32),
}

impl fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelStatus::Running { pid, command } => {
                write!(f, "Tunnel Running ({}: {})", pid, command)
            }
            TunnelStatus::Exited(code) => write!(f, "Tunnel EXITED {}", code),
        }
    }
}


/// A live ssh tunnel. Its process is terminated at most once, on `terminate`
/// or on drop.
pub struct Tunnel {
    process: Box<dyn Process>,
    command: Vec<String>,
    _output: Box<dyn Read + Send>,
    node1: String,
    node2: String,
    terminated: bool,
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel")
            .field("pid", &self.process.pid())
            .field("command", &self.command_line())
            .field("node1", &self.node1)
            .field("node2", &self.node2)
            .field("terminated", &self.terminated)
            .finish()
    }
}

impl Tunnel {
    /// The ssh command as launched, before any wrapping.
    pub fn command(&self) -> &[String] {
        &self.command
    }

    pub fn command_line(&self) -> String {
        self.command.join(" ")
    }

    /// The node that launched ssh, then the far node.
    pub fn endpoints(&self) -> (&str, &str) {
        (&self.node1, &self.node2)
    }

    pub fn pid(&self) -> u32 {
        self.process.pid()
    }

    pub fn status(&mut self) -> TunnelStatus {
        match self.process.try_wait() {
            Ok(Some(code)) => TunnelStatus::Exited(code),
            _ => TunnelStatus::Running {
                pid: self.process.pid(),
                command: self.command_line(),
            },
        }
    }

    pub fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        stop_process(self.process.as_mut());
        debug!(node1 = %self.node1, node2 = %self.node2, "tunnel terminated");
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.terminate();
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
