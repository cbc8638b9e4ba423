//! Error type shared by every clusternet component.
//!
//! Construction and link-realization failures abort topology setup, so each
//! variant carries the literal command and captured output that caused it.
//! Ordinary one-shot commands never produce an error for a non-zero exit;
//! that is returned as data in `CommandOutput`.

use std::io;

use thiserror::Error;


pub type Result<T> = std::result::Result<T, ClusterError>;


#[derive(Debug, Error)]
pub enum ClusterError {
    /// The node's server could be matched neither as a literal IPv4 address
    /// nor through a forward lookup.
    #[error("cannot resolve server '{server}' for node '{node}'")]
    Resolve { node: String, server: String },

    /// Creating the placeholder TAP device in a root namespace printed output.
    #[error("error creating {device} on {node}: {output}")]
    Placeholder {
        node: String,
        device: String,
        output: String,
    },

    /// The first byte read from the tunnel process was not the liveness marker.
    #[error(
        "tunnel setup failed for {node1}:{dest1} to {node2}:{dest2}\n\
         command was: {command}\n\
         result was: {output}"
    )]
    TunnelNegotiation {
        node1: String,
        dest1: String,
        node2: String,
        dest2: String,
        command: String,
        output: String,
    },

    /// No liveness marker arrived within the configured timeout.
    #[error("tunnel liveness check timed out after {timeout_ms}ms\ncommand was: {command}")]
    LivenessTimeout { command: String, timeout_ms: u64 },

    #[error("interface move failed on node {node}: `{command}` returned: {output}")]
    NamespaceMove {
        node: String,
        command: String,
        output: String,
    },

    #[error("error renaming {intf}: {output}")]
    Rename { intf: String, output: String },

    #[error("error pairing {intf1} with {intf2} on {server}: {output}")]
    Pair {
        server: String,
        intf1: String,
        intf2: String,
        output: String,
    },

    #[error("invalid interface name '{0}' (1-15 bytes, no whitespace or '/')")]
    InterfaceName(String),

    #[error("batch command on {server} failed: `{command}` returned: {output}")]
    SwitchBatch {
        server: String,
        command: String,
        output: String,
    },

    #[error("node '{0}' has no running shell")]
    NotStarted(String),

    #[error("shell for node '{0}' closed unexpectedly")]
    ShellClosed(String),

    #[error("unexpected handshake output from node '{node}': {output:?}")]
    Handshake { node: String, output: String },

    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid topology: {0}")]
    Topology(String),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiation_error_names_command_and_output() {
        let err = ClusterError::TunnelNegotiation {
            node1: "h1".into(),
            dest1: "alice@10.0.0.1".into(),
            node2: "h2".into(),
            dest2: "bob@10.0.0.2".into(),
            command: "ssh -n -o Tunnel=Ethernet -w 9:9 bob@10.0.0.2 echo @".into(),
            output: "Permission denied".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("h1:alice@10.0.0.1 to h2:bob@10.0.0.2"));
        assert!(msg.contains("command was: ssh -n -o Tunnel=Ethernet"));
        assert!(msg.contains("result was: Permission denied"));
    }

    #[test]
    fn namespace_move_error_names_node() {
        let err = ClusterError::NamespaceMove {
            node: "h3".into(),
            command: "ip link set tap9 netns 42".into(),
            output: "RTNETLINK answers: Invalid argument".into(),
        };
        assert!(err.to_string().contains("node h3"));
    }

    #[test]
    fn io_errors_convert() {
        let err: ClusterError = io::Error::new(io::ErrorKind::BrokenPipe, "gone").into();
        assert!(matches!(err, ClusterError::Io(_)));
    }
}
