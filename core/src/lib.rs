//! Clusternet core: emulated network topologies spread across servers.
//!
//! Nodes and switches are pinned to physical servers and driven over ssh.
//! Links between nodes on one server are veth pairs; links between servers
//! are ssh Ethernet tunnels whose TAP ends are grafted into each node's
//! network namespace. Switches are started and stopped in per-server batches,
//! and every server touched is visited once more at the end of the run for
//! cleanup.
//!
//! # Modules
//!
//! - [`config`]: Runtime configuration (YAML)
//! - [`topology`]: Host, switch and link descriptors
//! - [`infrastructure`]: Process spawning backends (OS and mock)
//! - [`remote`]: ssh command construction, execution and persistent shells
//! - [`node`]: Nodes pinned to servers
//! - [`netns`]: Moving and renaming interfaces across namespaces
//! - [`link`]: veth pairs, ssh tunnels and placeholder reservation
//! - [`switch`]: Batched switch start and stop
//! - [`cleanup`]: End-of-run cleanup registry
//! - [`network`]: The realized topology and its lifecycle

pub mod cleanup;
pub mod config;
pub mod error;
pub mod infrastructure;
pub mod link;
pub mod netns;
pub mod network;
pub mod node;
pub mod remote;
pub mod switch;
pub mod topology;

pub use cleanup::{CleanupRegistry, CleanupReport};
pub use config::ClusterConfig;
pub use error::{ClusterError, Result};
pub use network::ClusterNetwork;
pub use topology::Topology;
