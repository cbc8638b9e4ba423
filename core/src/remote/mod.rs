//! Running commands on a node's server.
//!
//! - `connection` builds ssh and sudo wrapped argument vectors.
//! - `resolve` maps server names to IPv4 addresses.
//! - `executor` runs one-shot, background and interactive processes.
//! - `shell` drives a persistent shell inside a node's namespace.

pub mod connection;
pub mod executor;
pub mod resolve;
pub mod shell;

pub use connection::{split_command, RemoteConnection};
pub use executor::{CommandOutput, RemoteExecutor, RunOptions};
pub use resolve::{current_user, resolve};
pub use shell::ShellSession;
