//! Command execution on a node's server.
//!
//! `RemoteExecutor` pairs a `RemoteConnection` with a `Spawner`. Commands run
//! in the server's root namespace: locally when the server is `localhost`,
//! through ssh otherwise. A non-zero exit from `run` is data, not an error;
//! only failing to start the process is.

use std::io::Read;
use std::sync::Arc;

use tracing::debug;

use crate::error::{ClusterError, Result};
use crate::infrastructure::{Process, SpawnOptions, Spawner};

use super::connection::{split_command, RemoteConnection};
use super::shell::ShellSession;


/// Privilege and terminal options for a one-shot command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    pub sudo: bool,
    pub tty: bool,
}

impl RunOptions {
    /// Privileged with a pseudo-tty: the default for root-namespace commands.
    pub fn root() -> Self {
        RunOptions {
            sudo: true,
            tty: true,
        }
    }

    /// Privileged, no pseudo-tty.
    pub fn root_no_tty() -> Self {
        RunOptions {
            sudo: true,
            tty: false,
        }
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::root()
    }
}


/// Combined stdout/stderr and exit code of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub output: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// True when the command printed nothing but whitespace. Interface
    /// manipulation commands report failure only by printing.
    pub fn is_quiet(&self) -> bool {
        self.output.trim().is_empty()
    }
}


#[derive(Clone)]
pub struct RemoteExecutor {
    connection: RemoteConnection,
    spawner: Arc<dyn Spawner>,
}

impl RemoteExecutor {
    pub fn new(connection: RemoteConnection, spawner: Arc<dyn Spawner>) -> Self {
        RemoteExecutor { connection, spawner }
    }

    pub fn connection(&self) -> &RemoteConnection {
        &self.connection
    }

    /// Run a whitespace-separated command to completion.
    pub fn run(&self, cmd: &str, opts: RunOptions) -> Result<CommandOutput> {
        self.run_argv(&split_command(cmd), opts)
    }

    /// Run an argument vector to completion, draining output until EOF and
    /// then reaping the process.
    pub fn run_argv(&self, cmd: &[String], opts: RunOptions) -> Result<CommandOutput> {
        let argv = self.connection.build_command(cmd, opts.sudo, opts.tty);
        let mut process = self.spawn(&argv, SpawnOptions::default())?;
        let mut raw = Vec::new();
        if let Some(mut out) = process.take_output() {
            let mut chunk = [0u8; 4096];
            loop {
                let n = out.read(&mut chunk)?;
                if n == 0 {
                    break;
                }
                raw.extend_from_slice(&chunk[..n]);
            }
        }
        let exit_code = process.wait()?;
        let output = String::from_utf8_lossy(&raw).into_owned();
        debug!(exit_code, bytes = raw.len(), "command finished");
        Ok(CommandOutput { output, exit_code })
    }

    /// Root-namespace command with sudo and a pseudo-tty; returns its output.
    pub fn rcmd(&self, cmd: &str) -> Result<String> {
        Ok(self.run(cmd, RunOptions::root())?.output)
    }

    /// Start a long-running process without waiting for it. Never allocates a
    /// pseudo-tty.
    pub fn spawn_background(&self, cmd: &[String], sudo: bool) -> Result<Box<dyn Process>> {
        let argv = self.connection.build_command(cmd, sudo, false);
        self.spawn(&argv, SpawnOptions::default())
    }

    /// Launch a persistent shell for `node` and send its pid handshake.
    ///
    /// Remote shells run under `sudo -E` with a pseudo-tty. The handshake
    /// reply is collected later by `ShellSession::wait_ready`, so several
    /// shells can be started before any of them is waited on.
    pub fn start_interactive_shell(&self, node: &str, shell: &[String]) -> Result<ShellSession> {
        let argv = if self.connection.is_remote() {
            self.connection.build_command(shell, true, true)
        } else {
            shell.to_vec()
        };
        let process = self.spawn(&argv, SpawnOptions::interactive())?;
        ShellSession::start(node, process)
    }

    fn spawn(&self, argv: &[String], opts: SpawnOptions) -> Result<Box<dyn Process>> {
        debug!(server = %self.connection.server(), command = %argv.join(" "), "spawn");
        self.spawner
            .spawn(argv, opts)
            .map_err(|source| ClusterError::Spawn {
                command: argv.join(" "),
                source,
            })
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
