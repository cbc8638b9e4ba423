//! Persistent per-node shell.
//!
//! Each command is written to the shell's stdin followed by a `printf` of the
//! 0x7f sentinel byte; everything read up to the sentinel is that command's
//! output. The first exchange is a handshake that turns off terminal echo and
//! reports the shell's own pid, which names the node's network namespace.

use std::io::{BufRead, BufReader, Read, Write};

use tracing::{debug, warn};

use crate::error::{ClusterError, Result};
use crate::infrastructure::Process;


const SENTINEL: u8 = 0x7f;
const HANDSHAKE: &str = "stty -echo 2>/dev/null; echo $$";


pub struct ShellSession {
    node: String,
    process: Box<dyn Process>,
    stdin: Option<Box<dyn Write + Send>>,
    output: BufReader<Box<dyn Read + Send>>,
    pid: Option<u32>,
    handshake_pending: bool,
}

impl std::fmt::Debug for ShellSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellSession")
            .field("node", &self.node)
            .field("pid", &self.pid)
            .field("handshake_pending", &self.handshake_pending)
            .finish()
    }
}

impl ShellSession {
    /// Take over an interactive process and send the pid handshake without
    /// waiting for the reply.
    pub fn start(node: &str, mut process: Box<dyn Process>) -> Result<ShellSession> {
        let stdin = process
            .take_stdin()
            .ok_or_else(|| ClusterError::ShellClosed(node.to_string()))?;
        let output = process
            .take_output()
            .ok_or_else(|| ClusterError::ShellClosed(node.to_string()))?;
        let mut session = ShellSession {
            node: node.to_string(),
            process,
            stdin: Some(stdin),
            output: BufReader::new(output),
            pid: None,
            handshake_pending: false,
        };
        session.send(HANDSHAKE)?;
        session.handshake_pending = true;
        Ok(session)
    }

    /// Collect the handshake reply. No-op once the pid is known.
    pub fn wait_ready(&mut self) -> Result<u32> {
        if let Some(pid) = self.pid {
            return Ok(pid);
        }
        let reply = self.read_reply()?;
        self.handshake_pending = false;
        let pid = reply
            .lines()
            .rev()
            .find_map(|line| line.trim().parse::<u32>().ok())
            .ok_or_else(|| ClusterError::Handshake {
                node: self.node.clone(),
                output: reply.clone(),
            })?;
        debug!(node = %self.node, pid, "shell ready");
        self.pid = Some(pid);
        Ok(pid)
    }

    /// Run `text` inside the node's namespace and return its output with
    /// carriage returns removed.
    pub fn cmd(&mut self, text: &str) -> Result<String> {
        if self.handshake_pending {
            self.wait_ready()?;
        }
        self.send(text)?;
        self.read_reply()
    }

    /// Pid of the shell process as seen on its own server.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn is_alive(&mut self) -> bool {
        matches!(self.process.try_wait(), Ok(None))
    }

    /// Close stdin and terminate the shell. Safe to call more than once.
    pub fn close(&mut self) {
        self.stdin = None;
        if let Err(e) = self.process.terminate() {
            warn!(node = %self.node, error = %e, "failed to terminate shell");
        }
        if let Err(e) = self.process.wait() {
            warn!(node = %self.node, error = %e, "failed to reap shell");
        }
    }

    fn send(&mut self, text: &str) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| ClusterError::ShellClosed(self.node.clone()))?;
        let line = format!("{}; printf '\\177'\n", text);
        stdin
            .write_all(line.as_bytes())
            .and_then(|_| stdin.flush())
            .map_err(|_| ClusterError::ShellClosed(self.node.clone()))
    }

    fn read_reply(&mut self) -> Result<String> {
        let mut raw = Vec::new();
        self.output.read_until(SENTINEL, &mut raw)?;
        if raw.last() != Some(&SENTINEL) {
            return Err(ClusterError::ShellClosed(self.node.clone()));
        }
        raw.pop();
        raw.retain(|b| *b != b'\r');
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }
}

impl Drop for ShellSession {
    fn drop(&mut self) {
        if self.stdin.is_some() {
            self.close();
        }
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
