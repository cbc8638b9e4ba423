//! Runtime configuration.
//!
//! `ClusterConfig` is loaded from a YAML file. Every field has a default, so
//! an empty file (or no file at all) yields a working configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ClusterError, Result};


#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub ssh: SshConfig,
    pub tunnel: TunnelConfig,
    pub shell: ShellConfig,
    pub switch: SwitchConfig,
    pub cleanup: CleanupConfig,
}


/// Options folded into every ssh command line.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    /// Identity file passed with `-i`.
    pub key: Option<String>,
    /// Enables connection multiplexing (`ControlMaster=auto`) when set.
    pub control_path: Option<String>,
    /// Extra `-o` options, e.g. `StrictHostKeyChecking=no`.
    pub options: Vec<String>,
}


#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Tun/tap unit used for the placeholder device (`tap<N>`, `-w N:N`).
    pub placeholder_index: u32,
    /// Single ASCII character echoed by the far end once the tunnel is up.
    pub marker: char,
    /// Give up waiting for the marker after this long. `None` blocks forever.
    pub liveness_timeout_ms: Option<u64>,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        TunnelConfig {
            placeholder_index: 9,
            marker: '@',
            liveness_timeout_ms: None,
        }
    }
}

impl TunnelConfig {
    pub fn placeholder(&self) -> String {
        format!("tap{}", self.placeholder_index)
    }

    pub fn liveness_timeout(&self) -> Option<Duration> {
        self.liveness_timeout_ms.map(Duration::from_millis)
    }
}


#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    /// The persistent shell. Must read commands from stdin.
    pub command: Vec<String>,
    /// Prefix that puts a host's shell into a fresh network namespace.
    pub namespace_wrapper: Vec<String>,
}

impl Default for ShellConfig {
    fn default() -> Self {
        ShellConfig {
            command: ["env", "PS1=", "PS2=", "bash", "--norc", "--noediting", "-s"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            namespace_wrapper: ["unshare", "--net", "--"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}


#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchConfig {
    /// Run per-server batch calls on separate threads.
    pub parallel_batches: bool,
}


#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// Commands run with sudo on every remote server at the end of a run.
    /// Empty means the built-in set for the configured placeholder.
    pub commands: Vec<String>,
}

impl CleanupConfig {
    pub fn commands_for(&self, tunnel: &TunnelConfig) -> Vec<String> {
        if !self.commands.is_empty() {
            return self.commands.clone();
        }
        // The bracketed first letter keeps the pattern from matching the
        // shell that runs pkill. Spaces become `.` so the pattern stays one
        // word through `split_command`.
        vec![
            format!("ip link delete {}", tunnel.placeholder()),
            format!(
                "pkill -f '[T]unnel=Ethernet.-w.{0}:{0}'",
                tunnel.placeholder_index
            ),
        ]
    }
}


impl ClusterConfig {
    /// Load from a YAML file.
    pub fn load(path: &Path) -> Result<ClusterConfig> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ClusterError::Config(format!("cannot read '{}': {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    /// Load from `path` if given, otherwise use defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<ClusterConfig> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(ClusterConfig::default()),
        }
    }

    pub fn parse(content: &str) -> Result<ClusterConfig> {
        // serde_yaml reads an empty document as null rather than an empty map.
        if content.trim().is_empty() {
            return Ok(ClusterConfig::default());
        }
        let config: ClusterConfig = serde_yaml::from_str(content)
            .map_err(|e| ClusterError::Config(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.tunnel.marker.is_ascii() || self.tunnel.marker.is_whitespace() {
            return Err(ClusterError::Config(format!(
                "tunnel marker {:?} must be a printable ASCII character",
                self.tunnel.marker
            )));
        }
        if self.shell.command.is_empty() {
            return Err(ClusterError::Config("shell command is empty".into()));
        }
        Ok(())
    }
}
