//! clusternet CLI: bring an emulated topology up across servers.
//!
//! # Usage
//!
//! ```text
//! clusternet check topo.yaml
//! clusternet check topo.yaml --json
//! clusternet --config lab.yaml up topo.yaml
//! clusternet cleanup topo.yaml
//! ```

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use clusternet_core::cleanup::CleanupRegistry;
use clusternet_core::infrastructure::runner::OsSpawner;
use clusternet_core::remote::current_user;
use clusternet_core::topology::{LinkKind, Plan};
use clusternet_core::{ClusterConfig, ClusterNetwork, Topology};


/// clusternet - emulated network topologies spanning several servers
#[derive(Parser, Debug)]
#[command(name = "clusternet")]
#[command(about = "Emulated network topologies spanning several servers")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Runtime configuration file (YAML)
    #[arg(short, long, global = true, env = "CLUSTERNET_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate a topology and show how it would be placed
    Check {
        topology: PathBuf,

        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },
    /// Build and start a topology, wait for Enter, then tear it down
    Up {
        topology: PathBuf,
    },
    /// Run only the end-of-run cleanup pass for a topology's servers
    Cleanup {
        topology: PathBuf,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
}


fn main() {
    let cli = Cli::parse();
    setup_logging(cli.verbose);
    if let Err(e) = run(cli) {
        error!("{:#}", e);
        eprintln!("clusternet: {:#}", e);
        std::process::exit(1);
    }
}


/// Setup logging with the specified log level
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_writer(std::io::stderr),
        )
        .with(filter)
        .init();
}


fn run(cli: Cli) -> Result<()> {
    let config = ClusterConfig::load_or_default(cli.config.as_deref())
        .context("failed to load configuration")?;
    match cli.command {
        Commands::Check { topology, json } => {
            let topo = load_topology(&topology)?;
            let plan = topo.plan()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&plan)?);
            } else {
                print!("{}", render_plan(&plan));
            }
        }
        Commands::Up { topology } => up(&load_topology(&topology)?, config)?,
        Commands::Cleanup { topology, json } => {
            let topo = load_topology(&topology)?;
            let registry = CleanupRegistry::new(Arc::new(OsSpawner), &config, &current_user());
            registry.add_topology(&topo);
            let report = registry.cleanup();
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "cleaned {} server(s): {} command(s), {} failed",
                    report.servers.len(),
                    report.attempted,
                    report.failed
                );
            }
        }
    }
    Ok(())
}


fn load_topology(path: &Path) -> Result<Topology> {
    Topology::load(path).with_context(|| format!("failed to load topology {}", path.display()))
}


fn up(topology: &Topology, config: ClusterConfig) -> Result<()> {
    let mut net = ClusterNetwork::build(topology, config, Arc::new(OsSpawner))
        .context("failed to build network")?;
    if let Err(e) = net.start() {
        net.stop();
        net.cleanup();
        return Err(e).context("failed to start network");
    }
    info!(tunnels = net.tunnel_count(), "network is up");
    for line in net.status() {
        println!("{}", line);
    }
    println!("press Enter to tear down");
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    net.stop();
    let report = net.cleanup();
    info!(servers = report.servers.len(), failed = report.failed, "cleanup finished");
    Ok(())
}


fn render_plan(plan: &Plan) -> String {
    let mut out = String::new();
    out.push_str(&format!("servers: {}\n", plan.servers.join(", ")));
    out.push_str(&format!(
        "links: {} ({} tunnel)\n",
        plan.links.len(),
        plan.tunnel_count()
    ));
    for link in &plan.links {
        let kind = match link.kind {
            LinkKind::Pair => "pair".to_string(),
            LinkKind::Tunnel => format!("tunnel from {}", link.origin),
        };
        out.push_str(&format!(
            "  {}@{} <-> {}@{}  {}\n",
            link.node1, link.server1, link.node2, link.server2, kind
        ));
    }
    for group in &plan.switch_groups {
        out.push_str(&format!(
            "switches@{}: {}\n",
            group.server,
            group.switches.join(" ")
        ));
    }
    out
}


#[cfg(test)]
mod tests {
    use super::*;

    const TOPO: &str = r#"
hosts:
  - { name: h1, server: 10.0.0.1 }
  - { name: h2, server: 10.0.0.2 }
switches:
  - { name: s1, server: 10.0.0.1 }
links:
  - { node1: h1, node2: s1 }
  - { node1: h2, node2: s1 }
"#;

    #[test]
    fn parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["clusternet", "check", "t.yaml", "--verbose", "--json"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::Check { json: true, .. }));
    }

    #[test]
    fn parses_config_path() {
        let cli = Cli::try_parse_from(["clusternet", "--config", "lab.yaml", "up", "t.yaml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("lab.yaml")));
        assert!(matches!(cli.command, Commands::Up { .. }));
    }

    #[test]
    fn missing_topology_is_a_usage_error() {
        assert!(Cli::try_parse_from(["clusternet", "cleanup"]).is_err());
    }

    #[test]
    fn render_plan_lists_tunnels_and_groups() {
        let plan = Topology::parse(TOPO).unwrap().plan().unwrap();
        let text = render_plan(&plan);
        assert!(text.contains("servers: 10.0.0.1, 10.0.0.2"));
        assert!(text.contains("links: 2 (1 tunnel)"));
        assert!(text.contains("h1@10.0.0.1 <-> s1@10.0.0.1  pair"));
        assert!(text.contains("h2@10.0.0.2 <-> s1@10.0.0.1  tunnel from h2"));
        assert!(text.contains("switches@10.0.0.1: s1"));
    }

    #[test]
    fn plan_serializes_to_json() {
        let plan = Topology::parse(TOPO).unwrap().plan().unwrap();
        let json = serde_json::to_value(&plan).unwrap();
        assert_eq!(json["links"][1]["kind"], "tunnel");
        assert_eq!(json["switch_groups"][0]["switches"][0], "s1");
    }
}
