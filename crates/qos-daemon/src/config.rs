//! Daemon configuration
//!
//! Read from an optional file and `SLICED__`-prefixed environment variables,
//! e.g. `SLICED__API_PORT=9000` or `SLICED__ORCHESTRATOR__APPLY_ATTEMPTS=5`.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use slice_core::agent::{
    AllowList, CommandRunner, MeasurementConfig, NodeAgent, NodeAgentConfig, RecordingRunner,
    RemoteAgent, SystemRunner,
};
use slice_core::{AgentRegistry, OrchestratorConfig, Site};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Places and tracks slices, drives the node agents
    #[default]
    Controller,
    /// Enforces policies and tunnels on this host
    Node,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Controller => "controller",
            Role::Node => "node",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunnerKind {
    /// Run `tc`/`ip`/`bridge` on the host
    #[default]
    System,
    /// Record commands without running them
    DryRun,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub role: Role,

    /// Node name; on a node it must match the name the controller knows it by
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// API server port for the role's API, health and metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default)]
    pub runner: RunnerKind,

    /// Sites known to the controller
    #[serde(default)]
    pub sites: Vec<Site>,

    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    #[serde(default)]
    pub node: NodeAgentConfig,

    #[serde(default)]
    pub measurement: MeasurementConfig,

    /// Timeout of one controller-to-node request
    #[serde(default = "default_agent_timeout_ms")]
    pub agent_timeout_ms: u64,

    /// Upper bound on one `POST /v1/intents`
    #[serde(default = "default_provision_timeout_secs")]
    pub provision_timeout_secs: u64,

    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,

    #[serde(default = "default_sysfs_root")]
    pub sysfs_root: PathBuf,

    /// Port on the tunnel peer used to time TCP connects
    #[serde(default = "default_latency_port")]
    pub latency_port: u16,
}

fn default_node_name() -> String {
    std::env::var("NODE_NAME").unwrap_or_else(|_| "unknown".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_agent_timeout_ms() -> u64 {
    5_000
}

fn default_provision_timeout_secs() -> u64 {
    60
}

fn default_health_interval_secs() -> u64 {
    15
}

fn default_sysfs_root() -> PathBuf {
    PathBuf::from("/sys/class/net")
}

fn default_latency_port() -> u16 {
    22
}

impl DaemonConfig {
    /// Load configuration from an optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("SLICED")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("reading configuration")?;

        let parsed: DaemonConfig = config
            .try_deserialize()
            .context("parsing configuration")?;
        parsed.validate()?;
        Ok(parsed)
    }

    pub fn validate(&self) -> Result<()> {
        if self.role == Role::Controller && self.sites.is_empty() {
            bail!("controller role needs at least one site");
        }
        let mut ids = BTreeSet::new();
        for site in &self.sites {
            if !ids.insert(site.id.as_str()) {
                bail!("site {} listed twice", site.id);
            }
        }
        if self.role == Role::Node && self.node_name == "unknown" {
            bail!("node role needs node_name (or NODE_NAME)");
        }
        Ok(())
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_millis(self.agent_timeout_ms)
    }

    pub fn provision_timeout(&self) -> Duration {
        Duration::from_secs(self.provision_timeout_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs.max(1))
    }

    pub fn command_runner(&self) -> Arc<dyn CommandRunner> {
        let policy = Arc::new(AllowList::default());
        match self.runner {
            RunnerKind::System => Arc::new(SystemRunner::new(policy, self.node.command_timeout())),
            RunnerKind::DryRun => Arc::new(RecordingRunner::dry_run(policy)),
        }
    }

    /// One agent per site node: remote when the site names an agent URL,
    /// otherwise enforced in-process with `runner`
    pub fn build_agents(&self, runner: Arc<dyn CommandRunner>) -> Result<AgentRegistry> {
        let registry = AgentRegistry::new();
        let mut seen = BTreeSet::new();
        for site in &self.sites {
            let node = &site.node;
            if !seen.insert(node.name.clone()) {
                continue;
            }
            match &node.agent_url {
                Some(url) => {
                    let agent = RemoteAgent::new(node.name.clone(), url, self.agent_timeout())
                        .with_context(|| format!("agent for site {}", site.id))?;
                    registry.register(Arc::new(agent));
                }
                None => registry.register(Arc::new(NodeAgent::new(
                    node.name.clone(),
                    Arc::clone(&runner),
                    self.node.clone(),
                ))),
            }
        }
        Ok(registry)
    }
}
