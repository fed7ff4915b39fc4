use super::Config;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "alcub-csi", version, about = "CSI driver for Alcubierre block volumes")]
pub struct Cli {
    /// Configuration file; missing files are ignored.
    #[arg(long, env = "ALCUB_CONFIG", default_value = "alcub-csi.toml", global = true)]
    pub config: PathBuf,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Provisioning, volume record reconciliation and node fencing.
    Controller(ControllerArgs),
    /// Per-node attach, mount and publish.
    Node(NodeArgs),
}

#[derive(Debug, Default, Args)]
pub struct SharedArgs {
    #[arg(long, env = "CSI_ENDPOINT")]
    pub endpoint: Option<String>,

    #[arg(long)]
    pub driver_name: Option<String>,

    #[arg(long)]
    pub metrics_addr: Option<String>,

    #[arg(long, env = "ALCUB_API_PATH")]
    pub api_path: Option<String>,

    #[arg(long, env = "ALCUB_POOL")]
    pub pool: Option<String>,
}

#[derive(Debug, Default, Args)]
pub struct ControllerArgs {
    #[command(flatten)]
    pub shared: SharedArgs,

    /// Label marking eligible nodes, `%N` is replaced by the node name.
    #[arg(long)]
    pub filter_label: Option<String>,

    #[arg(long)]
    pub ha_maintain_label: Option<String>,
}

#[derive(Debug, Default, Args)]
pub struct NodeArgs {
    #[command(flatten)]
    pub shared: SharedArgs,

    #[arg(long, env = "NODE_NAME")]
    pub node_name: Option<String>,

    #[arg(long)]
    pub storage_interface: Option<String>,
}

fn set(target: &mut String, value: &Option<String>) {
    if let Some(value) = value {
        target.clone_from(value);
    }
}

impl SharedArgs {
    pub fn apply(&self, config: &mut Config) {
        set(&mut config.csi.endpoint, &self.endpoint);
        set(&mut config.csi.driver_name, &self.driver_name);
        set(&mut config.metrics.addr, &self.metrics_addr);
        set(&mut config.backend.api_path, &self.api_path);
        set(&mut config.backend.pool, &self.pool);
    }
}

impl ControllerArgs {
    pub fn apply(&self, config: &mut Config) {
        self.shared.apply(config);
        set(&mut config.labels.eligibility, &self.filter_label);
        if self.ha_maintain_label.is_some() {
            config.labels.ha_managed.clone_from(&self.ha_maintain_label);
        }
    }
}

impl NodeArgs {
    pub fn apply(&self, config: &mut Config) {
        self.shared.apply(config);
        set(&mut config.csi.node_name, &self.node_name);
        set(&mut config.csi.storage_interface, &self.storage_interface);
    }
}
