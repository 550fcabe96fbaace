use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};

/// pxe-auto - PXE auto-install deploy driver
#[derive(Parser)]
#[command(name = "pxe-auto")]
#[command(about = "Provision bare-metal nodes through a PXE-booted unattended installer")]
#[command(version)]
pub struct Cli {
    /// Driver configuration file (JSON). Built-in defaults when omitted.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Where a node's snapshot and deployment state live
#[derive(Args, Debug, Clone)]
pub struct NodeArgs {
    /// Node snapshot (JSON: uuid, instance_info, extra)
    #[arg(short, long)]
    pub node: PathBuf,

    /// Deployment state file; defaults to `<node>.state.json`
    #[arg(short, long)]
    pub state: Option<PathBuf>,
}

impl NodeArgs {
    pub fn state_path(&self) -> PathBuf {
        self.state
            .clone()
            .unwrap_or_else(|| default_state_path(&self.node))
    }
}

/// `node.json` -> `node.state.json`
pub fn default_state_path(node: &Path) -> PathBuf {
    node.with_extension("state.json")
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate the configuration, and a node's instance parameters if given
    Validate {
        /// Node snapshot to validate
        #[arg(short, long)]
        node: Option<PathBuf>,
    },
    /// Print the boot-config link path for a MAC address
    MacPath {
        /// Hardware address (aa:bb:cc:dd:ee:ff or aa-bb-cc-dd-ee-ff)
        mac: String,
        /// Treat the port as InfiniBand (has a client identifier)
        #[arg(long)]
        infiniband: bool,
    },
    /// Write boot artifacts, link the boot MAC and set PXE boot
    Prepare {
        #[command(flatten)]
        node: NodeArgs,
        /// Port list (JSON array of {address, extra})
        #[arg(short, long)]
        ports: PathBuf,
    },
    /// Reboot the node into the installer
    Deploy {
        #[command(flatten)]
        node: NodeArgs,
    },
    /// Remove every artifact written for the node
    CleanUp {
        #[command(flatten)]
        node: NodeArgs,
        /// Port list (JSON array of {address, extra})
        #[arg(short, long)]
        ports: PathBuf,
    },
    /// Power the node off
    TearDown {
        #[command(flatten)]
        node: NodeArgs,
    },
    /// Accept progress reports for the node until it is deployed
    Serve {
        #[command(flatten)]
        node: NodeArgs,
        /// Address the progress endpoint listens on [default: 0.0.0.0:<report_port>]
        #[arg(short, long)]
        listen: Option<String>,
    },
    /// Wait until a host accepts TCP connections
    Wait {
        /// Host name or IP address
        address: String,
        /// Port; defaults to the configured probe port
        #[arg(short, long)]
        port: Option<u16>,
        /// Give up after this many attempts
        #[arg(short, long)]
        max_attempts: Option<u32>,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
