//! PXE auto-install deploy driver
//!
//! Provisions bare-metal nodes by PXE-booting an unattended OS installer:
//! renders the boot-loader config and installer answer file, links the
//! node's boot MAC to its config, follows installer progress reports and
//! confirms the installed OS answers on the network.

pub mod artifact;
pub mod cli;
pub mod collaborators;
pub mod config;
pub mod deploy;
pub mod endpoint;
pub mod error;
pub mod install_state;
pub mod mac;
pub mod node;
pub mod probe;
pub mod progress;
pub mod template;
pub mod types;
pub mod verifier;

// Re-export main types for convenience
pub use collaborators::{Collaborators, NodeLock};
pub use config::DeployConfig;
pub use deploy::{PreparedArtifacts, ProgressAction, PxeAutoDeploy, VerifyRequest};
pub use error::{ProvisionError, Result};
pub use install_state::{DeploymentContext, DeploymentPhase, DeploymentTransitionError};
pub use mac::MacAddress;
pub use node::{Node, Port};
pub use progress::ProgressReport;
