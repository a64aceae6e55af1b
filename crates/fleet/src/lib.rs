//! Node pool provisioning with mutual-TLS bootstrap.
//!
//! A [`backend::Backend`] creates nodes on one provider (Compute Engine
//! instances or Kubernetes deployments). The [`provision::Provisioner`] fans
//! creation out across nodes and aggregates the outcome, the
//! [`authority::Authority`] issues the certificates nodes and controller use
//! to authenticate each other, and the [`remote::RemoteExecutor`] copies
//! files and runs commands on nodes with retry.
//!
//! # Example
//!
//! ```rust,ignore
//! use fleet::{Fleet, FleetConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let fleet = Fleet::connect(FleetConfig::from_env()?).await?;
//!     let result = fleet.start(3, &CancellationToken::new()).await?;
//!     for node in &result.nodes {
//!         println!("{} {:?}", node.name(), node.endpoint());
//!     }
//!     fleet.shutdown().await?;
//!     Ok(())
//! }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod authority;
pub mod backend;
pub mod config;
pub mod driver;
pub mod error;
pub mod fanout;
pub mod node;
pub mod provision;
pub mod readiness;
pub mod remote;
pub mod tail;
pub mod teardown;

pub use authority::{Authority, AuthorityDistribution};
pub use backend::Backend;
pub use config::{FleetConfig, SystemKind};
pub use driver::{system, Fleet, KEEPALIVE};
pub use error::{FleetError, Result};
pub use node::{BackendKind, Endpoint, Node, NodeState};
pub use provision::{ProvisioningRequest, ProvisioningResult, ProvisioningStatus, Provisioner};
pub use remote::{RemoteExecutor, RemoteStream, RetryPolicy};
