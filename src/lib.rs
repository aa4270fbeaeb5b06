//! # Azure DevOps Reconciler
//!
//! Declarative management of Azure DevOps entities. Each supported kind has a
//! reconciler that looks the entity up, creates it when absent, patches
//! differing mutable fields when present, and reports outputs.
//!
//! Supported kinds: projects, git repositories, artifact feeds, AzureRM
//! service connections, project role memberships, work items and marketplace
//! extensions.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use azdo_reconciler::{ProviderConfig, ResourceReconciler, api::CredentialProvider};
//! use azdo_reconciler::resources::{RepositoryProperties, RepositoryReconciler};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let reconciler = RepositoryReconciler::new(Arc::new(CredentialProvider::new()));
//! let desired = RepositoryProperties::new("contoso", "platform", "infra");
//!
//! let config = ProviderConfig::with_access_token("my-pat");
//! let result = reconciler
//!     .create_or_update(desired, &config, &CancellationToken::new())
//!     .await?;
//! println!("repository id: {:?}", result.repository_id);
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod manifest;
pub mod resources;

pub use config::{LookupPolicy, ProviderConfig};
pub use error::{ReconcileError, ReconcileResult};
pub use manifest::{Manifest, Mode, Provider, ResourceDeclaration, ResourceOutcome};
pub use resources::ResourceReconciler;

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
