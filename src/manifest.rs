//! Resource manifests and the dispatcher that runs them.
//!
//! A manifest is a TOML file with one `[[resources]]` table per declared
//! entity. Each table is tagged with a `kind`; the remaining keys are the
//! reconciler's properties in camelCase.
//!
//! ```toml
//! [[resources]]
//! kind = "AzureDevOpsProject"
//! organization = "contoso"
//! name = "platform"
//!
//! [[resources]]
//! kind = "AzureDevOpsRepository"
//! organization = "contoso"
//! project = "platform"
//! name = "infra"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::api::{ClientFactory, CredentialProvider};
use crate::config::ProviderConfig;
use crate::error::ReconcileResult;
use crate::resources::{
    ArtifactFeedProperties, ArtifactFeedReconciler, ExtensionProperties, ExtensionReconciler,
    PermissionProperties, PermissionReconciler, ProjectProperties, ProjectReconciler,
    RepositoryProperties, RepositoryReconciler, ResourceReconciler, ServiceConnectionProperties,
    ServiceConnectionReconciler, WorkItemProperties, WorkItemReconciler,
};

/// Whether a run only reads remote state or converges it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Preview,
    Apply,
}

/// One declared resource.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind")]
pub enum ResourceDeclaration {
    #[serde(rename = "AzureDevOpsProject")]
    Project(ProjectProperties),
    #[serde(rename = "AzureDevOpsRepository")]
    Repository(RepositoryProperties),
    #[serde(rename = "AzureDevOpsArtifactFeed")]
    ArtifactFeed(ArtifactFeedProperties),
    #[serde(rename = "AzureDevOpsServiceConnection")]
    ServiceConnection(ServiceConnectionProperties),
    #[serde(rename = "AzureDevOpsPermission")]
    Permission(PermissionProperties),
    #[serde(rename = "AzureDevOpsWorkItem")]
    WorkItem(WorkItemProperties),
    #[serde(rename = "AzureDevOpsExtension")]
    Extension(ExtensionProperties),
}

impl ResourceDeclaration {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Project(_) => ProjectReconciler::KIND,
            Self::Repository(_) => RepositoryReconciler::KIND,
            Self::ArtifactFeed(_) => ArtifactFeedReconciler::KIND,
            Self::ServiceConnection(_) => ServiceConnectionReconciler::KIND,
            Self::Permission(_) => PermissionReconciler::KIND,
            Self::WorkItem(_) => WorkItemReconciler::KIND,
            Self::Extension(_) => ExtensionReconciler::KIND,
        }
    }
}

/// Resources in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub resources: Vec<ResourceDeclaration>,
}

impl Manifest {
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse resource manifest")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest: {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid manifest: {}", path.display()))
    }
}

/// Result of reconciling one resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceOutcome {
    pub kind: &'static str,
    pub identifiers: serde_json::Value,
    /// Declared properties with outputs filled in.
    pub properties: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconciled_at: Option<String>,
}

/// Dispatches declarations to their reconcilers.
pub struct Provider {
    factory: Arc<dyn ClientFactory>,
    config: ProviderConfig,
}

impl Provider {
    pub fn new(factory: Arc<dyn ClientFactory>, config: ProviderConfig) -> Self {
        Self { factory, config }
    }

    /// Provider using the default credential chain.
    pub fn with_default_credentials(config: ProviderConfig) -> Self {
        Self::new(Arc::new(CredentialProvider::new()), config)
    }

    /// Reconciles one declaration.
    pub async fn run(
        &self,
        declaration: ResourceDeclaration,
        mode: Mode,
        cancel: &CancellationToken,
    ) -> ReconcileResult<ResourceOutcome> {
        let factory = self.factory.clone();
        info!(kind = declaration.kind(), ?mode, "Dispatching resource");
        match declaration {
            ResourceDeclaration::Project(p) => {
                self.invoke(ProjectReconciler::new(factory), p, mode, cancel).await
            }
            ResourceDeclaration::Repository(p) => {
                self.invoke(RepositoryReconciler::new(factory), p, mode, cancel).await
            }
            ResourceDeclaration::ArtifactFeed(p) => {
                self.invoke(ArtifactFeedReconciler::new(factory), p, mode, cancel).await
            }
            ResourceDeclaration::ServiceConnection(p) => {
                self.invoke(ServiceConnectionReconciler::new(factory), p, mode, cancel)
                    .await
            }
            ResourceDeclaration::Permission(p) => {
                self.invoke(PermissionReconciler::new(factory), p, mode, cancel).await
            }
            ResourceDeclaration::WorkItem(p) => {
                self.invoke(WorkItemReconciler::new(factory), p, mode, cancel).await
            }
            ResourceDeclaration::Extension(p) => {
                self.invoke(ExtensionReconciler::new(factory), p, mode, cancel).await
            }
        }
    }

    async fn invoke<R: ResourceReconciler>(
        &self,
        reconciler: R,
        desired: R::Properties,
        mode: Mode,
        cancel: &CancellationToken,
    ) -> ReconcileResult<ResourceOutcome> {
        let identifiers = serde_json::to_value(reconciler.identifiers(&desired))?;
        let result = match mode {
            Mode::Preview => reconciler.preview(desired, &self.config, cancel).await?,
            Mode::Apply => {
                reconciler
                    .create_or_update(desired, &self.config, cancel)
                    .await?
            }
        };
        Ok(ResourceOutcome {
            kind: R::KIND,
            identifiers,
            properties: serde_json::to_value(&result)?,
            reconciled_at: OffsetDateTime::now_utc().format(&Rfc3339).ok(),
        })
    }

    /// Runs every declaration in order, stopping at the first failure.
    ///
    /// `on_outcome` sees each successful result as soon as it is available.
    pub async fn run_manifest<F>(
        &self,
        manifest: Manifest,
        mode: Mode,
        cancel: &CancellationToken,
        mut on_outcome: F,
    ) -> Result<usize>
    where
        F: FnMut(&ResourceOutcome) -> Result<()>,
    {
        let total = manifest.resources.len();
        for (index, declaration) in manifest.resources.into_iter().enumerate() {
            let kind = declaration.kind();
            info!(resource = index + 1, total, kind, "Reconciling resource");
            let outcome = self
                .run(declaration, mode, cancel)
                .await
                .with_context(|| format!("Resource #{} ({kind}) failed", index + 1))?;
            on_outcome(&outcome)?;
        }
        Ok(total)
    }
}
