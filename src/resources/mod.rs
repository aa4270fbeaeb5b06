//! Resource reconcilers.
//!
//! Each Azure DevOps entity kind has one reconciler implementing
//! [`ResourceReconciler`]. Reconcilers share no state; each invocation
//! acquires its own transport through the injected [`ClientFactory`].
//!
//! ## Protocol
//!
//! - `preview`: look the entity up and copy outputs onto the desired
//!   properties. Never mutates remote state.
//! - `create_or_update`: look up; create when absent and read back (a missing
//!   read-back is a consistency error); patch differing mutable fields when
//!   present and read back again (falling back to the previous record); copy
//!   outputs from the final record.

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::api::{ClientFactory, DevOpsApi};
use crate::config::ProviderConfig;
use crate::error::ReconcileResult;

pub mod artifact_feed;
pub mod extension;
pub mod permission;
pub mod project;
pub mod repository;
pub mod service_connection;
pub mod work_item;

pub use artifact_feed::{
    ArtifactFeedIdentifiers, ArtifactFeedProperties, ArtifactFeedReconciler, FeedPermission,
    FeedProjectReference, FeedRole, UpstreamSource,
};
pub use extension::{ExtensionIdentifiers, ExtensionProperties, ExtensionReconciler};
pub use permission::{PermissionIdentifiers, PermissionProperties, PermissionReconciler};
pub use project::{ProjectIdentifiers, ProjectProperties, ProjectReconciler, Visibility};
pub use repository::{RepositoryIdentifiers, RepositoryProperties, RepositoryReconciler};
pub use service_connection::{
    ScopeLevel, ServiceConnectionIdentifiers, ServiceConnectionProperties,
    ServiceConnectionReconciler,
};
pub use work_item::{WorkItemIdentifiers, WorkItemProperties, WorkItemReconciler};

/// Lookup/create/update protocol for one entity kind.
#[async_trait]
pub trait ResourceReconciler: Send + Sync {
    /// Declared properties: identifiers, desired fields and outputs.
    type Properties: Serialize + DeserializeOwned + Clone + Send + Sync;
    /// The immutable addressing tuple.
    type Identifiers: Serialize + std::fmt::Debug + PartialEq + Send;

    /// Resource type name as used in manifests.
    const KIND: &'static str;

    fn identifiers(&self, properties: &Self::Properties) -> Self::Identifiers;

    /// Copies outputs of an existing entity onto `desired` without mutating
    /// remote state.
    async fn preview(
        &self,
        desired: Self::Properties,
        config: &ProviderConfig,
        cancel: &CancellationToken,
    ) -> ReconcileResult<Self::Properties>;

    /// Converges the remote entity toward `desired` and returns it with outputs.
    async fn create_or_update(
        &self,
        desired: Self::Properties,
        config: &ProviderConfig,
        cancel: &CancellationToken,
    ) -> ReconcileResult<Self::Properties>;
}

/// Connects to the organization a reconciler invocation targets.
pub(crate) async fn connect(
    factory: &Arc<dyn ClientFactory>,
    organization: &str,
    config: &ProviderConfig,
    cancel: &CancellationToken,
) -> ReconcileResult<DevOpsApi> {
    DevOpsApi::connect(factory.as_ref(), organization, config, cancel).await
}

/// Result of the re-read that follows an update. A missing or failed read
/// falls back to the record known before the update; cancellation still
/// aborts.
pub(crate) fn reread_or<T>(
    reread: ReconcileResult<Option<T>>,
    previous: T,
    what: &str,
) -> ReconcileResult<T> {
    match reread {
        Ok(Some(record)) => Ok(record),
        Ok(None) => {
            tracing::warn!(resource = what, "Re-read after update found nothing; using previous state");
            Ok(previous)
        }
        Err(crate::error::ReconcileError::Cancelled) => Err(crate::error::ReconcileError::Cancelled),
        Err(e) => {
            tracing::warn!(resource = what, error = %e, "Re-read after update failed; using previous state");
            Ok(previous)
        }
    }
}

/// Trimmed, non-empty value of an optional string field.
pub(crate) fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Rejects an empty required field.
pub(crate) fn require(value: &str, field: &str) -> ReconcileResult<()> {
    if value.trim().is_empty() {
        Err(crate::error::ReconcileError::Configuration(format!(
            "'{field}' is required"
        )))
    } else {
        Ok(())
    }
}
