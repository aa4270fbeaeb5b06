//! Marketplace extension installation.
//!
//! The install call is keyed by version in the URL path, so an extension is
//! reinstalled whenever the installed version differs from the declared one.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{ResourceReconciler, connect, require};
use crate::api::{ApiFamily, ApiRequest, ClientFactory, DevOpsApi};
use crate::config::ProviderConfig;
use crate::error::{ReconcileError, ReconcileResult};

const EXTENSION_API_VERSION: &str = "7.1-preview.1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionProperties {
    pub organization: String,
    pub publisher_name: String,
    pub extension_name: String,
    /// Exact marketplace version to install.
    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher_id: Option<String>,
}

impl ExtensionProperties {
    pub fn new(
        organization: impl Into<String>,
        publisher_name: impl Into<String>,
        extension_name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            organization: organization.into(),
            publisher_name: publisher_name.into(),
            extension_name: extension_name.into(),
            version: version.into(),
            extension_id: None,
            publisher_id: None,
        }
    }

    fn validate(&self) -> ReconcileResult<()> {
        require(&self.organization, "organization")?;
        require(&self.publisher_name, "publisherName")?;
        require(&self.extension_name, "extensionName")?;
        require(&self.version, "version")
    }

    fn display_name(&self) -> String {
        format!("{}.{}", self.publisher_name, self.extension_name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionIdentifiers {
    pub organization: String,
    pub publisher_name: String,
    pub extension_name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstalledExtension {
    extension_id: String,
    publisher_id: String,
    version: Option<String>,
}

impl InstalledExtension {
    fn has_version(&self, version: &str) -> bool {
        self.version
            .as_deref()
            .is_some_and(|v| v.eq_ignore_ascii_case(version))
    }
}

pub struct ExtensionReconciler {
    factory: Arc<dyn ClientFactory>,
}

impl ExtensionReconciler {
    pub fn new(factory: Arc<dyn ClientFactory>) -> Self {
        Self { factory }
    }

    fn installed_url(
        api: &DevOpsApi,
        desired: &ExtensionProperties,
        version: Option<&str>,
    ) -> ReconcileResult<String> {
        let mut path = format!(
            "_apis/extensionmanagement/installedextensionsbyname/{}/{}",
            urlencoding::encode(&desired.publisher_name),
            urlencoding::encode(&desired.extension_name)
        );
        if let Some(version) = version {
            path.push('/');
            path.push_str(&urlencoding::encode(version));
        }
        api.url(
            ApiFamily::ExtensionManagement,
            &format!("{path}?api-version={EXTENSION_API_VERSION}"),
        )
    }

    async fn lookup(
        api: &DevOpsApi,
        desired: &ExtensionProperties,
    ) -> ReconcileResult<Option<InstalledExtension>> {
        api.lookup(
            ApiRequest::get(Self::installed_url(api, desired, None)?),
            &format!("extension '{}'", desired.display_name()),
        )
        .await
    }

    async fn install(api: &DevOpsApi, desired: &ExtensionProperties) -> ReconcileResult<()> {
        info!(
            extension = %desired.display_name(),
            version = %desired.version,
            "Installing extension"
        );
        api.execute(
            ApiRequest::post(Self::installed_url(api, desired, Some(desired.version.trim()))?),
            &format!(
                "install extension '{}' version '{}'",
                desired.display_name(),
                desired.version
            ),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ResourceReconciler for ExtensionReconciler {
    type Properties = ExtensionProperties;
    type Identifiers = ExtensionIdentifiers;

    const KIND: &'static str = "AzureDevOpsExtension";

    fn identifiers(&self, properties: &ExtensionProperties) -> ExtensionIdentifiers {
        ExtensionIdentifiers {
            organization: properties.organization.clone(),
            publisher_name: properties.publisher_name.clone(),
            extension_name: properties.extension_name.clone(),
        }
    }

    async fn preview(
        &self,
        mut desired: ExtensionProperties,
        config: &ProviderConfig,
        cancel: &CancellationToken,
    ) -> ReconcileResult<ExtensionProperties> {
        desired.validate()?;
        let api = connect(&self.factory, &desired.organization, config, cancel).await?;
        if let Some(installed) = Self::lookup(&api, &desired).await? {
            desired.extension_id = Some(installed.extension_id);
            desired.publisher_id = Some(installed.publisher_id);
        }
        Ok(desired)
    }

    async fn create_or_update(
        &self,
        mut desired: ExtensionProperties,
        config: &ProviderConfig,
        cancel: &CancellationToken,
    ) -> ReconcileResult<ExtensionProperties> {
        desired.validate()?;
        let api = connect(&self.factory, &desired.organization, config, cancel).await?;

        let installed = match Self::lookup(&api, &desired).await? {
            Some(installed) if installed.has_version(desired.version.trim()) => installed,
            _ => {
                Self::install(&api, &desired).await?;
                Self::lookup(&api, &desired)
                    .await?
                    .ok_or_else(|| ReconcileError::Consistency {
                        kind: Self::KIND,
                        name: desired.display_name(),
                    })?
            }
        };

        desired.extension_id = Some(installed.extension_id);
        desired.publisher_id = Some(installed.publisher_id);
        Ok(desired)
    }
}
