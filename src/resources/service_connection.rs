//! AzureRM service connection reconciler (workload identity federation).
//!
//! The desired state is validated before any network call. A connection is
//! scoped either to a subscription or to a management group, never both.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{ResourceReconciler, connect, non_blank, require};
use crate::api::{ApiFamily, ApiRequest, ClientFactory, DevOpsApi};
use crate::config::ProviderConfig;
use crate::error::{ReconcileError, ReconcileResult};

const SERVICE_ENDPOINT_API_VERSION: &str = "7.1-preview.4";
const PIPELINE_PERMISSIONS_API_VERSION: &str = "7.1-preview.1";
const AUTHORIZATION_SCHEME: &str = "WorkloadIdentityFederation";

/// Pause after creation before the new endpoint is addressed again.
pub const SETTLE_DELAY: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScopeLevel {
    Subscription,
    ManagementGroup,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConnectionProperties {
    pub organization: String,
    pub project: String,
    pub name: String,
    /// Inferred from the provided scope fields when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_level: Option<ScopeLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub management_group_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub management_group_id: Option<String>,
    pub tenant_id: String,
    /// Client id of the identity used for federation.
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub grant_all_pipelines: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_connection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization_scheme: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_identifier: Option<String>,
}

impl ServiceConnectionProperties {
    pub fn new(
        organization: impl Into<String>,
        project: impl Into<String>,
        name: impl Into<String>,
        tenant_id: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            organization: organization.into(),
            project: project.into(),
            name: name.into(),
            scope_level: None,
            subscription_id: None,
            subscription_name: None,
            management_group_name: None,
            management_group_id: None,
            tenant_id: tenant_id.into(),
            client_id: client_id.into(),
            description: None,
            grant_all_pipelines: false,
            service_connection_id: None,
            url: None,
            authorization_scheme: None,
            issuer: None,
            subject_identifier: None,
        }
    }

    /// Validates the scope fields and returns the effective scope level.
    pub fn validate(&self) -> ReconcileResult<ScopeLevel> {
        require(&self.organization, "organization")?;
        require(&self.project, "project")?;
        require(&self.name, "name")?;

        let subscription = non_blank(&self.subscription_id).is_some()
            && non_blank(&self.subscription_name).is_some();
        let management_group = non_blank(&self.management_group_name).is_some()
            || non_blank(&self.management_group_id).is_some();
        let config_error = |message: &str| Err(ReconcileError::Configuration(message.to_string()));

        if subscription && management_group {
            return config_error(
                "Provide either subscriptionId/subscriptionName or managementGroupName/managementGroupId, not both",
            );
        }
        if self.tenant_id.trim().is_empty() {
            return config_error("tenantId is required");
        }
        if self.client_id.trim().is_empty() {
            return config_error("clientId is required for workload identity federation");
        }

        match self.scope_level {
            Some(ScopeLevel::Subscription) if !subscription => {
                config_error("subscriptionId and subscriptionName are required for Subscription scope")
            }
            Some(ScopeLevel::ManagementGroup) if non_blank(&self.management_group_name).is_none() => {
                config_error("managementGroupName is required for ManagementGroup scope")
            }
            Some(level) => Ok(level),
            None if subscription => Ok(ScopeLevel::Subscription),
            None if management_group => Ok(ScopeLevel::ManagementGroup),
            None => config_error(
                "Provide subscriptionId and subscriptionName, or managementGroupName/managementGroupId",
            ),
        }
    }

    fn apply(&mut self, remote: &RemoteEndpoint) {
        self.service_connection_id = Some(remote.id.clone());
        self.url = remote.url.clone();
        let authorization = remote.authorization.as_ref();
        self.authorization_scheme = authorization.and_then(|a| a.scheme.clone());
        // Federation details are only reported once the server has issued them.
        let parameters = authorization.and_then(|a| a.parameters.as_ref());
        self.issuer = parameters.and_then(|p| p.workload_identity_federation_issuer.clone());
        self.subject_identifier =
            parameters.and_then(|p| p.workload_identity_federation_subject.clone());
    }

    fn create_body(&self, scope: ScopeLevel, project_id: &str) -> serde_json::Value {
        let data = match scope {
            ScopeLevel::Subscription => json!({
                "environment": "AzureCloud",
                "scopeLevel": "Subscription",
                "creationMode": "Manual",
                "subscriptionId": self.subscription_id,
                "subscriptionName": self.subscription_name,
            }),
            ScopeLevel::ManagementGroup => json!({
                "environment": "AzureCloud",
                "scopeLevel": "ManagementGroup",
                "creationMode": "Manual",
                "managementGroupName": self.management_group_name,
                "managementGroupId": self.management_group_id,
            }),
        };
        let description = self.description.clone().unwrap_or_default();
        json!({
            "authorization": {
                "parameters": {
                    "serviceprincipalid": self.client_id,
                    "tenantid": self.tenant_id,
                },
                "scheme": AUTHORIZATION_SCHEME,
            },
            "data": data,
            "isShared": false,
            "name": self.name,
            "owner": "library",
            "type": "AzureRM",
            "url": "https://management.azure.com/",
            "description": description,
            "serviceEndpointProjectReferences": [{
                "description": description,
                "name": self.name,
                "projectReference": { "id": project_id, "name": self.project },
            }],
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConnectionIdentifiers {
    pub organization: String,
    pub project: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct RemoteEndpoint {
    id: String,
    name: String,
    url: Option<String>,
    authorization: Option<RemoteAuthorization>,
}

#[derive(Debug, Clone, Deserialize)]
struct RemoteAuthorization {
    scheme: Option<String>,
    parameters: Option<FederationParameters>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct FederationParameters {
    workload_identity_federation_issuer: Option<String>,
    workload_identity_federation_subject: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PipelinePermissions {
    #[serde(default)]
    all_pipelines: Option<AllPipelines>,
}

#[derive(Debug, Deserialize)]
struct AllPipelines {
    #[serde(default)]
    authorized: bool,
}

#[derive(Debug, Deserialize)]
struct EndpointList {
    #[serde(default)]
    value: Vec<RemoteEndpoint>,
}

pub struct ServiceConnectionReconciler {
    factory: Arc<dyn ClientFactory>,
}

impl ServiceConnectionReconciler {
    pub fn new(factory: Arc<dyn ClientFactory>) -> Self {
        Self { factory }
    }

    fn endpoints_url(api: &DevOpsApi, project: &str, query: &str) -> ReconcileResult<String> {
        api.url(
            ApiFamily::Core,
            &format!(
                "{}/_apis/serviceendpoint/endpoints?{query}api-version={SERVICE_ENDPOINT_API_VERSION}",
                urlencoding::encode(project)
            ),
        )
    }

    async fn lookup(
        api: &DevOpsApi,
        desired: &ServiceConnectionProperties,
    ) -> ReconcileResult<Option<RemoteEndpoint>> {
        let url = Self::endpoints_url(
            api,
            &desired.project,
            &format!("endpointNames={}&", urlencoding::encode(&desired.name)),
        )?;
        let list: Option<EndpointList> = api
            .lookup(
                ApiRequest::get(url),
                &format!("service connection '{}/{}'", desired.project, desired.name),
            )
            .await?;
        Ok(list.and_then(|list| {
            list.value
                .into_iter()
                .find(|e| e.name.eq_ignore_ascii_case(&desired.name))
        }))
    }

    async fn create(
        api: &DevOpsApi,
        desired: &ServiceConnectionProperties,
        scope: ScopeLevel,
    ) -> ReconcileResult<()> {
        let project_id = api.require_project_id(&desired.project).await?;
        let body = desired.create_body(scope, &project_id);

        info!(
            project = %desired.project,
            connection = %desired.name,
            scope = ?scope,
            "Creating service connection"
        );
        api.execute(
            ApiRequest::post(Self::endpoints_url(api, &desired.project, "")?).json(&body)?,
            &format!("create service connection '{}'", desired.name),
        )
        .await?;

        api.sleep(SETTLE_DELAY).await?;
        Ok(())
    }

    fn pipeline_permissions_url(
        api: &DevOpsApi,
        desired: &ServiceConnectionProperties,
        endpoint_id: &str,
    ) -> ReconcileResult<String> {
        api.url(
            ApiFamily::Core,
            &format!(
                "{}/_apis/pipelines/pipelinePermissions/endpoint/{}?api-version={PIPELINE_PERMISSIONS_API_VERSION}",
                urlencoding::encode(&desired.project),
                urlencoding::encode(endpoint_id)
            ),
        )
    }

    /// Grants every pipeline access to the endpoint unless it already has it.
    async fn ensure_pipelines_authorized(
        api: &DevOpsApi,
        desired: &ServiceConnectionProperties,
        endpoint_id: &str,
    ) -> ReconcileResult<()> {
        let current: Option<PipelinePermissions> = api
            .lookup(
                ApiRequest::get(Self::pipeline_permissions_url(api, desired, endpoint_id)?),
                &format!("pipeline permissions of service connection '{}'", desired.name),
            )
            .await?;
        let authorized = current
            .and_then(|p| p.all_pipelines)
            .is_some_and(|all| all.authorized);
        if authorized {
            debug!(connection = %desired.name, "All pipelines already authorized");
            return Ok(());
        }
        Self::authorize_all_pipelines(api, desired, endpoint_id).await
    }

    async fn authorize_all_pipelines(
        api: &DevOpsApi,
        desired: &ServiceConnectionProperties,
        endpoint_id: &str,
    ) -> ReconcileResult<()> {
        let url = Self::pipeline_permissions_url(api, desired, endpoint_id)?;
        let body = json!({
            "allPipelines": { "authorized": true },
            "pipelines": [],
            "resource": { "type": "endpoint", "id": endpoint_id },
        });
        info!(connection = %desired.name, "Authorizing all pipelines");
        api.execute(
            ApiRequest::patch(url).json(&body)?,
            &format!("authorize pipelines for service connection '{}'", desired.name),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ResourceReconciler for ServiceConnectionReconciler {
    type Properties = ServiceConnectionProperties;
    type Identifiers = ServiceConnectionIdentifiers;

    const KIND: &'static str = "AzureDevOpsServiceConnection";

    fn identifiers(&self, properties: &ServiceConnectionProperties) -> ServiceConnectionIdentifiers {
        ServiceConnectionIdentifiers {
            organization: properties.organization.clone(),
            project: properties.project.clone(),
            name: properties.name.clone(),
        }
    }

    async fn preview(
        &self,
        mut desired: ServiceConnectionProperties,
        config: &ProviderConfig,
        cancel: &CancellationToken,
    ) -> ReconcileResult<ServiceConnectionProperties> {
        desired.scope_level = Some(desired.validate()?);
        let api = connect(&self.factory, &desired.organization, config, cancel).await?;
        if let Some(existing) = Self::lookup(&api, &desired).await? {
            desired.apply(&existing);
        }
        Ok(desired)
    }

    async fn create_or_update(
        &self,
        mut desired: ServiceConnectionProperties,
        config: &ProviderConfig,
        cancel: &CancellationToken,
    ) -> ReconcileResult<ServiceConnectionProperties> {
        let scope = desired.validate()?;
        desired.scope_level = Some(scope);
        let api = connect(&self.factory, &desired.organization, config, cancel).await?;

        let record = match Self::lookup(&api, &desired).await? {
            Some(existing) => existing,
            None => {
                Self::create(&api, &desired, scope).await?;
                Self::lookup(&api, &desired)
                    .await?
                    .ok_or_else(|| ReconcileError::Consistency {
                        kind: Self::KIND,
                        name: format!("{}/{}", desired.project, desired.name),
                    })?
            }
        };

        if desired.grant_all_pipelines {
            Self::ensure_pipelines_authorized(&api, &desired, &record.id).await?;
        }

        desired.apply(&record);
        Ok(desired)
    }
}
