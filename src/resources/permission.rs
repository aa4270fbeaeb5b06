//! Project role membership for an Entra ID (AAD) group.
//!
//! The AAD group is imported into the organization's Graph when missing, the
//! project security group is located by role name, and membership is added
//! when absent. Preview resolves what it can and changes nothing.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{ResourceReconciler, connect, require};
use crate::api::graph::{GRAPH_API_VERSION, GraphSubject, find_first_matching};
use crate::api::{ApiFamily, ApiRequest, ClientFactory, DevOpsApi, parse_body};
use crate::config::ProviderConfig;
use crate::error::{ReconcileError, ReconcileResult};

/// How many project group names a missing-role error lists.
const MAX_LISTED_GROUPS: usize = 8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionProperties {
    pub organization: String,
    pub project: String,
    /// Object id (GUID) of the Entra ID group.
    pub group_object_id: String,
    /// Project group name, built-in (Readers, Contributors, ...) or custom.
    pub role: String,

    #[serde(default)]
    pub assigned: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_descriptor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_group_descriptor: Option<String>,
}

impl PermissionProperties {
    pub fn new(
        organization: impl Into<String>,
        project: impl Into<String>,
        group_object_id: impl Into<String>,
        role: impl Into<String>,
    ) -> Self {
        Self {
            organization: organization.into(),
            project: project.into(),
            group_object_id: group_object_id.into(),
            role: role.into(),
            assigned: false,
            group_descriptor: None,
            project_group_descriptor: None,
        }
    }

    pub fn validate(&self) -> ReconcileResult<()> {
        require(&self.organization, "organization")?;
        require(&self.project, "project")?;
        require(&self.role, "role")?;
        if uuid::Uuid::parse_str(self.group_object_id.trim()).is_err() {
            return Err(ReconcileError::Configuration(format!(
                "groupObjectId '{}' is not a valid GUID for an Entra ID group",
                self.group_object_id
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionIdentifiers {
    pub organization: String,
    pub project: String,
}

#[derive(Debug, Deserialize)]
struct DescriptorResponse {
    value: Option<String>,
}

fn is_aad_group(subject: &GraphSubject) -> bool {
    let eq = |value: &Option<String>, expected: &str| {
        value
            .as_deref()
            .is_some_and(|v| v.eq_ignore_ascii_case(expected))
    };
    eq(&subject.origin, "aad") && eq(&subject.subject_kind, "group")
}

fn is_project_scoped(group: &GraphSubject) -> bool {
    group
        .domain
        .as_deref()
        .is_some_and(|d| d.to_ascii_lowercase().contains("classification/teamproject"))
}

/// Display name first, then the project-qualified principal name, then any
/// principal name ending in `\role`.
fn matches_role(group: &GraphSubject, role: &str, project: &str) -> bool {
    if group.descriptor.as_deref().is_none_or(|d| d.trim().is_empty()) {
        return false;
    }
    if group
        .display_name
        .as_deref()
        .is_some_and(|n| n.trim().eq_ignore_ascii_case(role))
    {
        return true;
    }
    let Some(principal) = group.principal_name.as_deref() else {
        return false;
    };
    let principal = principal.to_ascii_lowercase();
    let role = role.to_ascii_lowercase();
    principal == format!("[{}]\\{role}", project.to_ascii_lowercase())
        || principal.ends_with(&format!("\\{role}"))
}

fn descriptor_of(subject: GraphSubject, context: &str) -> ReconcileResult<String> {
    subject
        .descriptor
        .filter(|d| !d.trim().is_empty())
        .ok_or_else(|| ReconcileError::Parse {
            context: context.to_string(),
            message: "subject has no descriptor".to_string(),
        })
}

pub struct PermissionReconciler {
    factory: Arc<dyn ClientFactory>,
}

impl PermissionReconciler {
    pub fn new(factory: Arc<dyn ClientFactory>) -> Self {
        Self { factory }
    }

    fn graph_url(api: &DevOpsApi, path_and_query: &str) -> ReconcileResult<String> {
        let separator = if path_and_query.contains('?') { '&' } else { '?' };
        api.url(
            ApiFamily::Graph,
            &format!("_apis/graph/{path_and_query}{separator}api-version={GRAPH_API_VERSION}"),
        )
    }

    async fn find_aad_group(api: &DevOpsApi, object_id: &str) -> ReconcileResult<Option<String>> {
        let url = Self::graph_url(api, "groups?subjectTypes=aadgp")?;
        let found = find_first_matching(api, &url, |subject| {
            is_aad_group(subject)
                && subject
                    .origin_id
                    .as_deref()
                    .is_some_and(|id| id.eq_ignore_ascii_case(object_id))
        })
        .await?;
        found
            .map(|subject| descriptor_of(subject, "AAD group listing"))
            .transpose()
    }

    async fn import_aad_group(api: &DevOpsApi, object_id: &str) -> ReconcileResult<String> {
        info!(group = object_id, "Importing Entra ID group into Azure DevOps Graph");
        let context = format!("import of Entra ID group '{object_id}'");
        let response = api
            .execute(
                ApiRequest::post(Self::graph_url(api, "groups")?)
                    .json(&serde_json::json!({ "originId": object_id }))?,
                &format!("import Entra ID group '{object_id}' into Azure DevOps Graph"),
            )
            .await?;
        let subject: GraphSubject = parse_body(&response, &context)?;
        if !is_aad_group(&subject) {
            return Err(ReconcileError::Parse {
                context,
                message: "returned a non-Entra or non-group subject".to_string(),
            });
        }
        descriptor_of(subject, &context)
    }

    async fn project_descriptor(api: &DevOpsApi, project_id: &str) -> ReconcileResult<String> {
        let url = Self::graph_url(api, &format!("descriptors/{}", urlencoding::encode(project_id)))?;
        let context = format!("graph descriptor of project '{project_id}'");
        let response = api
            .execute(ApiRequest::get(url), &format!("resolve {context}"))
            .await?;
        let descriptor: DescriptorResponse = parse_body(&response, &context)?;
        descriptor
            .value
            .filter(|v| !v.trim().is_empty())
            .ok_or(ReconcileError::Parse {
                context,
                message: "response is missing 'value'".to_string(),
            })
    }

    async fn find_role_group(
        api: &DevOpsApi,
        scope_descriptor: &str,
        project: &str,
        role: &str,
    ) -> ReconcileResult<String> {
        let url = Self::graph_url(
            api,
            &format!("groups?scopeDescriptor={}", urlencoding::encode(scope_descriptor)),
        )?;
        let mut seen: Vec<String> = Vec::with_capacity(MAX_LISTED_GROUPS);
        let found = find_first_matching(api, &url, |group| {
            if !is_project_scoped(group) {
                return false;
            }
            if seen.len() < MAX_LISTED_GROUPS {
                if let Some(name) = group.display_name.as_deref().filter(|n| !n.trim().is_empty()) {
                    seen.push(name.to_string());
                }
            }
            matches_role(group, role, project)
        })
        .await?;

        match found {
            Some(group) => descriptor_of(group, "project group listing"),
            None => {
                let available = if seen.is_empty() {
                    "none".to_string()
                } else {
                    seen.join(", ")
                };
                Err(ReconcileError::Configuration(format!(
                    "Role '{role}' does not exist in project '{project}'. Available groups: {available}"
                )))
            }
        }
    }

    fn membership_url(api: &DevOpsApi, member: &str, container: &str) -> ReconcileResult<String> {
        Self::graph_url(
            api,
            &format!(
                "memberships/{}/{}",
                urlencoding::encode(member),
                urlencoding::encode(container)
            ),
        )
    }

    async fn is_member(api: &DevOpsApi, member: &str, container: &str) -> ReconcileResult<bool> {
        let membership: Option<serde_json::Value> = api
            .lookup(
                ApiRequest::get(Self::membership_url(api, member, container)?),
                &format!("membership of '{member}' in '{container}'"),
            )
            .await?;
        Ok(membership.is_some())
    }

    async fn add_member(api: &DevOpsApi, member: &str, container: &str) -> ReconcileResult<()> {
        info!(member, container, "Adding group membership");
        api.execute(
            ApiRequest::put(Self::membership_url(api, member, container)?)
                .json(&serde_json::json!({}))?,
            "add group membership",
        )
        .await?;
        Ok(())
    }

    /// Resolves descriptors and membership; `apply` imports and adds when missing.
    async fn reconcile(
        &self,
        mut desired: PermissionProperties,
        config: &ProviderConfig,
        cancel: &CancellationToken,
        apply: bool,
    ) -> ReconcileResult<PermissionProperties> {
        desired.validate()?;
        let api = connect(&self.factory, &desired.organization, config, cancel).await?;
        let object_id = desired.group_object_id.trim().to_string();
        let role = desired.role.trim().to_string();

        let project_id = api.require_project_id(&desired.project).await?;

        let group_descriptor = match Self::find_aad_group(&api, &object_id).await? {
            Some(descriptor) => Some(descriptor),
            None if apply => Some(Self::import_aad_group(&api, &object_id).await?),
            None => {
                debug!(group = %object_id, "Entra ID group not imported yet");
                None
            }
        };

        let scope = Self::project_descriptor(&api, &project_id).await?;
        let role_group = Self::find_role_group(&api, &scope, &desired.project, &role).await?;

        let mut assigned = match &group_descriptor {
            Some(member) => Self::is_member(&api, member, &role_group).await?,
            None => false,
        };

        if apply && !assigned {
            if let Some(member) = &group_descriptor {
                Self::add_member(&api, member, &role_group).await?;
                assigned = Self::is_member(&api, member, &role_group).await?;
                if !assigned {
                    return Err(ReconcileError::Consistency {
                        kind: Self::KIND,
                        name: format!("{object_id} in {}\\{role}", desired.project),
                    });
                }
            }
        }

        desired.assigned = assigned;
        desired.group_descriptor = group_descriptor;
        desired.project_group_descriptor = Some(role_group);
        Ok(desired)
    }
}

#[async_trait]
impl ResourceReconciler for PermissionReconciler {
    type Properties = PermissionProperties;
    type Identifiers = PermissionIdentifiers;

    const KIND: &'static str = "AzureDevOpsPermission";

    fn identifiers(&self, properties: &PermissionProperties) -> PermissionIdentifiers {
        PermissionIdentifiers {
            organization: properties.organization.clone(),
            project: properties.project.clone(),
        }
    }

    async fn preview(
        &self,
        desired: PermissionProperties,
        config: &ProviderConfig,
        cancel: &CancellationToken,
    ) -> ReconcileResult<PermissionProperties> {
        self.reconcile(desired, config, cancel, false).await
    }

    async fn create_or_update(
        &self,
        desired: PermissionProperties,
        config: &ProviderConfig,
        cancel: &CancellationToken,
    ) -> ReconcileResult<PermissionProperties> {
        self.reconcile(desired, config, cancel, true).await
    }
}
