//! Azure DevOps project reconciler.
//!
//! Project creation is asynchronous: the create call returns an operation
//! that is polled to completion, after which the project itself is polled
//! until its state reaches `wellFormed`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{ResourceReconciler, connect, non_blank, require, reread_or};
use crate::api::poll::{self, RetryPolicy, SettleOutcome, Step};
use crate::api::{ApiFamily, ApiRequest, ClientFactory, DevOpsApi, Lookup, PROJECTS_API_VERSION};
use crate::config::ProviderConfig;
use crate::error::{ReconcileError, ReconcileResult};

/// Template used when the requested process cannot be resolved (Agile).
pub const DEFAULT_PROCESS_TEMPLATE_ID: &str = "adcc42ab-9882-485e-a3ed-7678f01f66bc";
pub const DEFAULT_PROCESS_NAME: &str = "Agile";
pub const DEFAULT_SOURCE_CONTROL_TYPE: &str = "Git";
const PROCESSES_API_VERSION: &str = "7.1-preview.2";
const WELL_FORMED: &str = "wellFormed";

/// How long to wait for a new project to become `wellFormed`.
pub const SETTLE_POLICY: RetryPolicy =
    RetryPolicy::fixed(Duration::from_secs(2)).with_timeout(Duration::from_secs(300));

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    #[serde(alias = "Private")]
    Private,
    #[serde(alias = "Public")]
    Public,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectProperties {
    pub organization: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<Visibility>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_control_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl ProjectProperties {
    pub fn new(organization: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            organization: organization.into(),
            name: name.into(),
            description: None,
            visibility: None,
            process_name: None,
            source_control_type: None,
            project_id: None,
            state: None,
            url: None,
        }
    }

    /// Fills unset desired fields with their defaults.
    fn apply_defaults(&mut self) {
        self.visibility.get_or_insert_default();
        if non_blank(&self.process_name).is_none() {
            self.process_name = Some(DEFAULT_PROCESS_NAME.to_string());
        }
        if non_blank(&self.source_control_type).is_none() {
            self.source_control_type = Some(DEFAULT_SOURCE_CONTROL_TYPE.to_string());
        }
    }

    fn apply(&mut self, remote: &RemoteProject) {
        self.project_id = Some(remote.id.clone());
        self.state = remote.state.clone();
        self.url = remote.url.clone();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectIdentifiers {
    pub organization: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct RemoteProject {
    id: String,
    state: Option<String>,
    description: Option<String>,
    url: Option<String>,
}

impl RemoteProject {
    fn is_well_formed(&self) -> bool {
        self.state
            .as_deref()
            .is_some_and(|s| s.eq_ignore_ascii_case(WELL_FORMED))
    }
}

#[derive(Debug, Deserialize)]
struct ProcessList {
    #[serde(default)]
    value: Vec<Process>,
}

#[derive(Debug, Deserialize)]
struct Process {
    id: String,
    name: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateProjectBody<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    visibility: Visibility,
    capabilities: serde_json::Value,
}

pub struct ProjectReconciler {
    factory: Arc<dyn ClientFactory>,
}

impl ProjectReconciler {
    pub fn new(factory: Arc<dyn ClientFactory>) -> Self {
        Self { factory }
    }

    fn project_url(api: &DevOpsApi, name_or_id: &str) -> ReconcileResult<String> {
        api.url(
            ApiFamily::Core,
            &format!(
                "_apis/projects/{}?api-version={PROJECTS_API_VERSION}",
                urlencoding::encode(name_or_id)
            ),
        )
    }

    async fn lookup(api: &DevOpsApi, name: &str) -> ReconcileResult<Option<RemoteProject>> {
        api.lookup(
            ApiRequest::get(Self::project_url(api, name)?),
            &format!("project '{name}'"),
        )
        .await
    }

    /// Resolves a process name to its template id, falling back to Agile's.
    async fn resolve_process_template(api: &DevOpsApi, process_name: &str) -> ReconcileResult<String> {
        let url = api.url(
            ApiFamily::Core,
            &format!("_apis/process/processes?api-version={PROCESSES_API_VERSION}"),
        )?;
        let found = match api.try_lookup::<ProcessList>(ApiRequest::get(url)).await? {
            Lookup::Found(list) => list
                .value
                .into_iter()
                .find(|p| p.name.eq_ignore_ascii_case(process_name))
                .map(|p| p.id),
            other => {
                debug!(outcome = ?other, "Process list unavailable");
                None
            }
        };
        Ok(found.unwrap_or_else(|| {
            debug!(process_name, "Using default process template");
            DEFAULT_PROCESS_TEMPLATE_ID.to_string()
        }))
    }

    async fn create(api: &DevOpsApi, desired: &ProjectProperties) -> ReconcileResult<()> {
        let process_name = non_blank(&desired.process_name).unwrap_or(DEFAULT_PROCESS_NAME);
        let template_id = Self::resolve_process_template(api, process_name).await?;
        let body = CreateProjectBody {
            name: &desired.name,
            description: desired.description.as_deref(),
            visibility: desired.visibility.unwrap_or_default(),
            capabilities: serde_json::json!({
                "versioncontrol": {
                    "sourceControlType": non_blank(&desired.source_control_type)
                        .unwrap_or(DEFAULT_SOURCE_CONTROL_TYPE)
                },
                "processTemplate": { "templateTypeId": template_id }
            }),
        };

        let url = api.url(
            ApiFamily::Core,
            &format!("_apis/projects?api-version={PROJECTS_API_VERSION}"),
        )?;
        info!(project = %desired.name, "Creating project");
        let response = api
            .execute(
                ApiRequest::post(url).json(&body)?,
                &format!("create project '{}'", desired.name),
            )
            .await?;

        if let Some(operation_id) = poll::operation_id(&response) {
            poll::wait_for_operation(api, &operation_id).await?;
        }

        let settle_url = Self::project_url(api, &desired.name)?;
        let outcome = poll::wait_for_state(
            api,
            &format!("project '{}'", desired.name),
            &SETTLE_POLICY,
            |_| {
                let url = settle_url.clone();
                async move {
                    Ok(match api.try_lookup::<RemoteProject>(ApiRequest::get(url)).await? {
                        Lookup::Found(p) if p.is_well_formed() => Step::Done(()),
                        Lookup::Found(p) => Step::Retry(p.state.unwrap_or_default()),
                        other => Step::Retry(format!("{other:?}")),
                    })
                }
            },
        )
        .await?;
        if outcome == SettleOutcome::TimedOut {
            debug!(project = %desired.name, "Proceeding with a project that is not yet well formed");
        }
        Ok(())
    }

    async fn update_description(
        api: &DevOpsApi,
        project_id: &str,
        name: &str,
        description: &str,
    ) -> ReconcileResult<()> {
        info!(project = %name, "Updating project description");
        let response = api
            .execute(
                ApiRequest::patch(Self::project_url(api, project_id)?)
                    .json(&serde_json::json!({ "description": description }))?,
                &format!("update description of project '{name}'"),
            )
            .await?;
        if let Some(operation_id) = poll::operation_id(&response) {
            poll::wait_for_operation(api, &operation_id).await?;
        }
        Ok(())
    }

    fn validate(desired: &ProjectProperties) -> ReconcileResult<()> {
        require(&desired.organization, "organization")?;
        require(&desired.name, "name")
    }
}

#[async_trait]
impl ResourceReconciler for ProjectReconciler {
    type Properties = ProjectProperties;
    type Identifiers = ProjectIdentifiers;

    const KIND: &'static str = "AzureDevOpsProject";

    fn identifiers(&self, properties: &ProjectProperties) -> ProjectIdentifiers {
        ProjectIdentifiers {
            organization: properties.organization.clone(),
            name: properties.name.clone(),
        }
    }

    async fn preview(
        &self,
        mut desired: ProjectProperties,
        config: &ProviderConfig,
        cancel: &CancellationToken,
    ) -> ReconcileResult<ProjectProperties> {
        Self::validate(&desired)?;
        desired.apply_defaults();
        let api = connect(&self.factory, &desired.organization, config, cancel).await?;
        if let Some(existing) = Self::lookup(&api, &desired.name).await? {
            desired.apply(&existing);
        }
        Ok(desired)
    }

    async fn create_or_update(
        &self,
        mut desired: ProjectProperties,
        config: &ProviderConfig,
        cancel: &CancellationToken,
    ) -> ReconcileResult<ProjectProperties> {
        Self::validate(&desired)?;
        desired.apply_defaults();
        let api = connect(&self.factory, &desired.organization, config, cancel).await?;

        let record = match Self::lookup(&api, &desired.name).await? {
            None => {
                Self::create(&api, &desired).await?;
                Self::lookup(&api, &desired.name)
                    .await?
                    .ok_or_else(|| ReconcileError::Consistency {
                        kind: Self::KIND,
                        name: desired.name.clone(),
                    })?
            }
            Some(existing) => match non_blank(&desired.description) {
                Some(description) if existing.description.as_deref() != Some(description) => {
                    Self::update_description(&api, &existing.id, &desired.name, description)
                        .await?;
                    let reread = Self::lookup(&api, &desired.name).await;
                    reread_or(reread, existing, &desired.name)?
                }
                _ => existing,
            },
        };

        desired.apply(&record);
        Ok(desired)
    }
}
