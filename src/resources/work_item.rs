//! Work item reconciler.
//!
//! Work items are correlated by an `InternalId=<n>` tag rather than by the
//! server-assigned id, so lookup runs a WIQL query first and then reads the
//! matching item.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{ResourceReconciler, connect, non_blank, require, reread_or};
use crate::api::{ApiFamily, ApiRequest, ClientFactory, DevOpsApi};
use crate::config::ProviderConfig;
use crate::error::{ReconcileError, ReconcileResult};

const WIT_API_VERSION: &str = "7.1";
const INTERNAL_ID_TAG: &str = "InternalId";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItemProperties {
    pub organization: String,
    pub project: String,
    /// Correlation id stored in the item's tags. Must be positive.
    pub id: u32,
    pub title: String,
    /// Work item type, e.g. `Task` or `User Story`.
    #[serde(rename = "type")]
    pub work_item_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_item_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl WorkItemProperties {
    pub fn new(
        organization: impl Into<String>,
        project: impl Into<String>,
        id: u32,
        title: impl Into<String>,
        work_item_type: impl Into<String>,
    ) -> Self {
        Self {
            organization: organization.into(),
            project: project.into(),
            id,
            title: title.into(),
            work_item_type: work_item_type.into(),
            description: None,
            work_item_id: None,
            url: None,
        }
    }

    fn validate(&self) -> ReconcileResult<()> {
        require(&self.organization, "organization")?;
        require(&self.project, "project")?;
        require(&self.title, "title")?;
        require(&self.work_item_type, "type")?;
        if self.id == 0 {
            return Err(ReconcileError::Configuration(
                "'id' must be a positive integer".to_string(),
            ));
        }
        Ok(())
    }

    fn tag(&self) -> String {
        format!("{INTERNAL_ID_TAG}={}", self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItemIdentifiers {
    pub organization: String,
    pub project: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WiqlResult {
    #[serde(default)]
    work_items: Vec<WorkItemRef>,
}

#[derive(Debug, Deserialize)]
struct WorkItemRef {
    id: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct RemoteWorkItem {
    id: u64,
    url: Option<String>,
    #[serde(default)]
    fields: WorkItemFields,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct WorkItemFields {
    #[serde(rename = "System.Title")]
    title: Option<String>,
}

pub struct WorkItemReconciler {
    factory: Arc<dyn ClientFactory>,
}

impl WorkItemReconciler {
    pub fn new(factory: Arc<dyn ClientFactory>) -> Self {
        Self { factory }
    }

    fn wit_url(api: &DevOpsApi, project: &str, path: &str) -> ReconcileResult<String> {
        api.url(
            ApiFamily::Core,
            &format!(
                "{}/_apis/wit/{path}?api-version={WIT_API_VERSION}",
                urlencoding::encode(project)
            ),
        )
    }

    async fn lookup(
        api: &DevOpsApi,
        desired: &WorkItemProperties,
    ) -> ReconcileResult<Option<RemoteWorkItem>> {
        let query = format!(
            "SELECT [System.Id] FROM WorkItems WHERE [System.TeamProject] = @project AND [System.Tags] CONTAINS '{}'",
            desired.tag()
        );
        let what = format!("work item tagged '{}' in '{}'", desired.tag(), desired.project);
        let result: Option<WiqlResult> = api
            .lookup(
                ApiRequest::post(Self::wit_url(api, &desired.project, "wiql")?)
                    .json(&json!({ "query": query }))?,
                &what,
            )
            .await?;
        let Some(first) = result.and_then(|r| r.work_items.into_iter().next()) else {
            return Ok(None);
        };

        api.lookup(
            ApiRequest::get(Self::wit_url(
                api,
                &desired.project,
                &format!("workitems/{}", first.id),
            )?),
            &what,
        )
        .await
    }

    async fn create(api: &DevOpsApi, desired: &WorkItemProperties) -> ReconcileResult<()> {
        let mut document = vec![
            json!({"op": "add", "path": "/fields/System.Title", "value": desired.title}),
            json!({"op": "add", "path": "/fields/System.Tags", "value": desired.tag()}),
        ];
        if let Some(description) = non_blank(&desired.description) {
            document.push(
                json!({"op": "add", "path": "/fields/System.Description", "value": description}),
            );
        }

        info!(
            project = %desired.project,
            internal_id = desired.id,
            work_item_type = %desired.work_item_type,
            "Creating work item"
        );
        let url = Self::wit_url(
            api,
            &desired.project,
            &format!("workitems/${}", urlencoding::encode(desired.work_item_type.trim())),
        )?;
        api.execute(
            ApiRequest::post(url).json_patch(&document)?,
            &format!("create work item '{}' ({})", desired.title, desired.tag()),
        )
        .await?;
        Ok(())
    }

    async fn update_title(
        api: &DevOpsApi,
        desired: &WorkItemProperties,
        id: u64,
    ) -> ReconcileResult<()> {
        info!(work_item_id = id, "Updating work item title");
        let document = [json!({"op": "replace", "path": "/fields/System.Title", "value": desired.title})];
        api.execute(
            ApiRequest::patch(Self::wit_url(api, &desired.project, &format!("workitems/{id}"))?)
                .json_patch(&document)?,
            &format!("update work item {id}"),
        )
        .await?;
        Ok(())
    }
}

impl WorkItemProperties {
    fn apply(&mut self, remote: &RemoteWorkItem) {
        self.work_item_id = Some(remote.id);
        self.url = remote.url.clone();
    }
}

#[async_trait]
impl ResourceReconciler for WorkItemReconciler {
    type Properties = WorkItemProperties;
    type Identifiers = WorkItemIdentifiers;

    const KIND: &'static str = "AzureDevOpsWorkItem";

    fn identifiers(&self, properties: &WorkItemProperties) -> WorkItemIdentifiers {
        WorkItemIdentifiers {
            organization: properties.organization.clone(),
            project: properties.project.clone(),
        }
    }

    async fn preview(
        &self,
        mut desired: WorkItemProperties,
        config: &ProviderConfig,
        cancel: &CancellationToken,
    ) -> ReconcileResult<WorkItemProperties> {
        desired.validate()?;
        let api = connect(&self.factory, &desired.organization, config, cancel).await?;
        if let Some(existing) = Self::lookup(&api, &desired).await? {
            desired.apply(&existing);
        }
        Ok(desired)
    }

    async fn create_or_update(
        &self,
        mut desired: WorkItemProperties,
        config: &ProviderConfig,
        cancel: &CancellationToken,
    ) -> ReconcileResult<WorkItemProperties> {
        desired.validate()?;
        let api = connect(&self.factory, &desired.organization, config, cancel).await?;

        let record = match Self::lookup(&api, &desired).await? {
            None => {
                Self::create(&api, &desired).await?;
                Self::lookup(&api, &desired)
                    .await?
                    .ok_or_else(|| ReconcileError::Consistency {
                        kind: Self::KIND,
                        name: format!("{}/{}", desired.project, desired.tag()),
                    })?
            }
            Some(existing) if existing.fields.title.as_deref() != Some(desired.title.as_str()) => {
                Self::update_title(&api, &desired, existing.id).await?;
                reread_or(
                    Self::lookup(&api, &desired).await,
                    existing,
                    &format!("work item {}", desired.tag()),
                )?
            }
            Some(existing) => existing,
        };

        desired.apply(&record);
        Ok(desired)
    }
}
