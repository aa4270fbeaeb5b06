//! Git repository reconciler.
//!
//! A freshly created project may not have its version-control dataspace yet,
//! so repository creation is retried with exponential backoff while the
//! server answers 404 or a 500 mentioning a missing dataspace.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{ResourceReconciler, connect, non_blank, require, reread_or};
use crate::api::poll::{PollOutcome, RetryPolicy, Step, poll_until};
use crate::api::{ApiFamily, ApiRequest, ApiResponse, ClientFactory, DevOpsApi, remote_error};
use crate::config::ProviderConfig;
use crate::error::{ReconcileError, ReconcileResult};

const GIT_API_VERSION: &str = "7.1-preview.1";

/// Backoff for repository creation: 1, 2, 4, 8, 16, then 30 s; 10 attempts.
pub const CREATE_RETRY_POLICY: RetryPolicy =
    RetryPolicy::exponential(Duration::from_secs(1), Duration::from_secs(30)).with_max_attempts(10);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryProperties {
    pub organization: String,
    pub project: String,
    pub name: String,
    /// Branch to make default once the repository has one, e.g. `refs/heads/main`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_branch: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_url: Option<String>,
}

impl RepositoryProperties {
    pub fn new(
        organization: impl Into<String>,
        project: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            organization: organization.into(),
            project: project.into(),
            name: name.into(),
            default_branch: None,
            repository_id: None,
            web_url: None,
            remote_url: None,
            ssh_url: None,
        }
    }

    fn apply(&mut self, remote: &RemoteRepository) {
        self.repository_id = Some(remote.id.clone());
        self.web_url = remote.web_url.clone();
        self.remote_url = remote.remote_url.clone();
        self.ssh_url = remote.ssh_url.clone();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryIdentifiers {
    pub organization: String,
    pub project: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteRepository {
    id: String,
    web_url: Option<String>,
    remote_url: Option<String>,
    ssh_url: Option<String>,
    default_branch: Option<String>,
}

/// True for responses that indicate the project is not ready for repositories yet.
fn is_provisioning_lag(response: &ApiResponse) -> bool {
    match response.status {
        404 => true,
        500 => {
            let body = response.body.to_ascii_lowercase();
            body.contains("dataspace") && (body.contains("not found") || body.contains("notfound"))
        }
        _ => false,
    }
}

fn qualified_branch(branch: &str) -> String {
    if branch.starts_with("refs/") {
        branch.to_string()
    } else {
        format!("refs/heads/{branch}")
    }
}

pub struct RepositoryReconciler {
    factory: Arc<dyn ClientFactory>,
    create_policy: RetryPolicy,
}

impl RepositoryReconciler {
    pub fn new(factory: Arc<dyn ClientFactory>) -> Self {
        Self {
            factory,
            create_policy: CREATE_RETRY_POLICY,
        }
    }

    fn repositories_url(api: &DevOpsApi, project: &str, suffix: &str) -> ReconcileResult<String> {
        api.url(
            ApiFamily::Core,
            &format!(
                "{}/_apis/git/repositories{suffix}?api-version={GIT_API_VERSION}",
                urlencoding::encode(project)
            ),
        )
    }

    async fn lookup(
        api: &DevOpsApi,
        desired: &RepositoryProperties,
    ) -> ReconcileResult<Option<RemoteRepository>> {
        let url = Self::repositories_url(
            api,
            &desired.project,
            &format!("/{}", urlencoding::encode(&desired.name)),
        )?;
        api.lookup(
            ApiRequest::get(url),
            &format!("repository '{}/{}'", desired.project, desired.name),
        )
        .await
    }

    async fn create(&self, api: &DevOpsApi, desired: &RepositoryProperties) -> ReconcileResult<()> {
        let url = Self::repositories_url(api, &desired.project, "")?;
        let request = ApiRequest::post(url).json(&serde_json::json!({ "name": desired.name }))?;
        let action = format!("create repository '{}/{}'", desired.project, desired.name);
        info!(project = %desired.project, repository = %desired.name, "Creating repository");

        let outcome = poll_until(&self.create_policy, api.cancel_token(), |attempt| {
            let request = request.clone();
            let action = action.as_str();
            async move {
                let response = api.send(request).await?;
                if response.is_success() {
                    Ok(Step::Done(()))
                } else if is_provisioning_lag(&response) {
                    warn!(attempt, status = response.status, "Project not ready for repositories yet");
                    Ok(Step::Retry(response))
                } else {
                    Err(remote_error(response, action))
                }
            }
        })
        .await?;

        match outcome {
            PollOutcome::Ready(()) => Ok(()),
            PollOutcome::Exhausted(Some(last)) => Err(remote_error(last, &action)),
            PollOutcome::Exhausted(None) => Err(ReconcileError::RemoteOperation {
                action,
                status: 0,
                reason: "no attempt was made".to_string(),
                body: String::new(),
            }),
        }
    }

    async fn update_default_branch(
        api: &DevOpsApi,
        desired: &RepositoryProperties,
        repository_id: &str,
        branch: &str,
    ) -> ReconcileResult<()> {
        let url = Self::repositories_url(
            api,
            &desired.project,
            &format!("/{}", urlencoding::encode(repository_id)),
        )?;
        info!(repository = %desired.name, branch, "Updating default branch");
        api.execute(
            ApiRequest::patch(url).json(&serde_json::json!({ "defaultBranch": branch }))?,
            &format!("set default branch of repository '{}'", desired.name),
        )
        .await?;
        Ok(())
    }

    fn validate(desired: &RepositoryProperties) -> ReconcileResult<()> {
        require(&desired.organization, "organization")?;
        require(&desired.project, "project")?;
        require(&desired.name, "name")
    }
}

#[async_trait]
impl ResourceReconciler for RepositoryReconciler {
    type Properties = RepositoryProperties;
    type Identifiers = RepositoryIdentifiers;

    const KIND: &'static str = "AzureDevOpsRepository";

    fn identifiers(&self, properties: &RepositoryProperties) -> RepositoryIdentifiers {
        RepositoryIdentifiers {
            organization: properties.organization.clone(),
            project: properties.project.clone(),
            name: properties.name.clone(),
        }
    }

    async fn preview(
        &self,
        mut desired: RepositoryProperties,
        config: &ProviderConfig,
        cancel: &CancellationToken,
    ) -> ReconcileResult<RepositoryProperties> {
        Self::validate(&desired)?;
        let api = connect(&self.factory, &desired.organization, config, cancel).await?;
        if let Some(existing) = Self::lookup(&api, &desired).await? {
            desired.apply(&existing);
        }
        Ok(desired)
    }

    async fn create_or_update(
        &self,
        mut desired: RepositoryProperties,
        config: &ProviderConfig,
        cancel: &CancellationToken,
    ) -> ReconcileResult<RepositoryProperties> {
        Self::validate(&desired)?;
        let api = connect(&self.factory, &desired.organization, config, cancel).await?;

        let mut record = match Self::lookup(&api, &desired).await? {
            Some(existing) => existing,
            None => {
                self.create(&api, &desired).await?;
                Self::lookup(&api, &desired)
                    .await?
                    .ok_or_else(|| ReconcileError::Consistency {
                        kind: Self::KIND,
                        name: format!("{}/{}", desired.project, desired.name),
                    })?
            }
        };

        // An empty repository has no default branch until the first push.
        if let (Some(wanted), Some(current)) =
            (non_blank(&desired.default_branch), record.default_branch.as_deref())
        {
            let wanted = qualified_branch(wanted);
            if !current.eq_ignore_ascii_case(&wanted) {
                Self::update_default_branch(&api, &desired, &record.id, &wanted).await?;
                let reread = Self::lookup(&api, &desired).await;
                record = reread_or(reread, record, &desired.name)?;
            }
        }

        desired.apply(&record);
        Ok(desired)
    }
}
