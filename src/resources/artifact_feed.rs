//! Artifact feed reconciler.
//!
//! Feeds are either organization-scoped or project-scoped; the scope changes
//! the endpoint path. Feed endpoints live on the `feeds` host.

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{ResourceReconciler, connect, non_blank, require, reread_or};
use crate::api::{ApiFamily, ApiRequest, ClientFactory, DevOpsApi};
use crate::config::ProviderConfig;
use crate::error::{ReconcileError, ReconcileResult};

const FEEDS_API_VERSION: &str = "7.2-preview.1";

/// Feed permission role. Declared either by number (1-5) or by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedRole {
    Reader = 1,
    Contributor = 2,
    Collaborator = 3,
    Owner = 4,
    Administrator = 5,
}

impl FeedRole {
    fn from_number(n: u64) -> Option<Self> {
        match n {
            1 => Some(Self::Reader),
            2 => Some(Self::Contributor),
            3 => Some(Self::Collaborator),
            4 => Some(Self::Owner),
            5 => Some(Self::Administrator),
            _ => None,
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "reader" => Some(Self::Reader),
            "contributor" => Some(Self::Contributor),
            "collaborator" => Some(Self::Collaborator),
            "owner" => Some(Self::Owner),
            "administrator" => Some(Self::Administrator),
            _ => None,
        }
    }

    /// Name used on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reader => "reader",
            Self::Contributor => "contributor",
            Self::Collaborator => "collaborator",
            Self::Owner => "owner",
            Self::Administrator => "administrator",
        }
    }
}

impl Serialize for FeedRole {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for FeedRole {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Number(u64),
            Name(String),
        }
        let role = match Repr::deserialize(deserializer)? {
            Repr::Number(n) => Self::from_number(n),
            Repr::Name(name) => Self::from_name(&name),
        };
        role.ok_or_else(|| {
            serde::de::Error::custom(
                "feed role must be 1-5 or one of reader, contributor, collaborator, owner, administrator",
            )
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedPermission {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_descriptor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_id: Option<String>,
    pub role: FeedRole,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedProjectReference {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactFeedProperties {
    pub organization: String,
    pub name: String,
    /// Owning project; the feed is organization-scoped when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub hide_deleted_package_versions: bool,
    #[serde(default = "default_true")]
    pub upstream_enabled: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<FeedPermission>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub upstream_sources: Vec<UpstreamSource>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feed_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_reference: Option<FeedProjectReference>,
}

impl ArtifactFeedProperties {
    pub fn new(organization: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            organization: organization.into(),
            name: name.into(),
            project: None,
            description: None,
            hide_deleted_package_versions: true,
            upstream_enabled: true,
            permissions: Vec::new(),
            upstream_sources: Vec::new(),
            feed_id: None,
            url: None,
            project_reference: None,
        }
    }

    fn apply(&mut self, remote: &RemoteFeed) {
        self.feed_id = Some(remote.id.clone());
        self.url = remote.url.clone();
        self.project_reference = remote.project.clone();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactFeedIdentifiers {
    pub organization: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RemoteFeed {
    id: String,
    url: Option<String>,
    description: Option<String>,
    project: Option<FeedProjectReference>,
}

/// A permission as reported by the server; roles outside [`FeedRole`] (e.g.
/// `custom`) are kept as plain strings.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemotePermission {
    identity_descriptor: Option<String>,
    identity_id: Option<String>,
    role: Option<String>,
}

impl RemotePermission {
    fn grants(&self, wanted: &FeedPermission) -> bool {
        let same = |a: &Option<String>, b: &Option<String>| match (a, b) {
            (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
            _ => false,
        };
        let identity = same(&self.identity_descriptor, &wanted.identity_descriptor)
            || same(&self.identity_id, &wanted.identity_id);
        identity
            && self
                .role
                .as_deref()
                .is_some_and(|r| r.eq_ignore_ascii_case(wanted.role.as_str()))
    }
}

#[derive(Debug, Deserialize)]
struct PermissionList {
    #[serde(default)]
    value: Vec<RemotePermission>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateFeedBody<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    hide_deleted_package_versions: bool,
    upstream_enabled: bool,
    upstream_sources: &'a [UpstreamSource],
    #[serde(skip_serializing_if = "Option::is_none")]
    project: Option<serde_json::Value>,
}

pub struct ArtifactFeedReconciler {
    factory: Arc<dyn ClientFactory>,
}

impl ArtifactFeedReconciler {
    pub fn new(factory: Arc<dyn ClientFactory>) -> Self {
        Self { factory }
    }

    /// `{feeds}/{org}[/{project}]/_apis/packaging/feeds{suffix}?api-version=...`
    fn feeds_url(
        api: &DevOpsApi,
        desired: &ArtifactFeedProperties,
        suffix: &str,
    ) -> ReconcileResult<String> {
        let scope = match non_blank(&desired.project) {
            Some(project) => format!("{}/", urlencoding::encode(project)),
            None => String::new(),
        };
        api.url(
            ApiFamily::Feeds,
            &format!("{scope}_apis/packaging/feeds{suffix}?api-version={FEEDS_API_VERSION}"),
        )
    }

    fn describe(desired: &ArtifactFeedProperties) -> String {
        match non_blank(&desired.project) {
            Some(project) => format!("feed '{project}/{}'", desired.name),
            None => format!("feed '{}'", desired.name),
        }
    }

    async fn lookup(
        api: &DevOpsApi,
        desired: &ArtifactFeedProperties,
    ) -> ReconcileResult<Option<RemoteFeed>> {
        let url = Self::feeds_url(api, desired, &format!("/{}", urlencoding::encode(&desired.name)))?;
        api.lookup(ApiRequest::get(url), &Self::describe(desired)).await
    }

    async fn create(api: &DevOpsApi, desired: &ArtifactFeedProperties) -> ReconcileResult<()> {
        let project = match non_blank(&desired.project) {
            Some(name) => Some(serde_json::json!({ "id": api.require_project_id(name).await? })),
            None => None,
        };
        let body = CreateFeedBody {
            name: &desired.name,
            description: desired.description.as_deref(),
            hide_deleted_package_versions: desired.hide_deleted_package_versions,
            upstream_enabled: desired.upstream_enabled,
            upstream_sources: &desired.upstream_sources,
            project,
        };

        info!(feed = %desired.name, project = ?desired.project, "Creating artifact feed");
        api.execute(
            ApiRequest::post(Self::feeds_url(api, desired, "")?).json(&body)?,
            &format!("create {}", Self::describe(desired)),
        )
        .await?;
        Ok(())
    }

    async fn update_description(
        api: &DevOpsApi,
        desired: &ArtifactFeedProperties,
        feed_id: &str,
        description: &str,
    ) -> ReconcileResult<()> {
        let url = Self::feeds_url(api, desired, &format!("/{}", urlencoding::encode(feed_id)))?;
        info!(feed = %desired.name, "Updating feed description");
        api.execute(
            ApiRequest::patch(url).json(&serde_json::json!({ "description": description }))?,
            &format!("update description of {}", Self::describe(desired)),
        )
        .await?;
        Ok(())
    }

    /// Applies declared permissions that the feed does not already grant.
    async fn apply_permissions(
        api: &DevOpsApi,
        desired: &ArtifactFeedProperties,
        feed_id: &str,
    ) -> ReconcileResult<()> {
        if desired.permissions.is_empty() {
            return Ok(());
        }
        let url = Self::feeds_url(
            api,
            desired,
            &format!("/{}/permissions", urlencoding::encode(feed_id)),
        )?;
        let current = api
            .lookup::<PermissionList>(
                ApiRequest::get(url.clone()),
                &format!("permissions of {}", Self::describe(desired)),
            )
            .await?
            .map(|list| list.value)
            .unwrap_or_default();

        let missing: Vec<&FeedPermission> = desired
            .permissions
            .iter()
            .filter(|wanted| !current.iter().any(|have| have.grants(wanted)))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        info!(feed = %desired.name, count = missing.len(), "Updating feed permissions");
        api.execute(
            ApiRequest::patch(url).json(&missing)?,
            &format!("set permissions of {}", Self::describe(desired)),
        )
        .await?;
        Ok(())
    }

    fn validate(desired: &ArtifactFeedProperties) -> ReconcileResult<()> {
        require(&desired.organization, "organization")?;
        require(&desired.name, "name")?;
        if let Some(p) = desired
            .permissions
            .iter()
            .find(|p| non_blank(&p.identity_descriptor).is_none() && non_blank(&p.identity_id).is_none())
        {
            return Err(ReconcileError::Configuration(format!(
                "feed permission with role '{}' needs an identityDescriptor or identityId",
                p.role.as_str()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceReconciler for ArtifactFeedReconciler {
    type Properties = ArtifactFeedProperties;
    type Identifiers = ArtifactFeedIdentifiers;

    const KIND: &'static str = "AzureDevOpsArtifactFeed";

    fn identifiers(&self, properties: &ArtifactFeedProperties) -> ArtifactFeedIdentifiers {
        ArtifactFeedIdentifiers {
            organization: properties.organization.clone(),
            name: properties.name.clone(),
            project: properties.project.clone(),
        }
    }

    async fn preview(
        &self,
        mut desired: ArtifactFeedProperties,
        config: &ProviderConfig,
        cancel: &CancellationToken,
    ) -> ReconcileResult<ArtifactFeedProperties> {
        Self::validate(&desired)?;
        let api = connect(&self.factory, &desired.organization, config, cancel).await?;
        if let Some(existing) = Self::lookup(&api, &desired).await? {
            desired.apply(&existing);
        }
        Ok(desired)
    }

    async fn create_or_update(
        &self,
        mut desired: ArtifactFeedProperties,
        config: &ProviderConfig,
        cancel: &CancellationToken,
    ) -> ReconcileResult<ArtifactFeedProperties> {
        Self::validate(&desired)?;
        let api = connect(&self.factory, &desired.organization, config, cancel).await?;

        let record = match Self::lookup(&api, &desired).await? {
            None => {
                Self::create(&api, &desired).await?;
                Self::lookup(&api, &desired)
                    .await?
                    .ok_or_else(|| ReconcileError::Consistency {
                        kind: Self::KIND,
                        name: desired.name.clone(),
                    })?
            }
            Some(existing) => match non_blank(&desired.description) {
                Some(description) if existing.description.as_deref() != Some(description) => {
                    Self::update_description(&api, &desired, &existing.id, description).await?;
                    let reread = Self::lookup(&api, &desired).await;
                    reread_or(reread, existing, &desired.name)?
                }
                _ => existing,
            },
        };

        Self::apply_permissions(&api, &desired, &record.id).await?;
        desired.apply(&record);
        Ok(desired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mocks::MockTransport;
    use crate::api::{ApiResponse, Method};
    use crate::resources::testing::{config, factory, token};
    use serde_json::json;

    const ORG_FEED_GET: &str = "feeds.dev.azure.com/myorg/_apis/packaging/feeds/packages?";
    const PROJECT_FEED_GET: &str = "feeds.dev.azure.com/myorg/proj/_apis/packaging/feeds/packages?";

    fn remote(project: Option<serde_json::Value>, description: &str) -> ApiResponse {
        ApiResponse::json(
            200,
            json!({
                "id": "f-1",
                "name": "packages",
                "description": description,
                "url": "https://feeds.dev.azure.com/myorg/_apis/packaging/feeds/f-1",
                "project": project,
            }),
        )
    }

    /// # Organization-scoped Feed Creation
    ///
    /// Tests the create body and endpoint for a feed without a project.
    ///
    /// ## Test Scenario
    /// - Lookup 404, create succeeds, read-back finds the feed
    ///
    /// ## Expected Outcome
    /// - POST to the org feeds endpoint with default flags and no project
    #[tokio::test]
    async fn test_create_org_scoped() {
        let mock = MockTransport::new();
        mock.on(Method::Get, ORG_FEED_GET, ApiResponse::new(404, ""))
            .on(Method::Get, ORG_FEED_GET, remote(None, ""));
        mock.on(
            Method::Post,
            "feeds.dev.azure.com/myorg/_apis/packaging/feeds?",
            ApiResponse::json(201, json!({"id": "f-1"})),
        );
        let reconciler = ArtifactFeedReconciler::new(factory(&mock));

        let mut desired = ArtifactFeedProperties::new("myorg", "packages");
        desired.upstream_sources = vec![UpstreamSource {
            id: None,
            name: Some("npmjs".into()),
            location: Some("https://registry.npmjs.org/".into()),
            protocol: Some("npm".into()),
        }];
        let result = reconciler
            .create_or_update(desired, &config(), &token())
            .await
            .unwrap();

        let body = mock.calls_to(Method::Post, "/_apis/packaging/feeds?")[0].json();
        assert_eq!(
            body,
            json!({
                "name": "packages",
                "hideDeletedPackageVersions": true,
                "upstreamEnabled": true,
                "upstreamSources": [{
                    "name": "npmjs",
                    "location": "https://registry.npmjs.org/",
                    "protocol": "npm"
                }]
            })
        );
        assert_eq!(result.feed_id.as_deref(), Some("f-1"));
        assert!(result.project_reference.is_none());
    }

    #[tokio::test]
    async fn test_create_project_scoped_resolves_project() {
        let mock = MockTransport::new();
        mock.on(Method::Get, PROJECT_FEED_GET, ApiResponse::new(404, ""))
            .on(
                Method::Get,
                PROJECT_FEED_GET,
                remote(Some(json!({"id": "p-1", "name": "proj"})), ""),
            );
        mock.on(
            Method::Get,
            "dev.azure.com/myorg/_apis/projects/proj?",
            ApiResponse::json(200, json!({"id": "p-1"})),
        );
        mock.on(
            Method::Post,
            "feeds.dev.azure.com/myorg/proj/_apis/packaging/feeds?",
            ApiResponse::json(201, json!({})),
        );
        let reconciler = ArtifactFeedReconciler::new(factory(&mock));
        let mut desired = ArtifactFeedProperties::new("myorg", "packages");
        desired.project = Some("proj".into());

        let result = reconciler
            .create_or_update(desired, &config(), &token())
            .await
            .unwrap();

        let body = mock.calls_to(Method::Post, "/_apis/packaging/feeds?")[0].json();
        assert_eq!(body["project"], json!({"id": "p-1"}));
        assert_eq!(
            result.project_reference,
            Some(FeedProjectReference {
                id: "p-1".into(),
                name: Some("proj".into())
            })
        );
    }

    #[tokio::test]
    async fn test_missing_project_is_fatal_before_create() {
        let mock = MockTransport::new();
        let reconciler = ArtifactFeedReconciler::new(factory(&mock));
        let mut desired = ArtifactFeedProperties::new("myorg", "packages");
        desired.project = Some("ghost".into());

        let err = reconciler
            .create_or_update(desired, &config(), &token())
            .await
            .unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(mock.count(Method::Post, "/"), 0);
    }

    #[tokio::test]
    async fn test_missing_after_create_is_consistency_error() {
        let mock = MockTransport::new();
        mock.on(Method::Post, "/_apis/packaging/feeds?", ApiResponse::json(201, json!({})));
        let reconciler = ArtifactFeedReconciler::new(factory(&mock));

        let err = reconciler
            .create_or_update(ArtifactFeedProperties::new("myorg", "packages"), &config(), &token())
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Consistency { kind: "AzureDevOpsArtifactFeed", .. }));
    }

    /// # Permissions Converge
    ///
    /// Tests that only permissions the feed lacks are patched.
    ///
    /// ## Test Scenario
    /// - Feed exists and already grants one of two declared permissions
    /// - Reconcile twice; the second time the feed grants both
    ///
    /// ## Expected Outcome
    /// - First run patches only the missing entry, second run patches nothing
    #[tokio::test]
    async fn test_permissions_patch_missing_only() {
        let mock = MockTransport::new();
        mock.on(Method::Get, ORG_FEED_GET, remote(None, ""));
        mock.on(
            Method::Get,
            "/packaging/feeds/f-1/permissions",
            ApiResponse::json(200, json!({"value": [
                {"identityDescriptor": "Microsoft.TeamFoundation.Identity;S-1", "role": "reader"}
            ]})),
        )
        .on(
            Method::Get,
            "/packaging/feeds/f-1/permissions",
            ApiResponse::json(200, json!({"value": [
                {"identityDescriptor": "Microsoft.TeamFoundation.Identity;S-1", "role": "reader"},
                {"identityId": "id-2", "role": "administrator"},
                {"identityId": "id-3", "role": "custom"}
            ]})),
        );
        mock.on(Method::Patch, "/packaging/feeds/f-1/permissions", ApiResponse::new(200, "[]"));
        let reconciler = ArtifactFeedReconciler::new(factory(&mock));

        let mut desired = ArtifactFeedProperties::new("myorg", "packages");
        desired.permissions = serde_json::from_value(json!([
            {"identityDescriptor": "Microsoft.TeamFoundation.Identity;S-1", "role": 1},
            {"identityId": "id-2", "role": 5}
        ]))
        .unwrap();

        reconciler
            .create_or_update(desired.clone(), &config(), &token())
            .await
            .unwrap();
        reconciler
            .create_or_update(desired, &config(), &token())
            .await
            .unwrap();

        let patches = mock.calls_to(Method::Patch, "/packaging/feeds/f-1/permissions");
        assert_eq!(patches.len(), 1);
        assert_eq!(
            patches[0].json(),
            json!([{"identityId": "id-2", "role": "administrator"}])
        );
        assert_eq!(mock.count(Method::Post, "/"), 0);
    }

    #[tokio::test]
    async fn test_description_update() {
        let mock = MockTransport::new();
        mock.on(Method::Get, ORG_FEED_GET, remote(None, "old"))
            .on(Method::Get, ORG_FEED_GET, remote(None, "new"));
        mock.on(Method::Patch, "/_apis/packaging/feeds/f-1?", ApiResponse::json(200, json!({})));
        let reconciler = ArtifactFeedReconciler::new(factory(&mock));
        let mut desired = ArtifactFeedProperties::new("myorg", "packages");
        desired.description = Some("new".into());

        reconciler
            .create_or_update(desired, &config(), &token())
            .await
            .unwrap();
        let patches = mock.calls_to(Method::Patch, "/_apis/packaging/feeds/f-1?");
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].json(), json!({"description": "new"}));
    }

    #[test]
    fn test_role_parsing() {
        let role: FeedRole = serde_json::from_value(json!(3)).unwrap();
        assert_eq!(role, FeedRole::Collaborator);
        let role: FeedRole = serde_json::from_value(json!("Owner")).unwrap();
        assert_eq!(role, FeedRole::Owner);
        assert!(serde_json::from_value::<FeedRole>(json!(9)).is_err());
    }

    #[tokio::test]
    async fn test_permission_without_identity_rejected() {
        let mock = MockTransport::new();
        let reconciler = ArtifactFeedReconciler::new(factory(&mock));
        let mut desired = ArtifactFeedProperties::new("myorg", "packages");
        desired.permissions = vec![FeedPermission {
            identity_descriptor: None,
            identity_id: None,
            role: FeedRole::Reader,
        }];

        let err = reconciler
            .preview(desired, &config(), &token())
            .await
            .unwrap_err();
        assert!(err.is_configuration());
        assert!(mock.calls().is_empty());
    }
}
