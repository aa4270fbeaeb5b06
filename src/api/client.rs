//! Per-invocation API capability shared by every reconciler.
//!
//! [`DevOpsApi`] bundles the authenticated transport, the organization
//! reference, the lookup policy and the cancellation token of one
//! Preview/CreateOrUpdate invocation. Reconcilers receive it instead of
//! building URLs or clients themselves.

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::credential::CredentialProvider;
use super::org_url::{self, ApiFamily, OrgEndpoint};
use super::transport::{ApiRequest, ApiResponse, HttpTransport};
use crate::config::{LookupPolicy, ProviderConfig};
use crate::error::{ReconcileError, ReconcileResult};

/// API version for the core projects endpoint.
pub const PROJECTS_API_VERSION: &str = "7.1-preview.4";

/// Produces an authenticated transport for an invocation.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn transport(&self, config: &ProviderConfig) -> ReconcileResult<Arc<dyn HttpTransport>>;
}

#[async_trait]
impl ClientFactory for CredentialProvider {
    async fn transport(&self, config: &ProviderConfig) -> ReconcileResult<Arc<dyn HttpTransport>> {
        self.acquire_client(config).await
    }
}

/// Classified result of a lookup call.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<T> {
    Found(T),
    /// The server answered 404.
    NotFound,
    /// Any other non-success status, a transport failure or an unparsable body.
    TransientError(String),
    /// The server answered 401 or 403.
    AuthError(u16),
}

impl<T: DeserializeOwned> Lookup<T> {
    /// Classifies a lookup response.
    pub fn classify(response: &ApiResponse) -> Self {
        match response.status {
            404 => Self::NotFound,
            401 | 403 => Self::AuthError(response.status),
            _ if !response.is_success() => {
                Self::TransientError(format!("{} {}", response.status, response.reason))
            }
            _ => match response.parse::<T>() {
                Ok(record) => Self::Found(record),
                Err(e) => Self::TransientError(format!("unexpected response body: {e}")),
            },
        }
    }
}

impl<T> Lookup<T> {
    /// Applies the lookup policy.
    ///
    /// `Ok(None)` means "absent, may be created". Under [`LookupPolicy::Strict`]
    /// only a 404 is absent; under [`LookupPolicy::Lenient`] every failure is.
    pub fn into_policy(self, policy: LookupPolicy, resource: &str) -> ReconcileResult<Option<T>> {
        match (self, policy) {
            (Self::Found(record), _) => Ok(Some(record)),
            (Self::NotFound, _) => Ok(None),
            (Self::AuthError(status), LookupPolicy::Strict) => {
                Err(ReconcileError::LookupUnauthorized {
                    resource: resource.to_string(),
                    status,
                })
            }
            (Self::TransientError(message), LookupPolicy::Strict) => {
                Err(ReconcileError::LookupTransient {
                    resource: resource.to_string(),
                    message,
                })
            }
            (Self::AuthError(status), LookupPolicy::Lenient) => {
                warn!(resource, status, "Lookup rejected; treating as absent");
                Ok(None)
            }
            (Self::TransientError(message), LookupPolicy::Lenient) => {
                warn!(resource, %message, "Lookup failed; treating as absent");
                Ok(None)
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProjectRef {
    id: String,
}

/// Capability object handed to reconcilers for one invocation.
#[derive(Clone)]
pub struct DevOpsApi {
    transport: Arc<dyn HttpTransport>,
    organization: String,
    policy: LookupPolicy,
    cancel: CancellationToken,
}

impl DevOpsApi {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        organization: impl Into<String>,
        policy: LookupPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            organization: organization.into(),
            policy,
            cancel,
        }
    }

    /// Validates the organization reference, then acquires a transport.
    ///
    /// The reference is checked first so that a malformed organization never
    /// triggers credential acquisition.
    pub async fn connect(
        factory: &dyn ClientFactory,
        organization: &str,
        config: &ProviderConfig,
        cancel: &CancellationToken,
    ) -> ReconcileResult<Self> {
        org_url::resolve(organization, ApiFamily::Core)?;
        if cancel.is_cancelled() {
            return Err(ReconcileError::Cancelled);
        }
        let transport = factory.transport(config).await?;
        Ok(Self::new(
            transport,
            organization,
            config.lookup_policy(),
            cancel.clone(),
        ))
    }

    pub fn endpoint(&self, family: ApiFamily) -> ReconcileResult<OrgEndpoint> {
        org_url::resolve(&self.organization, family)
    }

    /// Organization slug, e.g. for messages.
    pub fn organization(&self) -> ReconcileResult<String> {
        Ok(self.endpoint(ApiFamily::Core)?.organization)
    }

    /// Builds `{base}/{org}/{path}` for the given family.
    pub fn url(&self, family: ApiFamily, path: &str) -> ReconcileResult<String> {
        let endpoint = self.endpoint(family)?;
        Ok(format!(
            "{}/{}",
            endpoint.org_url(),
            path.trim_start_matches('/')
        ))
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Sends a request, aborting with [`ReconcileError::Cancelled`] when the
    /// invocation is cancelled.
    pub async fn send(&self, request: ApiRequest) -> ReconcileResult<ApiResponse> {
        debug!(method = %request.method, url = %request.url, "Sending request");
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ReconcileError::Cancelled),
            response = self.transport.send(request) => Ok(response?),
        }
    }

    /// Sends a lookup request and classifies the outcome.
    ///
    /// Only cancellation is returned as an error.
    pub async fn try_lookup<T: DeserializeOwned>(
        &self,
        request: ApiRequest,
    ) -> ReconcileResult<Lookup<T>> {
        match self.send(request).await {
            Ok(response) => Ok(Lookup::classify(&response)),
            Err(ReconcileError::Transport(e)) => Ok(Lookup::TransientError(e.to_string())),
            Err(e) => Err(e),
        }
    }

    /// Looks up a record and applies the configured lookup policy.
    pub async fn lookup<T: DeserializeOwned>(
        &self,
        request: ApiRequest,
        resource: &str,
    ) -> ReconcileResult<Option<T>> {
        self.try_lookup(request)
            .await?
            .into_policy(self.policy, resource)
    }

    /// Sends a mutating request; a non-success status is a
    /// [`ReconcileError::RemoteOperation`] carrying the body verbatim.
    pub async fn execute(&self, request: ApiRequest, action: &str) -> ReconcileResult<ApiResponse> {
        let response = self.send(request).await?;
        ensure_success(response, action)
    }

    /// Resolves a project name to its id.
    pub async fn project_id(&self, project: &str) -> ReconcileResult<Option<String>> {
        let url = self.url(
            ApiFamily::Core,
            &format!(
                "_apis/projects/{}?api-version={PROJECTS_API_VERSION}",
                urlencoding::encode(project)
            ),
        )?;
        let record: Option<ProjectRef> = self
            .lookup(ApiRequest::get(url), &format!("project '{project}'"))
            .await?;
        Ok(record.map(|p| p.id))
    }

    /// Like [`Self::project_id`], but a missing project is a configuration error.
    pub async fn require_project_id(&self, project: &str) -> ReconcileResult<String> {
        match self.project_id(project).await? {
            Some(id) => Ok(id),
            None => Err(ReconcileError::Configuration(format!(
                "Project '{project}' was not found in organization '{}'",
                self.organization()?
            ))),
        }
    }

    /// Cancellable delay.
    pub async fn sleep(&self, duration: Duration) -> ReconcileResult<()> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ReconcileError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

/// Converts a non-success response into a [`ReconcileError::RemoteOperation`].
pub fn ensure_success(response: ApiResponse, action: &str) -> ReconcileResult<ApiResponse> {
    if response.is_success() {
        Ok(response)
    } else {
        Err(remote_error(response, action))
    }
}

pub fn remote_error(response: ApiResponse, action: &str) -> ReconcileError {
    ReconcileError::RemoteOperation {
        action: action.to_string(),
        status: response.status,
        reason: response.reason,
        body: response.body,
    }
}

/// Parses a response body, attributing failures to `context`.
pub fn parse_body<T: DeserializeOwned>(response: &ApiResponse, context: &str) -> ReconcileResult<T> {
    response.parse().map_err(|e| ReconcileError::Parse {
        context: context.to_string(),
        message: e.to_string(),
    })
}
