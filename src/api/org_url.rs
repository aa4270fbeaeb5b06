//! Organization reference normalization.
//!
//! An organization may be declared as a bare slug (`myorg`), as a full URL
//! (`https://dev.azure.com/myorg`) or as a legacy hosted URL
//! (`https://myorg.visualstudio.com`). Each REST family lives on its own host
//! for the hosted service, so the base URL depends on the family being called.

use url::Url;

use crate::error::{ReconcileError, ReconcileResult};

const DEFAULT_HOST: &str = "dev.azure.com";
const LEGACY_HOST_SUFFIX: &str = ".visualstudio.com";

/// REST API families that are served from distinct hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiFamily {
    /// Projects, git, work items, service endpoints, operations.
    Core,
    /// Artifact feeds.
    Feeds,
    /// Extension management.
    ExtensionManagement,
    /// Identity graph (groups, descriptors, memberships).
    Graph,
}

impl ApiFamily {
    fn subdomain(self) -> Option<&'static str> {
        match self {
            Self::Core => None,
            Self::Feeds => Some("feeds"),
            Self::ExtensionManagement => Some("extmgmt"),
            Self::Graph => Some("vssps"),
        }
    }
}

/// A resolved organization slug and the base URL to address it with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrgEndpoint {
    /// Organization slug, e.g. `myorg`.
    pub organization: String,
    /// Scheme and host without a trailing slash, e.g. `https://dev.azure.com`.
    pub base_url: String,
}

impl OrgEndpoint {
    /// Returns `{base_url}/{organization}`.
    pub fn org_url(&self) -> String {
        format!("{}/{}", self.base_url, self.organization)
    }
}

/// Resolves an organization reference for the given API family.
///
/// Family subdomains are only derived for hosts under `dev.azure.com`; any
/// other host is returned unchanged for every family.
pub fn resolve(organization_ref: &str, family: ApiFamily) -> ReconcileResult<OrgEndpoint> {
    let trimmed = organization_ref.trim();
    if trimmed.is_empty() {
        return Err(ReconcileError::Configuration(
            "organization must not be empty".to_string(),
        ));
    }

    let lowered = trimmed.to_ascii_lowercase();
    if !(lowered.starts_with("http://") || lowered.starts_with("https://")) {
        return Ok(OrgEndpoint {
            organization: trimmed.trim_matches('/').to_string(),
            base_url: format!("https://{}", family_host(DEFAULT_HOST, family)),
        });
    }

    let url = Url::parse(trimmed.trim_end_matches('/')).map_err(|e| {
        ReconcileError::Configuration(format!(
            "organization '{organization_ref}' is not a valid URL: {e}"
        ))
    })?;
    let host = url.host_str().ok_or_else(|| {
        ReconcileError::Configuration(format!("organization URL '{organization_ref}' has no host"))
    })?;

    // Legacy hosted URLs carry the organization in the subdomain.
    if let Some(organization) = host
        .strip_suffix(LEGACY_HOST_SUFFIX)
        .filter(|org| !org.is_empty() && !org.contains('.'))
    {
        return Ok(OrgEndpoint {
            organization: organization.to_string(),
            base_url: format!("https://{}", family_host(DEFAULT_HOST, family)),
        });
    }

    let organization = url
        .path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).next_back())
        .map(str::to_string)
        .ok_or_else(|| {
            ReconcileError::Configuration(format!(
                "organization URL '{organization_ref}' does not name an organization"
            ))
        })?;

    let host = family_host(host, family);
    let base_url = match url.port() {
        Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
        None => format!("{}://{}", url.scheme(), host),
    };

    Ok(OrgEndpoint {
        organization,
        base_url,
    })
}

fn family_host(host: &str, family: ApiFamily) -> String {
    match family.subdomain() {
        Some(sub) if host.to_ascii_lowercase().contains(DEFAULT_HOST) => {
            format!("{sub}.{DEFAULT_HOST}")
        }
        _ => host.to_string(),
    }
}
