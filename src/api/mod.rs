//! Azure DevOps REST plumbing shared by the reconcilers.
//!
//! ## Features
//!
//! - Credential resolution (explicit token, `AZDO_PAT`, platform identity)
//! - Organization URL normalization per API family
//! - A mockable HTTP transport seam
//! - Lookup classification and lookup policy handling
//! - Operation polling, settle polling and retry policies
//! - Continuation-token pagination for Graph listings
//!
//! ## Example
//!
//! ```rust
//! use azdo_reconciler::api::{ApiFamily, resolve};
//!
//! let endpoint = resolve("https://dev.azure.com/contoso", ApiFamily::Feeds).unwrap();
//! assert_eq!(endpoint.base_url, "https://feeds.dev.azure.com");
//! assert_eq!(endpoint.organization, "contoso");
//! ```

mod client;
mod credential;
pub mod graph;
mod org_url;
pub mod poll;
mod transport;

pub use client::{
    ClientFactory, DevOpsApi, Lookup, PROJECTS_API_VERSION, ensure_success, parse_body,
    remote_error,
};
pub use credential::{
    AZURE_DEVOPS_RESOURCE_ID, AZURE_DEVOPS_SCOPE, AuthScheme, CredentialProvider, IdentityChain,
    PAT_ENV_VAR, PatCredential, ResolvedCredential, TokenSource,
};
pub use org_url::{ApiFamily, OrgEndpoint, resolve};
pub use transport::{ApiRequest, ApiResponse, HttpTransport, Method, ReqwestTransport, RequestBody};
