//! Credential resolution for Azure DevOps API access.
//!
//! Tokens are resolved in a fixed order:
//!
//! 1. The explicit `access_token` from [`ProviderConfig`]
//! 2. The `AZDO_PAT` environment variable
//! 3. A platform identity credential (workload identity, managed identity, Azure CLI)
//!
//! Personal access tokens are sent as Basic authentication with an empty user
//! name; identity-issued tokens are sent as Bearer tokens.

use async_trait::async_trait;
use azure_core::credentials::{AccessToken, Secret, TokenCredential, TokenRequestOptions};
use base64::Engine;
use secrecy::{ExposeSecret, SecretString};
use std::sync::{Arc, OnceLock};
use tracing::debug;

use super::transport::{HttpTransport, ReqwestTransport};
use crate::config::ProviderConfig;
use crate::error::{ReconcileError, ReconcileResult};

/// Environment variable holding a personal access token.
pub const PAT_ENV_VAR: &str = "AZDO_PAT";

/// Well-known resource id of the Azure DevOps REST API.
pub const AZURE_DEVOPS_RESOURCE_ID: &str = "499b84ac-1321-427f-aa17-267ca6975798";

/// Token scope requested from identity credentials.
pub const AZURE_DEVOPS_SCOPE: &str = "499b84ac-1321-427f-aa17-267ca6975798/.default";

/// PAT-based credential for Azure DevOps authentication.
///
/// Wraps a Personal Access Token and presents it through the same
/// [`TokenCredential`] seam as identity credentials. The PAT is stored
/// using `SecretString`.
#[derive(Clone)]
pub struct PatCredential {
    pat: SecretString,
}

impl PatCredential {
    pub fn new(pat: SecretString) -> Self {
        Self { pat }
    }
}

impl std::fmt::Debug for PatCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatCredential")
            .field("pat", &"[REDACTED]")
            .finish()
    }
}

#[async_trait]
impl TokenCredential for PatCredential {
    /// Returns the raw PAT; the Basic encoding happens in [`AuthScheme`].
    async fn get_token(
        &self,
        _scopes: &[&str],
        _options: Option<TokenRequestOptions<'_>>,
    ) -> azure_core::Result<AccessToken> {
        Ok(AccessToken::new(
            Secret::new(self.pat.expose_secret().to_string()),
            // PATs don't expire through an OAuth flow
            time::OffsetDateTime::now_utc() + time::Duration::days(365),
        ))
    }
}

/// How a token is presented in the `Authorization` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    /// `Basic base64(":" + token)`.
    Basic,
    /// `Bearer token`.
    Bearer,
}

impl AuthScheme {
    /// Formats the `Authorization` header value for `token`.
    pub fn header_value(self, token: &str) -> SecretString {
        let value = match self {
            Self::Basic => format!(
                "Basic {}",
                base64::engine::general_purpose::STANDARD.encode(format!(":{token}"))
            ),
            Self::Bearer => format!("Bearer {token}"),
        };
        SecretString::from(value)
    }
}

/// Where a resolved credential came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    Explicit,
    Environment,
    Identity,
}

/// A credential chosen by [`CredentialProvider::resolve`].
pub struct ResolvedCredential {
    pub source: TokenSource,
    pub scheme: AuthScheme,
    pub credential: Arc<dyn TokenCredential>,
}

impl std::fmt::Debug for ResolvedCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedCredential")
            .field("source", &self.source)
            .field("scheme", &self.scheme)
            .finish_non_exhaustive()
    }
}

/// Ordered list of identity credentials; the first that yields a token wins.
#[derive(Debug)]
pub struct IdentityChain {
    sources: Vec<(&'static str, Arc<dyn TokenCredential>)>,
}

impl IdentityChain {
    pub fn new(sources: Vec<(&'static str, Arc<dyn TokenCredential>)>) -> Self {
        Self { sources }
    }

    /// Builds the platform chain, skipping sources that cannot be constructed
    /// in the current environment.
    fn platform() -> Self {
        let mut sources: Vec<(&'static str, Arc<dyn TokenCredential>)> = Vec::new();
        match azure_identity::WorkloadIdentityCredential::new(None) {
            Ok(c) => sources.push(("workload identity", c)),
            Err(e) => debug!(error = %e, "Workload identity credential unavailable"),
        }
        match azure_identity::ManagedIdentityCredential::new(None) {
            Ok(c) => sources.push(("managed identity", c)),
            Err(e) => debug!(error = %e, "Managed identity credential unavailable"),
        }
        match azure_identity::AzureCliCredential::new(None) {
            Ok(c) => sources.push(("azure cli", c)),
            Err(e) => debug!(error = %e, "Azure CLI credential unavailable"),
        }
        Self { sources }
    }

    /// Process-wide platform chain, constructed on first use.
    pub fn shared() -> Arc<IdentityChain> {
        static CHAIN: OnceLock<Arc<IdentityChain>> = OnceLock::new();
        CHAIN
            .get_or_init(|| Arc::new(IdentityChain::platform()))
            .clone()
    }
}

#[async_trait]
impl TokenCredential for IdentityChain {
    async fn get_token(
        &self,
        scopes: &[&str],
        options: Option<TokenRequestOptions<'_>>,
    ) -> azure_core::Result<AccessToken> {
        let mut failures = Vec::new();
        for (name, source) in &self.sources {
            match source.get_token(scopes, options.clone()).await {
                Ok(token) => {
                    debug!(source = name, "Acquired identity token");
                    return Ok(token);
                }
                Err(e) => failures.push(format!("{name}: {e}")),
            }
        }
        let message = if failures.is_empty() {
            "no identity credential is available in this environment".to_string()
        } else {
            failures.join("; ")
        };
        Err(azure_core::Error::new(
            azure_core::error::ErrorKind::Credential,
            std::io::Error::other(message),
        ))
    }
}

/// Resolves credentials and builds authenticated transports.
#[derive(Clone)]
pub struct CredentialProvider {
    identity: Option<Arc<dyn TokenCredential>>,
}

impl Default for CredentialProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialProvider {
    /// Provider using the shared platform identity chain as the last resort.
    pub fn new() -> Self {
        Self { identity: None }
    }

    /// Provider using a specific identity credential as the last resort.
    pub fn with_identity(identity: Arc<dyn TokenCredential>) -> Self {
        Self {
            identity: Some(identity),
        }
    }

    /// Picks the credential to use for `config`.
    pub fn resolve(&self, config: &ProviderConfig) -> ResolvedCredential {
        let pat = |token: &SecretString| -> Arc<dyn TokenCredential> {
            Arc::new(PatCredential::new(token.clone()))
        };

        if let Some(token) = config
            .access_token
            .as_ref()
            .filter(|t| !t.expose_secret().trim().is_empty())
        {
            return ResolvedCredential {
                source: TokenSource::Explicit,
                scheme: AuthScheme::Basic,
                credential: pat(token),
            };
        }

        if let Some(token) = std::env::var(PAT_ENV_VAR)
            .ok()
            .filter(|t| !t.trim().is_empty())
        {
            return ResolvedCredential {
                source: TokenSource::Environment,
                scheme: AuthScheme::Basic,
                credential: pat(&SecretString::from(token)),
            };
        }

        let identity = match &self.identity {
            Some(identity) => identity.clone(),
            None => IdentityChain::shared(),
        };
        ResolvedCredential {
            source: TokenSource::Identity,
            scheme: AuthScheme::Bearer,
            credential: identity,
        }
    }

    /// Resolves a token and formats the `Authorization` header value.
    pub async fn authorization_header(
        &self,
        config: &ProviderConfig,
    ) -> ReconcileResult<SecretString> {
        let resolved = self.resolve(config);
        let failure = |detail: String| ReconcileError::Credential {
            message: format!(
                "Failed to acquire Azure DevOps credentials ({detail}). Provide a PAT via \
                 'accessToken' or the {PAT_ENV_VAR} environment variable, or ensure a \
                 federated / managed identity is configured."
            ),
        };

        let token = resolved
            .credential
            .get_token(&[AZURE_DEVOPS_SCOPE], None)
            .await
            .map_err(|e| failure(e.to_string()))?;
        let secret = token.token.secret();
        if secret.trim().is_empty() {
            return Err(failure(
                "empty access token returned for the Azure DevOps scope".to_string(),
            ));
        }

        debug!(source = ?resolved.source, "Resolved Azure DevOps credential");
        Ok(resolved.scheme.header_value(secret))
    }

    /// Builds an authenticated transport for `config`.
    pub async fn acquire_client(
        &self,
        config: &ProviderConfig,
    ) -> ReconcileResult<Arc<dyn HttpTransport>> {
        let header = self.authorization_header(config).await?;
        Ok(Arc::new(ReqwestTransport::new(&header)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[derive(Debug)]
    struct StaticIdentity(Option<&'static str>);

    #[async_trait]
    impl TokenCredential for StaticIdentity {
        async fn get_token(
            &self,
            _scopes: &[&str],
            _options: Option<TokenRequestOptions<'_>>,
        ) -> azure_core::Result<AccessToken> {
            match self.0 {
                Some(token) => Ok(AccessToken::new(
                    Secret::new(token.to_string()),
                    time::OffsetDateTime::now_utc() + time::Duration::hours(1),
                )),
                None => Err(azure_core::Error::new(
                    azure_core::error::ErrorKind::Credential,
                    std::io::Error::other("no identity"),
                )),
            }
        }
    }

    fn clear_env() {
        // SAFETY: callers are #[serial]
        unsafe { std::env::remove_var(PAT_ENV_VAR) };
    }

    #[test]
    fn test_pat_credential_debug_redacts() {
        let credential = PatCredential::new(SecretString::from("secret-pat".to_string()));
        let text = format!("{credential:?}");
        assert!(text.contains("[REDACTED]"));
        assert!(!text.contains("secret-pat"));
    }

    #[tokio::test]
    async fn test_pat_credential_returns_raw_token() {
        let credential = PatCredential::new(SecretString::from("test-pat-value".to_string()));
        let token = credential.get_token(&[], None).await.unwrap();
        assert_eq!(token.token.secret(), "test-pat-value");
    }

    #[test]
    fn test_header_values() {
        // base64(":pat") == "OnBhdA=="
        assert_eq!(
            AuthScheme::Basic.header_value("pat").expose_secret(),
            "Basic OnBhdA=="
        );
        assert_eq!(
            AuthScheme::Bearer.header_value("tok").expose_secret(),
            "Bearer tok"
        );
    }

    /// # Explicit Token Precedence
    ///
    /// Tests that the configured token wins over the environment.
    ///
    /// ## Test Scenario
    /// - Sets AZDO_PAT and an explicit token
    ///
    /// ## Expected Outcome
    /// - Explicit source, Basic scheme, explicit token value
    #[tokio::test]
    #[serial]
    async fn test_explicit_token_wins() {
        unsafe { std::env::set_var(PAT_ENV_VAR, "env-pat") };
        let provider = CredentialProvider::with_identity(Arc::new(StaticIdentity(None)));

        let header = provider
            .authorization_header(&ProviderConfig::with_access_token("explicit"))
            .await
            .unwrap();
        let resolved = provider.resolve(&ProviderConfig::with_access_token("explicit"));
        clear_env();

        assert_eq!(resolved.source, TokenSource::Explicit);
        assert_eq!(header.expose_secret(), AuthScheme::Basic.header_value("explicit").expose_secret());
    }

    #[tokio::test]
    #[serial]
    async fn test_environment_token_used() {
        unsafe { std::env::set_var(PAT_ENV_VAR, "env-pat") };
        let provider = CredentialProvider::with_identity(Arc::new(StaticIdentity(None)));

        let resolved = provider.resolve(&ProviderConfig::default());
        let header = provider
            .authorization_header(&ProviderConfig::default())
            .await
            .unwrap();
        clear_env();

        assert_eq!(resolved.source, TokenSource::Environment);
        assert_eq!(header.expose_secret(), AuthScheme::Basic.header_value("env-pat").expose_secret());
    }

    #[tokio::test]
    #[serial]
    async fn test_identity_fallback_uses_bearer() {
        clear_env();
        let provider =
            CredentialProvider::with_identity(Arc::new(StaticIdentity(Some("aad-token"))));

        let header = provider
            .authorization_header(&ProviderConfig::default())
            .await
            .unwrap();
        assert_eq!(header.expose_secret(), "Bearer aad-token");
    }

    /// # No Usable Credential
    ///
    /// Tests the failure message when identity acquisition fails.
    ///
    /// ## Test Scenario
    /// - No explicit token, no AZDO_PAT, failing identity
    ///
    /// ## Expected Outcome
    /// - Credential error naming both remediation paths
    #[tokio::test]
    #[serial]
    async fn test_identity_failure_is_credential_error() {
        clear_env();
        let provider = CredentialProvider::with_identity(Arc::new(StaticIdentity(None)));

        let err = provider
            .authorization_header(&ProviderConfig::default())
            .await
            .unwrap_err();
        match err {
            ReconcileError::Credential { message } => {
                assert!(message.contains(PAT_ENV_VAR));
                assert!(message.contains("managed identity"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    #[serial]
    async fn test_empty_identity_token_rejected() {
        clear_env();
        let provider = CredentialProvider::with_identity(Arc::new(StaticIdentity(Some(" "))));

        let err = provider
            .authorization_header(&ProviderConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Credential { .. }));
    }

    #[tokio::test]
    async fn test_identity_chain_falls_through() {
        let chain = IdentityChain::new(vec![
            ("first", Arc::new(StaticIdentity(None)) as Arc<dyn TokenCredential>),
            ("second", Arc::new(StaticIdentity(Some("from-second")))),
        ]);
        let token = chain.get_token(&[AZURE_DEVOPS_SCOPE], None).await.unwrap();
        assert_eq!(token.token.secret(), "from-second");

        let empty = IdentityChain::new(Vec::new());
        assert!(empty.get_token(&[AZURE_DEVOPS_SCOPE], None).await.is_err());
    }
}
