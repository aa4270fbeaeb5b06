//! Integration tests for the reconciler library
//!
//! These exercise the public API end to end over a scripted transport, the
//! way an embedding host would drive it.

use async_trait::async_trait;
use azdo_reconciler::api::{
    ApiFamily, ApiRequest, ApiResponse, ClientFactory, HttpTransport, Method, resolve,
};
use azdo_reconciler::error::TransportError;
use azdo_reconciler::resources::{
    ProjectProperties, ProjectReconciler, ServiceConnectionProperties,
    ServiceConnectionReconciler,
};
use azdo_reconciler::{
    LookupPolicy, Manifest, Mode, Provider, ProviderConfig, ReconcileError, ReconcileResult,
    ResourceReconciler,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Answers by URL substring; each route's responses are consumed in order and
/// the last one repeats.
#[derive(Default)]
struct Scripted {
    routes: Mutex<Vec<(Method, &'static str, Vec<ApiResponse>)>>,
    seen: Mutex<Vec<ApiRequest>>,
}

impl Scripted {
    fn route(self, method: Method, fragment: &'static str, responses: Vec<ApiResponse>) -> Self {
        self.routes.lock().unwrap().push((method, fragment, responses));
        self
    }

    fn requests(&self, method: Method) -> Vec<ApiRequest> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.method == method)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl HttpTransport for Scripted {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
        self.seen.lock().unwrap().push(request.clone());
        let mut routes = self.routes.lock().unwrap();
        let route = routes
            .iter_mut()
            .find(|(method, fragment, _)| *method == request.method && request.url.contains(fragment));
        Ok(match route {
            Some((_, _, responses)) if responses.len() > 1 => responses.remove(0),
            Some((_, _, responses)) => responses[0].clone(),
            None => ApiResponse::new(404, ""),
        })
    }
}

struct Factory {
    transport: Arc<Scripted>,
    handed_out: AtomicUsize,
}

impl Factory {
    fn new(transport: Scripted) -> (Arc<Self>, Arc<Scripted>) {
        let transport = Arc::new(transport);
        let factory = Arc::new(Self {
            transport: transport.clone(),
            handed_out: AtomicUsize::new(0),
        });
        (factory, transport)
    }
}

#[async_trait]
impl ClientFactory for Factory {
    async fn transport(&self, _config: &ProviderConfig) -> ReconcileResult<Arc<dyn HttpTransport>> {
        self.handed_out.fetch_add(1, Ordering::SeqCst);
        Ok(self.transport.clone())
    }
}

fn config() -> ProviderConfig {
    ProviderConfig::with_access_token("integration-pat")
}

/// # Project End to End
///
/// Tests creating a project that does not exist yet, with every default applied.
///
/// ## Test Scenario
/// - Lookup 404, process list without "Agile", create returns an operation id
/// - The operation succeeds and the project reads back `wellFormed`
///
/// ## Expected Outcome
/// - Create body uses Private visibility, Git and the Agile template fallback
/// - Outputs carry the id, state and URL
#[tokio::test]
async fn test_project_created_with_defaults() {
    let (factory, transport) = Factory::new(
        Scripted::default()
            .route(
                Method::Get,
                "/_apis/projects/platform?",
                vec![
                    ApiResponse::new(404, ""),
                    ApiResponse::json(
                        200,
                        json!({"id": "p-1", "name": "platform", "state": "wellFormed", "url": "https://dev.azure.com/contoso/_apis/projects/p-1"}),
                    ),
                ],
            )
            .route(
                Method::Get,
                "/_apis/process/processes",
                vec![ApiResponse::json(200, json!({"value": [{"id": "basic-id", "name": "Basic"}]}))],
            )
            .route(
                Method::Post,
                "/_apis/projects?",
                vec![ApiResponse::json(202, json!({"id": "op-1", "status": "queued"}))],
            )
            .route(
                Method::Get,
                "/_apis/operations/op-1",
                vec![ApiResponse::json(200, json!({"id": "op-1", "status": "succeeded"}))],
            ),
    );
    let reconciler = ProjectReconciler::new(factory);

    let result = reconciler
        .create_or_update(
            ProjectProperties::new("contoso", "platform"),
            &config(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let create = &transport.requests(Method::Post)[0];
    let body: serde_json::Value =
        serde_json::from_str(&create.body.as_ref().unwrap().payload).unwrap();
    assert_eq!(body["visibility"], "private");
    assert_eq!(body["capabilities"]["versioncontrol"]["sourceControlType"], "Git");
    assert_eq!(
        body["capabilities"]["processTemplate"]["templateTypeId"],
        "adcc42ab-9882-485e-a3ed-7678f01f66bc"
    );
    assert_eq!(result.project_id.as_deref(), Some("p-1"));
    assert_eq!(result.state.as_deref(), Some("wellFormed"));
}

/// # Validation Before I/O
///
/// Tests that an invalid service connection never acquires a transport.
///
/// ## Test Scenario
/// - Both a subscription pair and a management group are declared
///
/// ## Expected Outcome
/// - Configuration error and zero transports handed out
#[tokio::test]
async fn test_service_connection_scope_conflict_makes_no_calls() {
    let (factory, transport) = Factory::new(Scripted::default());
    let reconciler = ServiceConnectionReconciler::new(factory.clone());
    let mut desired =
        ServiceConnectionProperties::new("contoso", "platform", "azure", "tenant", "client");
    desired.subscription_id = Some("sub".into());
    desired.subscription_name = Some("Sub".into());
    desired.management_group_id = Some("mg".into());

    let err = reconciler
        .create_or_update(desired, &config(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, ReconcileError::Configuration(_)));
    assert_eq!(factory.handed_out.load(Ordering::SeqCst), 0);
    assert!(transport.requests(Method::Get).is_empty());
}

/// # Manifest Preview From Disk
///
/// Tests loading a manifest file and previewing it through the provider.
///
/// ## Test Scenario
/// - A manifest with a repository that exists and an extension that does not
///
/// ## Expected Outcome
/// - Two outcomes in order; only the repository reports outputs; no writes
#[tokio::test]
async fn test_manifest_preview_from_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("resources.toml");
    std::fs::write(
        &path,
        r#"
[[resources]]
kind = "AzureDevOpsRepository"
organization = "https://dev.azure.com/contoso"
project = "platform"
name = "infra"

[[resources]]
kind = "AzureDevOpsExtension"
organization = "contoso"
publisherName = "ms"
extensionName = "vss-code-search"
version = "1.0.0"
"#,
    )
    .unwrap();
    let (factory, transport) = Factory::new(Scripted::default().route(
        Method::Get,
        "/platform/_apis/git/repositories/infra?",
        vec![ApiResponse::json(
            200,
            json!({"id": "r-1", "name": "infra", "webUrl": "https://dev.azure.com/contoso/platform/_git/infra"}),
        )],
    ));
    let provider = Provider::new(factory, config());
    let mut outcomes = Vec::new();

    let count = provider
        .run_manifest(
            Manifest::load(&path).unwrap(),
            Mode::Preview,
            &CancellationToken::new(),
            |outcome| {
                outcomes.push(outcome.clone());
                Ok(())
            },
        )
        .await
        .unwrap();

    assert_eq!(count, 2);
    assert_eq!(outcomes[0].kind, "AzureDevOpsRepository");
    assert_eq!(outcomes[0].properties["repositoryId"], "r-1");
    assert_eq!(outcomes[1].kind, "AzureDevOpsExtension");
    assert!(outcomes[1].properties.get("extensionId").is_none());
    assert!(transport.requests(Method::Post).is_empty());
}

#[test]
fn test_config_file_and_env_merge() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "lookup_policy = \"lenient\"\n").unwrap();

    let file = ProviderConfig::load_from_path(&path).unwrap();
    let merged = file.merge(ProviderConfig::with_access_token("cli"));

    assert_eq!(merged.lookup_policy(), LookupPolicy::Lenient);
    assert!(merged.access_token.is_some());
}

#[test]
fn test_organization_resolution() {
    let graph = resolve("contoso", ApiFamily::Graph).unwrap();
    assert_eq!(graph.base_url, "https://vssps.dev.azure.com");
    assert_eq!(graph.organization, "contoso");

    assert!(resolve("", ApiFamily::Core).is_err());
}

#[test]
fn test_library_version() {
    let version = azdo_reconciler::VERSION;
    assert!(!version.is_empty());
    assert!(version.contains('.'));
}
