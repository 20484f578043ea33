//! Shared harness: a mock API with discovery, OAuth, dependency, and schema
//! endpoints, plus an engine builder wired to temporary directories.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use uplink::api::ApiClient;
use uplink::config::AppConfig;
use uplink::directory;
use uplink::dispatch::{Engine, ReprocessPolicy};
use uplink::metadata::MetadataProvider;
use uplink::report::RunReporter;

pub struct TestRig {
    pub server: MockServer,
    pub data_dir: TempDir,
    pub state_dir: TempDir,
}

/// Starts a mock API that answers URL discovery, token requests, the
/// dependency list, and both schema documents.
pub async fn rig() -> TestRig {
    let server = MockServer::start().await;
    let uri = server.uri();

    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "urls": {
                "oauth": format!("{uri}/oauth/token"),
                "dependencies": format!("{uri}/metadata/dependencies"),
                "openApiMetadata": format!("{uri}/metadata"),
                "dataManagementApi": format!("{uri}/data/v3"),
            }
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/metadata/dependencies"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"resource": "/ed-fi/schools", "order": 1, "operations": ["Create"]},
            {"resource": "/ed-fi/students", "order": 2, "operations": ["Create"]},
            {"resource": "/ed-fi/studentSchoolAssociations", "order": 3, "operations": ["Create"]},
            {"resource": "/ed-fi/readOnlyThing", "order": 4, "operations": ["Read"]},
        ])))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/metadata"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"name": "Resources", "endpointUri": format!("{uri}/metadata/resources/swagger.json")},
            {"name": "Descriptors", "endpointUri": format!("{uri}/metadata/descriptors/swagger.json")},
        ])))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/metadata/resources/swagger.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "definitions": {
                "edFi_school": {
                    "type": "object",
                    "required": ["schoolId", "nameOfInstitution"],
                    "properties": {
                        "schoolId": {"type": "integer"},
                        "nameOfInstitution": {"type": "string"},
                    }
                },
                "edFi_student": {
                    "type": "object",
                    "required": ["studentUniqueId"],
                    "properties": {
                        "studentUniqueId": {"type": "string"},
                    }
                },
                "edFi_studentSchoolAssociation": {
                    "type": "object",
                    "required": ["schoolReference", "studentReference"],
                    "properties": {
                        "schoolReference": {"$ref": "#/definitions/edFi_schoolReference"},
                        "studentReference": {"$ref": "#/definitions/edFi_studentReference"},
                    }
                },
                "edFi_schoolReference": {
                    "type": "object",
                    "required": ["schoolId"],
                    "properties": {"schoolId": {"type": "integer"}}
                },
                "edFi_studentReference": {
                    "type": "object",
                    "required": ["studentUniqueId"],
                    "properties": {"studentUniqueId": {"type": "string"}}
                },
            }
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/metadata/descriptors/swagger.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "definitions": {
                "edFi_gradeLevelDescriptor": {
                    "type": "object",
                    "required": ["namespace", "codeValue", "shortDescription"],
                    "properties": {
                        "namespace": {"type": "string"},
                        "codeValue": {"type": "string"},
                        "shortDescription": {"type": "string"},
                    }
                }
            }
        })))
        .mount(&server)
        .await;

    TestRig {
        server,
        data_dir: TempDir::new().unwrap(),
        state_dir: TempDir::new().unwrap(),
    }
}

/// Mounts the default token endpoint, valid for the whole test.
pub async fn mount_token(server: &MockServer, token: &str) {
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"access_token": token})),
        )
        .mount(server)
        .await;
}

/// Builds a ready engine against the rig: parsed config, connected client,
/// discovered metadata, and the selector-resolved working set.
pub async fn engine(rig: &TestRig, command: &str, selector: &str, extra_toml: &str) -> Engine {
    let raw = format!(
        "data_dir = {:?}\nstate_dir = {:?}\n\n[api]\nbase_url = {:?}\nclient_id = \"tester\"\nclient_secret = \"hunter2\"\n\n{extra_toml}\n",
        rig.data_dir.path().to_string_lossy(),
        rig.state_dir.path().to_string_lossy(),
        rig.server.uri(),
    );
    let config = Arc::new(AppConfig::parse(&raw, &[]).unwrap());
    let api = Arc::new(ApiClient::connect(&config).await.unwrap());
    let meta = MetadataProvider::discover(api.clone(), "ed-fi", &config.state_dir, false)
        .await
        .unwrap();
    let ordered = meta.resources().to_vec();
    let resources = directory::resolve(&ordered, selector, "").unwrap();
    Engine {
        config,
        api,
        meta,
        resources,
        policy: ReprocessPolicy::default(),
        keep_keys: Vec::new(),
        drop_keys: Vec::new(),
        reporter: RunReporter::new(command),
        wipe_cache: false,
        run_failures: Arc::new(AtomicUsize::new(0)),
    }
}

pub fn write_data_file(dir: &Path, name: &str, lines: &[&str]) {
    fs::write(dir.join(name), lines.join("\n")).unwrap();
}
