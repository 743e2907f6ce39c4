//! Win32 app creation, lookup and detection-rule reconciliation

use intunepack::detection::DetectionRule;
use intunepack::graph::{GraphClient, RetryPolicy, apps};
use intunepack::manifest::AppManifest;
use intunepack::packaging::IntuneWinPackage;
use serde_json::json;
use std::fs;
use std::path::Path;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const MANIFEST: &str = r#"
[app]
name = "Widget"
vendor = "Contoso"
version = "2.4.1"

[installer]
file = "WidgetSetup.exe"
install_args = "/S"
uninstall_args = "/S /uninstall"

[[detection]]
type = "file"
path = "C:\\Program Files\\Contoso\\Widget"
name = "widget.exe"
"#;

fn manifest() -> AppManifest {
    AppManifest::from_toml(MANIFEST, Path::new(".")).unwrap()
}

fn graph(server: &MockServer) -> GraphClient {
    GraphClient::new("test-token".into())
        .with_base_url(format!("{}/v1.0", server.uri()))
        .with_retry_policy(RetryPolicy {
            max_retries: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        })
}

#[tokio::test]
async fn test_create_win32_app_from_package() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("src");
    fs::create_dir_all(&source).unwrap();
    fs::write(source.join("WidgetSetup.exe"), b"MZ").unwrap();
    let package =
        IntuneWinPackage::create(&source, "WidgetSetup.exe", dir.path(), None).unwrap();

    Mock::given(method("POST"))
        .and(path("/v1.0/deviceAppManagement/mobileApps"))
        .and(body_partial_json(json!({
            "@odata.type": "#microsoft.graph.win32LobApp",
            "displayName": "Contoso Widget 2.4.1",
            "setupFilePath": "WidgetSetup.exe",
            "installCommandLine": "\"WidgetSetup.exe\" /S",
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": "app1",
            "displayName": "Contoso Widget 2.4.1"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let manifest = manifest();
    let body = apps::win32_app_body(&manifest, &package, &manifest.detection).unwrap();
    let app = apps::create_win32_app(&graph(&server), &body).await.unwrap();
    assert_eq!(app.id, "app1");
}

#[tokio::test]
async fn test_find_app_by_name() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1.0/deviceAppManagement/mobileApps"))
        .and(query_param(
            "$filter",
            "isof('microsoft.graph.win32LobApp') and displayName eq 'Contoso Widget 2.4.1'",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [{"id": "app1", "displayName": "Contoso Widget 2.4.1"}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let found = apps::find_app_by_name(&graph(&server), "Contoso Widget 2.4.1")
        .await
        .unwrap();
    assert_eq!(found.map(|a| a.id), Some("app1".to_string()));
}

#[tokio::test]
async fn test_matching_detection_rules_are_not_patched() {
    let server = MockServer::start().await;
    let manifest = manifest();
    let current: Vec<_> = manifest.detection.iter().map(DetectionRule::to_graph).collect();

    Mock::given(method("GET"))
        .and(path("/v1.0/deviceAppManagement/mobileApps/app1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "app1",
            "detectionRules": current,
        })))
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/v1.0/deviceAppManagement/mobileApps/app1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(0)
        .mount(&server)
        .await;

    let plan = apps::reconcile_detection_rules(&graph(&server), "app1", &manifest.detection)
        .await
        .unwrap();
    assert!(plan.is_noop());
    assert_eq!(plan.keep.len(), 1);
}

#[tokio::test]
async fn test_differing_detection_rules_are_replaced() {
    let server = MockServer::start().await;
    let manifest = manifest();

    Mock::given(method("GET"))
        .and(path("/v1.0/deviceAppManagement/mobileApps/app1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "app1",
            "detectionRules": [{
                "@odata.type": "#microsoft.graph.win32LobAppProductCodeDetection",
                "productCode": "{11111111-2222-3333-4444-555555555555}",
                "productVersionOperator": "notConfigured",
                "productVersion": null
            }],
        })))
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/v1.0/deviceAppManagement/mobileApps/app1"))
        .and(body_partial_json(json!({
            "detectionRules": [{
                "@odata.type": "#microsoft.graph.win32LobAppFileSystemDetection",
                "fileOrFolderName": "widget.exe",
            }]
        })))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let plan = apps::reconcile_detection_rules(&graph(&server), "app1", &manifest.detection)
        .await
        .unwrap();
    assert_eq!(plan.add.len(), 1);
    assert_eq!(plan.remove.len(), 1);
}
