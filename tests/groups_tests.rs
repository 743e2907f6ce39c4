//! Group creation and assignment reconciliation against a mocked Graph

use intunepack::graph::groups::{self, AssignmentOptions, GroupRole};
use intunepack::graph::{GraphClient, RetryPolicy, apps};
use serde_json::{Value, json};
use std::time::Duration;
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

fn graph(server: &MockServer) -> GraphClient {
    GraphClient::new("test-token".into())
        .with_base_url(format!("{}/v1.0", server.uri()))
        .with_retry_policy(RetryPolicy {
            max_retries: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        })
}

/// Answers `POST groups` with the posted group plus an id
struct CreatedGroup;

impl Respond for CreatedGroup {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: Value = serde_json::from_slice(&request.body).unwrap();
        ResponseTemplate::new(201).set_body_json(json!({
            "id": format!("new-{}", body["mailNickname"].as_str().unwrap()),
            "displayName": body["displayName"],
            "mailNickname": body["mailNickname"],
            "description": body["description"],
        }))
    }
}

#[tokio::test]
async fn test_ensure_groups_reuses_and_creates() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1.0/groups"))
        .and(query_param(
            "$filter",
            "displayName eq 'APP-Contoso Widget-System-Install'",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [{"id": "existing", "displayName": "APP-Contoso Widget-System-Install"}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v1.0/groups"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": []})))
        .expect(3)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/v1.0/groups"))
        .and(body_partial_json(json!({
            "mailEnabled": false,
            "securityEnabled": true,
        })))
        .respond_with(CreatedGroup)
        .expect(3)
        .mount(&server)
        .await;

    let resolved = groups::ensure_groups(&graph(&server), "APP", "Contoso Widget")
        .await
        .unwrap();

    assert_eq!(resolved.len(), 4);
    let roles: Vec<GroupRole> = resolved.iter().map(|r| r.role).collect();
    assert_eq!(roles, GroupRole::ALL.to_vec());

    assert!(!resolved[0].created);
    assert_eq!(resolved[0].group.id, "existing");

    assert!(resolved[1..].iter().all(|r| r.created));
    assert_eq!(
        resolved[3].group.display_name,
        "APP-Contoso Widget-User-Uninstall"
    );
    assert_eq!(resolved[3].group.id, "new-APP-Contoso-Widget-User-Uninstall");
}

#[tokio::test]
async fn test_assignments_are_sent_once_then_left_alone() {
    let server = MockServer::start().await;
    let app = "/v1.0/deviceAppManagement/mobileApps/app1";

    Mock::given(method("GET"))
        .and(path("/v1.0/groups"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [{"id": "g", "displayName": "shared"}]
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path(format!("{}/assignments", app)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [{
                "id": "a1",
                "intent": "available",
                "target": {"@odata.type": "#microsoft.graph.allLicensedUsersAssignmentTarget"}
            }]
        })))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path(format!("{}/assign", app)))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let graph = graph(&server);
    let resolved = groups::ensure_groups(&graph, "APP", "Contoso Widget")
        .await
        .unwrap();
    let existing = apps::get_assignments(&graph, "app1").await.unwrap();
    let plan = groups::plan_assignments(&existing, &resolved, AssignmentOptions::default());

    assert_eq!(plan.kept, 1);
    assert!(groups::apply_assignments(&graph, "app1", &plan).await.unwrap());

    let unchanged = groups::AssignmentPlan {
        assignments: plan.assignments.clone(),
        unchanged: 4,
        ..Default::default()
    };
    assert!(!groups::apply_assignments(&graph, "app1", &unchanged).await.unwrap());
}
