//! Integration tests for Graph client retry logic
//!
//! Uses wiremock to simulate Graph responses and verify retry behavior,
//! rate limit handling, pagination and error propagation.

use intunepack::error::IntunePackError;
use intunepack::graph::{GraphClient, RetryPolicy};
use serde_json::{Value, json};
use std::time::Duration;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
    }
}

fn client(server: &MockServer) -> GraphClient {
    GraphClient::new("test-token".into())
        .with_base_url(format!("{}/v1.0", server.uri()))
        .with_retry_policy(fast_retry())
}

#[tokio::test]
async fn test_get_sends_bearer_token() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1.0/deviceAppManagement/mobileApps/app1"))
        .and(header("authorization", "Bearer test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "app1",
            "displayName": "Contoso Widget 2.4.1"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let app: Value = client(&server)
        .get("deviceAppManagement/mobileApps/app1")
        .await
        .unwrap();
    assert_eq!(app["displayName"], "Contoso Widget 2.4.1");
}

#[tokio::test]
async fn test_rate_limit_is_retried() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1.0/groups"))
        .respond_with(
            ResponseTemplate::new(429)
                .append_header("Retry-After", "0")
                .set_body_string("Rate limited"),
        )
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v1.0/groups"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": []})))
        .expect(1)
        .mount(&server)
        .await;

    let body: Value = client(&server).get("groups").await.unwrap();
    assert_eq!(body["value"], json!([]));
}

#[tokio::test]
async fn test_server_errors_are_retried_until_success() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1.0/groups"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v1.0/groups"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": []})))
        .expect(1)
        .mount(&server)
        .await;

    assert!(client(&server).get::<Value>("groups").await.is_ok());
}

#[tokio::test]
async fn test_server_error_gives_up_after_max_retries() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1.0/groups"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .expect(3)
        .mount(&server)
        .await;

    let err = client(&server).get::<Value>("groups").await.unwrap_err();
    assert!(matches!(err, IntunePackError::GraphApiError(_)));
}

#[tokio::test]
async fn test_client_error_is_not_retried() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1.0/groups"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": {"code": "Request_BadRequest", "message": "Invalid mailNickname"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let err = client(&server)
        .post::<_, Value>("groups", &json!({"displayName": "x"}))
        .await
        .unwrap_err();
    match err {
        IntunePackError::GraphApiError(message) => assert!(message.contains("400")),
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn test_patch_and_post_empty_accept_no_content() {
    let server = MockServer::start().await;

    Mock::given(method("PATCH"))
        .and(path("/v1.0/deviceAppManagement/mobileApps/app1"))
        .and(body_json(json!({"committedContentVersion": "1"})))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/v1.0/deviceAppManagement/mobileApps/app1/assign"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let graph = client(&server);
    graph
        .patch(
            "deviceAppManagement/mobileApps/app1",
            &json!({"committedContentVersion": "1"}),
        )
        .await
        .unwrap();
    graph
        .post_empty(
            "deviceAppManagement/mobileApps/app1/assign",
            &json!({"mobileAppAssignments": []}),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_delete() {
    let server = MockServer::start().await;

    Mock::given(method("DELETE"))
        .and(path("/v1.0/deviceAppManagement/mobileApps/app1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    client(&server)
        .delete("deviceAppManagement/mobileApps/app1")
        .await
        .unwrap();
}

#[tokio::test]
async fn test_get_all_pages_follows_next_link() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1.0/groups"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [{"id": "g3"}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v1.0/groups"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [{"id": "g1"}, {"id": "g2"}],
            "@odata.nextLink": format!("{}/v1.0/groups?page=2", server.uri())
        })))
        .expect(1)
        .mount(&server)
        .await;

    let groups: Vec<Value> = client(&server).get_all_pages("groups").await.unwrap();
    let ids: Vec<&str> = groups.iter().filter_map(|g| g["id"].as_str()).collect();
    assert_eq!(ids, vec!["g1", "g2", "g3"]);
}
