use chrono::{TimeDelta, Utc};
use claims::assert_matches;
use identity::auth::{AccessToken, TokenStoreCredential};
use identity::config::{IdentityConfig, PollingConfig};
use identity::error::IdentityError;
use identity::management::{
    AsyncOperationPoller, Execution, ManagementClient, ManagementRequest, OperationStatus,
    PollMode,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[derive(Debug, Deserialize, PartialEq)]
struct Account {
    name: String,
    #[serde(default)]
    tier: Option<String>,
}

fn fast_polling() -> PollingConfig {
    PollingConfig {
        initial_interval_ms: 10,
        max_interval_ms: 50,
        multiplier: 2.0,
        max_transient_failures: Some(3),
    }
}

fn client_for(server: &MockServer, polling: PollingConfig) -> ManagementClient {
    let config = IdentityConfig {
        management_endpoint: server.uri(),
        polling,
        ..IdentityConfig::default()
    };
    let credential = Arc::new(TokenStoreCredential::new(
        AccessToken::new("test-token", Utc::now() + TimeDelta::hours(1)),
        None,
    ));
    ManagementClient::new(config.build_http_client().unwrap(), credential, &config).unwrap()
}

fn base(server: &MockServer) -> Url {
    Url::parse(&format!(
        "{}/subscriptions/sub/resourceGroups/rg?api-version=2023-01-01",
        server.uri()
    ))
    .unwrap()
}

fn status_body(status: &str) -> serde_json::Value {
    json!({ "id": "op-1", "name": "op-1", "status": status })
}

async fn mount_accepted(server: &MockServer, header_name: &str) {
    Mock::given(method("PUT"))
        .and(path("/subscriptions/sub/resourceGroups/rg/accounts/acct"))
        .respond_with(
            ResponseTemplate::new(202)
                .insert_header(header_name, format!("{}/operations/op-1", server.uri()).as_str()),
        )
        .mount(server)
        .await;
}

#[tokio::test]
async fn completed_request_sends_bearer_and_json_headers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/subscriptions/sub/resourceGroups/rg/accounts/acct"))
        .and(query_param("api-version", "2023-01-01"))
        .and(query_param("$expand", "tier"))
        .and(header("authorization", "Bearer test-token"))
        .and(header("accept", "application/json; charset=utf-8"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": "acct",
            "tier": "Hot"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server, fast_polling());
    let request = ManagementRequest::get("/accounts/acct").query("$expand", "tier");
    let execution = client
        .execute::<Account>(&base(&server), &request)
        .await
        .unwrap();

    let Execution::Completed(account) = execution else {
        panic!("expected a completed execution");
    };
    assert_eq!(
        account,
        Account {
            name: "acct".to_string(),
            tier: Some("Hot".to_string())
        }
    );
}

#[tokio::test]
async fn created_with_empty_body_yields_null() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/subscriptions/sub/resourceGroups/rg/accounts/acct"))
        .and(body_json(json!({ "location": "westeurope" })))
        .respond_with(ResponseTemplate::new(201))
        .mount(&server)
        .await;

    let client = client_for(&server, fast_polling());
    let request = ManagementRequest::put("accounts/acct")
        .json(&json!({ "location": "westeurope" }))
        .unwrap();
    let (final_status, value) = client
        .execute_and_wait::<serde_json::Value>(&base(&server), &request, &CancellationToken::new())
        .await
        .unwrap();

    assert!(final_status.is_none());
    assert_eq!(value, serde_json::Value::Null);
}

#[tokio::test]
async fn unexpected_status_keeps_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404).set_body_string(r#"{"error":{"code":"ResourceNotFound"}}"#))
        .mount(&server)
        .await;

    let client = client_for(&server, fast_polling());
    let err = client
        .execute::<Account>(&base(&server), &ManagementRequest::get("accounts/missing"))
        .await
        .unwrap_err();

    assert!(matches!(
        &err,
        IdentityError::Api { status: 404, body, .. } if body.contains("ResourceNotFound")
    ));
    assert!(!err.is_transient());
}

#[tokio::test]
async fn accepted_operation_is_polled_until_success() {
    let server = MockServer::start().await;
    mount_accepted(&server, "Azure-AsyncOperation").await;
    Mock::given(method("GET"))
        .and(path("/operations/op-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(status_body("InProgress")))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/operations/op-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "Succeeded",
            "properties": { "name": "acct", "tier": "Cool" }
        })))
        .mount(&server)
        .await;

    let client = client_for(&server, fast_polling());
    let (final_status, account) = client
        .execute_and_wait::<Account>(
            &base(&server),
            &ManagementRequest::put("accounts/acct"),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(account.tier.as_deref(), Some("Cool"));
    assert_eq!(final_status.unwrap().status, OperationStatus::Succeeded);
}

#[tokio::test]
async fn location_header_is_polled_until_resource_returns() {
    let server = MockServer::start().await;
    mount_accepted(&server, "Location").await;
    Mock::given(method("GET"))
        .and(path("/operations/op-1"))
        .respond_with(ResponseTemplate::new(202))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/operations/op-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "name": "acct" })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server, fast_polling());
    let execution = client
        .execute::<Account>(&base(&server), &ManagementRequest::put("accounts/acct"))
        .await
        .unwrap();
    let Execution::Accepted(mut operation) = execution else {
        panic!("expected an accepted execution");
    };
    assert_eq!(operation.poll_uri.path(), "/operations/op-1");
    assert_eq!(operation.mode, PollMode::Location);
    assert_eq!(operation.location.as_ref(), Some(&operation.poll_uri));

    let account = AsyncOperationPoller::new(&client)
        .poll(&mut operation, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(account, Account { name: "acct".to_string(), tier: None });
    assert_eq!(operation.last_status, OperationStatus::Succeeded);
}

#[tokio::test]
async fn location_poll_with_empty_body_yields_null() {
    let server = MockServer::start().await;
    mount_accepted(&server, "Location").await;
    Mock::given(method("GET"))
        .and(path("/operations/op-1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server, fast_polling());
    let (final_status, value) = client
        .execute_and_wait::<serde_json::Value>(
            &base(&server),
            &ManagementRequest::put("accounts/acct"),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(value, serde_json::Value::Null);
    assert_eq!(final_status.unwrap().status, OperationStatus::Succeeded);
}

#[tokio::test]
async fn accepted_without_poll_url_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(202))
        .mount(&server)
        .await;

    let client = client_for(&server, fast_polling());
    let err = client
        .execute::<serde_json::Value>(&base(&server), &ManagementRequest::post("accounts/acct/regenerate"))
        .await
        .unwrap_err();
    assert_matches!(err, IdentityError::Api { status: 202, .. });
}

#[tokio::test]
async fn retry_after_overrides_backoff_interval() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(
            ResponseTemplate::new(202)
                .insert_header(
                    "Azure-AsyncOperation",
                    format!("{}/operations/op-1", server.uri()).as_str(),
                )
                .insert_header("Retry-After", "0"),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/operations/op-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(status_body("Succeeded")))
        .mount(&server)
        .await;

    let slow = PollingConfig {
        initial_interval_ms: 60_000,
        max_interval_ms: 60_000,
        ..fast_polling()
    };
    let client = client_for(&server, slow);
    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        client.execute_and_wait::<serde_json::Value>(
            &base(&server),
            &ManagementRequest::put("accounts/acct"),
            &CancellationToken::new(),
        ),
    )
    .await;

    assert!(outcome.expect("poll honoured Retry-After").is_ok());
}

#[tokio::test]
async fn transient_poll_failures_are_tolerated() {
    let server = MockServer::start().await;
    mount_accepted(&server, "Azure-AsyncOperation").await;
    Mock::given(method("GET"))
        .and(path("/operations/op-1"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/operations/op-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "Succeeded",
            "properties": { "name": "acct" }
        })))
        .mount(&server)
        .await;

    let client = client_for(&server, fast_polling());
    let (_, account) = client
        .execute_and_wait::<Account>(
            &base(&server),
            &ManagementRequest::put("accounts/acct"),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(account.name, "acct");
}

#[tokio::test]
async fn transient_failure_budget_is_enforced() {
    let server = MockServer::start().await;
    mount_accepted(&server, "Azure-AsyncOperation").await;
    Mock::given(method("GET"))
        .and(path("/operations/op-1"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let polling = PollingConfig {
        max_transient_failures: Some(1),
        ..fast_polling()
    };
    let client = client_for(&server, polling);
    let err = client
        .execute_and_wait::<Account>(
            &base(&server),
            &ManagementRequest::put("accounts/acct"),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert_matches!(err, IdentityError::Api { status: 503, .. });
}

#[tokio::test]
async fn failed_operation_reports_provider_error() {
    let server = MockServer::start().await;
    mount_accepted(&server, "Azure-AsyncOperation").await;
    Mock::given(method("GET"))
        .and(path("/operations/op-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "Failed",
            "error": { "code": "QuotaExceeded", "message": "too many accounts" }
        })))
        .mount(&server)
        .await;

    let client = client_for(&server, fast_polling());
    let err = client
        .execute_and_wait::<Account>(
            &base(&server),
            &ManagementRequest::put("accounts/acct"),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    match err {
        IdentityError::OperationFailed { status, code, message } => {
            assert_eq!(status, "Failed");
            assert_eq!(code, "QuotaExceeded");
            assert_eq!(message, "too many accounts");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn cancellation_stops_polling() {
    let server = MockServer::start().await;
    mount_accepted(&server, "Azure-AsyncOperation").await;
    Mock::given(method("GET"))
        .and(path("/operations/op-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(status_body("Running")))
        .mount(&server)
        .await;

    let client = client_for(&server, fast_polling());
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let err = tokio::time::timeout(
        Duration::from_secs(5),
        client.execute_and_wait::<Account>(
            &base(&server),
            &ManagementRequest::put("accounts/acct"),
            &cancel,
        ),
    )
    .await
    .expect("cancellation ends polling")
    .unwrap_err();
    assert_matches!(err, IdentityError::Cancelled(_));
}
