//! Tests for the client-credentials token flow

use dataverse_sync::auth::{ClientCredentials, TokenProvider, acquire_token};
use dataverse_sync::config::{DataverseConfig, RetryConfig};
use std::time::Duration;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{body_string_contains, header, method, path},
};

fn dataverse(authority: &str) -> DataverseConfig {
    DataverseConfig {
        base_url: "https://org.crm.dynamics.com".into(),
        tenant_id: "contoso".into(),
        client_id: "app-id".into(),
        client_secret: "s3cret".into(),
        authority_url: authority.into(),
        request_timeout_secs: 5,
        token_timeout_secs: 5,
    }
}

fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_retries: 2,
        initial_backoff_ms: 1,
        max_backoff_ms: 5,
        multiplier: 2.0,
        jitter: false,
    }
}

#[tokio::test]
async fn test_client_credentials_form() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/contoso/oauth2/v2.0/token"))
        .and(header("content-type", "application/x-www-form-urlencoded"))
        .and(body_string_contains("grant_type=client_credentials"))
        .and(body_string_contains("client_id=app-id"))
        .and(body_string_contains("client_secret=s3cret"))
        .and(body_string_contains(
            "scope=https%3A%2F%2Forg.crm.dynamics.com%2F.default",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "token_type": "Bearer",
            "expires_in": 3599,
            "access_token": "eyJ0eXAi.payload.sig"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let provider = ClientCredentials::from_config(&dataverse(&server.uri())).unwrap();
    let token = provider
        .token("contoso", "app-id", "s3cret", "https://org.crm.dynamics.com")
        .await
        .unwrap();
    assert_eq!(token, "eyJ0eXAi.payload.sig");
}

#[tokio::test]
async fn test_rejected_credentials_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/contoso/oauth2/v2.0/token"))
        .respond_with(ResponseTemplate::new(401).set_body_string(
            r#"{"error":"invalid_client","error_description":"AADSTS7000215: Invalid client secret provided."}"#,
        ))
        .expect(1)
        .mount(&server)
        .await;

    let config = dataverse(&server.uri());
    let provider = ClientCredentials::from_config(&config).unwrap();
    let err = acquire_token(&provider, &config, &fast_retry())
        .await
        .unwrap_err();

    assert_eq!(err.code(), "AUTH_ERROR");
    assert!(!err.is_retryable());
    assert!(err.to_string().contains("invalid_client"));
}

#[tokio::test]
async fn test_unavailable_token_endpoint_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/contoso/oauth2/v2.0/token"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/contoso/oauth2/v2.0/token"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"access_token": "abc"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let config = dataverse(&server.uri());
    let provider = ClientCredentials::new(&server.uri(), Duration::from_secs(5)).unwrap();
    let token = acquire_token(&provider, &config, &fast_retry()).await.unwrap();
    assert_eq!(token, "abc");
}

#[tokio::test]
async fn test_token_response_without_access_token_fails() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/contoso/oauth2/v2.0/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"foo": 1})))
        .mount(&server)
        .await;

    let config = dataverse(&server.uri());
    let provider = ClientCredentials::from_config(&config).unwrap();
    let err = acquire_token(&provider, &config, &fast_retry())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "AUTH_ERROR");
}
