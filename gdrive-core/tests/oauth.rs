use gdrive_core::OAuthClient;
use serde_json::json;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn refresh_token_posts_form_data() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=refresh-1"))
        .and(body_string_contains("client_id=client-id"))
        .and(body_string_contains("client_secret=secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "token",
            "token_type": "Bearer",
            "expires_in": 3599,
            "scope": "https://www.googleapis.com/auth/drive"
        })))
        .mount(&server)
        .await;

    let client =
        OAuthClient::with_token_uri(&format!("{}/token", server.uri()), "client-id", "secret")
            .unwrap();
    let token = client.refresh_token("refresh-1").await.unwrap();

    assert_eq!(token.access_token, "token");
    assert_eq!(token.expires_in, Some(3599));
    assert!(token.refresh_token.is_none());
}

#[tokio::test]
async fn revoked_refresh_token_is_invalid_grant() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "invalid_grant",
            "error_description": "Token has been expired or revoked."
        })))
        .mount(&server)
        .await;

    let client =
        OAuthClient::with_token_uri(&format!("{}/token", server.uri()), "client-id", "secret")
            .unwrap();
    let err = client.refresh_token("refresh-1").await.unwrap_err();

    assert!(err.is_invalid_grant());
}
