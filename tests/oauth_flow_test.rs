// End-to-end tests for the two-hop OAuth flow.
//
// The router runs in-process via `oneshot`; the provider is a mockito server.

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use chrono::{Duration as ChronoDuration, Utc};
use mockito::{Matcher, Server, ServerGuard};
use reqwest::Url;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokenbridge::api::{create_router, AppState};
use tokenbridge::bridge::OAuthBridge;
use tokenbridge::config::BridgeConfig;
use tokenbridge::credentials::{CredentialStore, FileLock, TokenData};
use tokenbridge::provider::HttpProvider;
use tower::ServiceExt;

const SUBJECT: &str = "open-id-42";

struct TestApp {
    _dir: TempDir,
    router: Router,
    store: Arc<CredentialStore>,
}

fn create_test_app(server: &ServerGuard) -> TestApp {
    let dir = TempDir::new().unwrap();
    let vars: HashMap<&str, String> = HashMap::from([
        (
            "BRIDGE_ENCRYPTION_KEY",
            "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f".to_string(),
        ),
        ("BRIDGE_SIGNING_SECRET", "k8Jd93hQz1LmPw7Xv2Rt6YbN4sCe0GfA".to_string()),
        ("BRIDGE_BASE_URL", "https://bridge.test".to_string()),
        ("BRIDGE_PROVIDER_CLIENT_ID", "provider-client".to_string()),
        ("BRIDGE_PROVIDER_CLIENT_SECRET", "provider-secret".to_string()),
        ("BRIDGE_PROVIDER_AUTHORIZE_URL", format!("{}/authorize", server.url())),
        ("BRIDGE_PROVIDER_TOKEN_URL", format!("{}/token", server.url())),
        ("BRIDGE_PROVIDER_API_URL", server.url()),
        ("BRIDGE_PROVIDER_SCOPE", "user.info.basic,video.list".to_string()),
        ("BRIDGE_CLIENT_ID", "reporting-client".to_string()),
        ("BRIDGE_ALLOWED_REDIRECT_HOSTS", "allowed.test".to_string()),
        ("BRIDGE_RATE_LIMIT_ENABLED", "false".to_string()),
        (
            "BRIDGE_STORE_PATH",
            dir.path().join("data/tokens.json").display().to_string(),
        ),
    ]);
    let config = Arc::new(BridgeConfig::from_lookup(|key| vars.get(key).cloned()).unwrap());

    let lock = FileLock::new(&config.lock_path, Duration::from_secs(5), Duration::from_millis(5));
    let store = Arc::new(
        CredentialStore::new(
            &config.store_path,
            lock,
            config.encryption_key.clone(),
            config.prune_retention(),
        )
        .unwrap(),
    );
    let provider = Arc::new(HttpProvider::new(config.provider.clone()).unwrap());
    let bridge = Arc::new(OAuthBridge::new(config, Arc::clone(&store), provider).unwrap());

    TestApp {
        _dir: dir,
        router: create_router(AppState { bridge }),
        store,
    }
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn get_with_bearer(uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", token))
        .body(Body::empty())
        .unwrap()
}

fn post_form(uri: &str, form: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(form.to_string()))
        .unwrap()
}

fn location(response: &axum::response::Response) -> String {
    response
        .headers()
        .get(header::LOCATION)
        .expect("redirect without Location")
        .to_str()
        .unwrap()
        .to_string()
}

fn query_param(url: &str, name: &str) -> Option<String> {
    Url::parse(url)
        .unwrap()
        .query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

async fn json(response: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

async fn mock_code_exchange(server: &mut ServerGuard) -> mockito::Mock {
    server
        .mock("POST", "/token")
        .match_body(Matcher::AllOf(vec![
            Matcher::UrlEncoded("grant_type".into(), "authorization_code".into()),
            Matcher::UrlEncoded("code".into(), "ABC".into()),
            Matcher::UrlEncoded(
                "redirect_uri".into(),
                "https://bridge.test/auth/provider/callback".into(),
            ),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(format!(
            r#"{{
                "open_id": "{}",
                "access_token": "act.provider.1",
                "refresh_token": "rft.provider.1",
                "expires_in": 86400,
                "refresh_expires_in": 31536000,
                "scope": "user.info.basic,video.list"
            }}"#,
            SUBJECT
        ))
        .create_async()
        .await
}

/// Walks authorize → provider callback → token and returns the token response.
async fn connect(app: &TestApp) -> Value {
    let response = app
        .router
        .clone()
        .oneshot(get(
            "/oauth/authorize?client_id=reporting-client&redirect_uri=https%3A%2F%2Fallowed.test%2Fcb&state=S1&response_type=code",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    let provider_url = location(&response);
    let generated_state = query_param(&provider_url, "state").unwrap();

    let response = app
        .router
        .clone()
        .oneshot(get(&format!(
            "/auth/provider/callback?code=ABC&state={}",
            generated_state
        )))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    let caller_redirect = location(&response);
    assert!(caller_redirect.starts_with("https://allowed.test/cb?"));
    assert_eq!(query_param(&caller_redirect, "state").as_deref(), Some("S1"));
    let code = query_param(&caller_redirect, "code").unwrap();

    let response = app
        .router
        .clone()
        .oneshot(post_form(
            "/oauth/token",
            &format!("grant_type=authorization_code&code={}", code),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get(header::CACHE_CONTROL).unwrap(), "no-store");
    json(response).await
}

/// Stores a credential whose access token is already inside the safety buffer.
async fn seed_expiring_record(store: &CredentialStore) {
    let now = Utc::now();
    store
        .save(
            SUBJECT,
            &TokenData {
                access_token: "act.provider.old".to_string(),
                refresh_token: "rft.provider.old".to_string(),
                expires_at: now + ChronoDuration::seconds(30),
                refresh_expires_at: now + ChronoDuration::days(300),
                scopes: "user.info.basic".to_string(),
            },
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_end_to_end_bridge_flow() {
    let mut server = Server::new_async().await;
    let exchange = mock_code_exchange(&mut server).await;
    let user = server
        .mock("GET", "/user")
        .match_header("authorization", "Bearer act.provider.1")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"data": {"user": {"open_id": "open-id-42", "display_name": "Ada"}}}"#)
        .create_async()
        .await;

    let app = create_test_app(&server);
    let tokens = connect(&app).await;
    exchange.assert_async().await;

    assert_eq!(tokens["token_type"], "Bearer");
    assert_eq!(tokens["expires_in"], 3600);
    assert!(tokens["refresh_token"].as_str().is_some());
    // Provider tokens never reach the downstream client
    assert_ne!(tokens["access_token"], "act.provider.1");

    let access_token = tokens["access_token"].as_str().unwrap();
    let response = app
        .router
        .clone()
        .oneshot(get_with_bearer("/api/provider/user?fields=open_id,display_name", access_token))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json(response).await;
    assert_eq!(body["data"]["user"]["display_name"], "Ada");
    user.assert_async().await;

    // Stored at rest encrypted
    let raw = std::fs::read_to_string(app.store.path()).unwrap();
    assert!(raw.contains(SUBJECT));
    assert!(!raw.contains("act.provider.1"));
    assert!(!raw.contains("rft.provider.1"));
}

#[tokio::test]
async fn test_callback_replay_rejected() {
    let mut server = Server::new_async().await;
    let _exchange = mock_code_exchange(&mut server).await;
    let app = create_test_app(&server);

    let response = app.router.clone().oneshot(get("/auth/provider/start")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    let state = query_param(&location(&response), "state").unwrap();
    let callback = format!("/auth/provider/callback?code=ABC&state={}", state);

    let response = app.router.clone().oneshot(get(&callback)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.router.clone().oneshot(get(&callback)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json(response).await["error"], "invalid_state");
}

#[tokio::test]
async fn test_provider_denial_redirects_to_caller() {
    let server = Server::new_async().await;
    let app = create_test_app(&server);

    let response = app
        .router
        .clone()
        .oneshot(get(
            "/oauth/authorize?client_id=reporting-client&redirect_uri=https%3A%2F%2Fallowed.test%2Fcb&state=S9&response_type=code",
        ))
        .await
        .unwrap();
    let state = query_param(&location(&response), "state").unwrap();

    let response = app
        .router
        .clone()
        .oneshot(get(&format!(
            "/auth/provider/callback?error=access_denied&error_description=nope&state={}",
            state
        )))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    let redirect = location(&response);
    assert_eq!(query_param(&redirect, "error").as_deref(), Some("access_denied"));
    assert_eq!(query_param(&redirect, "state").as_deref(), Some("S9"));
}

#[tokio::test]
async fn test_authorize_rejects_foreign_redirect_host() {
    let server = Server::new_async().await;
    let app = create_test_app(&server);

    let response = app
        .router
        .clone()
        .oneshot(get(
            "/oauth/authorize?client_id=reporting-client&redirect_uri=https%3A%2F%2Fevil.test%2Fcb&state=S1&response_type=code",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(response.headers().get(header::LOCATION).is_none());
    assert_eq!(json(response).await["error"], "invalid_redirect_uri");
}

#[tokio::test]
async fn test_token_endpoint_accepts_json_refresh_grant() {
    let mut server = Server::new_async().await;
    let _exchange = mock_code_exchange(&mut server).await;
    let app = create_test_app(&server);
    let tokens = connect(&app).await;

    let request = Request::builder()
        .method("POST")
        .uri("/oauth/token")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            serde_json::json!({
                "grant_type": "refresh_token",
                "refresh_token": tokens["refresh_token"],
            })
            .to_string(),
        ))
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let refreshed = json(response).await;
    assert_eq!(refreshed["refresh_token"], tokens["refresh_token"]);

    // An access token is not a refresh grant
    let response = app
        .router
        .clone()
        .oneshot(post_form(
            "/oauth/token",
            &format!(
                "grant_type=refresh_token&refresh_token={}",
                tokens["access_token"].as_str().unwrap()
            ),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json(response).await["error"], "invalid_grant");
}

#[tokio::test]
async fn test_resource_requires_bearer_token() {
    let server = Server::new_async().await;
    let app = create_test_app(&server);

    let response = app.router.clone().oneshot(get("/api/provider/user")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().get(header::WWW_AUTHENTICATE).is_some());
    assert_eq!(json(response).await["error"], "invalid_token");

    let response = app
        .router
        .clone()
        .oneshot(get_with_bearer("/api/provider/user", "not-a-jwt"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_refresh_on_read_then_items() {
    let mut server = Server::new_async().await;
    let _exchange = mock_code_exchange(&mut server).await;
    let app = create_test_app(&server);
    let tokens = connect(&app).await;
    let access_token = tokens["access_token"].as_str().unwrap().to_string();

    seed_expiring_record(&app.store).await;
    let refresh = server
        .mock("POST", "/token")
        .match_body(Matcher::AllOf(vec![
            Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
            Matcher::UrlEncoded("refresh_token".into(), "rft.provider.old".into()),
        ]))
        .with_status(200)
        .with_body(r#"{"access_token": "act.provider.2", "refresh_token": "rft.provider.2", "expires_in": 86400}"#)
        .expect(1)
        .create_async()
        .await;
    let items = server
        .mock("GET", "/items")
        .match_header("authorization", "Bearer act.provider.2")
        .match_query(Matcher::UrlEncoded("max_count".into(), "5".into()))
        .with_status(200)
        .with_body(r#"{"data": {"items": [{"id": "v1"}], "has_more": false}}"#)
        .expect(2)
        .create_async()
        .await;

    for _ in 0..2 {
        let response = app
            .router
            .clone()
            .oneshot(get_with_bearer("/api/provider/items?max_count=5", &access_token))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await["data"]["items"][0]["id"], "v1");
    }

    refresh.assert_async().await;
    items.assert_async().await;

    let record = app.store.get(SUBJECT).await.unwrap().unwrap();
    assert_eq!(record.access_token, "act.provider.2");
    assert_eq!(record.refresh_token, "rft.provider.2");
}

#[tokio::test]
async fn test_rejected_refresh_requires_reconnect() {
    let mut server = Server::new_async().await;
    let _exchange = mock_code_exchange(&mut server).await;
    let app = create_test_app(&server);
    let tokens = connect(&app).await;

    seed_expiring_record(&app.store).await;
    let _refresh = server
        .mock("POST", "/token")
        .match_body(Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()))
        .with_status(400)
        .with_body(r#"{"error": "invalid_grant"}"#)
        .create_async()
        .await;

    let response = app
        .router
        .clone()
        .oneshot(get_with_bearer("/api/provider/user", tokens["access_token"].as_str().unwrap()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json(response).await["error"], "refresh_rejected");
}

#[tokio::test]
async fn test_provider_rate_limit_is_surfaced() {
    let mut server = Server::new_async().await;
    let _exchange = mock_code_exchange(&mut server).await;
    let _user = server
        .mock("GET", "/user")
        .match_query(Matcher::Any)
        .with_status(429)
        .with_header("retry-after", "17")
        .create_async()
        .await;
    let app = create_test_app(&server);
    let tokens = connect(&app).await;

    let response = app
        .router
        .clone()
        .oneshot(get_with_bearer("/api/provider/user", tokens["access_token"].as_str().unwrap()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "17");
    assert_eq!(json(response).await["error"], "provider_rate_limited");
}

#[tokio::test]
async fn test_provider_unauthorized_with_error_body_is_surfaced() {
    let mut server = Server::new_async().await;
    let _exchange = mock_code_exchange(&mut server).await;
    let _user = server
        .mock("GET", "/user")
        .match_query(Matcher::Any)
        .with_status(401)
        .with_header("content-type", "application/json")
        .with_body(r#"{"error": {"code": "access_token_invalid"}}"#)
        .create_async()
        .await;
    let app = create_test_app(&server);
    let tokens = connect(&app).await;

    let response = app
        .router
        .clone()
        .oneshot(get_with_bearer("/api/provider/user", tokens["access_token"].as_str().unwrap()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json(response).await["error"], "provider_unauthorized");
}

#[tokio::test]
async fn test_invalid_items_parameters() {
    let mut server = Server::new_async().await;
    let _exchange = mock_code_exchange(&mut server).await;
    let app = create_test_app(&server);
    let tokens = connect(&app).await;
    let access_token = tokens["access_token"].as_str().unwrap();

    for uri in [
        "/api/provider/items?max_count=50",
        "/api/provider/items?cursor=-3",
        "/api/provider/items?fields=id,Title",
    ] {
        let response = app
            .router
            .clone()
            .oneshot(get_with_bearer(uri, access_token))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{}", uri);
        assert_eq!(json(response).await["error"], "invalid_parameter");
    }
}

#[tokio::test]
async fn test_status_and_revoke() {
    let mut server = Server::new_async().await;
    let _exchange = mock_code_exchange(&mut server).await;
    let app = create_test_app(&server);
    let tokens = connect(&app).await;
    let access_token = tokens["access_token"].as_str().unwrap();

    let response = app
        .router
        .clone()
        .oneshot(get_with_bearer("/api/connector/status", access_token))
        .await
        .unwrap();
    let status = json(response).await;
    assert_eq!(status["connected"], true);
    assert_eq!(status["record"]["subject"], SUBJECT);
    assert_eq!(status["record"]["access_token_preview"], "act.pr...");
    assert!(!status.to_string().contains("act.provider.1"));

    let revoke = Request::builder()
        .method("POST")
        .uri("/api/connector/revoke")
        .header(header::AUTHORIZATION, format!("Bearer {}", access_token))
        .body(Body::empty())
        .unwrap();
    let response = app.router.clone().oneshot(revoke).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json(response).await["revoked"], true);

    let response = app
        .router
        .clone()
        .oneshot(get_with_bearer("/api/provider/user", access_token))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json(response).await["error"], "invalid_subject");
}
