//! reqwest-backed provider client.
//!
//! Token calls post standard OAuth 2.0 forms; resource calls send the access
//! token as a Bearer header. Response bodies are never logged, only status and
//! OAuth error code.

use super::{ItemsQuery, ProviderClient, ProviderConfig, ProviderError, ProviderTokens};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, warn};

/// OAuth token response. Some providers report errors with a 200 and an `error` field.
#[derive(Deserialize, Debug)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default, alias = "open_id", alias = "user_id", alias = "sub")]
    subject: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// HTTP client for the provider's OAuth and resource endpoints.
pub struct HttpProvider {
    config: ProviderConfig,
    http_client: Client,
}

impl HttpProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        let http_client = Client::builder()
            .user_agent(concat!("tokenbridge/", env!("CARGO_PKG_VERSION")))
            .timeout(config.timeout)
            .build()
            .map_err(|e| ProviderError::Transport(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            config,
            http_client,
        })
    }

    async fn token_request(
        &self,
        form: HashMap<&str, &str>,
    ) -> Result<ProviderTokens, ProviderError> {
        let response = self
            .http_client
            .post(&self.config.token_url)
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_error_response(response).await);
        }

        let token_response: TokenResponse = response
            .json()
            .await
            .map_err(|_| ProviderError::InvalidResponse("token response is not JSON".to_string()))?;

        if let Some(code) = token_response.error {
            warn!(code = %code, "Token endpoint reported an error");
            return Err(ProviderError::Rejected {
                status: status.as_u16(),
                code,
            });
        }

        let access_token = token_response
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ProviderError::InvalidResponse("missing access_token".to_string()))?;

        debug!(
            has_refresh_token = token_response.refresh_token.is_some(),
            expires_in = ?token_response.expires_in,
            "Token request successful"
        );

        Ok(ProviderTokens {
            subject: token_response.subject,
            access_token,
            refresh_token: token_response.refresh_token.filter(|t| !t.is_empty()),
            expires_in: token_response.expires_in,
            refresh_expires_in: token_response.refresh_expires_in,
            scope: token_response.scope,
        })
    }

    async fn resource_get(
        &self,
        path: &str,
        access_token: &str,
        query: &[(&str, String)],
    ) -> Result<Value, ProviderError> {
        let url = format!("{}{}", self.config.api_base_url, path);
        let response = self
            .http_client
            .get(&url)
            .bearer_auth(access_token)
            .query(query)
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            return Err(classify_error_response(response).await);
        }

        response
            .json::<Value>()
            .await
            .map_err(|_| {
                ProviderError::InvalidResponse("resource response is not JSON".to_string())
            })
    }
}

#[async_trait]
impl ProviderClient for HttpProvider {
    fn authorize_url(&self, state: &str, redirect_uri: &str) -> String {
        self.config.build_auth_url(state, redirect_uri)
    }

    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<ProviderTokens, ProviderError> {
        let mut form = HashMap::new();
        form.insert("grant_type", "authorization_code");
        form.insert("code", code);
        form.insert("redirect_uri", redirect_uri);
        form.insert("client_id", self.config.client_id.as_str());
        form.insert("client_secret", self.config.client_secret.as_str());

        debug!(token_url = %self.config.token_url, "Exchanging authorization code for token");
        let tokens = self.token_request(form).await?;

        if tokens.subject.as_deref().map_or(true, str::is_empty) {
            return Err(ProviderError::InvalidResponse(
                "token response has no subject".to_string(),
            ));
        }
        Ok(tokens)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<ProviderTokens, ProviderError> {
        let mut form = HashMap::new();
        form.insert("grant_type", "refresh_token");
        form.insert("refresh_token", refresh_token);
        form.insert("client_id", self.config.client_id.as_str());
        form.insert("client_secret", self.config.client_secret.as_str());

        debug!(token_url = %self.config.token_url, "Refreshing provider access token");
        self.token_request(form).await
    }

    async fn fetch_user(
        &self,
        access_token: &str,
        fields: &[String],
    ) -> Result<Value, ProviderError> {
        let mut query = Vec::new();
        if !fields.is_empty() {
            query.push(("fields", fields.join(",")));
        }
        self.resource_get("/user", access_token, &query).await
    }

    async fn list_items(
        &self,
        access_token: &str,
        items: &ItemsQuery,
    ) -> Result<Value, ProviderError> {
        let mut query = vec![("max_count", items.max_count.to_string())];
        if let Some(cursor) = items.cursor {
            query.push(("cursor", cursor.to_string()));
        }
        if !items.fields.is_empty() {
            query.push(("fields", items.fields.join(",")));
        }
        self.resource_get("/items", access_token, &query).await
    }
}

fn transport_error(e: reqwest::Error) -> ProviderError {
    let kind = if e.is_timeout() {
        "timed out"
    } else if e.is_connect() {
        "connection failed"
    } else {
        "request failed"
    };
    warn!(kind, "Provider request failed");
    ProviderError::Transport(kind.to_string())
}

/// Map a non-2xx response to a [`ProviderError`] without exposing its body.
async fn classify_error_response(response: Response) -> ProviderError {
    let status = response.status();
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    let body: Option<Value> = response.json().await.ok();
    let code = body.as_ref().and_then(error_code);

    warn!(status = status.as_u16(), code = ?code, "Provider returned an error status");

    match status {
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited { retry_after },
        StatusCode::UNAUTHORIZED => ProviderError::Unauthorized,
        s if s.is_client_error() => ProviderError::Rejected {
            status: s.as_u16(),
            code: code.unwrap_or_else(|| "unknown_error".to_string()),
        },
        s => ProviderError::Upstream { status: s.as_u16() },
    }
}

/// Pulls an OAuth-style error code from `{"error": "x"}` or `{"error": {"code": "x"}}`.
fn error_code(body: &Value) -> Option<String> {
    match body.get("error")? {
        Value::String(code) => Some(code.clone()),
        Value::Object(obj) => obj.get("code").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}
