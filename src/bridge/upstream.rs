//! Hop A: this service as OAuth client of the provider.

use super::{
    access_expiry, provider_error_code, refresh_expiry, AuthorizationCode, BridgeError, Flow,
    OAuthBridge, StateEntry,
};
use crate::credentials::TokenData;
use crate::provider::ProviderError;
use chrono::Utc;
use rand::RngCore;
use reqwest::Url;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Where the user agent goes after a provider callback.
#[derive(Debug, PartialEq)]
pub enum CallbackOutcome {
    /// Direct flow finished; render a success page
    Connected { subject: String },
    /// Bridge flow; redirect to the downstream caller
    Redirect(String),
}

impl OAuthBridge {
    /// Register a CSRF state for `flow` and return the provider authorize URL.
    pub fn start(&self, flow: Flow) -> String {
        let state = Uuid::new_v4().simple().to_string();
        debug!(flow = ?flow, "Starting provider authorization");
        self.states.save(
            state.clone(),
            StateEntry {
                flow,
                created_at: Utc::now(),
            },
        );
        self.provider
            .authorize_url(&state, &self.config.provider_callback_url())
    }

    /// Complete the provider authorization.
    ///
    /// The state is consumed before anything else, so a replayed callback URL
    /// fails with [`BridgeError::InvalidState`].
    pub async fn callback(
        &self,
        code: Option<&str>,
        state: Option<&str>,
        error: Option<&str>,
    ) -> Result<CallbackOutcome, BridgeError> {
        if let Some(provider_error) = error {
            let code = provider_error_code(provider_error);
            warn!(error = %code, "Provider authorization failed");
            let entry = state.and_then(|s| self.states.consume(s));
            if let Some(StateEntry {
                flow: Flow::Bridge { redirect_uri, caller_state },
                ..
            }) = entry
            {
                let mut params = vec![("error", code.to_string())];
                if let Some(caller_state) = caller_state {
                    params.push(("state", caller_state));
                }
                return Ok(CallbackOutcome::Redirect(append_query(&redirect_uri, &params)?));
            }
            return Err(BridgeError::ProviderDenied(provider_error.to_string()));
        }

        let state = state.ok_or(BridgeError::InvalidState)?;
        let entry = self.states.consume(state).ok_or_else(|| {
            warn!("Invalid or expired OAuth state");
            BridgeError::InvalidState
        })?;
        let code = code
            .filter(|c| !c.is_empty())
            .ok_or(BridgeError::InvalidRequest("missing code"))?;

        let tokens = self
            .provider
            .exchange_code(code, &self.config.provider_callback_url())
            .await
            .map_err(|e| {
                error!(error = %e, "Provider token exchange failed");
                BridgeError::Provider(e)
            })?;

        let subject = tokens
            .subject
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                ProviderError::InvalidResponse("token response has no subject".to_string())
            })?;
        let refresh_token = tokens
            .refresh_token
            .clone()
            .ok_or_else(|| {
                ProviderError::InvalidResponse("token response has no refresh token".to_string())
            })?;

        let now = Utc::now();
        let scopes = tokens
            .scope
            .clone()
            .unwrap_or_else(|| self.config.provider.scope.clone());
        let data = TokenData {
            access_token: tokens.access_token.clone(),
            refresh_token,
            expires_at: access_expiry(now, &tokens),
            refresh_expires_at: refresh_expiry(now, &tokens),
            scopes: scopes.clone(),
        };
        self.store.save(&subject, &data).await?;

        info!(subject = %subject, flow = ?entry.flow, "Provider authorization completed");

        match entry.flow {
            Flow::Direct => Ok(CallbackOutcome::Connected { subject }),
            Flow::Bridge {
                redirect_uri,
                caller_state,
            } => {
                let one_time = generate_code();
                self.codes.save(
                    one_time.clone(),
                    AuthorizationCode {
                        subject,
                        scopes,
                        redirect_uri: redirect_uri.clone(),
                        created_at: now,
                    },
                );

                let mut params = vec![("code", one_time)];
                if let Some(caller_state) = caller_state {
                    params.push(("state", caller_state));
                }
                Ok(CallbackOutcome::Redirect(append_query(&redirect_uri, &params)?))
            }
        }
    }
}

/// 256-bit random hex string
fn generate_code() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn append_query(base: &str, params: &[(&str, String)]) -> Result<String, BridgeError> {
    let mut url = Url::parse(base).map_err(|_| BridgeError::InvalidRedirectUri)?;
    {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in params {
            pairs.append_pair(key, value);
        }
    }
    Ok(url.into())
}
