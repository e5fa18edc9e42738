//! OIDC discovery and the PKCE authorization-code flow, grounded on
//! `_auth/_openid.py`'s `IdentityProvider`/`AuthRequest`.

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use url::Url;

use nmb_http::json::JsonCache;
use nmb_http::proxy::ProxyConfig;

use crate::error::AuthError;

#[derive(Debug, Clone, Deserialize)]
pub struct IdentityProviderMinimal {
    pub issuer: String,
    pub jwks_uri: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdentityProvider {
    pub issuer: String,
    pub jwks_uri: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
}

impl IdentityProviderMinimal {
    pub async fn from_url(
        issuer_url: &str,
        cache: &JsonCache,
        proxy: &ProxyConfig,
    ) -> Result<Self, AuthError> {
        let config = discover(issuer_url, cache, proxy).await?;
        Ok(serde_json::from_value(config)?)
    }
}

impl IdentityProvider {
    pub async fn from_url(
        issuer_url: &str,
        cache: &JsonCache,
        proxy: &ProxyConfig,
    ) -> Result<Self, AuthError> {
        let config = discover(issuer_url, cache, proxy).await?;
        Ok(serde_json::from_value(config)?)
    }
}

async fn discover(issuer_url: &str, cache: &JsonCache, proxy: &ProxyConfig) -> Result<Value, AuthError> {
    let base = if issuer_url.ends_with('/') { issuer_url.to_string() } else { format!("{issuer_url}/") };
    let config_url = Url::parse(&base)
        .and_then(|u| u.join(".well-known/openid-configuration"))
        .map_err(|e| AuthError::Provider(e.to_string()))?;
    Ok(nmb_http::json::get_json(cache, proxy, config_url.as_str(), None).await?)
}

fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// A single in-flight PKCE login attempt.
pub struct AuthRequest {
    pub client_id: String,
    pub redirect_uri: String,
    pub state: String,
    pub nonce: String,
    pub code_verifier: String,
    pub identity_provider: IdentityProvider,
}

impl AuthRequest {
    pub async fn create(
        issuer_url: &str,
        client_id: &str,
        redirect_uri: &str,
        cache: &JsonCache,
        proxy: &ProxyConfig,
    ) -> Result<Self, AuthError> {
        let identity_provider = IdentityProvider::from_url(issuer_url, cache, proxy).await?;
        Ok(Self {
            client_id: client_id.to_string(),
            redirect_uri: redirect_uri.to_string(),
            state: random_token(),
            nonce: random_token(),
            code_verifier: random_token(),
            identity_provider,
        })
    }

    pub fn login_url(&self) -> Result<String, AuthError> {
        let hashed = Sha256::digest(self.code_verifier.as_bytes());
        let code_challenge = URL_SAFE_NO_PAD.encode(hashed);

        let mut url = Url::parse(&self.identity_provider.authorization_endpoint)
            .map_err(|e| AuthError::Provider(e.to_string()))?;

        // Merge onto any query params the authorization endpoint already
        // carries, with ours taking precedence on key collision.
        let mut merged: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        let auth_params = [
            ("scope", "openid profile email offline_access"),
            ("response_type", "code"),
            ("client_id", self.client_id.as_str()),
            ("redirect_uri", self.redirect_uri.as_str()),
            ("state", self.state.as_str()),
            ("nonce", self.nonce.as_str()),
            ("code_challenge", code_challenge.as_str()),
            ("code_challenge_method", "S256"),
        ];
        for (k, v) in auth_params {
            merged.retain(|(existing_k, _)| existing_k != k);
            merged.push((k.to_string(), v.to_string()));
        }

        url.query_pairs_mut().clear().extend_pairs(&merged);
        Ok(url.to_string())
    }

    /// Exchanges the callback's `{state, code}` for tokens, validating the
    /// returned ID token and its nonce.
    pub async fn request_tokens(
        &self,
        auth_response: &Value,
        cache: &JsonCache,
        proxy: &ProxyConfig,
    ) -> Result<(String, String, serde_json::Map<String, Value>), AuthError> {
        if let Some(error) = auth_response.get("error").and_then(Value::as_str) {
            let msg = match auth_response.get("error_description").and_then(Value::as_str) {
                Some(desc) => format!("{desc} ({error})"),
                None => error.to_string(),
            };
            return Err(AuthError::Provider(msg));
        }

        let code = auth_response.get("code").and_then(Value::as_str).unwrap_or_default();
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.redirect_uri.as_str()),
            ("client_id", self.client_id.as_str()),
            ("code_verifier", self.code_verifier.as_str()),
        ];
        let response =
            nmb_http::json::post_form(proxy, &self.identity_provider.token_endpoint, &params).await?;

        let token_type = response.get("token_type").and_then(Value::as_str).unwrap_or_default();
        if !token_type.eq_ignore_ascii_case("bearer") {
            return Err(AuthError::UnexpectedTokenType(token_type.to_string()));
        }

        let id_token = response
            .get("id_token")
            .and_then(Value::as_str)
            .ok_or_else(|| AuthError::Provider("missing id_token in token response".into()))?
            .to_string();
        let refresh_token = response
            .get("refresh_token")
            .and_then(Value::as_str)
            .ok_or_else(|| AuthError::Provider("missing refresh_token in token response".into()))?
            .to_string();

        let validator = crate::validator::Validator::new(self.client_id.clone(), None);
        let claims = validator.extract_claims(&id_token, cache, proxy, 0).await?;
        if claims.get("nonce").and_then(Value::as_str) != Some(self.nonce.as_str()) {
            return Err(AuthError::NonceMismatch);
        }

        Ok((id_token, refresh_token, claims))
    }
}

pub type SharedCache = Arc<JsonCache>;
