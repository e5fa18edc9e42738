//! Token refresh, grounded on `_auth/_openid.py::ensure_fresh`/`_needs_refresh`.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde_json::Map;

use nmb_http::json::JsonCache;
use nmb_http::proxy::ProxyConfig;

use crate::error::AuthError;
use crate::oidc::IdentityProvider;

/// Returns `(id_token, refresh_token)`, refreshed if `id_token` is within
/// `leeway` seconds of `exp` or otherwise fails the required-claims check.
pub async fn ensure_fresh(
    id_token: &str,
    refresh_token: &str,
    cache: &JsonCache,
    proxy: &ProxyConfig,
    leeway: u64,
) -> Result<(String, String), AuthError> {
    if !needs_refresh(id_token, leeway) {
        return Ok((id_token.to_string(), refresh_token.to_string()));
    }

    let unverified = decode_without_verifying_signature(id_token)?;
    let issuer = unverified
        .get("iss")
        .and_then(|v| v.as_str())
        .ok_or_else(|| AuthError::Provider("ID token has no iss claim".into()))?
        .to_string();
    let client_id = unverified
        .get("aud")
        .and_then(|v| v.as_str())
        .ok_or_else(|| AuthError::Provider("ID token has no aud claim".into()))?
        .to_string();

    let identity_provider = IdentityProvider::from_url(&issuer, cache, proxy).await?;

    let params = [
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
        ("client_id", client_id.as_str()),
    ];
    let response = nmb_http::json::post_form(proxy, &identity_provider.token_endpoint, &params).await?;

    let new_id_token = response
        .get("id_token")
        .and_then(|v| v.as_str())
        .ok_or_else(|| AuthError::Provider("refresh response missing id_token".into()))?
        .to_string();
    let new_refresh_token = response
        .get("refresh_token")
        .and_then(|v| v.as_str())
        .unwrap_or(refresh_token)
        .to_string();

    Ok((new_id_token, new_refresh_token))
}

fn needs_refresh(id_token: &str, leeway: u64) -> bool {
    let mut validation = Validation::new(Algorithm::RS256);
    validation.insecure_disable_signature_validation();
    validation.set_required_spec_claims(&["iss", "sub", "aud", "exp", "iat"]);
    validation.leeway = leeway;
    let dummy_key = DecodingKey::from_secret(&[]);
    decode::<Map<String, serde_json::Value>>(id_token, &dummy_key, &validation).is_err()
}

fn decode_without_verifying_signature(id_token: &str) -> Result<Map<String, serde_json::Value>, AuthError> {
    let mut validation = Validation::new(Algorithm::RS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();
    let dummy_key = DecodingKey::from_secret(&[]);
    let token_data = decode::<Map<String, serde_json::Value>>(id_token, &dummy_key, &validation)?;
    Ok(token_data.claims)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_token_needs_refresh() {
        assert!(needs_refresh("not-a-jwt", 0));
    }
}
