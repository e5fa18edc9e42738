//! JWT validation against an issuer's published JWKS, and the permission
//! rules that turn a claim set into a role set. Grounded on
//! `_auth/_openid.py::Validator` and `_hub.py`'s `require_role` callers.

use std::collections::HashSet;

use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use serde_json::{Map, Value};

use nmb_http::json::JsonCache;
use nmb_http::proxy::ProxyConfig;

use crate::error::AuthError;
use crate::oidc::IdentityProviderMinimal;

/// One `permissions[]` entry from the hub config: a set of required claim
/// values and the roles granted when every one matches.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthPermission {
    pub claims: Map<String, Value>,
    pub roles: Vec<String>,
}

/// A claim value matches a rule value if they're equal, or — when the rule
/// value is a JSON array — if the claim's array is a superset of it.
fn claim_matches(claim_value: Option<&Value>, rule_value: &Value) -> bool {
    let Some(claim_value) = claim_value else { return false };
    match (claim_value, rule_value) {
        (Value::Array(claim_items), Value::Array(rule_items)) => {
            rule_items.iter().all(|required| claim_items.contains(required))
        }
        _ => claim_value == rule_value,
    }
}

fn rule_matches(claims: &Map<String, Value>, rule: &AuthPermission) -> bool {
    rule.claims.iter().all(|(key, expected)| claim_matches(claims.get(key), expected))
}

/// Derives the role set a claim set is granted under a list of permission
/// rules (every matching rule's roles are unioned).
pub fn roles_for_claims(claims: &Map<String, Value>, permissions: &[AuthPermission]) -> HashSet<String> {
    let mut roles = HashSet::new();
    for rule in permissions {
        if rule_matches(claims, rule) {
            roles.extend(rule.roles.iter().cloned());
        }
    }
    roles
}

pub struct Validator {
    client_id: String,
    trusted_issuers: Option<Vec<String>>,
}

impl Validator {
    pub fn new(client_id: String, trusted_issuers: Option<Vec<String>>) -> Self {
        Self { client_id, trusted_issuers }
    }

    /// Validates `id_token`'s signature against its issuer's JWKS, checks
    /// `RS256`/audience/required claims, and returns the decoded claim map.
    pub async fn extract_claims(
        &self,
        id_token: &str,
        cache: &JsonCache,
        proxy: &ProxyConfig,
        leeway: u64,
    ) -> Result<Map<String, Value>, AuthError> {
        let header = jsonwebtoken::decode_header(id_token)?;
        let key_id = header.kid.clone().ok_or_else(|| AuthError::Provider("ID token has no kid".into()))?;

        let unverified = decode_unverified_claims(id_token)?;
        let issuer = unverified
            .get("iss")
            .and_then(Value::as_str)
            .ok_or_else(|| AuthError::Provider("ID token has no iss claim".into()))?
            .to_string();

        if let Some(trusted) = &self.trusted_issuers {
            if !trusted.iter().any(|t| t == &issuer) {
                return Err(AuthError::UntrustedIssuer(issuer));
            }
        }

        let identity_provider = IdentityProviderMinimal::from_url(&issuer, cache, proxy).await?;
        let jwk_set_raw = nmb_http::json::get_json(cache, proxy, &identity_provider.jwks_uri, None).await?;
        let jwk_set: JwkSet = serde_json::from_value(jwk_set_raw)?;

        let jwk = jwk_set
            .keys
            .iter()
            .find(|k| {
                k.common.key_id.as_deref() == Some(key_id.as_str())
                    && matches!(k.common.public_key_use, None | Some(jsonwebtoken::jwk::PublicKeyUse::Signature))
            })
            .ok_or(AuthError::SigningKeyNotFound(key_id))?;

        let decoding_key = DecodingKey::from_jwk(jwk)?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[&self.client_id]);
        validation.set_required_spec_claims(&["sub", "exp", "iat"]);
        validation.leeway = leeway;

        let token_data = decode::<Map<String, Value>>(id_token, &decoding_key, &validation)?;
        Ok(token_data.claims)
    }
}

fn decode_unverified_claims(id_token: &str) -> Result<Map<String, Value>, AuthError> {
    let mut validation = Validation::new(Algorithm::RS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();
    let dummy_key = DecodingKey::from_secret(&[]);
    let token_data = decode::<Map<String, Value>>(id_token, &dummy_key, &validation)?;
    Ok(token_data.claims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rule(claims: Value, roles: &[&str]) -> AuthPermission {
        AuthPermission {
            claims: claims.as_object().unwrap().clone(),
            roles: roles.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn exact_match_grants_role() {
        let rules = vec![rule(json!({"sub": "alice"}), &["exporter"])];
        let claims = json!({"sub": "alice"}).as_object().unwrap().clone();
        assert!(roles_for_claims(&claims, &rules).contains("exporter"));
    }

    #[test]
    fn mismatched_claim_grants_nothing() {
        let rules = vec![rule(json!({"sub": "alice"}), &["exporter"])];
        let claims = json!({"sub": "mallory"}).as_object().unwrap().clone();
        assert!(roles_for_claims(&claims, &rules).is_empty());
    }

    #[test]
    fn list_claim_requires_superset() {
        let rules = vec![rule(json!({"list": [1, 2, 3]}), &["exporter"])];
        assert!(roles_for_claims(&json!({"list": [1, 2, 3, 4]}).as_object().unwrap().clone(), &rules)
            .contains("exporter"));
        assert!(roles_for_claims(&json!({"list": [1, 2]}).as_object().unwrap().clone(), &rules).is_empty());
    }

    #[test]
    fn multiple_matching_rules_union_roles() {
        let rules = vec![
            rule(json!({"sub": "alice"}), &["exporter"]),
            rule(json!({"custom_claim": "x"}), &["importer"]),
        ];
        let claims = json!({"sub": "alice", "custom_claim": "x"}).as_object().unwrap().clone();
        let roles = roles_for_claims(&claims, &rules);
        assert!(roles.contains("exporter"));
        assert!(roles.contains("importer"));
    }
}
