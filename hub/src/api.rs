//! The REST surface alongside `/ws`: place listing, OIDC discovery info for
//! clients, and the OIDC redirect-back endpoint. Grounded on `_hub.py`'s
//! `aiohttp` routes, generalized per spec.md §4.4/§6.

use std::collections::HashMap;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::{json, Value};

use crate::state::Hub;

pub async fn get_places(State(hub): State<Hub>) -> impl IntoResponse {
    Json(json!({ "places": hub.get_places() }))
}

pub async fn get_auth_info(State(hub): State<Hub>) -> impl IntoResponse {
    match &hub.auth_config {
        Some(auth) => {
            let show_claims = auth.issuers.get(&auth.issuer).and_then(|o| o.show_claims.clone());
            Json(json!({
                "issuer": auth.issuer,
                "client_id": auth.client_id,
                "show_claims": show_claims,
            }))
        }
        None => Json(Value::Object(Default::default())),
    }
}

pub async fn oidc_callback(
    State(hub): State<Hub>,
    Query(query): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(state) = query.get("state") else {
        return (StatusCode::BAD_REQUEST, "missing state parameter").into_response();
    };

    if let Some(error) = query.get("error") {
        let description = query.get("error_description").cloned().unwrap_or_default();
        hub.resolve_oidc_callback_error(state, error, &description);
        return (StatusCode::OK, "Authentication failed. You may close this window.").into_response();
    }

    let code = query.get("code").cloned().unwrap_or_default();
    if hub.resolve_oidc_callback(state, &code) {
        (StatusCode::OK, "Authentication complete. You may close this window.").into_response()
    } else {
        (StatusCode::NOT_FOUND, "Unknown or expired login attempt.").into_response()
    }
}
