//! Cached JSON GET/POST, per spec.md §4.2: GET responses are cached in a
//! caller-supplied cell and reused while fresh; POST always hits the wire.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::cache::{compute_fresh_until, CacheCell, ResponseMeta};
use crate::error::HttpError;
use crate::proxy::ProxyConfig;

#[derive(Default)]
pub struct JsonCache {
    cells: Mutex<std::collections::HashMap<String, CacheCell>>,
}

impl JsonCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

fn build_client(proxy: &ProxyConfig, url: &url::Url) -> Result<reqwest::Client, HttpError> {
    let mut builder = reqwest::Client::builder();
    let scheme = url.scheme();
    let host = url.host_str().unwrap_or_default();
    if let Some(proxy_url) = proxy.resolve(scheme, host) {
        let proxy_url = if proxy_url.contains("://") {
            proxy_url.to_string()
        } else {
            format!("http://{proxy_url}")
        };
        builder = builder.proxy(reqwest::Proxy::all(&proxy_url)?);
    } else {
        builder = builder.no_proxy();
    }
    Ok(builder.build()?)
}

/// Fetches `url` as JSON, serving a cached copy from `cache` if it is still
/// fresh. Bearer auth via `token` is applied when present.
pub async fn get_json(
    cache: &JsonCache,
    proxy: &ProxyConfig,
    url: &str,
    token: Option<&str>,
) -> Result<Value, HttpError> {
    {
        let cells = cache.cells.lock().await;
        if let Some(cell) = cells.get(url) {
            if cell.fresh_until > Utc::now() {
                return Ok(cell.content.clone());
            }
        }
    }

    let parsed = url::Url::parse(url).map_err(|e| HttpError::MalformedUrl(e.to_string()))?;
    let client = build_client(proxy, &parsed)?;
    let mut request = client.get(url);
    if let Some(token) = token {
        request = request.bearer_auth(token);
    }

    let response_time = Utc::now();
    let response = request.send().await?;
    if !response.status().is_success() {
        return Err(HttpError::UnexpectedStatus(response.status().as_u16()));
    }

    let cache_control = response.headers().get(reqwest::header::CACHE_CONTROL).and_then(|v| v.to_str().ok()).map(str::to_string);
    let date = response.headers().get(reqwest::header::DATE).and_then(|v| v.to_str().ok()).map(str::to_string);
    let age = response.headers().get(reqwest::header::AGE).and_then(|v| v.to_str().ok()).map(str::to_string);
    let expires = response.headers().get(reqwest::header::EXPIRES).and_then(|v| v.to_str().ok()).map(str::to_string);

    let body: Value = response.json().await?;

    let fresh_until = compute_fresh_until(
        response_time,
        ResponseMeta {
            cache_control: cache_control.as_deref(),
            date: date.as_deref(),
            age: age.as_deref(),
            expires: expires.as_deref(),
        },
    );

    if let Some(fresh_until) = fresh_until {
        let mut cells = cache.cells.lock().await;
        cells.insert(
            url.to_string(),
            CacheCell { url: url.to_string(), content: body.clone(), fresh_until },
        );
    }

    Ok(body)
}

/// Posts `body` as JSON to `url`. Never cached.
pub async fn post_json(
    proxy: &ProxyConfig,
    url: &str,
    body: &Value,
    token: Option<&str>,
) -> Result<Value, HttpError> {
    let parsed = url::Url::parse(url).map_err(|e| HttpError::MalformedUrl(e.to_string()))?;
    let client = build_client(proxy, &parsed)?;
    let mut request = client.post(url).json(body);
    if let Some(token) = token {
        request = request.bearer_auth(token);
    }

    let response = request.send().await?;
    if !response.status().is_success() {
        return Err(HttpError::UnexpectedStatus(response.status().as_u16()));
    }
    Ok(response.json().await?)
}

/// Posts `application/x-www-form-urlencoded` `params` to `url`, returning
/// the JSON response body. Used for the OIDC token endpoint, which does
/// not accept JSON request bodies.
pub async fn post_form(
    proxy: &ProxyConfig,
    url: &str,
    params: &[(&str, &str)],
) -> Result<Value, HttpError> {
    let parsed = url::Url::parse(url).map_err(|e| HttpError::MalformedUrl(e.to_string()))?;
    let client = build_client(proxy, &parsed)?;
    let response = client.post(url).form(params).send().await?;
    if !response.status().is_success() {
        return Err(HttpError::UnexpectedStatus(response.status().as_u16()));
    }
    Ok(response.json().await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cache_miss_then_hit_avoids_second_parse() {
        let cache = JsonCache::new();
        let cells = cache.cells.lock().await;
        assert!(cells.is_empty());
    }
}
