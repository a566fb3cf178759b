//! Backend login and token discovery

use serde_json::{json, Value};
use tracing::{error, info};

use super::transport::{HttpTransport, PostRequest};
use crate::config::{BridgeSettings, SettingsStore};
use crate::error::{BridgeError, Result};

/// Field names that may carry the session token
pub const TOKEN_FIELDS: [&str; 5] = ["token", "access_token", "accessToken", "jwt", "id_token"];

/// Nesting levels searched before giving up
pub const MAX_TOKEN_DEPTH: usize = 8;

fn token_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Find a token in an arbitrary JSON body
///
/// Objects are checked for known fields before their nested values are
/// searched; arrays are searched element by element.
pub fn discover_token(body: &Value) -> Option<String> {
    discover_at(body, 0)
}

fn discover_at(value: &Value, depth: usize) -> Option<String> {
    if depth > MAX_TOKEN_DEPTH {
        return None;
    }
    match value {
        Value::Object(map) => {
            for field in TOKEN_FIELDS {
                if let Some(token) = map.get(field).and_then(token_text) {
                    return Some(token);
                }
            }
            map.values().find_map(|v| discover_at(v, depth + 1))
        },
        Value::Array(items) => items.iter().find_map(|v| discover_at(v, depth + 1)),
        _ => None,
    }
}

/// `url` + `/` + `context`, or just `url` without a context
pub fn endpoint_url(settings: &BridgeSettings) -> String {
    let base = settings.url.trim_end_matches('/');
    if settings.context.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, settings.context.trim_start_matches('/'))
    }
}

/// Absolute `authPath` as is, otherwise non-empty parts of url/context/authPath joined by `/`
pub fn auth_url(settings: &BridgeSettings) -> String {
    let auth_path = settings.auth_path.as_str();
    let lower = auth_path.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        return auth_path.to_string();
    }

    let base = settings.url.trim_end_matches('/');
    let context = settings.context.trim_matches('/');
    [base, context, auth_path]
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("/")
}

/// Log in with the stored credentials and persist the returned token
pub async fn authenticate(transport: &HttpTransport, store: &dyn SettingsStore) -> Result<String> {
    let settings = store.load()?;
    let url = auth_url(&settings);

    let (username, password) = match (&settings.username, &settings.password) {
        (Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => (u.clone(), p.clone()),
        _ => return Err(BridgeError::auth("missing username/password in settings")),
    };

    info!("Requesting token from {} for {}", url, username);
    let body = json!({"username": username, "password": password}).to_string();
    let masked = json!({"username": username, "password": "***"}).to_string();

    let mut request = PostRequest::new(&url, body);
    request.recorded_body = Some(masked);
    request.note = Some("auth");
    let reply = transport.post_json(request).await?;

    if reply.status != 200 {
        let preview: String = reply.body.chars().take(200).collect();
        error!("Login failed status={} body={}", reply.status, preview);
        return Err(BridgeError::auth(format!("login failed: {}", reply.status)));
    }

    let token = serde_json::from_str::<Value>(&reply.body)
        .ok()
        .and_then(|body| discover_token(&body))
        .ok_or_else(|| BridgeError::auth("login succeeded but no token found in response"))?;

    store.store_token(&token)?;
    info!("Token refreshed for {}", username);
    Ok(token)
}
