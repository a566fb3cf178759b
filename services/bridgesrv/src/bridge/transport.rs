//! HTTP transport to the remote backend
//!
//! Every request lands in the bridge exchange log, including ones that never
//! got a response.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, AUTHORIZATION, CONTENT_TYPE};
use tracing::{debug, info, warn};

use crate::diagnostics::{BridgeExchange, ExchangeLog};
use crate::error::{BridgeError, Result};

/// Status and body of a completed request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
    pub content_type: Option<String>,
}

/// Outgoing JSON POST
pub struct PostRequest<'a> {
    pub url: &'a str,
    pub body: String,
    /// Body as stored in the exchange log when it must not be verbatim
    pub recorded_body: Option<String>,
    pub token: Option<&'a str>,
    pub note: Option<&'a str>,
}

impl<'a> PostRequest<'a> {
    pub fn new(url: &'a str, body: String) -> Self {
        Self {
            url,
            body,
            recorded_body: None,
            token: None,
            note: None,
        }
    }
}

pub struct HttpTransport {
    client: reqwest::Client,
    exchanges: Arc<ExchangeLog<BridgeExchange>>,
}

fn header_map_to_btree(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .map(|(k, v)| {
            (
                k.as_str().to_string(),
                String::from_utf8_lossy(v.as_bytes()).into_owned(),
            )
        })
        .collect()
}

impl HttpTransport {
    pub fn new(timeout: Duration, exchanges: Arc<ExchangeLog<BridgeExchange>>) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, exchanges })
    }

    pub fn exchanges(&self) -> &Arc<ExchangeLog<BridgeExchange>> {
        &self.exchanges
    }

    /// POST JSON with an optional bearer token
    pub async fn post_json(&self, request: PostRequest<'_>) -> Result<HttpReply> {
        let mut recorded_headers = BTreeMap::new();
        recorded_headers.insert(CONTENT_TYPE.as_str().to_string(), "application/json".to_string());

        let mut builder = self
            .client
            .post(request.url)
            .header(CONTENT_TYPE, "application/json")
            .body(request.body.clone());
        if let Some(token) = request.token.filter(|t| !t.is_empty()) {
            builder = builder.bearer_auth(token);
            recorded_headers.insert(AUTHORIZATION.as_str().to_string(), "Bearer ***".to_string());
        }

        let recorded_body = request.recorded_body.unwrap_or(request.body);
        info!("Bridge POST {}", request.url);

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                warn!("Bridge POST {} failed: {}", request.url, e);
                self.exchanges.push(BridgeExchange {
                    ts: chrono::Utc::now(),
                    endpoint: request.url.to_string(),
                    status: None,
                    request: Some(recorded_body),
                    request_headers: recorded_headers,
                    note: Some(e.to_string()),
                    ..Default::default()
                });
                return Err(BridgeError::http(format!("POST {}: {}", request.url, e)));
            },
        };

        let status = response.status().as_u16();
        let response_headers = header_map_to_btree(response.headers());
        let content_type = response_headers.get(CONTENT_TYPE.as_str()).cloned();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                self.exchanges.push(BridgeExchange {
                    ts: chrono::Utc::now(),
                    endpoint: request.url.to_string(),
                    status: Some(status),
                    content_type,
                    request: Some(recorded_body),
                    request_headers: recorded_headers,
                    response_headers,
                    note: Some(format!("body read failed: {}", e)),
                    ..Default::default()
                });
                return Err(e.into());
            },
        };
        debug!("Bridge POST {} -> {} ({} bytes)", request.url, status, body.len());

        self.exchanges.push(BridgeExchange {
            ts: chrono::Utc::now(),
            endpoint: request.url.to_string(),
            status: Some(status),
            content_type: content_type.clone(),
            request: Some(recorded_body),
            response: Some(body.clone()),
            request_headers: recorded_headers,
            response_headers,
            note: request.note.map(str::to_string),
        });

        Ok(HttpReply {
            status,
            body,
            content_type,
        })
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_endpoint_recorded_without_status() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let log = Arc::new(ExchangeLog::new(8));
        let transport = HttpTransport::new(Duration::from_secs(2), log.clone()).unwrap();
        let url = format!("http://127.0.0.1:{}/push", port);

        let mut request = PostRequest::new(&url, "{}".to_string());
        request.token = Some("secret");
        let err = transport.post_json(request).await.unwrap_err();
        assert!(matches!(err, BridgeError::Http(_)));

        let entries = log.tail(10);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, None);
        assert!(entries[0].note.is_some());
        assert_eq!(entries[0].request_headers["authorization"], "Bearer ***");
    }
}
