use anyhow::{Context, Result};
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::transport::{ApiBody, ApiReply, ApiRequest, Encoding};

/// Proxy client for the upstream medical-records API.
///
/// Every call resolves to an [`ApiReply`]; transport failures are folded into
/// `ApiReply::NoResponse` and HTTP statuses are returned as-is for the caller to
/// interpret. Calls are never retried.
#[derive(Debug, Clone)]
pub struct ApiClient {
    base_url: String,
    timeout: Duration,
    http_client: Client,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .context("building upstream http client")?;

        let base_url = base_url.into().trim_end_matches('/').to_string();
        debug!(base_url = %base_url, timeout_secs = timeout.as_secs(), "upstream client initialized");

        Ok(Self {
            base_url,
            timeout,
            http_client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn url_for(&self, endpoint: &str) -> String {
        format!("{}{}", self.base_url, endpoint)
    }

    pub async fn call(&self, request: ApiRequest) -> ApiReply {
        let url = self.url_for(&request.endpoint);
        let mut builder = self
            .http_client
            .request(request.method.as_reqwest(), &url);

        if let Some(token) = request.token.as_deref() {
            builder = builder.bearer_auth(token);
        }

        builder = match (request.encoding, request.payload.as_ref()) {
            (Encoding::Json, Some(payload)) => builder.json(payload),
            (Encoding::Json, None) => builder.header(CONTENT_TYPE, "application/json"),
            (Encoding::Form, Some(payload)) => builder.form(&form_pairs(payload)),
            (Encoding::Form, None) => builder,
        };

        trace!(
            method = %request.method,
            endpoint = %request.endpoint,
            encoding = %request.encoding,
            token_present = request.token.is_some(),
            "sending upstream request"
        );

        let started = Instant::now();
        let response = match builder.send().await {
            Ok(response) => response,
            Err(err) => {
                let reason = transport_reason(&err);
                warn!(
                    method = %request.method,
                    endpoint = %request.endpoint,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    reason = %reason,
                    "upstream request got no response"
                );
                return ApiReply::NoResponse { reason };
            }
        };

        let status = response.status();
        let body = match response.bytes().await {
            Ok(bytes) => ApiBody::parse(&bytes),
            Err(err) => {
                warn!(
                    endpoint = %request.endpoint,
                    status = status.as_u16(),
                    error = %err,
                    "failed to read upstream response body"
                );
                ApiBody::Empty
            }
        };

        debug!(
            method = %request.method,
            endpoint = %request.endpoint,
            status = status.as_u16(),
            token_present = request.token.is_some(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "upstream response"
        );

        ApiReply::Response { status, body }
    }
}

fn transport_reason(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        "timeout".to_string()
    } else if err.is_connect() {
        "connection failed".to_string()
    } else if err.is_builder() {
        "invalid request".to_string()
    } else {
        "request failed".to_string()
    }
}

/// Flatten a JSON object into form fields. Nulls are omitted.
fn form_pairs(payload: &Value) -> Vec<(String, String)> {
    let Some(map) = payload.as_object() else {
        return Vec::new();
    };
    map.iter()
        .filter_map(|(key, value)| {
            let text = match value {
                Value::Null => return None,
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            Some((key.clone(), text))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ApiMethod;
    use mockito::{Matcher, Server};
    use reqwest::StatusCode;
    use serde_json::json;

    fn client_for(url: &str) -> ApiClient {
        ApiClient::new(url, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn bearer_header_attached_when_token_present() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/patient/profile")
            .match_header("Authorization", Matcher::Exact("Bearer abc123".into()))
            .with_status(200)
            .with_body(r#"{"name":"Anna","surname":"Petrova"}"#)
            .create_async()
            .await;

        let reply = client_for(&server.url())
            .call(ApiRequest::get("/patient/profile").token(Some("abc123".into())))
            .await;

        mock.assert_async().await;
        assert_eq!(reply.status(), Some(StatusCode::OK));
    }

    #[tokio::test]
    async fn no_authorization_header_without_token() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/patient/profile")
            .match_header("Authorization", Matcher::Missing)
            .with_status(401)
            .create_async()
            .await;

        let reply = client_for(&server.url())
            .call(ApiRequest::get("/patient/profile"))
            .await;

        mock.assert_async().await;
        assert!(reply.is_unauthorized());
    }

    #[tokio::test]
    async fn form_encoding_sends_urlencoded_body() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/auth/login")
            .match_header(
                "content-type",
                Matcher::Regex("^application/x-www-form-urlencoded".into()),
            )
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("username".into(), "doc@example.com".into()),
                Matcher::UrlEncoded("password".into(), "whatever".into()),
            ]))
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let request = ApiRequest::post("/auth/login")
            .payload(&json!({"username": "doc@example.com", "password": "whatever"}))
            .unwrap()
            .encoding(Encoding::Form);
        let reply = client_for(&server.url()).call(request).await;

        mock.assert_async().await;
        assert_eq!(reply.status(), Some(StatusCode::OK));
    }

    #[tokio::test]
    async fn json_encoding_sends_json_body() {
        let mut server = Server::new_async().await;
        let payload = json!({"glucose": 5.4, "pulse": 71, "weight": null});
        let mock = server
            .mock("POST", "/patient/measurements")
            .match_header("content-type", "application/json")
            .match_body(Matcher::Json(payload.clone()))
            .with_status(201)
            .create_async()
            .await;

        let request = ApiRequest::new(ApiMethod::Post, "/patient/measurements")
            .payload(&payload)
            .unwrap()
            .token(Some("t".into()));
        let reply = client_for(&server.url()).call(request).await;

        mock.assert_async().await;
        assert_eq!(
            reply,
            ApiReply::Response {
                status: StatusCode::CREATED,
                body: ApiBody::Empty
            }
        );
    }

    #[tokio::test]
    async fn non_json_error_body_is_kept_as_text() {
        let mut server = Server::new_async().await;
        server
            .mock("DELETE", "/patient/complaints/4")
            .with_status(500)
            .with_body("Internal Server Error")
            .create_async()
            .await;

        let reply = client_for(&server.url())
            .call(ApiRequest::delete("/patient/complaints/4"))
            .await;

        assert_eq!(
            reply,
            ApiReply::Response {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                body: ApiBody::Text("Internal Server Error".into())
            }
        );
    }

    #[tokio::test]
    async fn unreachable_upstream_yields_no_response() {
        // Bind then drop to get a port nobody listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let reply = client_for(&format!("http://{addr}"))
            .call(ApiRequest::get("/patient/profile"))
            .await;

        assert!(matches!(reply, ApiReply::NoResponse { .. }));
    }

    #[tokio::test]
    async fn silent_upstream_times_out_within_bound() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let client = ApiClient::new(format!("http://{addr}"), Duration::from_secs(1)).unwrap();
        let started = Instant::now();
        let reply = client.call(ApiRequest::get("/patient/measurements")).await;

        assert_eq!(
            reply,
            ApiReply::NoResponse {
                reason: "timeout".into()
            }
        );
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn form_pairs_skip_nulls() {
        let pairs = form_pairs(&json!({"a": "x", "b": 3, "c": null}));
        assert_eq!(
            pairs,
            vec![("a".to_string(), "x".to_string()), ("b".to_string(), "3".to_string())]
        );
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let client = client_for("http://localhost:5000/");
        assert_eq!(client.url_for("/auth/login"), "http://localhost:5000/auth/login");
    }
}
