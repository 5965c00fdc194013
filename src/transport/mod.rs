pub mod api_client;
pub mod upstream;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;

/// HTTP verbs the upstream API is called with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl ApiMethod {
    pub fn as_reqwest(self) -> reqwest::Method {
        match self {
            ApiMethod::Get => reqwest::Method::GET,
            ApiMethod::Post => reqwest::Method::POST,
            ApiMethod::Put => reqwest::Method::PUT,
            ApiMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

impl fmt::Display for ApiMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_reqwest().as_str())
    }
}

/// Request body encoding. Token endpoints take form data, everything else JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    Form,
    #[default]
    Json,
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Encoding::Form => f.write_str("form"),
            Encoding::Json => f.write_str("json"),
        }
    }
}

/// One outbound call against the upstream API.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: ApiMethod,
    pub endpoint: String,
    pub payload: Option<Value>,
    pub token: Option<String>,
    pub encoding: Encoding,
}

impl ApiRequest {
    pub fn new(method: ApiMethod, endpoint: impl Into<String>) -> Self {
        Self {
            method,
            endpoint: endpoint.into(),
            payload: None,
            token: None,
            encoding: Encoding::default(),
        }
    }

    pub fn get(endpoint: impl Into<String>) -> Self {
        Self::new(ApiMethod::Get, endpoint)
    }

    pub fn post(endpoint: impl Into<String>) -> Self {
        Self::new(ApiMethod::Post, endpoint)
    }

    pub fn put(endpoint: impl Into<String>) -> Self {
        Self::new(ApiMethod::Put, endpoint)
    }

    pub fn delete(endpoint: impl Into<String>) -> Self {
        Self::new(ApiMethod::Delete, endpoint)
    }

    /// Attach a typed payload; it is encoded according to `encoding` at send time.
    pub fn payload<T: Serialize + ?Sized>(mut self, payload: &T) -> Result<Self, ApiError> {
        let value = serde_json::to_value(payload).map_err(|e| ApiError::Payload(e.to_string()))?;
        self.payload = Some(value);
        Ok(self)
    }

    pub fn token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }
}

/// Response body as received: JSON when it parses, raw text otherwise.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiBody {
    Empty,
    Json(Value),
    Text(String),
}

impl ApiBody {
    pub fn parse(bytes: &[u8]) -> Self {
        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return ApiBody::Empty;
        }
        match serde_json::from_slice::<Value>(bytes) {
            Ok(value) => ApiBody::Json(value),
            Err(_) => ApiBody::Text(String::from_utf8_lossy(bytes).into_owned()),
        }
    }

    pub fn into_json<T: DeserializeOwned>(self) -> Result<T, ApiError> {
        let value = match self {
            ApiBody::Json(value) => value,
            ApiBody::Empty => Value::Null,
            ApiBody::Text(_) => {
                return Err(ApiError::Payload("expected a JSON body".to_string()));
            }
        };
        serde_json::from_value(value).map_err(|e| ApiError::Payload(e.to_string()))
    }
}

/// Raw outcome of a proxy call. HTTP errors are data here, not failures.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiReply {
    Response { status: StatusCode, body: ApiBody },
    NoResponse { reason: String },
}

impl ApiReply {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ApiReply::Response { status, .. } => Some(*status),
            ApiReply::NoResponse { .. } => None,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(StatusCode::UNAUTHORIZED)
    }

    /// Classify the reply: 2xx passes through, everything else becomes an `ApiError`.
    pub fn into_result(self) -> Result<ApiResponse, ApiError> {
        match self {
            ApiReply::NoResponse { reason } => Err(ApiError::Unavailable(reason)),
            ApiReply::Response { status, body } if status.is_success() => {
                Ok(ApiResponse { status, body })
            }
            ApiReply::Response { status, .. } if status == StatusCode::UNAUTHORIZED => {
                Err(ApiError::Unauthorized)
            }
            ApiReply::Response { status, .. } if status == StatusCode::BAD_REQUEST => {
                Err(ApiError::BadRequest)
            }
            ApiReply::Response { status, .. } => Err(ApiError::Upstream { status }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: ApiBody,
}

impl ApiResponse {
    pub fn json<T: DeserializeOwned>(self) -> Result<T, ApiError> {
        self.body.into_json()
    }
}

/// Failure classes surfaced to route handlers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    #[error("upstream unavailable: {0}")]
    Unavailable(String),
    #[error("session expired")]
    SessionExpired,
    #[error("upstream rejected the credentials")]
    Unauthorized,
    #[error("upstream rejected the request input")]
    BadRequest,
    #[error("upstream failed with status {status}")]
    Upstream { status: StatusCode },
    #[error("unexpected upstream payload: {0}")]
    Payload(String),
}

impl ApiError {
    /// Message safe to show to the end user. Never includes upstream bodies.
    pub fn user_message(&self) -> &'static str {
        match self {
            ApiError::Unavailable(_) => "The service is temporarily unavailable, please try again later",
            ApiError::SessionExpired => "Your session has expired, please sign in again",
            ApiError::Unauthorized => "Invalid login or password",
            ApiError::BadRequest => "The request was rejected, please check the entered data",
            ApiError::Upstream { .. } | ApiError::Payload(_) => "The operation failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn body_parse_prefers_json() {
        assert_eq!(ApiBody::parse(b"[]"), ApiBody::Json(json!([])));
        assert_eq!(ApiBody::parse(b"  "), ApiBody::Empty);
        assert_eq!(
            ApiBody::parse(b"<html>oops</html>"),
            ApiBody::Text("<html>oops</html>".to_string())
        );
    }

    #[test]
    fn reply_classification() {
        let ok = ApiReply::Response {
            status: StatusCode::CREATED,
            body: ApiBody::Empty,
        };
        assert_eq!(ok.into_result().unwrap().status, StatusCode::CREATED);

        let unauthorized = ApiReply::Response {
            status: StatusCode::UNAUTHORIZED,
            body: ApiBody::Text("nope".into()),
        };
        assert!(unauthorized.is_unauthorized());
        assert_eq!(unauthorized.into_result(), Err(ApiError::Unauthorized));

        let duplicate = ApiReply::Response {
            status: StatusCode::BAD_REQUEST,
            body: ApiBody::Json(json!({"detail": "exists"})),
        };
        assert_eq!(duplicate.into_result(), Err(ApiError::BadRequest));

        let broken = ApiReply::Response {
            status: StatusCode::BAD_GATEWAY,
            body: ApiBody::Empty,
        };
        assert_eq!(
            broken.into_result(),
            Err(ApiError::Upstream {
                status: StatusCode::BAD_GATEWAY
            })
        );

        let gone = ApiReply::NoResponse {
            reason: "timeout".into(),
        };
        assert_eq!(gone.status(), None);
        assert!(matches!(gone.into_result(), Err(ApiError::Unavailable(_))));
    }

    #[test]
    fn user_messages_do_not_leak_details() {
        let err = ApiError::Payload("secret upstream text".into());
        assert!(!err.user_message().contains("secret"));
        let err = ApiError::Unavailable("dns error: internal-host".into());
        assert!(!err.user_message().contains("internal-host"));
    }

    #[test]
    fn empty_array_decodes_to_empty_vec() {
        let items: Vec<serde_json::Value> = ApiBody::Json(json!([])).into_json().unwrap();
        assert!(items.is_empty());
    }

    #[test]
    fn request_builder_defaults_to_json() {
        let req = ApiRequest::post("/auth/register")
            .payload(&json!({"email": "a@b.io"}))
            .unwrap();
        assert_eq!(req.encoding, Encoding::Json);
        assert_eq!(req.method, ApiMethod::Post);
        assert!(req.token.is_none());
        assert_eq!(ApiMethod::Delete.to_string(), "DELETE");
    }
}
