use axum::extract::{FromRequestParts, Request, State};
use axum::http::header::SET_COOKIE;
use axum::http::request::Parts;
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use tracing::{error, trace};
use uuid::Uuid;

use crate::comms::local_api::SharedState;
use crate::security::session::SessionHandle;

/// Resolve the browser's session from its signed cookie and hand a
/// `SessionHandle` to the handler through request extensions.
///
/// Every response for a session holding state re-sends the cookie so its
/// `Max-Age` follows the backend's idle window; an ended session gets an
/// expired cookie.
pub async fn session_layer(
    State(state): State<SharedState>,
    mut request: Request,
    next: Next,
) -> Response {
    let existing = state.cookies.session_id_from_headers(request.headers());
    let session_id = existing.unwrap_or_else(|| Uuid::new_v4().to_string());

    let handle = SessionHandle::new(session_id.clone(), state.sessions.clone());
    request.extensions_mut().insert(handle.clone());

    let mut response = next.run(request).await;

    let cookie = if handle.is_ended() {
        Some(state.cookies.expired_cookie())
    } else if state.sessions.get(&session_id).await.is_some() {
        trace!("refreshing session cookie");
        Some(state.cookies.set_cookie(&session_id))
    } else {
        None
    };

    if let Some(cookie) = cookie {
        match HeaderValue::from_str(&cookie) {
            Ok(value) => {
                response.headers_mut().append(SET_COOKIE, value);
            }
            Err(e) => error!("invalid session cookie header: {}", e),
        }
    }

    response
}

impl<S> FromRequestParts<S> for SessionHandle
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts.extensions.get::<SessionHandle>().cloned().ok_or((
            StatusCode::INTERNAL_SERVER_ERROR,
            "session layer not installed",
        ))
    }
}
