use axum::http::header::COOKIE;
use axum::http::HeaderMap;
use base64::{engine::general_purpose, Engine};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;
use subtle::ConstantTimeEq;

// Cookie value: <session-id>.<base64url(HMAC-SHA256(session-id, secret))>

type HmacSha256 = Hmac<Sha256>;

/// Issues and verifies the signed session cookie.
#[derive(Clone)]
pub struct CookieSigner {
    key: Vec<u8>,
    cookie_name: String,
    max_age_secs: u64,
}

impl fmt::Debug for CookieSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CookieSigner")
            .field("cookie_name", &self.cookie_name)
            .field("max_age_secs", &self.max_age_secs)
            .finish_non_exhaustive()
    }
}

impl CookieSigner {
    pub fn new(secret: &str, cookie_name: impl Into<String>, max_age_secs: u64) -> Self {
        Self {
            key: secret.as_bytes().to_vec(),
            cookie_name: cookie_name.into(),
            max_age_secs,
        }
    }

    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    fn mac(&self, session_id: &str) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("HMAC can take key of any size");
        mac.update(session_id.as_bytes());
        mac.finalize().into_bytes().to_vec()
    }

    pub fn sign(&self, session_id: &str) -> String {
        let sig = general_purpose::URL_SAFE_NO_PAD.encode(self.mac(session_id));
        format!("{session_id}.{sig}")
    }

    /// Returns the session id when the signature matches.
    pub fn verify(&self, value: &str) -> Option<String> {
        let (session_id, sig) = value.rsplit_once('.')?;
        if session_id.is_empty() {
            return None;
        }
        let provided = general_purpose::URL_SAFE_NO_PAD.decode(sig).ok()?;
        let expected = self.mac(session_id);
        if provided.ct_eq(expected.as_slice()).unwrap_u8() == 1 {
            Some(session_id.to_string())
        } else {
            None
        }
    }

    /// Find and verify our cookie among the request's `Cookie` headers.
    pub fn session_id_from_headers(&self, headers: &HeaderMap) -> Option<String> {
        headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|raw| raw.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .filter(|(name, _)| *name == self.cookie_name)
            .find_map(|(_, value)| self.verify(value.trim()))
    }

    pub fn set_cookie(&self, session_id: &str) -> String {
        format!(
            "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
            self.cookie_name,
            self.sign(session_id),
            self.max_age_secs
        )
    }

    pub fn expired_cookie(&self) -> String {
        format!(
            "{}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0; Expires=Thu, 01 Jan 1970 00:00:00 GMT",
            self.cookie_name
        )
    }
}
