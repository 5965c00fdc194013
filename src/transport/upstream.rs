use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::security::session::Role;
use crate::transport::{ApiBody, ApiError, ApiRequest, Encoding};

/// Login credentials as typed into the portal.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// What a successful login hands to the session store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub role: Role,
}

/// Conventions of a particular upstream deployment: where the token endpoint
/// lives, what it expects and what it answers with.
pub trait UpstreamContract: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn login_endpoint(&self) -> &'static str;

    fn register_endpoint(&self) -> &'static str {
        "/auth/register"
    }

    fn login_request(&self, credentials: &Credentials) -> Result<ApiRequest, ApiError>;

    fn parse_login(&self, body: ApiBody) -> Result<LoginGrant, ApiError>;
}

#[derive(Serialize)]
struct PasswordForm<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct PasswordGrantForm<'a> {
    grant_type: &'static str,
    username: &'a str,
    password: &'a str,
}

/// REST upstream: `POST /auth/login` answers with tokens and the user's role.
#[derive(Debug, Clone, Copy, Default)]
pub struct RestUpstream;

#[derive(Deserialize)]
struct RestLoginResponse {
    access_token: String,
    refresh_token: Option<String>,
    role: Role,
}

impl UpstreamContract for RestUpstream {
    fn name(&self) -> &'static str {
        "rest"
    }

    fn login_endpoint(&self) -> &'static str {
        "/auth/login"
    }

    fn login_request(&self, credentials: &Credentials) -> Result<ApiRequest, ApiError> {
        Ok(ApiRequest::post(self.login_endpoint())
            .payload(&PasswordForm {
                username: &credentials.username,
                password: &credentials.password,
            })?
            .encoding(Encoding::Form))
    }

    fn parse_login(&self, body: ApiBody) -> Result<LoginGrant, ApiError> {
        let resp: RestLoginResponse = body.into_json()?;
        Ok(LoginGrant {
            access_token: resp.access_token,
            refresh_token: resp.refresh_token,
            role: resp.role,
        })
    }
}

/// OAuth2-style upstream: password grant against `POST /auth/token`.
/// The token response may omit the role, in which case the user is a patient.
#[derive(Debug, Clone, Copy, Default)]
pub struct OAuth2Upstream;

#[derive(Deserialize)]
struct OAuth2TokenResponse {
    access_token: String,
    #[serde(default)]
    #[allow(dead_code)]
    token_type: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    role: Option<Role>,
}

impl UpstreamContract for OAuth2Upstream {
    fn name(&self) -> &'static str {
        "oauth2"
    }

    fn login_endpoint(&self) -> &'static str {
        "/auth/token"
    }

    fn login_request(&self, credentials: &Credentials) -> Result<ApiRequest, ApiError> {
        Ok(ApiRequest::post(self.login_endpoint())
            .payload(&PasswordGrantForm {
                grant_type: "password",
                username: &credentials.username,
                password: &credentials.password,
            })?
            .encoding(Encoding::Form))
    }

    fn parse_login(&self, body: ApiBody) -> Result<LoginGrant, ApiError> {
        let resp: OAuth2TokenResponse = body.into_json()?;
        Ok(LoginGrant {
            access_token: resp.access_token,
            refresh_token: resp.refresh_token,
            role: resp.role.unwrap_or(Role::Patient),
        })
    }
}

/// Selects the upstream adapter from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamFlavor {
    #[default]
    Rest,
    OAuth2,
}

impl UpstreamFlavor {
    pub fn contract(self) -> Arc<dyn UpstreamContract> {
        match self {
            UpstreamFlavor::Rest => Arc::new(RestUpstream),
            UpstreamFlavor::OAuth2 => Arc::new(OAuth2Upstream),
        }
    }
}

impl FromStr for UpstreamFlavor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rest" => Ok(UpstreamFlavor::Rest),
            "oauth2" => Ok(UpstreamFlavor::OAuth2),
            other => Err(format!("unknown upstream flavor '{other}' (expected rest or oauth2)")),
        }
    }
}
