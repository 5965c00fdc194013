use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

use crate::security::session::MAX_SESSION_AGE_SECS;
use crate::transport::upstream::UpstreamFlavor;

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:5000";
pub const DEFAULT_SESSION_SECRET: &str = "web-secret-key";
const MIN_TIMEOUT_SECS: u64 = 1;
const MAX_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    pub session_secret: String,
    pub upstream: UpstreamFlavor,
    pub request_timeout_secs: u64,
    pub session_cookie: String,
    pub session_max_age_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            session_secret: DEFAULT_SESSION_SECRET.to_string(),
            upstream: UpstreamFlavor::Rest,
            request_timeout_secs: 10,
            session_cookie: "session".to_string(),
            session_max_age_secs: 3600,
        }
    }
}

impl Config {
    /// Build the config from process environment variables.
    ///
    /// - `API_BASE_URL`: upstream base URL
    /// - `SECRET_KEY` / `SESSION_SECRET`: cookie signing secret
    /// - `UPSTREAM_FLAVOR`: `rest` or `oauth2`
    /// - `API_TIMEOUT_SECS`: outbound timeout, clamped to 1..=30
    /// - `SESSION_COOKIE`, `SESSION_MAX_AGE_SECS`
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Config::default();

        if let Some(url) = lookup("API_BASE_URL") {
            cfg.api_base_url = url;
        }
        if let Some(secret) = lookup("SECRET_KEY").or_else(|| lookup("SESSION_SECRET")) {
            cfg.session_secret = secret;
        }
        if let Some(flavor) = lookup("UPSTREAM_FLAVOR") {
            cfg.upstream = flavor.parse().map_err(|e: String| anyhow!(e))?;
        }
        if let Some(secs) = lookup("API_TIMEOUT_SECS") {
            cfg.request_timeout_secs = secs
                .trim()
                .parse()
                .with_context(|| format!("parsing API_TIMEOUT_SECS={secs}"))?;
        }
        if let Some(name) = lookup("SESSION_COOKIE") {
            cfg.session_cookie = name;
        }
        if let Some(secs) = lookup("SESSION_MAX_AGE_SECS") {
            cfg.session_max_age_secs = secs
                .trim()
                .parse()
                .with_context(|| format!("parsing SESSION_MAX_AGE_SECS={secs}"))?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: &str) -> Result<Self> {
        let raw = fs::read_to_string(path).context("reading config file")?;
        let cfg: Config = serde_json::from_str(&raw).context("parsing JSON")?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if !(self.api_base_url.starts_with("http://") || self.api_base_url.starts_with("https://")) {
            return Err(anyhow!(
                "api_base_url must be an http(s) URL, got '{}'",
                self.api_base_url
            ));
        }
        if self.session_secret.is_empty() {
            return Err(anyhow!("session secret must not be empty"));
        }
        if self.session_cookie.is_empty()
            || self
                .session_cookie
                .contains(|c: char| c.is_whitespace() || c == ';' || c == '=')
        {
            return Err(anyhow!("invalid session cookie name '{}'", self.session_cookie));
        }
        if !(1..=MAX_SESSION_AGE_SECS).contains(&self.session_max_age_secs) {
            return Err(anyhow!(
                "session_max_age_secs must be within 1..={}, got {}",
                MAX_SESSION_AGE_SECS,
                self.session_max_age_secs
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(
            self.request_timeout_secs
                .clamp(MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS),
        )
    }

    /// Copy suitable for printing.
    pub fn redacted(&self) -> Self {
        Self {
            session_secret: "***".to_string(),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let cfg = Config::from_lookup(|_| None).unwrap();
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.request_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn environment_overrides() {
        let cfg = Config::from_lookup(lookup_from(&[
            ("API_BASE_URL", "http://127.0.0.1:8080/api"),
            ("SESSION_SECRET", "s3cret"),
            ("UPSTREAM_FLAVOR", "oauth2"),
            ("API_TIMEOUT_SECS", "30"),
            ("SESSION_COOKIE", "patient_session"),
        ]))
        .unwrap();
        assert_eq!(cfg.api_base_url, "http://127.0.0.1:8080/api");
        assert_eq!(cfg.session_secret, "s3cret");
        assert_eq!(cfg.upstream, UpstreamFlavor::OAuth2);
        assert_eq!(cfg.session_cookie, "patient_session");
        assert_eq!(cfg.request_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn secret_key_takes_precedence() {
        let cfg = Config::from_lookup(lookup_from(&[
            ("SECRET_KEY", "first"),
            ("SESSION_SECRET", "second"),
        ]))
        .unwrap();
        assert_eq!(cfg.session_secret, "first");
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(Config::from_lookup(lookup_from(&[("UPSTREAM_FLAVOR", "soap")])).is_err());
        assert!(Config::from_lookup(lookup_from(&[("API_TIMEOUT_SECS", "ten")])).is_err());
        assert!(Config::from_lookup(lookup_from(&[("API_BASE_URL", "localhost:5000")])).is_err());
    }

    #[test]
    fn session_age_must_be_bounded() {
        for secs in ["0", "604801", "10000000000000000", "18446744073709551615"] {
            assert!(
                Config::from_lookup(lookup_from(&[("SESSION_MAX_AGE_SECS", secs)])).is_err(),
                "accepted SESSION_MAX_AGE_SECS={secs}"
            );
        }
        let cfg = Config::from_lookup(lookup_from(&[("SESSION_MAX_AGE_SECS", "604800")])).unwrap();
        assert_eq!(cfg.session_max_age_secs, MAX_SESSION_AGE_SECS);
    }

    #[test]
    fn timeout_is_clamped() {
        let cfg = Config {
            request_timeout_secs: 600,
            ..Config::default()
        };
        assert_eq!(cfg.request_timeout(), Duration::from_secs(30));
        let cfg = Config {
            request_timeout_secs: 0,
            ..Config::default()
        };
        assert_eq!(cfg.request_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn config_file_parsing() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{
                "api_base_url": "https://records.example.com",
                "upstream": "rest",
                "request_timeout_secs": 15
            }}"#
        )
        .unwrap();

        let cfg = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(cfg.api_base_url, "https://records.example.com");
        assert_eq!(cfg.request_timeout_secs, 15);
        assert_eq!(cfg.session_secret, DEFAULT_SESSION_SECRET);
    }

    #[test]
    fn config_missing_file() {
        assert!(Config::from_file("/nonexistent/path/portal.json").is_err());
    }

    #[test]
    fn config_invalid_json() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{{invalid json").unwrap();
        assert!(Config::from_file(file.path().to_str().unwrap()).is_err());
    }

    #[test]
    fn redacted_hides_secret() {
        let cfg = Config::default().redacted();
        assert_eq!(cfg.session_secret, "***");
    }
}
