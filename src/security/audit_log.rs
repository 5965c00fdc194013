use tracing::{info, warn};

use crate::security::session::Role;

/// Authentication events, emitted on the `audit` tracing target.
#[derive(Debug, Clone, Default)]
pub struct AuditLogger;

impl AuditLogger {
    pub fn new() -> Self {
        Self
    }

    pub fn login_success(&self, username: &str, role: Role) {
        info!(target: "audit", event = "login_success", username, role = role.as_str());
    }

    pub fn login_failure(&self, username: &str, reason: &str) {
        warn!(target: "audit", event = "login_failure", username, reason);
    }

    pub fn registration(&self, role: Role, outcome: &str) {
        info!(target: "audit", event = "registration", role = role.as_str(), outcome);
    }

    pub fn session_expired(&self, session_id: &str) {
        warn!(target: "audit", event = "session_expired", session_id);
    }

    pub fn access_denied(&self, path: &str, required: Role) {
        warn!(target: "audit", event = "access_denied", path, required = required.as_str());
    }

    pub fn logged_out(&self, session_id: &str) {
        info!(target: "audit", event = "logout", session_id);
    }
}
