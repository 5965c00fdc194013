use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Portal user roles as reported by the upstream API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Patient,
    Doctor,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Patient => "patient",
            Role::Doctor => "doctor",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "patient" => Ok(Role::Patient),
            "doctor" => Ok(Role::Doctor),
            other => Err(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlashLevel {
    Success,
    Error,
}

/// One-shot message shown on the next rendered page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flash {
    pub level: FlashLevel,
    pub message: String,
}

/// Authentication state of one browser session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub token: Option<String>,
    pub refresh_token: Option<String>,
    pub role: Option<Role>,
    pub display_name: Option<String>,
    #[serde(default)]
    pub flashes: Vec<Flash>,
}

/// Returned for both "not logged in" and "wrong role"; callers cannot tell them apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("access denied")]
pub struct AccessDenied;

/// Longest idle window a session may be configured with (one week).
pub const MAX_SESSION_AGE_SECS: u64 = 7 * 24 * 3600;

/// In-place edit of a stored session.
pub type SessionUpdate = Box<dyn FnOnce(&mut Session) + Send>;

/// Storage for session state keyed by session id. Last write wins.
#[async_trait]
pub trait SessionBackend: Send + Sync + fmt::Debug {
    async fn get(&self, session_id: &str) -> Option<Session>;
    async fn set(&self, session_id: &str, session: Session);
    async fn clear(&self, session_id: &str);

    /// Apply `apply` to the current state (empty if absent) as one step and
    /// return the state as it was before. An empty result is not stored.
    async fn update(&self, session_id: &str, apply: SessionUpdate) -> Session;
}

#[derive(Debug, Clone)]
struct StoredSession {
    session: Session,
    touched_at: DateTime<Utc>,
}

/// In-memory session backend with idle expiry.
#[derive(Debug, Clone)]
pub struct MemorySessionBackend {
    sessions: Arc<RwLock<HashMap<String, StoredSession>>>,
    max_idle: Duration,
}

impl MemorySessionBackend {
    /// Idle windows above `MAX_SESSION_AGE_SECS` are capped.
    pub fn new(max_idle_secs: u64) -> Self {
        let secs = i64::try_from(max_idle_secs.min(MAX_SESSION_AGE_SECS)).unwrap_or(0);
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            max_idle: Duration::try_seconds(secs).unwrap_or_else(Duration::zero),
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Drop every session idle for longer than the configured maximum.
    pub async fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        let max_idle = self.max_idle;
        sessions.retain(|_, stored| now - stored.touched_at <= max_idle);
        let purged = before - sessions.len();
        if purged > 0 {
            debug!(purged, "expired sessions purged");
        }
        purged
    }
}

impl Default for MemorySessionBackend {
    fn default() -> Self {
        Self::new(3600)
    }
}

#[async_trait]
impl SessionBackend for MemorySessionBackend {
    async fn get(&self, session_id: &str) -> Option<Session> {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(session_id) {
            Some(stored) if now - stored.touched_at <= self.max_idle => {
                stored.touched_at = now;
                return Some(stored.session.clone());
            }
            Some(_) => {}
            None => return None,
        }
        sessions.remove(session_id);
        debug!("session expired after idle timeout");
        None
    }

    async fn set(&self, session_id: &str, session: Session) {
        let mut sessions = self.sessions.write().await;
        sessions.insert(
            session_id.to_string(),
            StoredSession {
                session,
                touched_at: Utc::now(),
            },
        );
    }

    async fn clear(&self, session_id: &str) {
        let mut sessions = self.sessions.write().await;
        sessions.remove(session_id);
    }

    async fn update(&self, session_id: &str, apply: SessionUpdate) -> Session {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        let before = match sessions.remove(session_id) {
            Some(stored) if now - stored.touched_at <= self.max_idle => stored.session,
            _ => Session::default(),
        };
        let mut after = before.clone();
        apply(&mut after);
        if after != Session::default() {
            sessions.insert(
                session_id.to_string(),
                StoredSession {
                    session: after,
                    touched_at: now,
                },
            );
        }
        before
    }
}

/// Background task that drops idle sessions from a memory backend.
pub fn spawn_session_sweeper(
    backend: MemorySessionBackend,
    every: std::time::Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(every).await;
            let purged = backend.purge_expired().await;
            if purged > 0 {
                let remaining = backend.len().await;
                debug!(purged, remaining, "session sweep finished");
            }
        }
    })
}

/// Per-request view of one browser session.
///
/// Cloning the handle shares the same session id and end-of-session flag.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: String,
    backend: Arc<dyn SessionBackend>,
    ended: Arc<AtomicBool>,
}

impl SessionHandle {
    pub fn new(id: impl Into<String>, backend: Arc<dyn SessionBackend>) -> Self {
        Self {
            id: id.into(),
            backend,
            ended: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    async fn load(&self) -> Session {
        self.backend.get(&self.id).await.unwrap_or_default()
    }

    /// Replace the whole session with freshly issued credentials.
    pub async fn start(&self, token: String, refresh_token: Option<String>, role: Role) {
        let session = Session {
            token: Some(token),
            refresh_token,
            role: Some(role),
            ..Session::default()
        };
        self.backend.set(&self.id, session).await;
        self.ended.store(false, Ordering::SeqCst);
    }

    pub async fn get_token(&self) -> Option<String> {
        self.load().await.token
    }

    pub async fn get_refresh_token(&self) -> Option<String> {
        self.load().await.refresh_token
    }

    pub async fn get_role(&self) -> Option<Role> {
        self.load().await.role
    }

    pub async fn display_name(&self) -> Option<String> {
        self.load().await.display_name
    }

    pub async fn set_display_name(&self, name: impl Into<String>) {
        let name = name.into();
        self.backend
            .update(
                &self.id,
                Box::new(move |session| session.display_name = Some(name)),
            )
            .await;
    }

    /// Remove all session state. The cookie stays so a flash can still be delivered.
    pub async fn clear(&self) {
        self.backend.clear(&self.id).await;
    }

    /// Clear the session and ask for the cookie to be expired (logout).
    pub async fn end(&self) {
        self.clear().await;
        self.ended.store(true, Ordering::SeqCst);
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    pub async fn require_login(&self) -> Result<(), AccessDenied> {
        match self.get_token().await {
            Some(_) => Ok(()),
            None => Err(AccessDenied),
        }
    }

    pub async fn require_role(&self, role: Role) -> Result<(), AccessDenied> {
        let session = self.load().await;
        match (session.token, session.role) {
            (Some(_), Some(actual)) if actual == role => Ok(()),
            _ => Err(AccessDenied),
        }
    }

    pub async fn flash(&self, level: FlashLevel, message: impl Into<String>) {
        let flash = Flash {
            level,
            message: message.into(),
        };
        self.backend
            .update(&self.id, Box::new(move |session| session.flashes.push(flash)))
            .await;
    }

    pub async fn take_flashes(&self) -> Vec<Flash> {
        self.backend
            .update(&self.id, Box::new(|session| session.flashes.clear()))
            .await
            .flashes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(id: &str, backend: &Arc<MemorySessionBackend>) -> SessionHandle {
        SessionHandle::new(id, backend.clone() as Arc<dyn SessionBackend>)
    }

    #[tokio::test]
    async fn start_populates_and_clear_empties() {
        let backend = Arc::new(MemorySessionBackend::default());
        let session = handle("s1", &backend);

        assert!(session.get_token().await.is_none());
        session
            .start("abc123".into(), Some("r1".into()), Role::Doctor)
            .await;
        assert_eq!(session.get_token().await.as_deref(), Some("abc123"));
        assert_eq!(session.get_refresh_token().await.as_deref(), Some("r1"));
        assert_eq!(session.get_role().await, Some(Role::Doctor));

        session.clear().await;
        assert!(session.get_token().await.is_none());
        assert!(session.get_role().await.is_none());
        assert!(!session.is_ended());
    }

    #[tokio::test]
    async fn start_overwrites_previous_state() {
        let backend = Arc::new(MemorySessionBackend::default());
        let session = handle("s1", &backend);

        session.start("old".into(), Some("r-old".into()), Role::Doctor).await;
        session.set_display_name("Ivan Ivanov").await;
        session.start("new".into(), None, Role::Patient).await;

        assert_eq!(session.get_token().await.as_deref(), Some("new"));
        assert!(session.get_refresh_token().await.is_none());
        assert!(session.display_name().await.is_none());
        assert_eq!(session.get_role().await, Some(Role::Patient));
    }

    #[tokio::test]
    async fn role_check_does_not_distinguish_failures() {
        let backend = Arc::new(MemorySessionBackend::default());
        let anonymous = handle("anon", &backend);
        let patient = handle("p", &backend);
        patient.start("t".into(), None, Role::Patient).await;

        assert_eq!(anonymous.require_role(Role::Doctor).await, Err(AccessDenied));
        assert_eq!(patient.require_role(Role::Doctor).await, Err(AccessDenied));
        assert_eq!(patient.require_role(Role::Patient).await, Ok(()));
        assert_eq!(patient.require_login().await, Ok(()));
        assert_eq!(anonymous.require_login().await, Err(AccessDenied));
    }

    #[tokio::test]
    async fn sessions_are_isolated_by_id() {
        let backend = Arc::new(MemorySessionBackend::default());
        let a = handle("a", &backend);
        let b = handle("b", &backend);
        a.start("ta".into(), None, Role::Patient).await;
        b.start("tb".into(), None, Role::Doctor).await;

        a.clear().await;
        assert!(a.get_token().await.is_none());
        assert_eq!(b.get_token().await.as_deref(), Some("tb"));
        assert_eq!(backend.len().await, 1);
    }

    #[tokio::test]
    async fn flashes_are_consumed_once() {
        let backend = Arc::new(MemorySessionBackend::default());
        let session = handle("f", &backend);
        session.flash(FlashLevel::Error, "Access denied").await;

        let flashes = session.take_flashes().await;
        assert_eq!(flashes.len(), 1);
        assert_eq!(flashes[0].level, FlashLevel::Error);
        assert!(session.take_flashes().await.is_empty());
    }

    #[tokio::test]
    async fn end_marks_cookie_for_expiry() {
        let backend = Arc::new(MemorySessionBackend::default());
        let session = handle("e", &backend);
        session.start("t".into(), None, Role::Patient).await;

        let shared = session.clone();
        shared.end().await;
        assert!(session.is_ended());
        assert!(session.get_token().await.is_none());
    }

    #[tokio::test]
    async fn idle_sessions_expire() {
        let backend = Arc::new(MemorySessionBackend::new(0));
        let session = handle("x", &backend);
        session.start("t".into(), None, Role::Patient).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert!(session.get_token().await.is_none());
        assert!(backend.is_empty().await);

        session.start("t".into(), None, Role::Patient).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(backend.purge_expired().await, 1);
    }

    #[tokio::test]
    async fn sweeper_purges_idle_sessions() {
        let backend = MemorySessionBackend::new(0);
        let session = SessionHandle::new("idle", Arc::new(backend.clone()) as Arc<dyn SessionBackend>);
        session.start("t".into(), None, Role::Patient).await;

        let sweeper = spawn_session_sweeper(backend.clone(), std::time::Duration::from_millis(10));
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        sweeper.abort();
        assert!(backend.is_empty().await);
    }

    #[tokio::test]
    async fn idle_window_is_capped() {
        let backend = Arc::new(MemorySessionBackend::new(u64::MAX));
        let session = handle("cap", &backend);
        session.start("tok".into(), None, Role::Patient).await;
        assert_eq!(session.get_token().await.as_deref(), Some("tok"));

        let backend = MemorySessionBackend::new(10_000_000_000_000_000);
        assert_eq!(backend.max_idle, Duration::seconds(MAX_SESSION_AGE_SECS as i64));
    }

    #[tokio::test]
    async fn flash_after_clear_does_not_restore_token() {
        let backend = Arc::new(MemorySessionBackend::default());
        let session = handle("race", &backend);
        session.start("tok".into(), None, Role::Patient).await;

        session.clear().await;
        session.flash(FlashLevel::Error, "Access denied").await;
        session.set_display_name("Ivan").await;

        assert!(session.get_token().await.is_none());
        assert!(session.get_role().await.is_none());
        assert_eq!(session.take_flashes().await.len(), 1);
    }

    #[tokio::test]
    async fn taking_flashes_does_not_create_sessions() {
        let backend = Arc::new(MemorySessionBackend::default());
        let session = handle("quiet", &backend);
        assert!(session.take_flashes().await.is_empty());
        assert!(backend.is_empty().await);

        session.flash(FlashLevel::Success, "Signed in").await;
        session.take_flashes().await;
        assert!(backend.is_empty().await);
    }

    #[test]
    fn role_parsing() {
        assert_eq!("doctor".parse::<Role>(), Ok(Role::Doctor));
        assert!("admin".parse::<Role>().is_err());
        assert_eq!(Role::Patient.to_string(), "patient");
    }
}
