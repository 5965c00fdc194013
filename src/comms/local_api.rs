use anyhow::{Context, Result};
use axum::{
    extract::rejection::JsonRejection,
    extract::{Form, Path, State},
    http::StatusCode,
    middleware,
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tera::Tera;
use tracing::{debug, error, info, warn};

use crate::comms::session_layer::session_layer;
use crate::portal::charts::{glucose_chart, patient_card_charts};
use crate::portal::config::Config;
use crate::portal::models::{
    ComplaintForm, LoginForm, MeasurementForm, NewPrescription, RegisterForm,
};
use crate::portal::service::Portal;
use crate::portal::validation::{complaint_from_form, measurement_from_form, registration_request};
use crate::security::audit_log::AuditLogger;
use crate::security::cookie::CookieSigner;
use crate::security::session::{
    spawn_session_sweeper, FlashLevel, MemorySessionBackend, Role, SessionBackend, SessionHandle,
};
use crate::transport::upstream::Credentials;
use crate::transport::ApiError;

pub type SharedState = Arc<AppState>;

const ACCESS_DENIED: &str = "Access denied";
const RECENT_MEASUREMENTS: usize = 10;
const MEASUREMENTS_PAGE: usize = 50;

#[derive(Debug, Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub portal: Portal,
    pub sessions: Arc<dyn SessionBackend>,
    pub cookies: CookieSigner,
    pub templates: Option<Arc<Tera>>,
    pub with_ui: bool,
    pub audit: AuditLogger,
}

impl AppState {
    pub fn new(config: Arc<Config>, with_ui: bool) -> Result<Self> {
        let sessions = Arc::new(MemorySessionBackend::new(config.session_max_age_secs));
        Self::with_sessions(config, sessions, with_ui)
    }

    pub fn with_sessions(
        config: Arc<Config>,
        sessions: Arc<dyn SessionBackend>,
        with_ui: bool,
    ) -> Result<Self> {
        let portal = Portal::from_config(&config).context("configuring upstream portal")?;
        let templates = if with_ui {
            match Tera::new("templates/**/*.html") {
                Ok(t) => {
                    debug!("Loaded {} templates", t.get_template_names().count());
                    Some(Arc::new(t))
                }
                Err(e) => {
                    error!("Template parsing error: {}", e);
                    None
                }
            }
        } else {
            None
        };
        let cookies = CookieSigner::new(
            &config.session_secret,
            config.session_cookie.clone(),
            config.session_max_age_secs,
        );

        Ok(Self {
            config,
            portal,
            sessions,
            cookies,
            templates,
            with_ui,
            audit: AuditLogger::new(),
        })
    }

    /// HTML when the UI is enabled and templates loaded, otherwise the page context as JSON.
    fn render(&self, template: &str, context: Value) -> Response {
        let Some(templates) = self.templates.as_ref().filter(|_| self.with_ui) else {
            return Json(context).into_response();
        };
        let context = match tera::Context::from_value(context) {
            Ok(c) => c,
            Err(e) => {
                error!("Template context error: {}", e);
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Html("<html><body>Error rendering page</body></html>"),
                )
                    .into_response();
            }
        };
        match templates.render(template, &context) {
            Ok(html) => Html(html).into_response(),
            Err(e) => {
                error!("Template render error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Html("<html><body>Error rendering page</body></html>"),
                )
                    .into_response()
            }
        }
    }
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn json_error(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
        .into_response()
}

/// Render a page with the session's pending flashes and identity merged into the context.
async fn page(state: &AppState, session: &SessionHandle, template: &str, mut context: Value) -> Response {
    let flashes = session.take_flashes().await;
    if let Value::Object(map) = &mut context {
        map.insert("flashes".into(), json!(flashes));
        map.insert("display_name".into(), json!(session.display_name().await));
        map.insert("role".into(), json!(session.get_role().await));
    }
    state.render(template, context)
}

async fn deny(state: &AppState, session: &SessionHandle, path: &str, required: Role) -> Response {
    state.audit.access_denied(path, required);
    session.flash(FlashLevel::Error, ACCESS_DENIED).await;
    Redirect::to("/login").into_response()
}

async fn expired(session: &SessionHandle) -> Response {
    session
        .flash(FlashLevel::Error, ApiError::SessionExpired.user_message())
        .await;
    Redirect::to("/login").into_response()
}

/// A rejected request (400) gets its own message; other failures use `generic`.
fn failure_message(err: &ApiError, generic: &'static str) -> &'static str {
    match err {
        ApiError::BadRequest => err.user_message(),
        _ => generic,
    }
}

/// Listings degrade to an empty list on upstream failure; only expiry leaves the page.
async fn listing<T>(
    session: &SessionHandle,
    result: Result<Vec<T>, ApiError>,
) -> Result<Vec<T>, Response> {
    match result {
        Ok(items) => Ok(items),
        Err(ApiError::SessionExpired) => Err(expired(session).await),
        Err(err) => {
            warn!(error = %err, "upstream listing failed");
            session.flash(FlashLevel::Error, err.user_message()).await;
            Ok(Vec::new())
        }
    }
}

// Health check
async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn index(session: SessionHandle) -> Redirect {
    if session.get_token().await.is_some() {
        Redirect::to("/dashboard")
    } else {
        Redirect::to("/login")
    }
}

// Login form (GET)
async fn login_page(State(state): State<SharedState>, session: SessionHandle) -> Response {
    page(&state, &session, "login.html", json!({"fields": ["email", "password"]})).await
}

// Login handler (POST)
async fn login_handler(
    State(state): State<SharedState>,
    session: SessionHandle,
    Form(form): Form<LoginForm>,
) -> Response {
    let credentials = Credentials {
        username: form.email.trim().to_string(),
        password: form.password,
    };

    match state.portal.login(&session, &credentials).await {
        Ok(role) => {
            debug!(role = %role, "user logged in");
            session
                .flash(FlashLevel::Success, "Signed in successfully")
                .await;
            Redirect::to("/dashboard").into_response()
        }
        Err(err) => {
            state
                .audit
                .login_failure(&credentials.username, &err.to_string());
            let (status, message) = match err {
                ApiError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, err.user_message()),
                _ => (
                    StatusCode::UNAUTHORIZED,
                    ApiError::Unauthorized.user_message(),
                ),
            };
            session.flash(FlashLevel::Error, message).await;
            let mut response = page(
                &state,
                &session,
                "login.html",
                json!({"fields": ["email", "password"]}),
            )
            .await;
            *response.status_mut() = status;
            response
        }
    }
}

async fn register_page(State(state): State<SharedState>, session: SessionHandle) -> Response {
    page(&state, &session, "register.html", json!({"roles": ["patient", "doctor"]})).await
}

async fn register_handler(
    State(state): State<SharedState>,
    session: SessionHandle,
    Form(form): Form<RegisterForm>,
) -> Response {
    let request = match registration_request(&form) {
        Ok(request) => request,
        Err(e) => {
            debug!(error = %e, "registration form rejected");
            session.flash(FlashLevel::Error, e.to_string()).await;
            return Redirect::to("/register").into_response();
        }
    };

    match state.portal.register(&request).await {
        Ok(()) => {
            session
                .flash(
                    FlashLevel::Success,
                    "Registration successful, you can sign in now",
                )
                .await;
            Redirect::to("/login").into_response()
        }
        Err(ApiError::BadRequest) => {
            session
                .flash(FlashLevel::Error, "A user with this email already exists")
                .await;
            Redirect::to("/register").into_response()
        }
        Err(err) => {
            warn!(error = %err, "registration failed");
            session.flash(FlashLevel::Error, "Registration failed").await;
            Redirect::to("/register").into_response()
        }
    }
}

// Logout handler
async fn logout_handler(State(state): State<SharedState>, session: SessionHandle) -> Redirect {
    state.audit.logged_out(session.id());
    session.end().await;
    Redirect::to("/login")
}

async fn dashboard(session: SessionHandle) -> Redirect {
    if session.require_login().await.is_err() {
        session.flash(FlashLevel::Error, "Please sign in").await;
        return Redirect::to("/login");
    }
    match session.get_role().await {
        Some(Role::Patient) => Redirect::to("/patient/dashboard"),
        Some(Role::Doctor) => Redirect::to("/doctor/patients"),
        None => {
            session.flash(FlashLevel::Error, "Unknown user role").await;
            Redirect::to("/login")
        }
    }
}

async fn patient_dashboard(State(state): State<SharedState>, session: SessionHandle) -> Response {
    if session.require_role(Role::Patient).await.is_err() {
        return deny(&state, &session, "/patient/dashboard", Role::Patient).await;
    }

    // Without a profile the session is considered unusable.
    let profile = match state.portal.profile(&session).await {
        Ok(profile) => profile,
        Err(err) => {
            warn!(error = %err, "profile fetch failed");
            session.clear().await;
            return expired(&session).await;
        }
    };
    session.set_display_name(profile.display_name()).await;

    let mut measurements = match listing(&session, state.portal.measurements(&session).await).await {
        Ok(items) => items,
        Err(response) => return response,
    };
    measurements.truncate(RECENT_MEASUREMENTS);
    let last_measurement = measurements.first().cloned();
    let current_date = chrono::Local::now().format("%d.%m.%Y").to_string();

    page(
        &state,
        &session,
        "patient_dashboard.html",
        json!({
            "profile": profile,
            "measurements": measurements,
            "last_measurement": last_measurement,
            "current_date": current_date,
        }),
    )
    .await
}

async fn patient_measurements(State(state): State<SharedState>, session: SessionHandle) -> Response {
    if session.require_role(Role::Patient).await.is_err() {
        return deny(&state, &session, "/patient/measurements", Role::Patient).await;
    }

    let mut measurements = match listing(&session, state.portal.measurements(&session).await).await {
        Ok(items) => items,
        Err(response) => return response,
    };
    let chart = glucose_chart(&measurements);
    measurements.truncate(MEASUREMENTS_PAGE);

    page(
        &state,
        &session,
        "patient_measurements.html",
        json!({"measurements": measurements, "chart": chart}),
    )
    .await
}

async fn add_measurement(
    State(state): State<SharedState>,
    session: SessionHandle,
    Form(form): Form<MeasurementForm>,
) -> Response {
    if session.require_role(Role::Patient).await.is_err() {
        return deny(&state, &session, "/patient/measurements", Role::Patient).await;
    }

    match measurement_from_form(&form) {
        Err(e) => session.flash(FlashLevel::Error, e.to_string()).await,
        Ok(measurement) => match state.portal.add_measurement(&session, &measurement).await {
            Ok(()) => {
                session
                    .flash(FlashLevel::Success, "Measurements added")
                    .await
            }
            Err(ApiError::SessionExpired) => return expired(&session).await,
            Err(err) => {
                warn!(error = %err, "adding measurement failed");
                session
                    .flash(FlashLevel::Error, failure_message(&err, "Failed to add measurements"))
                    .await
            }
        },
    }
    Redirect::to("/patient/measurements").into_response()
}

async fn patient_prescriptions(State(state): State<SharedState>, session: SessionHandle) -> Response {
    if session.require_role(Role::Patient).await.is_err() {
        return deny(&state, &session, "/patient/prescriptions", Role::Patient).await;
    }

    let prescriptions = match listing(&session, state.portal.prescriptions(&session).await).await {
        Ok(items) => items,
        Err(response) => return response,
    };
    page(
        &state,
        &session,
        "patient_prescriptions.html",
        json!({"prescriptions": prescriptions}),
    )
    .await
}

async fn patient_complaints(State(state): State<SharedState>, session: SessionHandle) -> Response {
    if session.require_role(Role::Patient).await.is_err() {
        return deny(&state, &session, "/patient/complaints", Role::Patient).await;
    }

    let complaints = match listing(&session, state.portal.complaints(&session).await).await {
        Ok(items) => items,
        Err(response) => return response,
    };
    page(
        &state,
        &session,
        "patient_complaints.html",
        json!({"complaints": complaints}),
    )
    .await
}

async fn add_complaint(
    State(state): State<SharedState>,
    session: SessionHandle,
    Form(form): Form<ComplaintForm>,
) -> Response {
    if session.require_role(Role::Patient).await.is_err() {
        return deny(&state, &session, "/patient/complaints", Role::Patient).await;
    }

    match complaint_from_form(&form) {
        Err(e) => session.flash(FlashLevel::Error, e.to_string()).await,
        Ok(complaint) => match state.portal.add_complaint(&session, &complaint).await {
            Ok(()) => {
                session
                    .flash(FlashLevel::Success, "Complaint added")
                    .await
            }
            Err(ApiError::SessionExpired) => return expired(&session).await,
            Err(err) => {
                warn!(error = %err, "adding complaint failed");
                session
                    .flash(FlashLevel::Error, failure_message(&err, "Failed to add complaint"))
                    .await
            }
        },
    }
    Redirect::to("/patient/complaints").into_response()
}

async fn doctor_patients(State(state): State<SharedState>, session: SessionHandle) -> Response {
    if session.require_role(Role::Doctor).await.is_err() {
        return deny(&state, &session, "/doctor/patients", Role::Doctor).await;
    }

    let patients = match listing(&session, state.portal.doctor_patients(&session).await).await {
        Ok(items) => items,
        Err(response) => return response,
    };
    page(
        &state,
        &session,
        "doctor_patients.html",
        json!({"patients": patients}),
    )
    .await
}

async fn doctor_patient_card(
    State(state): State<SharedState>,
    session: SessionHandle,
    Path(patient_id): Path<i64>,
) -> Response {
    if session.require_role(Role::Doctor).await.is_err() {
        return deny(&state, &session, "/doctor/patient/card", Role::Doctor).await;
    }

    let card = match state.portal.patient_card(&session, patient_id).await {
        Ok(card) => card,
        Err(ApiError::SessionExpired) => return expired(&session).await,
        Err(err) => {
            warn!(patient_id, error = %err, "patient card fetch failed");
            session
                .flash(FlashLevel::Error, failure_message(&err, "Failed to load the patient card"))
                .await;
            return Redirect::to("/doctor/patients").into_response();
        }
    };
    let charts = patient_card_charts(&card.measurements);

    page(
        &state,
        &session,
        "doctor_patient_card.html",
        json!({"patient_id": patient_id, "data": card, "charts": charts}),
    )
    .await
}

async fn create_prescription(
    State(state): State<SharedState>,
    session: SessionHandle,
    payload: Result<Json<NewPrescription>, JsonRejection>,
) -> Response {
    if session.require_role(Role::Doctor).await.is_err() {
        state.audit.access_denied("/doctor/prescriptions", Role::Doctor);
        return json_error(StatusCode::UNAUTHORIZED, "Unauthorized");
    }
    let Json(prescription) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            debug!(error = %rejection, "invalid prescription payload");
            return json_error(StatusCode::BAD_REQUEST, "Invalid prescription payload");
        }
    };

    match state.portal.create_prescription(&session, &prescription).await {
        Ok(_) => (
            StatusCode::CREATED,
            Json(json!({"message": "Prescription created"})),
        )
            .into_response(),
        Err(ApiError::SessionExpired) => json_error(StatusCode::UNAUTHORIZED, "Session expired"),
        Err(err) => {
            warn!(error = %err, "creating prescription failed");
            json_error(
                StatusCode::BAD_REQUEST,
                failure_message(&err, "Failed to create prescription"),
            )
        }
    }
}

pub fn create_router(state: SharedState) -> Router {
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/", get(index))
        .route("/login", get(login_page).post(login_handler))
        .route("/register", get(register_page).post(register_handler))
        .route("/logout", get(logout_handler))
        .route("/dashboard", get(dashboard))
        .route("/patient/dashboard", get(patient_dashboard))
        .route(
            "/patient/measurements",
            get(patient_measurements).post(add_measurement),
        )
        .route("/patient/prescriptions", get(patient_prescriptions))
        .route(
            "/patient/complaints",
            get(patient_complaints).post(add_complaint),
        )
        .route("/doctor/patients", get(doctor_patients))
        .route("/doctor/patient/{patient_id}/card", get(doctor_patient_card))
        .route("/doctor/prescriptions", post(create_prescription));

    // Add static file serving when UI is enabled
    if state.with_ui {
        use tower_http::services::ServeDir;
        router = router.nest_service("/static", ServeDir::new("static"));
    }

    router
        .layer(middleware::from_fn_with_state(state.clone(), session_layer))
        .with_state(state)
}

pub async fn serve(config: Config, port: u16, with_ui: bool) -> Result<()> {
    let cfg = Arc::new(config);
    let sessions = MemorySessionBackend::new(cfg.session_max_age_secs);
    spawn_session_sweeper(sessions.clone(), Duration::from_secs(60));

    let state = Arc::new(AppState::with_sessions(cfg, Arc::new(sessions), with_ui)?);
    let app = create_router(state);

    if with_ui {
        info!("HTTP server with UI starting on port {}", port);
    } else {
        info!("HTTP server in API-only mode starting on port {}", port);
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("HTTP server listening on {}", addr);
    axum::serve(listener, app).into_future().await?;
    Ok(())
}
