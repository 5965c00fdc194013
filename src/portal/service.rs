use anyhow::Result;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::{debug, info};

use crate::portal::config::Config;
use crate::portal::models::{
    Complaint, Measurement, NewComplaint, NewMeasurement, NewPrescription, PatientCard,
    PatientSummary, Prescription, Profile, RegisterRequest,
};
use crate::security::audit_log::AuditLogger;
use crate::security::session::{Role, SessionHandle};
use crate::transport::api_client::ApiClient;
use crate::transport::upstream::{Credentials, UpstreamContract};
use crate::transport::{ApiError, ApiRequest, ApiResponse};

/// Remote operations of the portal, bound to the caller's session.
///
/// Any call that carried the session's token and came back 401 clears the
/// session before the error is returned.
#[derive(Debug, Clone)]
pub struct Portal {
    client: ApiClient,
    contract: Arc<dyn UpstreamContract>,
    audit: AuditLogger,
}

impl Portal {
    pub fn new(client: ApiClient, contract: Arc<dyn UpstreamContract>) -> Self {
        Self {
            client,
            contract,
            audit: AuditLogger::new(),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let client = ApiClient::new(config.api_base_url.clone(), config.request_timeout())?;
        let contract = config.upstream.contract();
        info!(
            base_url = %client.base_url(),
            upstream = contract.name(),
            "portal upstream configured"
        );
        Ok(Self::new(client, contract))
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    pub fn contract(&self) -> &dyn UpstreamContract {
        self.contract.as_ref()
    }

    pub async fn login(
        &self,
        session: &SessionHandle,
        credentials: &Credentials,
    ) -> Result<Role, ApiError> {
        let request = self.contract.login_request(credentials)?;
        let response = self.client.call(request).await.into_result()?;
        let grant = self.contract.parse_login(response.body)?;
        let role = grant.role;
        session
            .start(grant.access_token, grant.refresh_token, role)
            .await;
        self.audit.login_success(&credentials.username, role);
        Ok(role)
    }

    pub async fn register(&self, request: &RegisterRequest) -> Result<(), ApiError> {
        let call = ApiRequest::post(self.contract.register_endpoint()).payload(request)?;
        let result = self.client.call(call).await.into_result();
        let outcome = match &result {
            Ok(_) => "created",
            Err(ApiError::BadRequest) => "rejected",
            Err(_) => "failed",
        };
        self.audit.registration(request.role, outcome);
        result.map(|_| ())
    }

    /// Send `request` with the session's token, if any.
    pub async fn authorized(
        &self,
        session: &SessionHandle,
        request: ApiRequest,
    ) -> Result<ApiResponse, ApiError> {
        let token = session.get_token().await;
        let sent_token = token.is_some();
        let reply = self.client.call(request.token(token)).await;

        if sent_token && reply.is_unauthorized() {
            session.clear().await;
            self.audit.session_expired(session.id());
            return Err(ApiError::SessionExpired);
        }
        reply.into_result()
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        session: &SessionHandle,
        endpoint: &str,
    ) -> Result<T, ApiError> {
        self.authorized(session, ApiRequest::get(endpoint))
            .await?
            .json()
    }

    async fn submit<P: serde::Serialize>(
        &self,
        session: &SessionHandle,
        endpoint: &str,
        payload: &P,
    ) -> Result<ApiResponse, ApiError> {
        let request = ApiRequest::post(endpoint).payload(payload)?;
        let response = self.authorized(session, request).await?;
        debug!(endpoint, status = response.status.as_u16(), "submission accepted");
        Ok(response)
    }

    pub async fn profile(&self, session: &SessionHandle) -> Result<Profile, ApiError> {
        self.fetch(session, "/patient/profile").await
    }

    pub async fn measurements(&self, session: &SessionHandle) -> Result<Vec<Measurement>, ApiError> {
        self.fetch(session, "/patient/measurements").await
    }

    pub async fn add_measurement(
        &self,
        session: &SessionHandle,
        measurement: &NewMeasurement,
    ) -> Result<(), ApiError> {
        self.submit(session, "/patient/measurements", measurement)
            .await
            .map(|_| ())
    }

    pub async fn prescriptions(
        &self,
        session: &SessionHandle,
    ) -> Result<Vec<Prescription>, ApiError> {
        self.fetch(session, "/patient/prescriptions").await
    }

    pub async fn complaints(&self, session: &SessionHandle) -> Result<Vec<Complaint>, ApiError> {
        self.fetch(session, "/patient/complaints").await
    }

    pub async fn add_complaint(
        &self,
        session: &SessionHandle,
        complaint: &NewComplaint,
    ) -> Result<(), ApiError> {
        self.submit(session, "/patient/complaints", complaint)
            .await
            .map(|_| ())
    }

    pub async fn doctor_patients(
        &self,
        session: &SessionHandle,
    ) -> Result<Vec<PatientSummary>, ApiError> {
        self.fetch(session, "/doctor/patients").await
    }

    pub async fn patient_card(
        &self,
        session: &SessionHandle,
        patient_id: i64,
    ) -> Result<PatientCard, ApiError> {
        self.fetch(session, &format!("/doctor/patient/{patient_id}/card"))
            .await
    }

    pub async fn create_prescription(
        &self,
        session: &SessionHandle,
        prescription: &NewPrescription,
    ) -> Result<StatusCode, ApiError> {
        self.submit(session, "/doctor/prescriptions", prescription)
            .await
            .map(|response| response.status)
    }
}
