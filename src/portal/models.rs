//! Typed payloads exchanged with the browser and with the upstream API.
//!
//! Upstream responses keep unknown fields in `extra` so pages can show them
//! without the portal having to track every column the records API adds.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::security::session::Role;

// ---- browser forms ----

#[derive(Debug, Clone, Deserialize)]
pub struct LoginForm {
    #[serde(alias = "username")]
    pub email: String,
    pub password: String,
}

/// Raw registration form; numeric fields arrive as text and may be blank.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegisterForm {
    pub email: String,
    pub password: String,
    pub confirm_password: String,
    pub role: String,
    #[serde(default)]
    pub surname: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub patronim: Option<String>,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub birth_date: Option<String>,
    #[serde(default)]
    pub height: Option<String>,
    #[serde(default)]
    pub weight: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MeasurementForm {
    #[serde(default)]
    pub glucose: Option<String>,
    #[serde(default)]
    pub systolic_bp: Option<String>,
    #[serde(default)]
    pub diastolic_bp: Option<String>,
    #[serde(default)]
    pub pulse: Option<String>,
    #[serde(default)]
    pub weight: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ComplaintForm {
    pub symptom_id: String,
    pub severity: String,
    #[serde(default)]
    pub description: Option<String>,
}

// ---- upstream request bodies ----

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub role: Role,
    pub surname: String,
    pub name: String,
    pub patronim: String,
    pub gender: String,
    pub birth_date: String,
    pub height: Option<f64>,
    pub weight: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NewMeasurement {
    pub glucose: Option<f64>,
    pub systolic_bp: Option<i32>,
    pub diastolic_bp: Option<i32>,
    pub pulse: Option<i32>,
    pub weight: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewComplaint {
    pub symptom_id: i64,
    pub severity: String,
    pub description: Option<String>,
}

/// Prescription posted by a doctor from the patient card.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPrescription {
    pub patient_id: i64,
    pub medication: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dosage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

// ---- upstream responses ----

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub surname: String,
    #[serde(default)]
    pub patronim: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Profile {
    pub fn display_name(&self) -> String {
        format!("{} {}", self.name, self.surname).trim().to_string()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub glucose: Option<f64>,
    #[serde(default)]
    pub systolic_bp: Option<i32>,
    #[serde(default)]
    pub diastolic_bp: Option<i32>,
    #[serde(default)]
    pub pulse: Option<i32>,
    #[serde(default)]
    pub weight: Option<f64>,
    #[serde(default)]
    pub measured_at: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Prescription {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub medication: Option<String>,
    #[serde(default)]
    pub dosage: Option<String>,
    #[serde(default)]
    pub frequency: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Complaint {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub symptom_id: Option<i64>,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatientSummary {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub surname: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Everything the doctor sees about one patient.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatientCard {
    #[serde(default)]
    pub patient: Option<Profile>,
    #[serde(default)]
    pub measurements: Vec<Measurement>,
    #[serde(default)]
    pub complaints: Vec<Complaint>,
    #[serde(default)]
    pub prescriptions: Vec<Prescription>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}
