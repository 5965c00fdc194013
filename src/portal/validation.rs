use regex::Regex;
use std::str::FromStr;
use std::sync::OnceLock;

use crate::portal::models::{
    ComplaintForm, MeasurementForm, NewComplaint, NewMeasurement, RegisterForm, RegisterRequest,
};
use crate::security::session::Role;

pub const MIN_PASSWORD_LEN: usize = 12;
const EMAIL_PATTERN: &str = r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$";
const PASSWORD_SPECIALS: &str = "!@#$%^&*(),.?\":{}|<>";

const DEFAULT_GENDER: &str = "м";
const DEFAULT_BIRTH_DATE: &str = "2000-01-01";

/// Form problems caught before anything is sent upstream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Invalid email format")]
    InvalidEmail,
    #[error("Passwords do not match")]
    PasswordMismatch,
    #[error("Password must be at least {min} characters long")]
    PasswordTooShort { min: usize },
    #[error("Password must contain an uppercase letter")]
    MissingUppercase,
    #[error("Password must contain a digit")]
    MissingDigit,
    #[error("Password must contain a special character")]
    MissingSpecial,
    #[error("Unknown role '{0}'")]
    UnknownRole(String),
    #[error("Field '{field}' is required")]
    Required { field: &'static str },
    #[error("Field '{field}' must be a number")]
    NotANumber { field: &'static str },
}

fn email_regex() -> &'static Regex {
    static EMAIL_RE: OnceLock<Regex> = OnceLock::new();
    EMAIL_RE.get_or_init(|| Regex::new(EMAIL_PATTERN).expect("email pattern compiles"))
}

pub fn validate_email(email: &str) -> bool {
    email_regex().is_match(email)
}

/// Password policy, checked in a fixed order so the first failing rule is reported.
pub fn validate_password(password: &str, confirmation: &str) -> Result<(), ValidationError> {
    if password != confirmation {
        return Err(ValidationError::PasswordMismatch);
    }
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ValidationError::PasswordTooShort {
            min: MIN_PASSWORD_LEN,
        });
    }
    if !password.chars().any(|c| c.is_ascii_uppercase()) {
        return Err(ValidationError::MissingUppercase);
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        return Err(ValidationError::MissingDigit);
    }
    if !password.chars().any(|c| PASSWORD_SPECIALS.contains(c)) {
        return Err(ValidationError::MissingSpecial);
    }
    Ok(())
}

fn non_blank(raw: Option<&str>) -> Option<&str> {
    raw.map(str::trim).filter(|s| !s.is_empty())
}

/// Blank means absent; anything else has to parse.
pub fn parse_optional<T: FromStr>(
    field: &'static str,
    raw: Option<&str>,
) -> Result<Option<T>, ValidationError> {
    match non_blank(raw) {
        None => Ok(None),
        Some(text) => text
            .parse()
            .map(Some)
            .map_err(|_| ValidationError::NotANumber { field }),
    }
}

/// Like `parse_optional`, but NaN and infinities are not numbers either.
pub fn parse_optional_f64(
    field: &'static str,
    raw: Option<&str>,
) -> Result<Option<f64>, ValidationError> {
    match parse_optional::<f64>(field, raw)? {
        Some(value) if !value.is_finite() => Err(ValidationError::NotANumber { field }),
        parsed => Ok(parsed),
    }
}

pub fn registration_request(form: &RegisterForm) -> Result<RegisterRequest, ValidationError> {
    let email = form.email.trim();
    if !validate_email(email) {
        return Err(ValidationError::InvalidEmail);
    }
    validate_password(&form.password, &form.confirm_password)?;
    let role: Role = form
        .role
        .parse()
        .map_err(ValidationError::UnknownRole)?;

    let text = |value: &Option<String>| non_blank(value.as_deref()).unwrap_or("").to_string();

    Ok(RegisterRequest {
        email: email.to_string(),
        password: form.password.clone(),
        role,
        surname: text(&form.surname),
        name: text(&form.name),
        patronim: text(&form.patronim),
        gender: non_blank(form.gender.as_deref())
            .unwrap_or(DEFAULT_GENDER)
            .to_string(),
        birth_date: non_blank(form.birth_date.as_deref())
            .unwrap_or(DEFAULT_BIRTH_DATE)
            .to_string(),
        height: parse_optional_f64("height", form.height.as_deref())?,
        weight: parse_optional_f64("weight", form.weight.as_deref())?,
    })
}

pub fn measurement_from_form(form: &MeasurementForm) -> Result<NewMeasurement, ValidationError> {
    Ok(NewMeasurement {
        glucose: parse_optional_f64("glucose", form.glucose.as_deref())?,
        systolic_bp: parse_optional("systolic_bp", form.systolic_bp.as_deref())?,
        diastolic_bp: parse_optional("diastolic_bp", form.diastolic_bp.as_deref())?,
        pulse: parse_optional("pulse", form.pulse.as_deref())?,
        weight: parse_optional_f64("weight", form.weight.as_deref())?,
    })
}

pub fn complaint_from_form(form: &ComplaintForm) -> Result<NewComplaint, ValidationError> {
    let symptom_id = parse_optional("symptom_id", Some(&form.symptom_id))?
        .ok_or(ValidationError::Required { field: "symptom_id" })?;
    let severity = form.severity.trim();
    if severity.is_empty() {
        return Err(ValidationError::Required { field: "severity" });
    }
    Ok(NewComplaint {
        symptom_id,
        severity: severity.to_string(),
        description: non_blank(form.description.as_deref()).map(str::to_string),
    })
}
