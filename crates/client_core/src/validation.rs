use std::collections::BTreeMap;

use shared::protocol::{
    CreateEvaluationRequest, EvaluationListQuery, LoginRequest, SignupRequest,
    UpdateProfileRequest,
};
use thiserror::Error;

const EARLIEST_VEHICLE_YEAR: i32 = 1900;

/// Field name to message, for every field that failed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Error)]
#[error("invalid input: {}", describe(.fields))]
pub struct ValidationErrors {
    pub fields: BTreeMap<String, String>,
}

fn describe(fields: &BTreeMap<String, String>) -> String {
    fields
        .iter()
        .map(|(field, message)| format!("{field}: {message}"))
        .collect::<Vec<_>>()
        .join("; ")
}

impl ValidationErrors {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    fn add(&mut self, field: &str, message: impl Into<String>) {
        self.fields
            .entry(field.to_string())
            .or_insert_with(|| message.into());
    }

    fn into_result(self) -> Result<(), Self> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }

    fn length(&mut self, field: &str, value: &str, min: usize, max: usize, label: &str) {
        let len = value.trim().chars().count();
        if len == 0 && min > 0 {
            self.add(field, format!("{label} is required"));
        } else if len < min {
            self.add(field, format!("{label} must have at least {min} characters"));
        } else if len > max {
            self.add(field, format!("{label} must have at most {max} characters"));
        }
    }

    fn email(&mut self, value: &str) {
        let value = value.trim();
        if value.is_empty() {
            self.add("email", "email is required");
        } else if !looks_like_email(value) {
            self.add("email", "email is invalid");
        }
    }

    fn phone(&mut self, value: Option<&str>) {
        if let Some(phone) = value.map(str::trim).filter(|phone| !phone.is_empty()) {
            if phone.chars().filter(char::is_ascii_digit).count() < 10 {
                self.add("phone", "phone must have at least 10 digits");
            }
        }
    }
}

fn looks_like_email(value: &str) -> bool {
    let Some((local, domain)) = value.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && !value.chars().any(char::is_whitespace)
        && domain
            .split_once('.')
            .is_some_and(|(host, tld)| !host.is_empty() && !tld.is_empty() && !tld.ends_with('.'))
}

pub fn validate_login(request: &LoginRequest) -> Result<(), ValidationErrors> {
    let mut errors = ValidationErrors::default();
    errors.email(&request.email);
    if request.password.chars().count() < 6 {
        errors.add("password", "password must have at least 6 characters");
    }
    errors.into_result()
}

pub fn validate_signup(request: &SignupRequest) -> Result<(), ValidationErrors> {
    let mut errors = ValidationErrors::default();
    errors.length("full_name", &request.full_name, 2, 100, "name");
    errors.email(&request.email);
    let password_len = request.password.chars().count();
    if password_len < 6 {
        errors.add("password", "password must have at least 6 characters");
    } else if password_len > 100 {
        errors.add("password", "password must have at most 100 characters");
    }
    errors.phone(request.phone.as_deref());
    errors.into_result()
}

pub fn validate_profile(request: &UpdateProfileRequest) -> Result<(), ValidationErrors> {
    let mut errors = ValidationErrors::default();
    errors.length("full_name", &request.full_name, 2, 100, "name");
    errors.phone(request.phone.as_deref());
    errors.into_result()
}

pub fn validate_new_evaluation(
    request: &CreateEvaluationRequest,
    current_year: i32,
) -> Result<(), ValidationErrors> {
    let mut errors = ValidationErrors::default();
    if request.city_id.0 < 1 {
        errors.add("city_id", "city is required");
    }
    errors.length("vehicle_make", &request.vehicle_make, 1, 50, "vehicle make");
    errors.length("vehicle_model", &request.vehicle_model, 1, 50, "vehicle model");
    errors.length("vehicle_plate", &request.vehicle_plate, 1, 10, "vehicle plate");
    if request.vehicle_year < EARLIEST_VEHICLE_YEAR {
        errors.add(
            "vehicle_year",
            format!("year must be {EARLIEST_VEHICLE_YEAR} or later"),
        );
    } else if request.vehicle_year > current_year + 1 {
        errors.add("vehicle_year", "year cannot be in the future");
    }
    errors.length("notes", &request.notes, 1, 500, "notes");
    errors.into_result()
}

pub fn validate_list_query(query: &EvaluationListQuery) -> Result<(), ValidationErrors> {
    let mut errors = ValidationErrors::default();
    if query.page == Some(0) {
        errors.add("page", "page must be greater than 0");
    }
    match query.limit {
        Some(0) => errors.add("limit", "limit must be greater than 0"),
        Some(limit) if limit > 100 => errors.add("limit", "limit must be at most 100"),
        _ => {}
    }
    errors.into_result()
}
