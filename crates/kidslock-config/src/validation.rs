//! Configuration validation

use crate::schema::{RawConfig, RawDevice};
use kidslock_util::WallClock;
use std::collections::HashSet;
use thiserror::Error;

/// Validation error
#[derive(Debug, Clone, Error)]
pub enum ValidationError {
    #[error("Device '{device_id}': {message}")]
    DeviceError { device_id: String, message: String },

    #[error("Duplicate device ID: {0}")]
    DuplicateDeviceId(String),

    #[error("Invalid time format '{value}': {message}")]
    InvalidTimeFormat { value: String, message: String },

    #[error("Service config error: {0}")]
    ServiceError(String),
}

/// Validate a raw configuration
pub fn validate_config(config: &RawConfig) -> Vec<ValidationError> {
    let mut errors = validate_service(config);

    let mut seen_ids = HashSet::new();
    for device in &config.devices {
        let id = device.effective_id();
        if !id.is_empty() && !seen_ids.insert(id.clone()) {
            errors.push(ValidationError::DuplicateDeviceId(id));
        }
    }

    for device in &config.devices {
        errors.extend(validate_device(device));
    }

    errors
}

fn validate_service(config: &RawConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let service = &config.service;

    if service.tick_interval_seconds == Some(0) {
        errors.push(ValidationError::ServiceError(
            "tick_interval_seconds must be greater than zero".into(),
        ));
    }
    if service.command_timeout_ms == Some(0) {
        errors.push(ValidationError::ServiceError(
            "command_timeout_ms must be greater than zero".into(),
        ));
    }
    if service.probe_timeout_ms == Some(0) {
        errors.push(ValidationError::ServiceError(
            "probe_timeout_ms must be greater than zero".into(),
        ));
    }
    if service.control_port == Some(0) {
        errors.push(ValidationError::ServiceError(
            "control_port must be greater than zero".into(),
        ));
    }
    if service.default_daily_limit_minutes == Some(0) {
        errors.push(ValidationError::ServiceError(
            "default_daily_limit_minutes must be greater than zero".into(),
        ));
    }
    if let Some(bedtime) = &service.default_bedtime {
        errors.extend(check_time(bedtime));
    }

    errors
}

fn validate_device(device: &RawDevice) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let device_id = device.effective_id();

    if device_id.is_empty() {
        errors.push(ValidationError::DeviceError {
            device_id: device.name.clone(),
            message: "name or id must not be empty".into(),
        });
    }

    if device.address.trim().is_empty() {
        errors.push(ValidationError::DeviceError {
            device_id: device_id.clone(),
            message: "address cannot be empty".into(),
        });
    }

    if device.daily_limit_minutes == Some(0) {
        errors.push(ValidationError::DeviceError {
            device_id: device_id.clone(),
            message: "daily_limit_minutes must be greater than zero".into(),
        });
    }

    if let Some(bedtime) = &device.bedtime {
        errors.extend(check_time(bedtime));
    }

    for (weekday, day) in device.schedule.entries() {
        let Some(day) = day else { continue };
        if day.limit_minutes == Some(0) {
            errors.push(ValidationError::DeviceError {
                device_id: device_id.clone(),
                message: format!("limit_minutes for {} must be greater than zero", weekday),
            });
        }
        if let Some(bedtime) = &day.bedtime {
            errors.extend(check_time(bedtime));
        }
    }

    errors
}

fn check_time(value: &str) -> Option<ValidationError> {
    parse_time(value)
        .err()
        .map(|message| ValidationError::InvalidTimeFormat {
            value: value.to_string(),
            message,
        })
}

/// Parse HH:MM time format
pub fn parse_time(s: &str) -> Result<WallClock, String> {
    s.parse::<WallClock>().map_err(|e| e.to_string())
}
