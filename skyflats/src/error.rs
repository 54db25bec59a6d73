//! Error types for sky flat calibration
//!
//! Two families:
//! - [`SkyFlatsError`]: construction, configuration and run-log errors. These
//!   propagate to the caller.
//! - [`DeviceError`]: failures reported by telescope, camera, filter wheel or
//!   image store. The state machine absorbs these inside a step and retries.

use std::time::Duration;
use thiserror::Error;

/// Errors raised when setting up or persisting a flat-field run
#[derive(Error, Debug)]
pub enum SkyFlatsError {
    /// Exposure time expression for a filter could not be compiled
    #[error("Invalid exposure time function for filter {filter}: {message}")]
    InvalidExpression { filter: String, message: String },

    /// No exposure time function configured for the requested filter
    #[error("No exposure time function configured for filter: {0}")]
    UnknownFilter(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors surfaced by the device proxy layer
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    /// Device did not complete the operation in its allotted time
    #[error("Device timeout: {device} operation '{operation}' after {timeout_secs:.1}s")]
    Timeout {
        device: String,
        operation: String,
        timeout_secs: f64,
    },

    /// Device reported a failure
    #[error("Device error: {device} - {message}")]
    Failed { device: String, message: String },

    /// Image reference could not be resolved to pixel data
    #[error("Download failed for {image}: {message}")]
    Download { image: String, message: String },
}

impl DeviceError {
    pub fn timeout(device: impl Into<String>, operation: impl Into<String>, timeout: Duration) -> Self {
        DeviceError::Timeout {
            device: device.into(),
            operation: operation.into(),
            timeout_secs: timeout.as_secs_f64(),
        }
    }

    pub fn failed(device: impl Into<String>, message: impl Into<String>) -> Self {
        DeviceError::Failed {
            device: device.into(),
            message: message.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, DeviceError::Timeout { .. })
    }
}

/// Result type for device operations
pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Result type for setup and persistence
pub type Result<T> = std::result::Result<T, SkyFlatsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_timeout_display() {
        let err = DeviceError::timeout("camera", "expose", Duration::from_secs(30));
        let msg = err.to_string();
        assert!(msg.contains("camera"));
        assert!(msg.contains("expose"));
        assert!(msg.contains("30.0"));
        assert!(err.is_timeout());
    }

    #[test]
    fn test_device_failed_is_not_timeout() {
        let err = DeviceError::failed("filterwheel", "stuck between positions");
        assert_eq!(err.to_string(), "Device error: filterwheel - stuck between positions");
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_invalid_expression_display() {
        let err = SkyFlatsError::InvalidExpression {
            filter: "V".to_string(),
            message: "unexpected end of input".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid exposure time function for filter V: unexpected end of input"
        );
    }
}
