//! Field-level validation for test plans.
//!
//! Validators return a single [`ValidationError`]; a [`ValidationContext`]
//! walks the document, tracks the dotted field path and collects every error
//! so a broken plan is reported in one pass.

use crate::thresholds::Threshold;
use thiserror::Error;

/// Plan format versions this build understands.
pub const SUPPORTED_VERSIONS: &[&str] = &["1.0"];

/// Validation error with context about which field failed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Field '{field}': {message}")]
    FieldError { field: String, message: String },

    #[error("Field '{field}' is required but not provided")]
    RequiredField { field: String },

    #[error("Field '{field}': value {value} is out of range ({min} to {max})")]
    OutOfRange {
        field: String,
        value: String,
        min: String,
        max: String,
    },

    #[error("Field '{field}': invalid format - {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Field '{field}': invalid enum value '{value}'. Expected one of: {expected}")]
    InvalidEnum {
        field: String,
        value: String,
        expected: String,
    },

    #[error("Multiple validation errors: {0}")]
    Multiple(String),
}

pub type ValidationResult<T> = Result<T, ValidationError>;

/// Collects errors while walking nested fields.
#[derive(Default)]
pub struct ValidationContext {
    field_path: Vec<String>,
    errors: Vec<ValidationError>,
}

impl ValidationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter a nested field context.
    pub fn enter(&mut self, field: &str) {
        self.field_path.push(field.to_string());
    }

    pub fn exit(&mut self) {
        self.field_path.pop();
    }

    /// Dotted path of the field being validated.
    pub fn current_path(&self) -> String {
        self.field_path.join(".")
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    /// Add a field error at the current path.
    pub fn field_error(&mut self, message: String) {
        self.add_error(ValidationError::FieldError {
            field: self.current_path(),
            message,
        });
    }

    /// Records `result`'s error, if any, at the current path.
    pub fn check(&mut self, result: ValidationResult<()>) {
        if let Err(e) = result {
            self.field_error(e.to_string());
        }
    }

    pub fn errors(&self) -> &[ValidationError] {
        &self.errors
    }

    pub fn into_result(self) -> Result<(), ValidationError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            let messages: Vec<String> = self.errors.iter().map(|e| e.to_string()).collect();
            Err(ValidationError::Multiple(messages.join("; ")))
        }
    }
}

pub struct VersionValidator;

impl VersionValidator {
    pub fn validate(version: &str) -> ValidationResult<()> {
        if SUPPORTED_VERSIONS.contains(&version.trim()) {
            Ok(())
        } else {
            Err(ValidationError::InvalidEnum {
                field: "version".to_string(),
                value: version.to_string(),
                expected: SUPPORTED_VERSIONS.join(", "),
            })
        }
    }
}

pub struct UrlValidator;

impl UrlValidator {
    pub fn validate(url: &str) -> ValidationResult<()> {
        if url.is_empty() {
            return Err(ValidationError::InvalidFormat {
                field: "url".to_string(),
                message: "URL cannot be empty".to_string(),
            });
        }

        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ValidationError::InvalidFormat {
                field: "url".to_string(),
                message: format!("Invalid base URL, must start with http:// or https://, got: {}", url),
            });
        }

        if url.contains(' ') {
            return Err(ValidationError::InvalidFormat {
                field: "url".to_string(),
                message: "URL cannot contain spaces".to_string(),
            });
        }

        reqwest::Url::parse(url).map_err(|e| ValidationError::InvalidFormat {
            field: "url".to_string(),
            message: format!("Invalid base URL '{}': {}", url, e),
        })?;

        Ok(())
    }
}

pub struct DurationValidator;

impl DurationValidator {
    pub fn validate(duration_str: &str) -> ValidationResult<()> {
        Self::parse(duration_str).map(|_| ())
    }

    pub fn validate_positive(duration_str: &str) -> ValidationResult<()> {
        let duration = Self::parse(duration_str)?;
        if duration.is_zero() {
            return Err(ValidationError::OutOfRange {
                field: "duration".to_string(),
                value: duration_str.to_string(),
                min: "1ms".to_string(),
                max: "unlimited".to_string(),
            });
        }
        Ok(())
    }

    fn parse(duration_str: &str) -> ValidationResult<std::time::Duration> {
        crate::utils::parse_duration_string(duration_str).map_err(|e| ValidationError::InvalidFormat {
            field: "duration".to_string(),
            message: format!("Invalid duration format '{}': {}", duration_str, e),
        })
    }
}

pub struct RangeValidator;

impl RangeValidator {
    pub fn validate_u64(value: u64, min: u64, max: u64, field: &str) -> ValidationResult<()> {
        if value < min || value > max {
            return Err(ValidationError::OutOfRange {
                field: field.to_string(),
                value: value.to_string(),
                min: min.to_string(),
                max: max.to_string(),
            });
        }
        Ok(())
    }

    pub fn validate_non_negative_f64(value: f64, field: &str) -> ValidationResult<()> {
        if !value.is_finite() || value < 0.0 {
            return Err(ValidationError::OutOfRange {
                field: field.to_string(),
                value: value.to_string(),
                min: "0.0".to_string(),
                max: "unlimited".to_string(),
            });
        }
        Ok(())
    }
}

/// Validator for HTTP methods.
pub struct HttpMethodValidator;

impl HttpMethodValidator {
    const VALID_METHODS: &'static [&'static str] =
        &["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];

    pub fn validate(method: &str) -> ValidationResult<()> {
        let method_upper = method.to_uppercase();
        if !Self::VALID_METHODS.contains(&method_upper.as_str()) {
            return Err(ValidationError::InvalidEnum {
                field: "method".to_string(),
                value: method.to_string(),
                expected: Self::VALID_METHODS.join(", "),
            });
        }
        Ok(())
    }
}

/// Upper bound on any single stage target.
pub const MAX_STAGE_TARGET: u64 = 100_000;

pub struct StageValidator;

impl StageValidator {
    pub fn validate_target(target: u32) -> ValidationResult<()> {
        RangeValidator::validate_u64(target as u64, 0, MAX_STAGE_TARGET, "target")
    }

    /// A profile must run for some time and admit at least one user.
    pub fn validate_profile(durations_and_targets: &[(std::time::Duration, u32)]) -> ValidationResult<()> {
        if durations_and_targets.is_empty() {
            return Err(ValidationError::RequiredField {
                field: "stages".to_string(),
            });
        }
        if durations_and_targets.iter().all(|(d, _)| d.is_zero()) {
            return Err(ValidationError::FieldError {
                field: "stages".to_string(),
                message: "total ramp duration must be greater than zero".to_string(),
            });
        }
        if durations_and_targets.iter().all(|(_, t)| *t == 0) {
            return Err(ValidationError::FieldError {
                field: "stages".to_string(),
                message: "at least one stage must have a target above zero".to_string(),
            });
        }
        Ok(())
    }
}

pub struct WeightValidator;

impl WeightValidator {
    pub fn validate(weight: f64) -> ValidationResult<()> {
        RangeValidator::validate_non_negative_f64(weight, "weight")
    }

    pub fn validate_total(weights: &[f64]) -> ValidationResult<()> {
        let total: f64 = weights.iter().sum();
        if total <= 0.0 {
            return Err(ValidationError::FieldError {
                field: "scenarios".to_string(),
                message: "scenario weights must sum to more than zero".to_string(),
            });
        }
        Ok(())
    }
}

pub struct ThresholdValidator;

impl ThresholdValidator {
    pub fn validate(metric: &str, expression: &str) -> ValidationResult<()> {
        Threshold::parse(metric, expression)
            .map(|_| ())
            .map_err(|e| ValidationError::InvalidFormat {
                field: metric.to_string(),
                message: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_url_validator() {
        assert!(UrlValidator::validate("https://example.com").is_ok());
        assert!(UrlValidator::validate("http://localhost:8080/api").is_ok());

        assert!(UrlValidator::validate("").is_err());
        assert!(UrlValidator::validate("example.com").is_err());
        assert!(UrlValidator::validate("ftp://example.com").is_err());
        assert!(UrlValidator::validate("https://exa mple.com").is_err());
    }

    #[test]
    fn test_duration_validator() {
        assert!(DurationValidator::validate("30s").is_ok());
        assert!(DurationValidator::validate("500ms").is_ok());
        assert!(DurationValidator::validate("invalid").is_err());
        assert!(DurationValidator::validate_positive("0s").is_err());
        assert!(DurationValidator::validate_positive("1s").is_ok());
    }

    #[test]
    fn test_version_validator() {
        assert!(VersionValidator::validate("1.0").is_ok());
        let err = VersionValidator::validate("2.0").unwrap_err();
        assert!(err.to_string().contains("Expected one of: 1.0"));
    }

    #[test]
    fn test_http_method_validator() {
        assert!(HttpMethodValidator::validate("get").is_ok());
        assert!(HttpMethodValidator::validate("DELETE").is_ok());
        assert!(HttpMethodValidator::validate("FETCH").is_err());
    }

    #[test]
    fn test_stage_profile_validation() {
        let secs = Duration::from_secs;
        assert!(StageValidator::validate_profile(&[(secs(10), 5), (secs(10), 0)]).is_ok());
        assert!(StageValidator::validate_profile(&[]).is_err());
        assert!(StageValidator::validate_profile(&[(secs(0), 5)]).is_err());
        assert!(StageValidator::validate_profile(&[(secs(10), 0)]).is_err());
        assert!(StageValidator::validate_target(200_000).is_err());
    }

    #[test]
    fn test_weight_validation() {
        assert!(WeightValidator::validate(0.0).is_ok());
        assert!(WeightValidator::validate(-0.1).is_err());
        assert!(WeightValidator::validate(f64::NAN).is_err());
        assert!(WeightValidator::validate_total(&[0.0, 0.0]).is_err());
        assert!(WeightValidator::validate_total(&[0.1, 0.9]).is_ok());
    }

    #[test]
    fn test_threshold_validation() {
        assert!(ThresholdValidator::validate("errors", "rate<0.05").is_ok());
        assert!(ThresholdValidator::validate("errors", "rate<=>1").is_err());
    }

    #[test]
    fn test_validation_context_paths() {
        let mut ctx = ValidationContext::new();

        ctx.enter("scenarios");
        ctx.enter("[2]");
        ctx.enter("weight");
        assert_eq!(ctx.current_path(), "scenarios.[2].weight");
        ctx.check(WeightValidator::validate(-1.0));
        ctx.exit();
        ctx.exit();
        ctx.exit();

        assert_eq!(ctx.errors().len(), 1);
        let err = ctx.into_result().unwrap_err();
        assert!(err.to_string().contains("scenarios.[2].weight"));
    }
}
