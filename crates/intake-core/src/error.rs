use thiserror::Error;

/// Top-level error type for the Intake system.
///
/// Subsystem crates define their own error types and implement
/// `From<IntakeError>` (or the reverse) so that the `?` operator works
/// across crate boundaries.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IntakeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Job bus error: {0}")]
    JobBus(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl From<toml::de::Error> for IntakeError {
    fn from(err: toml::de::Error) -> Self {
        IntakeError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for IntakeError {
    fn from(err: toml::ser::Error) -> Self {
        IntakeError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for IntakeError {
    fn from(err: serde_json::Error) -> Self {
        IntakeError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for Intake operations.
pub type Result<T> = std::result::Result<T, IntakeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = IntakeError::Config("missing field".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing field");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let intake_err: IntakeError = io_err.into();
        assert!(matches!(intake_err, IntakeError::Io(_)));
        assert!(intake_err.to_string().contains("file not found"));
    }

    #[test]
    fn test_error_display_all_variants() {
        let cases: Vec<(IntakeError, &str)> = vec![
            (
                IntakeError::Storage("disk full".into()),
                "Storage error: disk full",
            ),
            (
                IntakeError::Channel("telegram down".into()),
                "Channel error: telegram down",
            ),
            (
                IntakeError::JobBus("no subscribers".into()),
                "Job bus error: no subscribers",
            ),
            (IntakeError::Api("bind".into()), "API error: bind"),
            (
                IntakeError::Serialization("eof".into()),
                "Serialization error: eof",
            ),
            (
                IntakeError::InvalidIdentifier("xx:1".into()),
                "Invalid identifier: xx:1",
            ),
            (IntakeError::RateLimited, "Rate limit exceeded"),
            (IntakeError::ShuttingDown, "Shutdown in progress"),
        ];
        for (err, expected) in cases {
            assert_eq!(err.to_string(), expected);
        }
    }

    #[test]
    fn test_toml_error_conversion() {
        let parse_err = toml::from_str::<toml::Value>("= broken").unwrap_err();
        let err: IntakeError = parse_err.into();
        assert!(matches!(err, IntakeError::Config(_)));
    }

    #[test]
    fn test_json_error_conversion() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: IntakeError = parse_err.into();
        assert!(matches!(err, IntakeError::Serialization(_)));
    }
}
