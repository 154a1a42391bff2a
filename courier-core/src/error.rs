use thiserror::Error;

/// Failures surfaced by the notification pipeline.
///
/// "Nothing to do" outcomes (no matching binding, no eligible channel) are not
/// errors and never show up here.
#[derive(Debug, Error)]
pub enum CourierError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid stored row: {0}")]
    InvalidRow(String),

    #[error("user directory error: {0}")]
    Directory(String),
}

pub type Result<T> = std::result::Result<T, CourierError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = CourierError::Validation("event_type must not be empty".to_string());
        assert_eq!(err.to_string(), "invalid input: event_type must not be empty");

        let err = CourierError::Pool("timed out".to_string());
        assert_eq!(err.to_string(), "connection pool error: timed out");

        let err = CourierError::from(diesel::result::Error::NotFound);
        assert_eq!(err.to_string(), "database error: Record not found");
    }
}
