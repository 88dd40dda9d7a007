use thiserror::Error;

/// Engine error types.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Backpressure: {entity_type} has {depth} operations awaiting sync")]
    Backpressure { entity_type: String, depth: u64 },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
}

impl EngineError {
    /// Whether the error is a flow-control rejection the caller should
    /// back off and retry, rather than a hard failure.
    pub fn is_backpressure(&self) -> bool {
        matches!(self, EngineError::Backpressure { .. })
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let error = EngineError::NotFound("operation abc".to_string());
        assert_eq!(error.to_string(), "Not found: operation abc");
    }

    #[test]
    fn test_illegal_state_display() {
        let error = EngineError::IllegalState("operation is executing".to_string());
        assert_eq!(error.to_string(), "Illegal state: operation is executing");
    }

    #[test]
    fn test_backpressure_display() {
        let error = EngineError::Backpressure {
            entity_type: "invoice".to_string(),
            depth: 512,
        };
        assert_eq!(
            error.to_string(),
            "Backpressure: invoice has 512 operations awaiting sync"
        );
        assert!(error.is_backpressure());
    }

    #[test]
    fn test_storage_display() {
        let error = EngineError::Storage("payload column is not valid JSON".to_string());
        assert_eq!(
            error.to_string(),
            "Storage error: payload column is not valid JSON"
        );
        assert!(!error.is_backpressure());
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("invalid").unwrap_err();
        let err: EngineError = json_err.into();

        match err {
            EngineError::SerdeJson(_) => {}
            _ => panic!("Expected SerdeJson variant"),
        }
    }

    #[test]
    fn test_from_rusqlite_error() {
        let sql_err = rusqlite::Error::QueryReturnedNoRows;
        let err: EngineError = sql_err.into();

        match err {
            EngineError::Sqlite(_) => {}
            _ => panic!("Expected Sqlite variant"),
        }
    }

    #[test]
    fn test_result_ok() {
        let result: Result<i32> = Ok(42);
        assert!(result.is_ok());
    }
}
