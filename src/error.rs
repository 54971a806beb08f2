use thiserror::Error;

/// Igatha core error types
#[derive(Error, Debug)]
pub enum IgathaError {
    #[error("SOS unavailable: beacon or alarm cannot be used")]
    SosUnavailable,

    #[error("Detector unavailable: a sensor or the SOS path cannot be used")]
    DetectorUnavailable,

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for core operations
pub type Result<T> = std::result::Result<T, IgathaError>;

impl IgathaError {
    /// Availability problems are recoverable by re-checking later.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            IgathaError::SosUnavailable | IgathaError::DetectorUnavailable
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_classification() {
        assert!(IgathaError::SosUnavailable.is_unavailable());
        assert!(IgathaError::DetectorUnavailable.is_unavailable());
        assert!(!IgathaError::Internal("x".to_string()).is_unavailable());
    }

    #[test]
    fn test_display_messages() {
        let err = IgathaError::InvalidConfig("alpha out of range".to_string());
        assert_eq!(err.to_string(), "Invalid config: alpha out of range");
    }
}
