use thiserror::Error;

pub type KkvResult<T> = Result<T, KkvError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KkvError {
    #[error("Invalid argument ({0})")]
    InvalidArgs(Box<str>),
    #[error("Config error ({0})")]
    ConfigError(Box<str>),
    #[error("Internal error ({0})")]
    InternalError(Box<str>),
    #[error("Decode error ({0})")]
    DecodeError(Box<str>),
    #[error("Checksum mismatch. The data is corrupted.")]
    DecodeChecksumMismatchError,
    #[error("Cannot find ({0})")]
    NotFoundError(Box<str>),
    #[error("Cannot allocate {requested} bytes, {available} bytes left in the pool")]
    NoMemory { requested: usize, available: usize },
    #[error("Unknown Error ({0})")]
    Unknown(Box<str>),
}

impl KkvError {
    /// Structural and configuration errors abort the current open/load.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            KkvError::ConfigError(_) | KkvError::InternalError(_) | KkvError::InvalidArgs(_)
        )
    }
}

impl From<serde_json::Error> for KkvError {
    fn from(e: serde_json::Error) -> Self {
        KkvError::ConfigError(format!("Failed to parse config: {}", e).into_boxed_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_error_becomes_config_error() {
        let err: KkvError = serde_json::from_str::<u32>("{").unwrap_err().into();
        assert!(matches!(err, KkvError::ConfigError(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn display() {
        let err = KkvError::NoMemory {
            requested: 10,
            available: 2,
        };
        assert_eq!(
            err.to_string(),
            "Cannot allocate 10 bytes, 2 bytes left in the pool"
        );
        assert!(!KkvError::DecodeChecksumMismatchError.is_fatal());
    }
}
