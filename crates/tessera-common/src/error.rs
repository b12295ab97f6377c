//! Error types for Tessera
//!
//! This module defines:
//! - `TesseraError`: process-level error enum shared across crates
//! - `AppError`: wrapper for integration at application boundaries

use std::fmt::{Display, Formatter};

/// Process-level error types
#[derive(thiserror::Error, Debug)]
pub enum TesseraError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("node '{0}' is not known to this cluster")]
    UnknownNode(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for TesseraError {
    fn from(value: std::io::Error) -> Self {
        TesseraError::Storage(value.to_string())
    }
}

/// Wrapper for application errors
#[derive(Debug)]
pub struct AppError {
    inner: anyhow::Error,
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        AppError { inner: value }
    }
}

impl AppError {
    pub fn inner(&self) -> &anyhow::Error {
        &self.inner
    }

    pub fn downcast_ref<E: std::error::Error + Send + Sync + 'static>(&self) -> Option<&E> {
        self.inner.downcast_ref::<E>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TesseraError::Config("missing group name".to_string());
        assert_eq!(format!("{}", err), "invalid configuration: missing group name");

        let err = TesseraError::Network("socket closed".to_string());
        assert_eq!(format!("{}", err), "network error: socket closed");
    }

    #[test]
    fn test_app_error_from_anyhow() {
        let anyhow_err = anyhow::anyhow!("test error");
        let app_err = AppError::from(anyhow_err);
        assert_eq!(format!("{}", app_err), "test error");
    }

    #[test]
    fn test_from_io_error() {
        let io = std::io::Error::other("disk gone");
        let err: TesseraError = io.into();
        assert!(matches!(err, TesseraError::Storage(_)));
    }
}
