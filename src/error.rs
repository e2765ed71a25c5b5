//! Error types for the riddler core.

use std::error::Error as StdError;
use std::fmt;
use std::path::PathBuf;
use std::result;

use crate::session::Role;

/// A specialized Result type for riddler operations.
pub type Result<T> = result::Result<T, Error>;

/// Failure to bring the model weights up. Fatal to the whole core.
#[derive(Debug)]
pub enum LoadError {
    /// The model path does not resolve to a file
    FileNotFound(PathBuf),
    /// The computation engine rejected the model or its parameters
    NativeInit(String),
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::FileNotFound(path) => write!(f, "model file not found: {}", path.display()),
            LoadError::NativeInit(msg) => write!(f, "native initialization failed: {}", msg),
        }
    }
}

/// The error type for riddler operations.
#[derive(Debug)]
pub enum Error {
    /// Model load errors
    Load(LoadError),
    /// A request is already in flight on the session
    SessionBusy(Role),
    /// Runtime failure while generating
    Generation(String),
    /// The core has not finished initializing
    NotReady,
    /// The core has been shut down
    ShutDown,
    /// Validation errors
    Validation(String),
    /// Configuration errors
    Config(String),
    /// Prompt template errors
    Template(String),
    /// I/O errors
    Io(std::io::Error),
    /// Internal errors
    Internal(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Load(err) => write!(f, "Load error: {}", err),
            Error::SessionBusy(role) => write!(f, "Session busy: {} already has a request in flight", role),
            Error::Generation(msg) => write!(f, "Generation error: {}", msg),
            Error::NotReady => write!(f, "Core is not ready: model not loaded"),
            Error::ShutDown => write!(f, "Core has been shut down"),
            Error::Validation(msg) => write!(f, "Validation error: {}", msg),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::Template(msg) => write!(f, "Template error: {}", msg),
            Error::Io(err) => write!(f, "I/O error: {}", err),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl StdError for LoadError {}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Load(err) => Some(err),
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<LoadError> for Error {
    fn from(err: LoadError) -> Self {
        Error::Load(err)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<minijinja::Error> for Error {
    fn from(err: minijinja::Error) -> Self {
        Error::Template(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_error_display() {
        let err: Error = LoadError::FileNotFound(PathBuf::from("/models/missing.gguf")).into();
        assert_eq!(
            err.to_string(),
            "Load error: model file not found: /models/missing.gguf"
        );
        assert!(err.source().is_some());
    }

    #[test]
    fn test_session_busy_display() {
        let err = Error::SessionBusy(Role::Grader);
        assert_eq!(
            err.to_string(),
            "Session busy: grader already has a request in flight"
        );
    }

    #[test]
    fn test_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "io error");
        assert!(matches!(Error::from(io_err), Error::Io(_)));

        let config_err = config::ConfigError::NotFound("model.path".to_string());
        assert!(matches!(Error::from(config_err), Error::Config(_)));
    }
}
