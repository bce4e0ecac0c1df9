//! The uniform error taxonomy shared by every back end.

use thiserror::Error;

/// Outcome class of a fallible call. `Success` exists so callers that log or
/// count results can map `Ok` into the same vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    Success,
    Failure,
    InvalidArgs,
    NotInitialized,
    NotImplemented,
    TimeOut,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{context}: {message}")]
    Failure { context: &'static str, message: String },

    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("{0} is not initialized")]
    NotInitialized(&'static str),

    #[error("Not implemented: {0}")]
    NotImplemented(&'static str),

    #[error("Timed out waiting for {0}")]
    TimeOut(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn code(&self) -> ResultCode {
        match self {
            Error::Failure { .. } => ResultCode::Failure,
            Error::InvalidArgs(_) => ResultCode::InvalidArgs,
            Error::NotInitialized(_) => ResultCode::NotInitialized,
            Error::NotImplemented(_) => ResultCode::NotImplemented,
            Error::TimeOut(_) => ResultCode::TimeOut,
        }
    }

    /// Build a [`Error::Failure`] and log it at `error`.
    pub fn failure(context: &'static str, cause: impl std::fmt::Display) -> Self {
        let message = cause.to_string();
        tracing::error!("{}: {}", context, message);
        Error::Failure { context, message }
    }

    /// Build a [`Error::InvalidArgs`] and log it at `warn`.
    pub fn invalid(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::warn!("Invalid arguments: {}", message);
        Error::InvalidArgs(message)
    }

    pub fn not_implemented(what: &'static str) -> Self {
        tracing::warn!("Not implemented: {}", what);
        Error::NotImplemented(what)
    }
}

/// Map a `Result` onto its [`ResultCode`].
pub fn result_code<T>(result: &Result<T>) -> ResultCode {
    match result {
        Ok(_) => ResultCode::Success,
        Err(e) => e.code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_variants() {
        assert_eq!(Error::failure("ctx", "boom").code(), ResultCode::Failure);
        assert_eq!(Error::invalid("bad").code(), ResultCode::InvalidArgs);
        assert_eq!(Error::NotInitialized("Image").code(), ResultCode::NotInitialized);
        assert_eq!(Error::not_implemented("ray tracing").code(), ResultCode::NotImplemented);
        assert_eq!(Error::TimeOut("fence").code(), ResultCode::TimeOut);
        assert_eq!(result_code(&Ok::<(), Error>(())), ResultCode::Success);
    }

    #[test]
    fn failure_message_includes_context() {
        let e = Error::failure("Creating buffer", "out of memory");
        assert_eq!(e.to_string(), "Creating buffer: out of memory");
    }
}
