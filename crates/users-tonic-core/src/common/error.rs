//! Error types for the user service.
//!
//! This module defines the central `Error` enum, a small closed taxonomy that
//! callers branch on by kind rather than by message. It implements
//! `From<Error>` for `tonic::Status` so handlers can propagate store failures
//! to clients with `?` and get the matching status code.
//!
//! ## Error Cases
//! - `InvalidArgument`: A required field (`id`, `email`, `name`) was empty.
//! - `NotFound`: No user is stored under the requested id.
//! - `SinkClosed`: The streaming sink refused an item (caller went away).
//! - `ServiceShutdown`: A request arrived while the service was draining.

use tonic::Status;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the user service.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// A required request field was missing or empty.
    #[error("Invalid argument: {reason}")]
    InvalidArgument { reason: String },

    /// The requested user does not exist.
    #[error("User not found: {id}")]
    NotFound { id: String },

    /// The streaming sink rejected an item, typically because the client
    /// disconnected.
    #[error("Stream sink closed: {context}")]
    SinkClosed { context: String },

    /// The service is in the process of shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,
}

impl Error {
    pub(crate) fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::InvalidArgument { reason } => Status::invalid_argument(reason),
            Error::NotFound { .. } => Status::not_found("user not found"),
            Error::SinkClosed { context } => {
                Status::cancelled(format!("Stream closed: {}", context))
            }
            Error::ServiceShutdown => Status::unavailable("Service is shutting down"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    #[test]
    fn maps_each_kind_to_its_status_code() {
        let cases = [
            (Error::invalid_argument("id is required"), Code::InvalidArgument),
            (
                Error::NotFound {
                    id: "user_9".to_string(),
                },
                Code::NotFound,
            ),
            (
                Error::SinkClosed {
                    context: "receiver dropped".to_string(),
                },
                Code::Cancelled,
            ),
            (Error::ServiceShutdown, Code::Unavailable),
        ];

        for (err, code) in cases {
            assert_eq!(Status::from(err).code(), code);
        }
    }

    #[test]
    fn invalid_argument_keeps_reason_as_status_message() {
        let status = Status::from(Error::invalid_argument("email and name are required"));
        assert_eq!(status.message(), "email and name are required");
    }
}
