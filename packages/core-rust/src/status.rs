//! Mapping between HTTP status codes and classified errors.
//!
//! The policy is a fixed table: 429, 500, 502, 503, and 504 are retryable;
//! every other status at or above 300 (except 304) is a terminal failure.

use std::fmt;

use http::StatusCode;

use crate::error::{Classify, Error};

/// Statuses that signal a transient failure.
pub const RETRYABLE_STATUSES: [StatusCode; 5] = [
    StatusCode::TOO_MANY_REQUESTS,
    StatusCode::INTERNAL_SERVER_ERROR,
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
];

/// Returns `true` if the status is in [`RETRYABLE_STATUSES`].
#[must_use]
pub fn is_retryable_status(status: StatusCode) -> bool {
    RETRYABLE_STATUSES.contains(&status)
}

/// Returns `true` if the status counts as success (below 300, or 304).
#[must_use]
pub fn is_success_status(status: StatusCode) -> bool {
    status.as_u16() < 300 || status == StatusCode::NOT_MODIFIED
}

/// Maps a response status to `Ok(())` on success or a [`StatusError`] otherwise.
///
/// # Errors
///
/// Returns a [`StatusError`] carrying `status` when it is not a success status.
pub fn classify_status(status: StatusCode) -> Result<(), Error> {
    if is_success_status(status) {
        Ok(())
    } else {
        Err(StatusError::new(status).into())
    }
}

/// The status a transport should answer with for a call result.
///
/// 200 on success, otherwise the status carried by the error (500 by default).
pub fn status_code_of<T>(result: &Result<T, Error>) -> StatusCode {
    match result {
        Ok(_) => StatusCode::OK,
        Err(err) => err.status_code(),
    }
}

/// An error that is fully described by its HTTP status.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct StatusError {
    status: StatusCode,
}

impl StatusError {
    /// Creates an error for the given status.
    #[must_use]
    pub fn new(status: StatusCode) -> Self {
        Self { status }
    }

    /// The carried status.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl fmt::Display for StatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status.canonical_reason() {
            Some(reason) => f.write_str(reason),
            None => write!(f, "HTTP status {}", self.status.as_u16()),
        }
    }
}

impl fmt::Debug for StatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StatusError")
            .field(&self.status.as_u16())
            .finish()
    }
}

impl std::error::Error for StatusError {}

impl Classify for StatusError {
    fn retryable(&self) -> Option<bool> {
        Some(is_retryable_status(self.status))
    }

    fn status_code(&self) -> Option<StatusCode> {
        Some(self.status)
    }
}
