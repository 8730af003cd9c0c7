//! Error classification shared by every layer of a call chain.
//!
//! Any error that crosses an endpoint boundary is an [`Error`]: a boxed value
//! implementing [`Classify`]. The trait exposes exactly three capabilities:
//!
//! - `retryable()` -- an explicit "safe to retry" answer, if this level has one
//! - `status_code()` -- a transport status carried by this level, if any
//! - `cause()` -- the immediate error this level wraps for context
//!
//! Classification walks the cause chain from the outside in. The first level
//! that answers `retryable()` wins, so [`Error::retryable`] overrides whatever
//! the wrapped error says.

use std::error::Error as StdError;
use std::fmt;

use http::StatusCode;

/// Upper bound on the number of cause links followed during classification.
///
/// Chains longer than this are treated as "not retryable" and "no status".
pub const MAX_CAUSE_DEPTH: usize = 64;

// ---------------------------------------------------------------------------
// Classify trait
// ---------------------------------------------------------------------------

/// Object-safe access to the underlying `std::error::Error`.
///
/// Implemented for every eligible type; it only exists so that `dyn Classify`
/// can be viewed as a standard error without trait upcasting.
#[doc(hidden)]
pub trait AsStdError {
    fn as_std_error(&self) -> &(dyn StdError + Send + Sync + 'static);
    fn into_std_error(self: Box<Self>) -> Box<dyn StdError + Send + Sync + 'static>;
}

impl<T: StdError + Send + Sync + 'static> AsStdError for T {
    fn as_std_error(&self) -> &(dyn StdError + Send + Sync + 'static) {
        self
    }

    fn into_std_error(self: Box<Self>) -> Box<dyn StdError + Send + Sync + 'static> {
        self
    }
}

/// Capability set consulted by the retry, circuit-breaker, and HTTP layers.
///
/// Every method defaults to "not exposed", so a plain error type opts in with
/// an empty `impl Classify for MyError {}`.
pub trait Classify: StdError + AsStdError + Send + Sync + 'static {
    /// Explicit retry classification at this level, or `None` to defer to the cause.
    fn retryable(&self) -> Option<bool> {
        None
    }

    /// Transport status carried at this level, or `None` to defer to the cause.
    fn status_code(&self) -> Option<StatusCode> {
        None
    }

    /// The immediate error wrapped by this one.
    fn cause(&self) -> Option<&dyn Classify> {
        None
    }
}

/// Walks the cause chain and returns the first explicit retry classification.
///
/// Unclassified chains, and chains deeper than [`MAX_CAUSE_DEPTH`], are not retryable.
#[must_use]
pub fn is_retryable(err: &dyn Classify) -> bool {
    let mut current = err;
    for _ in 0..MAX_CAUSE_DEPTH {
        if let Some(retryable) = current.retryable() {
            return retryable;
        }
        match Classify::cause(current) {
            Some(cause) => current = cause,
            None => return false,
        }
    }
    false
}

/// Walks the cause chain and returns the first status code found, if any.
#[must_use]
pub fn find_status_code(err: &dyn Classify) -> Option<StatusCode> {
    let mut current = err;
    for _ in 0..MAX_CAUSE_DEPTH {
        if let Some(status) = current.status_code() {
            return Some(status);
        }
        current = Classify::cause(current)?;
    }
    None
}

/// Marks an error as retryable, regardless of what it wraps.
#[must_use]
pub fn mark_retryable(err: impl Into<Error>) -> Error {
    err.into().retryable()
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// The error type returned by endpoints and middleware.
///
/// `Error` does not implement `std::error::Error` itself, so any [`Classify`]
/// type converts into it with `?`. Use [`Error::other`] for foreign error
/// types that do not implement `Classify`.
pub struct Error {
    inner: Box<dyn Classify>,
}

impl Error {
    /// Wraps a classified error.
    pub fn new<E: Classify>(error: E) -> Self {
        Self {
            inner: Box::new(error),
        }
    }

    /// Creates an unclassified error from a message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(Message(message.into()))
    }

    /// Wraps a foreign error as an unclassified (terminal, status-less) error.
    pub fn other<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::new(Opaque(Box::new(error)))
    }

    /// Returns `true` if the cause chain is classified as retryable.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        is_retryable(self.as_classify())
    }

    /// The status code carried by the cause chain, defaulting to 500.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        self.explicit_status_code()
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// The status code carried by the cause chain, without a default.
    #[must_use]
    pub fn explicit_status_code(&self) -> Option<StatusCode> {
        find_status_code(self.as_classify())
    }

    /// Marks this error as retryable. The message is unchanged.
    #[must_use]
    pub fn retryable(self) -> Self {
        Self::new(Retryable { inner: self })
    }

    /// Wraps this error with a context message, keeping it as the cause.
    #[must_use]
    pub fn context(self, message: impl Into<String>) -> Self {
        Self::new(Context {
            message: message.into(),
            inner: self,
        })
    }

    /// Borrows the outermost level of the chain.
    #[must_use]
    pub fn as_classify(&self) -> &dyn Classify {
        &*self.inner
    }

    /// Iterates over the cause chain, outermost first.
    #[must_use]
    pub fn chain(&self) -> Chain<'_> {
        Chain {
            next: Some(self.as_classify()),
            remaining: MAX_CAUSE_DEPTH,
        }
    }

    /// Returns the first level of the chain with concrete type `T`.
    #[must_use]
    pub fn find<T: Classify>(&self) -> Option<&T> {
        self.chain()
            .find_map(|level| level.as_std_error().downcast_ref::<T>())
    }

    /// Returns `true` if the outermost level has concrete type `T`.
    #[must_use]
    pub fn is<T: Classify>(&self) -> bool {
        self.inner.as_std_error().is::<T>()
    }

    /// Converts into a standard boxed error, for interop with `anyhow` and friends.
    #[must_use]
    pub fn into_std(self) -> Box<dyn StdError + Send + Sync + 'static> {
        self.inner.into_std_error()
    }
}

impl<E: Classify> From<E> for Error {
    fn from(error: E) -> Self {
        Self::new(error)
    }
}

impl From<Error> for Box<dyn StdError + Send + Sync + 'static> {
    fn from(error: Error) -> Self {
        error.into_std()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.inner, f)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.inner, f)
    }
}

/// Iterator over the levels of an [`Error`] chain.
pub struct Chain<'a> {
    next: Option<&'a dyn Classify>,
    remaining: usize,
}

impl<'a> Iterator for Chain<'a> {
    type Item = &'a dyn Classify;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let current = self.next.take()?;
        self.next = Classify::cause(current);
        Some(current)
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Tagged view of a call result, used by middleware that reacts to outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// The call succeeded.
    Success,
    /// The call failed with a transient error.
    Retryable,
    /// The call failed and retrying will not help.
    Terminal,
}

impl Classification {
    /// Classifies a call result.
    pub fn of<T>(result: &Result<T, Error>) -> Self {
        match result {
            Ok(_) => Self::Success,
            Err(err) if err.is_retryable() => Self::Retryable,
            Err(_) => Self::Terminal,
        }
    }
}

// ---------------------------------------------------------------------------
// Wrappers
// ---------------------------------------------------------------------------

/// Explicit retryable marker produced by [`Error::retryable`].
pub struct Retryable {
    inner: Error,
}

impl Retryable {
    /// The error being marked.
    #[must_use]
    pub fn inner(&self) -> &Error {
        &self.inner
    }
}

impl fmt::Display for Retryable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl fmt::Debug for Retryable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retryable").field("inner", &self.inner).finish()
    }
}

impl StdError for Retryable {}

impl Classify for Retryable {
    fn retryable(&self) -> Option<bool> {
        Some(true)
    }

    fn cause(&self) -> Option<&dyn Classify> {
        Some(self.inner.as_classify())
    }
}

/// Context wrapper produced by [`Error::context`].
pub struct Context {
    message: String,
    inner: Error,
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.message, self.inner)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("message", &self.message)
            .field("inner", &self.inner)
            .finish()
    }
}

impl StdError for Context {}

impl Classify for Context {
    fn cause(&self) -> Option<&dyn Classify> {
        Some(self.inner.as_classify())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct Message(String);

impl Classify for Message {}

struct Opaque(Box<dyn StdError + Send + Sync + 'static>);

impl fmt::Display for Opaque {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for Opaque {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl StdError for Opaque {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.0.source()
    }
}

impl Classify for Opaque {}

// Common foreign errors are unclassified but convert with `?`.
impl Classify for std::io::Error {}
impl Classify for std::fmt::Error {}
impl Classify for std::str::Utf8Error {}
impl Classify for std::string::FromUtf8Error {}
impl Classify for std::num::ParseIntError {}
impl Classify for std::num::ParseFloatError {}
impl Classify for http::Error {}
impl Classify for serde_json::Error {}

// ---------------------------------------------------------------------------
// ResultExt
// ---------------------------------------------------------------------------

/// Classification helpers on `Result`.
pub trait ResultExt<T> {
    /// Wraps the error with a context message.
    ///
    /// # Errors
    ///
    /// Returns the original error, wrapped.
    fn context(self, message: impl Into<String>) -> Result<T, Error>;

    /// Marks the error as retryable.
    ///
    /// # Errors
    ///
    /// Returns the original error, marked.
    fn or_retryable(self) -> Result<T, Error>;
}

impl<T, E: Into<Error>> ResultExt<T> for Result<T, E> {
    fn context(self, message: impl Into<String>) -> Result<T, Error> {
        self.map_err(|e| e.into().context(message))
    }

    fn or_retryable(self) -> Result<T, Error> {
        self.map_err(|e| e.into().retryable())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    /// Error with a fixed classification and no cause.
    #[derive(Debug, thiserror::Error)]
    #[error("fixed")]
    struct Fixed(bool);

    impl Classify for Fixed {
        fn retryable(&self) -> Option<bool> {
            Some(self.0)
        }
    }

    /// Error whose cause is itself, to exercise the depth guard.
    #[derive(Debug, thiserror::Error)]
    #[error("loop")]
    struct SelfReferential;

    impl Classify for SelfReferential {
        fn cause(&self) -> Option<&dyn Classify> {
            Some(self)
        }
    }

    #[test]
    fn plain_errors_are_not_retryable() {
        assert!(!Error::msg("boom").is_retryable());
        assert!(!Error::other(std::io::Error::other("io")).is_retryable());
    }

    #[test]
    fn explicit_classification_is_found_through_context() {
        let err = Error::new(Fixed(true)).context("loading user").context("handler");
        assert!(err.is_retryable());

        let err = Error::new(Fixed(false)).context("loading user");
        assert!(!err.is_retryable());
    }

    #[test]
    fn outermost_classification_wins() {
        let err = Error::new(Fixed(false)).context("inner").retryable();
        assert!(err.is_retryable());
    }

    #[test]
    fn retryable_marker_preserves_message() {
        let err = Error::msg("upstream unavailable").retryable();
        assert_eq!(err.to_string(), "upstream unavailable");
    }

    #[test]
    fn context_display_includes_cause() {
        let err = Error::msg("connection reset").context("fetching quote");
        assert_eq!(err.to_string(), "fetching quote: connection reset");
    }

    #[test]
    fn cyclic_chain_terminates_as_not_retryable() {
        let err = Error::new(SelfReferential);
        assert!(!err.is_retryable());
        assert_eq!(err.explicit_status_code(), None);
        assert_eq!(err.chain().count(), MAX_CAUSE_DEPTH);
    }

    #[test]
    fn status_defaults_to_internal_server_error() {
        assert_eq!(
            Error::msg("boom").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn find_locates_inner_level() {
        let err = Error::new(Fixed(true)).context("outer");
        assert!(err.is::<Context>());
        assert!(err.find::<Fixed>().is_some());
        assert!(err.find::<SelfReferential>().is_none());
    }

    #[test]
    fn classification_of_results() {
        assert_eq!(
            Classification::of(&Ok::<_, Error>(1)),
            Classification::Success
        );
        assert_eq!(
            Classification::of::<()>(&Err(Error::msg("x").retryable())),
            Classification::Retryable
        );
        assert_eq!(
            Classification::of::<()>(&Err(Error::msg("x"))),
            Classification::Terminal
        );
    }

    #[test]
    fn result_ext_wraps_foreign_errors() {
        let parsed: Result<u32, Error> = "nope".parse::<u32>().context("parsing port");
        let err = parsed.unwrap_err();
        assert!(err.to_string().starts_with("parsing port: "));
        assert!(!err.is_retryable());

        let marked: Result<(), Error> = Err(Error::msg("flaky")).or_retryable();
        assert!(marked.unwrap_err().is_retryable());
    }

    #[test]
    fn converts_into_std_error() {
        let boxed: Box<dyn StdError + Send + Sync> = Error::msg("boom").into();
        assert_eq!(boxed.to_string(), "boom");
    }

    proptest! {
        #[test]
        fn marked_errors_are_always_retryable(base in any::<bool>(), depth in 0usize..16) {
            let mut err = Error::new(Fixed(base));
            for i in 0..depth {
                err = err.context(format!("layer {i}"));
            }
            prop_assert!(mark_retryable(err).is_retryable());
        }

        #[test]
        fn context_never_changes_classification(base in any::<bool>(), depth in 0usize..16) {
            let mut err = Error::new(Fixed(base));
            for i in 0..depth {
                err = err.context(format!("layer {i}"));
            }
            prop_assert_eq!(err.is_retryable(), base);
        }
    }
}
