//! Host-boundary error taxonomy and the cross-boundary exception bridge.
//!
//! Three kinds of native failure cross the script boundary:
//!
//! 1. a catchable value throw ([`Error::Throw`]) becomes an ordinary engine
//!    throw that script `catch` sees;
//! 2. any other native failure, including panics out of host callbacks, is
//!    forwarded: stored as a context-scoped pending token and signalled to
//!    the engine as an uncatchable error, so script cannot intercept it and
//!    the original failure resurfaces at the outermost native boundary;
//! 3. a thrown script value observed while nested more than one boundary
//!    call deep is re-routed as [`Error::Throw`] rather than
//!    [`Error::Exception`], so intermediate host frames re-throw it
//!    catchably instead of treating it as a foreign failure.

use std::any::Any;

use thiserror::Error;

use crate::value::Value;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Operation on an abandoned or never-initialized value or context.
    /// Always a programming error.
    #[error("invalid context")]
    InvalidContext,

    /// A value did not hold the requested native type.
    #[error("not a {expected} value")]
    Convert { expected: &'static str },

    /// An ordinary thrown script value, delivered at the host boundary.
    #[error("exception: {}", .0.display_lossy())]
    Exception(Value),

    /// An engine error object, carrying its message and `stack` property.
    #[error("{message}")]
    ScriptError {
        message: String,
        stack: Option<String>,
        value: Value,
    },

    /// A thrown value still in flight between nested boundary calls. Host
    /// code normally never observes this variant: the enclosing callback
    /// boundary converts it back into a catchable engine throw.
    #[error("thrown exception")]
    Throw(Value),

    /// Fatal failure while registering a class or building its constructor.
    /// There is no partial-registration recovery.
    #[error("registration failed: {0}")]
    Registration(String),
}

impl Error {
    /// The thrown value, for the variants that carry one.
    pub fn value(&self) -> Option<&Value> {
        match self {
            Error::Exception(v) | Error::Throw(v) => Some(v),
            Error::ScriptError { value, .. } => Some(value),
            _ => None,
        }
    }
}

/// A native failure stored on a context while an uncatchable error unwinds
/// the script stack (case 2 in the module docs).
pub(crate) enum Forwarded {
    /// Panic payload from a host callback; re-raised with
    /// `std::panic::resume_unwind` at the outermost boundary.
    Panic(Box<dyn Any + Send>),
    /// An error that must not be observable by script.
    Error(Error),
}
