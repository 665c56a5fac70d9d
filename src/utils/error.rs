//! Customized unified error type.

use std::error;
use std::fmt;
use std::io;
use std::net;
use std::num;

/// Customized error type for gridwatch.
///
/// Request timeouts get their own variant so that callers can tell an
/// expired deadline apart from connectivity or programming failures.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum GridError {
    /// General failure carrying a message.
    Msg(String),

    /// A request (poll or lease wait) did not complete before its deadline.
    /// The underlying operation is not cancelled by this.
    RequestTimeout(String),
}

impl GridError {
    pub fn msg(msg: impl ToString) -> Self {
        GridError::Msg(msg.to_string())
    }

    pub fn timeout(msg: impl ToString) -> Self {
        GridError::RequestTimeout(msg.to_string())
    }

    /// Returns true if this error signals a request timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, GridError::RequestTimeout(_))
    }
}

impl fmt::Display for GridError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            GridError::Msg(s) => write!(f, "{}", s), // no literal quotes
            GridError::RequestTimeout(s) => write!(f, "{}", s),
        }
    }
}

impl error::Error for GridError {}

// Helper macro for saving boiler-plate `impl From<X>`s for transparent
// conversion from various common error types to `GridError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for GridError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                GridError::Msg(e.to_string())
            }
        }
    };
}

// Helper macro for saving boiler-plate `impl From<X<T>>`s for transparent
// conversion from various common generic error types to `GridError`.
macro_rules! impl_from_error_generic {
    ($error:ty) => {
        impl<T> From<$error> for GridError {
            fn from(e: $error) -> GridError {
                GridError::msg(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(num::ParseIntError);
impl_from_error!(net::AddrParseError);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(ctrlc::Error);
impl_from_error!(tokio::task::JoinError);

impl_from_error_generic!(tokio::sync::watch::error::SendError<T>);
impl_from_error_generic!(tokio::sync::mpsc::error::SendError<T>);
