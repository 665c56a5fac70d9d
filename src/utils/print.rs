//! Helper macros for logging (console printing).
//!
//! Every line is prefixed with the parenthesized identity of the node that
//! printed it, e.g. `(m3) ring connected to ...`, so that output of several
//! local nodes can be interleaved in one terminal.

use std::sync::OnceLock;

use env_logger::Env;

/// Node identity string used as logging prefix; set by `logger_init()`.
pub static ME: OnceLock<String> = OnceLock::new();

/// Log a message at the given `log::Level` variant with the node prefix.
/// Shared body of the `pf_*!` macros.
#[doc(hidden)]
#[macro_export]
macro_rules! pf_log {
    ($level:ident, $($fmt_args:tt)*) => {
        log::log!(
            log::Level::$level,
            "({}) {}",
            $crate::ME.get().map_or("-", |me| me.as_str()),
            format_args!($($fmt_args)*)
        )
    };
}

/// Log TRACE message with parenthesized prefix.
///
/// Example:
/// ```no_compile
/// pf_trace!("ring connecting to {}", member);
/// ```
#[macro_export]
macro_rules! pf_trace {
    ($($fmt_args:tt)*) => {
        $crate::pf_log!(Trace, $($fmt_args)*)
    };
}

/// Log DEBUG message with parenthesized prefix.
#[macro_export]
macro_rules! pf_debug {
    ($($fmt_args:tt)*) => {
        $crate::pf_log!(Debug, $($fmt_args)*)
    };
}

/// Log INFO message with parenthesized prefix.
#[macro_export]
macro_rules! pf_info {
    ($($fmt_args:tt)*) => {
        $crate::pf_log!(Info, $($fmt_args)*)
    };
}

/// Log WARN message with parenthesized prefix.
#[macro_export]
macro_rules! pf_warn {
    ($($fmt_args:tt)*) => {
        $crate::pf_log!(Warn, $($fmt_args)*)
    };
}

/// Log ERROR message with parenthesized prefix.
#[macro_export]
macro_rules! pf_error {
    ($($fmt_args:tt)*) => {
        $crate::pf_log!(Error, $($fmt_args)*)
    };
}

/// Records `me` as this process's logging prefix and sets up `env_logger`
/// (filter taken from `RUST_LOG`, `info` if unset). Only the first call has
/// any effect; later ones are ignored, which lets every test call it.
pub fn logger_init(me: impl ToString) {
    if ME.set(me.to_string()).is_err() {
        return;
    }
    let _ =
        env_logger::Builder::from_env(Env::default().default_filter_or("info"))
            .format_timestamp(None)
            .format_module_path(false)
            .format_target(false)
            .try_init();
}

/// Logs an error message, then evaluates to an `Err(GridError)` carrying the
/// same message.
///
/// Example:
/// ```no_compile
/// return logged_err!("invalid member ID {}", id);
/// ```
#[macro_export]
macro_rules! logged_err {
    ($($fmt_args:tt)*) => {
        {
            $crate::pf_error!($($fmt_args)*);
            Err($crate::GridError::msg(format!($($fmt_args)*)))
        }
    };
}
