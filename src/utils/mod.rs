//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod error;
mod memberset;
pub(crate) mod safetcp;

pub use config::{config_table, reject_leftover};
pub use error::GridError;
pub use memberset::MemberSet;
pub use print::{logger_init, ME};
