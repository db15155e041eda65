//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod addr;
mod error;
mod safetcp;
mod timer;

pub use addr::parse_host_port;
pub use error::DsdcError;
pub use print::{logger_init, ME};
pub use timer::Timer;

pub(crate) use safetcp::{safe_tcp_read, safe_tcp_write, tcp_bind_with_retry};
