#![forbid(unsafe_code)]

//! Uniform duplex transports for line-framed remoting endpoints, and
//! listeners that host such an endpoint behind one isolated worker process
//! per connection.

pub mod config;
pub mod errors;
pub mod ipc;
pub mod models;
pub mod process;
pub mod server;
pub mod transport;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
