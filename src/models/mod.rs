//! Domain model module declarations.

pub mod connection;
pub mod server;
pub mod transport;
