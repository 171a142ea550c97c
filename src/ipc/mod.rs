//! Local control plane for `host-relay-ctl`.
//!
//! A named pipe (Windows) or Unix domain socket (Linux/macOS) server that
//! accepts JSON-line commands against the server registry.

pub mod server;
