//! Client-side transports.
//!
//! - [`info`]: connection targets and the single `open` entry point.
//! - [`channel`]: medium-agnostic read/write halves.
//! - [`codec`]: newline record framing.
//! - [`manager`]: lifecycle, reader loop and close handshake.
//! - One module per medium: [`subprocess`], [`named_pipe`], [`tcp`],
//!   [`websocket`], [`ssh`].

pub mod channel;
pub mod codec;
pub mod info;
pub mod manager;
pub mod named_pipe;
pub mod pipe_name;
pub mod ssh;
pub mod subprocess;
pub mod tcp;
pub mod websocket;

pub use channel::{ChannelKind, OpenChannel};
pub use info::ChannelConnectionInfo;
pub use manager::{AckMatcher, RecordCallback, TransportManager, TransportOptions};
