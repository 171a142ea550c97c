//! Client-side transport lifecycle model.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a [`crate::transport::TransportManager`].
///
/// `Unconnected -> Connecting -> Open -> Closing -> {Closed, Broken}`, with
/// `Connecting -> Broken` on connect failure and `Open -> Broken` on an
/// unexpected I/O error.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransportState {
    /// Manager constructed, nothing opened yet.
    Unconnected,
    /// Channel open in progress.
    Connecting,
    /// Channel open; reader loop running.
    Open,
    /// Close frame sent; waiting for the peer's acknowledgement.
    Closing,
    /// Orderly shutdown completed.
    Closed,
    /// Connect failure or unexpected channel loss.
    Broken,
}

impl TransportState {
    /// `true` once the manager can no longer carry records.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Broken)
    }

    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Unconnected, Self::Connecting)
                | (Self::Connecting, Self::Open | Self::Broken)
                | (Self::Open, Self::Closing | Self::Closed | Self::Broken)
                | (Self::Closing, Self::Closed | Self::Broken)
        )
    }
}
