//! Per-server live connection bookkeeping and admission control.
//!
//! Admission is reserve-then-accept: a listener takes an [`AdmissionPermit`]
//! before it accepts, and the permit either becomes a registry entry once the
//! worker is running or frees its slot when dropped. Live entries plus
//! outstanding permits never exceed the configured limit.
//!
//! [`ConnectionRegistry::terminate_all`] also closes the registry: a permit
//! taken before the close can no longer register, so a proxy that was still
//! spawning its worker tears down instead of outliving the server.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::models::connection::{ConnectionDetails, ConnectionId};

/// Interval between checks while waiting for connections to go away.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug)]
struct Entry {
    details: ConnectionDetails,
    teardown: CancellationToken,
}

#[derive(Debug, Default)]
struct Slots {
    pending: usize,
    closed: bool,
    entries: HashMap<ConnectionId, Entry>,
}

#[derive(Debug)]
struct Shared {
    max_connections: usize,
    slots: Mutex<Slots>,
}

impl Shared {
    fn slots(&self) -> std::sync::MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Live connections of one server.
#[derive(Debug, Clone)]
pub struct ConnectionRegistry {
    shared: Arc<Shared>,
}

impl ConnectionRegistry {
    /// Registry admitting at most `max_connections` (0 = unlimited).
    #[must_use]
    pub fn new(max_connections: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                max_connections,
                slots: Mutex::new(Slots::default()),
            }),
        }
    }

    /// Connection limit; 0 means unlimited.
    #[must_use]
    pub fn max_connections(&self) -> usize {
        self.shared.max_connections
    }

    /// Reserve a slot for one connection, or `None` at the limit or once
    /// the registry is closed.
    #[must_use]
    pub fn try_reserve(&self) -> Option<AdmissionPermit> {
        let mut slots = self.shared.slots();
        let max = self.shared.max_connections;
        if slots.closed {
            return None;
        }
        if max > 0 && slots.pending + slots.entries.len() >= max {
            return None;
        }
        slots.pending += 1;
        Some(AdmissionPermit {
            shared: Some(Arc::clone(&self.shared)),
        })
    }

    /// Number of registered connections.
    #[must_use]
    pub fn count(&self) -> usize {
        self.shared.slots().entries.len()
    }

    /// Registered connections plus outstanding permits.
    #[must_use]
    pub fn occupied(&self) -> usize {
        let slots = self.shared.slots();
        slots.pending + slots.entries.len()
    }

    /// Snapshot of registered connections, oldest first.
    #[must_use]
    pub fn list(&self) -> Vec<ConnectionDetails> {
        let mut all: Vec<ConnectionDetails> = self
            .shared
            .slots()
            .entries
            .values()
            .map(|entry| entry.details.clone())
            .collect();
        all.sort_by_key(|details| details.connected_at);
        all
    }

    /// Look up one connection.
    #[must_use]
    pub fn get(&self, id: ConnectionId) -> Option<ConnectionDetails> {
        self.shared
            .slots()
            .entries
            .get(&id)
            .map(|entry| entry.details.clone())
    }

    /// Remove a connection. Returns `None` if it was already removed.
    pub fn remove(&self, id: ConnectionId) -> Option<ConnectionDetails> {
        let removed = self.shared.slots().entries.remove(&id).map(|entry| entry.details);
        if removed.is_some() {
            debug!(connection_id = %id, "connection unregistered");
        }
        removed
    }

    /// Close the registry and request teardown of every registered
    /// connection. Returns registered plus pending connections.
    ///
    /// Each proxy terminates its worker and removes its own entry; pending
    /// permits are refused at registration.
    pub fn terminate_all(&self) -> usize {
        let mut slots = self.shared.slots();
        slots.closed = true;
        for entry in slots.entries.values() {
            entry.teardown.cancel();
        }
        slots.pending + slots.entries.len()
    }

    /// Whether [`Self::terminate_all`] has closed the registry.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.slots().closed
    }

    /// Wait until no connection is registered or pending, or `timeout`
    /// elapses. Returns `true` if the registry emptied.
    pub async fn wait_empty(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.occupied() == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

/// A reserved admission slot.
///
/// Dropping an unused permit releases the slot.
#[derive(Debug)]
pub struct AdmissionPermit {
    shared: Option<Arc<Shared>>,
}

impl AdmissionPermit {
    /// Turn the reservation into a registry entry.
    ///
    /// `teardown` is cancelled when the server force-terminates connections.
    /// Returns `None`, releasing the slot, if the registry was closed in the
    /// meantime; the caller must then tear the connection down itself.
    #[must_use]
    pub fn register(
        mut self,
        details: ConnectionDetails,
        teardown: CancellationToken,
    ) -> Option<ConnectionId> {
        let id = details.connection_id;
        let shared = self.shared.take()?;
        let mut slots = shared.slots();
        slots.pending = slots.pending.saturating_sub(1);
        if slots.closed {
            debug!(connection_id = %id, "registry closed, connection refused");
            return None;
        }
        slots.entries.insert(id, Entry { details, teardown });
        debug!(connection_id = %id, "connection registered");
        Some(id)
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            let mut slots = shared.slots();
            slots.pending = slots.pending.saturating_sub(1);
        }
    }
}
