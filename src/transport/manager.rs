//! Uniform connection lifecycle over any channel.
//!
//! A [`TransportManager`] opens one channel, runs exactly one reader task
//! that turns inbound chunks into records, serializes outbound records
//! through a FIFO writer lock, and drives the two-phase close handshake:
//! the close frame is written while the reader stays live, and only the
//! peer's acknowledgement (or the close timeout) leads to cleanup.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::channel::{ChannelKind, ChannelProcess, ChannelRead, ChannelWrite};
use super::codec::{frame_record, RecordAssembler};
use super::info::ChannelConnectionInfo;
use super::ssh::DiagnosticsCallback;
use crate::models::transport::TransportState;
use crate::{AppError, Result};

/// Default wait for the peer's close acknowledgement.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on flushing and shutting down the writer during cleanup.
const WRITER_SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Invoked once per complete inbound record, on the reader task.
pub type RecordCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Recognises the peer's close acknowledgement among inbound records.
pub type AckMatcher = Box<dyn Fn(&str) -> bool + Send + Sync>;

/// Per-connection options.
#[derive(Clone, Default)]
pub struct TransportOptions {
    /// Open timeout; `None` uses the medium's default.
    pub open_timeout: Option<Duration>,
    /// Close acknowledgement timeout; `None` uses [`DEFAULT_CLOSE_TIMEOUT`].
    pub close_timeout: Option<Duration>,
    /// Record sent as soon as the channel is open.
    pub initial_frame: Option<String>,
    /// Receives SSH client stderr lines.
    pub diagnostics: Option<DiagnosticsCallback>,
}

impl std::fmt::Debug for TransportOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportOptions")
            .field("open_timeout", &self.open_timeout)
            .field("close_timeout", &self.close_timeout)
            .field("initial_frame", &self.initial_frame)
            .field("diagnostics", &self.diagnostics.is_some())
            .finish()
    }
}

/// Facts about the opened channel, fixed once `Open` is reached.
#[derive(Debug, Clone)]
struct ChannelMeta {
    kind: ChannelKind,
    remote: String,
    process_id: Option<u32>,
}

struct Inner {
    options: TransportOptions,
    state: watch::Sender<TransportState>,
    meta: OnceLock<ChannelMeta>,
    writer: tokio::sync::Mutex<Option<Box<dyn ChannelWrite>>>,
    process: tokio::sync::Mutex<Option<ChannelProcess>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    ack_matcher: Mutex<Option<AckMatcher>>,
    last_error: Mutex<Option<AppError>>,
    cancel: CancellationToken,
    acked: CancellationToken,
    cleaned: AtomicBool,
}

/// Client-side lifecycle for one channel.
///
/// Dropping the manager cancels the reader; the backing process (if any) is
/// killed once the reader has released it.
pub struct TransportManager {
    inner: Arc<Inner>,
}

impl TransportManager {
    /// Manager in `Unconnected` state.
    #[must_use]
    pub fn new(options: TransportOptions) -> Self {
        let (state, _) = watch::channel(TransportState::Unconnected);
        Self {
            inner: Arc::new(Inner {
                options,
                state,
                meta: OnceLock::new(),
                writer: tokio::sync::Mutex::new(None),
                process: tokio::sync::Mutex::new(None),
                reader_task: Mutex::new(None),
                ack_matcher: Mutex::new(None),
                last_error: Mutex::new(None),
                cancel: CancellationToken::new(),
                acked: CancellationToken::new(),
                cleaned: AtomicBool::new(false),
            }),
        }
    }

    /// Create a manager and open `info` in one step.
    ///
    /// # Errors
    ///
    /// See [`Self::open`].
    pub async fn connect(
        info: &ChannelConnectionInfo,
        options: TransportOptions,
        on_record: RecordCallback,
    ) -> Result<Self> {
        let manager = Self::new(options);
        manager.open(info, on_record).await?;
        Ok(manager)
    }

    /// Open the channel and start the reader.
    ///
    /// `Unconnected -> Connecting -> Open`, or `-> Broken` on failure. The
    /// configured initial frame is sent once the reader is running.
    ///
    /// # Errors
    ///
    /// - `AppError::InvalidState` if the manager was already opened.
    /// - Connect and spawn errors from the medium.
    pub async fn open(&self, info: &ChannelConnectionInfo, on_record: RecordCallback) -> Result<()> {
        let inner = &self.inner;
        if !inner.transition(TransportState::Connecting) {
            return Err(AppError::InvalidState(format!(
                "cannot open transport in state {:?}",
                self.state()
            )));
        }

        let channel = match info
            .open_with(inner.options.open_timeout, inner.options.diagnostics.clone())
            .await
        {
            Ok(channel) => channel,
            Err(err) => {
                warn!(kind = %info.kind(), %err, "channel open failed");
                inner.record_error(err.clone());
                inner.transition(TransportState::Broken);
                return Err(err);
            }
        };

        let meta = ChannelMeta {
            kind: channel.kind,
            remote: channel.remote,
            process_id: channel.process.as_ref().and_then(ChannelProcess::id),
        };
        info!(kind = %meta.kind, remote = %meta.remote, pid = ?meta.process_id, "transport open");
        let _ = inner.meta.set(meta.clone());
        *inner.writer.lock().await = Some(channel.writer);
        *inner.process.lock().await = channel.process;

        inner.transition(TransportState::Open);

        let span = info_span!("transport_reader", kind = %meta.kind, remote = %meta.remote);
        let task = tokio::spawn(
            reader_loop(Arc::clone(inner), channel.reader, on_record).instrument(span),
        );
        *inner
            .reader_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);

        if let Some(frame) = inner.options.initial_frame.clone() {
            self.send(&frame).await?;
        }
        Ok(())
    }

    /// Send one record; a trailing newline is added if missing.
    ///
    /// Concurrent sends are written whole and in lock-acquisition order.
    ///
    /// # Errors
    ///
    /// - `AppError::InvalidState` unless the transport is `Open`.
    /// - `AppError::Transport` if the write fails; the transport is then
    ///   `Broken` and cleaned up.
    pub async fn send(&self, record: &str) -> Result<()> {
        let state = self.state();
        if state != TransportState::Open {
            return Err(AppError::InvalidState(format!(
                "cannot send in state {state:?}"
            )));
        }
        self.inner.write_record(record).await
    }

    /// Graceful close: write `close_frame` (if any), keep reading until the
    /// acknowledgement arrives, then clean up.
    ///
    /// The acknowledgement is whichever comes first: a record accepted by
    /// `ack_matcher`, a call to [`Self::acknowledge_close`], or end of
    /// stream from the peer.
    ///
    /// # Errors
    ///
    /// - `AppError::InvalidState` unless the transport is `Open`.
    /// - `AppError::CloseTimeout` if no acknowledgement arrived within the
    ///   close timeout. The transport is still `Closed` afterwards.
    /// - `AppError::Transport` if the channel broke while closing.
    pub async fn request_close(
        &self,
        close_frame: Option<&str>,
        ack_matcher: Option<AckMatcher>,
    ) -> Result<()> {
        let inner = &self.inner;
        if !inner.transition(TransportState::Closing) {
            return Err(AppError::InvalidState(format!(
                "cannot close transport in state {:?}",
                self.state()
            )));
        }
        *inner
            .ack_matcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = ack_matcher;

        if let Some(frame) = close_frame {
            inner.write_record(frame).await?;
        }

        let timeout = inner.options.close_timeout.unwrap_or(DEFAULT_CLOSE_TIMEOUT);
        let acked = tokio::time::timeout(timeout, inner.acked.cancelled())
            .await
            .is_ok();

        inner.cleanup().await;
        if self.state() == TransportState::Broken {
            return Err(self
                .last_error()
                .unwrap_or_else(|| AppError::Transport("channel broke while closing".into())));
        }
        inner.transition(TransportState::Closed);

        if acked {
            debug!("close acknowledged");
            Ok(())
        } else {
            warn!(?timeout, "close acknowledgement not received");
            Err(AppError::CloseTimeout(format!(
                "no close acknowledgement within {timeout:?}"
            )))
        }
    }

    /// Signal that the engine observed the close acknowledgement itself.
    pub fn acknowledge_close(&self) {
        self.inner.acked.cancel();
    }

    /// Forced release: cancel the reader, close the writer, terminate the
    /// backing process. Idempotent.
    pub async fn cleanup(&self) {
        self.inner.cleanup().await;
        if !self.state().is_terminal() {
            self.inner.force_state(TransportState::Closed);
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> TransportState {
        *self.inner.state.borrow()
    }

    /// Subscribe to state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<TransportState> {
        self.inner.state.subscribe()
    }

    /// Wait until the state equals `target` or becomes terminal; returns the
    /// state reached.
    pub async fn wait_for_state(&self, target: TransportState) -> TransportState {
        let mut rx = self.subscribe();
        let reached = rx
            .wait_for(|state| *state == target || state.is_terminal())
            .await
            .map(|state| *state);
        reached.unwrap_or_else(|_| self.state())
    }

    /// Medium, once opened.
    #[must_use]
    pub fn kind(&self) -> Option<ChannelKind> {
        self.inner.meta.get().map(|meta| meta.kind)
    }

    /// Peer description, once opened.
    #[must_use]
    pub fn remote(&self) -> Option<String> {
        self.inner.meta.get().map(|meta| meta.remote.clone())
    }

    /// Backing process id for subprocess and SSH channels.
    #[must_use]
    pub fn process_id(&self) -> Option<u32> {
        self.inner.meta.get().and_then(|meta| meta.process_id)
    }

    /// Most recent error recorded by the manager.
    #[must_use]
    pub fn last_error(&self) -> Option<AppError> {
        self.inner
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Drop for TransportManager {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

impl std::fmt::Debug for TransportManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportManager")
            .field("state", &self.state())
            .field("meta", &self.inner.meta.get())
            .finish_non_exhaustive()
    }
}

impl Inner {
    /// Apply `next` if the FSM allows it.
    fn transition(&self, next: TransportState) -> bool {
        let mut moved = false;
        self.state.send_if_modified(|state| {
            if state.can_transition_to(next) {
                debug!(from = ?*state, to = ?next, "transport state");
                *state = next;
                moved = true;
            }
            moved
        });
        moved
    }

    /// Set a terminal state outside the normal FSM path (forced cleanup).
    fn force_state(&self, next: TransportState) {
        self.state.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = next;
                true
            }
        });
    }

    fn state(&self) -> TransportState {
        *self.state.borrow()
    }

    fn record_error(&self, err: AppError) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(err);
    }

    async fn write_record(&self, record: &str) -> Result<()> {
        let result = {
            let mut guard = self.writer.lock().await;
            match guard.as_mut() {
                Some(writer) => writer.write_chunk(frame_record(record)).await,
                None => Err(AppError::Transport("writer released".into())),
            }
        };
        if let Err(err) = &result {
            warn!(%err, "transport write failed");
            self.record_error(err.clone());
            self.cleanup().await;
            self.force_state(TransportState::Broken);
        }
        result
    }

    /// Deliver one inbound record and check it against the ack matcher.
    fn deliver(&self, record: &str, on_record: &RecordCallback) {
        on_record(record);
        if self.state() == TransportState::Closing {
            let matched = self
                .ack_matcher
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .as_ref()
                .is_some_and(|matcher| matcher(record));
            if matched {
                self.acked.cancel();
            }
        }
    }

    async fn cleanup(&self) {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();

        let shutdown = async {
            if let Some(mut writer) = self.writer.lock().await.take() {
                if let Err(err) = writer.shutdown().await {
                    debug!(%err, "writer shutdown failed");
                }
            }
        };
        if tokio::time::timeout(WRITER_SHUTDOWN_GRACE, shutdown).await.is_err() {
            debug!("writer shutdown timed out");
        }

        if let Some(mut process) = self.process.lock().await.take() {
            process.terminate().await;
        }

        // Only abort the reader when cleanup runs on another task.
        if let Some(task) = self
            .reader_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            if tokio::task::try_id() != Some(task.id()) {
                task.abort();
            }
        }
        debug!("transport cleaned up");
    }
}

async fn reader_loop(inner: Arc<Inner>, mut reader: Box<dyn ChannelRead>, on_record: RecordCallback) {
    let mut assembler = RecordAssembler::new();
    let outcome = loop {
        let chunk = tokio::select! {
            () = inner.cancel.cancelled() => return,
            chunk = reader.read_chunk() => chunk,
        };
        match chunk {
            Ok(Some(bytes)) => {
                let (records, errors) = assembler.push(&bytes);
                for err in errors {
                    warn!(%err, "dropping malformed inbound record");
                }
                for record in records {
                    inner.deliver(&record, &on_record);
                }
            }
            Ok(None) => {
                if let Some(rest) = assembler.finish() {
                    inner.deliver(&rest, &on_record);
                }
                break Ok(());
            }
            Err(err) => break Err(err),
        }
    };
    drop(reader);

    match outcome {
        Ok(()) if inner.state() == TransportState::Closing => {
            debug!("peer closed during close handshake");
            inner.acked.cancel();
        }
        Ok(()) => {
            info!("peer closed the channel");
            inner.cleanup().await;
            inner.transition(TransportState::Closed);
        }
        Err(err) => {
            warn!(%err, "transport read failed");
            inner.record_error(err);
            let closing = inner.state() == TransportState::Closing;
            inner.force_state(TransportState::Broken);
            if closing {
                inner.acked.cancel();
            } else {
                inner.cleanup().await;
            }
        }
    }
}
