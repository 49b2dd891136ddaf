// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};

use bytes::Bytes;
use tokio::{sync::mpsc, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    codec::frame::{Frame, FrameHeader, FrameOp, StreamId},
    error::MuxError,
    mux::{deadline::Deadline, session::SessionInner},
};

/// State of the peer's half of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RemoteHalf {
    Open,
    /// Peer sent CLOSE; queued data still drains, then end-of-stream.
    Closed,
    /// Peer reset, we reset, or the session tore the stream down.
    Reset,
}

/// Close bookkeeping, guarded by the per-stream lock so the table lock's
/// critical section stays narrow.
#[derive(Debug)]
pub(crate) struct CloseFlags {
    pub(crate) local: bool,
    pub(crate) remote: RemoteHalf,
}

/// Shared per-stream record: one copy referenced from the session's table,
/// one from the application's `MuxStream` handle.
#[derive(Debug)]
pub(crate) struct StreamState {
    pub(crate) id: StreamId,
    pub(crate) name: String,
    /// One-shot abort signal, observed by reads, writes and the reader task.
    pub(crate) reset: CancellationToken,
    pub(crate) cl: Mutex<CloseFlags>,
    pub(crate) read_deadline: Deadline,
    pub(crate) write_deadline: Deadline,
    /// Application label; never carried on the wire.
    pub(crate) protocol: Mutex<String>,
}

impl StreamState {
    pub(crate) fn new(id: StreamId, name: String) -> Self {
        Self {
            id,
            name,
            reset: CancellationToken::new(),
            cl: Mutex::new(CloseFlags { local: false, remote: RemoteHalf::Open }),
            read_deadline: Deadline::new(),
            write_deadline: Deadline::new(),
            protocol: Mutex::new(String::new()),
        }
    }

    pub(crate) fn cl_guard(&self) -> MutexGuard<'_, CloseFlags> {
        match self.cl.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Abort bookkeeping shared by local reset, peer RESET and session
    /// cleanup: one-shot signal, both directions closed.
    pub(crate) fn mark_reset(&self) {
        self.reset.cancel();
        let mut cl = self.cl_guard();
        cl.local = true;
        if cl.remote == RemoteHalf::Open {
            cl.remote = RemoteHalf::Reset;
        }
    }
}

/// One bidirectional logical stream carried inside a session.
///
/// Reads pull from the stream's inbound queue (filled by the session's
/// reader task); writes frame the data and hand it to the session's writer
/// task. Both honor the stream deadlines, the reset signal and session
/// shutdown.
pub struct MuxStream {
    state: Arc<StreamState>,
    session: Arc<SessionInner>,
    data_rx: mpsc::Receiver<Bytes>,
    /// Residue of a partially consumed inbound chunk.
    read_buf: Bytes,
}

impl fmt::Debug for MuxStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MuxStream")
            .field("id", &self.state.id)
            .field("name", &self.state.name)
            .finish_non_exhaustive()
    }
}

impl MuxStream {
    pub(crate) fn new(
        state: Arc<StreamState>,
        session: Arc<SessionInner>,
        data_rx: mpsc::Receiver<Bytes>,
    ) -> Self {
        Self { state, session, data_rx, read_buf: Bytes::new() }
    }

    /// Stream number within its id space. The full identity also carries
    /// the initiator flag, see [`MuxStream::is_initiator`].
    pub fn id(&self) -> u64 {
        self.state.id.num
    }

    pub fn is_initiator(&self) -> bool {
        self.state.id.initiator
    }

    /// Diagnostic name: the NEW_STREAM payload, or the decimal stream
    /// number when the stream was opened unnamed.
    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// Application protocol label. Metadata only, never on the wire.
    pub fn protocol(&self) -> String {
        match self.state.protocol.lock() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn set_protocol(&self, proto: &str) {
        match self.state.protocol.lock() {
            Ok(mut g) => *g = proto.to_owned(),
            Err(poisoned) => *poisoned.into_inner() = proto.to_owned(),
        }
    }

    /// Read up to `buf.len()` bytes.
    ///
    /// Returns `Ok(0)` at end-of-stream: after a graceful peer CLOSE and
    /// once every queued chunk has been delivered. Queued data is drained
    /// before a reset is reported, so a peer that writes then resets lets
    /// the reader observe either the data or `StreamReset`.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, MuxError> {
        if buf.is_empty() {
            return Ok(0);
        }
        if !self.read_buf.is_empty() {
            return Ok(self.copy_residue(buf));
        }
        tokio::select! {
            biased;
            chunk = self.data_rx.recv() => match chunk {
                Some(data) => {
                    self.read_buf = data;
                    Ok(self.copy_residue(buf))
                },
                None => self.end_of_stream(),
            },
            _ = self.state.reset.cancelled() => Err(MuxError::StreamReset),
            _ = self.state.read_deadline.expired() => Err(MuxError::Timeout),
            _ = self.session.shutdown.cancelled() => Err(self.session.latched_err()),
        }
    }

    fn copy_residue(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.read_buf.len());
        buf[..n].copy_from_slice(&self.read_buf.split_to(n));
        n
    }

    /// The inbound queue closed: graceful end-of-stream unless the close
    /// came from a reset.
    fn end_of_stream(&self) -> Result<usize, MuxError> {
        let remote = self.state.cl_guard().remote;
        match remote {
            RemoteHalf::Closed => Ok(0),
            _ if self.state.reset.is_cancelled() => Err(MuxError::StreamReset),
            _ => Ok(0),
        }
    }

    /// Write all of `buf`, slicing it into frames of at most the
    /// configured maximum payload size.
    pub async fn write(&self, buf: &[u8]) -> Result<usize, MuxError> {
        if self.state.cl_guard().local {
            return Err(MuxError::StreamClosed);
        }
        if self.state.reset.is_cancelled() {
            return Err(MuxError::StreamReset);
        }

        let mut sent = 0usize;
        for chunk in buf.chunks(self.session.cfg.max_message_size.max(1)) {
            let frame = Frame::encode(FrameHeader::new(self.state.id, FrameOp::Message), chunk);
            self.session
                .enqueue_data_frame(frame, &self.state.write_deadline, &self.state.reset)
                .await?;
            sent += chunk.len();
        }
        Ok(sent)
    }

    /// Half-close: no more local writes; the peer's direction stays open.
    /// Idempotent. If the CLOSE frame cannot be handed to the writer
    /// within the reset-stream timeout the stream is aborted instead and
    /// the error returned.
    pub async fn close(&self) -> Result<(), MuxError> {
        {
            let mut cl = self.state.cl_guard();
            if cl.local {
                return Ok(());
            }
            cl.local = true;
        }

        let frame = Frame::encode(FrameHeader::new(self.state.id, FrameOp::Close), &[]);
        match self
            .session
            .enqueue_control_frame(frame, self.session.cfg.reset_stream_timeout)
            .await
        {
            Ok(()) => {
                self.session.remove_if_fully_closed(&self.state);
                Ok(())
            },
            Err(e) => {
                warn!(stream = %self.state.id, "close escalated to abort: {e}");
                self.state.mark_reset();
                self.session.forget_stream(self.state.id);
                Err(e)
            },
        }
    }

    /// Abort the stream in both directions. Safe to call any number of
    /// times; never fails, emission problems are logged.
    pub async fn reset(&self) {
        crate::mux::session::reset_stream(&self.session, &self.state).await;
    }

    pub fn set_read_deadline(&self, t: Option<Instant>) {
        self.state.read_deadline.set(t);
    }

    pub fn set_write_deadline(&self, t: Option<Instant>) {
        self.state.write_deadline.set(t);
    }

    pub fn set_deadline(&self, t: Option<Instant>) {
        self.state.read_deadline.set(t);
        self.state.write_deadline.set(t);
    }
}

impl fmt::Display for MuxStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream {} ({})", self.state.id, self.state.name)
    }
}

/// A handle dropped without `close` or `reset` aborts the stream so the
/// peer is not left writing into a void.
impl Drop for MuxStream {
    fn drop(&mut self) {
        let abandoned = {
            let cl = self.state.cl_guard();
            !cl.local && !self.state.reset.is_cancelled()
        };
        if !abandoned {
            return;
        }
        self.state.mark_reset();
        self.session.forget_stream(self.state.id);
        let frame = Frame::encode(FrameHeader::new(self.state.id, FrameOp::Reset), &[]);
        if !self.session.try_enqueue_frame(frame) {
            debug!(stream = %self.state.id, "reset for dropped stream not sent");
        }
    }
}
