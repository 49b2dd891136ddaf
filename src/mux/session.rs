// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use bytes::Bytes;
use once_cell::sync::OnceCell;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    sync::mpsc,
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::{
    cfg::config::MuxConfig,
    codec::frame::{Frame, FrameHeader, FrameOp, StreamId},
    error::MuxError,
    mux::stream::{MuxStream, RemoteHalf, StreamState},
};

/// Table slot for one live stream. `data_tx` feeds the stream's inbound
/// queue and is taken (dropped) on a peer CLOSE so readers observe
/// end-of-stream once the queue drains.
pub(crate) struct StreamEntry {
    data_tx: Option<mpsc::Sender<Bytes>>,
    state: Arc<StreamState>,
}

/// The stream table plus the id allocator it protects. `map` becomes
/// `None` at shutdown; every later lookup or insert fails with `Shutdown`.
pub(crate) struct ChannelTable {
    next_id: u64,
    map: Option<HashMap<StreamId, StreamEntry>>,
}

/// Session internals shared by the handles, the reader task and the
/// writer task.
pub(crate) struct SessionInner {
    pub(crate) cfg: MuxConfig,
    is_initiator: bool,
    channels: Mutex<ChannelTable>,
    write_tx: mpsc::Sender<Bytes>,
    pub(crate) shutdown: CancellationToken,
    closed: CancellationToken,
    shutdown_err: OnceCell<MuxError>,
}

impl SessionInner {
    pub(crate) fn table_guard(&self) -> MutexGuard<'_, ChannelTable> {
        match self.channels.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// The latched shutdown reason, `Shutdown` until something latched.
    pub(crate) fn latched_err(&self) -> MuxError {
        self.shutdown_err.get().cloned().unwrap_or(MuxError::Shutdown)
    }

    /// Begin teardown without waiting for it: idempotent, the token makes
    /// the single transition.
    pub(crate) fn close_no_wait(&self) {
        self.shutdown.cancel();
    }

    /// Hand a framed stream payload to the writer, gated by the stream's
    /// write deadline and reset signal.
    pub(crate) async fn enqueue_data_frame(
        &self,
        buf: Bytes,
        gate: &crate::mux::deadline::Deadline,
        reset: &CancellationToken,
    ) -> Result<(), MuxError> {
        tokio::select! {
            biased;
            _ = reset.cancelled() => Err(MuxError::StreamReset),
            // Gate before the queue: an already-expired deadline fails the
            // write even when the queue has room.
            _ = gate.expired() => Err(MuxError::Timeout),
            res = self.write_tx.send(buf) => res.map_err(|_| self.latched_err()),
            _ = self.shutdown.cancelled() => Err(self.latched_err()),
        }
    }

    /// Hand a NEW_STREAM/CLOSE/RESET frame to the writer within `limit`.
    pub(crate) async fn enqueue_control_frame(
        &self,
        buf: Bytes,
        limit: Duration,
    ) -> Result<(), MuxError> {
        tokio::select! {
            biased;
            res = self.write_tx.send(buf) => res.map_err(|_| self.latched_err()),
            _ = self.shutdown.cancelled() => Err(self.latched_err()),
            _ = sleep(limit) => Err(MuxError::Timeout),
        }
    }

    /// Best-effort enqueue from non-async paths (stream drop).
    pub(crate) fn try_enqueue_frame(&self, buf: Bytes) -> bool {
        self.write_tx.try_send(buf).is_ok()
    }

    /// Drop the table entry and release anything still parked on the
    /// stream's deadlines.
    pub(crate) fn forget_stream(&self, id: StreamId) {
        let removed = {
            let mut tab = self.table_guard();
            tab.map.as_mut().and_then(|m| m.remove(&id))
        };
        if let Some(entry) = removed {
            entry.state.read_deadline.cancel();
            entry.state.write_deadline.cancel();
        }
    }

    /// Remove the stream once both directions are closed.
    pub(crate) fn remove_if_fully_closed(&self, state: &StreamState) {
        let fully = {
            let cl = state.cl_guard();
            cl.local && cl.remote != RemoteHalf::Open
        };
        if fully {
            self.forget_stream(state.id);
        }
    }
}

impl fmt::Debug for SessionInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionInner")
            .field("is_initiator", &self.is_initiator)
            .field("shutdown", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// A multiplexed session: one reliable carrier, many logical streams.
///
/// Cloning hands out another handle onto the same session; the reader and
/// writer tasks run until the carrier dies or [`Session::close`] is
/// called.
#[derive(Debug, Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
    accept_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<MuxStream>>>,
}

impl Session {
    /// Start a session over `carrier` with default tunables.
    pub fn new<T>(carrier: T, is_initiator: bool) -> Self
    where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {
        Self::with_config(carrier, is_initiator, MuxConfig::default())
    }

    /// Start a session with explicit tunables (see
    /// [`MuxConfig::validate`]).
    pub fn with_config<T>(carrier: T, is_initiator: bool, cfg: MuxConfig) -> Self
    where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {
        let (r, w) = tokio::io::split(carrier);
        let (write_tx, write_rx) = mpsc::channel(cfg.write_backlog.max(1));
        let (accept_tx, accept_rx) = mpsc::channel(cfg.accept_backlog.max(1));

        let inner = Arc::new(SessionInner {
            cfg,
            is_initiator,
            channels: Mutex::new(ChannelTable { next_id: 0, map: Some(HashMap::new()) }),
            write_tx,
            shutdown: CancellationToken::new(),
            closed: CancellationToken::new(),
            shutdown_err: OnceCell::new(),
        });

        let reader = Arc::clone(&inner);
        tokio::spawn(async move {
            handle_incoming(reader, BufReader::new(r), accept_tx).await;
        });

        let writer = Arc::clone(&inner);
        tokio::spawn(async move {
            handle_outgoing(writer, w, write_rx).await;
        });

        Self {
            inner,
            accept_rx: Arc::new(tokio::sync::Mutex::new(accept_rx)),
        }
    }

    pub fn is_initiator(&self) -> bool {
        self.inner.is_initiator
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Open an unnamed stream; the name defaults to the decimal id.
    pub async fn new_stream(&self) -> Result<MuxStream, MuxError> {
        self.new_named_stream("").await
    }

    /// Open a stream, announcing it to the peer with a NEW_STREAM frame.
    ///
    /// Fails with `Shutdown` when the session is closing and `Timeout`
    /// when the writer does not take the frame within the new-stream
    /// timeout. The local record is not rolled back on failure; the
    /// session is on a shutdown path in both cases.
    pub async fn new_named_stream(&self, name: &str) -> Result<MuxStream, MuxError> {
        let (stream, frame) = {
            let mut tab = self.inner.table_guard();
            if tab.map.is_none() {
                return Err(self.inner.latched_err());
            }
            let num = tab.next_id;
            tab.next_id += 1;
            let id = StreamId { num, initiator: true };
            let name = if name.is_empty() { num.to_string() } else { name.to_owned() };
            let frame =
                Frame::encode(FrameHeader::new(id, FrameOp::NewStream), name.as_bytes());

            let (stream, entry) = make_stream(&self.inner, id, name);
            if let Some(map) = tab.map.as_mut() {
                map.insert(id, entry);
            }
            (stream, frame)
        };

        trace!(stream = %stream, "opening stream");
        self.inner
            .enqueue_control_frame(frame, self.inner.cfg.new_stream_timeout)
            .await?;
        Ok(stream)
    }

    /// Next inbound stream opened by the peer.
    ///
    /// Streams already queued are delivered even while the session shuts
    /// down; afterwards `ClosedMultiplex` (graceful) or the latched
    /// carrier error.
    pub async fn accept(&self) -> Result<MuxStream, MuxError> {
        let mut rx = self.accept_rx.lock().await;
        tokio::select! {
            biased;
            s = rx.recv() => match s {
                Some(s) => Ok(s),
                None => Err(match self.inner.shutdown_err.get() {
                    Some(e) if !matches!(e, MuxError::Shutdown) => e.clone(),
                    _ => MuxError::ClosedMultiplex,
                }),
            },
            _ = self.inner.shutdown.cancelled() => Err(self.inner.latched_err()),
        }
    }

    /// Shut the session down and wait for the reader task's cleanup.
    /// Idempotent; returns the latched carrier error if there is one.
    pub async fn close(&self) -> Result<(), MuxError> {
        self.inner.close_no_wait();
        self.inner.closed.cancelled().await;
        match self.inner.shutdown_err.get() {
            None | Some(MuxError::Shutdown) => Ok(()),
            Some(e) => Err(e.clone()),
        }
    }
}

/// Allocate the per-stream queue and state, returning the application
/// handle and the table entry that share them.
fn make_stream(
    inner: &Arc<SessionInner>,
    id: StreamId,
    name: String,
) -> (MuxStream, StreamEntry) {
    let (data_tx, data_rx) = mpsc::channel(inner.cfg.stream_backlog.max(1));
    let state = Arc::new(StreamState::new(id, name));
    let stream = MuxStream::new(Arc::clone(&state), Arc::clone(inner), data_rx);
    (stream, StreamEntry { data_tx: Some(data_tx), state })
}

/// Abort a stream in both directions and tell the peer. Idempotent; the
/// RESET frame is emitted once. Never fails: emission problems are
/// logged, and a writer too wedged to take the frame ends the session.
pub(crate) async fn reset_stream(inner: &SessionInner, state: &StreamState) {
    let first = !state.reset.is_cancelled();
    state.mark_reset();
    inner.forget_stream(state.id);
    if !first {
        return;
    }

    let frame = Frame::encode(FrameHeader::new(state.id, FrameOp::Reset), &[]);
    match inner
        .enqueue_control_frame(frame, inner.cfg.reset_stream_timeout)
        .await
    {
        Ok(()) => {},
        Err(MuxError::Timeout) => {
            warn!(stream = %state.id, "writer wedged while emitting RESET, closing session");
            inner.close_no_wait();
        },
        Err(e) => debug!(stream = %state.id, "RESET not sent: {e}"),
    }
}

/// Reader task. Decodes frames off the carrier and dispatches them until
/// the peer closes, the session shuts down, or the protocol is violated;
/// then runs the one cleanup pass.
async fn handle_incoming<R>(
    inner: Arc<SessionInner>,
    mut r: BufReader<R>,
    accept_tx: mpsc::Sender<MuxStream>,
) where
    R: AsyncRead + Send + Unpin,
{
    if let Err(e) = recv_loop(&inner, &mut r, &accept_tx).await {
        warn!("session reader stopped: {e}");
        let _ = inner.shutdown_err.set(e);
    }
    cleanup(&inner);
}

async fn recv_loop<R>(
    inner: &Arc<SessionInner>,
    r: &mut BufReader<R>,
    accept_tx: &mpsc::Sender<MuxStream>,
) -> Result<(), MuxError>
where
    R: AsyncRead + Send + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = inner.shutdown.cancelled() => return Ok(()),
            res = Frame::read_from(r, inner.cfg.max_message_size) => match res? {
                Some(f) => f,
                None => {
                    debug!("carrier closed by peer");
                    return Ok(());
                },
            },
        };

        let id = frame.header.local_id();
        match FrameOp::from_tag(frame.header.tag) {
            Some(FrameOp::NewStream) => {
                on_new_stream(inner, id, frame.payload, accept_tx).await?;
            },
            Some(FrameOp::Message) => on_message(inner, id, frame.payload).await?,
            Some(FrameOp::Close) => on_close(inner, id),
            Some(FrameOp::Reset) => on_reset(inner, id),
            None => {
                warn!(stream = %id, tag = frame.header.tag, "unknown frame tag");
                let state = {
                    let tab = inner.table_guard();
                    tab.map
                        .as_ref()
                        .and_then(|m| m.get(&id))
                        .map(|e| Arc::clone(&e.state))
                };
                if let Some(state) = state {
                    reset_stream(inner, &state).await;
                }
            },
        }
    }
}

/// Peer opened a stream towards us.
async fn on_new_stream(
    inner: &Arc<SessionInner>,
    id: StreamId,
    payload: Bytes,
    accept_tx: &mpsc::Sender<MuxStream>,
) -> Result<(), MuxError> {
    let name = if payload.is_empty() {
        id.num.to_string()
    } else {
        String::from_utf8_lossy(&payload).into_owned()
    };

    let stream = {
        let mut tab = inner.table_guard();
        let Some(map) = tab.map.as_mut() else {
            return Err(MuxError::Shutdown);
        };
        if map.contains_key(&id) {
            error!(stream = %id, "peer reused a live stream id");
            return Err(MuxError::InvalidState("NEW_STREAM reuses a live stream id"));
        }
        let (stream, entry) = make_stream(inner, id, name);
        map.insert(id, entry);
        stream
    };

    debug!(stream = %stream, "accepted inbound stream");
    tokio::select! {
        res = accept_tx.send(stream) => {
            // The receiver only goes away with the session handles.
            res.map_err(|_| MuxError::Shutdown)
        },
        _ = inner.shutdown.cancelled() => Err(MuxError::Shutdown),
    }
}

/// Peer data. Delivery into the stream's bounded queue is the only
/// backpressure; the receive timeout keeps one unread stream from
/// wedging the whole session's reader.
async fn on_message(
    inner: &Arc<SessionInner>,
    id: StreamId,
    payload: Bytes,
) -> Result<(), MuxError> {
    let looked_up = {
        let tab = inner.table_guard();
        let Some(map) = tab.map.as_ref() else {
            return Err(MuxError::Shutdown);
        };
        map.get(&id)
            .map(|e| (e.data_tx.clone(), Arc::clone(&e.state)))
    };

    let Some((data_tx, state)) = looked_up else {
        // The stream was forgotten; no courtesy RESET, matching the
        // sender-side silent drop.
        trace!(stream = %id, "message for unknown stream, dropping");
        return Ok(());
    };
    let Some(data_tx) = data_tx else {
        warn!(stream = %id, "message after peer CLOSE, dropping");
        return Ok(());
    };

    tokio::select! {
        biased;
        _ = state.reset.cancelled() => {},
        _ = inner.shutdown.cancelled() => return Err(MuxError::Shutdown),
        res = timeout(inner.cfg.receive_timeout, data_tx.send(payload)) => match res {
            Ok(Ok(())) => {},
            // The handle was dropped; its reset bookkeeping is on the way.
            Ok(Err(_)) => trace!(stream = %id, "receiver gone, payload dropped"),
            Err(_) => {
                warn!(stream = %id, "receive timeout, resetting stream");
                let inner = Arc::clone(inner);
                tokio::spawn(async move {
                    reset_stream(&inner, &state).await;
                });
            },
        },
    }
    Ok(())
}

/// Peer half-closed: its direction carries no more data.
fn on_close(inner: &SessionInner, id: StreamId) {
    let state = {
        let mut tab = inner.table_guard();
        let Some(entry) = tab.map.as_mut().and_then(|m| m.get_mut(&id)) else {
            trace!(stream = %id, "CLOSE for unknown stream, ignoring");
            return;
        };
        // Dropping the sender ends the inbound queue after the data
        // already buffered.
        entry.data_tx.take();
        Arc::clone(&entry.state)
    };

    {
        let mut cl = state.cl_guard();
        if cl.remote != RemoteHalf::Open {
            warn!(stream = %id, "duplicate CLOSE from peer");
        } else {
            cl.remote = RemoteHalf::Closed;
        }
    }
    inner.remove_if_fully_closed(&state);
}

/// Peer aborted the stream.
fn on_reset(inner: &SessionInner, id: StreamId) {
    let removed = {
        let mut tab = inner.table_guard();
        tab.map.as_mut().and_then(|m| m.remove(&id))
    };
    // Unknown is fine: we may have forgotten the stream already.
    let Some(entry) = removed else {
        trace!(stream = %id, "RESET for unknown stream, ignoring");
        return;
    };
    debug!(stream = %id, "stream reset by peer");
    entry.state.mark_reset();
    entry.state.read_deadline.cancel();
    entry.state.write_deadline.cancel();
}

/// The one teardown pass, run from the reader task's exit path. Streams
/// still in the table are aborted, the table becomes the shutdown
/// sentinel, the first error (or plain `Shutdown`) is latched, and
/// `closed` is signalled for `Session::close` waiters.
fn cleanup(inner: &SessionInner) {
    inner.close_no_wait();

    let entries = {
        let mut tab = inner.table_guard();
        tab.map.take()
    };
    if let Some(map) = entries {
        for (_, entry) in map {
            entry.state.mark_reset();
            entry.state.read_deadline.cancel();
            entry.state.write_deadline.cancel();
        }
    }

    let _ = inner.shutdown_err.set(MuxError::Shutdown);
    inner.closed.cancel();
}

/// Writer task: the only path to the carrier's write half. One frame per
/// carrier write; buffers go back to the pool as they are dropped.
async fn handle_outgoing<W>(
    inner: Arc<SessionInner>,
    mut w: W,
    mut write_rx: mpsc::Receiver<Bytes>,
) where
    W: AsyncWrite + Send + Unpin,
{
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            buf = write_rx.recv() => match buf {
                Some(buf) => {
                    if let Err(e) = w.write_all(&buf).await {
                        warn!("carrier write failed: {e}");
                        inner.close_no_wait();
                        break;
                    }
                },
                None => break,
            },
        }
    }
    // Half-close so the peer's reader sees end-of-stream.
    if let Err(e) = w.shutdown().await {
        debug!("carrier shutdown: {e}");
    }
}
