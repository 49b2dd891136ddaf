// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{io, sync::Arc};

use thiserror::Error;

/// Terminal and retryable failures surfaced by sessions and streams.
///
/// The session latches the first instance of a terminal error and keeps
/// returning clones of it from `accept`/`close`/`new_named_stream`, so the
/// enum is `Clone`; carrier I/O errors are wrapped in `Arc` for that reason.
#[derive(Debug, Clone, Error)]
pub enum MuxError {
    /// The session is closed, locally or by the peer.
    #[error("session is shut down")]
    Shutdown,

    /// Reserved for handshake-level negotiation; not emitted by the core.
    #[error("two initiators on one carrier")]
    TwoInitiators,

    /// The peer sent a frame inconsistent with protocol state.
    #[error("protocol violation: {0}")]
    InvalidState(&'static str),

    /// An inbound length prefix exceeded the configured maximum.
    #[error("message of {size} bytes exceeds maximum of {max}")]
    MessageTooLarge { size: usize, max: usize },

    /// A deadline expired. Retryable with a larger deadline.
    #[error("deadline expired")]
    Timeout,

    /// The stream was reset, locally or by the peer.
    #[error("stream reset")]
    StreamReset,

    /// The local side of the stream is already closed for writing.
    #[error("stream closed")]
    StreamClosed,

    /// The accept queue is closed; no further inbound streams.
    #[error("multiplex closed")]
    ClosedMultiplex,

    #[error("carrier i/o: {0}")]
    Io(Arc<io::Error>),
}

impl MuxError {
    /// Whether the caller may retry the operation (with a larger deadline).
    pub fn is_temporary(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

impl From<io::Error> for MuxError {
    fn from(e: io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}
