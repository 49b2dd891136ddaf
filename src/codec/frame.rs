// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fmt, io};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{
    codec::varint::{MAX_VARINT_LEN, put_uvarint, uvarint_len},
    error::MuxError,
};

/// Identity of one logical stream within a session.
///
/// `initiator` is true on the side that opened the stream, so `(5, true)`
/// and `(5, false)` are distinct streams: both peers run independent id
/// spaces and the wire tag's low bit keeps them apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId {
    pub num: u64,
    pub initiator: bool,
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let side = if self.initiator { "initiator" } else { "receiver" };
        write!(f, "{}/{side}", self.num)
    }
}

/// Operation carried by a frame, the tag with its parity bit cleared.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOp {
    NewStream = 0,
    Message = 2,
    Close = 4,
    Reset = 6,
}

impl FrameOp {
    /// Classify a wire tag. `None` marks a tag outside the known
    /// operations; the session resets the target stream rather than
    /// guessing.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag & !1 {
            0 => Some(Self::NewStream),
            2 => Some(Self::Message),
            4 => Some(Self::Close),
            6 => Some(Self::Reset),
            _ => None,
        }
    }
}

/// Decoded frame header: `(num << 3) | tag_low3` on the wire.
///
/// The tag's low bit is the parity: 0 means the sender initiated the
/// stream. Receivers key their table by the inverted bit, see
/// [`FrameHeader::local_id`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub num: u64,
    pub tag: u8,
}

impl FrameHeader {
    pub fn new(id: StreamId, op: FrameOp) -> Self {
        Self {
            num: id.num,
            tag: op as u8 | u8::from(!id.initiator),
        }
    }

    pub fn decode(header: u64) -> Self {
        Self {
            num: header >> 3,
            tag: (header & 0x7) as u8,
        }
    }

    pub fn encode(&self) -> u64 {
        self.num << 3 | u64::from(self.tag)
    }

    /// Tag rounded to even, one of the [`FrameOp`] discriminants.
    pub fn op_raw(&self) -> u8 {
        self.tag & !1
    }

    /// Identity of this stream in the receiver's table: the opposite of
    /// the sender's parity bit.
    pub fn local_id(&self) -> StreamId {
        StreamId {
            num: self.num,
            initiator: self.tag & 1 == 1,
        }
    }
}

/// One `(header, length, payload)` triple read off the carrier.
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    /// Build the fully framed wire form in a single contiguous buffer:
    /// header varint, length varint, payload copied in.
    pub fn encode(header: FrameHeader, payload: &[u8]) -> Bytes {
        let header = header.encode();
        let mut buf = BytesMut::with_capacity(
            uvarint_len(header) + uvarint_len(payload.len() as u64) + payload.len(),
        );
        put_uvarint(&mut buf, header);
        put_uvarint(&mut buf, payload.len() as u64);
        buf.put_slice(payload);
        buf.freeze()
    }

    /// Decode one frame from `r`.
    ///
    /// Returns `Ok(None)` on a clean end-of-stream between frames (the
    /// peer closed the carrier); end-of-stream anywhere inside a frame is
    /// an I/O error. A length prefix above `max_len` fails with
    /// `MessageTooLarge` before any payload byte is consumed.
    pub async fn read_from<R>(r: &mut R, max_len: usize) -> Result<Option<Self>, MuxError>
    where R: AsyncRead + Unpin {
        let Some(raw_header) = read_header_varint(r).await? else {
            return Ok(None);
        };
        let header = FrameHeader::decode(raw_header);

        let len = crate::codec::varint::read_uvarint(r).await? as usize;
        if len > max_len {
            return Err(MuxError::MessageTooLarge { size: len, max: max_len });
        }
        if len == 0 {
            return Ok(Some(Self { header, payload: Bytes::new() }));
        }

        let mut payload = BytesMut::zeroed(len);
        r.read_exact(&mut payload).await?;
        Ok(Some(Self { header, payload: payload.freeze() }))
    }
}

/// Header varint reader that maps end-of-stream before the first byte to
/// `None` so the session can tell a graceful carrier close from a
/// truncated frame.
async fn read_header_varint<R>(r: &mut R) -> Result<Option<u64>, MuxError>
where R: AsyncRead + Unpin {
    let mut v: u64 = 0;
    for i in 0..MAX_VARINT_LEN {
        let b = match r.read_u8().await {
            Ok(b) => b,
            Err(e) if i == 0 && e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if i == MAX_VARINT_LEN - 1 && b > 1 {
            return Err(MuxError::InvalidState("varint overflows u64"));
        }
        v |= u64::from(b & 0x7f) << (7 * i);
        if b & 0x80 == 0 {
            return Ok(Some(v));
        }
    }
    Err(MuxError::InvalidState("varint longer than 10 bytes"))
}
