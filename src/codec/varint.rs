// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::MuxError;

/// Maximum encoded length of an unsigned LEB128 `u64`.
pub const MAX_VARINT_LEN: usize = 10;

/// Append `v` to `buf` as an unsigned LEB128 varint.
pub fn put_uvarint(buf: &mut BytesMut, mut v: u64) {
    while v >= 0x80 {
        buf.put_u8((v as u8) | 0x80);
        v >>= 7;
    }
    buf.put_u8(v as u8);
}

/// Encoded length of `v` as an unsigned LEB128 varint, in bytes.
pub fn uvarint_len(mut v: u64) -> usize {
    let mut n = 1;
    while v >= 0x80 {
        v >>= 7;
        n += 1;
    }
    n
}

/// Read one unsigned LEB128 varint from `r`, one byte at a time.
///
/// `r` is expected to be buffered; the session reads headers through a
/// `BufReader` over the carrier. More than [`MAX_VARINT_LEN`] bytes, or a
/// tenth byte above 1, is a protocol violation.
pub async fn read_uvarint<R>(r: &mut R) -> Result<u64, MuxError>
where R: AsyncRead + Unpin {
    let mut v: u64 = 0;
    for i in 0..MAX_VARINT_LEN {
        let b = r.read_u8().await?;
        if i == MAX_VARINT_LEN - 1 && b > 1 {
            return Err(MuxError::InvalidState("varint overflows u64"));
        }
        v |= u64::from(b & 0x7f) << (7 * i);
        if b & 0x80 == 0 {
            return Ok(v);
        }
    }
    Err(MuxError::InvalidState("varint longer than 10 bytes"))
}
