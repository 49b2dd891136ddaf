// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use mplex_rs::{
    codec::frame::{Frame, FrameHeader, FrameOp, StreamId},
    error::MuxError,
};

const MAX: usize = 1 << 20;

#[test]
fn header_tag_parity() {
    // Initiator side: parity bit clear.
    let h = FrameHeader::new(StreamId { num: 5, initiator: true }, FrameOp::Message);
    assert_eq!(h.encode(), 5 << 3 | 2);

    // Receiver side: parity bit set.
    let h = FrameHeader::new(StreamId { num: 5, initiator: false }, FrameOp::Message);
    assert_eq!(h.encode(), 5 << 3 | 3);

    let h = FrameHeader::new(StreamId { num: 9, initiator: false }, FrameOp::Reset);
    assert_eq!(h.encode(), 9 << 3 | 7);
}

#[test]
fn local_identity_mirrors_sender() {
    // A MESSAGE sent by the initiator lands in the receiver's table under
    // initiator=false, and the other way around.
    let from_initiator = FrameHeader::decode(5 << 3 | 2);
    assert_eq!(from_initiator.local_id(), StreamId { num: 5, initiator: false });

    let from_receiver = FrameHeader::decode(5 << 3 | 3);
    assert_eq!(from_receiver.local_id(), StreamId { num: 5, initiator: true });

    assert_eq!(FrameOp::from_tag(from_initiator.tag), Some(FrameOp::Message));
    assert_eq!(from_initiator.op_raw(), 2);
}

#[test]
fn new_stream_golden_bytes() {
    let id = StreamId { num: 0, initiator: true };
    let buf = Frame::encode(FrameHeader::new(id, FrameOp::NewStream), b"hello");
    assert_eq!(buf.as_ref(), hex::decode("000568656c6c6f").expect("fixture"));
}

#[tokio::test]
async fn encode_decode_roundtrip() -> Result<()> {
    let id = StreamId { num: 77, initiator: false };
    let buf = Frame::encode(FrameHeader::new(id, FrameOp::Message), b"payload bytes");
    let mut r: &[u8] = &buf;

    let frame = Frame::read_from(&mut r, MAX).await?.expect("one frame");
    assert_eq!(frame.header.local_id(), StreamId { num: 77, initiator: false });
    assert_eq!(FrameOp::from_tag(frame.header.tag), Some(FrameOp::Message));
    assert_eq!(frame.payload.as_ref(), b"payload bytes");
    assert!(r.is_empty());
    Ok(())
}

#[tokio::test]
async fn empty_payload_frames() -> Result<()> {
    let id = StreamId { num: 3, initiator: true };
    let buf = Frame::encode(FrameHeader::new(id, FrameOp::Close), &[]);
    assert_eq!(buf.len(), 2);

    let mut r: &[u8] = &buf;
    let frame = Frame::read_from(&mut r, MAX).await?.expect("one frame");
    assert_eq!(FrameOp::from_tag(frame.header.tag), Some(FrameOp::Close));
    assert!(frame.payload.is_empty());
    Ok(())
}

#[tokio::test]
async fn clean_eof_between_frames() -> Result<()> {
    let mut r: &[u8] = &[];
    assert!(Frame::read_from(&mut r, MAX).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn truncated_payload_is_io_error() -> Result<()> {
    let id = StreamId { num: 1, initiator: true };
    let buf = Frame::encode(FrameHeader::new(id, FrameOp::Message), b"full payload");
    let mut r: &[u8] = &buf[..buf.len() - 3];
    assert!(matches!(
        Frame::read_from(&mut r, MAX).await,
        Err(MuxError::Io(_))
    ));
    Ok(())
}

#[tokio::test]
async fn oversize_length_rejected_before_payload() -> Result<()> {
    let id = StreamId { num: 1, initiator: true };
    // Hand-build a frame announcing more than the cap; no payload needed,
    // the length prefix alone must kill the decode.
    let mut bytes = Vec::new();
    let mut header = bytes::BytesMut::new();
    mplex_rs::codec::varint::put_uvarint(
        &mut header,
        FrameHeader::new(id, FrameOp::Message).encode(),
    );
    mplex_rs::codec::varint::put_uvarint(&mut header, (MAX + 1) as u64);
    bytes.extend_from_slice(&header);

    let mut r: &[u8] = &bytes;
    match Frame::read_from(&mut r, MAX).await {
        Err(MuxError::MessageTooLarge { size, max }) => {
            assert_eq!(size, MAX + 1);
            assert_eq!(max, MAX);
        },
        other => panic!("expected MessageTooLarge, got {other:?}"),
    }
    Ok(())
}
