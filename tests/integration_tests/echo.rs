// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use rand::RngExt;
use tokio::time::timeout;

use crate::integration_tests::common::{
    SCENARIO_BOUND, read_exact, read_to_end, session_pair,
};

#[tokio::test]
async fn echo_roundtrip() -> Result<()> {
    timeout(SCENARIO_BOUND, async {
        let (a, b) = session_pair();

        let mut sa = a.new_stream().await?;
        sa.write(b"abcdefghijkl").await?;

        let mut sb = b.accept().await?;
        let got = read_exact(&mut sb, 12).await?;
        assert_eq!(&got, b"abcdefghijkl");

        sb.write(&got).await?;
        sb.close().await?;

        let echoed = read_exact(&mut sa, 12).await?;
        assert_eq!(&echoed, b"abcdefghijkl");

        // Graceful close: end-of-stream after the data.
        let mut tail = [0u8; 8];
        assert_eq!(sa.read(&mut tail).await?, 0);
        Ok(())
    })
    .await?
}

#[tokio::test]
async fn byte_order_survives_arbitrary_chunking() -> Result<()> {
    timeout(SCENARIO_BOUND, async {
        let (a, b) = session_pair();

        let mut rng = rand::rng();
        let payload: Vec<u8> = (0..64 * 1024).map(|_| rng.random()).collect();

        let sa = a.new_stream().await?;
        let to_send = payload.clone();
        let writer = tokio::spawn(async move {
            let mut off = 0;
            let mut rng: rand::rngs::StdRng = rand::make_rng();
            while off < to_send.len() {
                let n = rng.random_range(1..=4096).min(to_send.len() - off);
                sa.write(&to_send[off..off + n]).await?;
                off += n;
            }
            sa.close().await?;
            Ok::<_, mplex_rs::error::MuxError>(())
        });

        let mut sb = b.accept().await?;
        let got = read_to_end(&mut sb).await?;
        writer.await??;

        assert_eq!(got.len(), payload.len());
        assert_eq!(got, payload);
        Ok(())
    })
    .await?
}

#[tokio::test]
async fn named_stream_carries_its_name() -> Result<()> {
    timeout(SCENARIO_BOUND, async {
        let (a, b) = session_pair();

        let sa = a.new_named_stream("metrics").await?;
        assert_eq!(sa.name(), "metrics");
        sa.write(b"x").await?;

        let sb = b.accept().await?;
        assert_eq!(sb.name(), "metrics");
        assert_eq!(sb.id(), sa.id());
        assert!(sa.is_initiator());
        assert!(!sb.is_initiator());
        Ok(())
    })
    .await?
}

#[tokio::test]
async fn unnamed_stream_defaults_to_decimal_id() -> Result<()> {
    timeout(SCENARIO_BOUND, async {
        let (a, b) = session_pair();

        let s0 = a.new_stream().await?;
        let s1 = a.new_stream().await?;
        assert_eq!(s0.name(), "0");
        assert_eq!(s1.name(), "1");
        s0.write(b"x").await?;

        let sb = b.accept().await?;
        assert_eq!(sb.name(), "0");
        Ok(())
    })
    .await?
}

#[tokio::test]
async fn protocol_label_is_local_metadata() -> Result<()> {
    timeout(SCENARIO_BOUND, async {
        let (a, b) = session_pair();

        let sa = a.new_stream().await?;
        sa.set_protocol("/echo/1.0.0");
        assert_eq!(sa.protocol(), "/echo/1.0.0");
        sa.write(b"x").await?;

        // Never on the wire: the peer sees an empty label.
        let sb = b.accept().await?;
        assert_eq!(sb.protocol(), "");
        Ok(())
    })
    .await?
}
