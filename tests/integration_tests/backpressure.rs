// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use peerlink_rs::{client::client::Client, models::opcode::{Op, Tag}};
use serial_test::serial;
use tokio::{
    io::AsyncReadExt,
    net::TcpListener,
    sync::oneshot,
    time::{sleep, timeout},
};

use crate::integration_tests::common::quick_config;

const ONE_MIB: usize = 1024 * 1024;

/// Writers must park once the outbound buffer sits above the 64 KiB
/// soft cap, and resume after the write loop drains it.
#[tokio::test]
#[serial]
async fn test_writer_backpressure_parks_and_resumes() -> Result<()> {
    // A peer that accepts one socket and reads nothing until released,
    // wedging the client's write loop mid-flush.
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let peer = listener.local_addr()?;
    let (release_tx, release_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let Ok((mut stream, _)) = listener.accept().await else {
            return;
        };
        let _ = release_rx.await;
        let mut sink = [0u8; 64 * 1024];
        while let Ok(n) = stream.read(&mut sink).await {
            if n == 0 {
                return;
            }
        }
    });

    let mut cfg = quick_config(peer);
    cfg.timeouts.io_timeout_ms = 60_000;
    let client = Client::new(cfg)?;
    let body = vec![0xAB; ONE_MIB];

    // Far more than the kernel will buffer for a non-reading peer: the
    // write loop takes it all in one swap and wedges in write_all.
    {
        let writer = client.acquire_writer().await?;
        for _ in 0..16 {
            writer.write_packet(0, Op::Command, Tag::PushTransaction, &body)?;
        }
    }
    sleep(Duration::from_millis(200)).await;
    assert_eq!(client.queued_bytes(), 0, "write loop should have taken the chunk");

    // This append lands while the flush is wedged, so it stays queued
    // above the soft cap...
    {
        let writer = client.acquire_writer().await?;
        writer.write_packet(0, Op::Command, Tag::PushTransaction, &body)?;
    }
    assert!(client.queued_bytes() > 64 * 1024);

    // ...and the next writer parks.
    let parked = timeout(Duration::from_millis(300), client.acquire_writer()).await;
    assert!(parked.is_err(), "writer must park above the soft cap");

    // Let the peer drain; the flush completes and releases the parked
    // writer.
    release_tx.send(()).expect("peer task alive");
    let writer = timeout(Duration::from_secs(30), client.acquire_writer())
        .await
        .expect("writer must resume after the buffer drains")?;
    drop(writer);

    client.shutdown().await;
    Ok(())
}

/// A single append may exceed the soft cap; only subsequent writers are
/// blocked by it.
#[tokio::test]
#[serial]
async fn test_single_append_may_exceed_the_cap() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let peer = listener.local_addr()?;
    tokio::spawn(async move {
        let Ok((mut stream, _)) = listener.accept().await else {
            return;
        };
        let mut sink = [0u8; 64 * 1024];
        while let Ok(n) = stream.read(&mut sink).await {
            if n == 0 {
                return;
            }
        }
    });

    let client = Client::new(quick_config(peer))?;
    let writer = client.acquire_writer().await?;
    // 1 MiB through a single handle: accepted despite the 64 KiB cap.
    writer.write_packet(0, Op::Command, Tag::PushTransaction, &vec![0u8; ONE_MIB])?;
    drop(writer);

    client.shutdown().await;
    Ok(())
}
