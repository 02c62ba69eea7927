// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use peerlink_rs::{
    client::{ClientError, client::Client},
    models::opcode::Tag,
};
use tokio::time::timeout;

use crate::integration_tests::common::{quick_config, spawn_echo_peer};

#[tokio::test]
async fn test_shutdown_finishes_in_bounded_time() -> Result<()> {
    let peer = spawn_echo_peer().await?;
    let client = Client::new(quick_config(peer))?;

    let reply = client.request(Tag::Ping, b"warm").await?;
    assert_eq!(reply.body.as_ref(), b"warm");
    assert_eq!(client.connections(), 1);

    timeout(Duration::from_secs(5), client.shutdown())
        .await
        .expect("shutdown must complete once the context is cancelled");
    assert_eq!(client.connections(), 0);
    Ok(())
}

#[tokio::test]
async fn test_closed_client_rejects_new_work() -> Result<()> {
    let peer = spawn_echo_peer().await?;
    let client = Client::new(quick_config(peer))?;
    client.shutdown().await;

    let err = client
        .acquire_writer()
        .await
        .expect_err("a closed client must not hand out writers");
    assert_eq!(err.downcast_ref::<ClientError>(), Some(&ClientError::Closed));
    Ok(())
}

#[tokio::test]
async fn test_shutdown_wakes_parked_awaiters() -> Result<()> {
    // A peer that accepts the socket, then goes silent: requests park
    // forever awaiting responses that never come.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        // Hold the socket open without answering anything.
        std::mem::forget(stream);
    });

    let client = Client::new(quick_config(addr))?;
    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.request(Tag::Ping, b"void").await })
    };
    // Give the request time to get registered and flushed.
    tokio::time::sleep(Duration::from_millis(200)).await;

    timeout(Duration::from_secs(5), client.shutdown())
        .await
        .expect("shutdown must not hang on a parked awaiter");

    let err = timeout(Duration::from_secs(1), pending)
        .await
        .expect("awaiter must be woken")?
        .expect_err("the parked request must fail, not succeed");
    assert_eq!(
        err.downcast_ref::<ClientError>(),
        Some(&ClientError::Cancelled)
    );
    Ok(())
}
