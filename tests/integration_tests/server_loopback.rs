// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use bytes::Bytes;
use peerlink_rs::{
    client::client::Client,
    models::{
        opcode::{Op, Tag},
        packet::PacketHeader,
    },
    server::server::{PacketHandler, Server, ServerConnection},
};
use tokio::{net::TcpListener, time::timeout};
use tokio_util::sync::CancellationToken;

use crate::integration_tests::common::quick_config;

/// Node that echoes requests and counts every hello command it sees.
struct CountingNode {
    hellos: AtomicUsize,
}

impl PacketHandler for CountingNode {
    fn handle_packet(
        &self,
        conn: &Arc<ServerConnection>,
        header: PacketHeader,
        body: Bytes,
    ) -> impl Future<Output = Result<()>> + Send {
        async move {
            match (header.op, header.tag) {
                (Op::Request, _) => {
                    conn.send_packet(header.nonce, Op::Response, header.tag, &body)
                },
                (_, Tag::Hello) => {
                    self.hellos.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
                _ => Ok(()),
            }
        }
    }
}

#[tokio::test]
async fn test_server_round_trip_with_client() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let cancel = CancellationToken::new();
    let server = Arc::new(Server::new(
        CountingNode {
            hellos: AtomicUsize::new(0),
        },
        cancel.clone(),
    ));
    let server_task = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.serve(listener).await })
    };

    let client = Client::new(quick_config(addr))?;

    client.command(Tag::Hello, b"node-under-test").await?;
    let reply = client.request(Tag::FindNode, b"who is out there").await?;
    assert_eq!(reply.header.op, Op::Response);
    assert_eq!(reply.header.tag, Tag::FindNode);
    assert_eq!(reply.body.as_ref(), b"who is out there");

    // The hello may ride a different pool connection than the request,
    // so give it a moment rather than asserting instant delivery.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while server.handler().hellos.load(Ordering::SeqCst) == 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "hello command never reached the handler"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    client.shutdown().await;
    cancel.cancel();
    timeout(Duration::from_secs(5), server_task).await???;
    Ok(())
}

#[tokio::test]
async fn test_server_survives_abrupt_client_disconnects() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let cancel = CancellationToken::new();
    let server = Server::new(
        CountingNode {
            hellos: AtomicUsize::new(0),
        },
        cancel.clone(),
    )
    .io_timeout(Duration::from_secs(10));
    let server_task = tokio::spawn(async move { server.serve(listener).await });

    // Several clients connect, talk briefly or not at all, and vanish.
    for round in 0u32..3 {
        let client = Client::new(quick_config(addr))?;
        let reply = client.request(Tag::Ping, &round.to_le_bytes()).await?;
        assert_eq!(reply.body.as_ref(), &round.to_le_bytes());
        client.shutdown().await;
    }
    {
        let raw = tokio::net::TcpStream::connect(addr).await?;
        drop(raw); // connect-and-slam
    }

    cancel.cancel();
    timeout(Duration::from_secs(5), server_task).await???;
    Ok(())
}
