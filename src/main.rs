// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{net::SocketAddr, str::FromStr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use bytes::Bytes;
use peerlink_rs::{
    cfg::{cli::resolve_config_path, config::Config, logger::init_logger},
    client::client::Client,
    models::{
        addr::PeerAddr,
        opcode::{Op, Tag},
        packet::PacketHeader,
    },
    server::server::{PacketHandler, Server, ServerConnection},
    utils::generate_peer_id,
};
use tokio::{net::TcpListener, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Demo node: answers requests by echoing the body back as a response.
struct EchoNode;

impl PacketHandler for EchoNode {
    fn handle_packet(
        &self,
        conn: &Arc<ServerConnection>,
        header: PacketHeader,
        body: Bytes,
    ) -> impl Future<Output = Result<()>> + Send {
        async move {
            match header.op {
                Op::Request => {
                    conn.send_packet(header.nonce, Op::Response, header.tag, &body)
                },
                // Commands carry no reply; the demo just acknowledges
                // them in the log.
                _ => {
                    info!("{} sent {:?} ({} bytes)", conn.peer(), header.tag, body.len());
                    Ok(())
                },
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _init_logger = init_logger("tests/config_logger.yaml")?;

    let cfg = resolve_config_path("tests/config.yaml")
        .and_then(Config::load_from_file)
        .context("failed to resolve or load config")?;

    // Serve the configured address locally so the demo is
    // self-contained.
    let bind: SocketAddr = PeerAddr::from_str(&cfg.transport.target_address)?.into();
    let listener = TcpListener::bind(bind).await?;
    info!("listening on {}", listener.local_addr()?);

    let server_cancel = CancellationToken::new();
    let server = Server::new(EchoNode, server_cancel.clone());
    let server_task = tokio::spawn(async move { server.serve(listener).await });

    let client = Client::new(cfg)?;

    let (_, peer_id) = generate_peer_id();
    client.command(Tag::Hello, peer_id.as_bytes()).await?;
    info!("sent hello as {peer_id}");

    for seq in 0u32..3 {
        let reply = timeout(
            Duration::from_secs(10),
            client.request(Tag::Ping, &seq.to_le_bytes()),
        )
        .await
        .context("ping timeout")??;
        info!("ping {seq} answered with {} bytes", reply.body.len());
    }

    client.shutdown().await;
    server_cancel.cancel();
    server_task.await??;

    Ok(())
}
