// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Inbound connection dispatcher.
//!
//! The server accepts sockets, frames packets exactly like the client's
//! read loop and hands each one to the node through the
//! [`PacketHandler`] capability. That capability is the only point at
//! which application semantics enter the substrate: the server neither
//! inspects ops nor interprets bodies.

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use anyhow::{Result, bail};
use bytes::{Buf, Bytes, BytesMut};
use socket2::SockRef;
use tokio::{
    io::AsyncWriteExt,
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::Notify,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, warn};

use crate::{
    client::{
        ClientError,
        common::{OUTBOUND_SOFT_CAP, fill, io_with_timeout},
    },
    models::{
        opcode::{Op, Tag},
        packet::{HEADER_LEN, MAX_FRAME_LEN, PacketHeader, ProtocolError},
    },
};

const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);

/// The node-side capability the server dispatches inbound packets to.
///
/// `body` is bounded to exactly `header.len` bytes by the framing
/// layer. Implementations reply by queueing frames on the connection;
/// the flush happens asynchronously on the connection's write loop.
pub trait PacketHandler: Send + Sync + 'static {
    fn handle_packet(
        &self,
        conn: &Arc<ServerConnection>,
        header: PacketHeader,
        body: Bytes,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// One accepted socket: the write half's shared buffer plus the events
/// that drive it. Handed to [`PacketHandler`] implementations so they
/// can queue replies.
pub struct ServerConnection {
    peer: SocketAddr,
    outbound: Mutex<BytesMut>,
    write_released: Notify,
    flush_hint: Notify,
    cancel: CancellationToken,
}

impl ServerConnection {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Queue one frame for this peer and hint the write loop to flush.
    pub fn send_packet(&self, nonce: u32, op: Op, tag: Tag, body: &[u8]) -> Result<()> {
        if body.len() > MAX_FRAME_LEN as usize {
            bail!(ProtocolError::FrameTooLarge(body.len() as u32));
        }
        let header = PacketHeader::new(body.len() as u32, nonce, op, tag);
        {
            let mut outbound = self.outbound();
            header.encode(&mut outbound);
            outbound.extend_from_slice(body);
        }
        self.flush_hint.notify_one();
        Ok(())
    }

    fn outbound(&self) -> MutexGuard<'_, BytesMut> {
        self.outbound.lock().expect("outbound buffer lock poisoned")
    }
}

pub struct Server<H: PacketHandler> {
    handler: Arc<H>,
    io_timeout: Duration,
    tasks: TaskTracker,
    cancel: CancellationToken,
}

impl<H: PacketHandler> Server<H> {
    /// A server dispatching to `handler`, shut down by cancelling
    /// `cancel`.
    pub fn new(handler: H, cancel: CancellationToken) -> Self {
        Self {
            handler: Arc::new(handler),
            io_timeout: DEFAULT_IO_TIMEOUT,
            tasks: TaskTracker::new(),
            cancel,
        }
    }

    pub fn io_timeout(mut self, io_timeout: Duration) -> Self {
        self.io_timeout = io_timeout;
        self
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Accept connections until cancellation or a fatal accept error,
    /// then wait for every connection task to drain.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let serve_res = self.accept_loop(&listener).await;

        // Listener teardown: cancel also stops every connection task.
        self.cancel.cancel();
        drop(listener);
        self.tasks.close();
        self.tasks.wait().await;

        serve_res
    }

    async fn accept_loop(&self, listener: &TcpListener) -> Result<()> {
        loop {
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                res = listener.accept() => res,
            };
            match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = prepare_socket(&stream) {
                        warn!("socket options for {peer} failed: {e}");
                        continue;
                    }
                    self.spawn_connection(stream, peer);
                },
                Err(e) => match e.kind() {
                    // The listener is gone; stop serving.
                    std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::InvalidInput => return Ok(()),
                    // Transient pressure; keep accepting.
                    std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::OutOfMemory => {
                        warn!("accept failed: {e}");
                    },
                    _ => return Err(e.into()),
                },
            }
        }
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let conn = Arc::new(ServerConnection {
            peer,
            outbound: Mutex::new(BytesMut::with_capacity(OUTBOUND_SOFT_CAP)),
            write_released: Notify::new(),
            flush_hint: Notify::new(),
            cancel: self.cancel.child_token(),
        });
        let handler = Arc::clone(&self.handler);
        let io_timeout = self.io_timeout;
        self.tasks.spawn(async move {
            serve_connection(handler, conn, stream, io_timeout).await;
        });
    }
}

async fn serve_connection<H: PacketHandler>(
    handler: Arc<H>,
    conn: Arc<ServerConnection>,
    stream: TcpStream,
    io_timeout: Duration,
) {
    debug!("serving {}", conn.peer);
    let (reader, writer) = stream.into_split();

    let write_task = {
        let conn = Arc::clone(&conn);
        tokio::spawn(async move { write_loop(conn, writer, io_timeout).await })
    };

    let res = read_loop(handler.as_ref(), &conn, reader).await;
    if let Err(e) = &res {
        if !conn.cancel.is_cancelled() {
            warn!("{}: read loop exited: {e}", conn.peer);
        }
    }
    conn.cancel.cancel();
    match write_task.await {
        Ok(Ok(())) => {},
        Ok(Err(e)) => debug!("{}: write loop exited: {e}", conn.peer),
        Err(e) => warn!("{}: write loop aborted: {e}", conn.peer),
    }
    debug!("done serving {}", conn.peer);
}

/// Frame inbound packets and hand them to the node. Before each
/// hand-off the connection's own outbound buffer must be below the soft
/// cap, so a peer that stops reading its replies cannot force unbounded
/// buffering.
async fn read_loop<H: PacketHandler>(
    handler: &H,
    conn: &Arc<ServerConnection>,
    mut reader: OwnedReadHalf,
) -> Result<()> {
    let mut fifo = BytesMut::with_capacity(8 * 1024);
    loop {
        if !fill(&mut reader, &conn.cancel, &mut fifo, HEADER_LEN).await? {
            if fifo.is_empty() {
                return Ok(());
            }
            bail!("peer closed mid-header");
        }
        let mut header_buf = [0u8; HEADER_LEN];
        header_buf.copy_from_slice(&fifo[..HEADER_LEN]);
        let header = PacketHeader::decode(&header_buf)?;
        fifo.advance(HEADER_LEN);

        if !fill(&mut reader, &conn.cancel, &mut fifo, header.len as usize).await? {
            bail!("peer closed mid-body");
        }
        let body = fifo.split_to(header.len as usize).freeze();

        loop {
            let released = conn.write_released.notified();
            if conn.outbound().len() <= OUTBOUND_SOFT_CAP {
                break;
            }
            tokio::select! {
                _ = conn.cancel.cancelled() => bail!(ClientError::Cancelled),
                _ = released => {},
            }
        }

        handler.handle_packet(conn, header, body).await?;
    }
}

/// Identical to the client's write loop except the buffer is cleared in
/// place, retaining its capacity for the next burst of replies.
async fn write_loop(
    conn: Arc<ServerConnection>,
    mut writer: OwnedWriteHalf,
    io_timeout: Duration,
) -> Result<()> {
    let res = flush_replies(&conn, &mut writer, io_timeout).await;

    let chunk = conn.outbound().split().freeze();
    if !chunk.is_empty() {
        let _ = tokio::time::timeout(io_timeout, writer.write_all(&chunk)).await;
    }
    let _ = writer.shutdown().await;
    conn.write_released.notify_waiters();
    res
}

async fn flush_replies(
    conn: &ServerConnection,
    writer: &mut OwnedWriteHalf,
    io_timeout: Duration,
) -> Result<()> {
    loop {
        let hint = conn.flush_hint.notified();
        let chunk = {
            let mut outbound = conn.outbound();
            if outbound.is_empty() {
                None
            } else {
                Some(outbound.split().freeze())
            }
        };
        let Some(chunk) = chunk else {
            tokio::select! {
                _ = conn.cancel.cancelled() => return Ok(()),
                _ = hint => continue,
            }
        };

        io_with_timeout("flush", writer.write_all(&chunk), io_timeout, &conn.cancel)
            .await?;
        conn.write_released.notify_waiters();
    }
}

fn prepare_socket(stream: &TcpStream) -> Result<()> {
    stream.set_nodelay(true)?;
    let sock = SockRef::from(stream);
    sock.set_keepalive(true)?;
    #[cfg(target_os = "linux")]
    sock.set_quickack(true)?;
    Ok(())
}
