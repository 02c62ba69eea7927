// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Outbound connection pool for one remote peer.
//!
//! A [`Client`] owns a shared outbound buffer, the nonce table and a
//! set of connection tasks that it grows lazily toward
//! `transport.target_capacity`. Writers append frames through a
//! [`FrameWriter`] under 64 KiB soft-cap backpressure; each live
//! connection runs a paired read/write loop under a child cancellation
//! token. Dial attempts are serialized through one gate and policed by
//! the circuit breaker, so a flapping peer sees a single backing-off
//! prober instead of a thundering herd.

use std::{
    net::SocketAddr,
    str::FromStr,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::{Context, Result, bail};
use bytes::{Buf, BytesMut};
use dashmap::DashMap;
use socket2::SockRef;
use tokio::{
    io::AsyncWriteExt,
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{Notify, watch},
    time::sleep,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, warn};

use crate::{
    cfg::config::Config,
    client::{
        ClientError,
        breaker::{BreakerState, CircuitBreaker},
        common::{OUTBOUND_SOFT_CAP, RawFrame, fill, io_with_timeout, now_ms},
        rpc::RpcTable,
    },
    models::{
        addr::PeerAddr,
        opcode::{Op, Tag},
        packet::{HEADER_LEN, MAX_FRAME_LEN, PacketHeader, ProtocolError},
    },
};

/// Establishment progress broadcast to callers blocked on the pool.
#[derive(Debug, Clone)]
enum ConnectProgress {
    /// No connection is alive yet; an attempt may be in flight.
    Pending,
    /// At least one connection completed its handshake.
    Alive,
    /// The breaker tripped; every blocked caller fails with this error
    /// until a later attempt succeeds.
    Failed(ClientError),
}

struct ConnSlot {
    alive: bool,
}

/// Outcome of one serialized dial attempt.
enum AttemptError {
    Tripped,
    Cancelled,
    Dial(anyhow::Error),
}

pub struct Client {
    cfg: Config,
    peer: SocketAddr,
    rpc: RpcTable,
    /// Shared outbound buffer; the write loop takes ownership of the
    /// contents at each flush.
    outbound: Mutex<BytesMut>,
    /// Wakes writers parked on the soft cap after a flush.
    write_released: Notify,
    /// Tells the write loop that bytes are pending.
    flush_hint: Notify,
    /// Connection tasks by pool id; `alive` flips once the socket is
    /// established.
    conns: DashMap<u64, ConnSlot>,
    pool_ids: AtomicU64,
    tasks: TaskTracker,
    /// Serializes all dial attempts so they observe breaker state in
    /// order.
    connect_gate: tokio::sync::Mutex<()>,
    connect_state: watch::Sender<ConnectProgress>,
    breaker: Mutex<CircuitBreaker>,
    cancel: CancellationToken,
}

impl Client {
    /// Bind a client to the configured remote address. No connection is
    /// dialed until the first writer asks for one.
    pub fn new(cfg: Config) -> Result<Arc<Self>> {
        cfg.validate()?;
        let peer = PeerAddr::from_str(&cfg.transport.target_address)
            .with_context(|| {
                format!("bad target address {:?}", cfg.transport.target_address)
            })?;

        let breaker = CircuitBreaker::new(
            cfg.breaker.max_failed_attempts,
            cfg.breaker.reset_after_ms,
        );
        let (connect_state, _) = watch::channel(ConnectProgress::Pending);

        Ok(Arc::new(Self {
            peer: peer.into(),
            rpc: RpcTable::new(),
            outbound: Mutex::new(BytesMut::with_capacity(OUTBOUND_SOFT_CAP)),
            write_released: Notify::new(),
            flush_hint: Notify::new(),
            conns: DashMap::new(),
            pool_ids: AtomicU64::new(0),
            tasks: TaskTracker::new(),
            connect_gate: tokio::sync::Mutex::new(()),
            connect_state,
            breaker: Mutex::new(breaker),
            cancel: CancellationToken::new(),
            cfg,
        }))
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Connection tasks currently registered (probing or alive).
    pub fn connections(&self) -> usize {
        self.conns.len()
    }

    /// Requests registered and not yet answered.
    pub fn in_flight(&self) -> usize {
        self.rpc.in_flight()
    }

    /// Bytes appended but not yet taken by a write loop.
    pub fn queued_bytes(&self) -> usize {
        self.outbound().len()
    }

    /// Send `body` as a request and park until the matching response
    /// arrives or the client shuts down.
    pub async fn request(self: &Arc<Self>, tag: Tag, body: &[u8]) -> Result<RawFrame> {
        let reply = self.rpc.register(&self.cancel).await?;
        {
            let writer = self.acquire_writer().await?;
            writer.write_packet(reply.nonce(), Op::Request, tag, body)?;
        }
        Ok(reply.recv(&self.cancel).await?)
    }

    /// Fire-and-forget one-way message.
    pub async fn command(self: &Arc<Self>, tag: Tag, body: &[u8]) -> Result<()> {
        let writer = self.acquire_writer().await?;
        writer.write_packet(0, Op::Command, tag, body)
    }

    /// Cancel the context, then wait for every connection task to
    /// finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.write_released.notify_waiters();
        self.flush_hint.notify_waiters();
        self.tasks.close();
        self.tasks.wait().await;
    }

    /// Hand out an append handle over the outbound buffer.
    ///
    /// Ensures a connection is available (spawning one if the pool
    /// warrants it), then parks while the buffer sits above the soft
    /// cap. Fails `Closed` once the client is shutting down.
    pub async fn acquire_writer(self: &Arc<Self>) -> Result<FrameWriter> {
        if self.cancel.is_cancelled() {
            bail!(ClientError::Closed);
        }
        self.ensure_connection_available().await?;

        loop {
            let released = self.write_released.notified();
            if self.outbound().len() <= OUTBOUND_SOFT_CAP {
                break;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => bail!(ClientError::Closed),
                _ = released => {},
            }
        }

        Ok(FrameWriter {
            client: Arc::clone(self),
        })
    }

    fn outbound(&self) -> MutexGuard<'_, BytesMut> {
        self.outbound.lock().expect("outbound buffer lock poisoned")
    }

    fn breaker(&self) -> MutexGuard<'_, CircuitBreaker> {
        self.breaker.lock().expect("breaker lock poisoned")
    }

    fn alive_connections(&self) -> usize {
        self.conns.iter().filter(|slot| slot.value().alive).count()
    }

    /// Lazy pool growth. Spawns a connection task when none exists, or
    /// when bytes are pending, no dial failures are on record and the
    /// pool sits below its target capacity. Parks until a connection is
    /// alive, failing fast when the breaker's trip is broadcast.
    async fn ensure_connection_available(self: &Arc<Self>) -> Result<()> {
        if self.cancel.is_cancelled() {
            bail!(ClientError::Closed);
        }

        let pending_bytes = !self.outbound().is_empty();
        let should_spawn = self.conns.is_empty()
            || (pending_bytes
                && !self.breaker().has_failures()
                && self.conns.len() < self.cfg.transport.target_capacity);
        if should_spawn {
            self.spawn_connection();
        }

        if self.alive_connections() > 0 {
            return Ok(());
        }

        let mut progress = self.connect_state.subscribe();
        let state = tokio::select! {
            _ = self.cancel.cancelled() => bail!(ClientError::Closed),
            res = progress.wait_for(|p| !matches!(p, ConnectProgress::Pending)) => {
                res.context("connect progress channel closed")?.clone()
            },
        };
        match state {
            ConnectProgress::Failed(e) => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn spawn_connection(self: &Arc<Self>) {
        if self.tasks.is_closed() {
            return;
        }
        self.connect_state.send_replace(ConnectProgress::Pending);
        let id = self.pool_ids.fetch_add(1, Ordering::Relaxed);
        self.conns.insert(id, ConnSlot { alive: false });

        let client = Arc::clone(self);
        self.tasks.spawn(async move {
            client.serve_connection(id).await;
        });
    }

    /// One pool slot: dial under breaker rules, run the paired loops,
    /// then reconnect or shed per the contraction policy.
    async fn serve_connection(self: Arc<Self>, id: u64) {
        debug!("connection #{id} -> {} starting", self.peer);
        loop {
            let stream = match self.attempt_connection().await {
                Ok(stream) => stream,
                Err(AttemptError::Cancelled) => break,
                Err(AttemptError::Tripped) => {
                    warn!("connection #{id}: circuit breaker tripped");
                    self.connect_state.send_replace(ConnectProgress::Failed(
                        ClientError::CircuitBreakerTripped,
                    ));
                    break;
                },
                Err(AttemptError::Dial(e)) => {
                    debug!("connection #{id}: dial failed: {e}");
                    // Contract toward a single probing task while the
                    // peer is unhealthy.
                    if self.conns.len() > 1 {
                        break;
                    }
                    continue;
                },
            };

            self.breaker().report_success();
            if let Some(mut slot) = self.conns.get_mut(&id) {
                slot.alive = true;
            }
            self.connect_state.send_replace(ConnectProgress::Alive);
            debug!("connection #{id} alive");

            let child = self.cancel.child_token();
            let (reader, writer) = stream.into_split();
            let write_task = {
                let client = Arc::clone(&self);
                let child = child.clone();
                tokio::spawn(async move { client.write_loop(child, writer).await })
            };

            // The read loop drives teardown: whatever ends it, the
            // child cancel unparks the write loop and its socket I/O.
            let res = self.read_loop(&child, reader).await;
            if let Err(e) = &res {
                if !child.is_cancelled() {
                    warn!("connection #{id}: read loop exited: {e}");
                }
            }
            child.cancel();
            match write_task.await {
                Ok(Ok(())) => {},
                Ok(Err(e)) => debug!("connection #{id}: write loop exited: {e}"),
                Err(e) => warn!("connection #{id}: write loop aborted: {e}"),
            }

            if let Some(mut slot) = self.conns.get_mut(&id) {
                slot.alive = false;
            }
            if self.alive_connections() == 0 && !self.cancel.is_cancelled() {
                self.connect_state.send_replace(ConnectProgress::Pending);
            }

            if self.cancel.is_cancelled() {
                break;
            }
            if self.conns.len() > self.cfg.transport.target_capacity {
                break;
            }
        }
        self.conns.remove(&id);
        debug!("connection #{id} finished");
    }

    /// Dial once. The gate serializes attempts; the breaker is checked
    /// under it and the backoff sleep runs before the socket is opened.
    async fn attempt_connection(&self) -> Result<TcpStream, AttemptError> {
        let _gate = tokio::select! {
            _ = self.cancel.cancelled() => return Err(AttemptError::Cancelled),
            gate = self.connect_gate.lock() => gate,
        };

        let backoff = {
            let breaker = self.breaker();
            match breaker.state(now_ms()) {
                BreakerState::Open => return Err(AttemptError::Tripped),
                BreakerState::Closed | BreakerState::HalfOpen => breaker.backoff(),
            }
        };
        if let Some(delay) = backoff {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(AttemptError::Cancelled),
                _ = sleep(delay) => {},
            }
        }

        match self.dial().await {
            Ok(stream) => Ok(stream),
            Err(e) => {
                self.breaker().report_failure(now_ms());
                Err(AttemptError::Dial(e))
            },
        }
    }

    async fn dial(&self) -> Result<TcpStream> {
        let stream = io_with_timeout(
            "connect",
            TcpStream::connect(self.peer),
            self.cfg.timeouts.connect(),
            &self.cancel,
        )
        .await?;

        stream.set_nodelay(true)?;
        let sock = SockRef::from(&stream);
        sock.set_keepalive(true)?;
        #[cfg(target_os = "linux")]
        sock.set_quickack(true)?;

        Ok(stream)
    }

    /// Frame packets off the socket and route responses through the
    /// nonce table. A rejected response is a protocol violation and
    /// kills the connection; inbound commands and requests are
    /// discarded, the client does not serve them.
    async fn read_loop(
        &self,
        child: &CancellationToken,
        mut reader: OwnedReadHalf,
    ) -> Result<()> {
        let mut fifo = BytesMut::with_capacity(8 * 1024);
        loop {
            if !fill(&mut reader, child, &mut fifo, HEADER_LEN).await? {
                if fifo.is_empty() {
                    return Ok(()); // clean disconnect
                }
                bail!("peer closed mid-header");
            }
            let mut header_buf = [0u8; HEADER_LEN];
            header_buf.copy_from_slice(&fifo[..HEADER_LEN]);
            let header = PacketHeader::decode(&header_buf)?;
            fifo.advance(HEADER_LEN);

            if !fill(&mut reader, child, &mut fifo, header.len as usize).await? {
                bail!("peer closed mid-body");
            }
            let body = fifo.split_to(header.len as usize).freeze();

            match header.op {
                Op::Response => {
                    if !self.rpc.push(RawFrame { header, body }) {
                        bail!(ProtocolError::UnexpectedResponse(header.nonce));
                    }
                },
                Op::Command | Op::Request => {
                    debug!("discarding inbound {:?}/{:?}", header.op, header.tag);
                },
            }
        }
    }

    /// Park until bytes are pending, take ownership of the whole buffer
    /// and flush it with a single write. Writers stalled on the soft
    /// cap are released after every flush.
    async fn write_loop(
        self: Arc<Self>,
        child: CancellationToken,
        mut writer: OwnedWriteHalf,
    ) -> Result<()> {
        let res = self.flush_frames(&child, &mut writer).await;

        // On every exit path: drain what is still queued, then
        // half-close so the peer sees EOF.
        let chunk = std::mem::take(&mut *self.outbound());
        if !chunk.is_empty() {
            let _ =
                tokio::time::timeout(self.cfg.timeouts.io(), writer.write_all(&chunk))
                    .await;
        }
        let _ = writer.shutdown().await;
        self.write_released.notify_waiters();
        res
    }

    async fn flush_frames(
        &self,
        child: &CancellationToken,
        writer: &mut OwnedWriteHalf,
    ) -> Result<()> {
        loop {
            let hint = self.flush_hint.notified();
            let chunk = {
                let mut outbound = self.outbound();
                if outbound.is_empty() {
                    None
                } else {
                    Some(std::mem::take(&mut *outbound))
                }
            };
            let Some(chunk) = chunk else {
                tokio::select! {
                    _ = child.cancelled() => return Ok(()),
                    _ = hint => continue,
                }
            };

            io_with_timeout(
                "flush",
                writer.write_all(&chunk),
                self.cfg.timeouts.io(),
                child,
            )
            .await?;
            self.write_released.notify_waiters();
        }
    }
}

/// Append-only handle over the client's shared outbound buffer.
///
/// Dropping the handle hints the write loop to flush, so a caller that
/// appends several frames under one handle gets them flushed together.
pub struct FrameWriter {
    client: Arc<Client>,
}

impl std::fmt::Debug for FrameWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameWriter").finish_non_exhaustive()
    }
}

impl FrameWriter {
    /// Encode one frame onto the outbound buffer.
    pub fn write_packet(&self, nonce: u32, op: Op, tag: Tag, body: &[u8]) -> Result<()> {
        if body.len() > MAX_FRAME_LEN as usize {
            bail!(ProtocolError::FrameTooLarge(body.len() as u32));
        }
        let header = PacketHeader::new(body.len() as u32, nonce, op, tag);
        let mut outbound = self.client.outbound();
        header.encode(&mut outbound);
        outbound.extend_from_slice(body);
        Ok(())
    }
}

impl Drop for FrameWriter {
    fn drop(&mut self) {
        self.client.flush_hint.notify_one();
    }
}
