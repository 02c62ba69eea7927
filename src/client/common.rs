// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use tokio::{io::AsyncReadExt, time::timeout};
use tokio_util::sync::CancellationToken;

use crate::{client::ClientError, models::packet::PacketHeader};

/// Soft cap on a connection's outbound buffer. Appends past the cap are
/// allowed, but further writers park until the write loop drains below
/// it.
pub const OUTBOUND_SOFT_CAP: usize = 64 * 1024;

pub(crate) async fn io_with_timeout<F, T>(
    label: &'static str,
    fut: F,
    io_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<T>
where
    F: Future<Output = std::io::Result<T>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(anyhow!("{label} cancelled")),
        res = timeout(io_timeout, fut) => {
            match res {
                Ok(Ok(v)) => Ok(v),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(anyhow!("{label} timeout")),
            }
        }
    }
}

/// Milliseconds since the UNIX epoch; the clock the circuit breaker and
/// its backoff policy run on.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// One framed packet as it came off the stream.
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Decoded 10-byte header.
    pub header: PacketHeader,
    /// BODY, exactly `header.len` bytes.
    pub body: Bytes,
}

/// Grow `fifo` from the socket until it holds at least `want` bytes.
/// Returns `false` on EOF before that point.
pub(crate) async fn fill(
    reader: &mut (impl tokio::io::AsyncRead + Unpin),
    cancel: &CancellationToken,
    fifo: &mut BytesMut,
    want: usize,
) -> Result<bool> {
    while fifo.len() < want {
        let n = tokio::select! {
            _ = cancel.cancelled() => bail!(ClientError::Cancelled),
            res = reader.read_buf(fifo) => res.context("socket read")?,
        };
        if n == 0 {
            return Ok(false);
        }
    }
    Ok(true)
}
