// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Nonce-indexed table matching responses to awaiting requests.
//!
//! The table is a fixed power-of-two ring of reply slots. `head` is the
//! next nonce to hand out, `tail` the oldest outstanding one; the
//! outstanding nonces always form the contiguous range `[tail, head)`
//! modulo 2^32, which bounds in-flight requests to the ring capacity
//! and lets a response be validated with one wrapping subtraction.
//!
//! Registrants own their end of a oneshot channel and are notified
//! exactly once, either with the matched response or by dropping the
//! reply guard (cancellation). The guard deregisters on every exit
//! path, so a slot can never leak.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Notify, oneshot};
use tokio_util::sync::CancellationToken;

use crate::client::{ClientError, common::RawFrame};

/// In-flight bound of the production table.
pub const RPC_TABLE_CAPACITY: usize = 65_536;

struct Ring {
    slots: Box<[Option<oneshot::Sender<RawFrame>>]>,
    head: u32,
    tail: u32,
}

struct Inner {
    ring: Mutex<Ring>,
    /// Signalled once per slot reclaimed, releasing one parked
    /// registrant each.
    vacancy: Notify,
    capacity: u32,
    mask: u32,
}

impl Inner {
    fn ring(&self) -> MutexGuard<'_, Ring> {
        self.ring.lock().expect("rpc ring lock poisoned")
    }

    /// Advance `tail` over the contiguous null prefix, waking one parked
    /// registrant per reclaimed slot.
    fn advance_tail(&self, ring: &mut Ring) {
        while ring.tail != ring.head && ring.slots[(ring.tail & self.mask) as usize].is_none()
        {
            ring.tail = ring.tail.wrapping_add(1);
            self.vacancy.notify_one();
        }
    }

    fn deregister(&self, nonce: u32) {
        let mut ring = self.ring();
        // Already reclaimed (the response won the race, or the nonce
        // aged out of the window).
        if nonce.wrapping_sub(ring.tail) >= self.capacity {
            return;
        }
        ring.slots[(nonce & self.mask) as usize] = None;
        self.advance_tail(&mut ring);
    }
}

pub struct RpcTable {
    inner: Arc<Inner>,
}

impl Default for RpcTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcTable {
    pub fn new() -> Self {
        Self::with_capacity(RPC_TABLE_CAPACITY)
    }

    /// `capacity` must be a power of two so nonce indexing reduces to a
    /// mask.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "rpc table capacity must be a power of two");
        assert!(capacity <= u32::MAX as usize / 2);

        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            inner: Arc::new(Inner {
                ring: Mutex::new(Ring {
                    slots: slots.into_boxed_slice(),
                    head: 0,
                    tail: 0,
                }),
                vacancy: Notify::new(),
                capacity: capacity as u32,
                mask: capacity as u32 - 1,
            }),
        }
    }

    /// Allocate the next nonce and install a reply slot for it.
    ///
    /// Parks while the table is full; wakes when a slot is reclaimed or
    /// `cancel` fires. The returned guard deregisters the slot when
    /// dropped, on every exit path.
    pub async fn register(
        &self,
        cancel: &CancellationToken,
    ) -> Result<PendingReply, ClientError> {
        loop {
            let vacancy = self.inner.vacancy.notified();
            {
                let mut ring = self.inner.ring();
                if ring.head.wrapping_sub(ring.tail) < self.inner.capacity {
                    let nonce = ring.head;
                    let (tx, rx) = oneshot::channel();
                    ring.slots[(nonce & self.inner.mask) as usize] = Some(tx);
                    ring.head = ring.head.wrapping_add(1);
                    return Ok(PendingReply {
                        table: Arc::clone(&self.inner),
                        nonce,
                        rx: Some(rx),
                    });
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                _ = vacancy => {},
            }
        }
    }

    /// Route a response frame to its registrant.
    ///
    /// Returns `false` without touching any state when the nonce lies
    /// outside the outstanding window (stale or forged) or its slot has
    /// already been vacated by cancellation. Read loops treat a `false`
    /// here as fatal for the connection.
    pub fn push(&self, frame: RawFrame) -> bool {
        let nonce = frame.header.nonce;
        let waiter = {
            let mut ring = self.inner.ring();
            if nonce.wrapping_sub(ring.tail) >= self.inner.capacity {
                return false;
            }
            let Some(waiter) = ring.slots[(nonce & self.inner.mask) as usize].take()
            else {
                return false;
            };
            self.inner.advance_tail(&mut ring);
            waiter
        };
        // The registrant may have dropped its guard in the meantime;
        // the frame is dropped with the channel in that case.
        let _ = waiter.send(frame);
        true
    }

    /// Outstanding registrations, `head - tail` modulo 2^32.
    pub fn in_flight(&self) -> usize {
        let ring = self.inner.ring();
        ring.head.wrapping_sub(ring.tail) as usize
    }

    #[cfg(test)]
    fn positions(&self) -> (u32, u32) {
        let ring = self.inner.ring();
        (ring.tail, ring.head)
    }
}

/// A registered request awaiting its response.
///
/// Dropping the guard (including after a successful receive) clears the
/// slot and advances `tail` over any null prefix.
pub struct PendingReply {
    table: Arc<Inner>,
    nonce: u32,
    rx: Option<oneshot::Receiver<RawFrame>>,
}

impl PendingReply {
    pub fn nonce(&self) -> u32 {
        self.nonce
    }

    /// Park until the matching response arrives or `cancel` fires.
    pub async fn recv(mut self, cancel: &CancellationToken) -> Result<RawFrame, ClientError> {
        let rx = self.rx.take().expect("reply receiver consumed twice");
        tokio::select! {
            _ = cancel.cancelled() => Err(ClientError::Cancelled),
            res = rx => res.map_err(|_| ClientError::Closed),
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.table.deregister(self.nonce);
    }
}
