//! In-memory duplex stream buffer
//!
//! The application side reads from the inbound buffer and appends to the
//! outbound buffer; the protocol side pushes received bytes inbound and
//! drains outbound bytes one packet at a time. Both buffers have their own
//! lock so readers and writers never contend.

use super::TunnelError;
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};
use tokio::sync::Notify;

#[derive(Default)]
struct Inbound {
    chunks: VecDeque<Bytes>,
    readers: Vec<Waker>,
}

impl Inbound {
    /// Copy buffered data into `buf`
    fn read(&mut self, buf: &mut [u8]) -> usize {
        let mut total = 0;

        while total < buf.len() {
            if let Some(data) = self.chunks.front_mut() {
                let to_copy = std::cmp::min(data.len(), buf.len() - total);
                buf[total..total + to_copy].copy_from_slice(&data[..to_copy]);
                total += to_copy;

                if to_copy == data.len() {
                    self.chunks.pop_front();
                } else {
                    *data = data.slice(to_copy..);
                }
            } else {
                break;
            }
        }

        total
    }

    fn wake_readers(&mut self) {
        for waker in self.readers.drain(..) {
            waker.wake();
        }
    }
}

/// Duplex byte buffer between a stream API and a packet engine
#[derive(Default)]
pub struct StreamPipe {
    inbound: Mutex<Inbound>,
    outbound: Mutex<BytesMut>,
    closed: AtomicBool,
    outbound_ready: Notify,
    closed_notify: Notify,
}

impl StreamPipe {
    /// Create an open, empty pipe
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if the pipe has been closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Poll for inbound data.
    ///
    /// Ready with a non-zero count once data is buffered, or with zero once
    /// the pipe is closed (end of stream). An empty `buf` is ready at once.
    pub fn poll_read(&self, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<usize> {
        if buf.is_empty() {
            return Poll::Ready(0);
        }

        let mut inbound = lock(&self.inbound);

        // Closing discards whatever was still buffered
        if self.is_closed() {
            return Poll::Ready(0);
        }

        let n = inbound.read(buf);
        if n > 0 {
            return Poll::Ready(n);
        }

        if !inbound.readers.iter().any(|w| w.will_wake(cx.waker())) {
            inbound.readers.push(cx.waker().clone());
        }
        Poll::Pending
    }

    /// Read inbound data, suspending until some arrives or the pipe closes
    ///
    /// Returns `0` only at end of stream.
    pub async fn read(&self, buf: &mut [u8]) -> usize {
        std::future::poll_fn(|cx| self.poll_read(cx, buf)).await
    }

    /// Append `data` to the outbound buffer without waiting
    pub fn write(&self, data: &[u8]) -> Result<usize, TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::StreamClosed);
        }

        lock(&self.outbound).extend_from_slice(data);
        self.outbound_ready.notify_one();
        Ok(data.len())
    }

    /// Append received bytes to the inbound buffer and wake readers
    pub fn push_inbound(&self, data: Bytes) -> Result<(), TunnelError> {
        let mut inbound = lock(&self.inbound);
        if self.is_closed() {
            return Err(TunnelError::StreamClosed);
        }

        if !data.is_empty() {
            inbound.chunks.push_back(data);
            inbound.wake_readers();
        }
        Ok(())
    }

    /// Take up to `max` pending outbound bytes without waiting
    ///
    /// An empty result means nothing is pending; a closed pipe is an error.
    pub fn drain_outbound(&self, max: usize) -> Result<Bytes, TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::StreamClosed);
        }

        let mut outbound = lock(&self.outbound);
        let n = std::cmp::min(max, outbound.len());
        Ok(outbound.split_to(n).freeze())
    }

    /// Check if outbound bytes are pending
    pub fn has_outbound(&self) -> bool {
        !lock(&self.outbound).is_empty()
    }

    /// Bytes buffered for the application to read
    pub fn inbound_len(&self) -> usize {
        lock(&self.inbound).chunks.iter().map(Bytes::len).sum()
    }

    /// Suspend until outbound bytes are pending or the pipe closes
    pub async fn wait_outbound(&self) {
        loop {
            if self.is_closed() || self.has_outbound() {
                return;
            }
            self.outbound_ready.notified().await;
        }
    }

    /// Suspend until the pipe is closed
    pub async fn closed(&self) {
        let notified = self.closed_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.is_closed() {
            return;
        }
        notified.await;
    }

    /// Close the pipe, discarding buffered data and waking every waiter
    ///
    /// Only the first call succeeds; later calls report `AlreadyClosed`.
    pub fn close(&self) -> Result<(), TunnelError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(TunnelError::AlreadyClosed);
        }

        {
            let mut inbound = lock(&self.inbound);
            inbound.chunks.clear();
            inbound.wake_readers();
        }
        lock(&self.outbound).clear();

        self.outbound_ready.notify_one();
        self.closed_notify.notify_waiters();
        Ok(())
    }
}

/// Lock a buffer, recovering it if a holder panicked
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
