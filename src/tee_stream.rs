//! Tee Stream Module
//!
//! Stream wrapper that passes origin body frames through to the client while
//! offering a copy of the body to the cache persistence task. Frames are
//! regrouped into `chunk_size` chunks before they are queued, so the queue
//! holds at most `queue_capacity * chunk_size` bytes whatever frame sizes the
//! origin produces. The client side never waits on storage except for one
//! bounded `retry_wait` when the chunk queue is full; if the queue is still
//! full after that the cache attempt is abandoned and the stream carries on
//! without it.
//!
//! When the stream ends the number of bytes handed to the client is reported
//! on the completion channel. An origin error, abandonment, or dropping the
//! stream early (client went away) report a failure instead, so the
//! persistence task aborts the blob.

use bytes::{Bytes, BytesMut};
use futures::Stream;
use hyper::body::Frame;
use std::collections::VecDeque;
use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Sleep;
use tracing::{debug, warn};

/// Final report from the client side of the tee: bytes forwarded, or why the
/// copy must not be committed
pub type Completion = std::result::Result<u64, String>;

/// A stream that tees data to a channel while passing it through
pub struct TeeStream<S> {
    inner: S,
    sender: Option<mpsc::Sender<Bytes>>,
    completion: Option<oneshot::Sender<Completion>>,
    chunk_size: usize,
    retry_wait: Duration,
    /// Bytes not yet making up a whole chunk
    buffer: BytesMut,
    /// Chunk waiting for queue space, with the single retry deadline
    pending: Option<(Bytes, Pin<Box<Sleep>>)>,
    bytes_forwarded: u64,
    /// Declared body length; the copy is complete once this many bytes passed
    expected_len: Option<u64>,
}

impl<S, E> TeeStream<S>
where
    S: Stream<Item = Result<Frame<Bytes>, E>> + Unpin,
    E: Display,
{
    /// Create a tee feeding `sender` with `chunk_size` chunks and reporting
    /// on `completion`
    pub fn new(
        inner: S,
        sender: mpsc::Sender<Bytes>,
        completion: oneshot::Sender<Completion>,
        chunk_size: usize,
        retry_wait: Duration,
    ) -> Self {
        Self {
            inner,
            sender: Some(sender),
            completion: Some(completion),
            chunk_size: chunk_size.max(1),
            retry_wait,
            buffer: BytesMut::new(),
            pending: None,
            bytes_forwarded: 0,
            expected_len: None,
        }
    }

    /// A tee with no cache side; frames are passed through untouched
    pub fn passthrough(inner: S) -> Self {
        Self {
            inner,
            sender: None,
            completion: None,
            chunk_size: 1,
            retry_wait: Duration::ZERO,
            buffer: BytesMut::new(),
            pending: None,
            bytes_forwarded: 0,
            expected_len: None,
        }
    }

    /// Treat the body as complete once `len` bytes were forwarded
    ///
    /// hyper stops polling a body as soon as its `content-length` has been
    /// written, so the end of the inner stream is never observed.
    pub fn with_expected_len(mut self, len: Option<u64>) -> Self {
        self.expected_len = len;
        if len == Some(0) {
            self.finish_caching();
        }
        self
    }

    /// Data bytes handed to the client so far
    pub fn bytes_forwarded(&self) -> u64 {
        self.bytes_forwarded
    }

    /// Whether chunks are still being offered to the cache
    pub fn is_caching(&self) -> bool {
        self.sender.is_some()
    }

    fn stop_caching(&mut self, reason: String) {
        self.sender = None;
        self.pending = None;
        self.buffer.clear();
        if let Some(completion) = self.completion.take() {
            debug!("Cache copy stopped: {}", reason);
            let _ = completion.send(Err(reason));
        }
    }

    /// Hand the rest of the copy to the queue and report the total
    fn finish_caching(&mut self) {
        let sender = self.sender.take();
        let Some(completion) = self.completion.take() else {
            self.pending = None;
            self.buffer.clear();
            return;
        };
        let forwarded = self.bytes_forwarded;

        let mut tail = VecDeque::new();
        if let Some((chunk, _)) = self.pending.take() {
            tail.push_back(chunk);
        }
        while !self.buffer.is_empty() {
            let len = self.chunk_size.min(self.buffer.len());
            tail.push_back(self.buffer.split_to(len).freeze());
        }

        let Some(sender) = sender else {
            let _ = completion.send(Ok(forwarded));
            return;
        };

        while let Some(chunk) = tail.pop_front() {
            match sender.try_send(chunk) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(chunk)) => {
                    tail.push_front(chunk);
                    break;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    let _ = completion.send(Err("cache writer closed the queue".to_string()));
                    return;
                }
            }
        }
        if tail.is_empty() {
            let _ = completion.send(Ok(forwarded));
            return;
        }

        // The stream may not be polled again, so the remaining single waits
        // move to a task
        let retry_wait = self.retry_wait;
        tokio::spawn(async move {
            let mut report = Ok(forwarded);
            for chunk in tail {
                match sender.send_timeout(chunk, retry_wait).await {
                    Ok(()) => {}
                    Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                        warn!("Cache queue still full after {:?}", retry_wait);
                        report = Err("cache write too slow".to_string());
                        break;
                    }
                    Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                        report = Err("cache writer closed the queue".to_string());
                        break;
                    }
                }
            }
            let _ = completion.send(report);
        });
    }

    fn offer(&mut self, chunk: Bytes) {
        let Some(sender) = self.sender.as_ref() else {
            return;
        };
        match sender.try_send(chunk) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(chunk)) => {
                debug!("Cache queue full, waiting {:?} once", self.retry_wait);
                self.pending = Some((chunk, Box::pin(tokio::time::sleep(self.retry_wait))));
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.stop_caching("cache writer closed the queue".to_string());
            }
        }
    }

    /// Offer every whole chunk in the buffer until one has to wait
    fn offer_full_chunks(&mut self) {
        while self.pending.is_none() && self.buffer.len() >= self.chunk_size {
            if self.sender.is_none() {
                self.buffer.clear();
                return;
            }
            let chunk = self.buffer.split_to(self.chunk_size).freeze();
            self.offer(chunk);
        }
    }

    /// Drive a chunk parked on a full queue to its outcome
    fn poll_pending(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        let Some((_, sleep)) = self.pending.as_mut() else {
            return Poll::Ready(());
        };
        if sleep.as_mut().poll(cx).is_pending() {
            return Poll::Pending;
        }
        let Some((chunk, _)) = self.pending.take() else {
            return Poll::Ready(());
        };
        let Some(sender) = self.sender.as_ref() else {
            return Poll::Ready(());
        };
        match sender.try_send(chunk) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Cache queue still full after {:?}", self.retry_wait);
                self.stop_caching("cache write too slow".to_string());
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.stop_caching("cache writer closed the queue".to_string());
            }
        }
        Poll::Ready(())
    }

    /// Queue buffered chunks, waiting out at most one retry per chunk
    fn poll_queue(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        loop {
            if self.poll_pending(cx).is_pending() {
                return Poll::Pending;
            }
            self.offer_full_chunks();
            if self.pending.is_none() {
                return Poll::Ready(());
            }
        }
    }
}

impl<S, E> Stream for TeeStream<S>
where
    S: Stream<Item = Result<Frame<Bytes>, E>> + Unpin,
    E: Display,
{
    type Item = Result<Frame<Bytes>, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        // Keep chunks in client order: earlier chunks go first
        if this.poll_queue(cx).is_pending() {
            return Poll::Pending;
        }

        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(frame))) => match frame.into_data() {
                Ok(data) => {
                    this.bytes_forwarded += data.len() as u64;
                    if this.sender.is_some() && !data.is_empty() {
                        this.buffer.extend_from_slice(&data);
                        this.offer_full_chunks();
                    }
                    if this.expected_len == Some(this.bytes_forwarded) {
                        this.finish_caching();
                    }
                    Poll::Ready(Some(Ok(Frame::data(data))))
                }
                // Non-data frame (trailers), pass through
                Err(frame) => Poll::Ready(Some(Ok(frame))),
            },
            Poll::Ready(Some(Err(e))) => {
                this.stop_caching(format!("origin stream failed: {}", e));
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finish_caching();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<S> Drop for TeeStream<S> {
    fn drop(&mut self) {
        self.sender = None;
        if let Some(completion) = self.completion.take() {
            let _ = completion.send(Err(
                "response dropped before the origin body ended".to_string(),
            ));
        }
    }
}
