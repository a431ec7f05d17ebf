//! Streaming half of the relay: pipes upstream chunks to the caller.
//!
//! A [`RelayStream`] is opened by waiting for the first non-empty upstream
//! chunk. Until then nothing has been sent, so a read error can still become
//! a proper error response ([`RelayStream::open`] returns `Err`). Once the first
//! chunk is in hand, the outbound status and headers are committed; a later
//! read error ends the outbound body without writing anything else.
//!
//! ```text
//! open ──► Streaming ──► Completed   (upstream ended cleanly)
//!                   └──► Aborted     (upstream read failed mid-body)
//! ```

use std::{
    convert::Infallible,
    pin::Pin,
    task::{ready, Context, Poll},
};

use bytes::Bytes;
use futures_util::{future, stream, Stream, StreamExt as _};
use tracing::{debug, warn};

use crate::upstream::ByteStream;

/// Lifecycle of one relayed body. `Completed` and `Aborted` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Streaming,
    Completed,
    Aborted,
}

/// Outbound body that forwards upstream chunks verbatim and in order.
///
/// Never yields an error: a failed upstream read moves the stream to
/// [`RelayState::Aborted`] and ends it.
pub struct RelayStream {
    inner: ByteStream,
    state: RelayState,
    chunks: u64,
    bytes: u64,
}

impl RelayStream {
    /// Wait for the first non-empty chunk of `upstream`.
    ///
    /// # Errors
    /// The upstream read error, if one happens before any data arrives.
    pub async fn open(mut upstream: ByteStream) -> anyhow::Result<Self> {
        loop {
            match upstream.next().await {
                Some(Err(e)) => return Err(e),
                Some(Ok(chunk)) if chunk.is_empty() => continue,
                Some(Ok(first)) => {
                    let rest = stream::once(future::ready(Ok::<_, anyhow::Error>(first)))
                        .chain(upstream);
                    return Ok(Self::with_state(Box::pin(rest), RelayState::Streaming));
                }
                None => return Ok(Self::with_state(upstream, RelayState::Completed)),
            }
        }
    }

    fn with_state(inner: ByteStream, state: RelayState) -> Self {
        Self {
            inner,
            state,
            chunks: 0,
            bytes: 0,
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }
}

impl Stream for RelayStream {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.state != RelayState::Streaming {
            return Poll::Ready(None);
        }

        match ready!(self.inner.poll_next_unpin(cx)) {
            Some(Ok(chunk)) => {
                self.chunks += 1;
                self.bytes += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Some(Err(e)) => {
                self.state = RelayState::Aborted;
                warn!(
                    chunks = self.chunks,
                    bytes = self.bytes,
                    error = %format!("{e:#}"),
                    "upstream stream failed after output started: truncating response"
                );
                Poll::Ready(None)
            }
            None => {
                self.state = RelayState::Completed;
                debug!(chunks = self.chunks, bytes = self.bytes, "upstream stream completed");
                Poll::Ready(None)
            }
        }
    }
}
