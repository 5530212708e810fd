//! HTTP response bodies.
//!
//! `PacedBody` adapts a `PacedSource` to `http_body::Body` so hyper can
//! stream it. Cancelling the body's token (or dropping the body) releases
//! any poll that is waiting on a chunk.

use crate::cancel::CancelToken;
use crate::stream::PacedSource;
use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tracing::debug;

/// Chunk size requested from the source on every poll
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Body type returned by every route
pub type ResponseBody = UnsyncBoxBody<Bytes, Infallible>;

pub fn full<T: Into<Bytes>>(chunk: T) -> ResponseBody {
    Full::new(chunk.into()).boxed_unsync()
}

type ChunkFuture = Pin<Box<dyn Future<Output = (PacedSource, Option<Bytes>)> + Send>>;

/// Streams a `PacedSource` as an HTTP body
pub struct PacedBody {
    /// Present while no chunk is being produced
    source: Option<PacedSource>,
    /// The chunk currently being produced
    pending: Option<ChunkFuture>,
    cancel: CancelToken,
    chunk_size: usize,
    done: bool,
}

impl PacedBody {
    pub fn new(source: PacedSource) -> Self {
        Self::with_chunk_size(source, CHUNK_SIZE)
    }

    pub fn with_chunk_size(source: PacedSource, chunk_size: usize) -> Self {
        let cancel = source.token().clone();
        PacedBody {
            source: Some(source),
            pending: None,
            cancel,
            chunk_size,
            done: false,
        }
    }

    pub fn into_response_body(self) -> ResponseBody {
        BodyExt::boxed_unsync(self)
    }

    fn produce(&self, mut source: PacedSource) -> ChunkFuture {
        let cancel = self.cancel.clone();
        let chunk_size = self.chunk_size;

        Box::pin(async move {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                chunk = source.next_chunk(chunk_size) => chunk,
            };
            (source, chunk)
        })
    }
}

impl Body for PacedBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();

        loop {
            if this.done {
                return Poll::Ready(None);
            }

            if let Some(pending) = this.pending.as_mut() {
                let (source, chunk) = ready!(pending.as_mut().poll(cx));
                this.pending = None;

                return match chunk {
                    Some(data) => {
                        if source.is_finished() {
                            this.done = true;
                        } else {
                            this.source = Some(source);
                        }
                        Poll::Ready(Some(Ok(Frame::data(data))))
                    }
                    None => {
                        debug!(transferred = source.transferred(), "Response body ended");
                        this.done = true;
                        Poll::Ready(None)
                    }
                };
            }

            match this.source.take() {
                Some(source) => this.pending = Some(this.produce(source)),
                None => {
                    this.done = true;
                    return Poll::Ready(None);
                }
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.done
    }

    fn size_hint(&self) -> SizeHint {
        // Left open so hyper uses chunked encoding; the stream may end early
        SizeHint::default()
    }
}

impl Drop for PacedBody {
    fn drop(&mut self) {
        if !self.done && self.cancel.cancel() {
            debug!("Response body dropped before completion");
        }
    }
}
