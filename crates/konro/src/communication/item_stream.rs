use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

use super::request::InferenceResponse;

/// # ResponseStream
///
/// An asynchronous stream of responses for requests submitted through
/// [`InferenceRequest::new`](super::request::InferenceRequest::new).
///
/// `ResponseStream` implements the `Stream` trait from the `futures` crate,
/// allowing it to be used with stream combinators and async iteration. It
/// adapts the underlying Tokio channel receiver to the `Stream` interface.
///
/// ## Implementation Details
///
/// The stream is backed by a Tokio unbounded channel receiver, which means:
/// - It will never block on `poll_next` even if the channel is empty
/// - It will return `None` when all senders are dropped
/// - It has no backpressure mechanism (admission control happens before
///   scheduling, in the external rate limiter)
pub struct ResponseStream {
    /// The underlying channel receiver
    receiver: mpsc::UnboundedReceiver<InferenceResponse>,
}

impl ResponseStream {
    pub(crate) fn new(receiver: mpsc::UnboundedReceiver<InferenceResponse>) -> Self {
        Self { receiver }
    }

    /// Blocking receive for synchronous callers.
    ///
    /// Must not be called from an async context; use the `Stream`
    /// implementation there instead.
    pub fn blocking_recv(&mut self) -> Option<InferenceResponse> {
        self.receiver.blocking_recv()
    }
}

impl Stream for ResponseStream {
    type Item = InferenceResponse;
    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().receiver).poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures::StreamExt;

    use crate::communication::request::{InferenceRequest, Tensor};
    use crate::config::DataType;

    #[test]
    fn test_stream_yields_response_then_ends() {
        let tensor = Tensor::new("x", DataType::Uint8, vec![4], Arc::new(vec![0u8; 4]));
        let (mut request, stream) = InferenceRequest::new(vec![tensor]);
        let id = request.id();
        request.respond(Ok(vec![]));
        drop(request);

        let responses: Vec<_> = futures::executor::block_on(stream.collect::<Vec<_>>());
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].id(), id);
    }
}
