// Copyright 2024-2026 Pipeway Developers <dev@pipeway.dev>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Body plumbing: type erasure, body-to-stream adaption, and channel-fed
//! streaming bodies

use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use futures::Stream;
use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;
use hyper::body::{Body, Frame, SizeHint};
use pin_project::pin_project;
use tokio::sync::mpsc;

/// Type-erased byte-stream body used throughout the relay.
pub type RelayBody = BoxBody<Bytes, anyhow::Error>;

/// Erase a concrete body into a [`RelayBody`].
pub fn erase<B>(body: B) -> RelayBody
where
    B: Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    body.map_err(anyhow::Error::from).boxed()
}

/// View a [`Body`] as a [`Stream`] of its data frames.
///
/// Non-data frames (trailers) are skipped.
#[pin_project]
pub struct BodyStream<B>(#[pin] pub B);

impl<B> Stream for BodyStream<B>
where
    B: Body,
{
    type Item = Result<B::Data, B::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            return Poll::Ready(match ready!(this.0.as_mut().poll_frame(cx)) {
                Some(Ok(frame)) => {
                    let Ok(data) = frame.into_data() else {
                        continue;
                    };
                    Some(Ok(data))
                }
                Some(Err(err)) => Some(Err(err)),
                None => None,
            });
        }
    }
}

/// Streaming body fed from a bounded channel.
///
/// Dropping the sending half ends the body cleanly; sending an `Err` makes
/// the body fail, which hyper turns into an aborted connection. The channel
/// capacity is the write-ahead window: a full channel suspends the sender
/// until the client drains, which is how fan-out backpressure propagates.
pub fn streamed(capacity: usize) -> (mpsc::Sender<Result<Bytes, anyhow::Error>>, RelayBody) {
    let (tx, rx) = mpsc::channel(capacity);
    (tx, StreamedBody(rx).boxed())
}

/// Streaming body fed from an unbounded channel.
///
/// Used for the sender's progress lines, whose volume is bounded by the
/// receiver count rather than by payload size.
pub fn unbounded() -> (
    mpsc::UnboundedSender<Result<Bytes, anyhow::Error>>,
    RelayBody,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, UnboundedBody(rx).boxed())
}

struct StreamedBody(mpsc::Receiver<Result<Bytes, anyhow::Error>>);

impl Body for StreamedBody {
    type Data = Bytes;
    type Error = anyhow::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, anyhow::Error>>> {
        let frame = ready!(self.get_mut().0.poll_recv(cx));
        Poll::Ready(frame.map(|item| item.map(Frame::data)))
    }
}

struct UnboundedBody(mpsc::UnboundedReceiver<Result<Bytes, anyhow::Error>>);

impl Body for UnboundedBody {
    type Data = Bytes;
    type Error = anyhow::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, anyhow::Error>>> {
        let frame = ready!(self.get_mut().0.poll_recv(cx));
        Poll::Ready(frame.map(|item| item.map(Frame::data)))
    }
}

/// Couple a drop-guard to a body so the guard lives exactly as long as the
/// response stream it is attached to.
pub fn guarded<G: Send + Sync + 'static>(body: RelayBody, guard: G) -> RelayBody {
    Guarded {
        body,
        _guard: guard,
    }
    .boxed()
}

#[pin_project]
struct Guarded<G> {
    #[pin]
    body: RelayBody,
    _guard: G,
}

impl<G> Body for Guarded<G> {
    type Data = Bytes;
    type Error = anyhow::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, anyhow::Error>>> {
        self.project().body.poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.body.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.body.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use futures::StreamExt;
    use http_body_util::Full;

    #[tokio::test]
    async fn body_stream_yields_data_frames() {
        let body = erase(Full::new(Bytes::from("stream me")));
        let chunks: Vec<_> = BodyStream(body).collect().await;
        let data: Vec<u8> = chunks
            .into_iter()
            .flat_map(|c| c.unwrap().to_vec())
            .collect();
        assert_eq!(data, b"stream me");
    }

    #[tokio::test]
    async fn streamed_body_ends_when_sender_drops() {
        let (tx, body) = streamed(4);
        tx.send(Ok(Bytes::from("ab"))).await.unwrap();
        tx.send(Ok(Bytes::from("cd"))).await.unwrap();
        drop(tx);

        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(collected, Bytes::from("abcd"));
    }

    #[tokio::test]
    async fn streamed_body_surfaces_errors() {
        let (tx, body) = streamed(4);
        tx.send(Ok(Bytes::from("ok so far"))).await.unwrap();
        tx.send(Err(anyhow::anyhow!("boom"))).await.unwrap();
        drop(tx);

        assert!(body.collect().await.is_err());
    }

    #[tokio::test]
    async fn guard_drops_with_the_body() {
        struct SetOnDrop(std::sync::Arc<std::sync::atomic::AtomicBool>);
        impl Drop for SetOnDrop {
            fn drop(&mut self) {
                self.0.store(true, std::sync::atomic::Ordering::SeqCst);
            }
        }

        let dropped = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let body = guarded(
            erase(Full::new(Bytes::from("x"))),
            SetOnDrop(dropped.clone()),
        );
        assert!(!dropped.load(std::sync::atomic::Ordering::SeqCst));
        drop(body);
        assert!(dropped.load(std::sync::atomic::Ordering::SeqCst));
    }
}
