//! Streaming completion contract.
//!
//! A completion stream is a finite, non-restartable sequence of text chunks
//! terminated by the final [`CompletionResult`]. Chunks arrive in generation
//! order and their concatenation equals the final content.

use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::{Error, Result};
use crate::llm::types::CompletionResult;

/// One element of a completion stream.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A text chunk in generation order.
    Chunk(String),
    /// Terminal event carrying the completed result.
    Done(Box<CompletionResult>),
}

/// Channel capacity for completion streams.
///
/// A single chunk in flight keeps the cancellation contract: after
/// cancellation the consumer observes at most the one already-buffered
/// chunk before the stream terminates.
pub const STREAM_BUFFER: usize = 1;

/// Sender half handed to the producing task.
pub type StreamSender = mpsc::Sender<Result<StreamEvent>>;

/// Consumer-side completion stream.
///
/// The sequence is finite: zero or more `Chunk`s, then either one `Done`
/// or one error, after which the stream is exhausted.
pub struct CompletionStream {
    inner: ReceiverStream<Result<StreamEvent>>,
}

impl CompletionStream {
    /// Create a stream and its producer handle.
    pub fn channel() -> (StreamSender, Self) {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        (
            tx,
            Self {
                inner: ReceiverStream::new(rx),
            },
        )
    }

    /// Drain the stream, returning the final result.
    ///
    /// Verifies nothing beyond the protocol: chunks are discarded after
    /// concatenation and the terminal result is returned as-is. Ending
    /// without a terminal event is a protocol violation.
    pub async fn collect(mut self) -> Result<CompletionResult> {
        use futures::StreamExt;

        let mut buffer = String::new();
        while let Some(event) = self.inner.next().await {
            match event? {
                StreamEvent::Chunk(chunk) => buffer.push_str(&chunk),
                StreamEvent::Done(result) => return Ok(*result),
            }
        }
        Err(Error::Internal(
            "completion stream ended without a terminal result".to_string(),
        ))
    }
}

impl Stream for CompletionStream {
    type Item = Result<StreamEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
