//! Outgoing and incoming message bodies.
//!
//! Response bodies produced by engines are pumped through a bounded channel by
//! a background task bound to the call's [`CallScope`]. The task owns the
//! engine-side stream: it is dropped as soon as the scope is cancelled, and
//! readers observe the error the scope was cancelled with.

use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use futures::{Stream, StreamExt};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::scope::CallScope;

/// Boxed stream of body chunks
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Factory producing a fresh stream for every physical send
pub type StreamFactory = Arc<dyn Fn() -> ByteStream + Send + Sync>;

/// Producer writing a body into a [`BodyWriter`] for every physical send
pub type WriteProducer = Arc<dyn Fn(BodyWriter) -> BoxFuture<'static, Result<()>> + Send + Sync>;

const BODY_CHANNEL_CAPACITY: usize = 8;

/// Body of an outgoing request
///
/// Channel variants are factories rather than live streams so that the same
/// request can be sent again by a redirect or retry.
#[derive(Clone)]
pub enum OutgoingContent {
    /// No body
    NoContent,
    /// In-memory body
    ByteArray {
        bytes: Bytes,
        content_type: Option<String>,
    },
    /// Body read lazily from a stream
    ReadChannel {
        factory: StreamFactory,
        content_type: Option<String>,
        content_length: Option<u64>,
    },
    /// Body written lazily by a producer
    WriteChannel {
        producer: WriteProducer,
        content_type: Option<String>,
        content_length: Option<u64>,
    },
}

impl OutgoingContent {
    /// Create an in-memory body without a content type
    pub fn bytes(bytes: impl Into<Bytes>) -> Self {
        OutgoingContent::ByteArray {
            bytes: bytes.into(),
            content_type: None,
        }
    }

    /// Create a `text/plain` body
    pub fn text(text: impl Into<String>) -> Self {
        OutgoingContent::ByteArray {
            bytes: Bytes::from(text.into()),
            content_type: Some("text/plain; charset=utf-8".to_string()),
        }
    }

    /// Create a body read from a stream produced by `factory`
    pub fn from_stream<F>(factory: F) -> Self
    where
        F: Fn() -> ByteStream + Send + Sync + 'static,
    {
        OutgoingContent::ReadChannel {
            factory: Arc::new(factory),
            content_type: None,
            content_length: None,
        }
    }

    /// Create a body written by `producer`
    pub fn from_writer<F, Fut>(producer: F) -> Self
    where
        F: Fn(BodyWriter) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        OutgoingContent::WriteChannel {
            producer: Arc::new(move |writer| -> BoxFuture<'static, Result<()>> { Box::pin(producer(writer)) }),
            content_type: None,
            content_length: None,
        }
    }

    /// Set the content type
    pub fn with_content_type(mut self, value: impl Into<String>) -> Self {
        match &mut self {
            OutgoingContent::NoContent => {}
            OutgoingContent::ByteArray { content_type, .. }
            | OutgoingContent::ReadChannel { content_type, .. }
            | OutgoingContent::WriteChannel { content_type, .. } => *content_type = Some(value.into()),
        }
        self
    }

    /// Get the content type
    pub fn content_type(&self) -> Option<&str> {
        match self {
            OutgoingContent::NoContent => None,
            OutgoingContent::ByteArray { content_type, .. }
            | OutgoingContent::ReadChannel { content_type, .. }
            | OutgoingContent::WriteChannel { content_type, .. } => content_type.as_deref(),
        }
    }

    /// Get the content length if it is known up front
    pub fn content_length(&self) -> Option<u64> {
        match self {
            OutgoingContent::NoContent => Some(0),
            OutgoingContent::ByteArray { bytes, .. } => Some(bytes.len() as u64),
            OutgoingContent::ReadChannel { content_length, .. }
            | OutgoingContent::WriteChannel { content_length, .. } => *content_length,
        }
    }

    /// Check if this is [`OutgoingContent::NoContent`]
    pub fn is_empty(&self) -> bool {
        matches!(self, OutgoingContent::NoContent)
    }

    /// Open a fresh stream over the body
    pub fn to_stream(&self) -> ByteStream {
        match self {
            OutgoingContent::NoContent => futures::stream::empty().boxed(),
            OutgoingContent::ByteArray { bytes, .. } => futures::stream::once(futures::future::ready(Ok(bytes.clone()))).boxed(),
            OutgoingContent::ReadChannel { factory, .. } => factory(),
            OutgoingContent::WriteChannel { producer, .. } => write_channel(producer).boxed(),
        }
    }

    /// Open a fresh stream that can also be shared between threads
    ///
    /// Read channels are forwarded through a bounded channel by a task that
    /// stops as soon as the reader is dropped.
    pub fn to_shared_stream(&self) -> impl Stream<Item = Result<Bytes>> + Send + Sync + 'static {
        if let OutgoingContent::WriteChannel { producer, .. } = self {
            return write_channel(producer);
        }
        let (tx, rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
        let mut stream = self.to_stream();
        tokio::spawn(async move {
            while let Some(chunk) = stream.next().await {
                if tx.send(chunk).await.is_err() {
                    break;
                }
            }
        });
        ChannelStream { rx }
    }

    /// Read the whole body into memory
    pub async fn to_bytes(&self) -> Result<Bytes> {
        match self {
            OutgoingContent::NoContent => Ok(Bytes::new()),
            OutgoingContent::ByteArray { bytes, .. } => Ok(bytes.clone()),
            _ => collect(self.to_stream()).await,
        }
    }
}

impl Default for OutgoingContent {
    fn default() -> Self {
        OutgoingContent::NoContent
    }
}

impl fmt::Debug for OutgoingContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutgoingContent::NoContent => write!(f, "NoContent"),
            OutgoingContent::ByteArray { bytes, .. } => write!(f, "ByteArray({} bytes)", bytes.len()),
            OutgoingContent::ReadChannel { .. } => write!(f, "ReadChannel"),
            OutgoingContent::WriteChannel { .. } => write!(f, "WriteChannel"),
        }
    }
}

/// Sink handed to [`OutgoingContent::WriteChannel`] producers
pub struct BodyWriter {
    tx: mpsc::Sender<Result<Bytes>>,
}

impl BodyWriter {
    /// Write one chunk, waiting while the reader is behind
    pub async fn write(&mut self, chunk: impl Into<Bytes>) -> Result<()> {
        self.tx
            .send(Ok(chunk.into()))
            .await
            .map_err(|_| Error::cancelled("request body reader was dropped"))
    }

    /// Check whether the reading side went away
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

struct ChannelStream {
    rx: mpsc::Receiver<Result<Bytes>>,
}

fn write_channel(producer: &WriteProducer) -> ChannelStream {
    let (tx, rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
    let failures = tx.clone();
    let task = producer(BodyWriter { tx });
    tokio::spawn(async move {
        if let Err(err) = task.await {
            let _ = failures.send(Err(err)).await;
        }
    });
    ChannelStream { rx }
}

impl Stream for ChannelStream {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Body of an incoming response
pub enum ResponseBody {
    /// Fully materialized body
    Bytes(Bytes),
    /// Live body stream
    Stream(ByteStream),
}

impl ResponseBody {
    /// Create an empty body
    pub fn empty() -> Self {
        ResponseBody::Bytes(Bytes::new())
    }

    /// Wrap a stream
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes>> + Send + 'static,
    {
        ResponseBody::Stream(stream.boxed())
    }

    /// Check if the body is already in memory
    pub fn is_buffered(&self) -> bool {
        matches!(self, ResponseBody::Bytes(_))
    }

    /// Convert into a stream of chunks
    pub fn into_stream(self) -> ByteStream {
        match self {
            ResponseBody::Bytes(bytes) if bytes.is_empty() => futures::stream::empty().boxed(),
            ResponseBody::Bytes(bytes) => futures::stream::once(futures::future::ready(Ok(bytes))).boxed(),
            ResponseBody::Stream(stream) => stream,
        }
    }

    /// Read the whole body into memory
    pub async fn collect(self) -> Result<Bytes> {
        match self {
            ResponseBody::Bytes(bytes) => Ok(bytes),
            ResponseBody::Stream(stream) => collect(stream).await,
        }
    }
}

impl From<Bytes> for ResponseBody {
    fn from(bytes: Bytes) -> Self {
        ResponseBody::Bytes(bytes)
    }
}

impl From<&'static str> for ResponseBody {
    fn from(text: &'static str) -> Self {
        ResponseBody::Bytes(Bytes::from_static(text.as_bytes()))
    }
}

impl From<String> for ResponseBody {
    fn from(text: String) -> Self {
        ResponseBody::Bytes(Bytes::from(text))
    }
}

impl From<Vec<u8>> for ResponseBody {
    fn from(bytes: Vec<u8>) -> Self {
        ResponseBody::Bytes(Bytes::from(bytes))
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseBody::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
            ResponseBody::Stream(_) => write!(f, "Stream"),
        }
    }
}

/// Collect all chunks of a stream into one buffer
pub async fn collect(mut stream: ByteStream) -> Result<Bytes> {
    let mut buffer = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        buffer.extend_from_slice(&chunk?);
    }
    Ok(buffer.freeze())
}

/// Process every chunk of a stream with a callback
pub async fn for_each_chunk<F>(mut stream: ByteStream, mut callback: F) -> Result<()>
where
    F: FnMut(&[u8]) -> Result<()>,
{
    while let Some(chunk) = stream.next().await {
        callback(&chunk?)?;
    }
    Ok(())
}

/// Write every chunk of a stream to `writer`, returning the number of bytes written
pub async fn write_to<W>(mut stream: ByteStream, writer: &mut W) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut total_written = 0u64;
    while let Some(chunk) = stream.next().await {
        let bytes = chunk?;
        writer.write_all(&bytes).await?;
        total_written += bytes.len() as u64;
    }
    writer.flush().await?;
    Ok(total_written)
}

/// Bind an engine stream to `scope`
///
/// A background task forwards chunks until the source ends or the scope is
/// cancelled, and drops the source in both cases. Once the scope is
/// cancelled the returned stream yields the scope's error and ends.
pub fn pump(source: ByteStream, scope: CallScope) -> ByteStream {
    let (tx, rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
    let eof = Arc::new(AtomicBool::new(false));

    let task_scope = scope.clone();
    let task_eof = eof.clone();
    tokio::spawn(async move {
        let mut source = source;
        loop {
            let next = tokio::select! {
                biased;
                _ = task_scope.cancelled() => break,
                _ = tx.closed() => break,
                next = source.next() => next,
            };
            match next {
                Some(item) => {
                    let failed = item.is_err();
                    let delivered = tokio::select! {
                        biased;
                        _ = task_scope.cancelled() => false,
                        sent = tx.send(item) => sent.is_ok(),
                    };
                    if !delivered || failed {
                        break;
                    }
                }
                None => {
                    task_eof.store(true, Ordering::Release);
                    break;
                }
            }
        }
        drop(source);
        tracing::trace!(eof = task_eof.load(Ordering::Acquire), "body pump finished");
    });

    ScopedBody {
        rx,
        scope,
        eof,
        done: false,
    }
    .boxed()
}

struct ScopedBody {
    rx: mpsc::Receiver<Result<Bytes>>,
    scope: CallScope,
    eof: Arc<AtomicBool>,
    done: bool,
}

impl Stream for ScopedBody {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(Err(err))) => {
                self.done = true;
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(Some(chunk)) => Poll::Ready(Some(chunk)),
            Poll::Ready(None) => {
                self.done = true;
                if self.eof.load(Ordering::Acquire) {
                    Poll::Ready(None)
                } else if self.scope.is_cancelled() {
                    Poll::Ready(Some(Err(self.scope.error())))
                } else {
                    Poll::Ready(Some(Err(Error::cancelled("response body ended unexpectedly"))))
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::CancelCause;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn slow_stream(chunks: usize, delay: Duration, dropped: Arc<AtomicUsize>) -> ByteStream {
        let guard = DropCounter(dropped);
        futures::stream::unfold((0, guard), move |(sent, guard)| async move {
            if sent == chunks {
                return None;
            }
            tokio::time::sleep(delay).await;
            Some((Ok(Bytes::from(format!("chunk{};", sent))), (sent + 1, guard)))
        })
        .boxed()
    }

    #[tokio::test]
    async fn test_outgoing_content_is_replayable() {
        let content = OutgoingContent::from_stream(|| {
            futures::stream::iter(vec![Ok(Bytes::from("a")), Ok(Bytes::from("b"))]).boxed()
        });

        assert_eq!(content.to_bytes().await.unwrap(), Bytes::from("ab"));
        assert_eq!(content.clone().to_bytes().await.unwrap(), Bytes::from("ab"));
        assert_eq!(content.content_length(), None);
    }

    #[tokio::test]
    async fn test_write_channel() {
        let content = OutgoingContent::from_writer(|mut writer| async move {
            writer.write("hello ").await?;
            writer.write("world").await?;
            Ok(())
        })
        .with_content_type("text/plain");

        assert_eq!(content.content_type(), Some("text/plain"));
        assert_eq!(content.to_bytes().await.unwrap(), Bytes::from("hello world"));
    }

    #[tokio::test]
    async fn test_shared_stream_forwards_every_chunk() {
        fn shareable<S: Stream + Send + Sync + 'static>(stream: S) -> S {
            stream
        }

        let dropped = Arc::new(AtomicUsize::new(0));
        let content = OutgoingContent::from_stream(move || slow_stream(3, Duration::from_millis(5), dropped.clone()));

        let stream = shareable(content.to_shared_stream());
        assert_eq!(collect(stream.boxed()).await.unwrap(), Bytes::from("chunk0;chunk1;chunk2;"));

        let writer = OutgoingContent::from_writer(|mut writer| async move { writer.write("written").await });
        assert_eq!(collect(writer.to_shared_stream().boxed()).await.unwrap(), Bytes::from("written"));
    }

    #[tokio::test]
    async fn test_write_channel_error_reaches_reader() {
        let content = OutgoingContent::from_writer(|mut writer| async move {
            writer.write("partial").await?;
            Err(Error::custom("producer failed"))
        });

        let err = content.to_bytes().await.unwrap_err();
        assert_eq!(err.to_string(), "producer failed");
    }

    #[tokio::test]
    async fn test_pump_forwards_whole_body() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let scope = CallScope::root();
        let body = pump(slow_stream(3, Duration::from_millis(1), dropped.clone()), scope);

        let bytes = collect(body).await.unwrap();
        assert_eq!(bytes, Bytes::from("chunk0;chunk1;chunk2;"));
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pump_releases_source_on_cancel() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let scope = CallScope::root();
        let mut body = pump(
            slow_stream(100, Duration::from_millis(20), dropped.clone()),
            scope.clone(),
        );

        assert!(body.next().await.unwrap().is_ok());
        scope.cancel(CancelCause::RequestTimeout {
            url: "http://localhost/".into(),
            timeout: Duration::from_millis(20),
        });

        let mut last = None;
        while let Some(item) = body.next().await {
            last = Some(item);
        }
        assert!(matches!(last, Some(Err(Error::RequestTimeout { .. }))));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_write_to_counts_bytes() {
        let body = ResponseBody::from("some bytes");
        let mut sink = Vec::new();
        let written = write_to(body.into_stream(), &mut sink).await.unwrap();

        assert_eq!(written, 10);
        assert_eq!(sink, b"some bytes");
    }
}
