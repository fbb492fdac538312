use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use lattice_proto::{compress_message, seal_message, ResponseFrame, ResultCode, PROTO_HEADER_SIZE};

use crate::job::JobCore;

/// Payload size that triggers a chunk flush.
pub(crate) const SCAN_CHUNK_LIMIT: usize = 1024 * 1024;

/// Byte sink for scan responses, typically a TCP stream.
pub trait ClientStream: AsyncWrite + Send + Unpin {}

impl<T: AsyncWrite + Send + Unpin> ClientStream for T {}

/// The client connection handed to the scan core by the originating
/// transaction.
///
/// Streaming jobs adopt the socket for their lifetime; background jobs reply
/// fin-OK on it at admission and detach. If admission fails after adoption,
/// the socket is restored here so the originating request path can report
/// the error itself.
pub struct ClientChannel {
    stream: Option<Box<dyn ClientStream>>,
    compress: bool,
    peer: String,
}

impl ClientChannel {
    /// Wraps a client socket. `compress` requests zlib response compression.
    pub fn new(stream: impl ClientStream + 'static, compress: bool) -> Self {
        Self { stream: Some(Box::new(stream)), compress, peer: String::new() }
    }

    /// Attaches the peer label used in job logs and monitoring.
    pub fn with_peer(mut self, peer: impl Into<String>) -> Self {
        self.peer = peer.into();
        self
    }

    /// Peer label of the originating client.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// True while the channel still holds the socket.
    pub fn has_stream(&self) -> bool {
        self.stream.is_some()
    }

    pub(crate) fn compress(&self) -> bool {
        self.compress
    }

    pub(crate) fn take_stream(&mut self) -> Option<Box<dyn ClientStream>> {
        self.stream.take()
    }

    pub(crate) fn restore(&mut self, stream: Box<dyn ClientStream>) {
        self.stream = Some(stream);
    }

    /// Sends a fin carrying `code` and drops the socket. Used to acknowledge
    /// background jobs, whose scan runs detached from the client.
    pub(crate) async fn reply_fin(&mut self, code: ResultCode, timeout: Option<Duration>) {
        let Some(mut stream) = self.stream.take() else {
            return;
        };
        let mut buf = ResponseBuffer::new();
        buf.push(&ResponseFrame::Fin { result: code });
        if let Ok(sealed) = buf.seal() {
            let _ = write_limited(stream.as_mut(), sealed, timeout).await;
        }
    }
}

/// Chunk under construction: header room followed by encoded frames.
pub(crate) struct ResponseBuffer {
    buf: BytesMut,
}

impl ResponseBuffer {
    pub(crate) fn new() -> Self {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0u8; PROTO_HEADER_SIZE]);
        Self { buf }
    }

    pub(crate) fn push(&mut self, frame: &ResponseFrame) {
        frame.encode_into(&mut self.buf);
    }

    pub(crate) fn payload_len(&self) -> usize {
        self.buf.len() - PROTO_HEADER_SIZE
    }

    pub(crate) fn has_payload(&self) -> bool {
        self.payload_len() > 0
    }

    pub(crate) fn is_full(&self) -> bool {
        self.payload_len() >= SCAN_CHUNK_LIMIT
    }

    fn reset(&mut self) {
        self.buf.clear();
        self.buf.extend_from_slice(&[0u8; PROTO_HEADER_SIZE]);
    }

    fn seal(&mut self) -> Result<&[u8], lattice_proto::CodecError> {
        seal_message(&mut self.buf)?;
        Ok(&self.buf)
    }
}

async fn write_limited(
    stream: &mut dyn ClientStream,
    bytes: &[u8],
    timeout: Option<Duration>,
) -> io::Result<()> {
    let write = async {
        stream.write_all(bytes).await?;
        stream.flush().await
    };
    match timeout {
        None => write.await,
        Some(limit) => match tokio::time::timeout(limit, write).await {
            Ok(res) => res,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "response write timed out")),
        },
    }
}

/// Socket ownership for streaming jobs.
///
/// At most one task writes at a time (the stream sits behind a mutex), and
/// after a failed write the socket is force-closed exactly once.
pub(crate) struct ClientConn {
    stream: Mutex<Option<Box<dyn ClientStream>>>,
    timeout: Option<Duration>,
    compress: bool,
    net_io: AtomicU64,
}

impl ClientConn {
    /// Adopts the socket out of `channel`. `timeout` bounds each chunk
    /// write; `None` waits forever.
    pub(crate) fn adopt(
        channel: &mut ClientChannel,
        timeout: Option<Duration>,
    ) -> Result<Self, crate::api::ScanError> {
        let stream = channel
            .take_stream()
            .ok_or(crate::api::ScanError::Parameter("scan request carries no client connection"))?;
        Ok(Self {
            stream: Mutex::new(Some(stream)),
            timeout,
            compress: channel.compress(),
            net_io: AtomicU64::new(0),
        })
    }

    /// Admission-failure rollback: hands the socket back to the channel.
    pub(crate) async fn disown(&self, channel: &mut ClientChannel) {
        if let Some(stream) = self.stream.lock().await.take() {
            channel.restore(stream);
        }
    }

    pub(crate) fn net_io_bytes(&self) -> u64 {
        self.net_io.load(Ordering::Acquire)
    }

    pub(crate) fn timeout_ms(&self) -> u64 {
        self.timeout.map(|t| t.as_millis() as u64).unwrap_or(0)
    }

    /// Seals and writes the buffered chunk. On success the buffer is reset
    /// with fresh header room. On failure the socket is released, the job
    /// abandoned (`ResponseTimeout` for deadline misses, `ResponseError`
    /// otherwise), and no further sends will go out.
    pub(crate) async fn send_buffer(&self, core: &JobCore, buf: &mut ResponseBuffer) -> bool {
        let mut guard = self.stream.lock().await;
        let Some(stream) = guard.as_mut() else {
            return false;
        };

        let compress = self.compress;
        let result = match buf.seal() {
            Err(err) => {
                drop(guard.take());
                core.abandon(ResultCode::Unknown);
                tracing::warn!(trid = core.trid(), error = %err, "failed to seal scan chunk");
                return false;
            }
            Ok(sealed) => {
                if compress {
                    match compress_message(sealed) {
                        Ok(compressed) => write_limited(stream.as_mut(), &compressed, self.timeout)
                            .await
                            .map(|()| compressed.len()),
                        Err(err) => {
                            drop(guard.take());
                            core.abandon(ResultCode::Unknown);
                            tracing::warn!(
                                trid = core.trid(),
                                error = %err,
                                "failed to compress scan chunk"
                            );
                            return false;
                        }
                    }
                } else {
                    write_limited(stream.as_mut(), sealed, self.timeout).await.map(|()| sealed.len())
                }
            }
        };

        match result {
            Ok(sent) => {
                self.net_io.fetch_add(sent as u64, Ordering::AcqRel);
                drop(guard);
                buf.reset();
                true
            }
            Err(err) => {
                drop(guard.take());
                let code = match err.kind() {
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                        ResultCode::ResponseTimeout
                    }
                    _ => ResultCode::ResponseError,
                };
                core.abandon(code);
                tracing::warn!(
                    trid = core.trid(),
                    client = core.client(),
                    error = %err,
                    "scan response write failed"
                );
                false
            }
        }
    }

    /// Sends the terminal fin carrying `code` if the socket is still live,
    /// then releases it. Errors here are ignored; the job is over.
    pub(crate) async fn send_fin(&self, code: ResultCode) {
        let mut guard = self.stream.lock().await;
        let Some(stream) = guard.as_mut() else {
            return;
        };
        let mut buf = ResponseBuffer::new();
        buf.push(&ResponseFrame::Fin { result: code });
        if let Ok(sealed) = buf.seal() {
            if write_limited(stream.as_mut(), sealed, self.timeout).await.is_ok() {
                self.net_io.fetch_add(sealed.len() as u64, Ordering::AcqRel);
            }
        }
        drop(guard.take());
    }
}
