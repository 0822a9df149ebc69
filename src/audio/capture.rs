//! # Capture Relay
//!
//! Host audio → browser. Reads the capture process output and forwards every
//! chunk, in order and unmodified, as one binary frame.
//!
//! ## Delivery Rules:
//! - One successful read becomes exactly one frame (no coalescing, no splitting
//!   beyond the read size)
//! - A chunk the transport cannot take right now is dropped, never queued here
//! - End of output is a normal end; a read error ends the relay with
//!   `ProcessStreamError`

use crate::audio::format::PcmFormat;
use crate::audio::process::PcmReader;
use crate::audio::session::{SessionId, SessionStats};
use crate::audio::transport::FrameSink;
use crate::audio::RelaySummary;
use crate::error::BridgeError;
use bytes::Bytes;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Chunks logged individually at the start of a stream.
const LOGGED_LEADING_CHUNKS: u64 = 5;

/// After the leading chunks, log one in this many.
const LOG_EVERY: u64 = 100;

pub struct CaptureRelay {
    session: SessionId,
    source: PcmReader,
    sink: Arc<dyn FrameSink>,
    read_chunk_bytes: usize,
    stats: Arc<SessionStats>,
    cancel: CancellationToken,
}

impl CaptureRelay {
    pub fn new(
        session: SessionId,
        source: PcmReader,
        sink: Arc<dyn FrameSink>,
        read_chunk_bytes: usize,
        stats: Arc<SessionStats>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session,
            source,
            sink,
            read_chunk_bytes: read_chunk_bytes.max(1),
            stats,
            cancel,
        }
    }

    /// Pump chunks until the output ends, fails, or the session closes.
    pub async fn run(mut self) -> Result<RelaySummary, BridgeError> {
        let mut summary = RelaySummary::default();
        let mut reads: u64 = 0;
        let mut buf = vec![0u8; self.read_chunk_bytes];

        loop {
            let read = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!(session = %self.session, "Capture relay stopped by session teardown");
                    return Ok(summary);
                }
                read = self.source.read(&mut buf) => read,
            };

            let n = match read {
                Ok(0) => {
                    info!(
                        session = %self.session,
                        chunks = summary.messages,
                        bytes = summary.bytes,
                        dropped = summary.dropped,
                        "Capture stream ended"
                    );
                    return Ok(summary);
                }
                Ok(n) => n,
                Err(err) => {
                    warn!(session = %self.session, error = %err, "Capture stream read failed");
                    return Err(BridgeError::ProcessStreamError(err));
                }
            };

            reads += 1;
            if reads <= LOGGED_LEADING_CHUNKS || reads % LOG_EVERY == 0 {
                debug!(
                    session = %self.session,
                    chunk = reads,
                    bytes = n,
                    audio_ms = PcmFormat::BRIDGE.duration_of(n).as_millis() as u64,
                    "Capture chunk"
                );
            }

            let chunk = Bytes::copy_from_slice(&buf[..n]);
            match self.forward(chunk) {
                Ok(()) => {
                    summary.messages += 1;
                    summary.bytes += n as u64;
                    self.stats.record_forwarded(n);
                }
                Err(err) => {
                    summary.dropped += 1;
                    self.stats.record_dropped();
                    if summary.dropped == 1 || summary.dropped % LOG_EVERY == 0 {
                        warn!(
                            session = %self.session,
                            dropped = summary.dropped,
                            error = %err,
                            "Dropping capture chunk"
                        );
                    }
                }
            }
        }
    }

    fn forward(&self, chunk: Bytes) -> Result<(), BridgeError> {
        if !self.sink.is_ready() {
            return Err(BridgeError::TransportNotReady("connection not open"));
        }
        self.sink.send_frame(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::testing::RecordingSink;
    use futures_util::stream;
    use std::io;
    use tokio_util::io::StreamReader;

    fn reader_of(chunks: Vec<io::Result<Bytes>>) -> PcmReader {
        Box::new(StreamReader::new(stream::iter(chunks)))
    }

    fn relay(source: PcmReader, sink: Arc<RecordingSink>) -> CaptureRelay {
        CaptureRelay::new(
            SessionId::new(),
            source,
            sink,
            4096,
            Arc::new(SessionStats::default()),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_chunks_forwarded_in_order_one_frame_each() {
        let sink = Arc::new(RecordingSink::new());
        let source = reader_of(vec![
            Ok(Bytes::from(vec![1u8; 512])),
            Ok(Bytes::from(vec![2u8; 1024])),
            Ok(Bytes::from(vec![3u8; 200])),
        ]);

        let summary = relay(source, sink.clone()).run().await.unwrap();

        let frames = sink.frames();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0], Bytes::from(vec![1u8; 512]));
        assert_eq!(frames[1], Bytes::from(vec![2u8; 1024]));
        assert_eq!(frames[2], Bytes::from(vec![3u8; 200]));
        assert_eq!(summary.messages, 3);
        assert_eq!(summary.bytes, 1736);
        assert_eq!(summary.dropped, 0);
    }

    #[tokio::test]
    async fn test_chunks_dropped_while_transport_not_ready() {
        let sink = Arc::new(RecordingSink::new());
        sink.set_ready(false);
        let source = reader_of(vec![Ok(Bytes::from_static(b"abcd")), Ok(Bytes::from_static(b"efgh"))]);

        let summary = relay(source, sink.clone()).run().await.unwrap();

        assert!(sink.frames().is_empty());
        assert_eq!(summary.dropped, 2);
        assert_eq!(summary.messages, 0);
        assert_eq!(summary.bytes, 0);
    }

    #[tokio::test]
    async fn test_read_error_ends_relay() {
        let sink = Arc::new(RecordingSink::new());
        let source = reader_of(vec![
            Ok(Bytes::from_static(b"pcm")),
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed")),
            Ok(Bytes::from_static(b"never read")),
        ]);

        let err = relay(source, sink.clone()).run().await.unwrap_err();

        assert!(matches!(err, BridgeError::ProcessStreamError(_)));
        assert_eq!(sink.frames(), vec![Bytes::from_static(b"pcm")]);
    }

    #[tokio::test]
    async fn test_large_chunk_split_at_read_size() {
        let sink = Arc::new(RecordingSink::new());
        let source = reader_of(vec![Ok(Bytes::from(vec![7u8; 10_000]))]);

        relay(source, sink.clone()).run().await.unwrap();

        let sizes: Vec<usize> = sink.frames().iter().map(|f| f.len()).collect();
        assert_eq!(sizes, vec![4096, 4096, 1808]);
    }

    #[tokio::test]
    async fn test_cancel_stops_pending_read() {
        let sink = Arc::new(RecordingSink::new());
        let (_writer, reader) = tokio::io::duplex(64);
        let cancel = CancellationToken::new();
        let relay = CaptureRelay::new(
            SessionId::new(),
            Box::new(reader),
            sink,
            4096,
            Arc::new(SessionStats::default()),
            cancel.clone(),
        );

        let task = tokio::spawn(relay.run());
        cancel.cancel();
        let summary = task.await.unwrap().unwrap();
        assert_eq!(summary.messages, 0);
    }
}
