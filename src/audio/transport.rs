//! Outbound side of a client connection, as seen by the relay core.

use crate::error::BridgeError;
use bytes::Bytes;

/// Where captured PCM frames go.
///
/// Implemented by the WebSocket actor binding in production and by
/// `testing::RecordingSink` in tests. All methods are non-blocking: a sink
/// that cannot take a frame right now says so instead of waiting.
pub trait FrameSink: Send + Sync + 'static {
    /// Whether the connection is open and accepting frames.
    fn is_ready(&self) -> bool;

    /// Queue one binary frame. An error means the frame was not queued.
    fn send_frame(&self, frame: Bytes) -> Result<(), BridgeError>;

    /// Close the connection from the server side. Safe to call repeatedly.
    fn close(&self);
}
