//! # Audio Relay Core
//!
//! Everything between a client connection and the host audio system.
//!
//! ## Key Components:
//! - **Process**: spawns and supervises the external PCM programs
//! - **Capture Relay**: process output → binary frames to the client
//! - **Playback Relay**: binary frames from the client → process input
//! - **Session Manager**: one session per connection, owns both processes and relays
//! - **Diagnostics**: logs process stderr and exit status
//!
//! ## Data Flow:
//! ```text
//! browser ──binary──▶ PlaybackRelay ──stdin──▶ pw-play   ──▶ browser_mic_sink
//! browser ◀──binary── CaptureRelay  ◀─stdout── pw-record ◀── browser_speaker_source
//! ```
//!
//! The WebSocket actor lives in `src/websocket.rs` and reaches this module
//! only through [`SessionManager`](session::SessionManager) and the
//! [`FrameSink`](transport::FrameSink) trait.

use serde::Serialize;

pub mod capture;      // Process output → client frames
pub mod diagnostics;  // Stderr and exit logging
pub mod format;       // Fixed PCM format
pub mod playback;     // Client frames → process input
pub mod process;      // External process handles and spawners
pub mod session;      // Session lifecycle and registry
pub mod transport;    // Outbound frame sink trait

#[cfg(test)]
pub mod testing;      // Mock processes and sinks

/// Counters reported by a relay when it stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelaySummary {
    /// Chunks forwarded (capture) or payloads written (playback).
    pub messages: u64,
    pub bytes: u64,
    /// Chunks the transport refused (capture) or messages rejected (playback).
    pub dropped: u64,
}
