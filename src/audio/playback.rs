//! # Playback Relay
//!
//! Browser → host audio. Takes inbound messages in arrival order, validates
//! each one, and writes accepted payloads verbatim to the playback process.
//!
//! ## Validation Policy:
//! - Non-binary messages are dropped with a warning
//! - Binary payloads larger than the ceiling are dropped with a warning
//! - A payload of exactly the ceiling is accepted; empty payloads are accepted
//!   and write nothing
//!
//! A rejected message never ends the session. A failed write does.

use crate::audio::process::PcmWriter;
use crate::audio::session::{SessionId, SessionStats};
use crate::audio::RelaySummary;
use crate::error::{BridgeError, InboundRejection};
use bytes::Bytes;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A message as it arrived from the client connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    Binary(Bytes),
    Text(String),
}

impl InboundMessage {
    pub fn len(&self) -> usize {
        match self {
            InboundMessage::Binary(payload) => payload.len(),
            InboundMessage::Text(text) => text.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Acceptance rules for inbound messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InboundPolicy {
    pub max_message_bytes: usize,
}

impl InboundPolicy {
    pub fn new(max_message_bytes: usize) -> Self {
        Self { max_message_bytes }
    }

    /// Check a message without consuming it.
    pub fn check(&self, message: &InboundMessage) -> Result<(), InboundRejection> {
        match message {
            InboundMessage::Text(_) => Err(InboundRejection::NonBinary),
            InboundMessage::Binary(payload) if payload.len() > self.max_message_bytes => {
                Err(InboundRejection::Oversized {
                    size: payload.len(),
                    limit: self.max_message_bytes,
                })
            }
            InboundMessage::Binary(_) => Ok(()),
        }
    }

    /// Accept a message, yielding the PCM payload to write.
    pub fn admit(&self, message: InboundMessage) -> Result<Bytes, InboundRejection> {
        self.check(&message)?;
        match message {
            InboundMessage::Binary(payload) => Ok(payload),
            InboundMessage::Text(_) => Err(InboundRejection::NonBinary),
        }
    }
}

pub struct PlaybackRelay {
    session: SessionId,
    inbound: mpsc::Receiver<InboundMessage>,
    sink: PcmWriter,
    policy: InboundPolicy,
    stats: Arc<SessionStats>,
    cancel: CancellationToken,
}

impl PlaybackRelay {
    pub fn new(
        session: SessionId,
        inbound: mpsc::Receiver<InboundMessage>,
        sink: PcmWriter,
        policy: InboundPolicy,
        stats: Arc<SessionStats>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session,
            inbound,
            sink,
            policy,
            stats,
            cancel,
        }
    }

    /// Write accepted messages until the inbound side closes or the session
    /// starts tearing down. A write blocked on a stalled process is abandoned
    /// on teardown. On a normal end the process input is closed.
    pub async fn run(mut self) -> Result<RelaySummary, BridgeError> {
        let mut summary = RelaySummary::default();
        let mut cancelled = false;

        loop {
            let message = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                message = self.inbound.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            let payload = match self.policy.admit(message) {
                Ok(payload) => payload,
                Err(rejection) => {
                    summary.dropped += 1;
                    self.stats.record_rejected();
                    let err = BridgeError::from(rejection);
                    warn!(session = %self.session, error = %err, "Rejected inbound message");
                    continue;
                }
            };

            if payload.is_empty() {
                continue;
            }

            let written = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                written = write_payload(&mut self.sink, &payload) => written,
            };
            written.map_err(BridgeError::ProcessWriteError)?;

            summary.messages += 1;
            summary.bytes += payload.len() as u64;
            self.stats.record_written(payload.len());
            if summary.messages <= 5 || summary.messages % 100 == 0 {
                debug!(
                    session = %self.session,
                    message = summary.messages,
                    bytes = payload.len(),
                    total_bytes = summary.bytes,
                    "Playback write"
                );
            }
        }

        if !cancelled {
            if let Err(err) = self.sink.shutdown().await {
                debug!(session = %self.session, error = %err, "Closing playback input failed");
            }
        }
        debug!(
            session = %self.session,
            messages = summary.messages,
            bytes = summary.bytes,
            rejected = summary.dropped,
            "Playback relay finished"
        );
        Ok(summary)
    }
}

async fn write_payload(sink: &mut PcmWriter, payload: &[u8]) -> std::io::Result<()> {
    sink.write_all(payload).await?;
    sink.flush().await
}
