//! # Process Diagnostics
//!
//! Passive observers of the external processes: one task per stderr stream
//! and one per exit notification. They log what they see and report exits to
//! the session supervisor. Whether an exit matters is decided there, never here.

use crate::audio::process::{ExitNotification, PcmReader, ProcessRole};
use crate::audio::session::{SessionEvent, SessionId};
use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Decoded stderr lines of one process.
pub type DiagnosticLines = BoxStream<'static, String>;

/// Split a byte stream into lines, decoding invalid UTF-8 lossily.
///
/// The stream ends at EOF or at the first read error.
pub fn lines(reader: PcmReader) -> DiagnosticLines {
    stream::unfold(BufReader::new(reader), |mut reader| async move {
        let mut raw = Vec::new();
        match reader.read_until(b'\n', &mut raw).await {
            Ok(0) => None,
            Ok(_) => {
                while matches!(raw.last(), Some(b'\n' | b'\r')) {
                    raw.pop();
                }
                Some((String::from_utf8_lossy(&raw).into_owned(), reader))
            }
            Err(err) => {
                debug!(error = %err, "Diagnostic stream read failed");
                None
            }
        }
    })
    .boxed()
}

/// Log every stderr line of a process until it closes.
pub async fn log_stderr(
    session: SessionId,
    role: ProcessRole,
    program: String,
    mut lines: DiagnosticLines,
) {
    let mut count = 0u64;
    while let Some(line) = lines.next().await {
        if line.trim().is_empty() {
            continue;
        }
        count += 1;
        info!(session = %session, role = %role, process = %program, "{}", line);
    }
    debug!(session = %session, role = %role, lines = count, "Process stderr closed");
}

/// Wait for a process to exit, log how, and report it to the supervisor.
pub async fn watch_exit(
    session: SessionId,
    role: ProcessRole,
    program: String,
    exited: ExitNotification,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    let exit = match exited.await {
        Ok(exit) => exit,
        Err(_) => {
            debug!(session = %session, role = %role, "Exit notification dropped");
            return;
        }
    };

    if exit.is_unexpected() {
        warn!(session = %session, role = %role, process = %program, exit = %exit, "Process exited unexpectedly");
    } else {
        info!(session = %session, role = %role, process = %program, exit = %exit, "Process exited");
    }

    // The supervisor stops listening once teardown has begun.
    let _ = events.send(SessionEvent::ProcessExited { role, exit });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::process::ProcessExit;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_lines_split_and_decode_lossily() {
        let (mut writer, reader) = tokio::io::duplex(256);
        writer
            .write_all(b"first line\r\nbad \xff byte\n\nno newline")
            .await
            .unwrap();
        drop(writer);

        let collected: Vec<String> = lines(Box::new(reader)).collect().await;
        assert_eq!(
            collected,
            vec![
                "first line".to_string(),
                "bad \u{fffd} byte".to_string(),
                String::new(),
                "no newline".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_watch_exit_reports_to_supervisor() {
        let (exit_tx, exit_rx) = oneshot::channel();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        exit_tx
            .send(ProcessExit { code: Some(1), signal: None, killed: false })
            .unwrap();
        watch_exit(
            SessionId::new(),
            ProcessRole::Capture,
            "pw-record".into(),
            exit_rx,
            events_tx,
        )
        .await;

        match events_rx.recv().await {
            Some(SessionEvent::ProcessExited { role, exit }) => {
                assert_eq!(role, ProcessRole::Capture);
                assert_eq!(exit.code, Some(1));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_watch_exit_without_status_reports_nothing() {
        let (exit_tx, exit_rx) = oneshot::channel::<ProcessExit>();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        drop(exit_tx);

        watch_exit(SessionId::new(), ProcessRole::Playback, "pw-play".into(), exit_rx, events_tx).await;
        assert!(events_rx.recv().await.is_none());
    }
}
