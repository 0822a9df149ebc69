//! In-memory stand-ins for the external PCM processes and the client
//! connection, used by the unit tests of the relay core.

use crate::audio::format::PcmFormat;
use crate::audio::process::{
    PcmProcessHandle, PcmReader, PcmWriter, ProcessExit, ProcessPipes, ProcessRole,
    ProcessSpawner,
};
use crate::audio::transport::FrameSink;
use crate::error::BridgeError;
use bytes::Bytes;
use std::future::{pending, Future};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;

/// What a mock capture process does after emitting its chunks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CaptureEnd {
    /// Keep running until killed.
    #[default]
    StayOpen,
    /// Close the output and exit with this code.
    Exit(i32),
    /// Fail the next read of the output, then keep running until killed.
    ReadError,
}

#[derive(Debug, Clone, Default)]
pub struct CaptureScript {
    /// Emitted in order, one read per chunk.
    pub chunks: Vec<Bytes>,
    pub stderr: Vec<String>,
    pub end: CaptureEnd,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PlaybackScript {
    /// Record everything written; exit 0 when the input closes.
    #[default]
    Consume,
    /// Close the input immediately but keep running until killed.
    CloseInput,
    /// Exit immediately with this code.
    Exit(i32),
    /// Hold the input open without ever reading it.
    Stall,
}

/// Record of one spawned mock process.
#[derive(Debug, Clone)]
pub struct MockProcess {
    pub role: ProcessRole,
    pub target: String,
    kills: Arc<AtomicUsize>,
    received: Arc<Mutex<Vec<u8>>>,
}

impl MockProcess {
    fn new(role: ProcessRole, target: &str) -> Self {
        Self {
            role,
            target: target.to_string(),
            kills: Arc::new(AtomicUsize::new(0)),
            received: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Kill requests that reached the process while it was running.
    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    /// Bytes written to a playback process so far.
    pub fn received(&self) -> Vec<u8> {
        self.received.lock().unwrap().clone()
    }
}

#[derive(Default)]
struct MockState {
    capture: Mutex<CaptureScript>,
    playback: Mutex<PlaybackScript>,
    failing: Mutex<Option<ProcessRole>>,
    spawned: Mutex<Vec<MockProcess>>,
}

/// Spawner whose processes are scripted tasks. Clones share state.
#[derive(Clone, Default)]
pub struct MockSpawner {
    state: Arc<MockState>,
}

impl MockSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capture(self, script: CaptureScript) -> Self {
        *self.state.capture.lock().unwrap() = script;
        self
    }

    pub fn with_playback(self, script: PlaybackScript) -> Self {
        *self.state.playback.lock().unwrap() = script;
        self
    }

    /// Make every spawn of `role` fail.
    pub fn failing(self, role: ProcessRole) -> Self {
        *self.state.failing.lock().unwrap() = Some(role);
        self
    }

    pub fn processes(&self) -> Vec<MockProcess> {
        self.state.spawned.lock().unwrap().clone()
    }

    /// Most recently spawned process of `role`.
    pub fn process(&self, role: ProcessRole) -> Option<MockProcess> {
        self.processes().into_iter().rev().find(|p| p.role == role)
    }
}

impl ProcessSpawner for MockSpawner {
    fn spawn(
        &self,
        role: ProcessRole,
        target: &str,
        _format: PcmFormat,
    ) -> Result<PcmProcessHandle, BridgeError> {
        if *self.state.failing.lock().unwrap() == Some(role) {
            return Err(BridgeError::SpawnFailed {
                program: program_name(role).to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "no such program"),
            });
        }

        let record = MockProcess::new(role, target);
        self.state.spawned.lock().unwrap().push(record.clone());

        let handle = match role {
            ProcessRole::Capture => {
                let script = self.state.capture.lock().unwrap().clone();
                spawn_capture(script, &record)
            }
            ProcessRole::Playback => {
                let script = *self.state.playback.lock().unwrap();
                spawn_playback(script, &record)
            }
        };
        Ok(handle)
    }
}

fn program_name(role: ProcessRole) -> &'static str {
    match role {
        ProcessRole::Capture => "mock-record",
        ProcessRole::Playback => "mock-play",
    }
}

fn exited(code: i32) -> ProcessExit {
    ProcessExit {
        code: Some(code),
        signal: None,
        killed: false,
    }
}

fn spawn_capture(script: CaptureScript, record: &MockProcess) -> PcmProcessHandle {
    let (chunk_tx, chunk_rx) = mpsc::channel::<io::Result<Bytes>>(script.chunks.len() + 2);
    let (stderr_tx, stderr_rx) = tokio::io::duplex(4096);
    let pipes = ProcessPipes {
        output: Some(Box::new(StreamReader::new(ReceiverStream::new(chunk_rx))) as PcmReader),
        input: None,
        stderr: Some(Box::new(stderr_rx) as PcmReader),
    };
    spawn_mock(
        ProcessRole::Capture,
        pipes,
        record,
        play_capture(script, chunk_tx, stderr_tx),
    )
}

async fn play_capture(
    script: CaptureScript,
    chunks: mpsc::Sender<io::Result<Bytes>>,
    mut stderr: DuplexStream,
) -> ProcessExit {
    for line in &script.stderr {
        let _ = stderr.write_all(format!("{}\n", line).as_bytes()).await;
    }
    for chunk in script.chunks {
        if chunks.send(Ok(chunk)).await.is_err() {
            break;
        }
    }

    match script.end {
        CaptureEnd::Exit(code) => exited(code),
        CaptureEnd::StayOpen => pending().await,
        CaptureEnd::ReadError => {
            let err = io::Error::new(io::ErrorKind::BrokenPipe, "capture pipe broke");
            let _ = chunks.send(Err(err)).await;
            pending().await
        }
    }
}

fn spawn_playback(script: PlaybackScript, record: &MockProcess) -> PcmProcessHandle {
    let (input, device) = tokio::io::duplex(64 * 1024);
    let (stderr_tx, stderr_rx) = tokio::io::duplex(1024);
    let pipes = ProcessPipes {
        output: None,
        input: Some(Box::new(input) as PcmWriter),
        stderr: Some(Box::new(stderr_rx) as PcmReader),
    };
    let received = record.received.clone();
    spawn_mock(
        ProcessRole::Playback,
        pipes,
        record,
        play_playback(script, device, stderr_tx, received),
    )
}

async fn play_playback(
    script: PlaybackScript,
    mut device: DuplexStream,
    _stderr: DuplexStream,
    received: Arc<Mutex<Vec<u8>>>,
) -> ProcessExit {
    match script {
        PlaybackScript::Consume => {
            let mut buf = vec![0u8; 8192];
            loop {
                match device.read(&mut buf).await {
                    Ok(0) => return exited(0),
                    Ok(n) => received.lock().unwrap().extend_from_slice(&buf[..n]),
                    Err(_) => return exited(1),
                }
            }
        }
        PlaybackScript::CloseInput => {
            drop(device);
            pending().await
        }
        PlaybackScript::Exit(code) => {
            drop(device);
            exited(code)
        }
        PlaybackScript::Stall => {
            let _device = device;
            pending().await
        }
    }
}

/// Run a scripted process body as the reaper, honoring kill requests.
fn spawn_mock<F>(
    role: ProcessRole,
    pipes: ProcessPipes,
    record: &MockProcess,
    body: F,
) -> PcmProcessHandle
where
    F: Future<Output = ProcessExit> + Send + 'static,
{
    let (kill_tx, kill_rx) = oneshot::channel();
    let (exit_tx, exit_rx) = oneshot::channel();
    let kills = record.kills.clone();

    let reaper = tokio::spawn(async move {
        let exit = tokio::select! {
            biased;
            Ok(()) = kill_rx => {
                kills.fetch_add(1, Ordering::SeqCst);
                ProcessExit { code: None, signal: Some(9), killed: true }
            }
            exit = body => exit,
        };
        let _ = exit_tx.send(exit);
    });

    PcmProcessHandle::new(role, program_name(role), None, pipes, kill_tx, exit_rx, reaper)
}

/// Frame sink that records everything it is given.
pub struct RecordingSink {
    frames: Mutex<Vec<Bytes>>,
    ready: AtomicBool,
    closes: AtomicUsize,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self {
            frames: Mutex::new(Vec::new()),
            ready: AtomicBool::new(true),
            closes: AtomicUsize::new(0),
        }
    }

    pub fn frames(&self) -> Vec<Bytes> {
        self.frames.lock().unwrap().clone()
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl Default for RecordingSink {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSink for RecordingSink {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst) && self.close_count() == 0
    }

    fn send_frame(&self, frame: Bytes) -> Result<(), BridgeError> {
        if self.close_count() > 0 {
            return Err(BridgeError::TransportNotReady("closed"));
        }
        self.frames.lock().unwrap().push(frame);
        Ok(())
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Poll `condition` until it holds, failing the test after a few seconds.
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}
