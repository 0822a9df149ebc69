//! # PCM Process Handles
//!
//! Wraps the external programs that move raw PCM between the bridge and the
//! host audio system. The session code never builds a command line itself; it
//! asks a [`ProcessSpawner`] for a producer (capture) or consumer (playback)
//! bound to a named virtual device, and gets back a [`PcmProcessHandle`].
//!
//! ## Handle Contract:
//! - **output()**: readable PCM pipe, capture role only (taken once)
//! - **input()**: writable PCM pipe, playback role only (taken once)
//! - **diagnostics()**: stderr as decoded text lines (taken once)
//! - **exited()**: one-shot exit notification (taken once)
//! - **kill()**: idempotent forced termination, a no-op after natural exit
//!
//! Every handle owns a reaper task that waits on the child. The reaper is the
//! only place the exit status is collected, so `kill()` is a message to it
//! rather than a direct signal.

use crate::audio::diagnostics::{self, DiagnosticLines};
use crate::audio::format::PcmFormat;
use crate::config::AppConfig;
use crate::error::BridgeError;
use serde::Serialize;
use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Readable side of a process pipe.
pub type PcmReader = Box<dyn AsyncRead + Send + Unpin>;

/// Writable side of a process pipe.
pub type PcmWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One-shot notification resolved when the process has been reaped.
pub type ExitNotification = oneshot::Receiver<ProcessExit>;

/// Direction of the PCM stream a process handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessRole {
    /// Producer: reads the virtual speaker monitor, writes PCM to stdout.
    Capture,
    /// Consumer: reads PCM from stdin, plays it into the virtual microphone.
    Playback,
}

impl ProcessRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessRole::Capture => "capture",
            ProcessRole::Playback => "playback",
        }
    }
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
    /// Terminating signal, if the process was killed by one.
    pub signal: Option<i32>,
    /// Whether the bridge asked for the termination.
    pub killed: bool,
}

impl ProcessExit {
    pub fn from_status(status: ExitStatus, killed: bool) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
            killed,
        }
    }

    /// Exit whose status could not be collected.
    pub fn unknown(killed: bool) -> Self {
        Self {
            code: None,
            signal: None,
            killed,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// A failure the bridge did not cause.
    pub fn is_unexpected(&self) -> bool {
        !self.killed && !self.success()
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "code {}", code)?,
            (None, Some(signal)) => write!(f, "signal {}", signal)?,
            (None, None) => f.write_str("unknown status")?,
        }
        if self.killed {
            f.write_str(" (killed by bridge)")?;
        }
        Ok(())
    }
}

/// The standard pipes of a spawned process.
#[derive(Default)]
pub struct ProcessPipes {
    pub output: Option<PcmReader>,
    pub input: Option<PcmWriter>,
    pub stderr: Option<PcmReader>,
}

/// Capability to start raw-PCM processes bound to a named virtual device.
///
/// ## Implementations:
/// - [`CommandSpawner`]: real `pw-record` / `pw-play` style executables
/// - `testing::MockSpawner`: in-memory processes for unit tests
///
/// Spawning is synchronous so that a failure surfaces as `SpawnFailed`
/// at session start, never later while the pipes are being read.
pub trait ProcessSpawner: Send + Sync + 'static {
    fn spawn(
        &self,
        role: ProcessRole,
        target: &str,
        format: PcmFormat,
    ) -> Result<PcmProcessHandle, BridgeError>;
}

/// Sends the kill request to the reaper at most once.
struct KillSwitch(Mutex<Option<oneshot::Sender<()>>>);

impl KillSwitch {
    fn new(tx: oneshot::Sender<()>) -> Self {
        Self(Mutex::new(Some(tx)))
    }

    fn trigger(&self) -> bool {
        let tx = self.0.lock().unwrap_or_else(PoisonError::into_inner).take();
        match tx {
            // Fails when the reaper is gone, i.e. the process already exited.
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }
}

/// One running external PCM process.
pub struct PcmProcessHandle {
    role: ProcessRole,
    program: String,
    pid: Option<u32>,
    pipes: ProcessPipes,
    exited: Option<ExitNotification>,
    kill_switch: KillSwitch,
    reaper: Option<JoinHandle<()>>,
}

impl PcmProcessHandle {
    /// Assemble a handle from its parts.
    ///
    /// ## Parameters:
    /// - **kill_tx**: fires the reaper's kill branch
    /// - **exited**: resolved by the reaper once the process is gone
    /// - **reaper**: the task owning the process
    pub fn new(
        role: ProcessRole,
        program: impl Into<String>,
        pid: Option<u32>,
        pipes: ProcessPipes,
        kill_tx: oneshot::Sender<()>,
        exited: ExitNotification,
        reaper: JoinHandle<()>,
    ) -> Self {
        Self {
            role,
            program: program.into(),
            pid,
            pipes,
            exited: Some(exited),
            kill_switch: KillSwitch::new(kill_tx),
            reaper: Some(reaper),
        }
    }

    pub fn role(&self) -> ProcessRole {
        self.role
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Take the PCM output pipe (capture role only).
    pub fn output(&mut self) -> Option<PcmReader> {
        match self.role {
            ProcessRole::Capture => self.pipes.output.take(),
            ProcessRole::Playback => None,
        }
    }

    /// Take the PCM input pipe (playback role only).
    pub fn input(&mut self) -> Option<PcmWriter> {
        match self.role {
            ProcessRole::Playback => self.pipes.input.take(),
            ProcessRole::Capture => None,
        }
    }

    /// Take the stderr stream as decoded lines; ends when the process exits.
    pub fn diagnostics(&mut self) -> Option<DiagnosticLines> {
        self.pipes.stderr.take().map(diagnostics::lines)
    }

    /// Take the exit notification. Only one observer ever gets it.
    pub fn exited(&mut self) -> Option<ExitNotification> {
        self.exited.take()
    }

    /// Ask for the process to be terminated.
    ///
    /// Returns `true` only for the call that delivered the request to a live
    /// process. Later calls, and calls after a natural exit, do nothing.
    pub fn kill(&self) -> bool {
        let delivered = self.kill_switch.trigger();
        if delivered {
            debug!(process = %self.program, role = %self.role, pid = ?self.pid, "Kill requested");
        }
        delivered
    }

    /// Kill the process and wait until it has been reaped.
    pub async fn terminate(&mut self) {
        self.kill();
        if let Some(reaper) = self.reaper.take() {
            if let Err(err) = reaper.await {
                warn!(process = %self.program, error = %err, "Process reaper task failed");
            }
        }
    }
}

impl Drop for PcmProcessHandle {
    fn drop(&mut self) {
        self.kill();
    }
}

impl fmt::Debug for PcmProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PcmProcessHandle")
            .field("role", &self.role)
            .field("program", &self.program)
            .field("pid", &self.pid)
            .finish()
    }
}

/// Spawns the PipeWire command line tools (or compatible programs).
///
/// ## Invocation:
/// ```text
/// pw-record --target=<device> --rate=48000 --channels=1 --format=s16 --latency=50ms -
/// pw-play   --target=<device> --rate=48000 --channels=1 --format=s16 --latency=50ms -
/// ```
/// The trailing `-` selects stdout (capture) or stdin (playback).
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    capture_program: String,
    playback_program: String,
    latency: Duration,
}

impl CommandSpawner {
    pub fn new(
        capture_program: impl Into<String>,
        playback_program: impl Into<String>,
        latency: Duration,
    ) -> Self {
        Self {
            capture_program: capture_program.into(),
            playback_program: playback_program.into(),
            latency,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.devices.capture_program.clone(),
            config.devices.playback_program.clone(),
            Duration::from_millis(config.audio.latency_ms),
        )
    }

    fn program(&self, role: ProcessRole) -> &str {
        match role {
            ProcessRole::Capture => &self.capture_program,
            ProcessRole::Playback => &self.playback_program,
        }
    }

    fn command(&self, role: ProcessRole, target: &str, format: PcmFormat) -> Command {
        let mut command = Command::new(self.program(role));
        command
            .arg(format!("--target={}", target))
            .arg(format!("--rate={}", format.sample_rate))
            .arg(format!("--channels={}", format.channels))
            .arg(format!("--format={}", format.sample_format_arg()))
            .arg(format!("--latency={}ms", self.latency.as_millis()))
            .arg("-")
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match role {
            ProcessRole::Capture => {
                command.stdin(Stdio::null()).stdout(Stdio::piped());
            }
            ProcessRole::Playback => {
                command.stdin(Stdio::piped()).stdout(Stdio::null());
            }
        }
        command
    }
}

impl ProcessSpawner for CommandSpawner {
    fn spawn(
        &self,
        role: ProcessRole,
        target: &str,
        format: PcmFormat,
    ) -> Result<PcmProcessHandle, BridgeError> {
        let program = self.program(role).to_string();
        let mut child = self
            .command(role, target, format)
            .spawn()
            .map_err(|source| BridgeError::SpawnFailed {
                program: program.clone(),
                source,
            })?;

        let pid = child.id();
        let pipes = ProcessPipes {
            output: child.stdout.take().map(|out| Box::new(out) as PcmReader),
            input: child.stdin.take().map(|inp| Box::new(inp) as PcmWriter),
            stderr: child.stderr.take().map(|err| Box::new(err) as PcmReader),
        };

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        let reaper = tokio::spawn(reap_child(child, program.clone(), kill_rx, exit_tx));

        info!(
            process = %program,
            role = %role,
            pid = ?pid,
            target = %target,
            format = %format,
            "Spawned PCM process"
        );

        Ok(PcmProcessHandle::new(
            role, program, pid, pipes, kill_tx, exit_rx, reaper,
        ))
    }
}

/// Wait for the child to exit, killing it first if asked to.
async fn reap_child(
    mut child: Child,
    program: String,
    kill_rx: oneshot::Receiver<()>,
    exit_tx: oneshot::Sender<ProcessExit>,
) {
    let natural = tokio::select! {
        status = child.wait() => Some(status),
        Ok(()) = kill_rx => None,
    };

    let (status, killed) = match natural {
        Some(status) => (status, false),
        None => {
            if let Err(err) = child.start_kill() {
                debug!(process = %program, error = %err, "Process already gone at kill time");
            }
            (child.wait().await, true)
        }
    };

    let exit = match status {
        Ok(status) => ProcessExit::from_status(status, killed),
        Err(err) => {
            warn!(process = %program, error = %err, "Failed to collect exit status");
            ProcessExit::unknown(killed)
        }
    };

    // Nobody listening is fine: the session may not watch this process.
    let _ = exit_tx.send(exit);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn args_of(command: &Command) -> Vec<String> {
        command
            .as_std()
            .get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_capture_command_line() {
        let spawner = CommandSpawner::new("pw-record", "pw-play", Duration::from_millis(50));
        let command = spawner.command(
            ProcessRole::Capture,
            "browser_speaker_source",
            PcmFormat::BRIDGE,
        );

        assert_eq!(command.as_std().get_program(), "pw-record");
        assert_eq!(
            args_of(&command),
            vec![
                "--target=browser_speaker_source",
                "--rate=48000",
                "--channels=1",
                "--format=s16",
                "--latency=50ms",
                "-",
            ]
        );
    }

    #[test]
    fn test_playback_command_uses_playback_program() {
        let spawner = CommandSpawner::new("pw-record", "pw-play", Duration::from_millis(20));
        let command = spawner.command(ProcessRole::Playback, "browser_mic_sink", PcmFormat::BRIDGE);

        assert_eq!(command.as_std().get_program(), "pw-play");
        let args = args_of(&command);
        assert_eq!(args[0], "--target=browser_mic_sink");
        assert!(args.contains(&"--latency=20ms".to_string()));
    }

    #[test]
    fn test_exit_classification() {
        let clean = ProcessExit { code: Some(0), signal: None, killed: false };
        let crashed = ProcessExit { code: Some(2), signal: None, killed: false };
        let killed = ProcessExit { code: None, signal: Some(9), killed: true };

        assert!(!clean.is_unexpected());
        assert!(crashed.is_unexpected());
        assert!(!killed.is_unexpected());
        assert_eq!(crashed.to_string(), "code 2");
        assert_eq!(killed.to_string(), "signal 9 (killed by bridge)");
    }

    #[tokio::test]
    async fn test_missing_program_fails_synchronously() {
        let spawner = CommandSpawner::new(
            "/nonexistent/media-bridge-capture",
            "/nonexistent/media-bridge-play",
            Duration::from_millis(50),
        );

        let err = spawner
            .spawn(ProcessRole::Capture, "nowhere", PcmFormat::BRIDGE)
            .unwrap_err();
        match err {
            BridgeError::SpawnFailed { program, .. } => {
                assert_eq!(program, "/nonexistent/media-bridge-capture");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_real_process_pipes_and_kill() {
        let spawner = ShellSpawner;
        let mut handle = spawner
            .spawn(ProcessRole::Playback, "unused", PcmFormat::BRIDGE)
            .unwrap();
        let mut input = handle.input().expect("playback exposes stdin");
        assert!(handle.output().is_none());

        input.write_all(b"pcm").await.unwrap();
        let exited = handle.exited().expect("exit notification");
        assert!(handle.exited().is_none());

        assert!(handle.kill());
        assert!(!handle.kill());
        handle.terminate().await;

        let exit = exited.await.unwrap();
        assert!(exit.killed);
        assert!(!exit.is_unexpected());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_after_natural_exit_is_noop() {
        let spawner = ShellSpawner;
        let mut handle = spawner
            .spawn(ProcessRole::Capture, "unused", PcmFormat::BRIDGE)
            .unwrap();
        let mut output = handle.output().expect("capture exposes stdout");

        let mut data = Vec::new();
        output.read_to_end(&mut data).await.unwrap();
        assert_eq!(data, b"hello\n");

        let exit = handle.exited().unwrap().await.unwrap();
        assert!(exit.success());
        assert!(!handle.kill());
    }

    /// Runs `sh -c` with the same pipe layout as [`CommandSpawner`].
    struct ShellSpawner;

    impl ProcessSpawner for ShellSpawner {
        fn spawn(
            &self,
            role: ProcessRole,
            _target: &str,
            _format: PcmFormat,
        ) -> Result<PcmProcessHandle, BridgeError> {
            let script = match role {
                ProcessRole::Capture => "echo hello",
                ProcessRole::Playback => "cat > /dev/null",
            };
            let mut command = Command::new("sh");
            command.arg("-c").arg(script).stderr(Stdio::piped());
            match role {
                ProcessRole::Capture => command.stdin(Stdio::null()).stdout(Stdio::piped()),
                ProcessRole::Playback => command.stdin(Stdio::piped()).stdout(Stdio::null()),
            };
            let mut child = command.spawn().map_err(|source| BridgeError::SpawnFailed {
                program: "sh".into(),
                source,
            })?;

            let pipes = ProcessPipes {
                output: child.stdout.take().map(|out| Box::new(out) as PcmReader),
                input: child.stdin.take().map(|inp| Box::new(inp) as PcmWriter),
                stderr: child.stderr.take().map(|err| Box::new(err) as PcmReader),
            };
            let pid = child.id();
            let (kill_tx, kill_rx) = oneshot::channel();
            let (exit_tx, exit_rx) = oneshot::channel();
            let reaper = tokio::spawn(reap_child(child, "sh".into(), kill_rx, exit_tx));
            Ok(PcmProcessHandle::new(role, "sh", pid, pipes, kill_tx, exit_rx, reaper))
        }
    }
}
