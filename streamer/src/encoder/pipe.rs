use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use livecast_common::endpoint::BroadcastEndpoint;
use livecast_common::frame::Frame;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, error, info, warn};

use super::command::{display_command, EncoderSettings};
use super::diagnostics::DiagnosticsReader;
use crate::error::{StreamError, StreamResult};

/// How long to let the reader drain after the encoder has gone away.
const DRAIN_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncoderState {
    NotStarted,
    Running,
    Terminated(Option<i32>),
    Failed(String),
}

/// An encoder process fed raw frames through its standard input.
pub struct PipeEncoder {
    program: String,
    args: Vec<String>,
    endpoint: Option<BroadcastEndpoint>,
    frame_len: usize,
    stop_grace: Duration,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    diagnostics: Option<DiagnosticsReader>,
    state: EncoderState,
    frames_written: u64,
}

impl PipeEncoder {
    pub fn new(
        program: impl Into<String>,
        args: Vec<String>,
        endpoint: Option<BroadcastEndpoint>,
        frame_len: usize,
        stop_grace: Duration,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            endpoint,
            frame_len,
            stop_grace,
            child: None,
            stdin: None,
            diagnostics: None,
            state: EncoderState::NotStarted,
            frames_written: 0,
        }
    }

    /// An encoder for one streaming session, optionally mixing narration and
    /// bounded to `duration`.
    pub fn for_session(
        settings: &EncoderSettings,
        endpoint: &BroadcastEndpoint,
        narration: Option<&Path>,
        duration: Option<Duration>,
    ) -> Self {
        Self::new(
            settings.program.clone(),
            settings.pipe_args(narration, duration, endpoint),
            Some(endpoint.clone()),
            Frame::raw_len(settings.width, settings.height),
            settings.stop_grace,
        )
    }

    pub fn state(&self) -> &EncoderState {
        &self.state
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Spawn the encoder. A second start while one is running is ignored.
    pub fn start(&mut self) -> StreamResult<()> {
        if self.is_running() {
            warn!(program = %self.program, "encoder already running, ignoring start request");
            return Ok(());
        }

        let shown = match &self.endpoint {
            Some(endpoint) => display_command(&self.program, &self.args, endpoint),
            None => format!("{} {}", self.program, self.args.join(" ")),
        };
        info!(command = %shown, "starting streaming encoder");

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                self.state = EncoderState::Failed(e.to_string());
                StreamError::Spawn {
                    program: self.program.clone(),
                    message: e.to_string(),
                }
            })?;

        let stdin = child.stdin.take().ok_or_else(|| StreamError::Spawn {
            program: self.program.clone(),
            message: "could not get stdin handle".into(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| StreamError::Spawn {
            program: self.program.clone(),
            message: "could not get stderr handle".into(),
        })?;

        self.diagnostics = Some(DiagnosticsReader::spawn(stderr, "pipe", self.endpoint.clone()));
        self.child = Some(child);
        self.stdin = Some(stdin);
        self.state = EncoderState::Running;
        self.frames_written = 0;
        Ok(())
    }

    /// Write one opaque frame to the encoder's input pipe.
    pub async fn write_frame(&mut self, frame: &Frame) -> StreamResult<()> {
        let bytes = frame.as_rgba_bytes();
        if bytes.len() != self.frame_len {
            return Err(StreamError::PipeCommunication {
                message: format!(
                    "frame is {} bytes, encoder expects {}",
                    bytes.len(),
                    self.frame_len
                ),
                stderr: String::new(),
            });
        }

        let Some(stdin) = self.stdin.as_mut() else {
            return Err(StreamError::PipeCommunication {
                message: "encoder is not running".into(),
                stderr: String::new(),
            });
        };

        if let Err(e) = stdin.write_all(bytes).await {
            let code = self.reap(DRAIN_WAIT).await.and_then(|s| s.code());
            let stderr = self.take_diagnostics().await;
            error!(error = %e, ?code, "encoder pipe write failed");
            self.state = match code {
                Some(code) => EncoderState::Terminated(Some(code)),
                None => EncoderState::Failed(e.to_string()),
            };
            return Err(StreamError::PipeCommunication {
                message: e.to_string(),
                stderr,
            });
        }
        self.frames_written += 1;

        if let Some(status) = self.exited()? {
            let stderr = self.take_diagnostics().await;
            self.stdin = None;
            self.child = None;
            self.state = EncoderState::Terminated(status.code());
            return Err(StreamError::ProcessTerminated {
                code: status.code(),
                stderr,
            });
        }
        Ok(())
    }

    /// Close the input pipe and wait for a graceful exit, killing the
    /// process once the grace period runs out.
    pub async fn stop(&mut self) -> StreamResult<Option<ExitStatus>> {
        drop(self.stdin.take());
        let Some(mut child) = self.child.take() else {
            return Ok(None);
        };

        let status = match tokio::time::timeout(self.stop_grace, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                warn!(grace = ?self.stop_grace, "encoder did not exit after end of input, killing");
                child.kill().await?;
                child.wait().await?
            }
        };

        let stderr = self.take_diagnostics().await;
        if !status.success() && !stderr.is_empty() {
            debug!(stderr = %stderr, "encoder final output");
        }
        info!(
            code = ?status.code(),
            frames = self.frames_written,
            "streaming encoder stopped"
        );
        self.state = EncoderState::Terminated(status.code());
        Ok(Some(status))
    }

    /// Whether the encoder process is alive right now.
    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    fn exited(&mut self) -> StreamResult<Option<ExitStatus>> {
        match self.child.as_mut() {
            Some(child) => Ok(child.try_wait()?),
            None => Ok(None),
        }
    }

    async fn reap(&mut self, wait: Duration) -> Option<ExitStatus> {
        drop(self.stdin.take());
        let mut child = self.child.take()?;
        match tokio::time::timeout(wait, child.wait()).await {
            Ok(Ok(status)) => Some(status),
            _ => {
                let _ = child.kill().await;
                child.wait().await.ok()
            }
        }
    }

    async fn take_diagnostics(&mut self) -> String {
        match self.diagnostics.take() {
            Some(reader) => reader.finish(DRAIN_WAIT).await,
            None => String::new(),
        }
    }
}
