use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use livecast_common::endpoint::BroadcastEndpoint;
use tokio::process::Command;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::command::{display_command, EncoderSettings};
use super::diagnostics::DiagnosticsReader;
use crate::error::{StreamError, StreamResult};
use crate::scheduler::{discard_audio, SegmentPlan, SegmentRunner};

const DRAIN_WAIT: Duration = Duration::from_secs(2);

/// Encodes one bounded segment at a time from a still image plus audio.
///
/// Only one segment may run at once; a request while busy is dropped with a
/// warning. Narration files handed to a segment are deleted once it ends.
pub struct SegmentEncoder {
    settings: EncoderSettings,
    endpoint: BroadcastEndpoint,
    image: PathBuf,
    cancel: CancellationToken,
    busy: AtomicBool,
}

impl SegmentEncoder {
    pub fn new(
        settings: EncoderSettings,
        endpoint: BroadcastEndpoint,
        image: PathBuf,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            settings,
            endpoint,
            image,
            cancel,
            busy: AtomicBool::new(false),
        }
    }

    /// Encode `duration` of `image` with optional narration, then return.
    pub async fn encode(&self, narration: Option<&Path>, duration: Duration) -> StreamResult<()> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("segment already streaming, ignoring request");
            if let Some(path) = narration {
                discard_audio(path).await;
            }
            return Ok(());
        }

        let result = self.run(narration, duration).await;
        if let Some(path) = narration {
            discard_audio(path).await;
        }
        self.busy.store(false, Ordering::SeqCst);
        result
    }

    async fn run(&self, narration: Option<&Path>, duration: Duration) -> StreamResult<()> {
        let args = self
            .settings
            .segment_args(&self.image, narration, duration, &self.endpoint);
        info!(
            command = %display_command(&self.settings.program, &args, &self.endpoint),
            duration_secs = duration.as_secs_f64(),
            "starting segment encoder"
        );

        let started = Instant::now();
        let mut child = Command::new(&self.settings.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| StreamError::Spawn {
                program: self.settings.program.clone(),
                message: e.to_string(),
            })?;

        let diagnostics = child
            .stderr
            .take()
            .map(|stderr| DiagnosticsReader::spawn(stderr, "segment", Some(self.endpoint.clone())));

        let status = tokio::select! {
            status = child.wait() => Some(status?),
            _ = self.cancel.cancelled() => {
                info!("stop requested, terminating segment encoder");
                child.kill().await?;
                child.wait().await?;
                None
            }
        };

        let stderr = match diagnostics {
            Some(reader) => reader.finish(DRAIN_WAIT).await,
            None => String::new(),
        };

        match status {
            None => Ok(()),
            Some(status) if status.success() => {
                info!(
                    elapsed_secs = started.elapsed().as_secs_f64(),
                    "segment finished"
                );
                Ok(())
            }
            Some(status) => {
                error!(code = ?status.code(), "segment encoder exited with failure");
                Err(StreamError::ProcessTerminated {
                    code: status.code(),
                    stderr,
                })
            }
        }
    }
}

#[async_trait]
impl SegmentRunner for SegmentEncoder {
    async fn run_segment(&self, plan: SegmentPlan) -> StreamResult<()> {
        self.encode(plan.narration_audio.as_deref(), plan.total_duration)
            .await
    }
}
