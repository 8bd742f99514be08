use std::time::Duration;

use async_trait::async_trait;
use livecast_common::frame::Frame;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::capture::FrameSource;
use crate::encoder::pipe::{EncoderState, PipeEncoder};
use crate::error::{StreamError, StreamResult};
use crate::overlay::OverlayCompositor;
use crate::scheduler::{discard_audio, SegmentPlan, SegmentRunner};

/// Upper bound on releasing the renderer during teardown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Frame pacing
// ============================================================================

/// Wall-clock anchored frame pacing.
///
/// Each frame's due time is `anchor + n * interval`, so time spent capturing
/// and encoding is absorbed instead of accumulating. When the loop falls more
/// than one interval behind (a page reload, say) the schedule is re-anchored
/// rather than bursting frames to catch up.
#[derive(Debug, Clone)]
pub struct Pacer {
    interval_nanos: u64,
    anchor: Instant,
    frames: u64,
}

impl Pacer {
    pub fn new(fps: u32, start: Instant) -> Self {
        Self {
            interval_nanos: 1_000_000_000 / u64::from(fps.max(1)),
            anchor: start,
            frames: 0,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_nanos(self.interval_nanos)
    }

    /// How long to sleep after a frame finished at `now`.
    pub fn next_delay(&mut self, now: Instant) -> Duration {
        self.frames += 1;
        let due = self.anchor + Duration::from_nanos(self.interval_nanos.saturating_mul(self.frames));
        if now > due + self.interval() {
            debug!(
                behind_ms = (now - due).as_millis() as u64,
                "frame pacing fell behind, re-anchoring"
            );
            self.anchor = now;
            self.frames = 0;
            return Duration::ZERO;
        }
        due.saturating_duration_since(now)
    }
}

// ============================================================================
// Segment hand-off between scheduler and capture driver
// ============================================================================

/// One planned segment travelling from the scheduler to the capture driver.
pub struct SegmentHandoff {
    pub plan: SegmentPlan,
    pub done: oneshot::Sender<StreamResult<()>>,
}

/// Scheduler-side end of the hand-off: sends a plan and waits until the
/// driver has played it.
pub struct HandoffRunner {
    tx: mpsc::Sender<SegmentHandoff>,
}

/// A single-slot channel joining a scheduler to a capture driver.
pub fn segment_handoff() -> (HandoffRunner, mpsc::Receiver<SegmentHandoff>) {
    let (tx, rx) = mpsc::channel(1);
    (HandoffRunner { tx }, rx)
}

#[async_trait]
impl SegmentRunner for HandoffRunner {
    async fn run_segment(&self, plan: SegmentPlan) -> StreamResult<()> {
        let (done, finished) = oneshot::channel();
        if let Err(unsent) = self.tx.send(SegmentHandoff { plan, done }).await {
            if let Some(path) = &unsent.0.plan.narration_audio {
                discard_audio(path).await;
            }
            return Err(StreamError::RenderFatal("capture driver is not running".into()));
        }
        finished.await.unwrap_or_else(|_| {
            Err(StreamError::RenderFatal(
                "capture driver stopped before the segment finished".into(),
            ))
        })
    }
}

// ============================================================================
// Capture driver
// ============================================================================

/// Slack past a segment's planned length before the driver cuts it even
/// though the encoder has not taken all of its frames.
const SEGMENT_SLACK: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PumpEnd {
    Cancelled,
    Finished,
}

/// Where a bounded segment ends.
#[derive(Debug, Clone, Copy)]
struct SegmentBound {
    /// Frames covering the segment's playback length at the target rate.
    frames: u64,
    /// Wall-clock cut-off in case the frames never get written.
    deadline: Instant,
}

impl SegmentBound {
    fn new(length: Duration, fps: u32, started: Instant) -> Self {
        let frames = (length.as_nanos() * u128::from(fps)).div_ceil(1_000_000_000);
        Self {
            frames: u64::try_from(frames).unwrap_or(u64::MAX),
            deadline: started + length + SEGMENT_SLACK,
        }
    }
}

/// Frames that should have been written `elapsed` into a stream at `fps`.
fn frames_due(elapsed: Duration, fps: u32) -> u64 {
    let due = elapsed.as_nanos() * u128::from(fps) / 1_000_000_000;
    u64::try_from(due).unwrap_or(u64::MAX).saturating_add(1)
}

/// Moves frames from the frame source through the overlay into an encoder.
pub struct CaptureDriver {
    source: FrameSource,
    overlay: Option<OverlayCompositor>,
    fps: u32,
    frames_sent: u64,
}

impl CaptureDriver {
    pub fn new(source: FrameSource, overlay: Option<OverlayCompositor>, fps: u32) -> Self {
        Self {
            source,
            overlay,
            fps: fps.max(1),
            frames_sent: 0,
        }
    }

    #[cfg(test)]
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    /// Stream `url` through one long-running encoder until cancelled or a
    /// fatal error. The encoder and renderer are always released.
    pub async fn run_continuous(
        &mut self,
        url: &str,
        mut encoder: PipeEncoder,
        cancel: &CancellationToken,
    ) -> StreamResult<()> {
        let result: StreamResult<()> = async {
            self.source.open(url).await?;
            encoder.start()?;
            self.pump(&mut encoder, None, cancel).await?;
            Ok(())
        }
        .await;

        if let Err(e) = &result {
            error!(error = %e, frames = self.frames_sent, "capture stream failed");
        }
        let cleanup = self.teardown(Some(&mut encoder)).await;
        info!(frames = self.frames_sent, "capture stream stopped");
        result.and(cleanup)
    }

    /// Play segments handed over by a scheduler, one bounded encoder per
    /// segment, until the hand-off closes or `cancel` fires.
    ///
    /// `encoder_for(Some(plan))` builds a segment's encoder and
    /// `encoder_for(None)` an unbounded filler encoder, which keeps the
    /// broadcast up whenever no segment is ready yet. Each segment's outcome
    /// is reported back to the scheduler, which decides whether the session
    /// continues.
    pub async fn run_segments<F>(
        &mut self,
        url: &str,
        mut handoffs: mpsc::Receiver<SegmentHandoff>,
        mut encoder_for: F,
        cancel: &CancellationToken,
    ) -> StreamResult<()>
    where
        F: FnMut(Option<&SegmentPlan>) -> PipeEncoder,
    {
        let result: StreamResult<()> = async {
            self.source.open(url).await?;
            let mut segment: u64 = 0;
            while !cancel.is_cancelled() {
                let handoff = match handoffs.try_recv() {
                    Ok(handoff) => handoff,
                    Err(TryRecvError::Disconnected) => break,
                    Err(TryRecvError::Empty) => {
                        let filler = encoder_for(None);
                        match self.fill_until_handoff(&mut handoffs, filler, cancel).await? {
                            Some(handoff) => handoff,
                            None => break,
                        }
                    }
                };

                let encoder = encoder_for(Some(&handoff.plan));
                let outcome = self.play_segment(segment, handoff.plan, encoder, cancel).await;
                if let Err(Err(unreported)) = handoff.done.send(outcome) {
                    if unreported.is_fatal() {
                        return Err(unreported);
                    }
                }
                segment += 1;
            }
            Ok(())
        }
        .await;

        if let Err(e) = &result {
            error!(error = %e, frames = self.frames_sent, "narrated capture failed");
        }
        let cleanup = self.teardown(None).await;
        info!(frames = self.frames_sent, "narrated capture stopped");
        result.and(cleanup)
    }

    /// Stream through an unbounded filler encoder until the next segment is
    /// handed over. `None` means the session ended while waiting.
    async fn fill_until_handoff(
        &mut self,
        handoffs: &mut mpsc::Receiver<SegmentHandoff>,
        mut encoder: PipeEncoder,
        cancel: &CancellationToken,
    ) -> StreamResult<Option<SegmentHandoff>> {
        info!("no segment ready, streaming filler");
        let started = Instant::now();

        let waited = match encoder.start() {
            Ok(()) => tokio::select! {
                next = handoffs.recv() => Ok(next),
                pumped = self.pump(&mut encoder, None, cancel) => pumped.map(|_| None),
            },
            Err(e) => Err(e),
        };
        let stopped = encoder.stop().await;

        let next = waited?;
        stopped?;
        info!(
            frames = encoder.frames_written(),
            elapsed_secs = started.elapsed().as_secs_f64(),
            "filler stopped"
        );
        Ok(next)
    }

    async fn play_segment(
        &mut self,
        segment: u64,
        plan: SegmentPlan,
        mut encoder: PipeEncoder,
        cancel: &CancellationToken,
    ) -> StreamResult<()> {
        let started = Instant::now();
        let bound = SegmentBound::new(plan.total_duration, self.fps, started);

        let pumped = match encoder.start() {
            Ok(()) => self.pump(&mut encoder, Some(bound), cancel).await,
            Err(e) => Err(e),
        };
        let stopped = encoder.stop().await;
        if let Some(path) = &plan.narration_audio {
            discard_audio(path).await;
        }

        let end = pumped?;
        stopped?;
        info!(
            segment,
            frames = encoder.frames_written(),
            elapsed_secs = started.elapsed().as_secs_f64(),
            planned_secs = plan.total_duration.as_secs_f64(),
            cancelled = end == PumpEnd::Cancelled,
            "segment streamed"
        );
        Ok(())
    }

    /// Capture, composite and write frames at the target rate.
    ///
    /// A bounded pump ends once the encoder has every frame of the segment.
    /// The encoder timestamps frames by count, so when capture runs slower
    /// than the target rate each frame is repeated until the count catches
    /// up with the wall clock.
    async fn pump(
        &mut self,
        encoder: &mut PipeEncoder,
        bound: Option<SegmentBound>,
        cancel: &CancellationToken,
    ) -> StreamResult<PumpEnd> {
        let started = Instant::now();
        let mut pacer = Pacer::new(self.fps, started);
        let mut written: u64 = 0;

        loop {
            if let Some(bound) = bound {
                if written >= bound.frames {
                    return Ok(PumpEnd::Finished);
                }
                if Instant::now() >= bound.deadline {
                    warn!(written, expected = bound.frames, "segment overran, cutting it short");
                    return Ok(PumpEnd::Finished);
                }
            }

            let frame = tokio::select! {
                _ = cancel.cancelled() => return Ok(PumpEnd::Cancelled),
                frame = self.source.capture_frame() => frame?,
            };
            let frame = self.composite(frame);

            let copies = match bound {
                Some(bound) => frames_due(started.elapsed(), self.fps)
                    .saturating_sub(written)
                    .max(1)
                    .min(bound.frames - written),
                None => 1,
            };
            for _ in 0..copies {
                if let Err(e) = encoder.write_frame(&frame).await {
                    // A bounded encoder may reach its own end just before we do.
                    if bound.is_some() && encoder.state() == &EncoderState::Terminated(Some(0)) {
                        debug!("encoder finished its segment");
                        return Ok(PumpEnd::Finished);
                    }
                    return Err(e);
                }
                written += 1;
                self.frames_sent += 1;
                if self.frames_sent % u64::from(self.fps) == 0 {
                    debug!(
                        frames = self.frames_sent,
                        capture_state = ?self.source.state(),
                        banner = ?self.overlay.as_ref().map(|o| o.state().index()),
                        capture_errors = self.source.consecutive_errors(),
                        reloads = self.source.reloads(),
                        "streaming"
                    );
                }
            }

            let delay = pacer.next_delay(Instant::now());
            tokio::select! {
                _ = cancel.cancelled() => return Ok(PumpEnd::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn composite(&mut self, frame: Frame) -> Frame {
        match self.overlay.as_mut() {
            Some(overlay) => overlay.apply(frame, None),
            None => {
                let mut frame = frame;
                frame.flatten([0, 0, 0]);
                frame
            }
        }
    }

    /// Release the encoder and the renderer. Every step runs; the first
    /// failure is returned.
    async fn teardown(&mut self, encoder: Option<&mut PipeEncoder>) -> StreamResult<()> {
        let mut first: Option<StreamError> = None;

        if let Some(encoder) = encoder {
            if let Err(e) = encoder.stop().await {
                warn!(error = %e, "failed to stop encoder");
                first.get_or_insert(e);
            }
        }

        match tokio::time::timeout(CLOSE_TIMEOUT, self.source.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(error = %e, "failed to close renderer");
                first.get_or_insert(e);
            }
            Err(_) => {
                warn!(timeout = ?CLOSE_TIMEOUT, "renderer did not close in time");
                first.get_or_insert(StreamError::RenderFatal("renderer close timed out".into()));
            }
        }

        first.map_or(Ok(()), Err)
    }
}
