use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use livecast_common::config::NarrationConfig;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{StreamError, StreamResult};

/// Produces narration text for a topic.
#[async_trait]
pub trait NarrationProvider: Send + Sync {
    async fn generate(&self, topic: &str) -> StreamResult<String>;
}

/// Turns narration text into a playable audio file at `output`.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, output: &Path) -> StreamResult<PathBuf>;
}

/// Measures the real playback length of an audio file.
#[async_trait]
pub trait DurationProbe: Send + Sync {
    async fn duration(&self, path: &Path) -> StreamResult<Duration>;
}

/// Plays one segment to completion.
///
/// Implementations own their cancellation: when the session is stopped they
/// must terminate their encoder and return promptly.
#[async_trait]
pub trait SegmentRunner: Send + Sync {
    async fn run_segment(&self, plan: SegmentPlan) -> StreamResult<()>;
}

/// Timing budget for one broadcast slot.
///
/// `filler_duration = max(available_time - narration_duration, 0)` and
/// `total_duration = narration_duration + filler_duration`. Narration that
/// overruns its slot is never truncated; the segment runs long instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentPlan {
    pub available_time: Duration,
    pub narration_audio: Option<PathBuf>,
    pub narration_duration: Duration,
    pub filler_duration: Duration,
    pub total_duration: Duration,
}

impl SegmentPlan {
    pub fn new(available_time: Duration, narration_audio: PathBuf, narration_duration: Duration) -> Self {
        let filler_duration = available_time.saturating_sub(narration_duration);
        Self {
            available_time,
            narration_audio: Some(narration_audio),
            narration_duration,
            filler_duration,
            total_duration: narration_duration + filler_duration,
        }
    }

    /// A background-only segment filling the whole slot.
    pub fn filler_only(available_time: Duration) -> Self {
        Self {
            available_time,
            narration_audio: None,
            narration_duration: Duration::ZERO,
            filler_duration: available_time,
            total_duration: available_time,
        }
    }

    pub fn is_filler_only(&self) -> bool {
        self.narration_audio.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub interval: Duration,
    pub topic: String,
    pub audio_dir: PathBuf,
}

impl SchedulerSettings {
    pub fn from_config(config: &NarrationConfig) -> Self {
        Self {
            interval: config.interval(),
            topic: config.topic.clone(),
            audio_dir: config.audio_dir.clone(),
        }
    }
}

#[derive(Debug)]
struct PreparedNarration {
    path: PathBuf,
    duration: Duration,
}

/// Fits narration of unknown length into fixed broadcast slots.
///
/// Narration for cycle N+1 is generated while cycle N plays; at most one
/// generation task is ever in flight.
pub struct SegmentScheduler {
    narrator: Arc<dyn NarrationProvider>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    probe: Arc<dyn DurationProbe>,
    runner: Arc<dyn SegmentRunner>,
    settings: SchedulerSettings,
}

impl SegmentScheduler {
    pub fn new(
        narrator: Arc<dyn NarrationProvider>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        probe: Arc<dyn DurationProbe>,
        runner: Arc<dyn SegmentRunner>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            narrator,
            synthesizer,
            probe,
            runner,
            settings,
        }
    }

    /// Run cycles until `cancel` fires or a segment fails fatally.
    pub async fn run(&self, cancel: CancellationToken) -> StreamResult<()> {
        info!(
            interval_secs = self.settings.interval.as_secs(),
            topic = %self.settings.topic,
            "segment scheduler started"
        );

        let mut cycle: u64 = 0;
        let mut pending = self.prefetch(cycle);

        let result = loop {
            let cycle_start = Instant::now();
            let prepared = tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                joined = &mut pending => joined.unwrap_or_else(|e| {
                    Err(StreamError::Generation(format!("narration task failed: {e}")))
                }),
            };

            pending = self.prefetch(cycle + 1);

            let overhead = cycle_start.elapsed();
            let available = self.settings.interval.saturating_sub(overhead);
            let plan = match prepared {
                Ok(narration) => SegmentPlan::new(available, narration.path, narration.duration),
                Err(e) => {
                    warn!(cycle, error = %e, "narration unavailable, playing filler-only segment");
                    SegmentPlan::filler_only(available)
                }
            };

            info!(
                cycle,
                available_secs = plan.available_time.as_secs_f64(),
                narration_secs = plan.narration_duration.as_secs_f64(),
                filler_secs = plan.filler_duration.as_secs_f64(),
                total_secs = plan.total_duration.as_secs_f64(),
                filler_only = plan.is_filler_only(),
                "starting segment"
            );

            let outcome = self.runner.run_segment(plan).await;
            if cancel.is_cancelled() {
                break Ok(());
            }
            if let Err(e) = outcome {
                if e.is_fatal() {
                    error!(cycle, error = %e, "segment failed, stopping scheduler");
                    break Err(e);
                }
                warn!(cycle, error = %e, "segment failed");
            }
            cycle += 1;
        };

        pending.abort();
        if let Ok(Ok(unused)) = pending.await {
            discard_audio(&unused.path).await;
        }
        info!(cycles = cycle, "segment scheduler stopped");
        result
    }

    fn prefetch(&self, cycle: u64) -> JoinHandle<StreamResult<PreparedNarration>> {
        let narrator = self.narrator.clone();
        let synthesizer = self.synthesizer.clone();
        let probe = self.probe.clone();
        let topic = self.settings.topic.clone();
        let output = self
            .settings
            .audio_dir
            .join(format!("news_{}_{cycle}.wav", Utc::now().timestamp_millis()));

        tokio::spawn(async move {
            let started = Instant::now();
            debug!(cycle, "generating narration");
            let text = narrator.generate(&topic).await.map_err(as_generation)?;
            let path = synthesizer.synthesize(&text, &output).await.map_err(as_generation)?;
            let duration = match probe.duration(&path).await {
                Ok(d) => d,
                Err(e) => {
                    discard_audio(&path).await;
                    return Err(as_generation(e));
                }
            };
            info!(
                cycle,
                chars = text.len(),
                narration_secs = duration.as_secs_f64(),
                took_secs = started.elapsed().as_secs_f64(),
                "narration ready"
            );
            Ok(PreparedNarration { path, duration })
        })
    }
}

fn as_generation(e: StreamError) -> StreamError {
    match e {
        StreamError::Generation(_) => e,
        other => StreamError::Generation(other.to_string()),
    }
}

/// Delete a narration file that will not be played again.
pub(crate) async fn discard_audio(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "removed narration audio"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove narration audio"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[test]
    fn plan_fills_remaining_slot() {
        let plan = SegmentPlan::new(
            Duration::from_secs(600),
            "news.wav".into(),
            Duration::from_secs(45),
        );
        assert_eq!(plan.filler_duration, Duration::from_secs(555));
        assert_eq!(plan.total_duration, Duration::from_secs(600));
    }

    #[test]
    fn plan_allows_overrun() {
        let plan = SegmentPlan::new(
            Duration::from_secs(300),
            "news.wav".into(),
            Duration::from_secs(340),
        );
        assert_eq!(plan.filler_duration, Duration::ZERO);
        assert_eq!(plan.total_duration, Duration::from_secs(340));
    }

    #[test]
    fn plan_invariants_hold_across_inputs() {
        for available_ms in [0u64, 1, 999, 45_000, 300_000, 600_000] {
            for narration_ms in [0u64, 1, 45_000, 299_999, 340_000, 900_000] {
                let available = Duration::from_millis(available_ms);
                let narration = Duration::from_millis(narration_ms);
                let plan = SegmentPlan::new(available, "n.wav".into(), narration);
                let expected_filler = Duration::from_millis(available_ms.saturating_sub(narration_ms));
                assert_eq!(plan.filler_duration, expected_filler);
                assert_eq!(plan.total_duration, narration + plan.filler_duration);
                assert!(plan.total_duration >= available);
            }
        }
    }

    #[test]
    fn filler_only_plan() {
        let plan = SegmentPlan::filler_only(Duration::from_secs(120));
        assert!(plan.is_filler_only());
        assert_eq!(plan.total_duration, Duration::from_secs(120));
        assert_eq!(plan.narration_duration, Duration::ZERO);
    }

    /// Fails on the listed call indices, hangs on `hang_on`.
    struct ScriptedNarrator {
        calls: AtomicUsize,
        fail_on: Vec<usize>,
        hang_on: Option<usize>,
    }

    impl ScriptedNarrator {
        fn new(fail_on: Vec<usize>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_on,
                hang_on: None,
            }
        }
    }

    #[async_trait]
    impl NarrationProvider for ScriptedNarrator {
        async fn generate(&self, topic: &str) -> StreamResult<String> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang_on == Some(call) {
                std::future::pending::<()>().await;
            }
            if self.fail_on.contains(&call) {
                return Err(StreamError::Spawn {
                    program: "llm".into(),
                    message: "provider unavailable".into(),
                });
            }
            Ok(format!("{topic} #{call}"))
        }
    }

    struct FileSynth;

    #[async_trait]
    impl SpeechSynthesizer for FileSynth {
        async fn synthesize(&self, text: &str, output: &Path) -> StreamResult<PathBuf> {
            tokio::fs::write(output, text).await?;
            Ok(output.to_path_buf())
        }
    }

    struct FixedProbe(Duration);

    #[async_trait]
    impl DurationProbe for FixedProbe {
        async fn duration(&self, _path: &Path) -> StreamResult<Duration> {
            Ok(self.0)
        }
    }

    /// Records plans and cancels the session after `stop_after` segments.
    struct RecordingRunner {
        plans: Mutex<Vec<SegmentPlan>>,
        stop_after: usize,
        cancel: CancellationToken,
        fail_with_fatal: bool,
    }

    impl RecordingRunner {
        fn new(stop_after: usize, cancel: CancellationToken) -> Self {
            Self {
                plans: Mutex::new(Vec::new()),
                stop_after,
                cancel,
                fail_with_fatal: false,
            }
        }

        fn plans(&self) -> Vec<SegmentPlan> {
            self.plans.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SegmentRunner for RecordingRunner {
        async fn run_segment(&self, plan: SegmentPlan) -> StreamResult<()> {
            // Yield so the prefetch task for the next cycle gets to run.
            tokio::time::sleep(Duration::from_millis(20)).await;
            if let Some(path) = &plan.narration_audio {
                let _ = std::fs::remove_file(path);
            }
            let count = {
                let mut plans = self.plans.lock().unwrap();
                plans.push(plan);
                plans.len()
            };
            if self.fail_with_fatal {
                return Err(StreamError::ProcessTerminated {
                    code: Some(1),
                    stderr: "Connection refused".into(),
                });
            }
            if count >= self.stop_after {
                self.cancel.cancel();
            }
            Ok(())
        }
    }

    fn scheduler(
        narrator: Arc<ScriptedNarrator>,
        narration: Duration,
        runner: Arc<RecordingRunner>,
        dir: &Path,
        interval: Duration,
    ) -> SegmentScheduler {
        SegmentScheduler::new(
            narrator,
            Arc::new(FileSynth),
            Arc::new(FixedProbe(narration)),
            runner,
            SchedulerSettings {
                interval,
                topic: "markets".into(),
                audio_dir: dir.to_path_buf(),
            },
        )
    }

    #[tokio::test]
    async fn generation_failure_degrades_to_filler_then_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let narrator = Arc::new(ScriptedNarrator::new(vec![1]));
        let runner = Arc::new(RecordingRunner::new(3, cancel.clone()));
        let interval = Duration::from_secs(600);
        let scheduler = scheduler(narrator, Duration::from_secs(45), runner.clone(), dir.path(), interval);

        scheduler.run(cancel).await.unwrap();

        let plans = runner.plans();
        assert_eq!(plans.len(), 3);
        assert!(!plans[0].is_filler_only());
        assert!(plans[1].is_filler_only());
        assert!(!plans[2].is_filler_only());

        for plan in [&plans[0], &plans[2]] {
            assert_eq!(plan.narration_duration, Duration::from_secs(45));
            assert!(plan.available_time <= interval);
            assert!(plan.available_time > interval - Duration::from_secs(5));
            assert_eq!(plan.total_duration, plan.narration_duration + plan.filler_duration);
            assert_eq!(plan.filler_duration, plan.available_time - Duration::from_secs(45));
        }
        assert_eq!(plans[1].total_duration, plans[1].available_time);
    }

    #[tokio::test]
    async fn overrunning_narration_is_not_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let runner = Arc::new(RecordingRunner::new(1, cancel.clone()));
        let scheduler = scheduler(
            Arc::new(ScriptedNarrator::new(vec![])),
            Duration::from_secs(340),
            runner.clone(),
            dir.path(),
            Duration::from_secs(300),
        );

        scheduler.run(cancel).await.unwrap();

        let plan = &runner.plans()[0];
        assert_eq!(plan.filler_duration, Duration::ZERO);
        assert_eq!(plan.total_duration, Duration::from_secs(340));
    }

    #[tokio::test]
    async fn next_narration_is_prefetched_during_playback() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let narrator = Arc::new(ScriptedNarrator::new(vec![]));
        let runner = Arc::new(RecordingRunner::new(1, cancel.clone()));
        let scheduler = scheduler(
            narrator.clone(),
            Duration::from_secs(10),
            runner.clone(),
            dir.path(),
            Duration::from_secs(60),
        );

        scheduler.run(cancel).await.unwrap();

        // One segment played, yet the narration for the following cycle was
        // already requested, and never more than one ahead.
        assert_eq!(runner.plans().len(), 1);
        assert_eq!(narrator.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fatal_segment_error_stops_scheduler() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let mut runner = RecordingRunner::new(10, cancel.clone());
        runner.fail_with_fatal = true;
        let runner = Arc::new(runner);
        let scheduler = scheduler(
            Arc::new(ScriptedNarrator::new(vec![])),
            Duration::from_secs(10),
            runner.clone(),
            dir.path(),
            Duration::from_secs(60),
        );

        let err = scheduler.run(cancel).await.unwrap_err();
        assert!(matches!(err, StreamError::ProcessTerminated { .. }));
        assert_eq!(runner.plans().len(), 1);
    }

    #[tokio::test]
    async fn cancel_aborts_in_flight_generation() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let mut narrator = ScriptedNarrator::new(vec![]);
        narrator.hang_on = Some(0);
        let runner = Arc::new(RecordingRunner::new(10, cancel.clone()));
        let scheduler = scheduler(
            Arc::new(narrator),
            Duration::from_secs(10),
            runner.clone(),
            dir.path(),
            Duration::from_secs(60),
        );

        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.cancel();
        });

        tokio::time::timeout(Duration::from_secs(5), scheduler.run(cancel))
            .await
            .expect("scheduler must stop promptly")
            .unwrap();
        assert!(runner.plans().is_empty());
    }

    #[tokio::test]
    async fn prefetched_audio_removed_on_stop() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let runner = Arc::new(RecordingRunner::new(1, cancel.clone()));
        let scheduler = scheduler(
            Arc::new(ScriptedNarrator::new(vec![])),
            Duration::from_secs(10),
            runner.clone(),
            dir.path(),
            Duration::from_secs(60),
        );

        scheduler.run(cancel).await.unwrap();

        let leftovers = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 0);
    }
}
