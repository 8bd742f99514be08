pub mod browser;
pub mod still;

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use image::RgbaImage;
use livecast_common::config::Config;
use livecast_common::frame::Frame;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::error::{StreamError, StreamResult};

/// Capability interface over whatever produces page pixels.
///
/// The frame source owns all retry and timeout policy; implementations only
/// perform single attempts.
#[async_trait]
pub trait Renderer: Send {
    /// Start navigating to `url`. Bounded by the per-attempt load timeout.
    async fn navigate(&mut self, url: &str) -> StreamResult<()>;

    /// Wait until the navigated page is ready to be captured. Bounded by the
    /// overall page-ready timeout.
    async fn wait_ready(&mut self) -> StreamResult<()>;

    async fn screenshot(&mut self) -> StreamResult<RgbaImage>;

    async fn close(&mut self) -> StreamResult<()>;
}

/// Accept a navigation only if the document came back with a 2xx status.
/// `None` means the page produced no HTTP response at all.
pub fn check_navigation_status(url: &str, status: Option<i64>) -> StreamResult<()> {
    match status {
        Some(code) if (200..300).contains(&code) => Ok(()),
        Some(code) => Err(StreamError::TransientCapture(format!(
            "navigation to {url} returned HTTP {code}"
        ))),
        None => Err(StreamError::TransientCapture(format!(
            "navigation to {url} produced no response"
        ))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Loading,
    Ready,
    Capturing,
    Recovering,
    Fatal,
}

/// Retry and timeout policy for a [`FrameSource`].
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub load_retries: u32,
    pub load_attempt_timeout: Duration,
    pub page_ready_timeout: Duration,
    pub capture_timeout: Duration,
    pub max_consecutive_errors: u32,
    pub retry_delay: Duration,
    pub width: u32,
    pub height: u32,
}

impl CaptureSettings {
    pub fn from_config(config: &Config) -> Self {
        let capture = &config.capture;
        Self {
            load_retries: capture.load_retries.max(1),
            load_attempt_timeout: capture.load_attempt_timeout(),
            page_ready_timeout: capture.page_ready_timeout(),
            capture_timeout: capture.capture_timeout(),
            max_consecutive_errors: capture.max_consecutive_errors.max(1),
            retry_delay: capture.retry_delay(),
            width: config.stream.width,
            height: config.stream.height,
        }
    }
}

#[derive(Debug, Default)]
struct CaptureSession {
    source_url: String,
    consecutive_errors: u32,
    last_success: Option<Instant>,
}

/// Produces frames from a live page, retrying and reloading on failure.
///
/// State machine:
///   Idle → Loading → Ready → Capturing ⇄ Recovering → Ready | Fatal
pub struct FrameSource {
    renderer: Box<dyn Renderer>,
    settings: CaptureSettings,
    session: CaptureSession,
    state: CaptureState,
    seq: u64,
    reloads: u32,
}

impl FrameSource {
    pub fn new(renderer: Box<dyn Renderer>, settings: CaptureSettings) -> Self {
        Self {
            renderer,
            settings,
            session: CaptureSession::default(),
            state: CaptureState::Idle,
            seq: 0,
            reloads: 0,
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.session.consecutive_errors
    }

    /// Number of reloads triggered by repeated capture failures.
    pub fn reloads(&self) -> u32 {
        self.reloads
    }

    /// Load `url` with the configured retry budget.
    pub async fn open(&mut self, url: &str) -> StreamResult<()> {
        self.session = CaptureSession {
            source_url: url.to_string(),
            ..CaptureSession::default()
        };
        self.load().await
    }

    /// Capture the next frame. Transient failures are retried in place and
    /// never surface; only a failed reload does.
    pub async fn capture_frame(&mut self) -> StreamResult<Frame> {
        loop {
            match self.state {
                CaptureState::Fatal => {
                    return Err(StreamError::RenderFatal(format!(
                        "frame source for {} is no longer usable",
                        self.session.source_url
                    )))
                }
                CaptureState::Idle | CaptureState::Loading => {
                    return Err(StreamError::RenderFatal("frame source is not open".into()))
                }
                CaptureState::Ready | CaptureState::Capturing | CaptureState::Recovering => {}
            }

            self.state = CaptureState::Capturing;
            let failure = match timeout(self.settings.capture_timeout, self.renderer.screenshot()).await {
                Ok(Ok(image)) => {
                    self.session.consecutive_errors = 0;
                    self.session.last_success = Some(Instant::now());
                    let seq = self.seq;
                    self.seq += 1;
                    let frame = Frame::new(image, Utc::now().timestamp_millis(), seq)
                        .conform(self.settings.width, self.settings.height);
                    return Ok(frame);
                }
                Ok(Err(e)) => e,
                Err(_) => StreamError::TransientCapture(format!(
                    "screenshot exceeded {:?}",
                    self.settings.capture_timeout
                )),
            };

            self.session.consecutive_errors += 1;
            warn!(
                error = %failure,
                consecutive = self.session.consecutive_errors,
                max = self.settings.max_consecutive_errors,
                "screenshot failed"
            );

            if self.session.consecutive_errors >= self.settings.max_consecutive_errors {
                self.state = CaptureState::Recovering;
                self.reloads += 1;
                warn!(reloads = self.reloads, "too many consecutive capture errors, reloading page");
                self.load().await?;
            }
        }
    }

    pub async fn close(&mut self) -> StreamResult<()> {
        self.state = CaptureState::Idle;
        self.renderer.close().await
    }

    async fn load(&mut self) -> StreamResult<()> {
        self.state = CaptureState::Loading;
        let url = self.session.source_url.clone();
        let attempts = self.settings.load_retries;

        for attempt in 1..=attempts {
            info!(url = %url, attempt, attempts, "loading page");
            match self.load_once(&url).await {
                Ok(()) => {
                    self.session.consecutive_errors = 0;
                    self.state = CaptureState::Ready;
                    info!(url = %url, attempt, "page ready");
                    return Ok(());
                }
                Err(e) => {
                    warn!(error = %e, attempt, attempts, "page load attempt failed");
                    if attempt < attempts {
                        tokio::time::sleep(self.settings.retry_delay).await;
                    }
                }
            }
        }

        self.state = CaptureState::Fatal;
        error!(url = %url, attempts, "page load retries exhausted");
        Err(StreamError::RenderFatal(format!(
            "failed to load {url} after {attempts} attempts"
        )))
    }

    async fn load_once(&mut self, url: &str) -> StreamResult<()> {
        timeout(self.settings.load_attempt_timeout, self.renderer.navigate(url))
            .await
            .map_err(|_| StreamError::TransientCapture("navigation timed out".into()))??;
        debug!(url, "navigation committed");
        timeout(self.settings.page_ready_timeout, self.renderer.wait_ready())
            .await
            .map_err(|_| StreamError::TransientCapture("page never became ready".into()))?
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    pub(crate) enum Shot {
        Ok,
        Fail,
        Hang,
    }

    /// Scripted renderer: each screenshot pops the next outcome, defaulting to success.
    pub(crate) struct FakeRenderer {
        pub shots: VecDeque<Shot>,
        pub shot_delay: Duration,
        pub loads_ok: VecDeque<bool>,
        pub statuses: VecDeque<Option<i64>>,
        pub loads: Arc<AtomicU32>,
        pub closed: Arc<AtomicU32>,
        pub close_fails: bool,
    }

    impl FakeRenderer {
        pub(crate) fn new(shots: Vec<Shot>) -> Self {
            Self {
                shots: shots.into(),
                shot_delay: Duration::ZERO,
                loads_ok: VecDeque::new(),
                statuses: VecDeque::new(),
                loads: Arc::new(AtomicU32::new(0)),
                closed: Arc::new(AtomicU32::new(0)),
                close_fails: false,
            }
        }
    }

    #[async_trait]
    impl Renderer for FakeRenderer {
        async fn navigate(&mut self, url: &str) -> StreamResult<()> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if !self.loads_ok.pop_front().unwrap_or(true) {
                return Err(StreamError::TransientCapture("navigation failed".into()));
            }
            check_navigation_status(url, self.statuses.pop_front().unwrap_or(Some(200)))
        }

        async fn wait_ready(&mut self) -> StreamResult<()> {
            Ok(())
        }

        async fn screenshot(&mut self) -> StreamResult<RgbaImage> {
            if !self.shot_delay.is_zero() {
                tokio::time::sleep(self.shot_delay).await;
            }
            match self.shots.pop_front().unwrap_or(Shot::Ok) {
                Shot::Ok => Ok(RgbaImage::new(4, 4)),
                Shot::Fail => Err(StreamError::TransientCapture("timeout".into())),
                Shot::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(RgbaImage::new(4, 4))
                }
            }
        }

        async fn close(&mut self) -> StreamResult<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            if self.close_fails {
                return Err(StreamError::RenderFatal("browser already gone".into()));
            }
            Ok(())
        }
    }

    pub(crate) fn settings() -> CaptureSettings {
        CaptureSettings {
            load_retries: 3,
            load_attempt_timeout: Duration::from_secs(1),
            page_ready_timeout: Duration::from_secs(1),
            capture_timeout: Duration::from_millis(50),
            max_consecutive_errors: 3,
            retry_delay: Duration::from_millis(1),
            width: 8,
            height: 6,
        }
    }

    #[tokio::test]
    async fn open_then_capture_conforms_frame() {
        let renderer = FakeRenderer::new(vec![]);
        let loads = renderer.loads.clone();
        let mut source = FrameSource::new(Box::new(renderer), settings());
        assert_eq!(source.state(), CaptureState::Idle);

        source.open("https://example.com").await.unwrap();
        assert_eq!(source.state(), CaptureState::Ready);
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        let a = source.capture_frame().await.unwrap();
        let b = source.capture_frame().await.unwrap();
        assert_eq!((a.width(), a.height()), (8, 6));
        assert_eq!((a.seq, b.seq), (0, 1));
        assert!(source.session.last_success.is_some());
    }

    #[tokio::test]
    async fn capture_before_open_is_fatal() {
        let mut source = FrameSource::new(Box::new(FakeRenderer::new(vec![])), settings());
        assert!(matches!(
            source.capture_frame().await,
            Err(StreamError::RenderFatal(_))
        ));
    }

    #[tokio::test]
    async fn transient_errors_retried_in_place() {
        let renderer = FakeRenderer::new(vec![Shot::Fail, Shot::Fail, Shot::Ok]);
        let loads = renderer.loads.clone();
        let mut source = FrameSource::new(Box::new(renderer), settings());
        source.open("https://example.com").await.unwrap();

        source.capture_frame().await.unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 1, "two failures must not reload");
        assert_eq!(source.consecutive_errors(), 0);
        assert_eq!(source.reloads(), 0);
    }

    #[tokio::test]
    async fn three_timeouts_trigger_exactly_one_reload() {
        let renderer = FakeRenderer::new(vec![Shot::Hang, Shot::Hang, Shot::Hang, Shot::Ok]);
        let loads = renderer.loads.clone();
        let mut source = FrameSource::new(Box::new(renderer), settings());
        source.open("https://example.com").await.unwrap();

        source.capture_frame().await.unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 2);
        assert_eq!(source.reloads(), 1);
        assert_eq!(source.consecutive_errors(), 0);
        assert_eq!(source.state(), CaptureState::Capturing);
    }

    #[tokio::test]
    async fn load_retries_then_succeeds() {
        let mut renderer = FakeRenderer::new(vec![]);
        renderer.loads_ok = vec![false, false, true].into();
        let loads = renderer.loads.clone();
        let mut source = FrameSource::new(Box::new(renderer), settings());

        source.open("https://example.com").await.unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 3);
        assert_eq!(source.state(), CaptureState::Ready);
    }

    #[test]
    fn only_success_statuses_accept_navigation() {
        assert!(check_navigation_status("https://example.com", Some(200)).is_ok());
        assert!(check_navigation_status("https://example.com", Some(204)).is_ok());
        for status in [Some(301), Some(404), Some(503), None] {
            let err = check_navigation_status("https://example.com", status).unwrap_err();
            assert!(matches!(err, StreamError::TransientCapture(_)), "{status:?}");
        }
    }

    #[tokio::test]
    async fn error_pages_consume_load_retries() {
        let mut renderer = FakeRenderer::new(vec![]);
        renderer.statuses = vec![Some(502), None, Some(200)].into();
        let loads = renderer.loads.clone();
        let mut source = FrameSource::new(Box::new(renderer), settings());

        source.open("https://example.com").await.unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 3);
        assert_eq!(source.state(), CaptureState::Ready);
    }

    #[tokio::test]
    async fn persistent_error_page_is_fatal() {
        let mut renderer = FakeRenderer::new(vec![]);
        renderer.statuses = vec![Some(404), Some(404), Some(404)].into();
        let mut source = FrameSource::new(Box::new(renderer), settings());

        let err = source.open("https://example.com/missing").await.unwrap_err();
        assert!(matches!(err, StreamError::RenderFatal(_)));
        assert_eq!(source.state(), CaptureState::Fatal);
    }

    #[tokio::test]
    async fn load_exhaustion_is_fatal() {
        let mut renderer = FakeRenderer::new(vec![]);
        renderer.loads_ok = vec![false, false, false].into();
        let mut source = FrameSource::new(Box::new(renderer), settings());

        let err = source.open("https://example.com").await.unwrap_err();
        assert!(matches!(err, StreamError::RenderFatal(_)));
        assert_eq!(source.state(), CaptureState::Fatal);
    }

    #[tokio::test]
    async fn failed_reload_surfaces_and_stays_fatal() {
        let mut renderer = FakeRenderer::new(vec![Shot::Fail, Shot::Fail, Shot::Fail]);
        renderer.loads_ok = vec![true, false, false, false].into();
        let mut source = FrameSource::new(Box::new(renderer), settings());
        source.open("https://example.com").await.unwrap();

        assert!(matches!(
            source.capture_frame().await,
            Err(StreamError::RenderFatal(_))
        ));
        assert_eq!(source.state(), CaptureState::Fatal);
        assert!(source.capture_frame().await.is_err());
    }

    #[tokio::test]
    async fn close_releases_renderer() {
        let renderer = FakeRenderer::new(vec![]);
        let closed = renderer.closed.clone();
        let mut source = FrameSource::new(Box::new(renderer), settings());
        source.open("https://example.com").await.unwrap();
        source.close().await.unwrap();
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(source.state(), CaptureState::Idle);
    }
}
