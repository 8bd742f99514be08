mod capture;
mod encoder;
mod error;
mod narration;
mod overlay;
mod pipeline;
mod scheduler;

use std::path::PathBuf;
use std::sync::Arc;

use capture::browser::BrowserRenderer;
use capture::still::{is_local_image, StillImageRenderer};
use capture::{CaptureSettings, FrameSource, Renderer};
use encoder::command::EncoderSettings;
use encoder::pipe::PipeEncoder;
use encoder::probe::FfmpegProbe;
use encoder::segment::SegmentEncoder;
use error::{StreamError, StreamResult};
use livecast_common::config::{Config, ConfigError, StreamMode};
use livecast_common::endpoint::BroadcastEndpoint;
use narration::{CommandNarrator, CommandSynthesizer};
use overlay::OverlayCompositor;
use pipeline::{segment_handoff, CaptureDriver};
use scheduler::{SchedulerSettings, SegmentRunner, SegmentScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    info!(
        mode = ?config.stream.mode,
        url = config.stream.url.as_deref().unwrap_or("-"),
        fps = config.stream.fps,
        width = config.stream.width,
        height = config.stream.height,
        video_bitrate = config.encoder.video_bitrate,
        platform = ?config.broadcast.platform,
        "starting livecast streamer"
    );

    // Fail fast before any browser or encoder process is spawned.
    let endpoint = match config
        .validate()
        .and_then(|()| BroadcastEndpoint::from_config(&config.broadcast))
    {
        Ok(endpoint) => endpoint,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };
    info!(endpoint = %endpoint, "broadcast endpoint resolved");

    encoder::check_ffmpeg_available(&config.encoder.ffmpeg_path).await;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("interrupt received, stopping stream");
                    cancel.cancel();
                }
                Err(e) => error!(error = %e, "failed to listen for interrupt"),
            }
        }
    });

    let masker = endpoint.clone();
    let result = match config.stream.mode {
        StreamMode::Capture => run_capture(&config, endpoint, &cancel).await,
        StreamMode::Segments => run_segments(&config, endpoint, &cancel).await,
        StreamMode::CaptureNarrated => run_capture_narrated(&config, endpoint, &cancel).await,
    };

    match result {
        Ok(()) => info!("stream stopped"),
        Err(e) => {
            error!(error = %masker.mask(&e.to_string()), "stream failed");
            std::process::exit(1);
        }
    }
}

// ============================================================================
// Run modes
// ============================================================================

/// Browser capture into one long-running encoder.
async fn run_capture(
    config: &Config,
    endpoint: BroadcastEndpoint,
    cancel: &CancellationToken,
) -> StreamResult<()> {
    let url = capture_url(config)?;
    let mut driver = capture_driver(config, open_renderer(config, &url).await?);
    let settings = EncoderSettings::from_config(config);
    let encoder = PipeEncoder::for_session(&settings, &endpoint, None, None);
    driver.run_continuous(&url, encoder, cancel).await
}

/// Still image plus scheduled narration, one bounded encode per segment.
async fn run_segments(
    config: &Config,
    endpoint: BroadcastEndpoint,
    cancel: &CancellationToken,
) -> StreamResult<()> {
    let encoder = SegmentEncoder::new(
        EncoderSettings::from_config(config),
        endpoint,
        config.stream.image.clone(),
        cancel.clone(),
    );
    let scheduler = narration_scheduler(config, Arc::new(encoder)).await?;
    scheduler.run(cancel.clone()).await
}

/// Browser capture with a fresh encoder per narration segment.
async fn run_capture_narrated(
    config: &Config,
    endpoint: BroadcastEndpoint,
    cancel: &CancellationToken,
) -> StreamResult<()> {
    let url = capture_url(config)?;
    let (runner, handoffs) = segment_handoff();
    let scheduler = narration_scheduler(config, Arc::new(runner)).await?;
    let mut driver = capture_driver(config, open_renderer(config, &url).await?);
    let settings = EncoderSettings::from_config(config);

    // Either side ending stops the other.
    let session = cancel.child_token();
    let schedule = async {
        let result = scheduler.run(session.clone()).await;
        session.cancel();
        result
    };
    let drive = async {
        let result = driver
            .run_segments(
                &url,
                handoffs,
                |plan| match plan {
                    Some(plan) => PipeEncoder::for_session(
                        &settings,
                        &endpoint,
                        plan.narration_audio.as_deref(),
                        Some(plan.total_duration),
                    ),
                    None => PipeEncoder::for_session(&settings, &endpoint, None, None),
                },
                &session,
            )
            .await;
        session.cancel();
        result
    };

    let (scheduled, driven) = tokio::join!(schedule, drive);
    driven.and(scheduled)
}

// ============================================================================
// Wiring
// ============================================================================

fn capture_url(config: &Config) -> StreamResult<String> {
    config.stream.url.clone().ok_or_else(|| {
        StreamError::from(ConfigError::Invalid(
            "stream.url is required for capture modes".into(),
        ))
    })
}

async fn open_renderer(config: &Config, url: &str) -> StreamResult<Box<dyn Renderer>> {
    if is_local_image(url) {
        info!(url, "serving local image as frame source");
        return Ok(Box::new(StillImageRenderer::new()));
    }
    let browser = BrowserRenderer::launch(
        config.stream.width,
        config.stream.height,
        config.capture.chrome_path.as_deref(),
    )
    .await?;
    Ok(Box::new(browser))
}

fn capture_driver(config: &Config, renderer: Box<dyn Renderer>) -> CaptureDriver {
    let source = FrameSource::new(renderer, CaptureSettings::from_config(config));
    let overlay = config
        .overlay
        .enabled
        .then(|| OverlayCompositor::from_config(&config.overlay));
    CaptureDriver::new(source, overlay, config.stream.fps)
}

async fn narration_scheduler(
    config: &Config,
    runner: Arc<dyn SegmentRunner>,
) -> StreamResult<SegmentScheduler> {
    let narration = &config.narration;
    tokio::fs::create_dir_all(&narration.audio_dir).await?;

    let missing = |key: &str| {
        StreamError::from(ConfigError::Invalid(format!(
            "narration.{key} is required for narrated modes"
        )))
    };
    let generate = narration
        .generate_command
        .as_deref()
        .ok_or_else(|| missing("generate_command"))?;
    let synthesize = narration
        .synthesize_command
        .as_deref()
        .ok_or_else(|| missing("synthesize_command"))?;

    Ok(SegmentScheduler::new(
        Arc::new(CommandNarrator::new(generate)?),
        Arc::new(CommandSynthesizer::new(synthesize)?),
        Arc::new(FfmpegProbe::new(config.encoder.ffmpeg_path.clone())),
        runner,
        SchedulerSettings::from_config(narration),
    ))
}
