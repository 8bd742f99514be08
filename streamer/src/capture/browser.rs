use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures_util::StreamExt;
use image::RgbaImage;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{check_navigation_status, Renderer};
use crate::error::{StreamError, StreamResult};

const HIDE_OVERFLOW: &str = "document.body.style.overflow = 'hidden'; \
                             document.documentElement.style.overflow = 'hidden'; true";

/// Headless Chromium driven over the DevTools protocol.
pub struct BrowserRenderer {
    browser: Browser,
    handler: JoinHandle<()>,
    page: Page,
}

impl BrowserRenderer {
    /// Launch a headless browser with a fixed `width` x `height` viewport.
    pub async fn launch(width: u32, height: u32, chrome_path: Option<&Path>) -> StreamResult<Self> {
        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .window_size(width, height)
            .viewport(Viewport {
                width,
                height,
                device_scale_factor: Some(1.0),
                emulating_mobile: false,
                is_landscape: true,
                has_touch: false,
            })
            .arg("--disable-dev-shm-usage")
            .arg("--disable-gpu")
            .arg("--hide-scrollbars")
            .arg("--force-device-scale-factor=1");
        if let Some(path) = chrome_path {
            builder = builder.chrome_executable(path);
        }
        let config = builder.build().map_err(StreamError::RenderFatal)?;

        let (browser, mut events) = Browser::launch(config)
            .await
            .map_err(|e| StreamError::RenderFatal(format!("failed to launch browser: {e}")))?;

        // The DevTools connection only makes progress while its event stream is polled.
        let handler = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let Err(e) = event {
                    debug!(error = %e, "browser event error");
                }
            }
            debug!("browser event stream ended");
        });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| StreamError::RenderFatal(format!("failed to open page: {e}")))?;

        info!(width, height, "headless browser launched");
        Ok(Self {
            browser,
            handler,
            page,
        })
    }
}

#[async_trait]
impl Renderer for BrowserRenderer {
    async fn navigate(&mut self, url: &str) -> StreamResult<()> {
        self.page
            .goto(url)
            .await
            .map_err(|e| StreamError::TransientCapture(format!("navigation to {url} failed: {e}")))?;
        let request = self
            .page
            .wait_for_navigation_response()
            .await
            .map_err(|e| StreamError::TransientCapture(format!("navigation to {url} failed: {e}")))?;
        let status = request
            .as_ref()
            .and_then(|request| request.response.as_ref())
            .map(|response| response.status);
        check_navigation_status(url, status)
    }

    async fn wait_ready(&mut self) -> StreamResult<()> {
        loop {
            let state: String = self
                .page
                .evaluate("document.readyState")
                .await
                .map_err(|e| StreamError::TransientCapture(e.to_string()))?
                .into_value()
                .map_err(|e| StreamError::TransientCapture(e.to_string()))?;
            if state == "complete" || state == "interactive" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        if let Err(e) = self.page.evaluate(HIDE_OVERFLOW).await {
            warn!(error = %e, "failed to hide page scrollbars");
        }
        Ok(())
    }

    async fn screenshot(&mut self) -> StreamResult<RgbaImage> {
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .build();
        let png = self
            .page
            .screenshot(params)
            .await
            .map_err(|e| StreamError::TransientCapture(e.to_string()))?;
        let image = image::load_from_memory(&png)
            .map_err(|e| StreamError::TransientCapture(format!("undecodable screenshot: {e}")))?;
        Ok(image.to_rgba8())
    }

    async fn close(&mut self) -> StreamResult<()> {
        let closed = self.browser.close().await;
        if let Err(e) = self.browser.wait().await {
            warn!(error = %e, "failed to reap browser process");
        }
        self.handler.abort();
        closed
            .map(|_| ())
            .map_err(|e| StreamError::RenderFatal(format!("failed to close browser: {e}")))
    }
}
