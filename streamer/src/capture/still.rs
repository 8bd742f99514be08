use std::path::PathBuf;

use async_trait::async_trait;
use image::RgbaImage;
use tracing::info;

use super::Renderer;
use crate::error::{StreamError, StreamResult};

/// Serves a static image file as every frame.
#[derive(Default)]
pub struct StillImageRenderer {
    image: Option<RgbaImage>,
}

impl StillImageRenderer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Renderer for StillImageRenderer {
    async fn navigate(&mut self, url: &str) -> StreamResult<()> {
        let path = PathBuf::from(url.strip_prefix("file://").unwrap_or(url));
        let decoded = tokio::task::spawn_blocking({
            let path = path.clone();
            move || image::open(&path).map(|img| img.to_rgba8())
        })
        .await
        .map_err(|e| StreamError::RenderFatal(format!("image decode task failed: {e}")))?
        .map_err(|e| StreamError::TransientCapture(format!("failed to read {}: {e}", path.display())))?;

        info!(path = %path.display(), width = decoded.width(), height = decoded.height(), "still image loaded");
        self.image = Some(decoded);
        Ok(())
    }

    async fn wait_ready(&mut self) -> StreamResult<()> {
        Ok(())
    }

    async fn screenshot(&mut self) -> StreamResult<RgbaImage> {
        self.image
            .clone()
            .ok_or_else(|| StreamError::TransientCapture("no image loaded".into()))
    }

    async fn close(&mut self) -> StreamResult<()> {
        self.image = None;
        Ok(())
    }
}

/// True when `url` names a local file rather than a web page.
pub fn is_local_image(url: &str) -> bool {
    url.starts_with("file://") || !url.contains("://")
}
