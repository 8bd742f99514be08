use std::path::{Path, PathBuf};
use std::time::Duration;

use fontdue::{Font, FontSettings};
use image::{Rgba, RgbaImage};
use livecast_common::config::OverlayConfig;
use livecast_common::frame::Frame;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Fallback font locations tried when no `font_path` is configured.
const SYSTEM_FONTS: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/System/Library/Fonts/Supplemental/Arial.ttf",
    "C:\\Windows\\Fonts\\arial.ttf",
];

/// Rotation state for the banner message list.
///
/// Rotation is evaluated lazily on every frame instead of on a timer, so the
/// banner can never drift out of step with frame production.
#[derive(Debug, Clone)]
pub struct OverlayState {
    messages: Vec<String>,
    index: usize,
    last_rotation: Instant,
    interval: Duration,
}

impl OverlayState {
    pub fn new(messages: Vec<String>, interval: Duration, now: Instant) -> Self {
        Self {
            messages,
            index: 0,
            last_rotation: now,
            interval,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Returns the message to show at `now`, advancing at most one step.
    pub fn current(&mut self, now: Instant) -> Option<&str> {
        if self.messages.is_empty() {
            return None;
        }
        if now.saturating_duration_since(self.last_rotation) >= self.interval {
            self.index = (self.index + 1) % self.messages.len();
            self.last_rotation = now;
            debug!(index = self.index, "overlay message rotated");
        }
        Some(self.messages[self.index].as_str())
    }
}

/// Draws the bottom banner onto frames.
pub struct OverlayCompositor {
    state: OverlayState,
    fixed_text: Option<String>,
    banner_height: u32,
    font_size: f32,
    background: [u8; 4],
    foreground: [u8; 4],
    font: Option<Font>,
}

impl OverlayCompositor {
    pub fn from_config(config: &OverlayConfig) -> Self {
        let font = load_font(config.font_path.as_deref());
        Self::new(config, font, Instant::now())
    }

    pub fn new(config: &OverlayConfig, font: Option<Font>, now: Instant) -> Self {
        Self {
            state: OverlayState::new(
                config.messages.clone(),
                Duration::from_secs(config.rotation_secs),
                now,
            ),
            fixed_text: config.text.clone(),
            banner_height: config.banner_height,
            font_size: config.font_size,
            background: config.background,
            foreground: config.foreground,
            font,
        }
    }

    pub fn state(&self) -> &OverlayState {
        &self.state
    }

    /// Composite the banner onto `frame`. The returned frame is fully opaque.
    pub fn apply(&mut self, frame: Frame, override_text: Option<&str>) -> Frame {
        self.apply_at(frame, override_text, Instant::now())
    }

    pub fn apply_at(&mut self, mut frame: Frame, override_text: Option<&str>, now: Instant) -> Frame {
        let text = self.select_text(override_text, now);

        let (width, height) = (frame.width(), frame.height());
        let band_height = self.banner_height.min(height);
        let band_top = height - band_height;

        for y in band_top..height {
            for x in 0..width {
                blend(&mut frame.image, x, y, self.background, 255);
            }
        }

        if let (Some(text), Some(font)) = (text.as_deref(), self.font.as_ref()) {
            draw_centered_text(
                &mut frame.image,
                font,
                text,
                self.font_size,
                self.foreground,
                band_top,
                band_height,
            );
        }

        frame.flatten([0, 0, 0]);
        frame
    }

    fn select_text(&mut self, override_text: Option<&str>, now: Instant) -> Option<String> {
        if let Some(text) = override_text {
            return Some(text.to_string());
        }
        if let Some(text) = &self.fixed_text {
            return Some(text.clone());
        }
        self.state.current(now).map(str::to_string)
    }
}

/// Load the configured font, falling back to common system fonts.
pub fn load_font(configured: Option<&Path>) -> Option<Font> {
    let candidates: Vec<PathBuf> = configured
        .map(Path::to_path_buf)
        .into_iter()
        .chain(SYSTEM_FONTS.iter().map(PathBuf::from))
        .collect();

    for path in candidates {
        let Ok(bytes) = std::fs::read(&path) else {
            continue;
        };
        match Font::from_bytes(bytes, FontSettings::default()) {
            Ok(font) => {
                info!(path = %path.display(), "overlay font loaded");
                return Some(font);
            }
            Err(e) => warn!(path = %path.display(), error = e, "failed to parse font"),
        }
    }
    warn!("no usable font found; banner will be drawn without text");
    None
}

/// Measured horizontal extent of `text` and the line's ascent/descent.
fn measure(font: &Font, text: &str, px: f32) -> (f32, f32, f32) {
    let width = text.chars().map(|c| font.metrics(c, px).advance_width).sum();
    let (ascent, descent) = font
        .horizontal_line_metrics(px)
        .map(|m| (m.ascent, m.descent))
        .unwrap_or((px * 0.8, -px * 0.2));
    (width, ascent, descent)
}

/// Pen start and baseline that centre a `text_width` wide line, whose
/// ascent/descent straddle the baseline, inside the band.
fn text_origin(
    image_width: u32,
    band_top: u32,
    band_height: u32,
    text_width: f32,
    ascent: f32,
    descent: f32,
) -> (f32, f32) {
    let pen_x = (image_width as f32 - text_width) / 2.0;
    let baseline = band_top as f32 + (band_height as f32 - (ascent - descent)) / 2.0 + ascent;
    (pen_x, baseline)
}

fn draw_centered_text(
    image: &mut RgbaImage,
    font: &Font,
    text: &str,
    px: f32,
    color: [u8; 4],
    band_top: u32,
    band_height: u32,
) {
    let (text_width, ascent, descent) = measure(font, text, px);
    let (mut pen_x, baseline) =
        text_origin(image.width(), band_top, band_height, text_width, ascent, descent);

    for c in text.chars() {
        let (metrics, coverage) = font.rasterize(c, px);
        let left = (pen_x + metrics.xmin as f32).round() as i64;
        let top = (baseline - metrics.ymin as f32 - metrics.height as f32).round() as i64;

        for gy in 0..metrics.height {
            for gx in 0..metrics.width {
                let cov = coverage[gy * metrics.width + gx];
                if cov == 0 {
                    continue;
                }
                let x = left + gx as i64;
                let y = top + gy as i64;
                if x < 0 || y < 0 || x >= image.width() as i64 || y >= image.height() as i64 {
                    continue;
                }
                blend(image, x as u32, y as u32, color, cov);
            }
        }
        pen_x += metrics.advance_width;
    }
}

/// Source-over blend of `color` (scaled by `coverage`) onto one pixel.
fn blend(image: &mut RgbaImage, x: u32, y: u32, color: [u8; 4], coverage: u8) {
    let src_a = color[3] as u32 * coverage as u32 / 255;
    if src_a == 0 {
        return;
    }
    let Rgba(dst) = *image.get_pixel(x, y);
    let dst_a = dst[3] as u32;
    let inv = 255 - src_a;
    let out_a = src_a + dst_a * inv / 255;

    let mut out = [0u8; 4];
    for c in 0..3 {
        let premul = color[c] as u32 * src_a + dst[c] as u32 * dst_a * inv / 255;
        out[c] = if out_a == 0 { 0 } else { (premul / out_a).min(255) as u8 };
    }
    out[3] = out_a.min(255) as u8;
    image.put_pixel(x, y, Rgba(out));
}
