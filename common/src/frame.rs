use image::imageops::FilterType;
use image::RgbaImage;

/// A captured video frame with timestamp metadata.
///
/// Frames are always straight-alpha RGBA8 in memory. Before a frame is handed
/// to the encoder it must be flattened to fully opaque pixels, because the
/// encoder consumes a single opaque picture per frame:
///
///   raw stdin layout = width * height * 4 bytes, row-major, R G B A
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: RgbaImage,
    pub captured_at_ms: i64,
    pub seq: u64,
}

impl Frame {
    pub fn new(image: RgbaImage, captured_at_ms: i64, seq: u64) -> Self {
        Self {
            image,
            captured_at_ms,
            seq,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Resize to the stream resolution if the source produced anything else.
    pub fn conform(mut self, width: u32, height: u32) -> Self {
        if self.image.width() != width || self.image.height() != height {
            self.image = image::imageops::resize(&self.image, width, height, FilterType::Triangle);
        }
        self
    }

    /// Composite every pixel over an opaque background so alpha is 255 everywhere.
    pub fn flatten(&mut self, background: [u8; 3]) {
        for px in self.image.pixels_mut() {
            let a = px.0[3] as u16;
            if a == 255 {
                continue;
            }
            for c in 0..3 {
                let fg = px.0[c] as u16;
                let bg = background[c] as u16;
                px.0[c] = ((fg * a + bg * (255 - a) + 127) / 255) as u8;
            }
            px.0[3] = 255;
        }
    }

    pub fn is_opaque(&self) -> bool {
        self.image.pixels().all(|p| p.0[3] == 255)
    }

    /// Raw RGBA bytes in the layout the encoder reads from its input pipe.
    pub fn as_rgba_bytes(&self) -> &[u8] {
        self.image.as_raw()
    }

    /// Byte size of one raw frame at the given resolution.
    pub fn raw_len(width: u32, height: u32) -> usize {
        width as usize * height as usize * 4
    }
}
