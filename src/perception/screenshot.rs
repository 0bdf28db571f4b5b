use base64::Engine as _;
use chrono::{DateTime, Utc};

use crate::errors::{PilotError, PilotResult};

/// A PNG-encoded capture of the primary display.
#[derive(Debug, Clone)]
pub struct Screenshot {
    pub png_bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub captured_at: DateTime<Utc>,
}

impl Screenshot {
    pub fn from_rgba(image: &image::RgbaImage) -> PilotResult<Self> {
        let mut png_bytes = Vec::new();
        image
            .write_to(&mut std::io::Cursor::new(&mut png_bytes), image::ImageFormat::Png)
            .map_err(|e| PilotError::Perception(format!("PNG encode: {e}")))?;
        Ok(Self {
            png_bytes,
            width: image.width(),
            height: image.height(),
            captured_at: Utc::now(),
        })
    }

    /// Solid grey frame, handy where no display is attached.
    pub fn blank(width: u32, height: u32) -> PilotResult<Self> {
        let img = image::RgbaImage::from_pixel(width, height, image::Rgba([40, 40, 40, 255]));
        Self::from_rgba(&img)
    }

    pub fn decode(&self) -> PilotResult<image::RgbaImage> {
        let img = image::load_from_memory(&self.png_bytes)
            .map_err(|e| PilotError::Perception(format!("screenshot decode: {e}")))?;
        Ok(img.to_rgba8())
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.png_bytes)
    }

    pub fn data_url(&self) -> String {
        format!("data:image/png;base64,{}", self.to_base64())
    }
}

#[cfg(feature = "desktop")]
pub use desktop::XcapCapture;

#[cfg(feature = "desktop")]
mod desktop {
    use async_trait::async_trait;

    use super::Screenshot;
    use crate::errors::{PilotError, PilotResult};
    use crate::perception::traits::ScreenCapture;

    /// Captures the primary monitor through `xcap`.
    #[derive(Debug, Default)]
    pub struct XcapCapture;

    fn capture_primary_sync() -> PilotResult<Screenshot> {
        let monitors = xcap::Monitor::all()
            .map_err(|e| PilotError::Perception(format!("list monitors: {e}")))?;
        let monitor = monitors
            .iter()
            .find(|m| m.is_primary())
            .or_else(|| monitors.first())
            .ok_or_else(|| PilotError::Perception("no monitor found".into()))?;
        let image = monitor
            .capture_image()
            .map_err(|e| PilotError::Perception(format!("capture: {e}")))?;
        tracing::debug!(width = image.width(), height = image.height(), "screen captured");
        Screenshot::from_rgba(&image)
    }

    #[async_trait]
    impl ScreenCapture for XcapCapture {
        async fn capture(&self) -> PilotResult<Screenshot> {
            tokio::task::spawn_blocking(capture_primary_sync)
                .await
                .map_err(|e| PilotError::Perception(format!("join: {e}")))?
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_frame_round_trips_through_png() {
        let shot = Screenshot::blank(32, 16).unwrap();
        assert_eq!(shot.size(), (32, 16));
        let img = shot.decode().unwrap();
        assert_eq!(img.dimensions(), (32, 16));
        assert!(shot.data_url().starts_with("data:image/png;base64,"));
    }
}
