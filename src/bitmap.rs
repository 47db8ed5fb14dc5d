//! RGBA8 bitmaps: canvas layers going in, readback frames coming out.

use std::path::Path;

use crate::error::{Error, Result};

/// Tightly packed RGBA8, top row first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl Bitmap {
    pub fn solid(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        Self {
            width,
            height,
            data: rgba.repeat(width as usize * height as usize),
        }
    }

    pub fn from_rgba(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * 4;
        if data.len() != expected {
            return Err(Error::Image(format!(
                "{}x{} RGBA needs {} bytes, got {}",
                width,
                height,
                expected,
                data.len()
            )));
        }
        Ok(Self { width, height, data })
    }

    /// Decode PNG/JPEG from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let image = image::open(path)
            .map_err(|e| Error::Image(format!("{}: {}", path.display(), e)))?
            .into_rgba8();
        let (width, height) = image.dimensions();
        Self::from_rgba(width, height, image.into_raw())
    }

    pub fn save_png(&self, path: &Path) -> Result<()> {
        image::save_buffer_with_format(
            path,
            &self.data,
            self.width,
            self.height,
            image::ExtendedColorType::Rgba8,
            image::ImageFormat::Png,
        )?;
        Ok(())
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = (y as usize * self.width as usize + x as usize) * 4;
        Some([self.data[i], self.data[i + 1], self.data[i + 2], self.data[i + 3]])
    }

    /// Reverse row order (GL readback is bottom row first).
    pub fn flip_vertical(&mut self) {
        let row = self.width as usize * 4;
        let rows = self.height as usize;
        for y in 0..rows / 2 {
            let (top, bottom) = self.data.split_at_mut((rows - 1 - y) * row);
            top[y * row..(y + 1) * row].swap_with_slice(&mut bottom[..row]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_rgba_checks_length() {
        assert!(Bitmap::from_rgba(2, 2, vec![0; 15]).is_err());
        assert!(Bitmap::from_rgba(2, 2, vec![0; 16]).is_ok());
    }

    #[test]
    fn test_flip_vertical() {
        let mut data = Vec::new();
        for y in 0..3u8 {
            data.extend_from_slice(&[y, y, y, 255, y, y, y, 255]);
        }
        let mut bitmap = Bitmap::from_rgba(2, 3, data).unwrap();
        bitmap.flip_vertical();
        assert_eq!(bitmap.pixel(0, 0), Some([2, 2, 2, 255]));
        assert_eq!(bitmap.pixel(1, 1), Some([1, 1, 1, 255]));
        assert_eq!(bitmap.pixel(1, 2), Some([0, 0, 0, 255]));
    }

    #[test]
    fn test_png_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("solid.png");
        let bitmap = Bitmap::solid(5, 3, [10, 20, 30, 255]);
        bitmap.save_png(&path).unwrap();
        assert_eq!(Bitmap::load(&path).unwrap(), bitmap);
    }

    #[test]
    fn test_pixel_out_of_bounds() {
        assert_eq!(Bitmap::solid(1, 1, [0; 4]).pixel(1, 0), None);
    }
}
