//! Display sink contract
//!
//! Devices that produce a picture implement [`ScanlineSource`]. Pixels are one
//! byte each; what a value means (on/off, grey level, palette index) is up to
//! whoever presents the bitmap.

/// A rendered frame, row-major
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    width: usize,
    height: usize,
    pixels: Vec<u8>,
}

impl Bitmap {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; width * height],
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn pixel(&self, x: usize, y: usize) -> u8 {
        self.pixels[y * self.width + x]
    }

    pub fn row(&self, y: usize) -> &[u8] {
        &self.pixels[y * self.width..(y + 1) * self.width]
    }

    pub fn row_mut(&mut self, y: usize) -> &mut [u8] {
        &mut self.pixels[y * self.width..(y + 1) * self.width]
    }

    /// Number of non-zero pixels
    pub fn lit_count(&self) -> usize {
        self.pixels.iter().filter(|&&p| p != 0).count()
    }
}

pub trait ScanlineSource {
    /// Current picture size in pixels
    fn dimensions(&self) -> (usize, usize);

    /// Render one row. Must not change device state.
    fn render_scanline(&self, y: usize, row: &mut [u8]);

    /// Render a full frame. Advances any per-frame animation state (cursor
    /// blink) once.
    fn render_frame(&mut self) -> Bitmap {
        let (width, height) = self.dimensions();
        let mut bitmap = Bitmap::new(width, height);
        for y in 0..height {
            self.render_scanline(y, bitmap.row_mut(y));
        }
        bitmap
    }
}
