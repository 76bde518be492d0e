//! Owned and borrowed 8-bit grayscale frames.

/// Borrowed view over row-major 8-bit pixel data.
#[derive(Clone, Copy, Debug)]
pub struct GrayView<'a> {
    pub width: usize,
    pub height: usize,
    /// Row-major, `len = width * height`.
    pub data: &'a [u8],
}

/// Owned row-major 8-bit grayscale frame.
#[derive(Clone, Debug)]
pub struct GrayImage {
    pub width: usize,
    pub height: usize,
    pub data: Vec<u8>,
}

impl GrayImage {
    /// Allocate a frame filled with `value`.
    pub fn filled(width: usize, height: usize, value: u8) -> Self {
        Self {
            width,
            height,
            data: vec![value; width * height],
        }
    }

    /// Build a frame by evaluating `f(x, y)` at every pixel.
    pub fn from_fn(width: usize, height: usize, mut f: impl FnMut(usize, usize) -> u8) -> Self {
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        Self {
            width,
            height,
            data,
        }
    }

    /// Borrow the pixel data.
    pub fn view(&self) -> GrayView<'_> {
        GrayView {
            width: self.width,
            height: self.height,
            data: &self.data,
        }
    }
}

#[inline]
fn pixel(src: &GrayView<'_>, x: i64, y: i64) -> u8 {
    if x < 0 || y < 0 || x >= src.width as i64 || y >= src.height as i64 {
        return 0;
    }
    src.data[y as usize * src.width + x as usize]
}

/// Intensity at integer coordinates, zero outside the frame.
#[inline]
pub fn intensity(src: &GrayView<'_>, x: i64, y: i64) -> f64 {
    pixel(src, x, y) as f64
}

/// Bilinearly interpolated intensity at sub-pixel coordinates.
#[inline]
pub fn sample_bilinear(src: &GrayView<'_>, x: f64, y: f64) -> f64 {
    let x0 = x.floor() as i64;
    let y0 = y.floor() as i64;
    let fx = x - x0 as f64;
    let fy = y - y0 as f64;

    let p00 = intensity(src, x0, y0);
    let p10 = intensity(src, x0 + 1, y0);
    let p01 = intensity(src, x0, y0 + 1);
    let p11 = intensity(src, x0 + 1, y0 + 1);

    let a = p00 + fx * (p10 - p00);
    let b = p01 + fx * (p11 - p01);
    a + fy * (b - a)
}

/// Central-difference image gradient at sub-pixel coordinates.
#[inline]
pub fn sample_gradient(src: &GrayView<'_>, x: f64, y: f64) -> (f64, f64) {
    let gx = (sample_bilinear(src, x + 1.0, y) - sample_bilinear(src, x - 1.0, y)) / 2.0;
    let gy = (sample_bilinear(src, x, y + 1.0) - sample_bilinear(src, x, y - 1.0)) / 2.0;
    (gx, gy)
}
