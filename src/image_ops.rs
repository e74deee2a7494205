use image::imageops::{resize, FilterType};
use image::{GrayImage, Luma};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};
use imageproc::point::Point;

use crate::geometry::{distance, order_points};

pub const WHITE: Luma<u8> = Luma([u8::MAX]);

/// Resizes to exact dimensions.
pub fn resize_to(img: &GrayImage, width: u32, height: u32) -> GrayImage {
    if img.dimensions() == (width, height) {
        return img.clone();
    }
    resize(img, width, height, FilterType::Triangle)
}

/// Resizes to a target width, preserving aspect ratio.
pub fn resize_to_width(img: &GrayImage, width: u32) -> GrayImage {
    let (w, h) = img.dimensions();
    let height = ((h as u64 * width as u64) / w as u64).max(1) as u32;
    resize_to(img, width, height)
}

/// Resizes to a target height, preserving aspect ratio.
pub fn resize_to_height(img: &GrayImage, height: u32) -> GrayImage {
    let (w, h) = img.dimensions();
    let width = ((w as u64 * height as u64) / h as u64).max(1) as u32;
    resize_to(img, width, height)
}

/// Min-max normalization: linearly stretches the intensity range to
/// [0, 255]. A flat image is returned unchanged.
pub fn normalize(img: &GrayImage) -> GrayImage {
    let mut min = u8::MAX;
    let mut max = u8::MIN;
    for Luma([v]) in img.pixels() {
        min = min.min(*v);
        max = max.max(*v);
    }
    if max <= min {
        return img.clone();
    }

    let range = (max - min) as f32;
    map_pixels(img, |v| (((v - min) as f32 / range) * 255.0).round() as u8)
}

/// Clamps every pixel above `level` down to `level` (truncating threshold).
pub fn truncate_at(img: &GrayImage, level: u8) -> GrayImage {
    map_pixels(img, |v| v.min(level))
}

/// Binarizes: pixels strictly above `level` become white, the rest black.
pub fn binarize(img: &GrayImage, level: u8) -> GrayImage {
    map_pixels(img, |v| if v > level { 255 } else { 0 })
}

pub fn invert(img: &GrayImage) -> GrayImage {
    map_pixels(img, |v| 255 - v)
}

/// Gamma remap via lookup table; `gamma` below 1 darkens midtones.
pub fn adjust_gamma(img: &GrayImage, gamma: f64) -> GrayImage {
    let lut = gamma_lut(gamma);
    map_pixels(img, |v| lut[v as usize])
}

fn gamma_lut(gamma: f64) -> [u8; 256] {
    let inv_gamma = 1.0 / gamma;
    let mut lut = [0u8; 256];
    for (i, entry) in lut.iter_mut().enumerate() {
        *entry = ((i as f64 / 255.0).powf(inv_gamma) * 255.0).round().clamp(0.0, 255.0) as u8;
    }
    lut
}

fn map_pixels(img: &GrayImage, f: impl Fn(u8) -> u8) -> GrayImage {
    let mut out = img.clone();
    for Luma([v]) in out.pixels_mut() {
        *v = f(*v);
    }
    out
}

/// Grayscale erosion with a rectangular kernel: each pixel becomes the
/// minimum over a kernel_w x kernel_h window centered on it. Done as two
/// separable 1-D passes.
pub fn erode_rect(img: &GrayImage, kernel_w: u32, kernel_h: u32) -> GrayImage {
    let horizontal = directional_extremum(img, kernel_w, true, u8::min, u8::MAX);
    directional_extremum(&horizontal, kernel_h, false, u8::min, u8::MAX)
}

/// Grayscale dilation with a rectangular kernel (windowed maximum).
pub fn dilate_rect(img: &GrayImage, kernel_w: u32, kernel_h: u32) -> GrayImage {
    let horizontal = directional_extremum(img, kernel_w, true, u8::max, u8::MIN);
    directional_extremum(&horizontal, kernel_h, false, u8::max, u8::MIN)
}

/// Morphological opening (erode then dilate), repeated `iterations` times.
/// A tall thin kernel keeps only vertical structure such as column rules.
pub fn open_rect(img: &GrayImage, kernel_w: u32, kernel_h: u32, iterations: u32) -> GrayImage {
    let mut out = img.clone();
    for _ in 0..iterations {
        out = dilate_rect(&erode_rect(&out, kernel_w, kernel_h), kernel_w, kernel_h);
    }
    out
}

/// Morphological closing (dilate then erode).
pub fn close_rect(img: &GrayImage, kernel_w: u32, kernel_h: u32) -> GrayImage {
    erode_rect(&dilate_rect(img, kernel_w, kernel_h), kernel_w, kernel_h)
}

fn directional_extremum(
    img: &GrayImage,
    kernel: u32,
    horizontal: bool,
    pick: fn(u8, u8) -> u8,
    identity: u8,
) -> GrayImage {
    if kernel <= 1 {
        return img.clone();
    }

    let (width, height) = img.dimensions();
    let mut out = GrayImage::new(width, height);
    let reach_back = (kernel / 2) as i64;
    let reach_forward = ((kernel - 1) / 2) as i64;

    for y in 0..height {
        for x in 0..width {
            let (cx, cy) = (x as i64, y as i64);
            let mut value = identity;
            for offset in -reach_back..=reach_forward {
                let (sx, sy) = if horizontal {
                    (cx + offset, cy)
                } else {
                    (cx, cy + offset)
                };
                if sx < 0 || sy < 0 || sx >= width as i64 || sy >= height as i64 {
                    continue;
                }
                value = pick(value, img.get_pixel(sx as u32, sy as u32).0[0]);
            }
            out.put_pixel(x, y, Luma([value]));
        }
    }

    out
}

/// Mean intensity over a region clipped to the image bounds. Returns
/// `None` when nothing of the region is inside the image.
pub fn region_mean(img: &GrayImage, x: i64, y: i64, width: u32, height: u32) -> Option<f64> {
    let (img_w, img_h) = (img.width() as i64, img.height() as i64);
    let x0 = x.max(0);
    let y0 = y.max(0);
    let x1 = (x + width as i64).min(img_w);
    let y1 = (y + height as i64).min(img_h);
    if x0 >= x1 || y0 >= y1 {
        return None;
    }

    let mut sum = 0u64;
    for sy in y0..y1 {
        for sx in x0..x1 {
            sum += img.get_pixel(sx as u32, sy as u32).0[0] as u64;
        }
    }
    Some(sum as f64 / ((x1 - x0) * (y1 - y0)) as f64)
}

/// Perspective-crops the quadrilateral spanned by `corners` (any order)
/// into an axis-aligned image sized to the quad's larger edge pair.
/// Returns `None` when the corners are degenerate.
pub fn four_point_transform(img: &GrayImage, corners: &[Point<f32>; 4]) -> Option<GrayImage> {
    let [tl, tr, br, bl] = order_points(corners);

    let max_width = distance(br, bl).max(distance(tr, tl)).floor().max(1.0) as u32;
    let max_height = distance(tr, br).max(distance(tl, bl)).floor().max(1.0) as u32;

    let projection = Projection::from_control_points(
        [(tl.x, tl.y), (tr.x, tr.y), (br.x, br.y), (bl.x, bl.y)],
        [
            (0.0, 0.0),
            ((max_width - 1) as f32, 0.0),
            ((max_width - 1) as f32, (max_height - 1) as f32),
            (0.0, (max_height - 1) as f32),
        ],
    )?;

    let mut out = GrayImage::new(max_width, max_height);
    warp_into(img, &projection, Interpolation::Bilinear, WHITE, &mut out);
    Some(out)
}
