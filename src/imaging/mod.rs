//! Image transform pipeline.
//!
//! Every eligible image goes through the same steps: decode, flatten onto
//! white, fit to the screen (never upscaling), optionally rotate and split
//! into screen-height pages, and encode as baseline JPEG.

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};

use crate::config::ConversionConfig;
use crate::error::ImageError;

pub const JPEG_MEDIA_TYPE: &str = "image/jpeg";

const WHITE: Rgb<u8> = Rgb([255, 255, 255]);

/// Raster types the pipeline converts.
const CONVERTIBLE: [&str; 6] = [
    "image/png",
    "image/gif",
    "image/webp",
    "image/bmp",
    "image/jpeg",
    "image/jpg",
];

pub fn is_convertible(media_type: &str) -> bool {
    let media_type = media_type.to_ascii_lowercase();
    CONVERTIBLE.contains(&media_type.as_str())
}

pub fn is_svg(media_type: &str) -> bool {
    media_type.eq_ignore_ascii_case("image/svg+xml")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransformOptions {
    /// 1..=95
    pub jpeg_quality: u8,
    pub light_novel_mode: bool,
    pub screen_width: u32,
    pub screen_height: u32,
    /// Share of page height repeated at the top of the next split page.
    pub overlap_percent: u32,
}

impl TransformOptions {
    pub fn from_config(config: &ConversionConfig) -> Self {
        Self {
            jpeg_quality: config.jpeg_quality.clamp(1, 95),
            light_novel_mode: config.light_novel_mode,
            screen_width: config.screen_width.max(1),
            screen_height: config.screen_height.max(1),
            overlap_percent: config.split_overlap_percent.min(99),
        }
    }
}

impl Default for TransformOptions {
    fn default() -> Self {
        Self::from_config(&ConversionConfig::default())
    }
}

/// Output of a successful transform.
#[derive(Debug, Clone)]
pub struct TransformedImage {
    /// JPEG pages in reading order. Exactly one unless the image was split.
    pub pages: Vec<Vec<u8>>,
    pub source_width: u32,
    pub source_height: u32,
}

impl TransformedImage {
    pub fn is_split(&self) -> bool {
        self.pages.len() > 1
    }

    pub fn encoded_len(&self) -> usize {
        self.pages.iter().map(Vec::len).sum()
    }
}

/// Run the pipeline on one image.
pub fn transform(
    bytes: &[u8],
    media_type: &str,
    options: &TransformOptions,
) -> Result<TransformedImage, ImageError> {
    let format = declared_format(media_type)?;
    let decoded = image::load_from_memory_with_format(bytes, format)
        .map_err(|e| ImageError::Decode(e.to_string()))?;
    let (source_width, source_height) = (decoded.width(), decoded.height());
    if source_width == 0 || source_height == 0 {
        return Err(ImageError::Decode("image has no pixels".to_string()));
    }

    let rgb = flatten(decoded);

    let pages = if options.light_novel_mode && source_width > source_height {
        let rotated = imageops::rotate90(&rgb);
        let fitted = fit_width(rotated, options.screen_width);
        split_pages(&fitted, options.screen_height, options.overlap_percent)
    } else {
        vec![fit_within(rgb, options.screen_width, options.screen_height)]
    };

    let pages = pages
        .iter()
        .map(|page| encode_baseline_jpeg(page, options.jpeg_quality))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(TransformedImage {
        pages,
        source_width,
        source_height,
    })
}

fn declared_format(media_type: &str) -> Result<ImageFormat, ImageError> {
    let normalized = media_type.trim().to_ascii_lowercase();
    let normalized = if normalized == "image/jpg" {
        JPEG_MEDIA_TYPE.to_string()
    } else {
        normalized
    };
    if !is_convertible(&normalized) {
        return Err(ImageError::Unsupported(media_type.to_string()));
    }
    ImageFormat::from_mime_type(&normalized)
        .ok_or_else(|| ImageError::Unsupported(media_type.to_string()))
}

/// Drop alpha by compositing onto white.
fn flatten(image: DynamicImage) -> RgbImage {
    if !image.color().has_alpha() {
        return image.to_rgb8();
    }
    let rgba = image.to_rgba8();
    let mut out = RgbImage::new(rgba.width(), rgba.height());
    for (dst, src) in out.pixels_mut().zip(rgba.pixels()) {
        let alpha = src[3] as u32;
        for c in 0..3 {
            let blended = (src[c] as u32 * alpha + 255 * (255 - alpha) + 127) / 255;
            dst[c] = blended as u8;
        }
    }
    out
}

/// Target size for fitting `w`x`h` inside `max_w`x`max_h` without upscaling.
pub fn fitted_size(w: u32, h: u32, max_w: u32, max_h: u32) -> (u32, u32) {
    if w <= max_w && h <= max_h {
        return (w, h);
    }
    let scale = f64::min(max_w as f64 / w as f64, max_h as f64 / h as f64);
    let new_w = ((w as f64 * scale).floor() as u32).clamp(1, max_w);
    let new_h = ((h as f64 * scale).floor() as u32).clamp(1, max_h);
    (new_w, new_h)
}

fn fit_within(image: RgbImage, max_w: u32, max_h: u32) -> RgbImage {
    let (w, h) = image.dimensions();
    let (new_w, new_h) = fitted_size(w, h, max_w, max_h);
    if (new_w, new_h) == (w, h) {
        image
    } else {
        imageops::resize(&image, new_w, new_h, FilterType::Lanczos3)
    }
}

fn fit_width(image: RgbImage, max_w: u32) -> RgbImage {
    let (w, h) = image.dimensions();
    if w <= max_w {
        return image;
    }
    let new_h = ((h as f64 * max_w as f64 / w as f64).round() as u32).max(1);
    imageops::resize(&image, max_w, new_h, FilterType::Lanczos3)
}

/// Cut a tall image into pages exactly `page_height` rows tall.
///
/// Consecutive pages share `round(overlap_percent% of page_height)` rows.
/// The last page is padded with white. An image no taller than a page is
/// returned as a single page at its own height.
pub fn split_pages(image: &RgbImage, page_height: u32, overlap_percent: u32) -> Vec<RgbImage> {
    let (width, height) = image.dimensions();
    let page_height = page_height.max(1);
    if height <= page_height {
        return vec![image.clone()];
    }

    let overlap = ((page_height as f64 * overlap_percent.min(99) as f64) / 100.0).round() as u32;
    let step = page_height.saturating_sub(overlap).max(1);

    let mut pages = Vec::new();
    let mut top = 0u32;
    loop {
        let rows = page_height.min(height - top);
        let mut page = RgbImage::from_pixel(width, page_height, WHITE);
        let strip = imageops::crop_imm(image, 0, top, width, rows).to_image();
        imageops::replace(&mut page, &strip, 0, 0);
        pages.push(page);

        if top + page_height >= height {
            break;
        }
        top += step;
    }
    pages
}

/// Encode as baseline (non-progressive) JPEG.
pub fn encode_baseline_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, ImageError> {
    let mut buf = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 95))
        .encode_image(image)
        .map_err(|e| ImageError::Encode(e.to_string()))?;
    Ok(buf.into_inner())
}
