//! Page sizing from the embedded page image.
//!
//! Every page document wraps one scanned page image. The rendered PDF page
//! gets a fixed width and a height that matches the image's aspect ratio,
//! so the image fills the page without letterboxing. When the image can't
//! be inspected (remote `src`, unknown codec, truncated data) the configured
//! portrait ratio is used instead.

use base64::{engine::general_purpose::STANDARD, engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use once_cell::sync::Lazy;
use regex::bytes::Regex;
use std::io::Cursor;
use tracing::debug;

/// Physical page size in inches.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageSize {
    pub width_in: f64,
    pub height_in: f64,
}

impl PageSize {
    pub fn from_aspect(width_in: f64, height_over_width: f64) -> Self {
        Self {
            width_in,
            height_in: width_in * height_over_width,
        }
    }

    /// Width in PDF points (1/72 in).
    pub fn width_pt(&self) -> f64 {
        self.width_in * 72.0
    }

    /// Height in PDF points (1/72 in).
    pub fn height_pt(&self) -> f64 {
        self.height_in * 72.0
    }
}

static DATA_URI_IMAGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)<img\b[^>]*?\bsrc\s*=\s*["']?data:image/[a-z0-9.+-]+;base64,([A-Za-z0-9+/=\s]+)"#)
        .expect("static regex")
});

static IMG_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<img\b[^>]*>").expect("static regex"));

static WIDTH_ATTR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)\bwidth\s*=\s*["']?(\d+)"#).expect("static regex"));

static HEIGHT_ATTR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)\bheight\s*=\s*["']?(\d+)"#).expect("static regex"));

/// Pixel size of the first embedded image.
///
/// Decodes the header of a base64 `data:` image; falls back to explicit
/// `width`/`height` attributes on the first `<img>` tag.
pub fn image_dimensions(html: &[u8]) -> Option<(u32, u32)> {
    if let Some(dims) = data_uri_dimensions(html) {
        return Some(dims);
    }
    attribute_dimensions(html)
}

/// Page size for a page document: fixed width, height from the image ratio.
pub fn page_size_for(html: &[u8], width_in: f64, default_ratio: f64) -> PageSize {
    match image_dimensions(html) {
        Some((w, h)) if w > 0 && h > 0 => PageSize::from_aspect(width_in, h as f64 / w as f64),
        _ => {
            debug!("No usable image size, using default ratio {default_ratio}");
            PageSize::from_aspect(width_in, default_ratio)
        }
    }
}

fn data_uri_dimensions(html: &[u8]) -> Option<(u32, u32)> {
    let caps = DATA_URI_IMAGE.captures(html)?;
    let payload: Vec<u8> = caps
        .get(1)?
        .as_bytes()
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    let bytes = STANDARD
        .decode(&payload)
        .or_else(|_| STANDARD_NO_PAD.decode(&payload))
        .ok()?;

    image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}

fn attribute_dimensions(html: &[u8]) -> Option<(u32, u32)> {
    let tag = IMG_TAG.find(html)?.as_bytes();
    let number = |re: &Regex| -> Option<u32> {
        let m = re.captures(tag)?.get(1)?;
        std::str::from_utf8(m.as_bytes()).ok()?.parse().ok()
    };
    Some((number(&WIDTH_ATTR)?, number(&HEIGHT_ATTR)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, Rgb, RgbImage};

    fn png_data_uri(w: u32, h: u32) -> String {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(w, h, Rgb([200, 200, 200])));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        format!("data:image/png;base64,{}", STANDARD.encode(&buf))
    }

    #[test]
    fn reads_embedded_png_size() {
        let html = format!(r#"<html><body><img class="page" src="{}"></body></html>"#, png_data_uri(60, 90));
        assert_eq!(image_dimensions(html.as_bytes()), Some((60, 90)));
    }

    #[test]
    fn wrapped_base64_is_accepted() {
        let uri = png_data_uri(40, 20);
        let (head, tail) = uri.split_at(uri.len() / 2);
        let html = format!("<img src='{head}\n  {tail}'>");
        assert_eq!(image_dimensions(html.as_bytes()), Some((40, 20)));
    }

    #[test]
    fn page_height_follows_image_ratio() {
        let html = format!(r#"<img src="{}">"#, png_data_uri(100, 150));
        let size = page_size_for(html.as_bytes(), 8.5, 1.3);
        assert_eq!(size.width_in, 8.5);
        assert!((size.height_in - 12.75).abs() < 1e-9);
        assert!((size.width_pt() - 612.0).abs() < 1e-9);
    }

    #[test]
    fn falls_back_to_attributes() {
        let html = br#"<img src="https://cdn.example/p1.jpg" width="800" height="1200">"#;
        assert_eq!(image_dimensions(html), Some((800, 1200)));
    }

    #[test]
    fn unknown_image_uses_default_ratio() {
        let html = br#"<img src="data:image/png;base64,AAAA">"#;
        let size = page_size_for(html, 8.5, 1.5);
        assert!((size.height_in - 12.75).abs() < 1e-9);
    }

    #[test]
    fn no_image_uses_default_ratio() {
        let size = page_size_for(b"<p>text only</p>", 8.0, 1.25);
        assert_eq!(size, PageSize::from_aspect(8.0, 1.25));
    }
}
