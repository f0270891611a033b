use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage, RgbaImage};

use crate::config::AssemblyPolicy;
use crate::foundation::error::{MailError, MailResult};
use crate::format::registry::PrintFormat;
use crate::render::engine::RasterImage;

/// One print page: the rendered piece fitted onto the format's full-bleed canvas.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    /// Recipient this page belongs to.
    pub recipient_index: usize,
    /// Target format.
    pub format: PrintFormat,
    /// Opaque RGB pixels, exactly `format.page_px()`.
    pub pixels: RgbImage,
    /// Scale factor applied to the rendered raster (`> 1` means upscaled).
    pub scale: f64,
}

impl Page {
    /// Attach the page to a recipient.
    pub fn for_recipient(mut self, recipient_index: usize) -> Self {
        self.recipient_index = recipient_index;
        self
    }
}

/// Fit `image` onto `format`'s full-bleed canvas.
///
/// The raster is scaled to cover the canvas and centre-cropped. Transparent areas are flattened
/// onto white. An upscale beyond `policy.max_upscale` fails with `ImageTooSmall`, or only warns
/// when `policy.allow_upscale` is set.
pub fn assemble_page(
    image: &RasterImage,
    format: &PrintFormat,
    policy: &AssemblyPolicy,
) -> MailResult<Page> {
    if !image.is_well_formed() {
        return Err(MailError::engine_fault(format!(
            "cannot assemble malformed raster ({}x{}, {} bytes)",
            image.width,
            image.height,
            image.data.len()
        )));
    }
    let (page_w, page_h) = format.page_px();
    let scale = (f64::from(page_w) / f64::from(image.width))
        .max(f64::from(page_h) / f64::from(image.height));

    if scale > policy.max_upscale + 1e-9 {
        let detail = format!(
            "{}x{} raster needs {scale:.3}x upscale for '{}' at {} dpi ({page_w}x{page_h}); limit is {}",
            image.width, image.height, format.name, format.dpi, policy.max_upscale
        );
        if !policy.allow_upscale {
            return Err(MailError::image_too_small(detail));
        }
        tracing::warn!(format = %format.name, scale, "{detail}; upscaling anyway");
    }

    let flat = flatten_onto_white(image)?;
    let fit_w = scaled(image.width, scale).max(page_w);
    let fit_h = scaled(image.height, scale).max(page_h);
    let fitted = if (fit_w, fit_h) == (image.width, image.height) {
        flat
    } else {
        imageops::resize(&flat, fit_w, fit_h, FilterType::CatmullRom)
    };

    let pixels = if (fit_w, fit_h) == (page_w, page_h) {
        fitted
    } else {
        let x = (fit_w - page_w) / 2;
        let y = (fit_h - page_h) / 2;
        imageops::crop_imm(&fitted, x, y, page_w, page_h).to_image()
    };

    Ok(Page {
        recipient_index: 0,
        format: format.clone(),
        pixels,
        scale,
    })
}

fn scaled(len: u32, scale: f64) -> u32 {
    (f64::from(len) * scale).round().max(1.0) as u32
}

fn flatten_onto_white(image: &RasterImage) -> MailResult<RgbImage> {
    let rgba = RgbaImage::from_raw(image.width, image.height, image.data.clone())
        .ok_or_else(|| MailError::engine_fault("raster buffer does not match its dimensions"))?;
    let mut out = RgbImage::new(image.width, image.height);
    for (dst, src) in out.pixels_mut().zip(rgba.pixels()) {
        let [r, g, b, a] = src.0;
        let a = u16::from(a);
        let over = |c: u8| ((u16::from(c) * a + 255 * (255 - a) + 127) / 255) as u8;
        *dst = Rgb([over(r), over(g), over(b)]);
    }
    Ok(out)
}

#[cfg(test)]
#[path = "../../tests/unit/assemble/page.rs"]
mod tests;
