//! Opaque-pixel envelopes of decoded images.

use crate::config::{PipelineConfig, TransparentPolicy};
use crate::error::{AtlasPipelineError, Result};
use crate::model::{Rect, Resource, ResourceGeometry, ResourceId};
use image::RgbaImage;

/// Computes the tightest box holding every pixel whose alpha exceeds `threshold`.
///
/// `pixels` is a tightly packed RGBA8 buffer of `width * height` pixels. Each edge is
/// found by its own directional scan that stops at the first opaque pixel. Returns
/// `None` when the image has no opaque pixel at all.
///
/// # Panics
/// If `pixels` holds fewer than `width * height * 4` bytes.
pub fn scan_opaque_bounds(pixels: &[u8], width: u32, height: u32, threshold: u8) -> Option<Rect> {
    let (w, h) = (width as usize, height as usize);
    assert!(
        pixels.len() >= w * h * 4,
        "RGBA buffer of {} bytes is too small for {}x{}",
        pixels.len(),
        width,
        height
    );
    let opaque = |x: usize, y: usize| pixels[(y * w + x) * 4 + 3] > threshold;

    // left to right
    let left = (0..w).find(|&x| (0..h).any(|y| opaque(x, y)))?;
    // right to left
    let right = (0..w).rev().find(|&x| (0..h).any(|y| opaque(x, y)))? + 1;
    // top to bottom
    let top = (0..h).find(|&y| (0..w).any(|x| opaque(x, y)))?;
    // bottom to top
    let bottom = (0..h).rev().find(|&y| (0..w).any(|x| opaque(x, y)))? + 1;

    Some(Rect::new(
        left as u32,
        top as u32,
        (right - left) as u32,
        (bottom - top) as u32,
    ))
}

/// Envelope of an RGBA buffer with the fully-transparent fallback applied.
pub fn extract_envelope(
    pixels: &[u8],
    width: u32,
    height: u32,
    threshold: u8,
    policy: TransparentPolicy,
) -> Rect {
    scan_opaque_bounds(pixels, width, height, threshold).unwrap_or(match policy {
        TransparentPolicy::OneByOne => Rect::new(0, 0, 1.min(width), 1.min(height)),
        TransparentPolicy::FullFrame => Rect::new(0, 0, width, height),
    })
}

pub fn envelope_of(rgba: &RgbaImage, cfg: &PipelineConfig) -> Rect {
    let (w, h) = rgba.dimensions();
    extract_envelope(
        rgba.as_raw(),
        w,
        h,
        cfg.alpha_threshold,
        cfg.transparent_policy,
    )
}

/// Decodes a stored binary into RGBA8, rejecting zero-sized images.
pub fn decode_rgba(resource: ResourceId, bytes: &[u8]) -> Result<RgbaImage> {
    let rgba = image::load_from_memory(bytes)?.to_rgba8();
    let (w, h) = rgba.dimensions();
    if w == 0 || h == 0 {
        return Err(AtlasPipelineError::InvalidGeometry {
            resource,
            reason: format!("decoded image is {w}x{h}"),
        });
    }
    Ok(rgba)
}

/// Computes and stores the raw size and envelope of `resource`.
///
/// Any previous placement is kept only when the recomputed envelope is unchanged, so
/// rerunning on the same pixels leaves the record identical.
pub fn record_geometry(resource: &mut Resource, rgba: &RgbaImage, cfg: &PipelineConfig) {
    let (w, h) = rgba.dimensions();
    let mut geometry = ResourceGeometry::new(w, h, envelope_of(rgba, cfg));
    if let Some(previous) = resource.geometry {
        if previous.envelope == geometry.envelope
            && previous.raw_width == w
            && previous.raw_height == h
        {
            geometry.placement = previous.placement;
        }
    }
    resource.geometry = Some(geometry);
}
