use crate::error::{AtlasPipelineError, Result};
use crate::model::{Envelope, Placement, Rect, Resource, ResourceId, ResourceRef};
use crate::orchestrator::AcceptedLayout;
use image::{ImageFormat, RgbaImage};
use std::collections::HashMap;
use std::io::Cursor;

/// Decoded pixels of one packed resource plus its envelope within them.
#[derive(Debug, Clone, Copy)]
pub struct SourceImage<'a> {
    pub rgba: &'a RgbaImage,
    pub envelope: Envelope,
}

/// Composited atlas page and its lossless encoding.
pub struct ComposedAtlas {
    pub rgba: RgbaImage,
    pub png: Vec<u8>,
}

/// Decides whether `placement` holds `envelope` rotated.
///
/// Same size means drawn as is, transposed size means rotated 90°. For square envelopes
/// the solver's `flipped` flag decides. Any other size is a layout/envelope mismatch.
pub fn placement_rotation(
    resource: ResourceId,
    placement: &Rect,
    envelope: &Envelope,
) -> Result<bool> {
    let same = placement.w == envelope.w && placement.h == envelope.h;
    let transposed = placement.w == envelope.h && placement.h == envelope.w;
    match (same, transposed) {
        (true, true) => Ok(placement.flipped),
        (true, false) => Ok(false),
        (false, true) => Ok(true),
        (false, false) => Err(AtlasPipelineError::PlacementMismatch {
            resource,
            placement: (placement.w, placement.h),
            envelope: (envelope.w, envelope.h),
        }),
    }
}

/// Blit a sub-rectangle from `src` into `canvas` at destination (dx, dy),
/// optionally rotated 90° clockwise about the destination's top-left corner.
///
/// - (sx, sy, sw, sh): source rectangle within `src`
/// - (dx, dy): destination top-left in `canvas`
#[allow(clippy::too_many_arguments)]
pub fn blit_rgba(
    src: &RgbaImage,
    canvas: &mut RgbaImage,
    dx: u32,
    dy: u32,
    sx: u32,
    sy: u32,
    sw: u32,
    sh: u32,
    rotated: bool,
) {
    let (cw, ch) = canvas.dimensions();
    // destination (rendered) size may differ when rotated
    let (rw, rh) = if rotated { (sh, sw) } else { (sw, sh) };

    for yy in 0..rh {
        for xx in 0..rw {
            let (ix, iy) = if rotated {
                (sx + yy, sy + (sh - 1 - xx))
            } else {
                (sx + xx, sy + yy)
            };
            if dx + xx < cw && dy + yy < ch {
                let px = *src.get_pixel(ix, iy);
                canvas.put_pixel(dx + xx, dy + yy, px);
            }
        }
    }
}

/// Draws every item of `layout` into a fresh power-of-two canvas and encodes it as PNG.
pub fn compose(
    layout: &AcceptedLayout,
    sources: &HashMap<ResourceId, SourceImage<'_>>,
) -> Result<ComposedAtlas> {
    let (page_w, page_h) = layout.canvas_size();
    let page = Rect::new(0, 0, page_w, page_h);
    let mut canvas = RgbaImage::new(page_w, page_h);
    for item in &layout.items {
        let src = sources
            .get(&item.id)
            .ok_or(AtlasPipelineError::MissingSource(item.id))?;
        let rotated = placement_rotation(item.id, &item.rect, &src.envelope)?;
        if !page.contains(&item.rect) {
            return Err(AtlasPipelineError::InvalidGeometry {
                resource: item.id,
                reason: format!(
                    "placement {:?} outside {}x{} canvas",
                    item.rect, page_w, page_h
                ),
            });
        }
        let e = src.envelope;
        if !Rect::new(0, 0, src.rgba.width(), src.rgba.height()).contains(&e.rect()) {
            return Err(AtlasPipelineError::InvalidGeometry {
                resource: item.id,
                reason: "envelope outside decoded image".into(),
            });
        }
        blit_rgba(
            src.rgba,
            &mut canvas,
            item.rect.x,
            item.rect.y,
            e.x,
            e.y,
            e.w,
            e.h,
            rotated,
        );
    }
    let png = encode_png(&canvas)?;
    Ok(ComposedAtlas { rgba: canvas, png })
}

pub fn encode_png(rgba: &RgbaImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    rgba.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
    Ok(bytes)
}

/// Records each item's final slot and points the resource at `atlas_id`.
///
/// Every item must have a matching resource with geometry; nothing is written unless all do.
pub fn apply_placements(
    resources: &mut HashMap<ResourceId, Resource>,
    layout: &AcceptedLayout,
    atlas_id: ResourceId,
) -> Result<()> {
    let mut placements = Vec::with_capacity(layout.items.len());
    for item in &layout.items {
        let geometry = resources
            .get(&item.id)
            .and_then(|r| r.geometry)
            .ok_or(AtlasPipelineError::MissingSource(item.id))?;
        let rotated = placement_rotation(item.id, &item.rect, &geometry.envelope)?;
        let mut rect = item.rect;
        rect.flipped = rotated;
        placements.push((item.id, Placement::from(rect)));
    }
    for (id, placement) in placements {
        if let Some(resource) = resources.get_mut(&id) {
            if let Some(g) = resource.geometry.as_mut() {
                g.placement = Some(placement);
            }
            resource.reference = ResourceRef::Redirect(atlas_id);
        }
    }
    Ok(())
}
