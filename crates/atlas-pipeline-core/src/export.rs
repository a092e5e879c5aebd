use crate::model::{Resource, ResourceKind};
use serde_json::{Map, Value, json};

/// Frame table of every atlas, keyed by atlas id.
///
/// Shape: `{ atlases: { "<id>": { file, size: {w, h}, frames: { name: { id, frame, rotated,
/// trimmed, spriteSourceSize, sourceSize } } } } }`, a TexturePacker-like hash per atlas.
/// Resources redirected to an id that is not an atlas in `resources` are ignored.
pub fn atlas_frames_json<'a>(resources: impl IntoIterator<Item = &'a Resource>) -> Value {
    let resources: Vec<&Resource> = resources.into_iter().collect();
    let mut atlases = Map::new();
    for atlas in resources.iter().filter(|r| r.kind == ResourceKind::Atlas) {
        let (w, h) = atlas
            .geometry
            .map(|g| (g.raw_width, g.raw_height))
            .unwrap_or((0, 0));
        let mut frames = Map::new();
        for r in resources
            .iter()
            .filter(|r| r.redirect_target() == Some(atlas.id))
        {
            let Some(g) = r.geometry else { continue };
            let Some(p) = g.placement else { continue };
            let e = g.envelope;
            let trimmed = e.x != 0 || e.y != 0 || e.w != g.raw_width || e.h != g.raw_height;
            frames.insert(
                r.name.clone(),
                json!({
                    "id": r.id,
                    "frame": {"x": p.x, "y": p.y, "w": p.w, "h": p.h},
                    "rotated": p.f,
                    "trimmed": trimmed,
                    "spriteSourceSize": {"x": e.x, "y": e.y, "w": e.w, "h": e.h},
                    "sourceSize": {"w": g.raw_width, "h": g.raw_height},
                }),
            );
        }
        atlases.insert(
            atlas.id.to_string(),
            json!({
                "name": atlas.name,
                "file": atlas.source,
                "size": {"w": w, "h": h},
                "frames": frames,
            }),
        );
    }
    json!({ "atlases": atlases })
}
