use atlas_pipeline_core::compositing::encode_png;
use atlas_pipeline_core::envelope::decode_rgba;
use atlas_pipeline_core::error::Result;
use atlas_pipeline_core::grouping::BundlePredicate;
use atlas_pipeline_core::model::{Rect, Resource, ResourceGeometry, ResourceKind, ResourceRef};
use atlas_pipeline_core::packer::maxrects::MaxRectsSolver;
use atlas_pipeline_core::packer::{PackOutcome, SolveOptions, Solver};
use atlas_pipeline_core::store::{MemoryStore, ResourceStore};
use atlas_pipeline_core::{AtlasPipelineError, PipelineConfig, run_build, run_build_with};
use image::{Rgba, RgbaImage};

/// `w x h` image whose opaque pixels cover `(x, y, ew, eh)`.
fn sprite(w: u32, h: u32, opaque: Rect, color: [u8; 3]) -> Vec<u8> {
    let mut img = RgbaImage::new(w, h);
    for y in opaque.y..opaque.bottom() {
        for x in opaque.x..opaque.right() {
            img.put_pixel(x, y, Rgba([color[0], color[1], color[2], 255]));
        }
    }
    encode_png(&img).expect("encode")
}

fn add(store: &MemoryStore, id: u64, w: u32, h: u32, tag: &str) -> Resource {
    let key = format!("sources/{tag}/{id}.png");
    store
        .write(&key, &sprite(w, h, Rect::new(0, 0, w, h), [id as u8, 0, 0]))
        .expect("write");
    Resource::image(id, format!("{tag}/{id}"), key).with_tags([tag])
}

fn ui_group() -> Vec<BundlePredicate> {
    vec![BundlePredicate::new("ui").require_tags(["ui"])]
}

#[test]
fn packs_a_group_into_one_pow2_atlas() {
    let store = MemoryStore::new();
    let resources = vec![
        add(&store, 1, 30, 20, "ui"),
        add(&store, 2, 50, 10, "ui"),
        add(&store, 3, 40, 40, "ui"),
        add(&store, 4, 16, 16, "bg"),
    ];
    let out = run_build(resources, &ui_group(), 1, &store, &PipelineConfig::default())
        .expect("build");

    let atlases: Vec<&Resource> = out.atlases().collect();
    assert_eq!(atlases.len(), 1);
    let atlas = atlases[0];
    assert_eq!(atlas.id, 5);
    assert_eq!(atlas.name, "ui#0");
    let g = atlas.geometry.expect("atlas geometry");
    assert!(g.raw_width.is_power_of_two() && g.raw_height.is_power_of_two());

    let ResourceRef::Binary(key) = &atlas.reference else {
        panic!("atlas must reference its binary");
    };
    let png = store.read(key).expect("atlas binary");
    let decoded = decode_rgba(atlas.id, &png).expect("decode");
    assert_eq!(decoded.dimensions(), (g.raw_width, g.raw_height));
    let pp = atlas.post_process.as_ref().expect("post process");
    assert_eq!(pp.content.len, png.len() as u64);
    assert!(pp.media_bundle_id.contains(&1));
    assert_eq!(pp.operations[0].extension_id, "texture-atlas");

    for id in 1..=3 {
        let r = out.resource(id).expect("resource");
        assert_eq!(r.reference, ResourceRef::Redirect(5));
        let p = r.geometry.and_then(|g| g.placement).expect("placement");
        let e = r.geometry.expect("geometry").envelope;
        if p.f {
            assert_eq!((p.w, p.h), (e.h, e.w));
        } else {
            assert_eq!((p.w, p.h), (e.w, e.h));
        }
        // the atlas holds the resource's pixels at its placement
        let px = decoded.get_pixel(p.x, p.y);
        assert_eq!(px[0], id as u8);
        assert_eq!(px[3], 255);
    }
    // not in any group: untouched
    let bg = out.resource(4).expect("bg");
    assert!(bg.geometry.is_none());
    assert_eq!(bg.reference, ResourceRef::Binary(bg.source.clone()));

    let report = &out.report;
    assert_eq!(report.packed(), 3);
    assert_eq!(report.atlases_built(), 1);
    assert!(report.bytes_before > 0);
    assert_eq!(report.bytes_after, png.len() as u64);
}

#[test]
fn trimmed_envelopes_are_packed() {
    let store = MemoryStore::new();
    let mut resources = Vec::new();
    for id in 1..=2 {
        let key = format!("s/{id}.png");
        store
            .write(&key, &sprite(64, 64, Rect::new(10, 12, 20, 8), [9, 9, 9]))
            .expect("write");
        resources.push(Resource::image(id, format!("{id}"), key).with_tags(["ui"]));
    }
    let out = run_build(resources, &ui_group(), 1, &store, &PipelineConfig::default())
        .expect("build");
    let r = out.resource(1).expect("resource");
    let g = r.geometry.expect("geometry");
    assert_eq!((g.raw_width, g.raw_height), (64, 64));
    assert_eq!(g.envelope.rect(), Rect::new(10, 12, 20, 8));
    let p = g.placement.expect("placement");
    assert_eq!(p.w * p.h, 160);
}

#[test]
fn single_member_group_is_passed_through() {
    let store = MemoryStore::new();
    let resources = vec![add(&store, 1, 32, 32, "ui")];
    let out = run_build(resources, &ui_group(), 1, &store, &PipelineConfig::default())
        .expect("build");
    assert_eq!(out.atlases().count(), 0);
    let r = out.resource(1).expect("resource");
    assert_eq!(r.reference, ResourceRef::Binary("sources/ui/1.png".into()));
    assert!(r.geometry.is_some_and(|g| g.placement.is_none()));
    assert_eq!(out.report.groups[0].skipped, 1);
    assert_eq!(store.write_count(), 1);
}

#[test]
fn rebuild_reuses_the_cached_atlas() {
    let store = MemoryStore::new();
    let resources: Vec<Resource> = (1..=4).map(|id| add(&store, id, 64, 64, "ui")).collect();
    let cfg = PipelineConfig::default();
    let first = run_build(resources, &ui_group(), 1, &store, &cfg).expect("first");
    let writes = store.write_count();
    let atlas = first.atlases().next().expect("atlas").clone();

    let second = run_build(first.resources.clone(), &ui_group(), 2, &store, &cfg)
        .expect("second");
    assert_eq!(store.write_count(), writes, "no recompositing");
    assert_eq!(second.report.atlases_built(), 0);
    assert_eq!(second.report.atlases_reused(), 1);
    assert_eq!(second.atlases().count(), 1);

    let again = second.resource(atlas.id).expect("atlas kept");
    let pp = again.post_process.as_ref().expect("post process");
    let pp_first = atlas.post_process.as_ref().expect("post process");
    assert_eq!(pp.operations, pp_first.operations);
    assert_eq!(pp.media_bundle_id.iter().copied().collect::<Vec<_>>(), vec![1, 2]);
    for id in 1..=4 {
        assert_eq!(second.resource(id), first.resource(id));
    }
}

#[test]
fn content_only_change_keeps_the_cache_key() {
    let store = MemoryStore::new();
    let resources: Vec<Resource> = (1..=3).map(|id| add(&store, id, 32, 32, "ui")).collect();
    let cfg = PipelineConfig::default();
    let first = run_build(resources, &ui_group(), 1, &store, &cfg).expect("first");
    let hash = first
        .atlases()
        .next()
        .and_then(|a| a.post_process.clone())
        .expect("atlas")
        .operations;

    // recolor resource 2 without touching its opaque box
    store
        .write("sources/ui/2.png", &sprite(32, 32, Rect::new(0, 0, 32, 32), [200, 200, 200]))
        .expect("write");
    let writes = store.write_count();
    let mut resources = first.resources.clone();
    for r in &mut resources {
        if r.id == 2 {
            r.geometry = None;
        }
    }
    let second = run_build(resources, &ui_group(), 2, &store, &cfg).expect("second");
    assert_eq!(second.report.atlases_reused(), 1);
    assert_eq!(store.write_count(), writes);
    let reused = second.atlases().next().and_then(|a| a.post_process.clone());
    assert_eq!(reused.map(|p| p.operations), Some(hash));
}

#[test]
fn missing_atlas_binary_forces_a_rebuild() {
    let store = MemoryStore::new();
    let resources: Vec<Resource> = (1..=3).map(|id| add(&store, id, 32, 32, "ui")).collect();
    let cfg = PipelineConfig::default();
    let first = run_build(resources, &ui_group(), 1, &store, &cfg).expect("first");
    let old = first.atlases().next().expect("atlas").clone();
    store.remove(&old.source).expect("remove");

    let second = run_build(first.resources.clone(), &ui_group(), 2, &store, &cfg)
        .expect("second");
    assert_eq!(second.report.atlases_built(), 1);
    let new_atlas = second
        .atlases()
        .find(|a| a.id != old.id)
        .expect("new atlas");
    assert!(store.exists(&new_atlas.source));
    assert_eq!(
        new_atlas.post_process.as_ref().map(|p| &p.operations),
        old.post_process.as_ref().map(|p| &p.operations)
    );
    assert_eq!(
        second.resource(1).map(|r| r.reference.clone()),
        Some(ResourceRef::Redirect(new_atlas.id))
    );
}

/// MaxRects, except any rect of exactly 7x7 crashes it.
#[derive(Default)]
struct AllergicSolver(MaxRectsSolver);

impl Solver for AllergicSolver {
    fn solve(&mut self, rects: &mut [Rect], limit: u32, opts: &SolveOptions) -> Result<PackOutcome> {
        if rects.iter().any(|r| r.w == 7 && r.h == 7) {
            return Err(AtlasPipelineError::Solver("7x7".into()));
        }
        self.0.solve(rects, limit, opts)
    }
}

#[test]
fn failed_group_leaves_others_intact() {
    let store = MemoryStore::new();
    let resources = vec![
        add(&store, 1, 7, 7, "bad"),
        add(&store, 2, 8, 8, "bad"),
        add(&store, 3, 16, 16, "ui"),
        add(&store, 4, 16, 16, "ui"),
    ];
    let groups = vec![
        BundlePredicate::new("bad").require_tags(["bad"]),
        BundlePredicate::new("ui").require_tags(["ui"]),
    ];
    let err = run_build_with(
        resources,
        &groups,
        1,
        &store,
        &PipelineConfig::default(),
        AllergicSolver::default,
    )
    .expect_err("one group fails");
    let AtlasPipelineError::GroupsFailed {
        failed,
        total,
        output,
    } = err
    else {
        panic!("expected an aggregate error");
    };
    assert_eq!((failed, total), (1, 2));
    let bad = &output.report.groups[0];
    assert!(bad.is_failed());
    assert_eq!(bad.failed, 2);
    assert!(bad.error.as_deref().is_some_and(|e| e.contains("7x7")));

    // failed group: records unchanged
    let r1 = output.resource(1).expect("r1");
    assert!(r1.geometry.is_none());
    assert_eq!(r1.reference, ResourceRef::Binary(r1.source.clone()));
    // healthy group: packed
    assert_eq!(output.atlases().count(), 1);
    assert!(output.resource(3).and_then(|r| r.redirect_target()).is_some());
}

#[test]
fn unreadable_resource_is_counted_as_failed() {
    let store = MemoryStore::new();
    let mut resources = vec![add(&store, 1, 16, 16, "ui"), add(&store, 2, 16, 16, "ui")];
    resources.push(Resource::image(3, "ui/ghost", "sources/ui/ghost.png").with_tags(["ui"]));
    store.write("sources/ui/broken.png", b"garbage").expect("write");
    resources.push(Resource::image(4, "ui/broken", "sources/ui/broken.png").with_tags(["ui"]));

    let out = run_build(resources, &ui_group(), 1, &store, &PipelineConfig::default())
        .expect("build");
    let g = &out.report.groups[0];
    assert_eq!(g.failed, 2);
    assert_eq!(g.packed, 2);
    assert!(!g.is_failed());
    assert_eq!(out.resource(3).and_then(|r| r.redirect_target()), None);
}

#[test]
fn duplicate_ids_and_bad_config_are_rejected() {
    let store = MemoryStore::new();
    let resources = vec![add(&store, 1, 8, 8, "ui"), add(&store, 1, 8, 8, "ui")];
    assert!(matches!(
        run_build(resources, &ui_group(), 1, &store, &PipelineConfig::default()),
        Err(AtlasPipelineError::DuplicateResource(1))
    ));

    let cfg = PipelineConfig::builder().ideal_ratio(0.5).required_ratio(0.9).build();
    assert!(matches!(
        run_build(Vec::new(), &ui_group(), 1, &store, &cfg),
        Err(AtlasPipelineError::InvalidConfig(_))
    ));
}

#[test]
fn overlapping_groups_share_one_atlas_without_dedup() {
    let store = MemoryStore::new();
    let resources: Vec<Resource> = (1..=3).map(|id| add(&store, id, 16, 16, "ui")).collect();
    let groups = vec![BundlePredicate::new("first"), BundlePredicate::new("second")];
    let cfg = PipelineConfig::builder().deduplicate_groups(false).build();
    let out = run_build(resources, &groups, 1, &store, &cfg).expect("build");

    // same layout in both groups: composed once, reused by the second
    assert_eq!(out.report.atlases_built(), 1);
    assert_eq!(out.report.atlases_reused(), 1);
    let atlases: Vec<&Resource> = out.atlases().collect();
    assert_eq!(atlases.len(), 1);
    assert_eq!(atlases[0].name, "first#0");
    let atlas_keys = store.keys().into_iter().filter(|k| k.starts_with("atlas-")).count();
    assert_eq!(atlas_keys, 1);
    for id in 1..=3 {
        assert_eq!(
            out.resource(id).and_then(|r| r.redirect_target()),
            Some(atlases[0].id)
        );
    }
    assert_eq!(
        out.report.bytes_after,
        atlases[0].post_process.as_ref().map_or(0, |p| p.content.len)
    );
    assert!(out.resources.iter().all(|r| r.kind == ResourceKind::Atlas || r.id <= 3));
}

#[test]
fn atlases_of_a_failed_group_are_removed() {
    let store = MemoryStore::new();
    let mut resources: Vec<Resource> = (1..=2).map(|id| add(&store, id, 40, 20, "ui")).collect();
    // known geometry but no binary: planned into a second page, fails when composing it
    for id in 10..=11 {
        let mut ghost = Resource::image(id, format!("ui/{id}"), format!("sources/ui/{id}.png"))
            .with_tags(["ui"]);
        ghost.geometry = Some(ResourceGeometry::new(64, 32, Rect::new(0, 0, 64, 32)));
        resources.push(ghost);
    }
    let cfg = PipelineConfig::builder().max_dimension(64).build();
    let err = run_build(resources, &ui_group(), 1, &store, &cfg).expect_err("group fails");
    let AtlasPipelineError::GroupsFailed { failed, output, .. } = err else {
        panic!("expected an aggregate error");
    };
    assert_eq!(failed, 1);
    assert_eq!(output.atlases().count(), 0);
    assert!(store.keys().iter().all(|k| k.starts_with("sources/")));
    assert_eq!(output.resource(1).and_then(|r| r.redirect_target()), None);
}
