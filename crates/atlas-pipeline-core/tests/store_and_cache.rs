use atlas_pipeline_core::cache::{self, CacheKey, content_hash, structural_hash};
use atlas_pipeline_core::model::{
    ContentHash, PostProcessRecord, Rect, Resource, ResourceGeometry, ResourceKind, ResourceRef,
};
use atlas_pipeline_core::orchestrator::{AcceptedLayout, PackItem};
use atlas_pipeline_core::store::{DirStore, MemoryStore, ResourceStore};
use atlas_pipeline_core::AtlasPipelineError;
use serde_json::json;
use std::collections::BTreeSet;

fn layout(rects: &[(u64, Rect)]) -> AcceptedLayout {
    AcceptedLayout {
        items: rects
            .iter()
            .map(|&(id, rect)| PackItem {
                id,
                rect,
                raw_width: rect.w,
                raw_height: rect.h,
            })
            .collect(),
        container: (64, 64),
        size_limit: 2048,
        space_usage: 1.0,
    }
}

fn atlas_record(id: u64, key: &CacheKey, binary: String) -> Resource {
    let mut r = Resource::image(id, "atlas", binary);
    r.kind = ResourceKind::Atlas;
    r.post_process = Some(PostProcessRecord {
        operations: key.operations.clone(),
        media_bundle_id: BTreeSet::from([1]),
        content: ContentHash {
            len: 0,
            xxh3: String::new(),
            sha256: String::new(),
        },
    });
    r
}

#[test]
fn structural_hash_ignores_key_order() {
    let a = json!({"x": 1, "y": [1, 2, {"b": true, "a": null}]});
    let b = json!({"y": [1, 2, {"a": null, "b": true}], "x": 1});
    assert_eq!(structural_hash(&a).unwrap(), structural_hash(&b).unwrap());
    let c = json!({"x": 1, "y": [2, 1, {"a": null, "b": true}]});
    assert_ne!(structural_hash(&a).unwrap(), structural_hash(&c).unwrap());
    assert_eq!(structural_hash(&a).unwrap().len(), 32);
}

#[test]
fn layout_key_depends_on_geometry_and_ids() {
    let base = layout(&[(1, Rect::new(0, 0, 8, 8)), (2, Rect::new(8, 0, 8, 8))]);
    let same = layout(&[(1, Rect::new(0, 0, 8, 8)), (2, Rect::new(8, 0, 8, 8))]);
    let moved = layout(&[(1, Rect::new(0, 8, 8, 8)), (2, Rect::new(8, 0, 8, 8))]);
    let renumbered = layout(&[(1, Rect::new(0, 0, 8, 8)), (3, Rect::new(8, 0, 8, 8))]);

    let k = CacheKey::for_layout(&base).unwrap();
    assert_eq!(k, CacheKey::for_layout(&same).unwrap());
    assert_ne!(k.key, CacheKey::for_layout(&moved).unwrap().key);
    assert_ne!(k.key, CacheKey::for_layout(&renumbered).unwrap().key);
    assert_eq!(k.operations.len(), 1);
    assert_eq!(k.operations[0].extension_id, "texture-atlas");
    assert_eq!(
        k.binary_key(12),
        format!("atlas-12-{}.png", k.post_process_hash())
    );
}

#[test]
fn find_requires_matching_key_and_binary() {
    let store = MemoryStore::new();
    let k = CacheKey::for_layout(&layout(&[(1, Rect::new(0, 0, 4, 4))])).unwrap();
    let other = CacheKey::for_layout(&layout(&[(2, Rect::new(0, 0, 4, 4))])).unwrap();

    let hit = atlas_record(10, &k, k.binary_key(10));
    let miss = atlas_record(11, &other, other.binary_key(11));
    let records = vec![miss.clone(), hit.clone()];

    // binary not written yet
    assert_eq!(cache::find(&records, &k, &store).unwrap(), None);
    store.write(&k.binary_key(10), b"png").unwrap();
    assert_eq!(cache::find(&records, &k, &store).unwrap(), Some(&hit));

    let mut redirected = hit.clone();
    redirected.reference = ResourceRef::Redirect(3);
    assert!(matches!(
        cache::find([&redirected], &k, &store),
        Err(AtlasPipelineError::MalformedReference(_))
    ));
}

#[test]
fn content_hash_covers_both_digests() {
    let h = content_hash(b"abc");
    assert_eq!(h.len, 3);
    assert_eq!(
        h.sha256,
        "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
    );
    assert_eq!(h.xxh3.len(), 16);
    assert_ne!(content_hash(b"abd").xxh3, h.xxh3);
}

#[test]
fn references_parse_strictly() {
    assert_eq!("redirect://42".parse::<ResourceRef>().unwrap(), ResourceRef::Redirect(42));
    assert_eq!(ResourceRef::Redirect(42).to_string(), "redirect://42");
    assert_eq!(
        "sources/a.png".parse::<ResourceRef>().unwrap(),
        ResourceRef::Binary("sources/a.png".into())
    );
    for bad in ["redirect://", "redirect://x1", "", "http://host/a.png"] {
        assert!(
            matches!(bad.parse::<ResourceRef>(), Err(AtlasPipelineError::MalformedReference(_))),
            "{bad}"
        );
    }
    let r: Result<Resource, _> = serde_json::from_value(json!({
        "id": 1, "name": "a", "source": "a.png", "reference": "redirect://nope"
    }));
    assert!(r.is_err());
}

#[test]
fn geometry_uses_persisted_key_names() {
    let mut g = ResourceGeometry::new(10, 20, Rect::new(1, 2, 3, 4));
    g.placement = Some(atlas_pipeline_core::model::Placement {
        x: 5,
        y: 6,
        w: 4,
        h: 3,
        f: true,
    });
    let v = serde_json::to_value(g).unwrap();
    assert_eq!(
        v,
        json!({"tw": 10, "th": 20, "ex": 1, "ey": 2, "ew": 3, "eh": 4,
               "placement": {"x": 5, "y": 6, "w": 4, "h": 3, "f": true}})
    );
}

#[test]
fn dir_store_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = DirStore::new(dir.path().join("store")).unwrap();
    store.write("sources/ui/a.png", b"hello").unwrap();
    assert!(store.exists("sources/ui/a.png"));
    assert_eq!(store.read("sources/ui/a.png").unwrap(), b"hello");
    assert_eq!(store.size("sources/ui/a.png").unwrap(), 5);
    assert!(dir.path().join("store/sources/ui/a.png").is_file());

    store.write("sources/ui/a.png", b"bye").unwrap();
    assert_eq!(store.read("sources/ui/a.png").unwrap(), b"bye");

    store.remove("sources/ui/a.png").unwrap();
    assert!(!store.exists("sources/ui/a.png"));
    assert!(matches!(
        store.read("sources/ui/a.png"),
        Err(AtlasPipelineError::Store { .. })
    ));
}

#[test]
fn dir_store_keys_differing_by_extension_stay_apart() {
    let dir = tempfile::tempdir().unwrap();
    let store = DirStore::new(dir.path()).unwrap();
    store.write("a.png", b"png").unwrap();
    store.write("a.jpg", b"jpg").unwrap();
    assert_eq!(store.read("a.png").unwrap(), b"png");
    assert_eq!(store.read("a.jpg").unwrap(), b"jpg");

    let mut names: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(names, vec!["a.jpg".to_string(), "a.png".to_string()]);
}

#[test]
fn dir_store_rejects_escaping_keys() {
    let dir = tempfile::tempdir().unwrap();
    let store = DirStore::new(dir.path()).unwrap();
    for key in ["../x.png", "/etc/passwd", "a/../../b", ""] {
        assert!(store.write(key, b"x").is_err(), "{key}");
        assert!(!store.exists(key));
    }
}

#[test]
fn memory_store_counts_writes() {
    let store = MemoryStore::new();
    store.write("b", b"1").unwrap();
    store.write("a", b"22").unwrap();
    assert_eq!(store.write_count(), 2);
    assert_eq!(store.keys(), vec!["a".to_string(), "b".to_string()]);
    assert_eq!(store.size("a").unwrap(), 2);
    assert!(store.remove("missing").is_err());
}
