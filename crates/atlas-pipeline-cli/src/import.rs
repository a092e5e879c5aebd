use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::Context;
use atlas_pipeline_core::cache::fast_hash;
use atlas_pipeline_core::store::ResourceStore;
use atlas_pipeline_core::{Resource, ResourceId, ResourceKind};
use globset::{Glob, GlobSet, GlobSetBuilder};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use walkdir::WalkDir;

/// Store prefix under which imported source images live.
pub const SOURCES_PREFIX: &str = "sources";

/// An image file found under the input root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    pub path: PathBuf,
    /// `/`-separated path relative to the input root, without extension.
    pub name: String,
    /// Store key the file is copied to.
    pub source_key: String,
    pub tags: BTreeSet<String>,
    pub episodes: BTreeSet<u32>,
}

/// Resource list persisted between builds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    pub resources: Vec<Resource>,
}

impl Manifest {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text =
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parse {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("write {}", path.display()))
    }

    /// Highest build id any atlas in the manifest is valid for.
    pub fn last_build_id(&self) -> Option<u32> {
        self.resources
            .iter()
            .filter_map(|r| r.post_process.as_ref())
            .filter_map(|pp| pp.media_bundle_id.iter().next_back().copied())
            .max()
    }
}

fn build_globset(patterns: &[String]) -> anyhow::Result<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut b = GlobSetBuilder::new();
    for pat in patterns {
        b.add(Glob::new(pat).with_context(|| format!("bad glob '{pat}'"))?);
    }
    Ok(Some(b.build()?))
}

fn should_skip(rel: &str, include: Option<&GlobSet>, exclude: Option<&GlobSet>) -> bool {
    if exclude.is_some_and(|ex| ex.is_match(rel)) {
        return true;
    }
    include.is_some_and(|inc| !inc.is_match(rel))
}

fn is_image(p: &Path) -> bool {
    matches!(
        p.extension()
            .and_then(|e| e.to_str())
            .map(|s| s.to_ascii_lowercase()),
        Some(ext) if matches!(ext.as_str(), "png" | "jpg" | "jpeg" | "bmp" | "tga" | "gif")
    )
}

/// `ep<N>` directory names mark episodes.
pub fn parse_episode(component: &str) -> Option<u32> {
    let digits = component
        .strip_prefix("ep")
        .or_else(|| component.strip_prefix("EP"))?;
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

/// Tags and episodes from the directory components of `rel`.
pub fn classify(rel: &Path) -> (BTreeSet<String>, BTreeSet<u32>) {
    let mut tags = BTreeSet::new();
    let mut episodes = BTreeSet::new();
    if let Some(parent) = rel.parent() {
        for c in parent.components() {
            let Component::Normal(os) = c else { continue };
            let s = os.to_string_lossy();
            match parse_episode(&s) {
                Some(ep) => {
                    episodes.insert(ep);
                }
                None => {
                    tags.insert(s.into_owned());
                }
            }
        }
    }
    (tags, episodes)
}

/// Lists image files under `root` (or `root` itself if it is a file), sorted by path.
pub fn scan(root: &Path, include: &[String], exclude: &[String]) -> anyhow::Result<Vec<ScannedFile>> {
    let inc = build_globset(include)?;
    let exc = build_globset(exclude)?;
    let (base, paths): (&Path, Vec<PathBuf>) = if root.is_file() {
        (root.parent().unwrap_or(Path::new("")), vec![root.to_path_buf()])
    } else {
        let mut list = Vec::new();
        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = entry.with_context(|| format!("walk {}", root.display()))?;
            if entry.file_type().is_file() && is_image(entry.path()) {
                list.push(entry.into_path());
            }
        }
        (root, list)
    };

    let mut out = Vec::with_capacity(paths.len());
    for path in paths {
        let rel = path.strip_prefix(base).unwrap_or(&path).to_path_buf();
        let rel_str = rel.to_string_lossy().replace('\\', "/");
        if should_skip(&rel_str, inc.as_ref(), exc.as_ref()) {
            continue;
        }
        let name = rel.with_extension("").to_string_lossy().replace('\\', "/");
        let (tags, episodes) = classify(&rel);
        out.push(ScannedFile {
            path,
            name,
            source_key: format!("{SOURCES_PREFIX}/{rel_str}"),
            tags,
            episodes,
        });
    }
    Ok(out)
}

/// Builds throwaway image records for `files`, numbered from 1.
pub fn preview_resources(files: &[ScannedFile]) -> Vec<Resource> {
    files
        .iter()
        .zip(1..)
        .map(|(f, id)| {
            Resource::image(id, f.name.clone(), f.source_key.clone())
                .with_tags(f.tags.iter().cloned())
                .with_episodes(f.episodes.iter().copied())
        })
        .collect()
}

/// Copies `files` into `store` and reconciles them with `previous` records.
///
/// Records are matched by name. A changed binary drops the cached geometry so its envelope
/// is recomputed. Image records whose file disappeared are dropped; atlas records are kept.
/// Every imported record starts with a direct reference.
pub fn import<S: ResourceStore + ?Sized>(
    files: &[ScannedFile],
    previous: Vec<Resource>,
    store: &S,
    progress: bool,
) -> anyhow::Result<Vec<Resource>> {
    let bar = if progress {
        let b = ProgressBar::new(files.len() as u64);
        b.set_style(ProgressStyle::with_template(
            "{spinner:.green} importing {pos}/{len} [{elapsed_precise}] {wide_msg}",
        )?);
        Some(b)
    } else {
        None
    };

    let mut next_id: ResourceId = previous.iter().map(|r| r.id).max().unwrap_or(0) + 1;
    let (atlases, images): (Vec<Resource>, Vec<Resource>) = previous
        .into_iter()
        .partition(|r| r.kind == ResourceKind::Atlas);
    let mut by_name: HashMap<String, Resource> =
        images.into_iter().map(|r| (r.name.clone(), r)).collect();

    let mut out = Vec::with_capacity(files.len() + atlases.len());
    let (mut added, mut changed) = (0usize, 0usize);
    for f in files {
        if let Some(b) = &bar {
            b.set_message(f.name.clone());
        }
        let bytes = fs::read(&f.path).with_context(|| format!("read {}", f.path.display()))?;
        let mut record = match by_name.remove(&f.name) {
            Some(mut r) => {
                let unchanged = r.source == f.source_key
                    && store
                        .read(&r.source)
                        .is_ok_and(|old| fast_hash(&old) == fast_hash(&bytes));
                if !unchanged {
                    debug!(name = %f.name, "source changed; envelope will be recomputed");
                    r.geometry = None;
                    changed += 1;
                }
                r.source = f.source_key.clone();
                r
            }
            None => {
                let r = Resource::image(next_id, f.name.clone(), f.source_key.clone());
                next_id += 1;
                added += 1;
                r
            }
        };
        record.tags = f.tags.clone();
        record.episodes = f.episodes.clone();
        // the build redirects whatever it packs again
        record.restore_direct_reference();
        store.write(&record.source, &bytes)?;
        out.push(record);
        if let Some(b) = &bar {
            b.inc(1);
        }
    }
    if let Some(b) = &bar {
        b.finish_and_clear();
    }
    if !by_name.is_empty() {
        info!(count = by_name.len(), "dropping resources whose files are gone");
    }
    info!(imported = out.len(), added, changed, "sources imported");
    out.extend(atlases);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use atlas_pipeline_core::store::MemoryStore;

    #[test]
    fn episodes_and_tags_from_directories() {
        let (tags, eps) = classify(Path::new("ui/ep3/buttons/ok.png"));
        assert_eq!(tags, BTreeSet::from(["ui".to_string(), "buttons".to_string()]));
        assert_eq!(eps, BTreeSet::from([3]));
        assert_eq!(parse_episode("ep"), None);
        assert_eq!(parse_episode("epic"), None);
        assert_eq!(parse_episode("ep12"), Some(12));
    }

    #[test]
    fn scan_respects_globs() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        fs::create_dir_all(dir.path().join("ui/ep1"))?;
        fs::write(dir.path().join("ui/ep1/a.png"), b"x")?;
        fs::write(dir.path().join("ui/b.png"), b"x")?;
        fs::write(dir.path().join("ui/notes.txt"), b"x")?;

        let all = scan(dir.path(), &[], &[])?;
        let names: Vec<&str> = all.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["ui/b", "ui/ep1/a"]);
        assert_eq!(all[1].source_key, "sources/ui/ep1/a.png");

        let only_ep = scan(dir.path(), &["**/ep1/**".into()], &[])?;
        assert_eq!(only_ep.len(), 1);
        let no_b = scan(dir.path(), &[], &["ui/b.png".into()])?;
        assert_eq!(no_b.len(), 1);
        Ok(())
    }

    #[test]
    fn reimport_keeps_ids_and_resets_changed_geometry() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("a.png"), b"one")?;
        fs::write(dir.path().join("b.png"), b"two")?;
        let store = MemoryStore::new();
        let files = scan(dir.path(), &[], &[])?;

        let mut first = import(&files, Vec::new(), &store, false)?;
        assert_eq!(first.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 2]);
        for r in &mut first {
            r.geometry = Some(atlas_pipeline_core::ResourceGeometry::new(
                4,
                4,
                atlas_pipeline_core::Rect::new(0, 0, 4, 4),
            ));
        }

        fs::write(dir.path().join("b.png"), b"changed")?;
        let second = import(&files, first, &store, false)?;
        assert_eq!(second[0].id, 1);
        assert!(second[0].geometry.is_some());
        assert_eq!(second[1].id, 2);
        assert!(second[1].geometry.is_none());
        assert_eq!(store.read("sources/b.png")?, b"changed");
        Ok(())
    }
}
