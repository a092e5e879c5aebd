use crate::cache::{self, CacheKey};
use crate::compositing::{SourceImage, apply_placements, compose};
use crate::config::PipelineConfig;
use crate::envelope::{decode_rgba, record_geometry};
use crate::error::{AtlasPipelineError, Result};
use crate::grouping::{BundleGroup, BundlePredicate, group};
use crate::model::{
    PostProcessRecord, Rect, Resource, ResourceGeometry, ResourceId, ResourceKind, ResourceRef,
};
use crate::orchestrator::{AcceptedLayout, PackItem, PackOrchestrator};
use crate::packer::Solver;
use crate::packer::maxrects::MaxRectsSolver;
use crate::report::{BuildReport, GroupReport};
use crate::store::ResourceStore;
use image::RgbaImage;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, info_span, instrument, warn};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Resource list after a build plus its report.
#[derive(Debug, Clone)]
pub struct BuildOutput {
    /// Input resources (packed ones redirected to their atlas) followed by new atlas records.
    pub resources: Vec<Resource>,
    pub report: BuildReport,
}

impl BuildOutput {
    pub fn resource(&self, id: ResourceId) -> Option<&Resource> {
        self.resources.iter().find(|r| r.id == id)
    }

    pub fn atlases(&self) -> impl Iterator<Item = &Resource> {
        self.resources
            .iter()
            .filter(|r| r.kind == ResourceKind::Atlas)
    }
}

/// What one group contributes to the merged output.
#[derive(Default)]
struct GroupOutcome {
    report: GroupReport,
    updated: Vec<Resource>,
    /// Atlases the group's resources redirect to, cached or built in this build.
    atlases: Vec<ResourceId>,
    bytes_before: u64,
}

/// An atlas composed during this build, filled once by whichever group gets there first.
type BuiltSlot = Arc<Mutex<Option<Resource>>>;

/// State shared by every group run.
struct BuildContext<'a, S: ?Sized, F> {
    build_id: u32,
    store: &'a S,
    cfg: &'a PipelineConfig,
    existing_atlases: Vec<&'a Resource>,
    next_id: AtomicU64,
    /// Atlases of this build by cache key; at most one is composed per key.
    built: Mutex<HashMap<String, BuiltSlot>>,
    make_solver: F,
}

impl<S: ?Sized, F> BuildContext<'_, S, F> {
    fn slot(&self, key: &str) -> Result<BuiltSlot> {
        let mut built = self.built.lock().map_err(|_| registry_poisoned(key))?;
        Ok(Arc::clone(built.entry(key.to_string()).or_default()))
    }

    /// Every atlas composed so far, keyed by id.
    fn into_built(self) -> HashMap<ResourceId, Resource> {
        let built = self.built.into_inner().unwrap_or_else(|e| e.into_inner());
        built
            .into_values()
            .filter_map(|slot| slot.lock().ok().and_then(|atlas| atlas.clone()))
            .map(|atlas| (atlas.id, atlas))
            .collect()
    }
}

fn registry_poisoned(key: &str) -> AtlasPipelineError {
    AtlasPipelineError::Store {
        key: key.to_string(),
        reason: "atlas registry lock poisoned".into(),
    }
}

/// Runs a build with the default MaxRects solver.
pub fn run_build<S: ResourceStore + ?Sized>(
    resources: Vec<Resource>,
    predicates: &[BundlePredicate],
    build_id: u32,
    store: &S,
    cfg: &PipelineConfig,
) -> Result<BuildOutput> {
    run_build_with(
        resources,
        predicates,
        build_id,
        store,
        cfg,
        MaxRectsSolver::default,
    )
}

/// Groups `resources`, packs every group into atlases and returns the rewritten resource list.
///
/// Notes:
/// - Groups are independent; with `cfg.parallel` (feature "parallel") they run concurrently.
/// - A failing group contributes only its report. All groups run before the aggregate
///   `GroupsFailed` error is returned; it carries the full output.
/// - Groups whose layouts share a cache key share one atlas. Atlases no successful group
///   points at are removed from the store.
/// - `make_solver` is called once per group.
#[instrument(skip_all, fields(build_id = build_id, groups = predicates.len()))]
pub fn run_build_with<S, F, V>(
    mut resources: Vec<Resource>,
    predicates: &[BundlePredicate],
    build_id: u32,
    store: &S,
    cfg: &PipelineConfig,
    make_solver: F,
) -> Result<BuildOutput>
where
    S: ResourceStore + ?Sized,
    F: Fn() -> V + Sync,
    V: Solver,
{
    cfg.validate()?;

    let mut index: HashMap<ResourceId, usize> = HashMap::with_capacity(resources.len());
    for (i, r) in resources.iter().enumerate() {
        if index.insert(r.id, i).is_some() {
            return Err(AtlasPipelineError::DuplicateResource(r.id));
        }
    }
    let next_id = resources.iter().map(|r| r.id).max().map_or(1, |m| m + 1);

    let (outcomes, mut built) = {
        let groups = group(&resources, predicates, cfg.deduplicate_groups);
        let ctx = BuildContext {
            build_id,
            store,
            cfg,
            existing_atlases: resources
                .iter()
                .filter(|r| r.kind == ResourceKind::Atlas)
                .collect(),
            next_id: AtomicU64::new(next_id),
            built: Mutex::new(HashMap::new()),
            make_solver,
        };
        let outcomes = run_groups(&groups, &ctx);
        (outcomes, ctx.into_built())
    };

    let mut report = BuildReport {
        build_id,
        ..Default::default()
    };
    let mut referenced: HashSet<ResourceId> = HashSet::new();
    let mut new_atlases = Vec::new();
    for outcome in outcomes {
        let failed = outcome.report.is_failed();
        report.groups.push(outcome.report);
        if failed {
            continue;
        }
        for r in outcome.updated {
            if let Some(&i) = index.get(&r.id) {
                resources[i] = r;
            }
        }
        report.bytes_before += outcome.bytes_before;
        for atlas_id in outcome.atlases {
            if !referenced.insert(atlas_id) {
                continue;
            }
            let record = match built.remove(&atlas_id) {
                Some(atlas) => {
                    new_atlases.push(atlas);
                    new_atlases.last_mut()
                }
                None => match index.get(&atlas_id) {
                    Some(&i) => Some(&mut resources[i]),
                    None => None,
                },
            };
            if let Some(pp) = record.and_then(|r| r.post_process.as_mut()) {
                pp.media_bundle_id.insert(build_id);
                report.bytes_after += pp.content.len;
            }
        }
    }
    resources.extend(new_atlases);

    // composed by groups that failed afterwards and shared with no one
    for orphan in built.into_values() {
        debug!(atlas = orphan.id, "removing unreferenced atlas");
        if let Err(e) = store.remove(&orphan.source) {
            warn!(key = %orphan.source, error = %e, "could not remove unreferenced atlas");
        }
    }

    info!(summary = %report.summary(), "build finished");
    let failed = report.failed_groups();
    let total = report.groups.len();
    let output = BuildOutput { resources, report };
    if failed > 0 {
        return Err(AtlasPipelineError::GroupsFailed {
            failed,
            total,
            output: Box::new(output),
        });
    }
    Ok(output)
}

fn run_groups<S, F, V>(groups: &[BundleGroup<'_>], ctx: &BuildContext<'_, S, F>) -> Vec<GroupOutcome>
where
    S: ResourceStore + ?Sized,
    F: Fn() -> V + Sync,
    V: Solver,
{
    #[cfg(feature = "parallel")]
    {
        if ctx.cfg.parallel {
            return groups.par_iter().map(|g| run_group(g, ctx)).collect();
        }
    }
    groups.iter().map(|g| run_group(g, ctx)).collect()
}

fn run_group<S, F, V>(group: &BundleGroup<'_>, ctx: &BuildContext<'_, S, F>) -> GroupOutcome
where
    S: ResourceStore + ?Sized,
    F: Fn() -> V + Sync,
    V: Solver,
{
    let span = info_span!("group", name = group.name(), members = group.members.len());
    let _enter = span.enter();

    match pack_group(group, ctx) {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(error = %e, "bundle group failed; its resources are left unchanged");
            GroupOutcome {
                report: GroupReport {
                    name: group.name().to_string(),
                    resources: group.members.len(),
                    failed: group.members.len(),
                    error: Some(e.to_string()),
                    ..Default::default()
                },
                ..Default::default()
            }
        }
    }
}

fn decode_sources<S: ResourceStore + ?Sized>(
    store: &S,
    wanted: &[(ResourceId, String)],
    _parallel: bool,
) -> Vec<(ResourceId, Result<RgbaImage>)> {
    let load = |(id, key): &(ResourceId, String)| {
        let decoded = store.read(key).and_then(|bytes| decode_rgba(*id, &bytes));
        (*id, decoded)
    };
    #[cfg(feature = "parallel")]
    {
        if _parallel {
            return wanted.par_iter().map(load).collect();
        }
    }
    wanted.iter().map(load).collect()
}

fn pack_group<S, F, V>(group: &BundleGroup<'_>, ctx: &BuildContext<'_, S, F>) -> Result<GroupOutcome>
where
    S: ResourceStore + ?Sized,
    F: Fn() -> V + Sync,
    V: Solver,
{
    let order = group.ids();
    let mut members: HashMap<ResourceId, Resource> = group
        .members
        .iter()
        .map(|r| (r.id, (*r).clone()))
        .collect();

    // envelopes: decode only what has no cached geometry
    let wanted: Vec<(ResourceId, String)> = group
        .members
        .iter()
        .filter(|r| r.geometry.is_none())
        .map(|r| (r.id, r.source.clone()))
        .collect();
    let mut decoded: HashMap<ResourceId, RgbaImage> = HashMap::new();
    let mut failed: HashSet<ResourceId> = HashSet::new();
    for (id, result) in decode_sources(ctx.store, &wanted, ctx.cfg.parallel) {
        match result {
            Ok(rgba) => {
                if let Some(r) = members.get_mut(&id) {
                    record_geometry(r, &rgba, ctx.cfg);
                }
                decoded.insert(id, rgba);
            }
            Err(e) => {
                warn!(id, error = %e, "could not load resource; left unpacked");
                failed.insert(id);
            }
        }
    }

    let mut items = Vec::with_capacity(order.len());
    for id in &order {
        if failed.contains(id) {
            continue;
        }
        let geometry = members
            .get(id)
            .and_then(|r| r.geometry)
            .ok_or(AtlasPipelineError::MissingSource(*id))?;
        geometry.validate(*id)?;
        items.push(PackItem::new(*id, &geometry));
    }

    let plan = PackOrchestrator::new((ctx.make_solver)(), ctx.cfg).plan(items)?;
    debug!(
        layouts = plan.layouts.len(),
        skipped = plan.skipped.len(),
        unpackable = plan.unpackable.len(),
        "group planned"
    );

    let mut outcome = GroupOutcome {
        report: GroupReport {
            name: group.name().to_string(),
            resources: group.members.len(),
            ..Default::default()
        },
        ..Default::default()
    };
    for (n, layout) in plan.layouts.iter().enumerate() {
        let key = CacheKey::for_layout(layout)?;
        let hit = cache::find(ctx.existing_atlases.iter().copied(), &key, ctx.store)?;
        if let Some(record) = hit {
            debug!(atlas = record.id, key = %key.key, "reusing cached atlas");
            outcome.report.atlases_reused += 1;
            outcome.atlases.push(record.id);
            apply_placements(&mut members, layout, record.id)?;
            outcome.bytes_before += sources_size(ctx.store, &members, layout);
            continue;
        }

        // held while composing so another group with the same key waits and reuses
        let slot = ctx.slot(&key.key)?;
        let mut slot = slot.lock().map_err(|_| registry_poisoned(&key.key))?;
        let shared = slot.as_ref().map(|atlas| atlas.id);
        let atlas_id = match shared {
            Some(atlas_id) => {
                debug!(atlas = atlas_id, key = %key.key, "reusing atlas built by another group");
                outcome.report.atlases_reused += 1;
                atlas_id
            }
            None => {
                for item in &layout.items {
                    if decoded.contains_key(&item.id) {
                        continue;
                    }
                    let source = &members
                        .get(&item.id)
                        .ok_or(AtlasPipelineError::MissingSource(item.id))?
                        .source;
                    let rgba = decode_rgba(item.id, &ctx.store.read(source)?)?;
                    decoded.insert(item.id, rgba);
                }
                let mut sources = HashMap::with_capacity(layout.items.len());
                for item in &layout.items {
                    let envelope = members
                        .get(&item.id)
                        .and_then(|r| r.geometry)
                        .ok_or(AtlasPipelineError::MissingSource(item.id))?
                        .envelope;
                    let rgba = decoded
                        .get(&item.id)
                        .ok_or(AtlasPipelineError::MissingSource(item.id))?;
                    sources.insert(item.id, SourceImage { rgba, envelope });
                }
                let composed = compose(layout, &sources)?;

                let atlas_id = ctx.next_id.fetch_add(1, Ordering::Relaxed);
                let binary = key.binary_key(atlas_id);
                ctx.store.write(&binary, &composed.png)?;

                let (w, h) = composed.rgba.dimensions();
                let content = cache::content_hash(&composed.png);
                info!(
                    atlas = atlas_id,
                    width = w,
                    height = h,
                    items = layout.items.len(),
                    bytes = content.len,
                    "atlas built"
                );
                outcome.report.atlases_built += 1;
                *slot = Some(Resource {
                    id: atlas_id,
                    name: format!("{}#{}", group.name(), n),
                    kind: ResourceKind::Atlas,
                    tags: BTreeSet::new(),
                    episodes: BTreeSet::new(),
                    source: binary.clone(),
                    reference: ResourceRef::Binary(binary),
                    geometry: Some(ResourceGeometry::new(w, h, Rect::new(0, 0, w, h))),
                    post_process: Some(PostProcessRecord {
                        operations: key.operations.clone(),
                        media_bundle_id: BTreeSet::from([ctx.build_id]),
                        content,
                    }),
                });
                atlas_id
            }
        };
        drop(slot);
        outcome.atlases.push(atlas_id);
        apply_placements(&mut members, layout, atlas_id)?;
        outcome.bytes_before += sources_size(ctx.store, &members, layout);
    }

    for id in plan
        .skipped
        .iter()
        .chain(plan.unpackable.iter())
        .chain(failed.iter())
    {
        if let Some(r) = members.get_mut(id) {
            r.restore_direct_reference();
        }
    }

    let report = &mut outcome.report;
    report.packed = plan.packed_count();
    report.skipped = plan.skipped.len();
    report.unpackable = plan.unpackable.len();
    report.failed = failed.len();
    report.solver_invocations = plan.solver_invocations;

    outcome.updated = order
        .iter()
        .filter_map(|id| members.remove(id))
        .collect();
    Ok(outcome)
}

fn sources_size<S: ResourceStore + ?Sized>(
    store: &S,
    members: &HashMap<ResourceId, Resource>,
    layout: &AcceptedLayout,
) -> u64 {
    layout
        .items
        .iter()
        .filter_map(|item| members.get(&item.id))
        .map(|r| match store.size(&r.source) {
            Ok(n) => n,
            Err(e) => {
                warn!(id = r.id, error = %e, "source size unavailable");
                0
            }
        })
        .sum()
}
