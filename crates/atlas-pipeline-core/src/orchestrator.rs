//! Shrink/retry/rollback driver around a [`Solver`].
//!
//! One [`PackOrchestrator::plan`] call turns a bundle group into a list of accepted
//! layouts. The search is an explicit loop over `(task, deferred, size_limit)`:
//!
//! - a solver miss moves the largest remaining item to the front of `deferred` and retries
//!   at the same size limit;
//! - a good enough fit is retried at half the size limit, and rolled back to the previous
//!   fit if the smaller page cannot hold the same items. A miss during such a shrink
//!   attempt never defers items;
//! - an accepted layout restarts the search with the deferred items at full size.

use crate::config::PipelineConfig;
use crate::error::{AtlasPipelineError, Result};
use crate::model::{Rect, ResourceGeometry, ResourceId};
use crate::packer::{PackOutcome, SolveOptions, Solver};
use tracing::{debug, warn};

/// One resource taking part in packing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackItem {
    pub id: ResourceId,
    /// Envelope size; position and orientation once solved.
    pub rect: Rect,
    pub raw_width: u32,
    pub raw_height: u32,
}

impl PackItem {
    pub fn new(id: ResourceId, geometry: &ResourceGeometry) -> Self {
        Self {
            id,
            rect: Rect::new(0, 0, geometry.envelope.w, geometry.envelope.h),
            raw_width: geometry.raw_width,
            raw_height: geometry.raw_height,
        }
    }

    pub fn raw_area(&self) -> u64 {
        self.raw_width as u64 * self.raw_height as u64
    }

    /// Back to an unplaced candidate in source orientation.
    fn reset(&mut self) {
        if self.rect.flipped {
            self.rect.transpose();
        }
        self.rect.x = 0;
        self.rect.y = 0;
    }
}

/// A finalized layout handed to compositing and caching.
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptedLayout {
    /// Items in task order with solved positions.
    pub items: Vec<PackItem>,
    /// Tight container reported by the solver.
    pub container: (u32, u32),
    /// Size limit the layout was solved at.
    pub size_limit: u32,
    /// Packed area over power-of-two container area.
    pub space_usage: f64,
}

impl AcceptedLayout {
    /// Power-of-two canvas enclosing the container.
    pub fn canvas_size(&self) -> (u32, u32) {
        (
            next_pow2(self.container.0),
            next_pow2(self.container.1),
        )
    }

    pub fn ids(&self) -> Vec<ResourceId> {
        self.items.iter().map(|i| i.id).collect()
    }
}

/// Everything decided for one bundle group.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PackPlan {
    pub layouts: Vec<AcceptedLayout>,
    /// Passed through unpacked: alone in their pass, or larger than the size limit.
    pub skipped: Vec<ResourceId>,
    /// Could not be packed even after every backoff.
    pub unpackable: Vec<ResourceId>,
    pub solver_invocations: usize,
}

impl PackPlan {
    pub fn packed_count(&self) -> usize {
        self.layouts.iter().map(|l| l.items.len()).sum()
    }
}

/// Quality verdict for a successful solver attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PackQuality {
    pub space_usage: f64,
    pub wasting_space: bool,
    pub valid: bool,
}

/// Rates a fit: usage over the power-of-two container, and whether the untrimmed sources
/// would not even fill that container.
pub fn evaluate(items: &[PackItem], container: (u32, u32), cfg: &PipelineConfig) -> PackQuality {
    let container_area = next_pow2(container.0) as u64 * next_pow2(container.1) as u64;
    let packed_area: u64 = items.iter().map(|i| i.rect.area()).sum();
    let raw_area: u64 = items.iter().map(PackItem::raw_area).sum();
    let space_usage = if container_area > 0 {
        packed_area as f64 / container_area as f64
    } else {
        0.0
    };
    let wasting_space = raw_area < container_area;
    let valid = space_usage > cfg.ideal_ratio
        || (space_usage > cfg.required_ratio && !wasting_space);
    PackQuality {
        space_usage,
        wasting_space,
        valid,
    }
}

pub fn next_pow2(v: u32) -> u32 {
    v.max(1).next_power_of_two()
}

struct Snapshot {
    items: Vec<PackItem>,
    container: (u32, u32),
    size_limit: u32,
    space_usage: f64,
}

pub struct PackOrchestrator<'a, S: Solver> {
    solver: S,
    cfg: &'a PipelineConfig,
}

impl<'a, S: Solver> PackOrchestrator<'a, S> {
    pub fn new(solver: S, cfg: &'a PipelineConfig) -> Self {
        Self { solver, cfg }
    }

    pub fn into_solver(self) -> S {
        self.solver
    }

    fn options(&self) -> SolveOptions {
        SolveOptions {
            allow_rotation: self.cfg.allow_rotation,
            padding: self.cfg.texture_padding,
        }
    }

    fn fits_alone(&self, item: &PackItem, size_limit: u32) -> bool {
        let pad = self.cfg.texture_padding;
        let (w, h) = (item.rect.w + pad, item.rect.h + pad);
        if self.cfg.allow_rotation {
            w.max(h) <= size_limit
        } else {
            w <= size_limit && h <= size_limit
        }
    }

    /// Plans atlases for `items`. Input order only matters as the tie-break among equal areas.
    pub fn plan(&mut self, items: Vec<PackItem>) -> Result<PackPlan> {
        let max = self.cfg.max_dimension;
        let pad = self.cfg.texture_padding;
        let opts = self.options();
        let mut plan = PackPlan::default();

        let (mut task, oversized): (Vec<PackItem>, Vec<PackItem>) =
            items.into_iter().partition(|i| self.fits_alone(i, max));
        for item in oversized {
            warn!(
                id = item.id,
                w = item.rect.w,
                h = item.rect.h,
                max,
                "resource exceeds atlas size limit; skipped"
            );
            plan.skipped.push(item.id);
        }
        // ascending area: the largest item is popped first on a miss
        task.sort_by(|a, b| a.rect.area().cmp(&b.rect.area()).then(a.id.cmp(&b.id)));

        let mut deferred: Vec<PackItem> = Vec::new();
        let mut size_limit = max;
        let mut gave_up_shrinking = false;
        let mut fallback: Option<Snapshot> = None;

        loop {
            if task.is_empty() {
                if !deferred.is_empty() {
                    warn!(count = deferred.len(), "some resources could not be packed at all");
                    plan.unpackable.extend(deferred.iter().map(|i| i.id));
                }
                break;
            }
            if task.len() == 1 {
                // a single image gains nothing from atlasing
                plan.skipped.push(task[0].id);
                task = std::mem::take(&mut deferred);
                size_limit = max;
                gave_up_shrinking = false;
                continue;
            }

            for item in task.iter_mut() {
                item.reset();
            }
            let mut rects: Vec<Rect> = task.iter().map(|i| i.rect).collect();
            plan.solver_invocations += 1;
            let outcome = self.solver.solve(&mut rects, size_limit, &opts)?;
            debug!(items = task.len(), size_limit, ?outcome, "solver attempt");

            let accepted = match outcome {
                PackOutcome::NoFit => match fallback.take() {
                    Some(prev) => {
                        // the smaller page cannot hold the same items: keep the last valid fit
                        gave_up_shrinking = true;
                        task = prev.items;
                        size_limit = prev.size_limit;
                        AcceptedLayout {
                            items: task.clone(),
                            container: prev.container,
                            size_limit: prev.size_limit,
                            space_usage: prev.space_usage,
                        }
                    }
                    None => {
                        if let Some(largest) = task.pop() {
                            deferred.insert(0, largest);
                        }
                        continue;
                    }
                },
                PackOutcome::Fit { width, height } => {
                    for (item, rect) in task.iter_mut().zip(rects) {
                        item.rect = rect;
                    }
                    let container = (width, height);
                    let quality = evaluate(&task, container, self.cfg);
                    let largest_side = task.iter().map(|i| i.rect.max_side() + pad).max();
                    let half = size_limit / 2;
                    if quality.valid
                        && task.len() > 1
                        && largest_side.is_some_and(|s| s <= half)
                        && !gave_up_shrinking
                    {
                        if half < 1 {
                            return Err(AtlasPipelineError::CapacityExhausted { size_limit });
                        }
                        debug!(
                            usage = quality.space_usage,
                            from = size_limit,
                            to = half,
                            "trying a smaller atlas"
                        );
                        fallback = Some(Snapshot {
                            items: task.clone(),
                            container,
                            size_limit,
                            space_usage: quality.space_usage,
                        });
                        size_limit = half;
                        continue;
                    }
                    fallback = None;
                    AcceptedLayout {
                        items: task.clone(),
                        container,
                        size_limit,
                        space_usage: quality.space_usage,
                    }
                }
            };

            debug!(
                items = accepted.items.len(),
                canvas = ?accepted.canvas_size(),
                usage = accepted.space_usage,
                "layout accepted"
            );
            plan.layouts.push(accepted);
            task = std::mem::take(&mut deferred);
            size_limit = max;
            gave_up_shrinking = false;
        }
        Ok(plan)
    }
}
