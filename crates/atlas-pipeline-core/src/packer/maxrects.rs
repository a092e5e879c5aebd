use super::{PackOutcome, SolveOptions, Solver};
use crate::error::Result;
use crate::model::Rect;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// MaxRects placement heuristics.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MaxRectsHeuristic {
    #[default]
    BestAreaFit,
    BestShortSideFit,
    BestLongSideFit,
    BottomLeft,
    ContactPoint,
}

impl FromStr for MaxRectsHeuristic {
    type Err = ();
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "baf" | "bestareafit" => Ok(Self::BestAreaFit),
            "bssf" | "bestshortsidefit" => Ok(Self::BestShortSideFit),
            "blsf" | "bestlongsidefit" => Ok(Self::BestLongSideFit),
            "bl" | "bottomleft" => Ok(Self::BottomLeft),
            "cp" | "contactpoint" => Ok(Self::ContactPoint),
            _ => Err(()),
        }
    }
}

/// Free-list bin for a single square page.
struct MaxRectsBin {
    border: Rect,
    free: Vec<Rect>,
    used: Vec<Rect>,
    heuristic: MaxRectsHeuristic,
    allow_rotation: bool,
}

impl MaxRectsBin {
    fn new(size: u32, heuristic: MaxRectsHeuristic, allow_rotation: bool) -> Self {
        let border = Rect::new(0, 0, size, size);
        Self {
            border,
            free: vec![border],
            used: Vec::new(),
            heuristic,
            allow_rotation,
        }
    }

    fn place_rect(&mut self, node: &Rect) {
        // split all free rectangles that intersect with node
        let mut new_free: Vec<Rect> = Vec::new();
        for fr in self.free.iter() {
            if !fr.intersects(node) {
                new_free.push(*fr);
                continue;
            }
            let ix1 = fr.x.max(node.x);
            let iy1 = fr.y.max(node.y);
            let ix2 = fr.right().min(node.right());
            let iy2 = fr.bottom().min(node.bottom());

            // above
            if iy1 > fr.y {
                new_free.push(Rect::new(fr.x, fr.y, fr.w, iy1 - fr.y));
            }
            // below
            if iy2 < fr.bottom() {
                new_free.push(Rect::new(fr.x, iy2, fr.w, fr.bottom() - iy2));
            }
            // left
            if ix1 > fr.x {
                new_free.push(Rect::new(fr.x, fr.y, ix1 - fr.x, fr.h));
            }
            // right
            if ix2 < fr.right() {
                new_free.push(Rect::new(ix2, fr.y, fr.right() - ix2, fr.h));
            }
        }

        self.free = new_free;
        self.prune_free_list();
        self.used.push(*node);
    }

    fn prune_free_list(&mut self) {
        let mut i = 0;
        while i < self.free.len() {
            let a = self.free[i];
            let mut remove_i = false;
            let mut j = i + 1;
            while j < self.free.len() {
                let b = self.free[j];
                // if a inside b
                if b.contains(&a) {
                    remove_i = true;
                    break;
                }
                // if b inside a
                if a.contains(&b) {
                    self.free.remove(j);
                    continue;
                }
                j += 1;
            }
            if remove_i {
                self.free.remove(i);
            } else {
                i += 1;
            }
        }
    }

    fn score(&self, fr: &Rect, w: u32, h: u32) -> (i64, i64) {
        let leftover_h = fr.w as i64 - w as i64;
        let leftover_v = fr.h as i64 - h as i64;
        let short_fit = leftover_h.abs().min(leftover_v.abs());
        let long_fit = leftover_h.abs().max(leftover_v.abs());
        let area_fit = fr.area() as i64 - (w as i64 * h as i64);
        match self.heuristic {
            MaxRectsHeuristic::BestAreaFit => (area_fit, short_fit),
            MaxRectsHeuristic::BestShortSideFit => (short_fit, long_fit),
            MaxRectsHeuristic::BestLongSideFit => (long_fit, short_fit),
            MaxRectsHeuristic::BottomLeft => (fr.y as i64, fr.x as i64),
            MaxRectsHeuristic::ContactPoint => {
                // maximize contact score: use negative for minimization
                let contact = self.contact_point_score(fr.x, fr.y, w, h);
                (-(contact as i64), area_fit)
            }
        }
    }

    /// Best free position for a `w x h` slot; the bool is true when the slot is rotated.
    fn find_position(&self, w: u32, h: u32) -> Option<(Rect, bool)> {
        let mut best: Option<(Rect, bool)> = None;
        let mut best_key = (i64::MAX, i64::MAX, u32::MAX, u32::MAX);

        for fr in &self.free {
            // normal
            if fr.w >= w && fr.h >= h {
                // perfect fit early-out
                if fr.w == w && fr.h == h {
                    return Some((Rect::new(fr.x, fr.y, w, h), false));
                }
                let (s1, s2) = self.score(fr, w, h);
                // tie-break: prefer smaller top side (y + h), then smaller x
                let key = (s1, s2, fr.y.saturating_add(h), fr.x);
                if key < best_key {
                    best_key = key;
                    best = Some((Rect::new(fr.x, fr.y, w, h), false));
                }
            }
            // rotated
            if self.allow_rotation && w != h && fr.w >= h && fr.h >= w {
                if fr.w == h && fr.h == w {
                    return Some((Rect::new(fr.x, fr.y, h, w), true));
                }
                let (s1, s2) = self.score(fr, h, w);
                let key = (s1, s2, fr.y.saturating_add(w), fr.x);
                if key < best_key {
                    best_key = key;
                    best = Some((Rect::new(fr.x, fr.y, h, w), true));
                }
            }
        }
        best
    }

    fn contact_point_score(&self, x: u32, y: u32, w: u32, h: u32) -> u32 {
        let node = Rect::new(x, y, w, h);
        let mut score = 0u32;
        // contact with borders
        if node.x == self.border.x {
            score += node.h;
        }
        if node.y == self.border.y {
            score += node.w;
        }
        if node.right() == self.border.right() {
            score += node.h;
        }
        if node.bottom() == self.border.bottom() {
            score += node.w;
        }

        // contact with used rectangles
        for u in &self.used {
            // vertical contact (left/right edges)
            if node.x == u.right() || u.x == node.right() {
                score += overlap_1d(node.y, node.bottom(), u.y, u.bottom());
            }
            // horizontal contact (top/bottom edges)
            if node.y == u.bottom() || u.y == node.bottom() {
                score += overlap_1d(node.x, node.right(), u.x, u.right());
            }
        }
        score
    }
}

fn overlap_1d(a1: u32, a2: u32, b1: u32, b2: u32) -> u32 {
    let start = a1.max(b1);
    let end = a2.min(b2);
    end.saturating_sub(start)
}

/// MaxRects implementation of [`Solver`]: square page of `size_limit`, items placed
/// largest-area first.
#[derive(Debug, Clone, Default)]
pub struct MaxRectsSolver {
    heuristic: MaxRectsHeuristic,
}

impl MaxRectsSolver {
    pub fn new(heuristic: MaxRectsHeuristic) -> Self {
        Self { heuristic }
    }
}

impl Solver for MaxRectsSolver {
    fn solve(
        &mut self,
        rects: &mut [Rect],
        size_limit: u32,
        opts: &SolveOptions,
    ) -> Result<PackOutcome> {
        let mut bin = MaxRectsBin::new(size_limit, self.heuristic, opts.allow_rotation);
        let pad = opts.padding;
        let pad_half = pad / 2;
        let pad_rem = pad - pad_half;

        // stable: equal areas keep caller order
        let mut order: Vec<usize> = (0..rects.len()).collect();
        order.sort_by(|&a, &b| rects[b].area().cmp(&rects[a].area()));

        let (mut width, mut height) = (0u32, 0u32);
        for idx in order {
            let r = &mut rects[idx];
            let Some((slot, rotated)) = bin.find_position(r.w + pad, r.h + pad) else {
                return Ok(PackOutcome::NoFit);
            };
            bin.place_rect(&slot);
            if rotated {
                r.transpose();
            }
            // content sits inside the reserved slot, offset by half the padding
            r.x = slot.x + pad_half;
            r.y = slot.y + pad_half;
            width = width.max(r.right() + pad_rem);
            height = height.max(r.bottom() + pad_rem);
        }
        Ok(PackOutcome::Fit {
            width: width.min(size_limit),
            height: height.min(size_limit),
        })
    }
}
