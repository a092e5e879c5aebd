use crate::error::Result;
use crate::model::Rect;

pub mod maxrects;

/// Result of one solver attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackOutcome {
    /// All rectangles were placed; `width`/`height` is the tight container around them.
    Fit { width: u32, height: u32 },
    /// At least one rectangle did not fit within the size limit.
    NoFit,
}

/// Options forwarded to the solver on every attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SolveOptions {
    /// Free 90° rotation per item.
    pub allow_rotation: bool,
    /// Pixels reserved between items.
    pub padding: u32,
}

/// A rectangle-packing solver.
///
/// `solve` receives candidates with `x = y = 0` in their source orientation and must place
/// all of them inside a `size_limit` square without overlaps. On `Fit` every rect carries
/// its final position; a rotated item is transposed and has `flipped` set. On `NoFit` the
/// rect contents are unspecified. `Err` is reserved for genuine solver failures.
pub trait Solver {
    fn solve(&mut self, rects: &mut [Rect], size_limit: u32, opts: &SolveOptions)
    -> Result<PackOutcome>;
}

impl<S: Solver + ?Sized> Solver for Box<S> {
    fn solve(
        &mut self,
        rects: &mut [Rect],
        size_limit: u32,
        opts: &SolveOptions,
    ) -> Result<PackOutcome> {
        (**self).solve(rects, size_limit, opts)
    }
}
