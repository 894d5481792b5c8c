// ============================================================================
// NORMALIZATION: one global scale factor per run
// ============================================================================

use rayon::prelude::*;

use crate::stack::ImageStack;

/// Global maximum over every plane of the stack, or `None` when the stack
/// holds no finite value.
pub fn stack_max(stack: &ImageStack) -> Option<f64> {
    stack
        .planes()
        .par_iter()
        .filter_map(|p| p.max_value())
        .reduce_with(f64::max)
}

/// Scale factor applied to every slice of a run.
///
/// The stack's global maximum, or 1.0 when that maximum is not positive
/// (all-zero and empty stacks).
pub fn compute_factor(stack: &ImageStack) -> f64 {
    match stack_max(stack) {
        Some(max) if max > 0.0 => max,
        _ => 1.0,
    }
}

/// The factor the tensor adapter actually divides and multiplies by.
#[inline]
pub fn effective_factor(factor: f64) -> f32 {
    let f = factor as f32;
    if f.is_finite() && f > 0.0 { f } else { 1.0 }
}
