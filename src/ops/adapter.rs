// ============================================================================
// TENSOR ADAPTER: one plane in, one denoised float plane out
// ============================================================================
//
// plane → f32 → ÷factor → (1, H, W, 1) → session → ×factor → clamp ≥ 0
//
// Failures never propagate: the caller gets `None` and leaves the slice as is.

use std::panic::{AssertUnwindSafe, catch_unwind};

use super::ai::{InferenceSession, OnnxError};
use super::normalize::effective_factor;
use crate::stack::{FloatPlane, PlaneData};
use crate::{log_err, log_warn};

/// Build the normalized NHWC input buffer for one plane.
pub fn normalize_plane(plane: &PlaneData, factor: f64) -> Vec<f32> {
    let scale = effective_factor(factor);
    let mut pixels = plane.to_f32();
    for v in pixels.iter_mut() {
        *v /= scale;
    }
    pixels
}

/// Denormalize a network output in place and clip negatives (and NaN) to 0.
pub fn denormalize(values: &mut [f32], factor: f64) {
    let scale = effective_factor(factor);
    for v in values.iter_mut() {
        let x = *v * scale;
        *v = if x > 0.0 { x } else { 0.0 };
    }
}

fn infer_once<S: InferenceSession + ?Sized>(
    session: &mut S,
    plane: &PlaneData,
    width: usize,
    height: usize,
    factor: f64,
) -> Result<FloatPlane, OnnxError> {
    if plane.len() != width * height {
        return Err(OnnxError::InferenceFailed(format!(
            "plane holds {} pixels, expected {}x{}",
            plane.len(),
            width,
            height
        )));
    }
    let mut input = normalize_plane(plane, factor);
    let output = session.run_nhwc(&mut input, height, width)?;
    if output.data.len() != output.width * output.height {
        return Err(OnnxError::InvalidOutput(format!(
            "output holds {} values for a {}x{} shape",
            output.data.len(),
            output.width,
            output.height
        )));
    }
    let mut data = output.data;
    denormalize(&mut data, factor);
    Ok(FloatPlane { width: output.width, height: output.height, data })
}

/// Run one plane through the network.
///
/// The session call is attempted up to `1 + retries` times. Errors and
/// panics are logged and turned into `None`.
pub fn infer<S: InferenceSession + ?Sized>(
    session: &mut S,
    plane: &PlaneData,
    width: usize,
    height: usize,
    factor: f64,
    retries: u32,
) -> Option<FloatPlane> {
    let attempts = retries.saturating_add(1);
    for attempt in 1..=attempts {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            infer_once(session, plane, width, height, factor)
        }));
        match outcome {
            Ok(Ok(result)) => return Some(result),
            Ok(Err(e)) => {
                if attempt < attempts {
                    log_warn!("[AI] Inference attempt {}/{} failed: {}", attempt, attempts, e);
                } else {
                    log_err!("[AI] Inference error: {}", e);
                }
            }
            Err(panic_info) => {
                let msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_info.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic payload".to_string()
                };
                log_err!("[AI] Inference panicked: {}", msg);
                // A panic may have left the session in an unknown state.
                return None;
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::ai::TensorOutput;

    /// Echoes its input, optionally failing the first `fail_first` calls.
    struct Echo {
        calls: usize,
        fail_first: usize,
        seen: Vec<Vec<f32>>,
    }

    impl Echo {
        fn new(fail_first: usize) -> Self {
            Self { calls: 0, fail_first, seen: Vec::new() }
        }
    }

    impl InferenceSession for Echo {
        fn input_name(&self) -> &str {
            "input"
        }

        fn run_nhwc(
            &mut self,
            input: &mut [f32],
            height: usize,
            width: usize,
        ) -> Result<TensorOutput, OnnxError> {
            self.calls += 1;
            self.seen.push(input.to_vec());
            if self.calls <= self.fail_first {
                return Err(OnnxError::InferenceFailed("transient".into()));
            }
            Ok(TensorOutput { height, width, data: input.to_vec() })
        }
    }

    /// Returns a fixed output regardless of input.
    struct Fixed(TensorOutput);

    impl InferenceSession for Fixed {
        fn input_name(&self) -> &str {
            "x"
        }

        fn run_nhwc(&mut self, _: &mut [f32], _: usize, _: usize) -> Result<TensorOutput, OnnxError> {
            Ok(self.0.clone())
        }
    }

    struct Panics;

    impl InferenceSession for Panics {
        fn input_name(&self) -> &str {
            "x"
        }

        fn run_nhwc(&mut self, _: &mut [f32], _: usize, _: usize) -> Result<TensorOutput, OnnxError> {
            panic!("kernel exploded")
        }
    }

    #[test]
    fn normalizes_by_factor_and_restores_scale() {
        let plane = PlaneData::Gray16(vec![0, 250, 500, 1000]);
        let mut s = Echo::new(0);
        let out = infer(&mut s, &plane, 2, 2, 1000.0, 0).unwrap();
        assert_eq!(s.seen[0], vec![0.0, 0.25, 0.5, 1.0]);
        assert_eq!((out.width, out.height), (2, 2));
        assert_eq!(out.data, vec![0.0, 250.0, 500.0, 1000.0]);
        assert_eq!(plane, PlaneData::Gray16(vec![0, 250, 500, 1000]));
    }

    #[test]
    fn non_positive_factor_falls_back_to_one() {
        let plane = PlaneData::Gray8(vec![3, 7]);
        let mut s = Echo::new(0);
        infer(&mut s, &plane, 2, 1, 0.0, 0).unwrap();
        infer(&mut s, &plane, 2, 1, -4.0, 0).unwrap();
        assert_eq!(s.seen[0], vec![3.0, 7.0]);
        assert_eq!(s.seen[1], vec![3.0, 7.0]);
    }

    #[test]
    fn negative_outputs_are_clipped() {
        let mut s = Fixed(TensorOutput {
            height: 1,
            width: 4,
            data: vec![-0.01, 0.5, f32::NAN, -3.0],
        });
        let out = infer(&mut s, &PlaneData::Gray8(vec![1, 2, 3, 4]), 4, 1, 10.0, 0).unwrap();
        assert!(out.data.iter().all(|&v| v >= 0.0));
        assert_eq!(out.data, vec![0.0, 5.0, 0.0, 0.0]);
    }

    #[test]
    fn output_may_change_spatial_size() {
        let mut s = Fixed(TensorOutput { height: 1, width: 2, data: vec![0.5, 1.0] });
        let out = infer(&mut s, &PlaneData::Gray32(vec![1.0; 4]), 2, 2, 2.0, 0).unwrap();
        assert_eq!((out.width, out.height), (2, 1));
        assert_eq!(out.data, vec![1.0, 2.0]);
    }

    #[test]
    fn failures_become_none() {
        let mut s = Echo::new(usize::MAX);
        assert!(infer(&mut s, &PlaneData::Gray8(vec![1]), 1, 1, 1.0, 0).is_none());
        assert_eq!(s.calls, 1);

        let mut bad = Fixed(TensorOutput { height: 2, width: 2, data: vec![1.0] });
        assert!(infer(&mut bad, &PlaneData::Gray8(vec![1]), 1, 1, 1.0, 0).is_none());

        assert!(infer(&mut Panics, &PlaneData::Gray8(vec![1]), 1, 1, 1.0, 3).is_none());
    }

    #[test]
    fn bounded_retry_recovers_transient_failures() {
        let mut s = Echo::new(2);
        let out = infer(&mut s, &PlaneData::Gray8(vec![4]), 1, 1, 4.0, 2).unwrap();
        assert_eq!(s.calls, 3);
        assert_eq!(out.data, vec![4.0]);

        let mut s = Echo::new(5);
        assert!(infer(&mut s, &PlaneData::Gray8(vec![4]), 1, 1, 4.0, 2).is_none());
        assert_eq!(s.calls, 3);
    }
}
