// ============================================================================
// DENOISE PIPELINE: slice traversal, write-back, and the background run
// ============================================================================
//
// A run: resolve model → load session → global factor → every (t, z, c)
// plane through the adapter → native bit depth → write back in place.
//
// Slices are processed strictly one after another on a single worker
// thread. A slice whose inference fails keeps its original pixels.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::adapter;
use super::ai::{InferenceSession, OnnxError, SessionFactory};
use super::normalize::compute_factor;
use crate::model::{self, ModelError, ModelSource};
use crate::stack::{ImageStack, PlaneData, StackCoord};
use crate::{log_err, log_info, log_warn};

/// Default progress throttle: report every N slices (and always the last).
pub const DEFAULT_PROGRESS_EVERY: usize = 5;

/// Receives `(count, total)` during traversal.
pub trait ProgressSink {
    fn on_progress(&mut self, count: usize, total: usize);
}

impl<F: FnMut(usize, usize)> ProgressSink for F {
    fn on_progress(&mut self, count: usize, total: usize) {
        self(count, total)
    }
}

/// Cooperative cancellation flag shared between the UI and the worker.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Knobs for the per-slice loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TraversalOptions {
    /// Extra attempts per slice after a failed inference call.
    pub retries: u32,
    /// Progress is reported every this many slices (0 is treated as 1).
    pub progress_every: usize,
}

impl Default for TraversalOptions {
    fn default() -> Self {
        Self { retries: 0, progress_every: DEFAULT_PROGRESS_EVERY }
    }
}

/// What happened during one traversal.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TraversalReport {
    pub total: usize,
    /// Slices that were written back.
    pub processed: usize,
    /// Slices left untouched because inference produced nothing usable.
    pub skipped: Vec<StackCoord>,
    pub cancelled: bool,
}

impl TraversalReport {
    /// Coordinates visited (processed or skipped).
    pub fn visited(&self) -> usize {
        self.processed + self.skipped.len()
    }
}

/// Run every plane of `stack` through `session`, in place.
pub fn process<S: InferenceSession + ?Sized>(
    stack: &mut ImageStack,
    session: &mut S,
    factor: f64,
    options: TraversalOptions,
    sink: &mut dyn ProgressSink,
    cancel: &CancelToken,
) -> TraversalReport {
    let total = stack.len();
    let (width, height) = (stack.width(), stack.height());
    let format = stack.format();
    let every = options.progress_every.max(1);
    let mut report = TraversalReport { total, ..Default::default() };

    for (i, coord) in stack.coords().enumerate() {
        if cancel.is_cancelled() {
            log_warn!("Run cancelled after {}/{} slices", i, total);
            report.cancelled = true;
            break;
        }
        let count = i + 1;
        if count % every == 0 || count == total {
            sink.on_progress(count, total);
        }

        let index = stack.stack_index(coord);
        let result = match stack.plane(index) {
            Ok(plane) => adapter::infer(session, plane, width, height, factor, options.retries),
            Err(e) => {
                log_err!("Slice {} ({}): {}", index, coord, e);
                None
            }
        };

        let Some(result) = result else {
            log_warn!("Slice {} ({}) skipped, original pixels kept", index, coord);
            report.skipped.push(coord);
            continue;
        };
        if result.width != width || result.height != height {
            log_warn!(
                "Slice {} ({}) skipped: network returned {}x{} for a {}x{} stack",
                index,
                coord,
                result.width,
                result.height,
                width,
                height
            );
            report.skipped.push(coord);
            continue;
        }

        let converted = PlaneData::from_f32(format, &result.data);
        match stack.set_plane(index, converted) {
            Ok(()) => report.processed += 1,
            Err(e) => {
                log_err!("Slice {} ({}) write-back failed: {}", index, coord, e);
                report.skipped.push(coord);
            }
        }
    }

    report
}

/// Everything a run needs besides the stack and the runtime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunRequest {
    pub model: ModelSource,
    pub options: TraversalOptions,
}

impl RunRequest {
    pub fn new(model: ModelSource) -> Self {
        Self { model, options: TraversalOptions::default() }
    }
}

/// Fatal run errors. Per-slice failures never show up here.
#[derive(Debug)]
pub enum RunError {
    /// Bad selection or missing file; nothing was loaded.
    Config(String),
    /// The runtime or model could not be loaded; nothing was mutated.
    Load(OnnxError),
    /// The worker thread died before reporting.
    Worker(String),
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunError::Config(msg) => write!(f, "Configuration error: {}", msg),
            RunError::Load(e) => write!(f, "Load error: {}", e),
            RunError::Worker(msg) => write!(f, "Worker error: {}", msg),
        }
    }
}

impl std::error::Error for RunError {}

impl From<ModelError> for RunError {
    fn from(e: ModelError) -> Self {
        RunError::Config(e.to_string())
    }
}

impl From<OnnxError> for RunError {
    fn from(e: OnnxError) -> Self {
        RunError::Load(e)
    }
}

/// Outcome of a completed (or cancelled) run.
#[derive(Clone, Debug, PartialEq)]
pub struct RunSummary {
    pub duration: Duration,
    pub factor: f64,
    pub total: usize,
    pub processed: usize,
    pub skipped: Vec<StackCoord>,
    pub cancelled: bool,
}

impl RunSummary {
    /// User-facing completion line.
    pub fn message(&self) -> String {
        let ms = self.duration.as_millis();
        if self.cancelled {
            format!(
                "Cancelled after {}/{} slices ({}ms)",
                self.processed + self.skipped.len(),
                self.total,
                ms
            )
        } else if self.skipped.is_empty() {
            format!("Finished in {}ms", ms)
        } else {
            format!("Finished in {}ms ({} of {} slices skipped)", ms, self.skipped.len(), self.total)
        }
    }
}

/// Messages from the worker to whoever started the run.
#[derive(Debug)]
pub enum RunEvent {
    /// Session loaded and factor computed; determinate progress from here.
    Started { total: usize, factor: f64 },
    Progress { count: usize, total: usize },
    Finished { stack: ImageStack, summary: RunSummary },
    Cancelled { stack: ImageStack, summary: RunSummary },
    Failed { stack: ImageStack, error: RunError },
}

impl RunEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunEvent::Finished { .. } | RunEvent::Cancelled { .. } | RunEvent::Failed { .. }
        )
    }
}

/// Integer percentage for a `(count, total)` pair.
pub fn percent(count: usize, total: usize) -> u32 {
    if total == 0 {
        return 0;
    }
    ((count as f64 / total as f64) * 100.0) as u32
}

/// Denoise `stack` in place on the current thread.
///
/// `on_started` fires once the session is loaded and the factor is known.
/// The session and any temporary model file are released before returning,
/// on every path.
pub fn run_denoise<F: SessionFactory + ?Sized>(
    stack: &mut ImageStack,
    request: &RunRequest,
    factory: &F,
    on_started: &mut dyn FnMut(usize, f64),
    sink: &mut dyn ProgressSink,
    cancel: &CancelToken,
) -> Result<RunSummary, RunError> {
    log_info!("Model: {}", request.model.label());
    let resolved = model::resolve(&request.model)?;
    run_with_model(stack, resolved.path().to_path_buf(), request.options, factory, on_started, sink, cancel)
}

/// [`run_denoise`] after model resolution. `model_path` must be loadable.
pub fn run_with_model<F: SessionFactory + ?Sized>(
    stack: &mut ImageStack,
    model_path: PathBuf,
    options: TraversalOptions,
    factory: &F,
    on_started: &mut dyn FnMut(usize, f64),
    sink: &mut dyn ProgressSink,
    cancel: &CancelToken,
) -> Result<RunSummary, RunError> {
    let start = Instant::now();
    let mut session = factory.load(&model_path).map_err(|e| {
        log_err!("Model load failed: {}", e);
        RunError::Load(e)
    })?;

    let factor = compute_factor(stack);
    log_info!(
        "{} | input '{}' | normalization factor {}",
        stack.describe(),
        session.input_name(),
        factor
    );
    on_started(stack.len(), factor);

    let report = process(stack, &mut session, factor, options, sink, cancel);
    drop(session);

    let summary = RunSummary {
        duration: start.elapsed(),
        factor,
        total: report.total,
        processed: report.processed,
        skipped: report.skipped,
        cancelled: report.cancelled,
    };
    log_info!("{}", summary.message());
    Ok(summary)
}

/// Handle to a run executing on its own thread.
pub struct RunHandle {
    receiver: mpsc::Receiver<RunEvent>,
    cancel: CancelToken,
    thread: Option<JoinHandle<()>>,
    finished: bool,
}

impl RunHandle {
    /// Next pending event, without blocking.
    pub fn try_recv(&mut self) -> Option<RunEvent> {
        match self.receiver.try_recv() {
            Ok(event) => {
                self.note(&event);
                Some(event)
            }
            Err(mpsc::TryRecvError::Empty) => None,
            Err(mpsc::TryRecvError::Disconnected) => self.worker_died(),
        }
    }

    /// Next event, blocking until one arrives. `None` after the terminal event.
    pub fn recv(&mut self) -> Option<RunEvent> {
        if self.finished {
            return None;
        }
        match self.receiver.recv() {
            Ok(event) => {
                self.note(&event);
                Some(event)
            }
            Err(mpsc::RecvError) => self.worker_died(),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn note(&mut self, event: &RunEvent) {
        if event.is_terminal() {
            self.finished = true;
            if let Some(thread) = self.thread.take() {
                let _ = thread.join();
            }
        }
    }

    // The worker always sends a terminal event unless it panicked; the stack
    // it owned is lost in that case.
    fn worker_died(&mut self) -> Option<RunEvent> {
        if self.finished {
            return None;
        }
        self.finished = true;
        let reason = match self.thread.take().map(|t| t.join()) {
            Some(Err(_)) => "denoising thread panicked",
            _ => "denoising thread exited without reporting",
        };
        log_err!("{}", reason);
        None
    }
}

/// Start a run on a dedicated thread. The stack moves into the worker and
/// comes back in the terminal event.
pub fn spawn_run<F>(mut stack: ImageStack, request: RunRequest, factory: F) -> RunHandle
where
    F: SessionFactory + Send + 'static,
{
    let (sender, receiver) = mpsc::channel();
    let cancel = CancelToken::new();
    let worker_cancel = cancel.clone();

    let thread = std::thread::spawn(move || {
        let started_tx = sender.clone();
        let progress_tx = sender.clone();
        let mut on_started = move |total: usize, factor: f64| {
            let _ = started_tx.send(RunEvent::Started { total, factor });
        };
        let mut sink = move |count: usize, total: usize| {
            let _ = progress_tx.send(RunEvent::Progress { count, total });
        };

        let result = run_denoise(&mut stack, &request, &factory, &mut on_started, &mut sink, &worker_cancel);
        let event = match result {
            Ok(summary) if summary.cancelled => RunEvent::Cancelled { stack, summary },
            Ok(summary) => RunEvent::Finished { stack, summary },
            Err(error) => {
                log_err!("{}", error);
                RunEvent::Failed { stack, error }
            }
        };
        let _ = sender.send(event);
    });

    RunHandle { receiver, cancel, thread: Some(thread), finished: false }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::ai::TensorOutput;
    use crate::stack::StackDims;

    /// Adds `offset` to every normalized value and records call order.
    struct Offset {
        offset: f32,
        calls: Vec<Vec<f32>>,
    }

    impl InferenceSession for Offset {
        fn input_name(&self) -> &str {
            "input"
        }

        fn run_nhwc(
            &mut self,
            input: &mut [f32],
            height: usize,
            width: usize,
        ) -> Result<TensorOutput, OnnxError> {
            self.calls.push(input.to_vec());
            Ok(TensorOutput {
                height,
                width,
                data: input.iter().map(|v| v + self.offset).collect(),
            })
        }
    }

    fn labelled_stack(c: usize, z: usize, t: usize) -> ImageStack {
        let dims = StackDims { width: 1, height: 1, channels: c, slices: z, frames: t };
        let planes = (1..=dims.plane_count())
            .map(|i| PlaneData::Gray16(vec![i as u16 * 10]))
            .collect();
        ImageStack::new(dims, planes).unwrap()
    }

    #[test]
    fn visits_planes_in_linear_order_and_writes_back() {
        let mut stack = labelled_stack(2, 2, 2);
        let mut session = Offset { offset: 0.0, calls: Vec::new() };
        let factor = compute_factor(&stack);
        let report = process(
            &mut stack,
            &mut session,
            factor,
            TraversalOptions::default(),
            &mut |_: usize, _: usize| {},
            &CancelToken::new(),
        );
        assert_eq!(report.processed, 8);
        assert!(report.skipped.is_empty());
        let seen: Vec<f32> = session.calls.iter().map(|c| c[0] * 80.0).collect();
        let expected: Vec<f32> = (1..=8).map(|i| i as f32 * 10.0).collect();
        for (a, b) in seen.iter().zip(&expected) {
            assert!((a - b).abs() < 1e-3);
        }
        assert_eq!(stack, labelled_stack(2, 2, 2));
    }

    #[test]
    fn progress_is_throttled_but_always_reports_the_last_slice() {
        let mut stack = labelled_stack(1, 12, 1);
        let mut session = Offset { offset: 0.0, calls: Vec::new() };
        let mut reported = Vec::new();
        process(
            &mut stack,
            &mut session,
            120.0,
            TraversalOptions { retries: 0, progress_every: 5 },
            &mut |count: usize, total: usize| reported.push((count, total)),
            &CancelToken::new(),
        );
        assert_eq!(reported, vec![(5, 12), (10, 12), (12, 12)]);
    }

    #[test]
    fn eight_bit_write_back_is_clamped() {
        let dims = StackDims { width: 2, height: 1, channels: 1, slices: 1, frames: 1 };
        let mut stack = ImageStack::new(dims, vec![PlaneData::Gray8(vec![100, 200])]).unwrap();
        let mut session = Offset { offset: 1.0, calls: Vec::new() };
        process(
            &mut stack,
            &mut session,
            200.0,
            TraversalOptions::default(),
            &mut |_: usize, _: usize| {},
            &CancelToken::new(),
        );
        // 100/200 + 1 = 1.5 → 300 → 255; 200/200 + 1 = 2 → 400 → 255
        assert_eq!(stack.plane(1).unwrap(), &PlaneData::Gray8(vec![255, 255]));
    }

    #[test]
    fn cancelled_token_stops_before_the_first_slice() {
        let mut stack = labelled_stack(1, 3, 1);
        let original = stack.clone();
        let mut session = Offset { offset: 1.0, calls: Vec::new() };
        let cancel = CancelToken::new();
        cancel.cancel();
        let report = process(
            &mut stack,
            &mut session,
            30.0,
            TraversalOptions::default(),
            &mut |_: usize, _: usize| {},
            &cancel,
        );
        assert!(report.cancelled);
        assert_eq!(report.visited(), 0);
        assert!(session.calls.is_empty());
        assert_eq!(stack, original);
    }

    #[test]
    fn mismatched_output_size_is_skipped() {
        struct Shrink;
        impl InferenceSession for Shrink {
            fn input_name(&self) -> &str {
                "input"
            }
            fn run_nhwc(&mut self, _: &mut [f32], _: usize, _: usize) -> Result<TensorOutput, OnnxError> {
                Ok(TensorOutput { height: 1, width: 1, data: vec![0.5] })
            }
        }
        let dims = StackDims { width: 2, height: 2, channels: 1, slices: 1, frames: 1 };
        let mut stack = ImageStack::new(dims, vec![PlaneData::Gray8(vec![1, 2, 3, 4])]).unwrap();
        let original = stack.clone();
        let report = process(
            &mut stack,
            &mut Shrink,
            4.0,
            TraversalOptions::default(),
            &mut |_: usize, _: usize| {},
            &CancelToken::new(),
        );
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(stack, original);
    }

    #[test]
    fn summary_messages() {
        let mut summary = RunSummary {
            duration: Duration::from_millis(42),
            factor: 1.0,
            total: 6,
            processed: 6,
            skipped: vec![],
            cancelled: false,
        };
        assert_eq!(summary.message(), "Finished in 42ms");
        summary.processed = 2;
        summary.cancelled = true;
        assert_eq!(summary.message(), "Cancelled after 2/6 slices (42ms)");
        assert_eq!(percent(5, 12), 41);
        assert_eq!(percent(12, 12), 100);
        assert_eq!(percent(0, 0), 0);
    }
}
