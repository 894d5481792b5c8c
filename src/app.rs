// ============================================================================
// NIA APP: single-window GUI around the denoising pipeline
// ============================================================================
//
// The stack is moved into the worker thread for the duration of a run and
// handed back in the terminal event. The UI thread only polls the event
// channel; it never blocks on the worker.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use eframe::egui;

use crate::io::{self, denoised_path};
use crate::ops::ai::{OrtLoader, probe_onnx_runtime, resolve_runtime_path};
use crate::ops::pipeline::{RunEvent, RunHandle, percent, spawn_run};
use crate::settings::AppSettings;
use crate::stack::{ImageStack, PlaneData};
use crate::{log_err, log_info};

/// How long a terminal status stays up before reverting to "Ready".
const STATUS_HOLD: Duration = Duration::from_secs(2);

/// Longest side of the plane preview, in points.
const PREVIEW_SIZE: f32 = 320.0;

pub struct DenoiseApp {
    settings: AppSettings,
    stack: Option<ImageStack>,
    stack_path: Option<PathBuf>,
    /// Shown while the stack is away on the worker thread.
    stack_info: String,
    run: Option<RunHandle>,
    /// `(count, total)` once the session is loaded; `None` = indeterminate.
    progress: Option<(usize, usize)>,
    status: String,
    status_reset_at: Option<Instant>,
    runtime_version: Option<String>,
    /// Set when the stack holds denoised pixels not yet written to disk.
    unsaved: bool,
    preview: Option<egui::TextureHandle>,
    /// 1-based plane shown in the preview.
    preview_plane: usize,
    /// Texture must be rebuilt from the current stack.
    preview_dirty: bool,
}

impl DenoiseApp {
    pub fn new(_cc: &eframe::CreationContext<'_>) -> Self {
        Self::with_settings(AppSettings::load())
    }

    pub fn with_settings(settings: AppSettings) -> Self {
        Self {
            settings,
            stack: None,
            stack_path: None,
            stack_info: String::new(),
            run: None,
            progress: None,
            status: "Ready".to_string(),
            status_reset_at: None,
            runtime_version: None,
            unsaved: false,
            preview: None,
            preview_plane: 1,
            preview_dirty: false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.run.is_some()
    }

    fn set_status(&mut self, status: impl Into<String>, hold: bool) {
        self.status = status.into();
        self.status_reset_at = hold.then(|| Instant::now() + STATUS_HOLD);
    }

    fn open_stack(&mut self) {
        let Some(path) = io::pick_stack_path() else { return };
        match io::load_stack(&path) {
            Ok(stack) => {
                self.stack_info = stack.describe();
                self.stack = Some(stack);
                self.stack_path = Some(path);
                self.unsaved = false;
                self.preview_plane = 1;
                self.preview_dirty = true;
                self.set_status("Ready", false);
            }
            Err(e) => {
                log_err!("Open {} failed: {}", path.display(), e);
                self.set_status(format!("Open failed: {}", e), true);
            }
        }
    }

    fn save_stack(&mut self) {
        let Some(stack) = &self.stack else { return };
        let suggested = self
            .stack_path
            .as_deref()
            .map(denoised_path)
            .unwrap_or_else(|| PathBuf::from("denoised.tif"));
        let Some(path) = io::pick_save_path(&suggested) else { return };
        match io::save_stack(stack, &path) {
            Ok(()) => {
                self.unsaved = false;
                self.set_status(format!("Saved {}", path.display()), true);
            }
            Err(e) => {
                log_err!("Save {} failed: {}", path.display(), e);
                self.set_status(format!("Save failed: {}", e), true);
            }
        }
    }

    fn check_runtime(&mut self) {
        let Some(path) = resolve_runtime_path(&self.settings.onnx_runtime_path) else {
            self.set_status("No ONNX Runtime library set", true);
            return;
        };
        match probe_onnx_runtime(&path) {
            Ok(version) => {
                log_info!("[AI] ONNX Runtime {} at {}", version, path.display());
                self.set_status(format!("ONNX Runtime {} OK", version), true);
                self.runtime_version = Some(version);
            }
            Err(e) => {
                self.runtime_version = None;
                self.set_status(e.to_string(), true);
            }
        }
    }

    /// Validate the selection and hand the stack to a worker thread.
    fn start_run(&mut self) {
        if self.run.is_some() {
            return;
        }
        let Some(runtime) = resolve_runtime_path(&self.settings.onnx_runtime_path) else {
            self.set_status("Configuration error: set the ONNX Runtime library first", true);
            return;
        };
        let Some(stack) = self.stack.take() else {
            self.set_status("Configuration error: open a stack first", true);
            return;
        };
        self.settings.save();
        let request = self.settings.run_request();
        log_info!("Starting run on {}", stack.describe());
        self.progress = None;
        self.set_status("Loading model…", false);
        self.run = Some(spawn_run(stack, request, OrtLoader::new(runtime)));
    }

    /// Drain pending worker events.
    pub fn poll_run(&mut self) {
        let Some(mut handle) = self.run.take() else { return };
        while let Some(event) = handle.try_recv() {
            self.apply_event(event);
        }
        if handle.is_finished() {
            if self.stack.is_none() {
                // Worker died without returning the stack
                self.stack_info.clear();
                self.stack_path = None;
                self.preview_dirty = true;
                self.set_status("Denoising thread crashed; stack lost (see log)", true);
            }
        } else {
            self.run = Some(handle);
        }
    }

    pub fn apply_event(&mut self, event: RunEvent) {
        match event {
            RunEvent::Started { total, factor } => {
                self.progress = Some((0, total));
                self.set_status(format!("Denoising {} slices (factor {})", total, factor), false);
            }
            RunEvent::Progress { count, total } => {
                self.progress = Some((count, total));
                self.set_status(format!("Slice {}/{} ({}%)", count, total, percent(count, total)), false);
            }
            RunEvent::Finished { stack, summary } | RunEvent::Cancelled { stack, summary } => {
                self.unsaved |= summary.processed > 0;
                self.stack = Some(stack);
                self.preview_dirty = true;
                self.progress = None;
                self.set_status(summary.message(), true);
            }
            RunEvent::Failed { stack, error } => {
                self.stack = Some(stack);
                self.preview_dirty = true;
                self.progress = None;
                self.set_status(error.to_string(), true);
            }
        }
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn tick_status(&mut self, now: Instant) {
        if let Some(at) = self.status_reset_at
            && now >= at
            && self.run.is_none()
        {
            self.status = "Ready".to_string();
            self.status_reset_at = None;
        }
    }

    fn refresh_preview(&mut self, ctx: &egui::Context) {
        if !self.preview_dirty {
            return;
        }
        self.preview_dirty = false;
        let Some(stack) = &self.stack else {
            self.preview = None;
            return;
        };
        self.preview_plane = self.preview_plane.clamp(1, stack.len());
        match stack.plane(self.preview_plane) {
            Ok(plane) => {
                let image = preview_image(plane, stack.width(), stack.height());
                let texture = ctx.load_texture("plane_preview", image, egui::TextureOptions::LINEAR);
                self.preview = Some(texture);
            }
            Err(e) => {
                log_err!("Preview of plane {} failed: {}", self.preview_plane, e);
                self.preview = None;
            }
        }
    }

    fn preview_panel(&mut self, ui: &mut egui::Ui) {
        let Some(texture) = &self.preview else { return };
        let [w, h] = texture.size();
        let scale = PREVIEW_SIZE / w.max(h).max(1) as f32;
        let size = egui::vec2(w as f32 * scale, h as f32 * scale);
        let sized = egui::load::SizedTexture::from_handle(texture);
        ui.add(egui::Image::from_texture(sized).fit_to_exact_size(size));

        let Some(stack) = &self.stack else { return };
        if stack.len() > 1 {
            let coord = stack.coords().nth(self.preview_plane - 1);
            let mut plane = self.preview_plane;
            ui.horizontal(|ui| {
                ui.label("Plane:");
                ui.add(egui::Slider::new(&mut plane, 1..=stack.len()));
                if let Some(c) = coord {
                    ui.weak(c.to_string());
                }
            });
            if plane != self.preview_plane {
                self.preview_plane = plane;
                self.preview_dirty = true;
                ui.ctx().request_repaint();
            }
        }
    }

    fn model_panel(&mut self, ui: &mut egui::Ui) {
        let enabled = !self.is_running();
        ui.add_enabled_ui(enabled, |ui| {
            ui.horizontal(|ui| {
                ui.label("Model:");
                ui.radio_value(&mut self.settings.use_custom_model, false, "Built-in (DnCNN)");
                ui.radio_value(&mut self.settings.use_custom_model, true, "Custom ONNX");
            });
            if self.settings.use_custom_model {
                ui.horizontal(|ui| {
                    ui.text_edit_singleline(&mut self.settings.custom_model_path);
                    if ui.button("Browse…").clicked()
                        && let Some(p) = io::pick_model_path()
                    {
                        self.settings.custom_model_path = p.to_string_lossy().into_owned();
                    }
                });
            }
            ui.horizontal(|ui| {
                ui.label("ONNX Runtime:");
                ui.text_edit_singleline(&mut self.settings.onnx_runtime_path);
                if ui.button("Browse…").clicked()
                    && let Some(p) = io::pick_runtime_path()
                {
                    self.settings.onnx_runtime_path = p.to_string_lossy().into_owned();
                }
                if ui.button("Check").clicked() {
                    self.check_runtime();
                }
            });
            if let Some(v) = &self.runtime_version {
                ui.weak(format!("Runtime version {}", v));
            }
            ui.horizontal(|ui| {
                ui.label("Retries per slice:");
                ui.add(egui::DragValue::new(&mut self.settings.slice_retries).clamp_range(0..=10));
                ui.label("Progress every:");
                ui.add(egui::DragValue::new(&mut self.settings.progress_every).clamp_range(1..=1000));
            });
        });
    }
}

impl eframe::App for DenoiseApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.poll_run();
        self.tick_status(Instant::now());

        // Keep polling while a run is active or a status is waiting to reset
        if self.run.is_some() {
            ctx.request_repaint();
        } else if let Some(at) = self.status_reset_at {
            ctx.request_repaint_after(at.saturating_duration_since(Instant::now()));
        }

        egui::TopBottomPanel::bottom("status_bar").show(ctx, |ui| {
            ui.horizontal(|ui| {
                if self.is_running() && self.progress.is_none() {
                    ui.spinner();
                }
                ui.label(&self.status);
            });
        });

        egui::CentralPanel::default().show(ctx, |ui| {
            ui.heading(format!("NIA Denoise {}", env!("CARGO_PKG_VERSION")));
            ui.separator();
            self.model_panel(ui);
            ui.separator();

            ui.horizontal(|ui| {
                let idle = !self.is_running();
                if ui.add_enabled(idle, egui::Button::new("Open stack…")).clicked() {
                    self.open_stack();
                }
                let can_run = idle && self.stack.is_some();
                if ui.add_enabled(can_run, egui::Button::new("Denoise")).clicked() {
                    self.start_run();
                }
                if ui.add_enabled(!idle, egui::Button::new("Cancel")).clicked()
                    && let Some(run) = &self.run
                {
                    run.cancel();
                    self.set_status("Cancelling…", false);
                }
                let can_save = idle && self.stack.is_some();
                let label = if self.unsaved { "Save result…*" } else { "Save result…" };
                if ui.add_enabled(can_save, egui::Button::new(label)).clicked() {
                    self.save_stack();
                }
            });

            if let Some(path) = &self.stack_path {
                ui.label(path.display().to_string());
            }
            if !self.stack_info.is_empty() {
                ui.label(&self.stack_info);
            }

            if let Some((count, total)) = self.progress {
                let fraction = if total == 0 { 0.0 } else { count as f32 / total as f32 };
                ui.add(egui::ProgressBar::new(fraction).show_percentage());
            }

            self.refresh_preview(ctx);
            self.preview_panel(ui);

            ui.separator();
            ui.checkbox(&mut self.settings.show_log, "Show Log");
            if self.settings.show_log {
                egui::ScrollArea::vertical()
                    .stick_to_bottom(true)
                    .max_height(ui.available_height())
                    .show(ui, |ui| {
                        for line in crate::logger::recent_lines() {
                            ui.monospace(line);
                        }
                    });
            }
        });
    }

    fn on_exit(&mut self, _gl: Option<&eframe::glow::Context>) {
        if let Some(run) = &self.run {
            run.cancel();
        }
        self.settings.save();
    }
}

/// Grayscale preview of one plane, stretched so the darkest finite value is
/// black and the brightest is white. Flat planes and non-finite pixels are black.
pub fn preview_image(plane: &PlaneData, width: usize, height: usize) -> egui::ColorImage {
    let values = plane.to_f32();
    let (lo, hi) = values
        .iter()
        .filter(|v| v.is_finite())
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let range = hi - lo;
    let pixels = values
        .iter()
        .map(|&v| {
            let level = if range > 0.0 && v.is_finite() {
                ((v - lo) / range * 255.0).round() as u8
            } else {
                0
            };
            egui::Color32::from_gray(level)
        })
        .collect();
    egui::ColorImage { size: [width, height], pixels }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::pipeline::{RunError, RunSummary};
    use crate::stack::PlaneData;

    fn stack() -> ImageStack {
        ImageStack::single(1, 1, PlaneData::Gray8(vec![7])).unwrap()
    }

    #[test]
    fn events_drive_progress_and_status() {
        let mut app = DenoiseApp::with_settings(AppSettings::default());
        app.apply_event(RunEvent::Started { total: 10, factor: 7.0 });
        assert_eq!(app.progress, Some((0, 10)));
        app.apply_event(RunEvent::Progress { count: 5, total: 10 });
        assert_eq!(app.status(), "Slice 5/10 (50%)");

        let summary = RunSummary {
            duration: Duration::from_millis(12),
            factor: 7.0,
            total: 10,
            processed: 10,
            skipped: vec![],
            cancelled: false,
        };
        app.apply_event(RunEvent::Finished { stack: stack(), summary });
        assert_eq!(app.status(), "Finished in 12ms");
        assert!(app.stack.is_some());
        assert!(app.progress.is_none());
        assert!(app.unsaved);
        assert!(app.preview_dirty);
    }

    #[test]
    fn preview_stretches_to_full_gray_range() {
        let plane = PlaneData::Gray16(vec![100, 200, 300, 300]);
        let image = preview_image(&plane, 2, 2);
        assert_eq!(image.size, [2, 2]);
        let levels: Vec<u8> = image.pixels.iter().map(|p| p.r()).collect();
        assert_eq!(levels, vec![0, 128, 255, 255]);

        let flat = preview_image(&PlaneData::Gray8(vec![9; 3]), 3, 1);
        assert!(flat.pixels.iter().all(|p| p.r() == 0));

        let float = preview_image(&PlaneData::Gray32(vec![f32::NAN, -1.0, 1.0]), 3, 1);
        let levels: Vec<u8> = float.pixels.iter().map(|p| p.r()).collect();
        assert_eq!(levels, vec![0, 0, 255]);
    }

    #[test]
    fn terminal_status_reverts_to_ready() {
        let mut app = DenoiseApp::with_settings(AppSettings::default());
        app.apply_event(RunEvent::Failed {
            stack: stack(),
            error: RunError::Config("No custom model selected".into()),
        });
        assert!(app.status().starts_with("Configuration error"));
        app.tick_status(Instant::now());
        assert_ne!(app.status(), "Ready");
        app.tick_status(Instant::now() + STATUS_HOLD + Duration::from_millis(1));
        assert_eq!(app.status(), "Ready");
    }
}
