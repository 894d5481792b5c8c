// ============================================================================
// APP SETTINGS: persisted `key=value` file in the user config directory
// ============================================================================

use std::path::PathBuf;

use crate::model::ModelSource;
use crate::ops::pipeline::{DEFAULT_PROGRESS_EVERY, RunRequest, TraversalOptions};

/// Upper bound on per-slice retries accepted from the config file or CLI.
pub const MAX_SLICE_RETRIES: u32 = 10;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppSettings {
    /// Path to onnxruntime.dll / libonnxruntime.so
    pub onnx_runtime_path: String,
    /// Use `custom_model_path` instead of the bundled DnCNN model
    pub use_custom_model: bool,
    pub custom_model_path: String,
    /// Show the session log pane in the main window
    pub show_log: bool,
    /// Extra inference attempts per slice
    pub slice_retries: u32,
    /// Report progress every N slices
    pub progress_every: usize,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            onnx_runtime_path: String::new(),
            use_custom_model: false,
            custom_model_path: String::new(),
            show_log: true,
            slice_retries: 0,
            progress_every: DEFAULT_PROGRESS_EVERY,
        }
    }
}

impl AppSettings {
    /// Path to the settings file.
    /// On Linux:   ~/.config/nia/nia_settings.cfg  (XDG_CONFIG_HOME respected)
    /// On Windows: %APPDATA%\NIA\nia_settings.cfg
    /// On macOS:   ~/Library/Application Support/NIA/nia_settings.cfg
    /// Fallback:   same directory as the executable.
    pub(crate) fn settings_path() -> Option<PathBuf> {
        #[cfg(target_os = "linux")]
        {
            let config_dir = std::env::var("XDG_CONFIG_HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|_| {
                    let home = std::env::var("HOME").unwrap_or_else(|_| "~".to_string());
                    PathBuf::from(home).join(".config")
                })
                .join("nia");
            let _ = std::fs::create_dir_all(&config_dir);
            return Some(config_dir.join("nia_settings.cfg"));
        }
        #[cfg(target_os = "windows")]
        {
            let appdata = std::env::var("APPDATA")
                .or_else(|_| std::env::var("USERPROFILE"))
                .unwrap_or_else(|_| {
                    std::env::current_exe()
                        .ok()
                        .and_then(|p| p.parent().map(|d| d.to_string_lossy().into_owned()))
                        .unwrap_or_default()
                });
            let config_dir = PathBuf::from(appdata).join("NIA");
            let _ = std::fs::create_dir_all(&config_dir);
            return Some(config_dir.join("nia_settings.cfg"));
        }
        #[cfg(target_os = "macos")]
        {
            let home = std::env::var("HOME").unwrap_or_else(|_| "~".to_string());
            let config_dir = PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("NIA");
            let _ = std::fs::create_dir_all(&config_dir);
            return Some(config_dir.join("nia_settings.cfg"));
        }
        #[cfg(not(any(target_os = "linux", target_os = "windows", target_os = "macos")))]
        {
            std::env::current_exe()
                .ok()
                .and_then(|p| p.parent().map(|d| d.join("nia_settings.cfg")))
        }
    }

    /// Model selection as configured.
    pub fn model_source(&self) -> ModelSource {
        if self.use_custom_model {
            ModelSource::Custom(PathBuf::from(self.custom_model_path.trim()))
        } else {
            ModelSource::BuiltIn
        }
    }

    /// A run request built from these settings.
    pub fn run_request(&self) -> RunRequest {
        RunRequest {
            model: self.model_source(),
            options: TraversalOptions {
                retries: self.slice_retries.min(MAX_SLICE_RETRIES),
                progress_every: self.progress_every.max(1),
            },
        }
    }

    pub fn to_config_string(&self) -> String {
        format!(
            "onnx_runtime_path={}\n\
             use_custom_model={}\n\
             custom_model_path={}\n\
             show_log={}\n\
             slice_retries={}\n\
             progress_every={}\n",
            self.onnx_runtime_path,
            self.use_custom_model,
            self.custom_model_path,
            self.show_log,
            self.slice_retries,
            self.progress_every,
        )
    }

    /// Parse a settings file. Unknown keys and bad values fall back to defaults.
    pub fn from_config_str(content: &str) -> Self {
        let mut s = Self::default();
        for line in content.lines() {
            let Some((key, val)) = line.split_once('=') else { continue };
            let key = key.trim();
            let val = val.trim();
            match key {
                "onnx_runtime_path" => {
                    s.onnx_runtime_path = val.to_string();
                }
                "use_custom_model" => {
                    s.use_custom_model = val == "true";
                }
                "custom_model_path" => {
                    s.custom_model_path = val.to_string();
                }
                "show_log" => {
                    s.show_log = val == "true";
                }
                "slice_retries" => {
                    s.slice_retries = val.parse::<u32>().unwrap_or(0).min(MAX_SLICE_RETRIES);
                }
                "progress_every" => {
                    s.progress_every = val
                        .parse::<usize>()
                        .ok()
                        .filter(|&n| n > 0)
                        .unwrap_or(DEFAULT_PROGRESS_EVERY);
                }
                _ => {}
            }
        }
        s
    }

    /// Save settings to disk
    pub fn save(&self) {
        let Some(path) = Self::settings_path() else { return };
        if let Err(e) = std::fs::write(&path, self.to_config_string()) {
            crate::log_warn!("Could not save settings to {}: {}", path.display(), e);
        }
    }

    /// Load settings from disk (returns default if file missing or corrupt)
    pub fn load() -> Self {
        let Some(path) = Self::settings_path() else { return Self::default() };
        let Ok(content) = std::fs::read_to_string(&path) else { return Self::default() };
        Self::from_config_str(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_round_trip() {
        let s = AppSettings {
            onnx_runtime_path: "/opt/ort/lib/libonnxruntime.so.1.18.0".into(),
            use_custom_model: true,
            custom_model_path: "/data/models/n2v.onnx".into(),
            show_log: false,
            slice_retries: 2,
            progress_every: 1,
        };
        assert_eq!(AppSettings::from_config_str(&s.to_config_string()), s);
    }

    #[test]
    fn bad_values_fall_back_to_defaults() {
        let s = AppSettings::from_config_str(
            "slice_retries=lots\nprogress_every=0\nmystery=1\nno equals sign\n",
        );
        assert_eq!(s, AppSettings::default());

        let s = AppSettings::from_config_str("slice_retries=999\n");
        assert_eq!(s.slice_retries, MAX_SLICE_RETRIES);
    }

    #[test]
    fn log_pane_starts_visible() {
        assert!(AppSettings::default().show_log);
        assert!(AppSettings::from_config_str("").show_log);
        assert!(!AppSettings::from_config_str("show_log=false\n").show_log);
    }

    #[test]
    fn model_source_follows_toggle() {
        let mut s = AppSettings::default();
        s.custom_model_path = " /m/custom.onnx ".into();
        assert_eq!(s.model_source(), ModelSource::BuiltIn);
        s.use_custom_model = true;
        assert_eq!(s.model_source(), ModelSource::Custom(PathBuf::from("/m/custom.onnx")));
        assert_eq!(s.run_request().options.progress_every, DEFAULT_PROGRESS_EVERY);
    }
}
