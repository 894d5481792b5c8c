//! Model selection: the bundled DnCNN network or a user-supplied `.onnx` file.
//!
//! The runtime loads models from a filesystem path, so the built-in model is
//! copied to a uniquely named temporary file first. That copy is removed when
//! the returned [`ResolvedModel`] is dropped.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::{log_info, log_warn};

/// Logical name of the bundled model.
pub const BUILT_IN_MODEL_NAME: &str = "dncnn.onnx";

/// Overrides the directory searched for the bundled model.
pub const MODEL_DIR_ENV: &str = "NIA_MODEL_DIR";

/// Which network a run should use.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModelSource {
    BuiltIn,
    Custom(PathBuf),
}

impl ModelSource {
    pub fn label(&self) -> String {
        match self {
            ModelSource::BuiltIn => "Built-in (DnCNN)".to_string(),
            ModelSource::Custom(p) => format!("Custom ONNX ({})", p.display()),
        }
    }
}

#[derive(Debug)]
pub enum ModelError {
    /// Custom path was left blank.
    EmptyPath,
    /// Custom model file does not exist.
    NotFound(PathBuf),
    /// Bundled model could not be located in any search directory.
    BuiltInMissing(Vec<PathBuf>),
    /// Copying the bundled model to the temp directory failed.
    Materialize(std::io::Error),
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::EmptyPath => write!(f, "No custom model selected"),
            ModelError::NotFound(p) => write!(f, "Model not found: {}", p.display()),
            ModelError::BuiltInMissing(searched) => {
                write!(f, "Built-in model not found: {} (searched", BUILT_IN_MODEL_NAME)?;
                for dir in searched {
                    write!(f, " {}", dir.display())?;
                }
                write!(f, ")")
            }
            ModelError::Materialize(e) => write!(f, "Could not extract built-in model: {}", e),
        }
    }
}

impl std::error::Error for ModelError {}

/// A model path ready to hand to the runtime.
#[derive(Debug)]
pub struct ResolvedModel {
    path: PathBuf,
    temporary: bool,
}

impl ResolvedModel {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_temporary(&self) -> bool {
        self.temporary
    }
}

impl Drop for ResolvedModel {
    fn drop(&mut self) {
        if !self.temporary {
            return;
        }
        if let Err(e) = fs::remove_file(&self.path) {
            log_warn!("Failed to remove temp model {}: {}", self.path.display(), e);
        }
    }
}

/// Directories searched for the bundled model, in priority order.
pub fn built_in_search_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(dir) = std::env::var_os(MODEL_DIR_ENV).filter(|v| !v.is_empty()) {
        dirs.push(PathBuf::from(dir));
    }
    if let Some(exe_dir) = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf))
    {
        dirs.push(exe_dir.join("models"));
        dirs.push(exe_dir);
    }
    dirs
}

/// Resolve a model source to a loadable path.
pub fn resolve(source: &ModelSource) -> Result<ResolvedModel, ModelError> {
    resolve_in(source, &built_in_search_dirs(), &std::env::temp_dir())
}

/// [`resolve`] with explicit search and temp directories.
pub fn resolve_in(
    source: &ModelSource,
    search_dirs: &[PathBuf],
    temp_dir: &Path,
) -> Result<ResolvedModel, ModelError> {
    match source {
        ModelSource::Custom(path) => {
            if path.as_os_str().is_empty() {
                return Err(ModelError::EmptyPath);
            }
            if !path.is_file() {
                return Err(ModelError::NotFound(path.clone()));
            }
            let path = fs::canonicalize(path).unwrap_or_else(|_| path.clone());
            Ok(ResolvedModel { path, temporary: false })
        }
        ModelSource::BuiltIn => {
            let bundled = search_dirs
                .iter()
                .map(|d| d.join(BUILT_IN_MODEL_NAME))
                .find(|p| p.is_file())
                .ok_or_else(|| ModelError::BuiltInMissing(search_dirs.to_vec()))?;
            let target = temp_dir.join(format!("nia_model_{}.onnx", uuid::Uuid::new_v4()));
            log_info!("Extracting {} to {}", bundled.display(), target.display());
            fs::copy(&bundled, &target).map_err(ModelError::Materialize)?;
            Ok(ResolvedModel { path: target, temporary: true })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("nia_model_test_{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn custom_path_must_exist() {
        let dir = scratch_dir();
        assert!(matches!(
            resolve_in(&ModelSource::Custom(PathBuf::new()), &[], &dir),
            Err(ModelError::EmptyPath)
        ));
        assert!(matches!(
            resolve_in(&ModelSource::Custom(dir.join("nope.onnx")), &[], &dir),
            Err(ModelError::NotFound(_))
        ));

        let model = dir.join("mine.onnx");
        fs::write(&model, b"graph").unwrap();
        let resolved = resolve_in(&ModelSource::Custom(model.clone()), &[], &dir).unwrap();
        assert!(!resolved.is_temporary());
        drop(resolved);
        assert!(model.exists());
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn built_in_is_materialized_and_cleaned_up() {
        let dir = scratch_dir();
        let models = dir.join("models");
        fs::create_dir_all(&models).unwrap();
        fs::write(models.join(BUILT_IN_MODEL_NAME), b"dncnn").unwrap();

        let resolved = resolve_in(&ModelSource::BuiltIn, &[dir.join("empty"), models], &dir).unwrap();
        let temp = resolved.path().to_path_buf();
        assert!(resolved.is_temporary());
        assert_eq!(fs::read(&temp).unwrap(), b"dncnn");
        drop(resolved);
        assert!(!temp.exists());
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn missing_built_in_lists_searched_dirs() {
        let dir = scratch_dir();
        let err = resolve_in(&ModelSource::BuiltIn, &[dir.clone()], &dir).unwrap_err();
        assert!(matches!(err, ModelError::BuiltInMissing(ref d) if d.len() == 1));
        assert!(err.to_string().contains(BUILT_IN_MODEL_NAME));
        fs::remove_dir_all(&dir).unwrap();
    }
}
