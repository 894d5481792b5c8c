// ============================================================================
// NIA CLI: headless denoising via command-line arguments
// ============================================================================
//
// Usage examples:
//   nia-denoise -i cells.tif -o cells_clean.tif
//   nia-denoise -i "plates/*.tif" --output-dir denoised/ --retries 1
//   nia-denoise -i stack.tif -m n2v.onnx --onnx-runtime /opt/ort/libonnxruntime.so -v
//
// No GUI is opened in CLI mode. Each stack is denoised synchronously on the
// current thread; a failing file is reported and the batch moves on.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;

use crate::io::{denoised_path, load_stack, save_stack};
use crate::model::ModelSource;
use crate::ops::ai::{OrtLoader, resolve_runtime_path};
use crate::ops::pipeline::{CancelToken, RunRequest, percent, run_denoise};
use crate::settings::{AppSettings, MAX_SLICE_RETRIES};

// ============================================================================
// CLI argument definition (clap Derive)
// ============================================================================

/// NIA headless stack denoiser.
#[derive(Parser, Debug)]
#[command(
    name = "nia-denoise",
    version,
    about = "Denoise microscopy image stacks with a DnCNN ONNX model",
    long_about = "Run every plane of a TIFF hyperstack (or a single PNG) through a\n\
                  DnCNN-style ONNX network and write the result at the original bit\n\
                  depth. Opens the GUI when no --input is given.\n\n\
                  Example:\n  \
                  nia-denoise -i cells.tif -o cells_clean.tif\n  \
                  nia-denoise -i \"*.tif\" --output-dir out/ -m custom.onnx"
)]
pub struct CliArgs {
    /// Input file(s). Glob patterns accepted (e.g. "*.tif", "plate1/*.tiff").
    #[arg(short, long, required = true, num_args = 1..)]
    pub input: Vec<String>,

    /// Output file path. Only valid for single-file input.
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Output directory for batch processing. Files keep their original name.
    #[arg(long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Custom ONNX model. The bundled DnCNN model is used when omitted.
    #[arg(short, long, value_name = "MODEL.onnx")]
    pub model: Option<PathBuf>,

    /// ONNX Runtime shared library. Falls back to the saved setting, then ORT_DYLIB_PATH.
    #[arg(long, value_name = "LIB")]
    pub onnx_runtime: Option<PathBuf>,

    /// Extra inference attempts per slice before it is skipped.
    #[arg(long, value_name = "N")]
    pub retries: Option<u32>,

    /// Report progress every N slices.
    #[arg(long, value_name = "N")]
    pub progress_every: Option<usize>,

    /// Print log lines and per-slice progress.
    #[arg(short, long)]
    pub verbose: bool,
}

impl CliArgs {
    /// Returns `true` when any CLI-mode flag is present in the real process arguments.
    /// Used by `main()` to route before creating an eframe window.
    pub fn is_cli_mode() -> bool {
        std::env::args().any(|a| {
            matches!(a.as_str(), "--input" | "-i" | "--help" | "-h" | "--version" | "-V")
        })
    }
}

// ============================================================================
// Public entry point
// ============================================================================

/// Run all CLI processing and return an OS exit code.
/// `0` = all files succeeded, `1` = one or more files failed.
pub fn run(args: CliArgs) -> ExitCode {
    crate::logger::set_echo(args.verbose);

    let inputs = resolve_inputs(&args.input);
    if inputs.is_empty() {
        eprintln!("error: no input files matched the given pattern(s).");
        return ExitCode::FAILURE;
    }

    if inputs.len() > 1 && args.output.is_some() && args.output_dir.is_none() {
        eprintln!(
            "error: {} input files given but --output only accepts a single file path.\n\
             Use --output-dir to specify a destination directory for batch processing.",
            inputs.len()
        );
        return ExitCode::FAILURE;
    }

    let settings = AppSettings::load();
    let configured = args
        .onnx_runtime
        .as_ref()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|| settings.onnx_runtime_path.clone());
    let Some(runtime) = resolve_runtime_path(&configured) else {
        eprintln!(
            "error: no ONNX Runtime library configured.\n\
             Pass --onnx-runtime <LIB> or set ORT_DYLIB_PATH."
        );
        return ExitCode::FAILURE;
    };
    let factory = OrtLoader::new(runtime);

    let request = build_request(&args, &settings);

    if let Some(dir) = &args.output_dir
        && let Err(e) = std::fs::create_dir_all(dir)
    {
        eprintln!(
            "error: could not create output directory '{}': {}",
            dir.display(),
            e
        );
        return ExitCode::FAILURE;
    }

    let total = inputs.len();
    let multi = total > 1;
    let mut any_failure = false;

    for (idx, input_path) in inputs.iter().enumerate() {
        if multi || args.verbose {
            println!("[{}/{}] {}", idx + 1, total, input_path.display());
        }

        let file_start = Instant::now();
        let output_path =
            build_output_path(input_path, args.output.as_deref(), args.output_dir.as_deref());

        match run_one(input_path, &output_path, &request, &factory, args.verbose) {
            Ok(message) => {
                println!(
                    "  → {} | {} ({:.0}ms total)",
                    output_path.display(),
                    message,
                    file_start.elapsed().as_secs_f64() * 1000.0
                );
            }
            Err(e) => {
                eprintln!("  error: {}", e);
                any_failure = true;
            }
        }
    }

    if any_failure { ExitCode::FAILURE } else { ExitCode::SUCCESS }
}

fn build_request(args: &CliArgs, settings: &AppSettings) -> RunRequest {
    let mut request = settings.run_request();
    if let Some(model) = &args.model {
        request.model = ModelSource::Custom(model.clone());
    }
    if let Some(retries) = args.retries {
        request.options.retries = retries.min(MAX_SLICE_RETRIES);
    }
    if let Some(every) = args.progress_every {
        request.options.progress_every = every.max(1);
    }
    request
}

// ============================================================================
// Per-file processing pipeline
// ============================================================================

fn run_one(
    input: &Path,
    output: &Path,
    request: &RunRequest,
    factory: &OrtLoader,
    verbose: bool,
) -> Result<String, String> {
    let mut stack = load_stack(input).map_err(|e| format!("load failed: {}", e))?;

    let mut on_started = |total: usize, factor: f64| {
        if verbose {
            println!("  {} slices, normalization factor {}", total, factor);
        }
    };
    let mut sink = |count: usize, total: usize| {
        if verbose {
            println!("  {}/{} ({}%)", count, total, percent(count, total));
        }
    };
    let summary = run_denoise(
        &mut stack,
        request,
        factory,
        &mut on_started,
        &mut sink,
        &CancelToken::new(),
    )
    .map_err(|e| e.to_string())?;

    save_stack(&stack, output).map_err(|e| format!("save failed: {}", e))?;
    Ok(summary.message())
}

// ============================================================================
// Helpers
// ============================================================================

/// Expand glob patterns and literal paths into a deduplicated, ordered list.
fn resolve_inputs(patterns: &[String]) -> Vec<PathBuf> {
    let mut result: Vec<PathBuf> = Vec::new();

    for pattern in patterns {
        let as_path = Path::new(pattern);

        if as_path.exists() {
            if !result.iter().any(|p| p.as_path() == as_path) {
                result.push(as_path.to_path_buf());
            }
            continue;
        }

        match glob::glob(pattern) {
            Ok(entries) => {
                let mut matched = false;
                for entry in entries.flatten() {
                    if !result.contains(&entry) {
                        result.push(entry);
                    }
                    matched = true;
                }
                if !matched {
                    eprintln!("warning: pattern '{}' matched no files.", pattern);
                }
            }
            Err(e) => {
                eprintln!("warning: invalid glob '{}': {}", pattern, e);
            }
        }
    }

    result
}

/// Compute the output path for a single input file.
///
/// Priority:
/// 1. `--output` (explicit path, used for single-file input)
/// 2. `--output-dir` (batch directory, keeps the input file name)
/// 3. Fallback: `<stem>_denoised.<ext>` next to the input
fn build_output_path(input: &Path, output: Option<&Path>, output_dir: Option<&Path>) -> PathBuf {
    if let Some(out) = output {
        return out.to_path_buf();
    }
    if let Some(dir) = output_dir
        && let Some(name) = input.file_name()
    {
        return dir.join(name);
    }
    denoised_path(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_path_priority() {
        let input = Path::new("/data/a.tif");
        assert_eq!(
            build_output_path(input, Some(Path::new("/x/out.tif")), Some(Path::new("/d"))),
            PathBuf::from("/x/out.tif")
        );
        assert_eq!(
            build_output_path(input, None, Some(Path::new("/d"))),
            PathBuf::from("/d/a.tif")
        );
        assert_eq!(build_output_path(input, None, None), PathBuf::from("/data/a_denoised.tif"));
    }

    #[test]
    fn flags_override_settings() {
        let args = CliArgs::parse_from([
            "nia-denoise",
            "-i",
            "a.tif",
            "-m",
            "/m/n2v.onnx",
            "--retries",
            "50",
            "--progress-every",
            "0",
        ]);
        let request = build_request(&args, &AppSettings::default());
        assert_eq!(request.model, ModelSource::Custom(PathBuf::from("/m/n2v.onnx")));
        assert_eq!(request.options.retries, MAX_SLICE_RETRIES);
        assert_eq!(request.options.progress_every, 1);

        let args = CliArgs::parse_from(["nia-denoise", "-i", "a.tif"]);
        assert_eq!(build_request(&args, &AppSettings::default()).model, ModelSource::BuiltIn);
    }

    #[test]
    fn literal_paths_are_deduplicated() {
        let path = std::env::temp_dir().join(format!("nia_cli_{}.tif", uuid::Uuid::new_v4()));
        std::fs::write(&path, b"x").unwrap();
        let p = path.to_string_lossy().into_owned();
        assert_eq!(resolve_inputs(&[p.clone(), p]), vec![path.clone()]);
        std::fs::remove_file(&path).unwrap();
    }
}
