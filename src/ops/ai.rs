// ============================================================================
// AI ENGINE: ONNX Runtime session for single-channel NHWC denoising models
// ============================================================================
//
// Uses `libloading` to dynamically load onnxruntime.dll / libonnxruntime.so
// at runtime so the binary has NO compile-time dependency on ONNX Runtime.
// The library path comes from settings, `--onnx-runtime`, or ORT_DYLIB_PATH.
//
// One `OnnxSession` lives for exactly one denoising run. Every native object
// it owns is released in `Drop`, so early returns and failed runs clean up too.

#![allow(unsafe_op_in_unsafe_fn)]

use std::ffi::{CStr, CString, c_char, c_void};
use std::path::{Path, PathBuf};
use std::ptr;

use crate::{log_info, log_warn};

/// Environment variable consulted when no runtime path is configured.
pub const ORT_DYLIB_ENV: &str = "ORT_DYLIB_PATH";

/// Errors that can occur during ONNX Runtime operations.
#[derive(Debug, Clone, PartialEq)]
pub enum OnnxError {
    DllNotFound(String),
    DllLoadFailed(String),
    ModelNotFound(String),
    ModelLoadFailed(String),
    ApiInitFailed(String),
    SessionCreateFailed(String),
    InferenceFailed(String),
    InvalidOutput(String),
}

impl std::fmt::Display for OnnxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OnnxError::DllNotFound(p) => write!(f, "ONNX Runtime library not found: {}", p),
            OnnxError::DllLoadFailed(e) => write!(f, "Failed to load ONNX Runtime library: {}", e),
            OnnxError::ModelNotFound(p) => write!(f, "ONNX model file not found: {}", p),
            OnnxError::ModelLoadFailed(e) => write!(f, "Failed to load ONNX model: {}", e),
            OnnxError::ApiInitFailed(e) => write!(f, "ONNX Runtime API init failed: {}", e),
            OnnxError::SessionCreateFailed(e) => write!(f, "Failed to create ONNX session: {}", e),
            OnnxError::InferenceFailed(e) => write!(f, "ONNX inference failed: {}", e),
            OnnxError::InvalidOutput(e) => write!(f, "Invalid ONNX output: {}", e),
        }
    }
}

impl std::error::Error for OnnxError {}

/// Output of one inference call, already reduced from `(1, H, W, 1)` to a
/// row-major `H × W` buffer.
#[derive(Clone, Debug, PartialEq)]
pub struct TensorOutput {
    pub height: usize,
    pub width: usize,
    pub data: Vec<f32>,
}

/// A loaded network that maps one `(1, H, W, 1)` float tensor to another.
pub trait InferenceSession {
    /// Name of the input the tensor is bound to.
    fn input_name(&self) -> &str;

    /// Run the network on a row-major `height × width` buffer.
    ///
    /// The buffer is borrowed mutably because the runtime wraps it in place
    /// instead of copying it.
    fn run_nhwc(
        &mut self,
        input: &mut [f32],
        height: usize,
        width: usize,
    ) -> Result<TensorOutput, OnnxError>;
}

/// Creates sessions. A run calls `load` exactly once.
pub trait SessionFactory {
    type Session: InferenceSession;

    fn load(&self, model_path: &Path) -> Result<Self::Session, OnnxError>;
}

// --- ONNX Runtime C API types --------------------------------------
// Opaque handles, never dereferenced in Rust.

#[repr(C)]
struct OrtEnv {
    _private: [u8; 0],
}
#[repr(C)]
struct OrtSession {
    _private: [u8; 0],
}
#[repr(C)]
struct OrtSessionOptions {
    _private: [u8; 0],
}
#[repr(C)]
struct OrtValue {
    _private: [u8; 0],
}
#[repr(C)]
struct OrtMemoryInfo {
    _private: [u8; 0],
}
#[repr(C)]
struct OrtStatus {
    _private: [u8; 0],
}
#[repr(C)]
struct OrtRunOptions {
    _private: [u8; 0],
}
#[repr(C)]
struct OrtAllocator {
    _private: [u8; 0],
}
#[repr(C)]
struct OrtTensorTypeAndShapeInfo {
    _private: [u8; 0],
}
#[repr(C)]
struct OrtTypeInfo {
    _private: [u8; 0],
}

/// ORT API version we target (compatible with ONNX Runtime 1.16+)
const ORT_API_VERSION: u32 = 18;

/// Minimum supported ONNX Runtime version.
const ORT_MIN_VERSION: (u32, u32) = (1, 16);

const ORT_LOGGING_LEVEL_WARNING: u32 = 2;
const ONNX_TENSOR_ELEMENT_FLOAT: u32 = 1;
const ORT_ARENA_ALLOCATOR: i32 = 1;
const ORT_MEM_TYPE_DEFAULT: i32 = 0;
/// ORT_ENABLE_BASIC
const GRAPH_OPT_BASIC: u32 = 1;

/// Path character type expected by CreateSession.
#[cfg(windows)]
type OrtChar = u16;
#[cfg(not(windows))]
type OrtChar = c_char;

type CreateEnvFn =
    unsafe extern "C" fn(log_level: u32, logid: *const c_char, out: *mut *mut OrtEnv) -> *mut OrtStatus;
type CreateSessionOptionsFn = unsafe extern "C" fn(out: *mut *mut OrtSessionOptions) -> *mut OrtStatus;
type CreateSessionFn = unsafe extern "C" fn(
    env: *const OrtEnv,
    model_path: *const OrtChar,
    options: *const OrtSessionOptions,
    out: *mut *mut OrtSession,
) -> *mut OrtStatus;
type CreateTensorWithDataAsOrtValueFn = unsafe extern "C" fn(
    info: *const OrtMemoryInfo,
    data: *mut c_void,
    data_len: usize,
    shape: *const i64,
    shape_len: usize,
    element_type: u32,
    out: *mut *mut OrtValue,
) -> *mut OrtStatus;
type CreateCpuMemoryInfoFn =
    unsafe extern "C" fn(alloc_type: i32, mem_type: i32, out: *mut *mut OrtMemoryInfo) -> *mut OrtStatus;
type RunFn = unsafe extern "C" fn(
    session: *mut OrtSession,
    run_options: *const OrtRunOptions,
    input_names: *const *const c_char,
    inputs: *const *const OrtValue,
    input_count: usize,
    output_names: *const *const c_char,
    output_count: usize,
    outputs: *mut *mut OrtValue,
) -> *mut OrtStatus;
type GetTensorMutableDataFn = unsafe extern "C" fn(value: *mut OrtValue, out: *mut *mut c_void) -> *mut OrtStatus;
type GetTensorTypeAndShapeFn =
    unsafe extern "C" fn(value: *const OrtValue, out: *mut *mut OrtTensorTypeAndShapeInfo) -> *mut OrtStatus;
type GetTensorElementTypeFn =
    unsafe extern "C" fn(info: *const OrtTensorTypeAndShapeInfo, out: *mut u32) -> *mut OrtStatus;
type GetDimensionsCountFn =
    unsafe extern "C" fn(info: *const OrtTensorTypeAndShapeInfo, out: *mut usize) -> *mut OrtStatus;
type GetDimensionsFn = unsafe extern "C" fn(
    info: *const OrtTensorTypeAndShapeInfo,
    dim_values: *mut i64,
    dim_values_length: usize,
) -> *mut OrtStatus;
type ReleaseEnvFn = unsafe extern "C" fn(env: *mut OrtEnv);
type ReleaseSessionFn = unsafe extern "C" fn(session: *mut OrtSession);
type ReleaseSessionOptionsFn = unsafe extern "C" fn(options: *mut OrtSessionOptions);
type ReleaseValueFn = unsafe extern "C" fn(value: *mut OrtValue);
type ReleaseMemoryInfoFn = unsafe extern "C" fn(info: *mut OrtMemoryInfo);
type ReleaseTensorTypeAndShapeInfoFn = unsafe extern "C" fn(info: *mut OrtTensorTypeAndShapeInfo);
type ReleaseTypeInfoFn = unsafe extern "C" fn(type_info: *mut OrtTypeInfo);
type ReleaseStatusFn = unsafe extern "C" fn(status: *mut OrtStatus);
type GetErrorMessageFn = unsafe extern "C" fn(status: *const OrtStatus) -> *const c_char;
type SetIntraOpNumThreadsFn =
    unsafe extern "C" fn(options: *mut OrtSessionOptions, intra_op_num_threads: i32) -> *mut OrtStatus;
type SetSessionGraphOptimizationLevelFn =
    unsafe extern "C" fn(options: *mut OrtSessionOptions, level: u32) -> *mut OrtStatus;
type SessionGetCountFn = unsafe extern "C" fn(session: *const OrtSession, out: *mut usize) -> *mut OrtStatus;
type SessionGetNameFn = unsafe extern "C" fn(
    session: *const OrtSession,
    index: usize,
    allocator: *mut OrtAllocator,
    out: *mut *mut c_char,
) -> *mut OrtStatus;
type SessionGetInputTypeInfoFn =
    unsafe extern "C" fn(session: *const OrtSession, index: usize, out: *mut *mut OrtTypeInfo) -> *mut OrtStatus;
type CastTypeInfoToTensorInfoFn =
    unsafe extern "C" fn(type_info: *const OrtTypeInfo, out: *mut *const OrtTensorTypeAndShapeInfo) -> *mut OrtStatus;
type GetAllocatorWithDefaultOptionsFn = unsafe extern "C" fn(out: *mut *mut OrtAllocator) -> *mut OrtStatus;
type AllocatorFreeFn = unsafe extern "C" fn(allocator: *mut OrtAllocator, ptr: *mut c_void) -> *mut OrtStatus;

/// OrtApiBase: the entry point struct returned by OrtGetApiBase()
#[repr(C)]
struct OrtApiBase {
    get_api: unsafe extern "C" fn(version: u32) -> *const c_void,
    get_version_string: unsafe extern "C" fn() -> *const c_char,
}

/// The OrtApi vtable. Function pointers are read by index (see
/// onnxruntime_c_api.h for the layout).
#[derive(Clone, Copy)]
struct OrtApi {
    raw: *const c_void,
}

impl OrtApi {
    unsafe fn get_fn<T>(&self, index: usize) -> T {
        let table = self.raw as *const *const c_void;
        let fn_ptr = *table.add(index);
        std::mem::transmute_copy(&fn_ptr)
    }

    fn get_error_message(&self) -> GetErrorMessageFn {
        unsafe { self.get_fn(2) }
    }
    fn create_env(&self) -> CreateEnvFn {
        unsafe { self.get_fn(3) }
    }
    fn create_session(&self) -> CreateSessionFn {
        unsafe { self.get_fn(7) }
    }
    fn run(&self) -> RunFn {
        unsafe { self.get_fn(9) }
    }
    fn create_session_options(&self) -> CreateSessionOptionsFn {
        unsafe { self.get_fn(10) }
    }
    fn set_session_graph_optimization_level(&self) -> SetSessionGraphOptimizationLevelFn {
        unsafe { self.get_fn(23) }
    }
    fn set_intra_op_num_threads(&self) -> SetIntraOpNumThreadsFn {
        unsafe { self.get_fn(24) }
    }
    fn session_get_input_count(&self) -> SessionGetCountFn {
        unsafe { self.get_fn(30) }
    }
    fn session_get_output_count(&self) -> SessionGetCountFn {
        unsafe { self.get_fn(31) }
    }
    fn session_get_input_type_info(&self) -> SessionGetInputTypeInfoFn {
        unsafe { self.get_fn(33) }
    }
    fn session_get_input_name(&self) -> SessionGetNameFn {
        unsafe { self.get_fn(36) }
    }
    fn session_get_output_name(&self) -> SessionGetNameFn {
        unsafe { self.get_fn(37) }
    }
    fn create_tensor_with_data(&self) -> CreateTensorWithDataAsOrtValueFn {
        unsafe { self.get_fn(49) }
    }
    fn get_tensor_mutable_data(&self) -> GetTensorMutableDataFn {
        unsafe { self.get_fn(51) }
    }
    fn cast_type_info_to_tensor_info(&self) -> CastTypeInfoToTensorInfoFn {
        unsafe { self.get_fn(55) }
    }
    fn get_tensor_element_type(&self) -> GetTensorElementTypeFn {
        unsafe { self.get_fn(60) }
    }
    fn get_dimensions_count(&self) -> GetDimensionsCountFn {
        unsafe { self.get_fn(61) }
    }
    fn get_dimensions(&self) -> GetDimensionsFn {
        unsafe { self.get_fn(62) }
    }
    fn get_tensor_type_and_shape(&self) -> GetTensorTypeAndShapeFn {
        unsafe { self.get_fn(65) }
    }
    fn create_cpu_memory_info(&self) -> CreateCpuMemoryInfoFn {
        unsafe { self.get_fn(69) }
    }
    fn allocator_free(&self) -> AllocatorFreeFn {
        unsafe { self.get_fn(76) }
    }
    fn get_allocator_with_default_options(&self) -> GetAllocatorWithDefaultOptionsFn {
        unsafe { self.get_fn(78) }
    }
    fn release_env(&self) -> ReleaseEnvFn {
        unsafe { self.get_fn(92) }
    }
    fn release_status(&self) -> ReleaseStatusFn {
        unsafe { self.get_fn(93) }
    }
    fn release_memory_info(&self) -> ReleaseMemoryInfoFn {
        unsafe { self.get_fn(94) }
    }
    fn release_session(&self) -> ReleaseSessionFn {
        unsafe { self.get_fn(95) }
    }
    fn release_value(&self) -> ReleaseValueFn {
        unsafe { self.get_fn(96) }
    }
    fn release_type_info(&self) -> ReleaseTypeInfoFn {
        unsafe { self.get_fn(98) }
    }
    fn release_tensor_type_and_shape_info(&self) -> ReleaseTensorTypeAndShapeInfoFn {
        unsafe { self.get_fn(99) }
    }
    fn release_session_options(&self) -> ReleaseSessionOptionsFn {
        unsafe { self.get_fn(100) }
    }
}

/// Turn an OrtStatus into a Result. A null status means success.
unsafe fn status_to_result(api: &OrtApi, status: *mut OrtStatus) -> Result<(), String> {
    if status.is_null() {
        return Ok(());
    }
    let msg_ptr = (api.get_error_message())(status);
    let msg = if msg_ptr.is_null() {
        "Unknown error".to_string()
    } else {
        CStr::from_ptr(msg_ptr).to_string_lossy().into_owned()
    };
    (api.release_status())(status);
    Err(msg)
}

/// Validate that an ONNX Runtime library path is safe to load:
/// absolute, no `..` components, shared-library extension.
pub fn validate_runtime_path(path: &Path) -> Result<(), OnnxError> {
    use std::path::Component;

    if path.as_os_str().is_empty() {
        return Err(OnnxError::DllNotFound("Path is empty".to_string()));
    }
    if !path.is_absolute() {
        return Err(OnnxError::DllLoadFailed(
            "ONNX Runtime path must be an absolute path".to_string(),
        ));
    }
    if path.components().any(|c| c == Component::ParentDir) {
        return Err(OnnxError::DllLoadFailed(
            "ONNX Runtime path must not contain '..' components".to_string(),
        ));
    }
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();
    // Versioned sonames such as libonnxruntime.so.1.18.0 are accepted too.
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("")
        .to_lowercase();
    if !["dll", "so", "dylib"].contains(&ext.as_str()) && !file_name.contains(".so.") {
        return Err(OnnxError::DllLoadFailed(format!(
            "Expected a .dll/.so/.dylib file, got '{}'",
            file_name
        )));
    }
    Ok(())
}

/// Parse a version string like "1.18.0" into (major, minor).
fn parse_ort_version(version: &str) -> Option<(u32, u32)> {
    let mut parts = version.split('.');
    let major: u32 = parts.next()?.trim().parse().ok()?;
    let minor: u32 = parts.next()?.trim().parse().ok()?;
    Some((major, minor))
}

fn check_min_version(version: &str) -> Result<(), OnnxError> {
    if let Some((major, minor)) = parse_ort_version(version) {
        let (min_major, min_minor) = ORT_MIN_VERSION;
        if major < min_major || (major == min_major && minor < min_minor) {
            return Err(OnnxError::ApiInitFailed(format!(
                "ONNX Runtime {} is too old. Minimum supported version is {}.{}",
                version, min_major, min_minor
            )));
        }
    }
    Ok(())
}

/// Load the library and resolve the versioned API table.
fn open_runtime(dll_path: &Path) -> Result<(libloading::Library, OrtApi, String), OnnxError> {
    validate_runtime_path(dll_path)?;
    if !dll_path.exists() {
        return Err(OnnxError::DllNotFound(dll_path.display().to_string()));
    }

    unsafe {
        let lib = libloading::Library::new(dll_path)
            .map_err(|e| OnnxError::DllLoadFailed(e.to_string()))?;

        let api_base = {
            let get_api_base: libloading::Symbol<unsafe extern "C" fn() -> *const OrtApiBase> = lib
                .get(b"OrtGetApiBase")
                .map_err(|e| OnnxError::DllLoadFailed(format!("Symbol OrtGetApiBase not found: {}", e)))?;
            get_api_base()
        };
        if api_base.is_null() {
            return Err(OnnxError::ApiInitFailed("OrtGetApiBase returned null".to_string()));
        }

        let version_ptr = ((*api_base).get_version_string)();
        let version = if version_ptr.is_null() {
            "unknown".to_string()
        } else {
            CStr::from_ptr(version_ptr).to_string_lossy().into_owned()
        };
        check_min_version(&version)?;

        let api_ptr = ((*api_base).get_api)(ORT_API_VERSION);
        if api_ptr.is_null() {
            return Err(OnnxError::ApiInitFailed(format!(
                "OrtGetApi({}) returned null, runtime {} may be too old",
                ORT_API_VERSION, version
            )));
        }
        Ok((lib, OrtApi { raw: api_ptr }, version))
    }
}

/// Probe the ONNX Runtime library. Returns the version string on success.
pub fn probe_onnx_runtime(dll_path: &Path) -> Result<String, OnnxError> {
    open_runtime(dll_path).map(|(_lib, _api, version)| version)
}

/// Resolve the runtime library path: explicit setting first, then the
/// ORT_DYLIB_PATH environment variable.
pub fn resolve_runtime_path(configured: &str) -> Option<PathBuf> {
    let configured = configured.trim();
    if !configured.is_empty() {
        return Some(PathBuf::from(configured));
    }
    std::env::var_os(ORT_DYLIB_ENV)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

#[cfg(windows)]
fn model_path_chars(path: &Path) -> Result<Vec<OrtChar>, OnnxError> {
    use std::os::windows::ffi::OsStrExt;
    Ok(path.as_os_str().encode_wide().chain(std::iter::once(0)).collect())
}

#[cfg(unix)]
fn model_path_chars(path: &Path) -> Result<Vec<OrtChar>, OnnxError> {
    use std::os::unix::ffi::OsStrExt;
    let c = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| OnnxError::ModelLoadFailed(format!("Invalid model path: {}", e)))?;
    Ok(c.into_bytes_with_nul().into_iter().map(|b| b as OrtChar).collect())
}

#[cfg(not(any(unix, windows)))]
fn model_path_chars(path: &Path) -> Result<Vec<OrtChar>, OnnxError> {
    let s = path
        .to_str()
        .ok_or_else(|| OnnxError::ModelLoadFailed("Model path is not valid UTF-8".to_string()))?;
    let c = CString::new(s).map_err(|e| OnnxError::ModelLoadFailed(e.to_string()))?;
    Ok(c.into_bytes_with_nul().into_iter().map(|b| b as OrtChar).collect())
}

/// Loads sessions from a configured ONNX Runtime library.
#[derive(Clone, Debug)]
pub struct OrtLoader {
    pub runtime_path: PathBuf,
}

impl OrtLoader {
    pub fn new(runtime_path: impl Into<PathBuf>) -> Self {
        Self { runtime_path: runtime_path.into() }
    }
}

impl SessionFactory for OrtLoader {
    type Session = OnnxSession;

    fn load(&self, model_path: &Path) -> Result<OnnxSession, OnnxError> {
        OnnxSession::open(&self.runtime_path, model_path)
    }
}

/// A live ONNX Runtime session bound to the model's first input and output.
///
/// Not `Send`: a session is created, used, and dropped on the worker thread
/// of a single run.
pub struct OnnxSession {
    api: OrtApi,
    env: *mut OrtEnv,
    options: *mut OrtSessionOptions,
    session: *mut OrtSession,
    memory_info: *mut OrtMemoryInfo,
    input_name: String,
    input_name_c: CString,
    output_name_c: CString,
    version: String,
    // Dropped last, after Drop::drop has released every handle above.
    _lib: libloading::Library,
}

impl OnnxSession {
    /// Load `model_path` with the runtime at `dll_path`.
    ///
    /// Fails fast when the model declares no inputs or no outputs.
    pub fn open(dll_path: &Path, model_path: &Path) -> Result<Self, OnnxError> {
        if !model_path.exists() {
            return Err(OnnxError::ModelNotFound(model_path.display().to_string()));
        }
        let (lib, api, version) = open_runtime(dll_path)?;
        log_info!("[AI] ONNX Runtime {} loaded from {}", version, dll_path.display());

        // Handles are filled in one by one; an early return drops `s`, which
        // releases whatever was created so far.
        let mut s = OnnxSession {
            api,
            env: ptr::null_mut(),
            options: ptr::null_mut(),
            session: ptr::null_mut(),
            memory_info: ptr::null_mut(),
            input_name: String::new(),
            input_name_c: CString::default(),
            output_name_c: CString::default(),
            version,
            _lib: lib,
        };

        unsafe {
            status_to_result(
                &api,
                (api.create_env())(ORT_LOGGING_LEVEL_WARNING, c"nia-denoise".as_ptr(), &mut s.env),
            )
            .map_err(OnnxError::ApiInitFailed)?;

            status_to_result(&api, (api.create_session_options())(&mut s.options))
                .map_err(OnnxError::SessionCreateFailed)?;
            let threads = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4) as i32;
            if let Err(e) = status_to_result(&api, (api.set_intra_op_num_threads())(s.options, threads)) {
                log_warn!("[AI] Could not set intra-op threads: {}", e);
            }
            if let Err(e) = status_to_result(
                &api,
                (api.set_session_graph_optimization_level())(s.options, GRAPH_OPT_BASIC),
            ) {
                log_warn!("[AI] Could not set graph optimization level: {}", e);
            }

            log_info!("[AI] Loading model {}", model_path.display());
            let model_chars = model_path_chars(model_path)?;
            status_to_result(
                &api,
                (api.create_session())(s.env, model_chars.as_ptr(), s.options, &mut s.session),
            )
            .map_err(OnnxError::ModelLoadFailed)?;

            let mut input_count = 0usize;
            status_to_result(&api, (api.session_get_input_count())(s.session, &mut input_count))
                .map_err(|e| OnnxError::SessionCreateFailed(format!("Get input count: {}", e)))?;
            if input_count == 0 {
                return Err(OnnxError::ModelLoadFailed("model declares no inputs".to_string()));
            }
            if input_count > 1 {
                log_warn!("[AI] Model declares {} inputs, binding the first one", input_count);
            }
            let mut output_count = 0usize;
            status_to_result(&api, (api.session_get_output_count())(s.session, &mut output_count))
                .map_err(|e| OnnxError::SessionCreateFailed(format!("Get output count: {}", e)))?;
            if output_count == 0 {
                return Err(OnnxError::ModelLoadFailed("model declares no outputs".to_string()));
            }

            let mut allocator: *mut OrtAllocator = ptr::null_mut();
            status_to_result(&api, (api.get_allocator_with_default_options())(&mut allocator))
                .map_err(|e| OnnxError::SessionCreateFailed(format!("Get allocator: {}", e)))?;
            let input_name = session_name(&api, api.session_get_input_name(), s.session, allocator)?;
            let output_name = session_name(&api, api.session_get_output_name(), s.session, allocator)?;
            s.input_name_c = CString::new(input_name.clone())
                .map_err(|e| OnnxError::SessionCreateFailed(e.to_string()))?;
            s.output_name_c = CString::new(output_name.clone())
                .map_err(|e| OnnxError::SessionCreateFailed(e.to_string()))?;
            s.input_name = input_name;

            match declared_input_shape(&api, s.session) {
                Some(dims) => {
                    log_info!("[AI] Input '{}' declared shape {:?}", s.input_name, dims);
                    if dims.len() != 4 {
                        log_warn!("[AI] Expected a rank-4 NHWC input, inference may fail");
                    }
                }
                None => log_info!("[AI] Input '{}' (shape unknown)", s.input_name),
            }
            log_info!("[AI] Output '{}'", output_name);

            status_to_result(
                &api,
                (api.create_cpu_memory_info())(ORT_ARENA_ALLOCATOR, ORT_MEM_TYPE_DEFAULT, &mut s.memory_info),
            )
            .map_err(|e| OnnxError::SessionCreateFailed(format!("Create memory info: {}", e)))?;
        }

        Ok(s)
    }

    pub fn runtime_version(&self) -> &str {
        &self.version
    }
}

/// Fetch the first input/output name and free the runtime-allocated copy.
unsafe fn session_name(
    api: &OrtApi,
    getter: SessionGetNameFn,
    session: *mut OrtSession,
    allocator: *mut OrtAllocator,
) -> Result<String, OnnxError> {
    let mut name_ptr: *mut c_char = ptr::null_mut();
    status_to_result(api, getter(session, 0, allocator, &mut name_ptr))
        .map_err(|e| OnnxError::SessionCreateFailed(format!("Get tensor name: {}", e)))?;
    if name_ptr.is_null() {
        return Err(OnnxError::SessionCreateFailed("runtime returned a null tensor name".to_string()));
    }
    let name = CStr::from_ptr(name_ptr).to_string_lossy().into_owned();
    let _ = status_to_result(api, (api.allocator_free())(allocator, name_ptr as *mut c_void));
    Ok(name)
}

/// Declared dimensions of input 0 (-1 for dynamic axes), if available.
unsafe fn declared_input_shape(api: &OrtApi, session: *mut OrtSession) -> Option<Vec<i64>> {
    let mut type_info: *mut OrtTypeInfo = ptr::null_mut();
    if status_to_result(api, (api.session_get_input_type_info())(session, 0, &mut type_info)).is_err()
        || type_info.is_null()
    {
        return None;
    }
    // tensor_info is owned by type_info, only type_info is released.
    let mut tensor_info: *const OrtTensorTypeAndShapeInfo = ptr::null();
    let dims = if status_to_result(api, (api.cast_type_info_to_tensor_info())(type_info, &mut tensor_info)).is_ok()
        && !tensor_info.is_null()
    {
        read_dims(api, tensor_info).ok()
    } else {
        None
    };
    (api.release_type_info())(type_info);
    dims
}

unsafe fn read_dims(api: &OrtApi, info: *const OrtTensorTypeAndShapeInfo) -> Result<Vec<i64>, String> {
    let mut count = 0usize;
    status_to_result(api, (api.get_dimensions_count())(info, &mut count))?;
    let mut dims = vec![0i64; count];
    status_to_result(api, (api.get_dimensions())(info, dims.as_mut_ptr(), count))?;
    Ok(dims)
}

/// Releases an OrtValue when dropped.
struct ValueGuard {
    release: ReleaseValueFn,
    value: *mut OrtValue,
}

impl Drop for ValueGuard {
    fn drop(&mut self) {
        if !self.value.is_null() {
            unsafe { (self.release)(self.value) }
        }
    }
}

/// Spatial size of an NHWC `(1, H, W, 1)` shape.
fn nhwc_spatial(dims: &[i64]) -> Result<(usize, usize), OnnxError> {
    match dims {
        [1, h, w, 1] if *h > 0 && *w > 0 => Ok((*h as usize, *w as usize)),
        _ => Err(OnnxError::InvalidOutput(format!(
            "expected output shape (1, H, W, 1), got {:?}",
            dims
        ))),
    }
}

impl InferenceSession for OnnxSession {
    fn input_name(&self) -> &str {
        &self.input_name
    }

    fn run_nhwc(
        &mut self,
        input: &mut [f32],
        height: usize,
        width: usize,
    ) -> Result<TensorOutput, OnnxError> {
        if input.len() != height * width {
            return Err(OnnxError::InferenceFailed(format!(
                "buffer holds {} values, shape needs {}",
                input.len(),
                height * width
            )));
        }
        let api = self.api;
        let shape: [i64; 4] = [1, height as i64, width as i64, 1];

        unsafe {
            let mut input_value: *mut OrtValue = ptr::null_mut();
            status_to_result(
                &api,
                (api.create_tensor_with_data())(
                    self.memory_info,
                    input.as_mut_ptr() as *mut c_void,
                    input.len() * std::mem::size_of::<f32>(),
                    shape.as_ptr(),
                    shape.len(),
                    ONNX_TENSOR_ELEMENT_FLOAT,
                    &mut input_value,
                ),
            )
            .map_err(|e| OnnxError::InferenceFailed(format!("Create input tensor: {}", e)))?;
            let _input_guard = ValueGuard { release: api.release_value(), value: input_value };

            let input_names = [self.input_name_c.as_ptr()];
            let inputs = [input_value as *const OrtValue];
            let output_names = [self.output_name_c.as_ptr()];
            let mut outputs: [*mut OrtValue; 1] = [ptr::null_mut()];
            status_to_result(
                &api,
                (api.run())(
                    self.session,
                    ptr::null(),
                    input_names.as_ptr(),
                    inputs.as_ptr(),
                    1,
                    output_names.as_ptr(),
                    1,
                    outputs.as_mut_ptr(),
                ),
            )
            .map_err(OnnxError::InferenceFailed)?;
            let output_value = outputs[0];
            if output_value.is_null() {
                return Err(OnnxError::InvalidOutput("runtime returned no output".to_string()));
            }
            let _output_guard = ValueGuard { release: api.release_value(), value: output_value };

            let mut info: *mut OrtTensorTypeAndShapeInfo = ptr::null_mut();
            status_to_result(&api, (api.get_tensor_type_and_shape())(output_value, &mut info))
                .map_err(|e| OnnxError::InvalidOutput(format!("Get output shape: {}", e)))?;
            let mut element_type = 0u32;
            let type_status = status_to_result(&api, (api.get_tensor_element_type())(info, &mut element_type));
            let dims = read_dims(&api, info);
            (api.release_tensor_type_and_shape_info())(info);
            type_status.map_err(|e| OnnxError::InvalidOutput(format!("Get element type: {}", e)))?;
            if element_type != ONNX_TENSOR_ELEMENT_FLOAT {
                return Err(OnnxError::InvalidOutput(format!(
                    "expected float32 output, got element type {}",
                    element_type
                )));
            }
            let dims = dims.map_err(|e| OnnxError::InvalidOutput(format!("Get dimensions: {}", e)))?;
            let (out_h, out_w) = nhwc_spatial(&dims)?;

            let mut data_ptr: *mut c_void = ptr::null_mut();
            status_to_result(&api, (api.get_tensor_mutable_data())(output_value, &mut data_ptr))
                .map_err(|e| OnnxError::InvalidOutput(format!("Get tensor data: {}", e)))?;
            if data_ptr.is_null() {
                return Err(OnnxError::InvalidOutput("output tensor has no data".to_string()));
            }
            let data = std::slice::from_raw_parts(data_ptr as *const f32, out_h * out_w).to_vec();

            Ok(TensorOutput { height: out_h, width: out_w, data })
        }
    }
}

impl Drop for OnnxSession {
    fn drop(&mut self) {
        let api = self.api;
        let had_session = !self.session.is_null();
        unsafe {
            if !self.memory_info.is_null() {
                (api.release_memory_info())(self.memory_info);
            }
            if !self.session.is_null() {
                (api.release_session())(self.session);
            }
            if !self.options.is_null() {
                (api.release_session_options())(self.options);
            }
            if !self.env.is_null() {
                (api.release_env())(self.env);
            }
        }
        if had_session {
            log_info!("[AI] Session released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_path_must_be_absolute_library() {
        assert!(matches!(
            validate_runtime_path(Path::new("")),
            Err(OnnxError::DllNotFound(_))
        ));
        assert!(matches!(
            validate_runtime_path(Path::new("libonnxruntime.so")),
            Err(OnnxError::DllLoadFailed(_))
        ));
        #[cfg(unix)]
        {
            assert!(validate_runtime_path(Path::new("/opt/ort/lib/libonnxruntime.so")).is_ok());
            assert!(validate_runtime_path(Path::new("/opt/ort/lib/libonnxruntime.so.1.18.0")).is_ok());
            assert!(validate_runtime_path(Path::new("/opt/ort/../lib/libonnxruntime.so")).is_err());
            assert!(validate_runtime_path(Path::new("/opt/ort/model.onnx")).is_err());
        }
    }

    #[test]
    fn version_gate() {
        assert_eq!(parse_ort_version("1.18.0"), Some((1, 18)));
        assert_eq!(parse_ort_version("garbage"), None);
        assert!(check_min_version("1.16.3").is_ok());
        assert!(check_min_version("2.0.0").is_ok());
        assert!(check_min_version("1.15.1").is_err());
        assert!(check_min_version("unknown").is_ok());
    }

    #[test]
    fn output_shape_must_be_singleton_nhwc() {
        assert_eq!(nhwc_spatial(&[1, 64, 32, 1]), Ok((64, 32)));
        assert!(nhwc_spatial(&[1, 1, 64, 32]).is_err());
        assert!(nhwc_spatial(&[2, 64, 32, 1]).is_err());
        assert!(nhwc_spatial(&[64, 32]).is_err());
        assert!(nhwc_spatial(&[1, 0, 32, 1]).is_err());
    }

    #[test]
    fn missing_model_is_reported_before_touching_the_runtime() {
        let missing = std::env::temp_dir().join(format!("nia_missing_{}.onnx", uuid::Uuid::new_v4()));
        let err = OnnxSession::open(Path::new("/nonexistent/libonnxruntime.so"), &missing)
            .err()
            .unwrap();
        assert!(matches!(err, OnnxError::ModelNotFound(_)));
    }

    #[cfg(unix)]
    #[test]
    fn dropping_a_half_built_session_logs_no_release() {
        let released = || {
            crate::logger::recent_lines()
                .iter()
                .filter(|l| l.contains("[AI] Session released"))
                .count()
        };
        let before = released();
        let half_built = OnnxSession {
            api: OrtApi { raw: ptr::null() },
            env: ptr::null_mut(),
            options: ptr::null_mut(),
            session: ptr::null_mut(),
            memory_info: ptr::null_mut(),
            input_name: String::new(),
            input_name_c: CString::default(),
            output_name_c: CString::default(),
            version: String::new(),
            _lib: libloading::os::unix::Library::this().into(),
        };
        drop(half_built);
        assert_eq!(released(), before);
    }
}
