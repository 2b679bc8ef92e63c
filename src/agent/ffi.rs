//! Runtime binding to the framework's agent-server C API.
//!
//! In agent mode every framework call (context, tasker, buffers) is proxied
//! to the host through `MaaAgentServer`, so one library carries both the
//! server entry points and the context API. `MaaToolkit` is optional.

use std::ffi::{c_char, c_void, CStr, CString, OsString};
use std::path::{Path, PathBuf};

use libloading::Library;

use crate::errors::{TowerError, TowerResult};
use crate::recognition::types::Rect;

pub const AGENT_SERVER_LIBRARY: &str = "MaaAgentServer";
pub const TOOLKIT_LIBRARY: &str = "MaaToolkit";

pub type MaaBool = u8;
pub type MaaId = i64;
pub type MaaTaskId = MaaId;
pub type MaaRecoId = MaaId;
pub type MaaSize = u64;

pub const MAA_TRUE: MaaBool = 1;
pub const MAA_FALSE: MaaBool = 0;
pub const MAA_INVALID_ID: MaaId = 0;

#[repr(C)]
pub struct MaaContext {
    _private: [u8; 0],
}

#[repr(C)]
pub struct MaaTasker {
    _private: [u8; 0],
}

#[repr(C)]
pub struct MaaStringBuffer {
    _private: [u8; 0],
}

#[repr(C)]
pub struct MaaImageBuffer {
    _private: [u8; 0],
}

#[repr(C)]
pub struct MaaImageListBuffer {
    _private: [u8; 0],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaaRect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl From<MaaRect> for Rect {
    fn from(r: MaaRect) -> Self {
        Rect::new(r.x, r.y, r.width, r.height)
    }
}

impl From<Rect> for MaaRect {
    fn from(r: Rect) -> Self {
        MaaRect {
            x: r.x,
            y: r.y,
            width: r.width,
            height: r.height,
        }
    }
}

pub type MaaCustomRecognitionCallback = unsafe extern "C" fn(
    context: *mut MaaContext,
    task_id: MaaTaskId,
    node_name: *const c_char,
    custom_recognition_name: *const c_char,
    custom_recognition_param: *const c_char,
    image: *const MaaImageBuffer,
    roi: *const MaaRect,
    trans_arg: *mut c_void,
    out_box: *mut MaaRect,
    out_detail: *mut MaaStringBuffer,
) -> MaaBool;

type RegisterCustomRecognitionFn = unsafe extern "C" fn(
    name: *const c_char,
    recognition: Option<MaaCustomRecognitionCallback>,
    trans_arg: *mut c_void,
) -> MaaBool;
type StartUpFn = unsafe extern "C" fn(identifier: *const c_char) -> MaaBool;
type VoidFn = unsafe extern "C" fn();

type RunRecognitionFn = unsafe extern "C" fn(
    context: *mut MaaContext,
    entry: *const c_char,
    pipeline_override: *const c_char,
    image: *const MaaImageBuffer,
) -> MaaRecoId;
type GetTaskerFn = unsafe extern "C" fn(context: *const MaaContext) -> *mut MaaTasker;
type GetRecognitionDetailFn = unsafe extern "C" fn(
    tasker: *const MaaTasker,
    reco_id: MaaRecoId,
    node_name: *mut MaaStringBuffer,
    algorithm: *mut MaaStringBuffer,
    hit: *mut MaaBool,
    best_box: *mut MaaRect,
    detail_json: *mut MaaStringBuffer,
    raw: *mut MaaImageBuffer,
    draws: *mut MaaImageListBuffer,
) -> MaaBool;

type StringBufferCreateFn = unsafe extern "C" fn() -> *mut MaaStringBuffer;
type StringBufferDestroyFn = unsafe extern "C" fn(handle: *mut MaaStringBuffer);
type StringBufferGetFn = unsafe extern "C" fn(handle: *const MaaStringBuffer) -> *const c_char;
type StringBufferSizeFn = unsafe extern "C" fn(handle: *const MaaStringBuffer) -> MaaSize;
type StringBufferSetExFn =
    unsafe extern "C" fn(handle: *mut MaaStringBuffer, str: *const c_char, size: MaaSize) -> MaaBool;
type ImageBufferDimFn = unsafe extern "C" fn(handle: *const MaaImageBuffer) -> i32;

type ConfigInitOptionFn =
    unsafe extern "C" fn(user_path: *const c_char, default_json: *const c_char) -> MaaBool;

/// Resolved entry points. The libraries stay loaded for as long as this
/// value lives, which keeps every copied function pointer valid.
pub struct MaaApi {
    pub(crate) register_custom_recognition: RegisterCustomRecognitionFn,
    pub(crate) start_up: StartUpFn,
    pub(crate) join: VoidFn,
    pub(crate) shut_down: VoidFn,

    pub(crate) run_recognition: RunRecognitionFn,
    pub(crate) get_tasker: GetTaskerFn,
    pub(crate) get_recognition_detail: GetRecognitionDetailFn,

    string_buffer_create: StringBufferCreateFn,
    string_buffer_destroy: StringBufferDestroyFn,
    string_buffer_get: StringBufferGetFn,
    string_buffer_size: StringBufferSizeFn,
    string_buffer_set_ex: StringBufferSetExFn,
    pub(crate) image_width: ImageBufferDimFn,
    pub(crate) image_height: ImageBufferDimFn,

    config_init_option: Option<ConfigInitOptionFn>,

    _server: Library,
    _toolkit: Option<Library>,
}

macro_rules! symbol {
    ($lib:expr, $ty:ty, $name:literal) => {{
        // SAFETY: the declared type matches the framework header for this symbol.
        let sym = unsafe { $lib.get::<$ty>(concat!($name, "\0").as_bytes()) }
            .map_err(|e| TowerError::Agent(format!("symbol {} missing: {e}", $name)))?;
        *sym
    }};
}

impl MaaApi {
    /// Load the agent-server library (and the toolkit, when present).
    pub fn load(library_dir: Option<&Path>) -> TowerResult<Self> {
        let dirs = search_dirs(library_dir);
        let server = open_library(&dirs, AGENT_SERVER_LIBRARY)?;
        let toolkit = match open_library(&dirs, TOOLKIT_LIBRARY) {
            Ok(lib) => Some(lib),
            Err(e) => {
                tracing::warn!(error = %e, "toolkit library not loaded, skipping option init");
                None
            }
        };

        let config_init_option = match &toolkit {
            Some(lib) => {
                // SAFETY: signature per the toolkit header.
                unsafe { lib.get::<ConfigInitOptionFn>(b"MaaToolkitConfigInitOption\0") }
                    .ok()
                    .map(|sym| *sym)
            }
            None => None,
        };

        Ok(Self {
            register_custom_recognition: symbol!(server, RegisterCustomRecognitionFn, "MaaAgentServerRegisterCustomRecognition"),
            start_up: symbol!(server, StartUpFn, "MaaAgentServerStartUp"),
            join: symbol!(server, VoidFn, "MaaAgentServerJoin"),
            shut_down: symbol!(server, VoidFn, "MaaAgentServerShutDown"),
            run_recognition: symbol!(server, RunRecognitionFn, "MaaContextRunRecognition"),
            get_tasker: symbol!(server, GetTaskerFn, "MaaContextGetTasker"),
            get_recognition_detail: symbol!(server, GetRecognitionDetailFn, "MaaTaskerGetRecognitionDetail"),
            string_buffer_create: symbol!(server, StringBufferCreateFn, "MaaStringBufferCreate"),
            string_buffer_destroy: symbol!(server, StringBufferDestroyFn, "MaaStringBufferDestroy"),
            string_buffer_get: symbol!(server, StringBufferGetFn, "MaaStringBufferGet"),
            string_buffer_size: symbol!(server, StringBufferSizeFn, "MaaStringBufferSize"),
            string_buffer_set_ex: symbol!(server, StringBufferSetExFn, "MaaStringBufferSetEx"),
            image_width: symbol!(server, ImageBufferDimFn, "MaaImageBufferWidth"),
            image_height: symbol!(server, ImageBufferDimFn, "MaaImageBufferHeight"),
            config_init_option,
            _server: server,
            _toolkit: toolkit,
        })
    }

    /// Point the framework's log and debug output at `user_path`.
    pub fn init_toolkit(&self, user_path: &str) -> TowerResult<()> {
        let Some(init) = self.config_init_option else {
            return Err(TowerError::Agent("toolkit not loaded".into()));
        };
        let user_path = to_cstring(user_path)?;
        // SAFETY: both arguments are valid NUL-terminated strings for the call.
        let ok = unsafe { init(user_path.as_ptr(), c"{}".as_ptr()) };
        if ok == MAA_FALSE {
            return Err(TowerError::Agent("toolkit option init failed".into()));
        }
        Ok(())
    }

    pub(crate) fn string_buffer(&self) -> TowerResult<StringBuffer<'_>> {
        // SAFETY: no arguments; a null return is handled below.
        let handle = unsafe { (self.string_buffer_create)() };
        if handle.is_null() {
            return Err(TowerError::Agent("string buffer allocation failed".into()));
        }
        Ok(StringBuffer { api: self, handle })
    }

    /// Read a framework-owned string buffer. Invalid UTF-8 is replaced.
    ///
    /// # Safety
    /// `handle` must be a live string buffer.
    pub(crate) unsafe fn read_string_buffer(&self, handle: *const MaaStringBuffer) -> String {
        let data = (self.string_buffer_get)(handle);
        let size = (self.string_buffer_size)(handle) as usize;
        if data.is_null() || size == 0 {
            return String::new();
        }
        let bytes = std::slice::from_raw_parts(data.cast::<u8>(), size);
        String::from_utf8_lossy(bytes).into_owned()
    }

    /// # Safety
    /// `handle` must be a live string buffer.
    pub(crate) unsafe fn write_string_buffer(
        &self,
        handle: *mut MaaStringBuffer,
        value: &str,
    ) -> TowerResult<()> {
        let ok = (self.string_buffer_set_ex)(handle, value.as_ptr().cast(), value.len() as MaaSize);
        if ok == MAA_FALSE {
            return Err(TowerError::Agent("writing string buffer failed".into()));
        }
        Ok(())
    }
}

/// Owned string buffer, destroyed on drop.
pub(crate) struct StringBuffer<'a> {
    api: &'a MaaApi,
    handle: *mut MaaStringBuffer,
}

impl StringBuffer<'_> {
    pub(crate) fn as_mut_ptr(&mut self) -> *mut MaaStringBuffer {
        self.handle
    }

    pub(crate) fn read(&self) -> String {
        // SAFETY: the handle was created by `string_buffer` and is not yet destroyed.
        unsafe { self.api.read_string_buffer(self.handle) }
    }
}

impl Drop for StringBuffer<'_> {
    fn drop(&mut self) {
        // SAFETY: created by `MaaStringBufferCreate`, destroyed exactly once.
        unsafe { (self.api.string_buffer_destroy)(self.handle) }
    }
}

pub(crate) fn to_cstring(value: &str) -> TowerResult<CString> {
    CString::new(value)
        .map_err(|_| TowerError::Agent(format!("string contains a NUL byte: {value:?}")))
}

/// Borrow a C string from the framework. Null reads as empty.
///
/// # Safety
/// `ptr` must be null or point to a NUL-terminated string that outlives the result.
pub(crate) unsafe fn lossy_str<'a>(ptr: *const c_char) -> std::borrow::Cow<'a, str> {
    if ptr.is_null() {
        return std::borrow::Cow::Borrowed("");
    }
    CStr::from_ptr(ptr).to_string_lossy()
}

/// Directories searched for the framework libraries, in order.
fn search_dirs(configured: Option<&Path>) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(dir) = configured {
        dirs.push(dir.to_path_buf());
    }
    if let Some(parent) = std::env::current_exe().ok().and_then(|exe| exe.parent().map(Path::to_path_buf)) {
        dirs.push(parent);
    }
    if let Ok(cwd) = std::env::current_dir() {
        dirs.push(cwd);
    }
    dirs.dedup();
    dirs
}

fn open_library(dirs: &[PathBuf], stem: &str) -> TowerResult<Library> {
    let file_name: OsString = libloading::library_filename(stem);
    for dir in dirs {
        let candidate = dir.join(&file_name);
        if !candidate.exists() {
            continue;
        }
        // SAFETY: loading runs the library's initializers; the framework
        // libraries have no unsound static constructors.
        let lib = unsafe { Library::new(&candidate) }?;
        tracing::debug!(path = %candidate.display(), "loaded library");
        return Ok(lib);
    }
    // Last resort: let the platform loader search its own path.
    // SAFETY: as above.
    let lib = unsafe { Library::new(&file_name) }?;
    tracing::debug!(library = %stem, "loaded library from system path");
    Ok(lib)
}
