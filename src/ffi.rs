//! C ABI for ctypes-style consumers.
//!
//! Exported symbols (feature `llama-cpp`):
//! - `ocr_init(argc, argv)` returns an opaque session handle or NULL
//! - `ocr_run(ctx, embeds, n_embeds, mode)` returns an `ocr_result` or NULL
//! - `ocr_cleanup_ctx(ctx)` resets the decode context
//! - `ocr_free(ctx)` destroys the session
//! - `ocr_free_result(result)` releases a result
//!
//! Teardown calls return `-1` when handed a NULL pointer. The generic
//! helpers below do the work so they can be driven by any backend.

use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::ptr;

use tracing::{error, warn};

use crate::backend::{DecodeBackend, EMBED_DIM};
use crate::config::OcrConfig;
use crate::logging;
use crate::output::OcrOutput;
use crate::prompt::OcrMode;
use crate::session::OcrSession;
use crate::OcrError;

/// Result handed across the C boundary. Exactly one field is non-NULL.
#[repr(C)]
#[allow(non_camel_case_types)]
pub struct ocr_result {
    pub result: *mut c_char,
    pub error: *mut c_char,
}

impl ocr_result {
    fn from_output(output: OcrOutput) -> Self {
        match output {
            OcrOutput::Text(text) => Self {
                result: to_c_string(text),
                error: ptr::null_mut(),
            },
            OcrOutput::Error(message) => Self {
                result: ptr::null_mut(),
                error: to_c_string(message),
            },
        }
    }
}

fn to_c_string(text: String) -> *mut c_char {
    // Interior NULs would truncate the string on the C side anyway
    CString::new(text.replace('\0', ""))
        .unwrap_or_default()
        .into_raw()
}

/// # Safety
/// `argv` must point to `argc` valid NUL-terminated strings.
unsafe fn collect_args(argc: c_int, argv: *const *const c_char) -> Vec<String> {
    if argv.is_null() || argc <= 0 {
        return Vec::new();
    }
    (0..argc as usize)
        .map(|i| *argv.add(i))
        .filter(|arg| !arg.is_null())
        .map(|arg| CStr::from_ptr(arg).to_string_lossy().into_owned())
        .collect()
}

/// Parse arguments, install logging and create a boxed session.
///
/// # Safety
/// `argv` must point to `argc` valid NUL-terminated strings.
pub unsafe fn init_handle<B: DecodeBackend>(argc: c_int, argv: *const *const c_char) -> *mut c_void {
    let args = collect_args(argc, argv);
    let config = match OcrConfig::from_args(args) {
        Ok(config) => config,
        Err(e) => {
            logging::init(0);
            error!("ocr_init: {e}");
            return ptr::null_mut();
        }
    };
    logging::init(config.log_verbosity);

    match OcrSession::<B>::create(config) {
        Ok(session) => Box::into_raw(Box::new(session)).cast(),
        Err(e) => {
            error!("ocr_init: {e}");
            ptr::null_mut()
        }
    }
}

/// Run one OCR pass. NULL means nothing was committed (bad handle, bad
/// mode, bad buffer); failures after prefill began come back as an
/// error-bearing result.
///
/// # Safety
/// `ctx` must come from `init_handle::<B>` and not have been freed;
/// `embeds` must point to `n_embeds * 1024` floats.
pub unsafe fn run_handle<B: DecodeBackend>(
    ctx: *mut c_void,
    embeds: *const f32,
    n_embeds: c_int,
    mode: c_int,
) -> *mut ocr_result {
    if ctx.is_null() {
        error!("ocr_run: null session handle");
        return ptr::null_mut();
    }
    let mode = match OcrMode::try_from(mode) {
        Ok(mode) => mode,
        Err(e) => {
            error!("ocr_run: {e}");
            return ptr::null_mut();
        }
    };
    let Ok(n_embeds) = usize::try_from(n_embeds) else {
        error!("ocr_run: negative embedding count {n_embeds}");
        return ptr::null_mut();
    };
    let embeds: &[f32] = if n_embeds == 0 {
        &[]
    } else if embeds.is_null() {
        error!("ocr_run: null embedding buffer");
        return ptr::null_mut();
    } else {
        std::slice::from_raw_parts(embeds, n_embeds * EMBED_DIM)
    };

    let session = &mut *ctx.cast::<OcrSession<B>>();
    let result = match session.run(embeds, mode) {
        Ok(output) => ocr_result::from_output(output),
        Err(
            e @ (OcrError::Argument(_) | OcrError::InvalidState(_) | OcrError::AlreadyDestroyed),
        ) => {
            error!("ocr_run: {e}");
            return ptr::null_mut();
        }
        Err(e) => {
            warn!("ocr_run failed: {e}");
            ocr_result::from_output(OcrOutput::Error(e.to_string()))
        }
    };
    Box::into_raw(Box::new(result))
}

/// # Safety
/// `ctx` must be NULL or a live handle from `init_handle::<B>`.
pub unsafe fn cleanup_handle<B: DecodeBackend>(ctx: *mut c_void) -> c_int {
    if ctx.is_null() {
        return -1;
    }
    let session = &mut *ctx.cast::<OcrSession<B>>();
    match session.reset() {
        Ok(()) => 0,
        Err(e) => {
            error!("ocr_cleanup_ctx: {e}");
            -1
        }
    }
}

/// # Safety
/// `ctx` must be NULL or a live handle from `init_handle::<B>`; it is
/// invalid afterwards.
pub unsafe fn free_handle<B: DecodeBackend>(ctx: *mut c_void) -> c_int {
    if ctx.is_null() {
        return -1;
    }
    let mut session = Box::from_raw(ctx.cast::<OcrSession<B>>());
    match session.destroy() {
        Ok(()) => 0,
        Err(e) => {
            error!("ocr_free: {e}");
            -1
        }
    }
}

/// # Safety
/// `result` must be NULL or a pointer returned by `run_handle`, freed once.
pub unsafe fn free_result(result: *mut ocr_result) -> c_int {
    if result.is_null() {
        return -1;
    }
    let result = Box::from_raw(result);
    if !result.result.is_null() {
        drop(CString::from_raw(result.result));
    }
    if !result.error.is_null() {
        drop(CString::from_raw(result.error));
    }
    0
}

#[cfg(feature = "llama-cpp")]
mod exports {
    use std::ffi::{c_char, c_int, c_void};

    use super::ocr_result;
    use crate::backend::llama_cpp::LlamaCppBackend;

    #[no_mangle]
    pub unsafe extern "C" fn ocr_init(argc: c_int, argv: *const *const c_char) -> *mut c_void {
        super::init_handle::<LlamaCppBackend>(argc, argv)
    }

    #[no_mangle]
    pub unsafe extern "C" fn ocr_run(
        ctx: *mut c_void,
        image_embeds: *const f32,
        n_embeds: c_int,
        got_type: c_int,
    ) -> *mut ocr_result {
        super::run_handle::<LlamaCppBackend>(ctx, image_embeds, n_embeds, got_type)
    }

    #[no_mangle]
    pub unsafe extern "C" fn ocr_cleanup_ctx(ctx: *mut c_void) -> c_int {
        super::cleanup_handle::<LlamaCppBackend>(ctx)
    }

    #[no_mangle]
    pub unsafe extern "C" fn ocr_free(ctx: *mut c_void) -> c_int {
        super::free_handle::<LlamaCppBackend>(ctx)
    }

    #[no_mangle]
    pub unsafe extern "C" fn ocr_free_result(result: *mut ocr_result) -> c_int {
        super::free_result(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::scripted::{live_backends, ScriptedBackend};

    fn argv(args: &[&str]) -> (Vec<CString>, Vec<*const c_char>) {
        let owned: Vec<CString> = args.iter().map(|a| CString::new(*a).unwrap()).collect();
        let ptrs = owned.iter().map(|a| a.as_ptr()).collect();
        (owned, ptrs)
    }

    fn init(args: &[&str]) -> *mut c_void {
        let (_owned, ptrs) = argv(args);
        unsafe { init_handle::<ScriptedBackend>(ptrs.len() as c_int, ptrs.as_ptr()) }
    }

    fn manifest() -> String {
        concat!(env!("CARGO_MANIFEST_DIR"), "/Cargo.toml").to_string()
    }

    #[test]
    fn null_teardown_arguments_return_minus_one() {
        unsafe {
            assert_eq!(cleanup_handle::<ScriptedBackend>(ptr::null_mut()), -1);
            assert_eq!(free_handle::<ScriptedBackend>(ptr::null_mut()), -1);
            assert_eq!(free_result(ptr::null_mut()), -1);
        }
    }

    #[test]
    fn init_failure_returns_null() {
        assert!(init(&["got", "-m", "/nonexistent/decoder.gguf"]).is_null());
        assert!(init(&["got", "-b", "0", "-m", "x.gguf"]).is_null());
        assert!(init(&["got"]).is_null());
        assert_eq!(live_backends(), 0);
    }

    #[test]
    fn full_lifecycle() {
        let model = manifest();
        let ctx = init(&["got", "-m", &model]);
        assert!(!ctx.is_null());
        assert_eq!(live_backends(), 1);

        let embeds = vec![0.0f32; 2 * EMBED_DIM];
        unsafe {
            let result = run_handle::<ScriptedBackend>(ctx, embeds.as_ptr(), 2, 1);
            assert!(!result.is_null());
            assert!(!(*result).result.is_null());
            assert!((*result).error.is_null());
            assert_eq!(CStr::from_ptr((*result).result).to_str().unwrap(), "");
            assert_eq!(free_result(result), 0);

            assert_eq!(cleanup_handle::<ScriptedBackend>(ctx), 0);
            assert_eq!(cleanup_handle::<ScriptedBackend>(ctx), 0);
            assert_eq!(free_handle::<ScriptedBackend>(ctx), 0);
        }
        assert_eq!(live_backends(), 0);
    }

    #[test]
    fn invalid_run_inputs_return_null() {
        let model = manifest();
        let ctx = init(&["got", "-m", &model]);
        let embeds = vec![0.0f32; EMBED_DIM];
        unsafe {
            assert!(run_handle::<ScriptedBackend>(ctx, embeds.as_ptr(), 1, 99).is_null());
            assert!(run_handle::<ScriptedBackend>(ctx, embeds.as_ptr(), -1, 1).is_null());
            assert!(run_handle::<ScriptedBackend>(ctx, ptr::null(), 1, 1).is_null());
            assert!(run_handle::<ScriptedBackend>(ptr::null_mut(), embeds.as_ptr(), 1, 1).is_null());
            assert_eq!(free_handle::<ScriptedBackend>(ctx), 0);
        }
    }

    #[test]
    fn text_results_drop_interior_nul() {
        let result = ocr_result::from_output(OcrOutput::Text("a\0b".into()));
        unsafe {
            assert_eq!(CStr::from_ptr(result.result).to_str().unwrap(), "ab");
            assert!(result.error.is_null());
            assert_eq!(free_result(Box::into_raw(Box::new(result))), 0);
        }
    }
}
