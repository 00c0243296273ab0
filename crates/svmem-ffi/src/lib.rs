//! C ABI for the svmem device report
//!
//! Every function returns a status code from [`svmem_core::error::status`]
//! (`0` or a non-negative length on success). The message of the last
//! failure on the calling thread is available via [`svmem_last_error`].

use std::cell::RefCell;
use std::ffi::{c_char, c_int, CStr};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::OnceLock;
use svmem_core::error::status;
use svmem_core::{
    default_runtime, run_atomic_probe, ExportFormat, RegionFlags, Report, SvmManager,
};
use tracing::warn;

/// Work items used by the self test probe
const SELFTEST_WORK_ITEMS: usize = 256;

static MANAGER: OnceLock<SvmManager> = OnceLock::new();

thread_local! {
    static LAST_ERROR: RefCell<String> = const { RefCell::new(String::new()) };
}

fn manager() -> &'static SvmManager {
    MANAGER.get_or_init(|| SvmManager::new(default_runtime()))
}

fn set_last_error(message: String) {
    LAST_ERROR.with(|e| *e.borrow_mut() = message);
}

fn fail(code: c_int, message: String) -> c_int {
    warn!(code, %message, "svmem call failed");
    set_last_error(message);
    code
}

fn from_error(e: svmem_core::Error) -> c_int {
    fail(e.status_code(), e.to_string())
}

/// Run `f`, turning a panic into a status code
fn guarded<F: FnOnce() -> c_int>(f: F) -> c_int {
    catch_unwind(AssertUnwindSafe(f))
        .unwrap_or_else(|_| fail(status::NATIVE, "internal panic".to_string()))
}

/// Fresh discovery rendered as a report
fn current_report() -> Result<Report, c_int> {
    let manager = manager();
    manager.discover().map_err(from_error)?;
    Ok(manager.report())
}

/// Copy `text` plus a NUL terminator into `buf`.
///
/// With a null `buf` or zero `cap` nothing is written and the required
/// length (without terminator) is returned.
unsafe fn copy_text(text: &[u8], buf: *mut c_char, cap: usize) -> c_int {
    let Ok(len) = c_int::try_from(text.len()) else {
        return status::BUFFER_TOO_SMALL;
    };
    if buf.is_null() || cap == 0 {
        return len;
    }
    if cap <= text.len() {
        return status::BUFFER_TOO_SMALL;
    }
    std::ptr::copy_nonoverlapping(text.as_ptr(), buf.cast::<u8>(), text.len());
    *buf.add(text.len()) = 0;
    len
}

fn too_small(text: &[u8], cap: usize) -> c_int {
    fail(
        status::BUFFER_TOO_SMALL,
        format!("buffer of {} bytes, {} needed", cap, text.len() + 1),
    )
}

/// [`copy_text`], recording a too-small buffer as the last error
unsafe fn write_text(text: &[u8], buf: *mut c_char, cap: usize) -> c_int {
    match copy_text(text, buf, cap) {
        status::BUFFER_TOO_SMALL => too_small(text, cap),
        code => code,
    }
}

/// Library version
///
/// # Safety
/// Each pointer must be null or valid for a write of one `c_int`.
#[no_mangle]
pub unsafe extern "C" fn svmem_get_version(
    major: *mut c_int,
    minor: *mut c_int,
    patch: *mut c_int,
) -> c_int {
    if major.is_null() || minor.is_null() || patch.is_null() {
        return fail(status::INVALID_ARGUMENT, "null version pointer".to_string());
    }
    let part = |s: &str| s.parse::<c_int>().unwrap_or(0);
    *major = part(env!("CARGO_PKG_VERSION_MAJOR"));
    *minor = part(env!("CARGO_PKG_VERSION_MINOR"));
    *patch = part(env!("CARGO_PKG_VERSION_PATCH"));
    status::SUCCESS
}

/// Allocate, map and probe a region on the first device; 0 when all pass.
///
/// Runs against a private manager so the shared report never shows the
/// test context.
#[no_mangle]
pub extern "C" fn svmem_selftest() -> c_int {
    guarded(|| {
        let manager = SvmManager::new(default_runtime());
        let mut context = match manager.create_default_context() {
            Ok(context) => context,
            Err(e) => return from_error(e),
        };
        let result = (|| {
            let region = context.allocate(64, RegionFlags::COARSE_GRAIN)?;
            let access = svmem_core::AccessMode::ReadWrite;
            let mapped = context.with_mapped(region, access, |m| {
                m.as_mut_slice()?.fill(0xA5);
                Ok(m.as_slice()?.iter().all(|&b| b == 0xA5))
            });
            context.free(region)?;
            if !mapped? {
                return Err(svmem_core::Error::InvalidArgument(
                    "mapped region did not hold written data".to_string(),
                ));
            }
            if context.record().validate(svmem_core::probe::PROBE_FLAGS).is_ok() {
                run_atomic_probe(&mut context, SELFTEST_WORK_ITEMS)?;
            }
            context.destroy()
        })();
        match result {
            Ok(()) => status::SUCCESS,
            Err(e) => from_error(e),
        }
    })
}

/// Number of devices across all platforms, or a negative status
#[no_mangle]
pub extern "C" fn svmem_device_count() -> c_int {
    guarded(|| match current_report() {
        Ok(report) => c_int::try_from(report.device_count()).unwrap_or(c_int::MAX),
        Err(code) => code,
    })
}

/// Full report as JSON text.
///
/// Returns the text length, `-5` if `cap` is too small, or the required
/// length when `buf` is null or `cap` is 0.
///
/// # Safety
/// `buf` must be null or valid for writes of `cap` bytes.
#[no_mangle]
pub unsafe extern "C" fn svmem_enumerate_devices_json(buf: *mut c_char, cap: usize) -> c_int {
    guarded(|| {
        let report = match current_report() {
            Ok(report) => report,
            Err(code) => return code,
        };
        match report.to_bytes(ExportFormat::JsonPretty) {
            Ok(text) => write_text(&text, buf, cap),
            Err(e) => from_error(e),
        }
    })
}

/// JSON of the device at flat `index`: `0`, `-2` for a bad index, `-5` if
/// the buffer is too small.
///
/// There is no size query here; `cap = 0` is `-5` like any short buffer.
///
/// # Safety
/// `buf` must be valid for writes of `cap` bytes.
#[no_mangle]
pub unsafe extern "C" fn svmem_export_device_info_json(
    index: c_int,
    buf: *mut c_char,
    cap: usize,
) -> c_int {
    guarded(|| {
        if buf.is_null() {
            return fail(status::INVALID_ARGUMENT, "null buffer".to_string());
        }
        let report = match current_report() {
            Ok(report) => report,
            Err(code) => return code,
        };
        let index = match usize::try_from(index) {
            Ok(index) if index < report.device_count() => index,
            _ => {
                return fail(
                    status::NO_DEVICE,
                    format!("device index {} out of range", index),
                )
            }
        };
        match report.device_json(index, ExportFormat::JsonPretty) {
            Ok(text) if cap <= text.len() => too_small(&text, cap),
            Ok(text) => match write_text(&text, buf, cap) {
                code if code < 0 => code,
                _ => status::SUCCESS,
            },
            Err(e) => from_error(e),
        }
    })
}

/// Write the full report to `path`: `0`, or `-6` on I/O failure.
///
/// # Safety
/// `path` must be null or a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn svmem_export_all_devices_json(path: *const c_char) -> c_int {
    guarded(|| {
        if path.is_null() {
            return fail(status::INVALID_ARGUMENT, "null path".to_string());
        }
        let Ok(path) = CStr::from_ptr(path).to_str() else {
            return fail(status::INVALID_ARGUMENT, "path is not valid UTF-8".to_string());
        };
        let text = match current_report().and_then(|r| {
            r.to_bytes(ExportFormat::JsonPretty).map_err(from_error)
        }) {
            Ok(text) => text,
            Err(code) => return code,
        };
        match std::fs::write(path, text) {
            Ok(()) => status::SUCCESS,
            Err(e) => fail(status::FILE_IO, format!("{}: {}", path, e)),
        }
    })
}

/// Message of the last failure on this thread, same buffer rules as
/// [`svmem_enumerate_devices_json`]
///
/// # Safety
/// `buf` must be null or valid for writes of `cap` bytes.
#[no_mangle]
pub unsafe extern "C" fn svmem_last_error(buf: *mut c_char, cap: usize) -> c_int {
    let message = LAST_ERROR.with(|e| e.borrow().clone());
    copy_text(message.as_bytes(), buf, cap)
}
