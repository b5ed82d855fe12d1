//! Validation layer output routed into `log`.
//!
//! The messenger only subscribes to severities the active log filter would
//! print, so a quiet logger does not pay for formatting driver chatter.

use std::borrow::Cow;
use std::ffi::{c_char, CStr};

use ash::vk;

use crate::backend::traits::{BackendError, BackendResult};

type Severity = vk::DebugUtilsMessageSeverityFlagsEXT;

/// Log level a validation message of `severity` is reported at.
fn level_of(severity: Severity) -> log::Level {
    if severity.contains(Severity::ERROR) {
        log::Level::Error
    } else if severity.contains(Severity::WARNING) {
        log::Level::Warn
    } else if severity.contains(Severity::INFO) {
        log::Level::Debug
    } else {
        log::Level::Trace
    }
}

/// Severities worth subscribing to under `filter`. Errors are always kept.
fn subscribed_severities(filter: log::LevelFilter) -> Severity {
    [Severity::WARNING, Severity::INFO, Severity::VERBOSE]
        .into_iter()
        .filter(|&severity| level_of(severity) <= filter)
        .fold(Severity::ERROR, |mask, severity| mask | severity)
}

pub(super) fn create_debug_messenger(
    debug_utils: &ash::ext::debug_utils::Instance,
) -> BackendResult<vk::DebugUtilsMessengerEXT> {
    let severities = subscribed_severities(log::max_level());
    let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(severities)
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(on_message));

    log::debug!("Validation messenger subscribed to {:?}", severities);
    unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
        .map_err(|e| BackendError::creation("debug messenger", format!("{e:?}")))
}

/// # Safety
///
/// `ptr` is null or a null-terminated string that outlives the returned value.
unsafe fn driver_str<'a>(ptr: *const c_char) -> Cow<'a, str> {
    if ptr.is_null() {
        Cow::Borrowed("")
    } else {
        unsafe { CStr::from_ptr(ptr) }.to_string_lossy()
    }
}

unsafe extern "system" fn on_message(
    severity: Severity,
    kind: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    // SAFETY: the layer passes null or data valid for the duration of the call
    let Some(data) = (unsafe { data.as_ref() }) else {
        return vk::FALSE;
    };
    let id = unsafe { driver_str(data.p_message_id_name) };
    let message = unsafe { driver_str(data.p_message) };

    let kind = if kind.contains(vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION) {
        "validation"
    } else if kind.contains(vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE) {
        "performance"
    } else {
        "general"
    };
    log::log!(target: "vulkan", level_of(severity), "[{} {}] {}", kind, id, message);

    vk::FALSE
}
