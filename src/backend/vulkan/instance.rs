//! Vulkan instance creation and configuration.

use std::ffi::{c_char, CStr};

use ash::vk;

use crate::backend::traits::{BackendError, BackendResult};
use crate::WindowTarget;

use super::debug;

/// Timeline semaphores and buffer device addresses are core in 1.2.
pub(super) const REQUIRED_API_VERSION: u32 = vk::make_api_version(0, 1, 2, 0);

const VALIDATION_LAYER_NAME: &CStr = c"VK_LAYER_KHRONOS_validation";

/// A presentable surface and the extension that owns it.
pub(super) struct SurfaceContext {
    pub loader: ash::khr::surface::Instance,
    pub surface: vk::SurfaceKHR,
}

/// Instance-level objects. Destroyed on drop, after everything created from them.
pub(super) struct InstanceContext {
    pub entry: ash::Entry,
    pub instance: ash::Instance,
    debug: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    pub surface: Option<SurfaceContext>,
    pub validation_enabled: bool,
}

impl InstanceContext {
    /// Load Vulkan, create the instance and, for a window, its surface.
    pub fn new(
        debug_layer: bool,
        validation_shaders: bool,
        window: Option<&WindowTarget>,
    ) -> BackendResult<Self> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| BackendError::creation("instance", format!("failed to load Vulkan: {e}")))?;

        let validation_enabled = debug_layer && check_validation_layer_support(&entry);
        if debug_layer && !validation_enabled {
            log::warn!("Validation layers requested but not available");
        }

        let app_info = vk::ApplicationInfo::default()
            .application_name(c"graphics-device")
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"graphics-device")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(REQUIRED_API_VERSION);

        let mut extensions: Vec<*const c_char> = Vec::new();
        if let Some(window) = window {
            let required = ash_window::enumerate_required_extensions(window.display)
                .map_err(|e| BackendError::creation("instance", format!("{e:?}")))?;
            extensions.extend_from_slice(required);
        }
        if validation_enabled {
            extensions.push(ash::ext::debug_utils::NAME.as_ptr());
        }
        let gpu_assisted = validation_enabled && validation_shaders;
        if gpu_assisted {
            extensions.push(ash::ext::validation_features::NAME.as_ptr());
        }

        let layer_names: Vec<*const c_char> = if validation_enabled {
            vec![VALIDATION_LAYER_NAME.as_ptr()]
        } else {
            vec![]
        };

        let enabled_features = [vk::ValidationFeatureEnableEXT::GPU_ASSISTED];
        let mut validation_features =
            vk::ValidationFeaturesEXT::default().enabled_validation_features(&enabled_features);

        let mut create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);
        if gpu_assisted {
            create_info = create_info.push_next(&mut validation_features);
        }

        let instance = unsafe { entry.create_instance(&create_info, None) }.map_err(|e| {
            BackendError::creation("instance", format!("failed to create Vulkan instance: {e:?}"))
        })?;

        // From here on, dropping `context` unwinds whatever was created.
        let mut context = Self {
            entry,
            instance,
            debug: None,
            surface: None,
            validation_enabled,
        };

        if validation_enabled {
            let debug_utils = ash::ext::debug_utils::Instance::new(&context.entry, &context.instance);
            let messenger = debug::create_debug_messenger(&debug_utils)?;
            context.debug = Some((debug_utils, messenger));
        }

        if let Some(window) = window {
            let surface = unsafe {
                ash_window::create_surface(
                    &context.entry,
                    &context.instance,
                    window.display,
                    window.window,
                    None,
                )
            }
            .map_err(|e| BackendError::creation("surface", format!("{e:?}")))?;
            context.surface = Some(SurfaceContext {
                loader: ash::khr::surface::Instance::new(&context.entry, &context.instance),
                surface,
            });
        }

        Ok(context)
    }
}

impl Drop for InstanceContext {
    fn drop(&mut self) {
        unsafe {
            if let Some(surface) = self.surface.take() {
                surface.loader.destroy_surface(surface.surface, None);
            }
            if let Some((debug_utils, messenger)) = self.debug.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

fn check_validation_layer_support(entry: &ash::Entry) -> bool {
    let Ok(available_layers) = (unsafe { entry.enumerate_instance_layer_properties() }) else {
        return false;
    };
    available_layers.iter().any(|layer| {
        // SAFETY: layer_name is a null-terminated fixed-size array
        let name = unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) };
        name == VALIDATION_LAYER_NAME
    })
}
