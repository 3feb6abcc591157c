//! Vulkan instance management.
//!
//! This module handles VkInstance creation, the validation layer and the debug
//! messenger.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use framecycle_rhi::diagnostics::TracingSink;
//! use framecycle_rhi::instance::Instance;
//!
//! let instance = Instance::new(cfg!(debug_assertions), Arc::new(TracingSink))
//!     .expect("Failed to create Vulkan instance");
//!
//! let vk_instance = instance.handle();
//! let entry = instance.entry();
//! ```

use std::ffi::{CStr, c_void};
use std::sync::Arc;

use ash::{Entry, vk};
use tracing::{info, warn};

use crate::diagnostics::{DiagnosticMessage, DiagnosticsSink, MessageKind, Severity};
use crate::error::RhiError;

/// The Khronos validation layer name.
const VALIDATION_LAYER_NAME: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Window-system surface extensions; at least one must be available.
#[cfg(target_os = "windows")]
const PLATFORM_SURFACE_EXTENSIONS: &[&CStr] = &[ash::khr::win32_surface::NAME];
#[cfg(target_os = "linux")]
const PLATFORM_SURFACE_EXTENSIONS: &[&CStr] =
    &[ash::khr::xlib_surface::NAME, ash::khr::wayland_surface::NAME];
#[cfg(target_os = "macos")]
const PLATFORM_SURFACE_EXTENSIONS: &[&CStr] = &[ash::ext::metal_surface::NAME];
#[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
const PLATFORM_SURFACE_EXTENSIONS: &[&CStr] = &[];

/// Vulkan instance wrapper with optional validation layer support.
pub struct Instance {
    /// Vulkan entry point loader
    entry: Entry,
    /// Vulkan instance handle
    instance: ash::Instance,
    /// Debug utils extension loader and messenger (validation only)
    debug: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    /// Sink behind the messenger's user-data pointer. Boxed so the pointer
    /// stays valid while the instance moves; outlives the messenger.
    sink: Box<Arc<dyn DiagnosticsSink>>,
}

impl Instance {
    /// Creates a new Vulkan instance.
    ///
    /// # Arguments
    ///
    /// * `enable_validation` - Enable the validation layer if it is installed
    /// * `sink` - Receives validation messages
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The Vulkan library cannot be loaded
    /// - Instance creation fails
    /// - Debug messenger setup fails
    pub fn new(enable_validation: bool, sink: Arc<dyn DiagnosticsSink>) -> Result<Self, RhiError> {
        let entry = unsafe { Entry::load()? };

        let validation_available =
            enable_validation && Self::is_validation_layer_available(&entry)?;
        if enable_validation && !validation_available {
            warn!("Validation layer requested but not available, proceeding without it");
        }

        let app_info = vk::ApplicationInfo::default()
            .application_name(c"framecycle")
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"framecycle")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_1);

        let properties = Self::available_extensions(&entry)?;
        let available: Vec<&CStr> = properties
            .iter()
            .filter_map(|ext| ext.extension_name_as_c_str().ok())
            .collect();
        let mut extensions: Vec<*const std::ffi::c_char> = Self::surface_extensions(&available)?
            .into_iter()
            .map(CStr::as_ptr)
            .collect();
        if validation_available {
            extensions.push(ash::ext::debug_utils::NAME.as_ptr());
        }

        let layers = if validation_available {
            vec![VALIDATION_LAYER_NAME.as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layers);

        let instance = unsafe { entry.create_instance(&create_info, None)? };

        info!("Vulkan instance created (API version 1.1)");

        let sink = Box::new(sink);
        let debug = if validation_available {
            let debug_utils = ash::ext::debug_utils::Instance::new(&entry, &instance);
            let user_data = &*sink as *const Arc<dyn DiagnosticsSink> as *mut c_void;
            match Self::setup_debug_messenger(&debug_utils, user_data) {
                Ok(messenger) => {
                    info!("Validation layers enabled");
                    Some((debug_utils, messenger))
                }
                Err(e) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(e);
                }
            }
        } else {
            None
        };

        Ok(Self {
            entry,
            instance,
            debug,
            sink,
        })
    }

    /// Returns the Vulkan instance handle.
    #[inline]
    pub fn handle(&self) -> &ash::Instance {
        &self.instance
    }

    /// Returns the Vulkan entry point loader.
    #[inline]
    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    /// Returns whether validation layers are enabled.
    #[inline]
    pub fn has_validation(&self) -> bool {
        self.debug.is_some()
    }

    /// Returns the sink validation messages are routed to.
    #[inline]
    pub fn diagnostics(&self) -> &Arc<dyn DiagnosticsSink> {
        &self.sink
    }

    /// Surface extensions for this platform, narrowed to what the loader offers.
    ///
    /// `VK_KHR_surface` is mandatory. Of the platform's window-system
    /// extensions at least one must be present; on Linux xlib and wayland are
    /// each enabled only when available.
    fn surface_extensions(available: &[&CStr]) -> Result<Vec<&'static CStr>, RhiError> {
        if !available.contains(&ash::khr::surface::NAME) {
            return Err(RhiError::SurfaceError(
                "VK_KHR_surface is not supported by the Vulkan loader".to_string(),
            ));
        }

        let platform: Vec<&'static CStr> = PLATFORM_SURFACE_EXTENSIONS
            .iter()
            .copied()
            .filter(|name| available.contains(name))
            .collect();
        if platform.is_empty() && !PLATFORM_SURFACE_EXTENSIONS.is_empty() {
            return Err(RhiError::SurfaceError(format!(
                "None of the window-system extensions {:?} are supported",
                PLATFORM_SURFACE_EXTENSIONS
            )));
        }

        let mut extensions = vec![ash::khr::surface::NAME];
        extensions.extend(platform);
        Ok(extensions)
    }

    fn available_extensions(entry: &Entry) -> Result<Vec<vk::ExtensionProperties>, RhiError> {
        Ok(unsafe { entry.enumerate_instance_extension_properties(None)? })
    }

    /// Checks if the Khronos validation layer is available.
    fn is_validation_layer_available(entry: &Entry) -> Result<bool, RhiError> {
        let available_layers = unsafe { entry.enumerate_instance_layer_properties()? };

        let found = available_layers.iter().any(|layer| {
            layer
                .layer_name_as_c_str()
                .is_ok_and(|name| name == VALIDATION_LAYER_NAME)
        });

        Ok(found)
    }

    fn setup_debug_messenger(
        debug_utils: &ash::ext::debug_utils::Instance,
        user_data: *mut c_void,
    ) -> Result<vk::DebugUtilsMessengerEXT, RhiError> {
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback))
            .user_data(user_data);

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None)? };
        Ok(messenger)
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        unsafe {
            // The messenger must go before the instance and before `sink` is freed.
            if let Some((debug_utils, messenger)) = self.debug.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
        info!("Vulkan instance destroyed");
    }
}

/// Debug messenger callback.
///
/// # Safety
///
/// `user_data` must point to the `Arc<dyn DiagnosticsSink>` owned by the
/// [`Instance`] that registered the messenger.
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    user_data: *mut c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || user_data.is_null() {
        return vk::FALSE;
    }

    let callback_data = unsafe { &*p_callback_data };
    let text = if callback_data.p_message.is_null() {
        "(no message)".to_string()
    } else {
        unsafe { CStr::from_ptr(callback_data.p_message) }
            .to_string_lossy()
            .into_owned()
    };

    let sink = unsafe { &*(user_data as *const Arc<dyn DiagnosticsSink>) };
    sink.report(DiagnosticMessage {
        severity: Severity::from_vk(message_severity),
        kind: MessageKind::from_vk(message_type),
        text,
    });

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::{CollectingSink, TracingSink};

    #[test]
    fn test_instance_creation_without_validation() {
        match Instance::new(false, Arc::new(TracingSink)) {
            Ok(instance) => assert!(!instance.has_validation()),
            Err(RhiError::LoadingError(_)) => {
                eprintln!("Skipping test: Vulkan not available");
            }
            Err(e) => panic!("Unexpected error: {:?}", e),
        }
    }

    #[test]
    fn test_instance_creation_with_collecting_sink() {
        let sink = Arc::new(CollectingSink::new());
        match Instance::new(true, sink.clone()) {
            Ok(instance) => {
                if instance.has_validation() {
                    assert!(instance.debug.is_some());
                }
                drop(instance);
                assert_eq!(sink.count_at_least(Severity::Error), 0);
            }
            Err(RhiError::LoadingError(_)) => {
                eprintln!("Skipping test: Vulkan not available");
            }
            Err(e) => panic!("Unexpected error: {:?}", e),
        }
    }

    #[test]
    fn test_callback_routes_to_sink() {
        let collecting = Arc::new(CollectingSink::new());
        let sink: Box<Arc<dyn DiagnosticsSink>> = Box::new(collecting.clone());
        let data = vk::DebugUtilsMessengerCallbackDataEXT::default().message(c"bad usage");

        let result = unsafe {
            debug_callback(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
                vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION,
                &data,
                &*sink as *const Arc<dyn DiagnosticsSink> as *mut c_void,
            )
        };

        assert_eq!(result, vk::FALSE);
        let messages = collecting.drain();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].severity, Severity::Error);
        assert_eq!(messages[0].kind, MessageKind::Validation);
        assert_eq!(messages[0].text, "bad usage");
    }

    #[test]
    fn test_surface_extension_is_mandatory() {
        assert!(matches!(
            Instance::surface_extensions(&[]),
            Err(RhiError::SurfaceError(_))
        ));
    }

    #[test]
    fn test_surface_extensions_use_only_available_platform_ones() {
        let mut available = vec![ash::khr::surface::NAME];
        available.extend(PLATFORM_SURFACE_EXTENSIONS.iter().take(1));

        let extensions = Instance::surface_extensions(&available).unwrap();
        assert_eq!(extensions, available);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_wayland_only_linux() {
        let available = [ash::khr::surface::NAME, ash::khr::wayland_surface::NAME];
        let extensions = Instance::surface_extensions(&available).unwrap();
        assert_eq!(extensions, available);

        assert!(Instance::surface_extensions(&[ash::khr::surface::NAME]).is_err());
    }
}
