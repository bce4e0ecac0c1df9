//! Vulkan instance creation and physical device queries.
//!
//! [`Instance`] owns the entry-point loader, the `ash::Instance`, an optional
//! debug messenger and the optional surface extension loader. Physical device
//! capabilities are gathered in one pass by
//! [`Instance::query_physical_device`] into a [`PhysicalDeviceInfo`].

use std::{
    ffi::{CStr, CString},
    fmt::Debug,
    str::FromStr,
};

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use thiserror::Error;

use crate::surface::{CreateSurfaceError, SurfaceQueryError, SurfaceSupportError};

/// Minimum severity forwarded from the validation layers to `tracing`.
///
/// Ordered least to most severe.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub enum VulkanLogLevel {
    Verbose,
    Info,
    Warning,
    Error,
}

impl VulkanLogLevel {
    fn severity_flags(self) -> vk::DebugUtilsMessageSeverityFlagsEXT {
        use vk::DebugUtilsMessageSeverityFlagsEXT as S;
        match self {
            VulkanLogLevel::Verbose => S::VERBOSE | S::INFO | S::WARNING | S::ERROR,
            VulkanLogLevel::Info => S::INFO | S::WARNING | S::ERROR,
            VulkanLogLevel::Warning => S::WARNING | S::ERROR,
            VulkanLogLevel::Error => S::ERROR,
        }
    }
}

/// A packed Vulkan API version number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VkVersion(u32);

impl VkVersion {
    /// The lowest API version this crate creates devices for.
    pub const MINIMUM: VkVersion = VkVersion(vk::API_VERSION_1_3);

    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn new(variant: u32, major: u32, minor: u32, patch: u32) -> Self {
        Self(vk::make_api_version(variant, major, minor, patch))
    }

    pub fn variant(&self) -> u32 {
        vk::api_version_variant(self.0)
    }

    pub fn major(&self) -> u32 {
        vk::api_version_major(self.0)
    }

    pub fn minor(&self) -> u32 {
        vk::api_version_minor(self.0)
    }

    pub fn patch(&self) -> u32 {
        vk::api_version_patch(self.0)
    }

    /// True when this version is `major.minor` or newer, ignoring patch.
    pub fn at_least(&self, major: u32, minor: u32) -> bool {
        (self.major(), self.minor()) >= (major, minor)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for VkVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major(), self.minor(), self.patch())
    }
}

/// Ray tracing limits reported through
/// `VkPhysicalDeviceRayTracingPipelinePropertiesKHR` and
/// `VkPhysicalDeviceAccelerationStructurePropertiesKHR`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RayTracingInfo {
    pub shader_group_handle_size: u32,
    pub shader_group_handle_alignment: u32,
    pub shader_group_base_alignment: u32,
    pub max_ray_recursion_depth: u32,
    pub min_scratch_offset_alignment: u32,
}

/// Everything the backend needs to know about one physical device.
#[derive(Debug, Clone)]
pub struct PhysicalDeviceInfo {
    pub handle: vk::PhysicalDevice,
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub vendor_id: u32,
    pub device_id: u32,
    pub api_version: VkVersion,
    pub limits: vk::PhysicalDeviceLimits,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub queue_families: Vec<vk::QueueFamilyProperties>,
    pub swapchain: bool,
    pub buffer_device_address: bool,
    pub descriptor_indexing: bool,
    /// `Some` only when every extension and feature needed for ray tracing
    /// pipelines is present.
    pub ray_tracing: Option<RayTracingInfo>,
}

/// The root Vulkan object.
///
/// All objects derived from an instance hold an `Arc<Instance>`.
pub struct Instance {
    entry: ash::Entry,
    handle: ash::Instance,
    debug_messenger:
        Option<(vk::DebugUtilsMessengerEXT, ash::ext::debug_utils::Instance)>,
    surface_instance: Option<ash::khr::surface::Instance>,
    ver: VkVersion,
}

impl Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("handle", &self.handle.handle())
            .field("version", &self.ver)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
pub enum InstanceCreationError {
    #[error("Could not load Vulkan: {0}")]
    Loading(ash::LoadingError),
    #[error("Couldn't get display handle from passed value: {0}")]
    InvalidDisplayHandle(crate::RwhHandleError),
    #[error("Missing mandatory instance extensions: {0:?}")]
    MissingExtensions(Vec<String>),
    #[error("Vulkan {0} is available but {min} is required", min = VkVersion::MINIMUM)]
    UnsupportedVersion(VkVersion),
    #[error("Unknown Vulkan Error {0}")]
    UnknownVulkan(vk::Result),
    #[error("Invalid app name was passed to Instance::new")]
    InvalidAppName,
}

impl From<vk::Result> for InstanceCreationError {
    fn from(value: vk::Result) -> Self {
        InstanceCreationError::UnknownVulkan(value)
    }
}

#[derive(Debug, Error)]
pub enum FetchPhysicalDeviceError {
    #[error("Error fetching physical devices, memory exhaustion")]
    MemoryExhaustion,
    #[error("Error fetching physical devices, Unknown vulkan: {0}")]
    UnknownVulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum DestroyRawSurfaceError {
    #[error("Surface extension is not loaded")]
    ExtensionNotLoaded,
}

impl Drop for Instance {
    fn drop(&mut self) {
        tracing::debug!("Dropping instance {:?}", self.handle.handle());
        if let Some((messenger, debug_utils)) = self.debug_messenger.take() {
            // SAFETY: the messenger was created from this instance and this is
            // its last use.
            unsafe { debug_utils.destroy_debug_utils_messenger(messenger, None) };
        }
        // SAFETY: we are in drop, every derived object holds an Arc to us and
        // is therefore already gone.
        unsafe { self.handle.destroy_instance(None) };
    }
}

unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    // SAFETY: Vulkan guarantees p_callback_data and its message are valid for
    // the duration of the callback.
    let message =
        unsafe { CStr::from_ptr((*p_callback_data).p_message) }.to_string_lossy();

    let kind = match message_type {
        vk::DebugUtilsMessageTypeFlagsEXT::GENERAL => "GENERAL",
        vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION => "VALIDATION",
        vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE => "PERFORMANCE",
        _ => "UNKNOWN",
    };

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE => {
            tracing::trace!(target: "vulkan", "[{kind}] {message}")
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => {
            tracing::info!(target: "vulkan", "[{kind}] {message}")
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            tracing::warn!(target: "vulkan", "[{kind}] {message}")
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            tracing::error!(target: "vulkan", "[{kind}] {message}")
        }
        _ => tracing::debug!(target: "vulkan", "[{kind}] {message}"),
    }

    vk::FALSE
}

impl Instance {
    /// Load Vulkan and create an instance at the highest available API
    /// version, which must be at least [`VkVersion::MINIMUM`].
    ///
    /// When `display_handle_source` is given the platform surface extensions
    /// are enabled. When `max_log_level` is given and the Khronos validation
    /// layer is installed, validation messages are routed to `tracing` under
    /// the `vulkan` target.
    ///
    /// # Safety
    /// This loads the Vulkan loader through `libloading`, which runs arbitrary
    /// initialization code from a shared library.
    pub unsafe fn new<T: HasDisplayHandle + ?Sized>(
        app_name: impl AsRef<str>,
        max_log_level: Option<VulkanLogLevel>,
        display_handle_source: Option<&T>,
    ) -> Result<Self, InstanceCreationError> {
        use InstanceCreationError as Error;

        let app_name_cstring =
            CString::from_str(app_name.as_ref()).map_err(|_| Error::InvalidAppName)?;

        // SAFETY: the caller accepts the risk of loading the library. Every
        // Vulkan object is destroyed before `entry` through Instance's Drop.
        let entry = unsafe { ash::Entry::load() }.map_err(Error::Loading)?;

        // SAFETY: entry is a live loader and this query has no other
        // preconditions.
        let api_version = unsafe { entry.try_enumerate_instance_version() }
            .unwrap_or(Some(vk::API_VERSION_1_0))
            .unwrap_or(vk::API_VERSION_1_0);
        let api_version = VkVersion::from_raw(api_version);
        if !api_version.at_least(1, 3) {
            return Err(Error::UnsupportedVersion(api_version));
        }

        let mut mandatory_exts: Vec<&CStr> = Vec::new();
        if let Some(source) = display_handle_source {
            let display = source
                .display_handle()
                .map_err(Error::InvalidDisplayHandle)?;
            let window_exts =
                ash_window::enumerate_required_extensions(display.as_raw())?;
            mandatory_exts.extend(
                window_exts
                    .iter()
                    // SAFETY: ash_window documents these as static,
                    // NUL-terminated extension names.
                    .map(|ptr| unsafe { CStr::from_ptr(*ptr) }),
            );
        }

        // SAFETY: entry is live; None queries the global extension list.
        let exts_avail = unsafe { entry.enumerate_instance_extension_properties(None) }?;
        // SAFETY: entry is live.
        let layers_avail =
            unsafe { entry.enumerate_instance_layer_properties() }.unwrap_or_default();

        let missing: Vec<String> = mandatory_exts
            .iter()
            .filter(|want| {
                !exts_avail
                    .iter()
                    .any(|have| have.extension_name_as_c_str() == Ok(**want))
            })
            .map(|ext| ext.to_string_lossy().into_owned())
            .collect();
        if !missing.is_empty() {
            return Err(Error::MissingExtensions(missing));
        }

        let debug_utils_name = ash::ext::debug_utils::NAME;
        let validation_layer = c"VK_LAYER_KHRONOS_validation";
        let debug_utils_available = exts_avail
            .iter()
            .any(|ext| ext.extension_name_as_c_str() == Ok(debug_utils_name));
        let validation_available = layers_avail
            .iter()
            .any(|layer| layer.layer_name_as_c_str() == Ok(validation_layer));

        let mut ext_ptrs: Vec<*const std::ffi::c_char> =
            mandatory_exts.iter().map(|ext| ext.as_ptr()).collect();
        let mut layer_ptrs: Vec<*const std::ffi::c_char> = Vec::new();

        let mut messenger_info = match max_log_level {
            Some(level) if debug_utils_available && validation_available => {
                ext_ptrs.push(debug_utils_name.as_ptr());
                layer_ptrs.push(validation_layer.as_ptr());
                Some(
                    vk::DebugUtilsMessengerCreateInfoEXT::default()
                        .message_severity(level.severity_flags())
                        .message_type(
                            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                        )
                        .pfn_user_callback(Some(vulkan_debug_callback)),
                )
            }
            Some(_) => {
                tracing::warn!(
                    "Validation requested but VK_LAYER_KHRONOS_validation or \
                     VK_EXT_debug_utils is unavailable"
                );
                None
            }
            None => None,
        };

        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name_cstring)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"xgpu")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(api_version.to_raw());

        let mut create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&ext_ptrs)
            .enabled_layer_names(&layer_ptrs);
        if let Some(ref mut info) = messenger_info {
            create_info = create_info.push_next(info);
        }

        // SAFETY: create_info and everything it points to is alive for the
        // call.
        let instance = unsafe { entry.create_instance(&create_info, None) }?;

        let debug_messenger = messenger_info.and_then(|mut info| {
            info.p_next = std::ptr::null();
            let debug_utils = ash::ext::debug_utils::Instance::new(&entry, &instance);
            // SAFETY: info is a valid messenger create info with no chain.
            match unsafe { debug_utils.create_debug_utils_messenger(&info, None) } {
                Ok(messenger) => Some((messenger, debug_utils)),
                Err(e) => {
                    tracing::error!(
                        "Failed to create debug messenger, continuing without \
                         validation output: {e}"
                    );
                    None
                }
            }
        });

        let surface_instance = display_handle_source
            .is_some()
            .then(|| ash::khr::surface::Instance::new(&entry, &instance));

        tracing::info!("Created Vulkan {api_version} instance");

        Ok(Instance {
            entry,
            handle: instance,
            debug_messenger,
            surface_instance,
            ver: api_version,
        })
    }

    /// Handles to every physical device. Only valid with this instance.
    pub fn fetch_raw_physical_devices(
        &self,
    ) -> Result<Vec<vk::PhysicalDevice>, FetchPhysicalDeviceError> {
        // SAFETY: the instance is live.
        match unsafe { self.handle.enumerate_physical_devices() } {
            Ok(v) => Ok(v),
            Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
            | Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY) => {
                Err(FetchPhysicalDeviceError::MemoryExhaustion)
            }
            Err(e) => Err(FetchPhysicalDeviceError::UnknownVulkan(e)),
        }
    }

    /// Gather properties, limits, features and extension support for one
    /// physical device.
    ///
    /// # Safety
    /// `physical_device` must be a valid handle derived from this instance.
    pub unsafe fn query_physical_device(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Result<PhysicalDeviceInfo, vk::Result> {
        // SAFETY: caller guarantees provenance.
        let exts = unsafe { self.enumerate_raw_device_extension_properties(physical_device) }?;
        let has_ext =
            |name: &CStr| exts.iter().any(|e| e.extension_name_as_c_str() == Ok(name));
        let rt_exts = has_ext(ash::khr::acceleration_structure::NAME)
            && has_ext(ash::khr::ray_tracing_pipeline::NAME)
            && has_ext(ash::khr::deferred_host_operations::NAME);

        let mut features12 = vk::PhysicalDeviceVulkan12Features::default();
        let mut as_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default();
        let mut rt_features = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default();
        {
            let mut features2 = vk::PhysicalDeviceFeatures2::default().push_next(&mut features12);
            if rt_exts {
                features2 = features2.push_next(&mut as_features).push_next(&mut rt_features);
            }
            // SAFETY: caller guarantees provenance; the chain only contains
            // structs for extensions the device advertises.
            unsafe {
                self.handle
                    .get_physical_device_features2(physical_device, &mut features2)
            };
        }

        let mut rt_props = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
        let mut as_props = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        let props = {
            let mut props2 = vk::PhysicalDeviceProperties2::default();
            if rt_exts {
                props2 = props2.push_next(&mut rt_props).push_next(&mut as_props);
            }
            // SAFETY: as above.
            unsafe {
                self.handle
                    .get_physical_device_properties2(physical_device, &mut props2)
            };
            props2.properties
        };

        let enabled = |b: vk::Bool32| b == vk::TRUE;
        let buffer_device_address = enabled(features12.buffer_device_address);
        let descriptor_indexing = enabled(features12.descriptor_indexing)
            && enabled(features12.descriptor_binding_partially_bound)
            && enabled(features12.descriptor_binding_variable_descriptor_count)
            && enabled(features12.runtime_descriptor_array);
        let ray_tracing = (rt_exts
            && buffer_device_address
            && enabled(as_features.acceleration_structure)
            && enabled(rt_features.ray_tracing_pipeline))
        .then_some(RayTracingInfo {
            shader_group_handle_size: rt_props.shader_group_handle_size,
            shader_group_handle_alignment: rt_props.shader_group_handle_alignment,
            shader_group_base_alignment: rt_props.shader_group_base_alignment,
            max_ray_recursion_depth: rt_props.max_ray_recursion_depth,
            min_scratch_offset_alignment: as_props
                .min_acceleration_structure_scratch_offset_alignment,
        });

        Ok(PhysicalDeviceInfo {
            handle: physical_device,
            name: props
                .device_name_as_c_str()
                .unwrap_or(c"unknown")
                .to_string_lossy()
                .into_owned(),
            device_type: props.device_type,
            vendor_id: props.vendor_id,
            device_id: props.device_id,
            api_version: VkVersion::from_raw(props.api_version),
            limits: props.limits,
            // SAFETY: caller guarantees provenance.
            memory_properties: unsafe {
                self.get_raw_physical_device_memory_properties(physical_device)
            },
            // SAFETY: caller guarantees provenance.
            queue_families: unsafe {
                self.get_raw_physical_device_queue_family_properties(physical_device)
            },
            swapchain: has_ext(ash::khr::swapchain::NAME),
            buffer_device_address,
            descriptor_indexing,
            ray_tracing,
        })
    }

    /// # Safety
    /// `physical_device` must be a valid handle derived from this instance.
    pub unsafe fn get_raw_physical_device_queue_family_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Vec<vk::QueueFamilyProperties> {
        // SAFETY: caller guarantees provenance.
        unsafe {
            self.handle
                .get_physical_device_queue_family_properties(physical_device)
        }
    }

    /// # Safety
    /// `physical_device` must be a valid handle derived from this instance.
    pub unsafe fn get_raw_physical_device_memory_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> vk::PhysicalDeviceMemoryProperties {
        // SAFETY: caller guarantees provenance.
        unsafe {
            self.handle
                .get_physical_device_memory_properties(physical_device)
        }
    }

    /// # Safety
    /// `physical_device` must be a valid handle derived from this instance.
    pub unsafe fn enumerate_raw_device_extension_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Vec<vk::ExtensionProperties>, vk::Result> {
        // SAFETY: caller guarantees provenance.
        unsafe {
            self.handle
                .enumerate_device_extension_properties(physical_device)
        }
    }

    /// # Safety
    /// `physical_device` must be derived from this instance, and
    /// `create_info` must be a valid device create info whose chain outlives
    /// the call.
    pub unsafe fn create_ash_device(
        &self,
        physical_device: vk::PhysicalDevice,
        create_info: &vk::DeviceCreateInfo<'_>,
    ) -> Result<ash::Device, vk::Result> {
        // SAFETY: caller guarantees provenance and create_info validity.
        unsafe { self.handle.create_device(physical_device, create_info, None) }
    }

    pub fn ash_instance(&self) -> &ash::Instance {
        &self.handle
    }

}

// Surface functionality
impl Instance {
    /// # Safety
    /// `source` must outlive the returned surface, and the surface must only
    /// be used with this instance.
    pub unsafe fn create_raw_surface<T: HasDisplayHandle + HasWindowHandle + ?Sized>(
        &self,
        source: &T,
    ) -> Result<vk::SurfaceKHR, CreateSurfaceError> {
        use CreateSurfaceError as Error;
        if self.surface_instance.is_none() {
            return Err(Error::MissingExtension);
        }
        let display = source
            .display_handle()
            .map_err(Error::InvalidDisplayHandle)?;
        let window = source.window_handle().map_err(Error::InvalidWindowHandle)?;
        // SAFETY: both handles come from a live source the caller keeps alive
        // for the surface's lifetime.
        unsafe {
            ash_window::create_surface(
                &self.entry,
                &self.handle,
                display.as_raw(),
                window.as_raw(),
                None,
            )
        }
        .map_err(Error::VulkanError)
    }

    /// # Safety
    /// `surf` must be derived from this instance, every object derived from
    /// it must already be destroyed, and no pending GPU work may reference it.
    pub unsafe fn destroy_raw_surface(
        &self,
        surf: vk::SurfaceKHR,
    ) -> Result<(), DestroyRawSurfaceError> {
        let surface_instance = self
            .surface_instance
            .as_ref()
            .ok_or(DestroyRawSurfaceError::ExtensionNotLoaded)?;
        // SAFETY: caller guarantees provenance and ordering.
        unsafe { surface_instance.destroy_surface(surf, None) };
        Ok(())
    }

    /// # Safety
    /// `physical_device` and `surface` must be derived from this instance.
    pub unsafe fn get_raw_physical_device_surface_support(
        &self,
        physical_device: vk::PhysicalDevice,
        queue_family_index: u32,
        surface: vk::SurfaceKHR,
    ) -> Result<bool, SurfaceSupportError> {
        let surface_instance = self
            .surface_instance
            .as_ref()
            .ok_or(SurfaceSupportError::ExtensionNotLoaded)?;
        // SAFETY: caller guarantees provenance.
        unsafe {
            surface_instance.get_physical_device_surface_support(
                physical_device,
                queue_family_index,
                surface,
            )
        }
        .map_err(SurfaceSupportError::Vulkan)
    }

    /// # Safety
    /// `physical_device` and `surface` must be derived from this instance.
    pub unsafe fn get_surface_capabilities(
        &self,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<vk::SurfaceCapabilitiesKHR, SurfaceQueryError> {
        let surface_instance = self
            .surface_instance
            .as_ref()
            .ok_or(SurfaceQueryError::ExtensionNotLoaded)?;
        // SAFETY: caller guarantees provenance.
        unsafe {
            surface_instance.get_physical_device_surface_capabilities(physical_device, surface)
        }
        .map_err(SurfaceQueryError::Vulkan)
    }

    /// # Safety
    /// `physical_device` and `surface` must be derived from this instance.
    pub unsafe fn get_surface_formats(
        &self,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<Vec<vk::SurfaceFormatKHR>, SurfaceQueryError> {
        let surface_instance = self
            .surface_instance
            .as_ref()
            .ok_or(SurfaceQueryError::ExtensionNotLoaded)?;
        // SAFETY: caller guarantees provenance.
        unsafe { surface_instance.get_physical_device_surface_formats(physical_device, surface) }
            .map_err(SurfaceQueryError::Vulkan)
    }

    /// # Safety
    /// `physical_device` and `surface` must be derived from this instance.
    pub unsafe fn get_surface_present_modes(
        &self,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<Vec<vk::PresentModeKHR>, SurfaceQueryError> {
        let surface_instance = self
            .surface_instance
            .as_ref()
            .ok_or(SurfaceQueryError::ExtensionNotLoaded)?;
        // SAFETY: caller guarantees provenance.
        unsafe {
            surface_instance.get_physical_device_surface_present_modes(physical_device, surface)
        }
        .map_err(SurfaceQueryError::Vulkan)
    }
}

// Device extension loader creation
impl Instance {
    pub(crate) fn create_swapchain_loader(&self, device: &ash::Device) -> ash::khr::swapchain::Device {
        ash::khr::swapchain::Device::new(&self.handle, device)
    }

    pub(crate) fn create_acceleration_structure_loader(
        &self,
        device: &ash::Device,
    ) -> ash::khr::acceleration_structure::Device {
        ash::khr::acceleration_structure::Device::new(&self.handle, device)
    }

    pub(crate) fn create_ray_tracing_pipeline_loader(
        &self,
        device: &ash::Device,
    ) -> ash::khr::ray_tracing_pipeline::Device {
        ash::khr::ray_tracing_pipeline::Device::new(&self.handle, device)
    }

    pub(crate) fn create_debug_utils_device_loader(
        &self,
        device: &ash::Device,
    ) -> Option<ash::ext::debug_utils::Device> {
        self.debug_messenger
            .is_some()
            .then(|| ash::ext::debug_utils::Device::new(&self.handle, device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vk_version_components() {
        let version = VkVersion::from_raw(vk::make_api_version(0, 1, 3, 275));

        assert_eq!(version.variant(), 0);
        assert_eq!(version.major(), 1);
        assert_eq!(version.minor(), 3);
        assert_eq!(version.patch(), 275);
        assert_eq!(version.to_string(), "1.3.275");
    }

    #[test]
    fn vk_version_at_least_ignores_patch() {
        let v12 = VkVersion::new(0, 1, 2, 999);
        let v13 = VkVersion::new(0, 1, 3, 0);
        let v20 = VkVersion::new(0, 2, 0, 0);

        assert!(!v12.at_least(1, 3));
        assert!(v13.at_least(1, 3));
        assert!(v20.at_least(1, 3));
        assert!(VkVersion::MINIMUM.at_least(1, 3));
    }

    #[test]
    fn log_levels_include_more_severe_messages() {
        use vk::DebugUtilsMessageSeverityFlagsEXT as S;

        assert!(VulkanLogLevel::Warning.severity_flags().contains(S::ERROR));
        assert!(!VulkanLogLevel::Warning.severity_flags().contains(S::INFO));
        assert_eq!(VulkanLogLevel::Error.severity_flags(), S::ERROR);
        assert!(VulkanLogLevel::Verbose < VulkanLogLevel::Error);
    }
}
