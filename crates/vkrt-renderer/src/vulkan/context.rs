//! Physical-device inspection: required extensions, ray-tracing limits and
//! the submission queue family.

use std::ffi::CStr;

use ash::khr::{acceleration_structure, ray_tracing_pipeline};
use ash::vk;

use crate::device::RtCapabilities;
use crate::error::{RtError, RtResult};

/// Device extensions the ray tracer cannot run without.
pub const REQUIRED_DEVICE_EXTENSIONS: [&CStr; 7] = [
    acceleration_structure::NAME,
    ray_tracing_pipeline::NAME,
    vk::KHR_BUFFER_DEVICE_ADDRESS_NAME,
    vk::KHR_DEFERRED_HOST_OPERATIONS_NAME,
    vk::EXT_DESCRIPTOR_INDEXING_NAME,
    vk::KHR_SPIRV_1_4_NAME,
    vk::KHR_SHADER_FLOAT_CONTROLS_NAME,
];

/// Required extensions absent from `available`.
pub fn missing_extensions(available: &[&CStr]) -> Vec<&'static CStr> {
    REQUIRED_DEVICE_EXTENSIONS
        .iter()
        .copied()
        .filter(|required| !available.contains(required))
        .collect()
}

/// Family for one-shot submissions and host command streams.
///
/// Acceleration-structure builds and ray dispatch both need compute, so
/// this is the first non-empty family with GRAPHICS and COMPUTE. Returns
/// `None` if the device has no such family.
pub fn graphics_queue_family(families: &[vk::QueueFamilyProperties]) -> Option<u32> {
    let required = vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE;
    families
        .iter()
        .position(|family| family.queue_count > 0 && family.queue_flags.contains(required))
        .map(|index| index as u32)
}

/// Check extensions and features, then read the ray-tracing limits.
///
/// # Safety
/// `physical_device` must belong to `instance`.
pub unsafe fn query_capabilities(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> RtResult<RtCapabilities> {
    let extensions = instance
        .enumerate_device_extension_properties(physical_device)
        .map_err(|result| RtError::vulkan("enumerate device extensions", result))?;
    let available: Vec<&CStr> = extensions
        .iter()
        .filter_map(|extension| extension.extension_name_as_c_str().ok())
        .collect();

    let missing = missing_extensions(&available);
    if !missing.is_empty() {
        let names: Vec<String> = missing.iter().map(|name| name.to_string_lossy().into_owned()).collect();
        return Err(RtError::UnsupportedDevice(format!("missing {}", names.join(", "))));
    }

    let mut accel_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default();
    let mut rt_features = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default();
    let mut address_features = vk::PhysicalDeviceBufferDeviceAddressFeatures::default();
    let mut indexing_features = vk::PhysicalDeviceDescriptorIndexingFeatures::default();
    let mut features2 = vk::PhysicalDeviceFeatures2::default()
        .push_next(&mut accel_features)
        .push_next(&mut rt_features)
        .push_next(&mut address_features)
        .push_next(&mut indexing_features);
    instance.get_physical_device_features2(physical_device, &mut features2);

    let feature_checks = [
        ("accelerationStructure", accel_features.acceleration_structure),
        ("rayTracingPipeline", rt_features.ray_tracing_pipeline),
        ("bufferDeviceAddress", address_features.buffer_device_address),
        ("runtimeDescriptorArray", indexing_features.runtime_descriptor_array),
        ("descriptorBindingPartiallyBound", indexing_features.descriptor_binding_partially_bound),
        (
            "descriptorBindingVariableDescriptorCount",
            indexing_features.descriptor_binding_variable_descriptor_count,
        ),
    ];
    if let Some((name, _)) = feature_checks.iter().find(|(_, enabled)| *enabled != vk::TRUE) {
        return Err(RtError::UnsupportedDevice(format!("feature {} not available", name)));
    }

    let mut rt_props = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
    let mut accel_props = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
    let mut props2 = vk::PhysicalDeviceProperties2::default()
        .push_next(&mut rt_props)
        .push_next(&mut accel_props);
    instance.get_physical_device_properties2(physical_device, &mut props2);

    Ok(RtCapabilities {
        shader_group_handle_size: rt_props.shader_group_handle_size,
        shader_group_handle_alignment: rt_props.shader_group_handle_alignment,
        shader_group_base_alignment: rt_props.shader_group_base_alignment,
        max_ray_recursion_depth: rt_props.max_ray_recursion_depth,
        max_instance_count: accel_props.max_instance_count,
        min_scratch_offset_alignment: accel_props.min_acceleration_structure_scratch_offset_alignment,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    const G: vk::QueueFlags = vk::QueueFlags::GRAPHICS;
    const C: vk::QueueFlags = vk::QueueFlags::COMPUTE;
    const T: vk::QueueFlags = vk::QueueFlags::TRANSFER;

    // ============================================================
    // graphics_queue_family
    // ============================================================

    #[rstest]
    #[case::single_universal(vec![G | C | T], Some(0))]
    #[case::dedicated_queues_ignored(vec![G | C | T, C | T, T], Some(0))]
    #[case::graphics_not_first(vec![T, C, G | C | T], Some(2))]
    #[case::graphics_without_compute(vec![G | T, G | C], Some(1))]
    #[case::compute_only(vec![C | T], None)]
    #[case::no_families(vec![], None)]
    fn test_graphics_queue_family(#[case] flags: Vec<vk::QueueFlags>, #[case] expected: Option<u32>) {
        let families: Vec<_> = flags.into_iter().map(family).collect();
        assert_eq!(graphics_queue_family(&families), expected);
    }

    #[test]
    fn test_graphics_queue_family_skips_empty_families() {
        let mut empty = family(G | C | T);
        empty.queue_count = 0;
        assert_eq!(graphics_queue_family(&[empty, family(G | C | T)]), Some(1));
    }

    // ============================================================
    // missing_extensions
    // ============================================================

    #[test]
    fn test_all_extensions_present() {
        assert!(missing_extensions(&REQUIRED_DEVICE_EXTENSIONS).is_empty());
    }

    #[test]
    fn test_missing_extensions_reported() {
        let available = [acceleration_structure::NAME, vk::KHR_SPIRV_1_4_NAME];
        let missing = missing_extensions(&available);
        assert_eq!(missing.len(), 5);
        assert!(missing.contains(&ray_tracing_pipeline::NAME));
        assert!(!missing.contains(&vk::KHR_SPIRV_1_4_NAME));
    }
}
