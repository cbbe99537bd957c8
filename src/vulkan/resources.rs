use ash::vk;

use crate::types::error::{Nv12Error, Result};

pub(super) fn find_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    flags: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..props.memory_type_count).find(|&i| {
        type_bits & (1 << i) != 0 && props.memory_types[i as usize].property_flags.contains(flags)
    })
}

/// Everything allocated for one scaling job, released together on drop.
pub(super) struct Allocations<'a> {
    device: &'a ash::Device,
    memory_props: vk::PhysicalDeviceMemoryProperties,
    images: Vec<(vk::Image, vk::ImageView, vk::DeviceMemory)>,
    buffers: Vec<(vk::Buffer, vk::DeviceMemory)>,
}

impl<'a> Allocations<'a> {
    pub(super) fn new(device: &'a ash::Device, memory_props: vk::PhysicalDeviceMemoryProperties) -> Self {
        Self {
            device,
            memory_props,
            images: Vec::new(),
            buffers: Vec::new(),
        }
    }

    fn allocate(
        &self,
        requirements: vk::MemoryRequirements,
        flags: vk::MemoryPropertyFlags,
    ) -> Result<vk::DeviceMemory> {
        let memory_type = find_memory_type(&self.memory_props, requirements.memory_type_bits, flags)
            .ok_or_else(|| Nv12Error::Init(format!("no memory type with {flags:?}")))?;
        let info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type);
        Ok(unsafe { self.device.allocate_memory(&info, None)? })
    }

    /// Device local 2D image usable as a storage image and a transfer
    /// source or destination.
    pub(super) fn storage_image(
        &mut self,
        width: u32,
        height: u32,
        format: vk::Format,
    ) -> Result<vk::Image> {
        let info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(
                vk::ImageUsageFlags::STORAGE
                    | vk::ImageUsageFlags::TRANSFER_DST
                    | vk::ImageUsageFlags::TRANSFER_SRC,
            )
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        unsafe {
            let image = self.device.create_image(&info, None)?;
            let memory = match self.allocate(
                self.device.get_image_memory_requirements(image),
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            ) {
                Ok(memory) => memory,
                Err(e) => {
                    self.device.destroy_image(image, None);
                    return Err(e);
                }
            };
            // Tracked before binding so a failure below still frees both.
            self.images.push((image, vk::ImageView::null(), memory));
            self.device.bind_image_memory(image, memory, 0)?;

            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(format)
                .subresource_range(color_range());
            let view = self.device.create_image_view(&view_info, None)?;
            if let Some(entry) = self.images.last_mut() {
                entry.1 = view;
            }
            Ok(image)
        }
    }

    pub(super) fn view_of(&self, image: vk::Image) -> vk::ImageView {
        self.images
            .iter()
            .find(|(i, _, _)| *i == image)
            .map_or(vk::ImageView::null(), |(_, view, _)| *view)
    }

    /// Host visible, coherent buffer of `size` bytes.
    pub(super) fn staging_buffer(
        &mut self,
        size: usize,
        usage: vk::BufferUsageFlags,
    ) -> Result<(vk::Buffer, vk::DeviceMemory)> {
        let info = vk::BufferCreateInfo::default()
            .size(size as vk::DeviceSize)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        unsafe {
            let buffer = self.device.create_buffer(&info, None)?;
            let memory = match self.allocate(
                self.device.get_buffer_memory_requirements(buffer),
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            ) {
                Ok(memory) => memory,
                Err(e) => {
                    self.device.destroy_buffer(buffer, None);
                    return Err(e);
                }
            };
            self.buffers.push((buffer, memory));
            self.device.bind_buffer_memory(buffer, memory, 0)?;
            Ok((buffer, memory))
        }
    }

    pub(super) fn write(&self, memory: vk::DeviceMemory, data: &[u8]) -> Result<()> {
        unsafe {
            let ptr = self
                .device
                .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())?;
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr as *mut u8, data.len());
            self.device.unmap_memory(memory);
        }
        Ok(())
    }

    pub(super) fn read(&self, memory: vk::DeviceMemory, len: usize) -> Result<Vec<u8>> {
        unsafe {
            let ptr = self
                .device
                .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())?;
            let data = std::slice::from_raw_parts(ptr as *const u8, len).to_vec();
            self.device.unmap_memory(memory);
            Ok(data)
        }
    }
}

impl Drop for Allocations<'_> {
    fn drop(&mut self) {
        unsafe {
            for (image, view, memory) in self.images.drain(..) {
                if view != vk::ImageView::null() {
                    self.device.destroy_image_view(view, None);
                }
                self.device.destroy_image(image, None);
                self.device.free_memory(memory, None);
            }
            for (buffer, memory) in self.buffers.drain(..) {
                self.device.destroy_buffer(buffer, None);
                self.device.free_memory(memory, None);
            }
        }
    }
}

pub(super) fn color_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange::default()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .level_count(1)
        .layer_count(1)
}

pub(super) fn color_layers() -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers::default()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .layer_count(1)
}

pub(super) fn layout_barrier(
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    src_access: vk::AccessFlags,
    dst_access: vk::AccessFlags,
) -> vk::ImageMemoryBarrier<'static> {
    vk::ImageMemoryBarrier::default()
        .image(image)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .subresource_range(color_range())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(flags: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: flags.len() as u32,
            ..Default::default()
        };
        for (i, f) in flags.iter().enumerate() {
            props.memory_types[i].property_flags = *f;
        }
        props
    }

    #[test]
    fn memory_type_must_match_bits_and_flags() {
        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        let props = props(&[vk::MemoryPropertyFlags::DEVICE_LOCAL, host]);

        assert_eq!(
            find_memory_type(&props, 0b11, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            Some(0)
        );
        assert_eq!(find_memory_type(&props, 0b11, host), Some(1));
        assert_eq!(find_memory_type(&props, 0b01, host), None);
        assert_eq!(
            find_memory_type(&props, 0b10, vk::MemoryPropertyFlags::HOST_VISIBLE),
            Some(1)
        );
    }
}
