//! NV12 scaling with two Vulkan compute shaders, one per plane.

mod resources;

use std::{fs::File, path::Path};

use ash::vk;

use crate::types::{
    error::{Nv12Error, Result},
    frame::Nv12Frame,
};
use resources::{color_layers, layout_barrier, Allocations};

/// Local size of `shaders/scale_y.comp` and `shaders/scale_uv.comp`.
const WORKGROUP_SIZE: u32 = 16;

const Y_FORMAT: vk::Format = vk::Format::R8_UNORM;
const UV_FORMAT: vk::Format = vk::Format::R8G8_UNORM;

fn dispatch_groups(extent: u32) -> u32 {
    extent.div_ceil(WORKGROUP_SIZE)
}

/// `{in_w, in_h, out_w, out_h}`, the shaders' `ivec4` push constant.
fn push_constants(input: (u32, u32), output: (u32, u32)) -> [i32; 4] {
    [
        input.0 as i32,
        input.1 as i32,
        output.0 as i32,
        output.1 as i32,
    ]
}

fn check_output_size(width: u32, height: u32) -> Result<()> {
    if width < 2 || height < 2 || width % 2 != 0 || height % 2 != 0 {
        return Err(Nv12Error::Validation(format!(
            "output size {width}x{height} must be even and at least 2x2"
        )));
    }
    Ok(())
}

fn read_spirv(path: &Path) -> Result<Vec<u32>> {
    let mut file = File::open(path).map_err(|e| {
        Nv12Error::Init(format!("Failed to open shader {}: {e}", path.display()))
    })?;
    ash::util::read_spv(&mut file).map_err(|e| {
        Nv12Error::Init(format!("{} is not valid SPIR-V: {e}", path.display()))
    })
}

/// Instance, device and compute queue.
struct Gpu {
    _entry: ash::Entry,
    instance: ash::Instance,
    device: ash::Device,
    queue: vk::Queue,
    queue_family: u32,
    memory_props: vk::PhysicalDeviceMemoryProperties,
}

impl Gpu {
    fn new() -> Result<Self> {
        let entry = unsafe { ash::Entry::load()? };

        let app_info = vk::ApplicationInfo::default()
            .application_name(c"nv12_scaler")
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(c"none")
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_1);
        let instance_info = vk::InstanceCreateInfo::default().application_info(&app_info);
        let instance = unsafe { entry.create_instance(&instance_info, None)? };

        match Self::open_device(&instance) {
            Ok((device, queue_family, memory_props)) => {
                let queue = unsafe { device.get_device_queue(queue_family, 0) };
                Ok(Self {
                    _entry: entry,
                    instance,
                    device,
                    queue,
                    queue_family,
                    memory_props,
                })
            }
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                Err(e)
            }
        }
    }

    fn open_device(
        instance: &ash::Instance,
    ) -> Result<(ash::Device, u32, vk::PhysicalDeviceMemoryProperties)> {
        let physical_device = unsafe { instance.enumerate_physical_devices()? }
            .into_iter()
            .next()
            .ok_or_else(|| Nv12Error::Init("no GPU with Vulkan support".into()))?;

        let props = unsafe { instance.get_physical_device_properties(physical_device) };
        let name = props
            .device_name_as_c_str()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        log::info!("Using Vulkan device {name}");

        for format in [Y_FORMAT, UV_FORMAT] {
            let features = unsafe {
                instance.get_physical_device_format_properties(physical_device, format)
            };
            if !features
                .optimal_tiling_features
                .contains(vk::FormatFeatureFlags::STORAGE_IMAGE)
            {
                return Err(Nv12Error::Init(format!(
                    "{format:?} cannot be used as a storage image on {name}"
                )));
            }
        }

        let queue_family = unsafe {
            instance.get_physical_device_queue_family_properties(physical_device)
        }
        .iter()
        .position(|family| family.queue_flags.contains(vk::QueueFlags::COMPUTE))
        .ok_or_else(|| Nv12Error::Init("no compute queue".into()))?
            as u32;

        let priorities = [1.0];
        let queue_infos = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family)
            .queue_priorities(&priorities)];
        let device_info = vk::DeviceCreateInfo::default().queue_create_infos(&queue_infos);
        let device = unsafe { instance.create_device(physical_device, &device_info, None)? };

        let memory_props =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };
        Ok((device, queue_family, memory_props))
    }
}

impl Drop for Gpu {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

#[derive(Default)]
struct ComputePipeline {
    shader_module: vk::ShaderModule,
    pipeline: vk::Pipeline,
}

/// One plane's worth of a scaling job.
struct PlaneJob {
    input: vk::Image,
    output: vk::Image,
    staging_in: vk::Buffer,
    staging_out: vk::Buffer,
    in_extent: (u32, u32),
    out_extent: (u32, u32),
    descriptor_set: vk::DescriptorSet,
    pipeline: vk::Pipeline,
}

pub struct VulkanScaler {
    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    ds_layout: vk::DescriptorSetLayout,
    pipeline_layout: vk::PipelineLayout,
    descriptor_pool: vk::DescriptorPool,
    scale_y: ComputePipeline,
    scale_uv: ComputePipeline,
    // Declared last: destroyed after every handle above.
    gpu: Gpu,
}

impl VulkanScaler {
    /// Sets up a compute queue on the first physical device and builds the
    /// luma and chroma pipelines from the given SPIR-V files.
    pub fn new<P: AsRef<Path>>(y_shader: P, uv_shader: P) -> Result<Self> {
        let y_code = read_spirv(y_shader.as_ref())?;
        let uv_code = read_spirv(uv_shader.as_ref())?;

        // Handles start out null so `Drop` can tear down a partial `init`.
        let mut scaler = Self {
            command_pool: vk::CommandPool::null(),
            command_buffer: vk::CommandBuffer::null(),
            ds_layout: vk::DescriptorSetLayout::null(),
            pipeline_layout: vk::PipelineLayout::null(),
            descriptor_pool: vk::DescriptorPool::null(),
            scale_y: ComputePipeline::default(),
            scale_uv: ComputePipeline::default(),
            gpu: Gpu::new()?,
        };
        scaler.init(&y_code, &uv_code)?;
        Ok(scaler)
    }

    fn init(&mut self, y_code: &[u32], uv_code: &[u32]) -> Result<()> {
        let device = &self.gpu.device;
        unsafe {
            let pool_info = vk::CommandPoolCreateInfo::default()
                .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
                .queue_family_index(self.gpu.queue_family);
            self.command_pool = device.create_command_pool(&pool_info, None)?;

            let alloc_info = vk::CommandBufferAllocateInfo::default()
                .command_pool(self.command_pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            self.command_buffer = device
                .allocate_command_buffers(&alloc_info)?
                .into_iter()
                .next()
                .ok_or_else(|| Nv12Error::Init("no command buffer allocated".into()))?;

            // binding 0: source plane, binding 1: scaled plane
            let bindings = [0, 1].map(|binding| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(binding)
                    .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::COMPUTE)
            });
            let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
            self.ds_layout = device.create_descriptor_set_layout(&layout_info, None)?;

            let set_layouts = [self.ds_layout];
            let push_ranges = [vk::PushConstantRange::default()
                .stage_flags(vk::ShaderStageFlags::COMPUTE)
                .offset(0)
                .size(std::mem::size_of::<[i32; 4]>() as u32)];
            let pipeline_layout_info = vk::PipelineLayoutCreateInfo::default()
                .set_layouts(&set_layouts)
                .push_constant_ranges(&push_ranges);
            self.pipeline_layout = device.create_pipeline_layout(&pipeline_layout_info, None)?;

            let pool_sizes = [vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_IMAGE,
                descriptor_count: 4,
            }];
            let descriptor_pool_info = vk::DescriptorPoolCreateInfo::default()
                .max_sets(2)
                .pool_sizes(&pool_sizes);
            self.descriptor_pool = device.create_descriptor_pool(&descriptor_pool_info, None)?;
        }

        self.scale_y = self.create_pipeline(y_code)?;
        self.scale_uv = self.create_pipeline(uv_code)?;
        log::debug!("Vulkan compute pipelines ready");
        Ok(())
    }

    fn create_pipeline(&self, code: &[u32]) -> Result<ComputePipeline> {
        let device = &self.gpu.device;
        unsafe {
            let shader_info = vk::ShaderModuleCreateInfo::default().code(code);
            let shader_module = device.create_shader_module(&shader_info, None)?;

            let stage = vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::COMPUTE)
                .module(shader_module)
                .name(c"main");
            let pipeline_info = vk::ComputePipelineCreateInfo::default()
                .stage(stage)
                .layout(self.pipeline_layout);

            let pipeline = match device.create_compute_pipelines(
                vk::PipelineCache::null(),
                &[pipeline_info],
                None,
            ) {
                Ok(pipelines) => pipelines.into_iter().next().unwrap_or_default(),
                Err((_, e)) => {
                    device.destroy_shader_module(shader_module, None);
                    return Err(e.into());
                }
            };

            Ok(ComputePipeline {
                shader_module,
                pipeline,
            })
        }
    }

    /// Scales `frame` to `out_width` x `out_height` on the GPU.
    pub fn scale(&self, frame: &Nv12Frame, out_width: u32, out_height: u32) -> Result<Nv12Frame> {
        check_output_size(out_width, out_height)?;
        let (in_w, in_h) = (frame.width(), frame.height());
        log::info!("Scaling {in_w}x{in_h} -> {out_width}x{out_height} on the GPU");

        let device = &self.gpu.device;
        let mut alloc = Allocations::new(device, self.gpu.memory_props);

        let y_len = out_width as usize * out_height as usize;
        let uv_len = y_len / 2;

        let in_y = alloc.storage_image(in_w, in_h, Y_FORMAT)?;
        let in_uv = alloc.storage_image(in_w / 2, in_h / 2, UV_FORMAT)?;
        let out_y = alloc.storage_image(out_width, out_height, Y_FORMAT)?;
        let out_uv = alloc.storage_image(out_width / 2, out_height / 2, UV_FORMAT)?;

        let (stg_in_y, stg_in_y_mem) =
            alloc.staging_buffer(frame.y_plane().len(), vk::BufferUsageFlags::TRANSFER_SRC)?;
        let (stg_in_uv, stg_in_uv_mem) =
            alloc.staging_buffer(frame.uv_plane().len(), vk::BufferUsageFlags::TRANSFER_SRC)?;
        let (stg_out_y, stg_out_y_mem) =
            alloc.staging_buffer(y_len, vk::BufferUsageFlags::TRANSFER_DST)?;
        let (stg_out_uv, stg_out_uv_mem) =
            alloc.staging_buffer(uv_len, vk::BufferUsageFlags::TRANSFER_DST)?;

        alloc.write(stg_in_y_mem, frame.y_plane())?;
        alloc.write(stg_in_uv_mem, frame.uv_plane())?;

        let sets = unsafe {
            device.reset_descriptor_pool(
                self.descriptor_pool,
                vk::DescriptorPoolResetFlags::empty(),
            )?;
            let layouts = [self.ds_layout, self.ds_layout];
            let alloc_info = vk::DescriptorSetAllocateInfo::default()
                .descriptor_pool(self.descriptor_pool)
                .set_layouts(&layouts);
            device.allocate_descriptor_sets(&alloc_info)?
        };
        let [set_y, set_uv] = sets[..] else {
            return Err(Nv12Error::Init("expected two descriptor sets".into()));
        };

        let planes = [
            PlaneJob {
                input: in_y,
                output: out_y,
                staging_in: stg_in_y,
                staging_out: stg_out_y,
                in_extent: (in_w, in_h),
                out_extent: (out_width, out_height),
                descriptor_set: set_y,
                pipeline: self.scale_y.pipeline,
            },
            PlaneJob {
                input: in_uv,
                output: out_uv,
                staging_in: stg_in_uv,
                staging_out: stg_out_uv,
                in_extent: (in_w / 2, in_h / 2),
                out_extent: (out_width / 2, out_height / 2),
                descriptor_set: set_uv,
                pipeline: self.scale_uv.pipeline,
            },
        ];

        for plane in &planes {
            let input_info = [vk::DescriptorImageInfo::default()
                .image_view(alloc.view_of(plane.input))
                .image_layout(vk::ImageLayout::GENERAL)];
            let output_info = [vk::DescriptorImageInfo::default()
                .image_view(alloc.view_of(plane.output))
                .image_layout(vk::ImageLayout::GENERAL)];
            let writes = [
                vk::WriteDescriptorSet::default()
                    .dst_set(plane.descriptor_set)
                    .dst_binding(0)
                    .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                    .image_info(&input_info),
                vk::WriteDescriptorSet::default()
                    .dst_set(plane.descriptor_set)
                    .dst_binding(1)
                    .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                    .image_info(&output_info),
            ];
            unsafe { device.update_descriptor_sets(&writes, &[]) };
        }

        self.record(&planes)?;
        self.submit_and_wait()?;

        let y = alloc.read(stg_out_y_mem, y_len)?;
        let uv = alloc.read(stg_out_uv_mem, uv_len)?;
        Nv12Frame::from_planes(out_width, out_height, y, uv)
    }

    fn record(&self, planes: &[PlaneJob]) -> Result<()> {
        let device = &self.gpu.device;
        let cb = self.command_buffer;

        unsafe {
            let begin_info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device.begin_command_buffer(cb, &begin_info)?;

            let entry_barriers: Vec<_> = planes
                .iter()
                .flat_map(|p| {
                    [
                        layout_barrier(
                            p.input,
                            vk::ImageLayout::UNDEFINED,
                            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                            vk::AccessFlags::NONE,
                            vk::AccessFlags::TRANSFER_WRITE,
                        ),
                        layout_barrier(
                            p.output,
                            vk::ImageLayout::UNDEFINED,
                            vk::ImageLayout::GENERAL,
                            vk::AccessFlags::NONE,
                            vk::AccessFlags::SHADER_WRITE,
                        ),
                    ]
                })
                .collect();
            device.cmd_pipeline_barrier(
                cb,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER | vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &entry_barriers,
            );

            for p in planes {
                let region = vk::BufferImageCopy::default()
                    .image_subresource(color_layers())
                    .image_extent(extent(p.in_extent));
                device.cmd_copy_buffer_to_image(
                    cb,
                    p.staging_in,
                    p.input,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
            }

            let upload_barriers: Vec<_> = planes
                .iter()
                .map(|p| {
                    layout_barrier(
                        p.input,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        vk::ImageLayout::GENERAL,
                        vk::AccessFlags::TRANSFER_WRITE,
                        vk::AccessFlags::SHADER_READ,
                    )
                })
                .collect();
            device.cmd_pipeline_barrier(
                cb,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &upload_barriers,
            );

            for p in planes {
                device.cmd_bind_pipeline(cb, vk::PipelineBindPoint::COMPUTE, p.pipeline);
                device.cmd_bind_descriptor_sets(
                    cb,
                    vk::PipelineBindPoint::COMPUTE,
                    self.pipeline_layout,
                    0,
                    &[p.descriptor_set],
                    &[],
                );
                let push = push_constants(p.in_extent, p.out_extent);
                device.cmd_push_constants(
                    cb,
                    self.pipeline_layout,
                    vk::ShaderStageFlags::COMPUTE,
                    0,
                    bytemuck::cast_slice(&push),
                );
                device.cmd_dispatch(
                    cb,
                    dispatch_groups(p.out_extent.0),
                    dispatch_groups(p.out_extent.1),
                    1,
                );
            }

            let readback_barriers: Vec<_> = planes
                .iter()
                .map(|p| {
                    layout_barrier(
                        p.output,
                        vk::ImageLayout::GENERAL,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        vk::AccessFlags::SHADER_WRITE,
                        vk::AccessFlags::TRANSFER_READ,
                    )
                })
                .collect();
            device.cmd_pipeline_barrier(
                cb,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &readback_barriers,
            );

            for p in planes {
                let region = vk::BufferImageCopy::default()
                    .image_subresource(color_layers())
                    .image_extent(extent(p.out_extent));
                device.cmd_copy_image_to_buffer(
                    cb,
                    p.output,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    p.staging_out,
                    &[region],
                );
            }

            let host_barriers: Vec<_> = planes
                .iter()
                .map(|p| {
                    vk::BufferMemoryBarrier::default()
                        .buffer(p.staging_out)
                        .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                        .dst_access_mask(vk::AccessFlags::HOST_READ)
                        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .offset(0)
                        .size(vk::WHOLE_SIZE)
                })
                .collect();
            device.cmd_pipeline_barrier(
                cb,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::HOST,
                vk::DependencyFlags::empty(),
                &[],
                &host_barriers,
                &[],
            );

            device.end_command_buffer(cb)?;
        }
        Ok(())
    }

    fn submit_and_wait(&self) -> Result<()> {
        let device = &self.gpu.device;
        let command_buffers = [self.command_buffer];
        let submit = vk::SubmitInfo::default().command_buffers(&command_buffers);
        unsafe {
            device.queue_submit(self.gpu.queue, &[submit], vk::Fence::null())?;
            device.queue_wait_idle(self.gpu.queue)?;
            device.reset_command_buffer(
                self.command_buffer,
                vk::CommandBufferResetFlags::empty(),
            )?;
        }
        log::trace!("Compute submission finished");
        Ok(())
    }
}

impl Drop for VulkanScaler {
    fn drop(&mut self) {
        let device = &self.gpu.device;
        unsafe {
            let _ = device.device_wait_idle();
            for pipeline in [&self.scale_y, &self.scale_uv] {
                device.destroy_pipeline(pipeline.pipeline, None);
                device.destroy_shader_module(pipeline.shader_module, None);
            }
            device.destroy_descriptor_pool(self.descriptor_pool, None);
            device.destroy_pipeline_layout(self.pipeline_layout, None);
            device.destroy_descriptor_set_layout(self.ds_layout, None);
            // Frees the command buffer with it.
            device.destroy_command_pool(self.command_pool, None);
        }
    }
}

fn extent((width, height): (u32, u32)) -> vk::Extent3D {
    vk::Extent3D {
        width,
        height,
        depth: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_covers_partial_workgroups() {
        assert_eq!(dispatch_groups(320), 20);
        assert_eq!(dispatch_groups(321), 21);
        assert_eq!(dispatch_groups(8), 1);
        assert_eq!(dispatch_groups(160 / 2), 5);
    }

    #[test]
    fn push_constants_keep_the_shader_order() {
        assert_eq!(push_constants((640, 480), (320, 240)), [640, 480, 320, 240]);
        let bytes: &[u8] = bytemuck::cast_slice(&[640i32, 480, 320, 240]);
        assert_eq!(bytes.len(), 16);
    }

    #[test]
    fn odd_output_sizes_are_rejected() {
        assert!(check_output_size(320, 240).is_ok());
        assert!(check_output_size(321, 240).is_err());
        assert!(check_output_size(0, 0).is_err());
    }

    #[test]
    fn missing_shader_fails_before_touching_the_gpu() {
        let res = VulkanScaler::new("/nonexistent/scale_y.spv", "/nonexistent/scale_uv.spv");
        assert!(matches!(res, Err(Nv12Error::Init(ref msg)) if msg.contains("scale_y.spv")));
    }
}
