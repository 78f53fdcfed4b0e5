//! One-shot compute pipelines with fenced blocking dispatch.
//!
//! Every operator owns a [`DispatchUnit`] by value. The unit builds its
//! shader module, bind-group layout and pipeline exactly once, then rebinds
//! buffers and re-sends push constants on each dispatch. Submission blocks
//! until the queue drains, so a returned tensor is always safe to read.

use std::borrow::Cow;

use crate::buffer::DeviceBuffer;
use crate::device::Device;
use crate::error::{VoltError, VoltResult};

/// Local workgroup width for 1-D elementwise kernels.
pub const LOCAL_SIZE_1D: u32 = 256;
/// Local workgroup width per axis for 2-D tiled kernels.
pub const LOCAL_SIZE_2D: u32 = 16;

/// `ceil(total / local)`, clamped to `[1, max]` groups.
pub fn group_count(total: u32, local: u32, max: u32) -> u32 {
    ((total + local - 1) / local).clamp(1, max)
}

/// A lazily built compute pipeline plus its dispatch geometry.
pub struct DispatchUnit {
    label: &'static str,
    pipeline: Option<wgpu::ComputePipeline>,
    bind_layout: Option<wgpu::BindGroupLayout>,
    groups: [u32; 3],
    builds: u32,
}

impl DispatchUnit {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            pipeline: None,
            bind_layout: None,
            groups: [1, 1, 1],
            builds: 0,
        }
    }

    pub fn is_built(&self) -> bool {
        self.pipeline.is_some()
    }

    /// How many times the pipeline has been built. Stays at 1 across
    /// repeated dispatches of a healthy operator.
    pub fn build_count(&self) -> u32 {
        self.builds
    }

    pub fn set_groups(&mut self, groups: [u32; 3]) {
        self.groups = groups;
    }

    pub fn groups(&self) -> [u32; 3] {
        self.groups
    }

    /// Build shader module, layout and pipeline. The layout exposes
    /// `binding_count` storage buffers at bindings `0..n` and a compute
    /// push-constant range of `push_size` bytes.
    pub fn build(
        &mut self,
        device: &Device,
        source: &'static str,
        entry: &'static str,
        binding_count: u32,
        push_size: u32,
    ) {
        let module = device
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(self.label),
                source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(source)),
            });

        let entries: Vec<wgpu::BindGroupLayoutEntry> = (0..binding_count)
            .map(|binding| wgpu::BindGroupLayoutEntry {
                binding,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Storage { read_only: false },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            })
            .collect();

        let bind_layout = device
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(self.label),
                entries: &entries,
            });

        let pipeline_layout = device
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(self.label),
                bind_group_layouts: &[&bind_layout],
                push_constant_ranges: &[wgpu::PushConstantRange {
                    stages: wgpu::ShaderStages::COMPUTE,
                    range: 0..push_size,
                }],
            });

        let pipeline = device
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(self.label),
                layout: Some(&pipeline_layout),
                module: &module,
                entry_point: entry,
                compilation_options: Default::default(),
                cache: None,
            });

        self.pipeline = Some(pipeline);
        self.bind_layout = Some(bind_layout);
        self.builds += 1;
    }

    /// Bind `buffers` in order, send `push` and run one fenced dispatch.
    pub fn dispatch(
        &self,
        device: &Device,
        buffers: &[&DeviceBuffer],
        push: &[u8],
    ) -> VoltResult<()> {
        let (pipeline, layout) = match (&self.pipeline, &self.bind_layout) {
            (Some(p), Some(l)) => (p, l),
            _ => return Err(VoltError::NotDispatched(self.label)),
        };

        let entries: Vec<wgpu::BindGroupEntry> = buffers
            .iter()
            .enumerate()
            .map(|(i, buf)| wgpu::BindGroupEntry {
                binding: i as u32,
                resource: buf.raw().as_entire_binding(),
            })
            .collect();

        let bind_group = device.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(self.label),
            layout,
            entries: &entries,
        });

        let mut encoder = device
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(self.label),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(self.label),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.set_push_constants(0, push);
            pass.dispatch_workgroups(self.groups[0], self.groups[1], self.groups[2]);
        }
        device.queue.submit(Some(encoder.finish()));
        device.device.poll(wgpu::Maintain::Wait);
        Ok(())
    }
}
