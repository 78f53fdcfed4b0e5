//! Device abstraction for GPU computation.
//!
//! [`Device`] owns the wgpu instance, adapter, logical device and queue,
//! plus the monotonic tensor-id counter. There is no process-global state:
//! everything that touches the GPU takes a `&Device` explicitly, so tests
//! can create and drop contexts independently.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use wgpu::{Adapter, Device as WgpuDevice, Instance, Queue};

use crate::error::{VoltError, VoltResult};

/// Handle to a compute-capable GPU.
///
/// Cloning is cheap; clones share the underlying device, queue and tensor-id
/// counter.
///
/// # Example
/// ```rust,no_run
/// use voltml::Device;
///
/// let device = Device::new().unwrap();
/// println!("Using: {}", device.name());
/// ```
#[derive(Clone)]
pub struct Device {
    pub(crate) instance: Arc<Instance>,
    pub(crate) adapter: Arc<Adapter>,
    pub(crate) device: Arc<WgpuDevice>,
    pub(crate) queue: Arc<Queue>,
    tensor_ids: Arc<AtomicU64>,
}

impl Device {
    /// Create a new device on the best available GPU backend.
    pub fn new() -> VoltResult<Self> {
        pollster::block_on(Self::new_async())
    }

    /// Async version of [`Device::new`] for use in async contexts.
    pub async fn new_async() -> VoltResult<Self> {
        let instance = Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or(VoltError::NoAdapter)?;

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("voltml device"),
                    required_features: wgpu::Features::PUSH_CONSTANTS,
                    required_limits: wgpu::Limits {
                        max_push_constant_size: 128,
                        // rnn.wgsl binds 11 storage buffers; the default
                        // limit is 8.
                        max_storage_buffers_per_shader_stage: 16,
                        ..wgpu::Limits::default()
                    },
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .await?;

        let info = adapter.get_info();
        log::info!("selected adapter {} ({:?})", info.name, info.backend);

        Ok(Self {
            instance: Arc::new(instance),
            adapter: Arc::new(adapter),
            device: Arc::new(device),
            queue: Arc::new(queue),
            tensor_ids: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Probe whether a usable GPU exists without keeping it.
    pub fn is_available() -> bool {
        Self::new().is_ok()
    }

    /// Name of the GPU adapter.
    pub fn name(&self) -> String {
        self.adapter.get_info().name
    }

    /// Backend type (Vulkan, Metal, DX12, ...).
    pub fn backend(&self) -> String {
        format!("{:?}", self.adapter.get_info().backend)
    }

    /// Maximum workgroup count along any dispatch axis.
    pub fn max_workgroups_per_dim(&self) -> u32 {
        self.device.limits().max_compute_workgroups_per_dimension
    }

    /// Hand out the next tensor id. Ids are unique per device lineage.
    pub(crate) fn next_tensor_id(&self) -> u64 {
        self.tensor_ids.fetch_add(1, Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name())
            .field("backend", &self.backend())
            .finish()
    }
}
