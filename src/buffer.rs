//! Raw GPU storage buffers.
//!
//! [`DeviceBuffer`] is the single storage primitive under every tensor:
//! a STORAGE|COPY_SRC|COPY_DST buffer with blocking upload and readback.

use wgpu::util::DeviceExt;

use crate::device::Device;

/// A storage buffer on the device, tracked by byte size.
#[derive(Debug)]
pub struct DeviceBuffer {
    buffer: wgpu::Buffer,
    size_in_bytes: u64,
}

const USAGE: wgpu::BufferUsages = wgpu::BufferUsages::STORAGE
    .union(wgpu::BufferUsages::COPY_DST)
    .union(wgpu::BufferUsages::COPY_SRC);

impl DeviceBuffer {
    /// Allocate a zero-filled buffer. Sizes below one element are rounded up
    /// to 4 bytes so the buffer always binds.
    pub fn zeroed(device: &Device, size_in_bytes: u64) -> Self {
        let size = size_in_bytes.max(4);
        let buffer = device.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("tensor storage"),
            size,
            usage: USAGE,
            mapped_at_creation: false,
        });
        Self {
            buffer,
            size_in_bytes: size,
        }
    }

    /// Allocate and upload host bytes in one step.
    pub fn from_bytes(device: &Device, data: &[u8]) -> Self {
        if data.is_empty() {
            return Self::zeroed(device, 0);
        }
        let buffer = device
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("tensor storage"),
                contents: data,
                usage: USAGE,
            });
        Self {
            buffer,
            size_in_bytes: data.len() as u64,
        }
    }

    pub fn raw(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.size_in_bytes
    }

    /// Overwrite a region of the buffer from host memory.
    pub fn write_bytes(&self, device: &Device, offset: u64, data: &[u8]) {
        device.queue.write_buffer(&self.buffer, offset, data);
    }

    /// Blocking readback of the full buffer contents.
    pub fn read_bytes(&self, device: &Device) -> Vec<u8> {
        pollster::block_on(self.read_bytes_async(device))
    }

    /// Async readback via a staging buffer.
    pub async fn read_bytes_async(&self, device: &Device) -> Vec<u8> {
        let size = self.size_in_bytes;
        let staging = device.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = device
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor::default());
        encoder.copy_buffer_to_buffer(&self.buffer, 0, &staging, 0, size);
        device.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = futures_intrusive::channel::shared::oneshot_channel();
        slice.map_async(wgpu::MapMode::Read, move |_| {
            let _ = tx.send(());
        });
        device.device.poll(wgpu::Maintain::Wait);
        rx.receive().await;

        let data = slice.get_mapped_range();
        let res = data.to_vec();
        drop(data);
        staging.unmap();
        res
    }

    /// GPU-side copy into a fresh buffer of the same size.
    pub fn duplicate(&self, device: &Device) -> Self {
        let out = Self::zeroed(device, self.size_in_bytes);
        let mut encoder = device
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor::default());
        encoder.copy_buffer_to_buffer(&self.buffer, 0, &out.buffer, 0, self.size_in_bytes);
        device.queue.submit(Some(encoder.finish()));
        device.device.poll(wgpu::Maintain::Wait);
        out
    }
}
