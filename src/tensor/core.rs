//! Core tensor type.
//!
//! A [`Tensor`] is a shape, a storage format and a shared [`DeviceBuffer`].
//! Clones are views onto the same storage; a distinct copy of the bytes
//! takes [`Tensor::duplicate`] or the `copy` operator.

use std::sync::Arc;

use crate::buffer::DeviceBuffer;
use crate::device::Device;
use crate::error::{VoltError, VoltResult};
use crate::tensor::init::Init;

/// Element storage format.
///
/// Kernels in this crate compute in fp32; the other tags travel with the
/// tensor so mixed-format graphs stay honest about what a buffer holds.
/// `Bool` occupies four bytes and is stored as `u32` 0/1 on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Fp16,
    Fp32,
    Fp64,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    Bool,
}

impl Format {
    /// Size of a single element in bytes.
    pub fn element_size(&self) -> usize {
        match self {
            Format::Int8 | Format::UInt8 => 1,
            Format::Fp16 | Format::Int16 => 2,
            Format::Fp32 | Format::Int32 | Format::Bool => 4,
            Format::Fp64 | Format::Int64 => 8,
        }
    }
}

impl Default for Format {
    fn default() -> Self {
        Format::Fp32
    }
}

/// An n-dimensional array on the GPU.
#[derive(Clone)]
pub struct Tensor {
    id: u64,
    shape: Vec<usize>,
    format: Format,
    buffer: Arc<DeviceBuffer>,
}

impl Tensor {
    /// Zero-filled tensor.
    pub fn zeros(device: &Device, shape: &[usize], format: Format) -> Self {
        let count: usize = shape.iter().product();
        let buffer = DeviceBuffer::zeroed(device, (count * format.element_size()) as u64);
        Self {
            id: device.next_tensor_id(),
            shape: shape.to_vec(),
            format,
            buffer: Arc::new(buffer),
        }
    }

    /// Upload fp32 host data. The data length must match the shape.
    pub fn from_f32(device: &Device, data: &[f32], shape: &[usize]) -> VoltResult<Self> {
        let count: usize = shape.iter().product();
        if data.len() != count {
            return Err(VoltError::CountMismatch {
                have: data.len(),
                want: count,
            });
        }
        Ok(Self::upload(device, bytemuck::cast_slice(data), shape, Format::Fp32))
    }

    /// Upload int32 host data, e.g. stride tables for transpose.
    pub fn from_i32(device: &Device, data: &[i32], shape: &[usize]) -> VoltResult<Self> {
        let count: usize = shape.iter().product();
        if data.len() != count {
            return Err(VoltError::CountMismatch {
                have: data.len(),
                want: count,
            });
        }
        Ok(Self::upload(device, bytemuck::cast_slice(data), shape, Format::Int32))
    }

    /// Upload raw bytes with an explicit format tag.
    pub fn from_bytes(device: &Device, data: &[u8], shape: &[usize], format: Format) -> Self {
        Self::upload(device, data, shape, format)
    }

    /// Every element set to `value`.
    pub fn filled(device: &Device, shape: &[usize], value: f32) -> Self {
        let count: usize = shape.iter().product();
        let data = vec![value; count];
        Self::upload(device, bytemuck::cast_slice(&data), shape, Format::Fp32)
    }

    /// Build from a host-side initializer (see [`crate::tensor::init`]).
    pub fn from_init(device: &Device, init: Init, shape: &[usize]) -> Self {
        let count: usize = shape.iter().product();
        let data = init.generate(count);
        Self::upload(device, bytemuck::cast_slice(&data), shape, Format::Fp32)
    }

    fn upload(device: &Device, bytes: &[u8], shape: &[usize], format: Format) -> Self {
        Self {
            id: device.next_tensor_id(),
            shape: shape.to_vec(),
            format,
            buffer: Arc::new(DeviceBuffer::from_bytes(device, bytes)),
        }
    }

    /// Unique id, handed out by the device at construction.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn format(&self) -> Format {
        self.format
    }

    /// Total element count.
    pub fn count(&self) -> usize {
        self.shape.iter().product()
    }

    /// Number of axes.
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Extent along one axis.
    pub fn dim(&self, axis: usize) -> usize {
        self.shape[axis]
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.buffer.size_in_bytes()
    }

    pub(crate) fn buffer(&self) -> &DeviceBuffer {
        &self.buffer
    }

    /// Metadata-only reshape. The new shape must hold exactly as many
    /// elements as the current one.
    pub fn reshape(&mut self, shape: &[usize]) -> VoltResult<()> {
        let want: usize = shape.iter().product();
        let have = self.count();
        if want != have {
            return Err(VoltError::CountMismatch { have, want });
        }
        self.shape = shape.to_vec();
        Ok(())
    }

    /// Storage-level reshape. Allocates fresh storage when the byte size
    /// grows or the format changes, otherwise rewrites in place.
    pub fn reallocate(
        &mut self,
        device: &Device,
        data: Option<&[u8]>,
        shape: &[usize],
        format: Format,
    ) {
        let new_bytes = (shape.iter().product::<usize>() * format.element_size()) as u64;
        if new_bytes > self.buffer.size_in_bytes() || format != self.format {
            self.buffer = Arc::new(match data {
                Some(bytes) => DeviceBuffer::from_bytes(device, bytes),
                None => DeviceBuffer::zeroed(device, new_bytes),
            });
        } else if let Some(bytes) = data {
            self.buffer.write_bytes(device, 0, bytes);
        }
        self.shape = shape.to_vec();
        self.format = format;
    }

    /// Overwrite the buffer contents from host memory.
    pub fn write_data(&self, device: &Device, bytes: &[u8]) {
        self.buffer.write_bytes(device, 0, bytes);
    }

    /// Blocking readback as fp32.
    pub fn to_vec(&self, device: &Device) -> VoltResult<Vec<f32>> {
        if self.format != Format::Fp32 {
            return Err(VoltError::FormatMismatch {
                expected: Format::Fp32,
                got: self.format,
            });
        }
        let bytes = self.buffer.read_bytes(device);
        let count = self.count() * 4;
        Ok(bytemuck::cast_slice(&bytes[..count]).to_vec())
    }

    /// Blocking readback as u32, used for `Bool` and `Int32` tensors.
    pub fn to_vec_u32(&self, device: &Device) -> Vec<u32> {
        let bytes = self.buffer.read_bytes(device);
        let count = self.count() * 4;
        bytemuck::cast_slice(&bytes[..count]).to_vec()
    }

    /// Blocking readback of the raw bytes.
    pub fn to_bytes(&self, device: &Device) -> Vec<u8> {
        self.buffer.read_bytes(device)
    }

    /// Deep copy with fresh storage and a fresh id.
    pub fn duplicate(&self, device: &Device) -> Self {
        Self {
            id: device.next_tensor_id(),
            shape: self.shape.clone(),
            format: self.format,
            buffer: Arc::new(self.buffer.duplicate(device)),
        }
    }
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("id", &self.id)
            .field("shape", &self.shape)
            .field("format", &self.format)
            .finish()
    }
}
