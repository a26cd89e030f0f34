//! Core device abstraction traits
//!
//! [`TraceDevice`] is the interface to the GPU execution environment: it owns
//! buffers and targets and runs the fixed-function kernels of the tracing
//! pipeline. The crate never talks to a GPU API directly.

use crate::backend::types::*;
use thiserror::Error;

/// Device error type
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Failed to initialize device: {0}")]
    InitializationFailed(String),
    #[error("Failed to create buffer: {0}")]
    BufferCreationFailed(String),
    #[error("Failed to create texture: {0}")]
    TextureCreationFailed(String),
    #[error("Failed to create render target: {0}")]
    TargetCreationFailed(String),
    #[error("Kernel dispatch failed: {0}")]
    DispatchFailed(String),
    #[error("Invalid kernel bindings: {0}")]
    InvalidBindings(String),
    #[error("Readback failed: {0}")]
    ReadbackFailed(String),
    #[error("Out of memory")]
    OutOfMemory,
    #[error("Device lost")]
    DeviceLost,
}

pub type DeviceResult<T> = Result<T, DeviceError>;

/// Handle to a GPU buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub(crate) u64);

/// Handle to a source texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub(crate) u64);

/// Handle to an accumulation render target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetHandle(pub(crate) u64);

/// Handle to an in-flight device-to-host readback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReadbackHandle(pub(crate) u64);

/// Result of polling an asynchronous readback.
///
/// Errors do not cross the async boundary as panics or `Err` returns from the
/// request; continuations observe them here as an explicit variant.
#[derive(Debug)]
pub enum ReadbackPoll {
    /// The copy has not completed yet; poll again next frame.
    Pending,
    /// The copy completed; the bytes are handed over exactly once.
    Ready(Vec<u8>),
    /// The copy failed; the handle is consumed.
    Failed(String),
}

/// Device that runs the fixed-function kernels of the tracing pipeline.
pub trait TraceDevice {
    /// Create a buffer filled with zeroes.
    fn create_buffer(&mut self, desc: &BufferDescriptor) -> DeviceResult<BufferHandle>;

    /// Create a buffer with initial data.
    fn create_buffer_init(&mut self, desc: &BufferDescriptor, data: &[u8])
        -> DeviceResult<BufferHandle>;

    /// Write data to a buffer at a byte offset.
    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]);

    /// Get the allocated size of a buffer, or 0 for an unknown handle.
    fn buffer_size(&self, buffer: BufferHandle) -> u64;

    /// Destroy a buffer.
    fn destroy_buffer(&mut self, buffer: BufferHandle);

    /// Create a source texture.
    fn create_texture(&mut self, desc: &TextureDescriptor) -> DeviceResult<TextureHandle>;

    /// Upload texel data to a source texture.
    fn write_texture(&mut self, texture: TextureHandle, data: &[u8]);

    /// Destroy a source texture.
    fn destroy_texture(&mut self, texture: TextureHandle);

    /// Create an accumulation render target.
    fn create_target(&mut self, desc: &TargetDescriptor) -> DeviceResult<TargetHandle>;

    /// Destroy a render target.
    fn destroy_target(&mut self, target: TargetHandle);

    /// Run the mesh transform-and-pack kernel.
    fn dispatch_mesh_pack(&mut self, dispatch: &MeshPackDispatch) -> DeviceResult<()>;

    /// Run the texture copy kernel.
    fn dispatch_texture_copy(&mut self, dispatch: &TextureCopyDispatch) -> DeviceResult<()>;

    /// Run the trace kernel.
    fn dispatch_trace(&mut self, dispatch: &TraceDispatch) -> DeviceResult<()>;

    /// Resolve an accumulation target into the presentation output buffer.
    fn present(&mut self, params: &PresentParams) -> DeviceResult<()>;

    /// Begin an asynchronous device-to-host copy of an entire buffer.
    fn request_readback(&mut self, buffer: BufferHandle) -> DeviceResult<ReadbackHandle>;

    /// Poll an in-flight readback. Never blocks.
    fn poll_readback(&mut self, readback: ReadbackHandle) -> ReadbackPoll;
}
