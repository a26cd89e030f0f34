//! Device abstraction layer
//!
//! The tracing core runs against the [`TraceDevice`](traits::TraceDevice)
//! trait. Two implementations are provided: [`DummyDevice`](dummy::DummyDevice)
//! for tests and development without GPU hardware, and
//! [`WgpuDevice`](wgpu_backend::WgpuDevice) for headless GPU execution.

pub mod dummy;
pub mod traits;
pub mod types;

#[cfg(feature = "wgpu-backend")]
pub mod wgpu_backend;
