//! Packed vertex readback
//!
//! The external builder runs on the host, so packed world-space positions
//! have to cross back from the GPU before any build can start. Only one
//! readback is ever in flight; a rebuild that lands while one is pending
//! supersedes it when the bytes arrive.

use log::warn;
use std::sync::Arc;

use crate::backend::traits::{BufferHandle, DeviceResult, ReadbackHandle, ReadbackPoll, TraceDevice};
use crate::resources::mesh::PackedVertex;

/// Result of advancing the readback state machine one frame.
#[derive(Debug)]
pub enum ReadbackState {
    /// Nothing requested.
    Idle,
    /// Copy still in flight.
    Pending,
    /// Bytes arrived. The returned vector is an owned duplicate of the GPU
    /// buffer contents; builder spans borrow from it via `Arc`, never from
    /// device memory.
    Ready(Arc<Vec<PackedVertex>>),
    Failed(String),
}

/// Drives the single in-flight device-to-host position copy.
pub struct ReadbackCoordinator {
    in_flight: Option<ReadbackHandle>,
    superseded: Vec<ReadbackHandle>,
}

impl ReadbackCoordinator {
    pub fn new() -> Self {
        Self {
            in_flight: None,
            superseded: Vec::new(),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Request a readback of the full position buffer. A request that lands
    /// while another is pending replaces it; the old readback keeps being
    /// polled and its bytes are discarded on arrival, so the device-side
    /// entry is always consumed.
    pub fn request<D: TraceDevice>(
        &mut self,
        device: &mut D,
        positions: BufferHandle,
    ) -> DeviceResult<()> {
        if let Some(old) = self.in_flight.take() {
            warn!("Readback superseded before completion");
            self.superseded.push(old);
        }
        self.in_flight = Some(device.request_readback(positions)?);
        Ok(())
    }

    /// Poll the in-flight readback, if any. Never blocks.
    pub fn poll<D: TraceDevice>(&mut self, device: &mut D) -> ReadbackState {
        self.superseded
            .retain(|&old| matches!(device.poll_readback(old), ReadbackPoll::Pending));

        let Some(handle) = self.in_flight else {
            return ReadbackState::Idle;
        };

        match device.poll_readback(handle) {
            ReadbackPoll::Pending => ReadbackState::Pending,
            ReadbackPoll::Ready(bytes) => {
                self.in_flight = None;
                let positions: Vec<PackedVertex> = bytemuck::cast_slice(&bytes).to_vec();
                ReadbackState::Ready(Arc::new(positions))
            }
            ReadbackPoll::Failed(message) => {
                self.in_flight = None;
                ReadbackState::Failed(message)
            }
        }
    }

    /// Poll everything to completion and discard the results. Used during
    /// teardown; copies cannot be cancelled.
    pub fn drain<D: TraceDevice>(&mut self, device: &mut D) {
        while matches!(self.poll(device), ReadbackState::Pending) {}
        while !self.superseded.is_empty() {
            self.superseded
                .retain(|&old| matches!(device.poll_readback(old), ReadbackPoll::Pending));
        }
    }
}

impl Default for ReadbackCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyDevice;
    use crate::backend::types::BufferDescriptor;
    use glam::Vec4;

    fn position_buffer(device: &mut DummyDevice, positions: &[Vec4]) -> BufferHandle {
        device
            .create_buffer_init(
                &BufferDescriptor::storage("positions", (positions.len() * 16) as u64),
                bytemuck::cast_slice(positions),
            )
            .unwrap()
    }

    #[test]
    fn test_poll_without_request_is_idle() {
        let mut device = DummyDevice::new();
        let mut coordinator = ReadbackCoordinator::new();
        assert!(matches!(coordinator.poll(&mut device), ReadbackState::Idle));
    }

    #[test]
    fn test_readback_round_trip() {
        let mut device = DummyDevice::new();
        device.set_readback_latency(1);
        let positions = vec![Vec4::new(1.0, 2.0, 3.0, 1.0); 3];
        let buffer = position_buffer(&mut device, &positions);

        let mut coordinator = ReadbackCoordinator::new();
        coordinator.request(&mut device, buffer).unwrap();
        assert!(matches!(
            coordinator.poll(&mut device),
            ReadbackState::Pending
        ));
        match coordinator.poll(&mut device) {
            ReadbackState::Ready(data) => assert_eq!(*data, positions),
            other => panic!("expected ready, got {:?}", other),
        }
        assert!(!coordinator.is_pending());
    }

    #[test]
    fn test_superseded_readback_is_consumed() {
        let mut device = DummyDevice::new();
        device.set_readback_latency(1);
        let stale = position_buffer(&mut device, &[Vec4::ZERO; 3]);
        let fresh = position_buffer(&mut device, &[Vec4::ONE; 3]);

        let mut coordinator = ReadbackCoordinator::new();
        coordinator.request(&mut device, stale).unwrap();
        coordinator.request(&mut device, fresh).unwrap();

        assert!(matches!(
            coordinator.poll(&mut device),
            ReadbackState::Pending
        ));
        match coordinator.poll(&mut device) {
            ReadbackState::Ready(data) => assert_eq!(*data, vec![Vec4::ONE; 3]),
            other => panic!("expected ready, got {:?}", other),
        }
        // the stale copy was polled off the device, not left behind
        assert_eq!(device.pending_readbacks(), 0);
    }

    #[test]
    fn test_drain_consumes_everything() {
        let mut device = DummyDevice::new();
        device.set_readback_latency(3);
        let stale = position_buffer(&mut device, &[Vec4::ZERO; 3]);
        let fresh = position_buffer(&mut device, &[Vec4::ONE; 3]);

        let mut coordinator = ReadbackCoordinator::new();
        coordinator.request(&mut device, stale).unwrap();
        coordinator.request(&mut device, fresh).unwrap();

        coordinator.drain(&mut device);
        assert!(!coordinator.is_pending());
        assert_eq!(device.pending_readbacks(), 0);
    }

    #[test]
    fn test_data_outlives_buffer() {
        let mut device = DummyDevice::new();
        device.set_readback_latency(0);
        let buffer = position_buffer(&mut device, &[Vec4::ONE; 3]);

        let mut coordinator = ReadbackCoordinator::new();
        coordinator.request(&mut device, buffer).unwrap();
        let data = match coordinator.poll(&mut device) {
            ReadbackState::Ready(data) => data,
            other => panic!("expected ready, got {:?}", other),
        };

        device.destroy_buffer(buffer);
        assert_eq!(data.len(), 3);
    }
}
