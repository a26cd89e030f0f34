//! Progressive path tracing renderer
//!
//! Accumulates samples across frames into a pair of ping-ponged float
//! targets. Any change that invalidates accumulated radiance (camera
//! movement, resize, new acceleration structures, material edits) restarts
//! accumulation from zero; once the configured sample budget is reached the
//! renderer stops tracing and keeps presenting the converged image.

use log::{debug, info};
use thiserror::Error;

use crate::accel::SceneBindings;
use crate::backend::traits::{BufferHandle, DeviceError, TargetHandle, TraceDevice};
use crate::backend::types::{
    BufferDescriptor, BufferUsage, PresentParams, TargetDescriptor, TextureFormat, TraceBindings,
    TraceDispatch, TraceUniforms, TRACE_GROUP_SIZE,
};
use crate::scene::{Camera, TraceCameraParams};
use crate::TracerConfig;

/// Renderer error type
#[derive(Error, Debug)]
pub enum RenderError {
    #[error("Renderer has zero-sized output ({0}x{1})")]
    EmptyOutput(u32, u32),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Accumulation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderState {
    /// No traceable scene bound; frames present pass-through.
    Idle,
    Accumulating,
    /// Sample budget reached; tracing stopped, presentation continues.
    Converged,
}

/// What one frame did.
#[derive(Debug, Clone, Copy)]
pub struct FrameReport {
    pub state: RenderState,
    pub sample_count: u32,
    pub traced: bool,
    pub restarted: bool,
}

struct Targets {
    ping: TargetHandle,
    pong: TargetHandle,
    output: BufferHandle,
    width: u32,
    height: u32,
}

/// Progressive renderer over a [`TraceDevice`].
pub struct ProgressiveRenderer {
    width: u32,
    height: u32,
    max_samples: u32,
    samples_per_pass: u32,
    bounce_limit: u32,
    exposure: f32,
    environment_rotation: f32,
    rng_state: u64,
    targets: Option<Targets>,
    current: usize,
    sample_count: u32,
    state: RenderState,
    last_camera: Option<TraceCameraParams>,
}

impl ProgressiveRenderer {
    pub fn new(config: &TracerConfig) -> Self {
        Self {
            width: config.width,
            height: config.height,
            max_samples: config.max_samples,
            samples_per_pass: config.samples_per_pass.max(1),
            bounce_limit: config.bounce_limit,
            exposure: config.exposure,
            environment_rotation: 0.0,
            rng_state: config.seed,
            targets: None,
            current: 0,
            sample_count: 0,
            state: RenderState::Idle,
            last_camera: None,
        }
    }

    pub fn state(&self) -> RenderState {
        self.state
    }

    pub fn sample_count(&self) -> u32 {
        self.sample_count
    }

    /// Host-readable RGBA8 output, valid after the first frame.
    pub fn output_buffer(&self) -> Option<BufferHandle> {
        self.targets.as_ref().map(|t| t.output)
    }

    pub fn set_environment_rotation(&mut self, radians: f32) {
        if self.environment_rotation != radians {
            self.environment_rotation = radians;
            self.restart();
        }
    }

    /// Change the output size. Targets are recreated on the next frame and
    /// accumulation restarts.
    pub fn resize(&mut self, width: u32, height: u32) {
        if self.width != width || self.height != height {
            self.width = width;
            self.height = height;
            self.restart();
        }
    }

    /// Throw away accumulated samples and start over. Accumulation always
    /// begins on the first target.
    pub fn restart(&mut self) {
        self.sample_count = 0;
        self.current = 0;
        if self.state == RenderState::Converged {
            self.state = RenderState::Accumulating;
        }
    }

    /// Render one frame.
    ///
    /// `scene_changed` signals that acceleration structures or materials
    /// changed since the last frame. A `bindings` of `None` presents
    /// pass-through and parks the renderer in [`RenderState::Idle`].
    pub fn render<D: TraceDevice>(
        &mut self,
        device: &mut D,
        camera: &Camera,
        bindings: Option<&SceneBindings>,
        scene_changed: bool,
    ) -> Result<FrameReport, RenderError> {
        if self.width == 0 || self.height == 0 {
            return Err(RenderError::EmptyOutput(self.width, self.height));
        }

        let mut restarted = self.ensure_targets(device)?;
        if scene_changed {
            restarted = true;
        }

        // Any camera parameter change restarts accumulation.
        let camera_params = camera.trace_params();
        if self.last_camera != Some(camera_params) {
            self.last_camera = Some(camera_params);
            restarted = true;
        }

        if restarted {
            self.restart();
        }

        let Some(bindings) = bindings else {
            self.state = RenderState::Idle;
            self.present(device, None)?;
            return Ok(FrameReport {
                state: self.state,
                sample_count: 0,
                traced: false,
                restarted,
            });
        };

        if self.state == RenderState::Idle {
            self.state = RenderState::Accumulating;
            info!("Scene ready, accumulation started");
        }

        let mut traced = false;
        if self.state == RenderState::Accumulating {
            self.trace(device, &camera_params, bindings)?;
            traced = true;
            self.sample_count = (self.sample_count + self.samples_per_pass).min(self.max_samples);
            if self.sample_count >= self.max_samples {
                self.state = RenderState::Converged;
                debug!("Converged at {} samples", self.sample_count);
            }
        }

        let source = self.targets.as_ref().map(|t| current_target(t, self.current));
        self.present(device, source)?;

        Ok(FrameReport {
            state: self.state,
            sample_count: self.sample_count,
            traced,
            restarted,
        })
    }

    fn trace<D: TraceDevice>(
        &mut self,
        device: &mut D,
        camera: &TraceCameraParams,
        bindings: &SceneBindings,
    ) -> Result<(), RenderError> {
        let targets = self
            .targets
            .as_ref()
            .ok_or_else(|| DeviceError::DispatchFailed("trace without targets".to_string()))?;
        let output = if self.current == 0 {
            targets.pong
        } else {
            targets.ping
        };
        let accumulated = current_target(targets, self.current);

        let pixel_count = self.width * self.height;
        let dispatch = TraceDispatch {
            bindings: TraceBindings {
                bvh_nodes: bindings.bvh_nodes,
                bvh_triangles: bindings.bvh_triangles,
                triangle_attributes: bindings.triangle_attributes,
                materials: bindings.materials,
                tlas_nodes: bindings.tlas_nodes,
                tlas_indices: bindings.tlas_indices,
                tlas_instances: bindings.tlas_instances,
                texture_descriptors: bindings.texture_descriptors,
                texture_data: bindings.texture_data,
                output,
                accumulated,
            },
            uniforms: TraceUniforms {
                cam_to_world: camera.cam_to_world,
                cam_inverse_projection: camera.cam_inverse_projection,
                width: self.width,
                height: self.height,
                rng_seed: self.next_seed(),
                sample_index: self.sample_count,
                samples_per_pass: self.samples_per_pass,
                bounce_limit: self.bounce_limit,
                instance_count: bindings.instance_count,
                features: bindings.features.bits(),
                aperture: camera.aperture,
                focal_length: camera.focal_length,
                environment_rotation: self.environment_rotation,
                _padding: [0; 5],
            },
            features: bindings.features,
            group_count: pixel_count.div_ceil(TRACE_GROUP_SIZE),
        };
        device.dispatch_trace(&dispatch)?;
        self.current = 1 - self.current;
        Ok(())
    }

    fn present<D: TraceDevice>(
        &mut self,
        device: &mut D,
        source: Option<TargetHandle>,
    ) -> Result<(), RenderError> {
        let targets = self
            .targets
            .as_ref()
            .ok_or_else(|| DeviceError::DispatchFailed("present without targets".to_string()))?;
        device.present(&PresentParams {
            source,
            destination: targets.output,
            width: targets.width,
            height: targets.height,
            sample_count: self.sample_count.max(1),
            exposure: self.exposure,
        })?;
        Ok(())
    }

    /// (Re)create targets when missing or stale. Returns whether they were
    /// recreated, which always restarts accumulation.
    fn ensure_targets<D: TraceDevice>(&mut self, device: &mut D) -> Result<bool, RenderError> {
        let stale = match &self.targets {
            Some(targets) => targets.width != self.width || targets.height != self.height,
            None => true,
        };
        if !stale {
            return Ok(false);
        }

        if let Some(targets) = self.targets.take() {
            device.destroy_target(targets.ping);
            device.destroy_target(targets.pong);
            device.destroy_buffer(targets.output);
        }

        let descriptor = TargetDescriptor {
            width: self.width,
            height: self.height,
            format: TextureFormat::Rgba32Float,
        };
        let ping = device.create_target(&descriptor)?;
        let pong = device.create_target(&descriptor)?;
        let output = device.create_buffer(&BufferDescriptor {
            label: Some("render output".to_string()),
            size: self.width as u64 * self.height as u64 * 4,
            usage: BufferUsage::STORAGE | BufferUsage::COPY_SRC | BufferUsage::READBACK,
        })?;

        debug!("Created {}x{} accumulation targets", self.width, self.height);
        self.targets = Some(Targets {
            ping,
            pong,
            output,
            width: self.width,
            height: self.height,
        });
        self.current = 0;
        Ok(true)
    }

    /// Per-frame root seed; pixels derive their own streams from it.
    fn next_seed(&mut self) -> u32 {
        // splitmix64
        self.rng_state = self.rng_state.wrapping_add(0x9E3779B97F4A7C15);
        let mut z = self.rng_state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
        z ^= z >> 31;
        (z >> 32) as u32 ^ z as u32
    }

    pub fn shutdown<D: TraceDevice>(&mut self, device: &mut D) {
        if let Some(targets) = self.targets.take() {
            device.destroy_target(targets.ping);
            device.destroy_target(targets.pong);
            device.destroy_buffer(targets.output);
        }
        self.state = RenderState::Idle;
        self.sample_count = 0;
        self.last_camera = None;
    }
}

fn current_target(targets: &Targets, current: usize) -> TargetHandle {
    if current == 0 {
        targets.ping
    } else {
        targets.pong
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyDevice;
    use crate::backend::types::TraceFeatures;

    fn config() -> TracerConfig {
        TracerConfig {
            width: 64,
            height: 64,
            max_samples: 4,
            samples_per_pass: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_pass_through_without_scene() {
        let mut device = DummyDevice::new();
        let mut renderer = ProgressiveRenderer::new(&config());
        let camera = Camera::default();

        let report = renderer.render(&mut device, &camera, None, false).unwrap();
        assert_eq!(report.state, RenderState::Idle);
        assert!(!report.traced);
        assert_eq!(device.trace_dispatches(), 0);
        assert_eq!(device.present_calls(), 1);
        assert!(device.last_present().unwrap().source.is_none());

        renderer.shutdown(&mut device);
    }

    fn scene_bindings(device: &mut DummyDevice) -> SceneBindings {
        let mut storage = |label| {
            device
                .create_buffer(&BufferDescriptor::storage(label, 64))
                .unwrap()
        };
        SceneBindings {
            bvh_nodes: storage("nodes"),
            bvh_triangles: storage("triangles"),
            triangle_attributes: storage("attributes"),
            materials: storage("materials"),
            tlas_nodes: None,
            tlas_indices: None,
            tlas_instances: None,
            texture_descriptors: None,
            texture_data: None,
            instance_count: 1,
            features: TraceFeatures::NONE,
        }
    }

    #[test]
    fn test_restart_presents_from_the_first_target() {
        let mut device = DummyDevice::new();
        let mut renderer = ProgressiveRenderer::new(&config());
        let camera = Camera::default();
        let bindings = scene_bindings(&mut device);

        renderer
            .render(&mut device, &camera, Some(&bindings), false)
            .unwrap();
        let first_source = device.last_present().unwrap().source;

        // one traced frame flipped the targets; a restart must flip back
        renderer.restart();
        let report = renderer
            .render(&mut device, &camera, Some(&bindings), false)
            .unwrap();
        assert_eq!(report.sample_count, 1);
        assert_eq!(device.last_present().unwrap().source, first_source);

        renderer.shutdown(&mut device);
    }

    #[test]
    fn test_camera_move_restarts_accumulation() {
        let mut device = DummyDevice::new();
        let mut renderer = ProgressiveRenderer::new(&config());
        let mut camera = Camera::default();

        renderer.render(&mut device, &camera, None, false).unwrap();
        let report = renderer.render(&mut device, &camera, None, false).unwrap();
        assert!(!report.restarted);

        camera.set_position(glam::Vec3::new(5.0, 2.0, 5.0));
        let report = renderer.render(&mut device, &camera, None, false).unwrap();
        assert!(report.restarted);

        renderer.shutdown(&mut device);
    }

    #[test]
    fn test_resize_recreates_targets_and_restarts() {
        let mut device = DummyDevice::new();
        let mut renderer = ProgressiveRenderer::new(&config());
        let camera = Camera::default();

        renderer.render(&mut device, &camera, None, false).unwrap();
        let output_before = renderer.output_buffer().unwrap();

        renderer.resize(128, 128);
        let report = renderer.render(&mut device, &camera, None, false).unwrap();
        assert!(report.restarted);
        assert_ne!(renderer.output_buffer().unwrap(), output_before);
        assert_eq!(
            device.buffer_size(renderer.output_buffer().unwrap()),
            128 * 128 * 4
        );

        renderer.shutdown(&mut device);
    }

    #[test]
    fn test_zero_size_is_an_error() {
        let mut device = DummyDevice::new();
        let mut renderer = ProgressiveRenderer::new(&TracerConfig {
            width: 0,
            height: 64,
            ..Default::default()
        });
        let result = renderer.render(&mut device, &Camera::default(), None, false);
        assert!(matches!(result, Err(RenderError::EmptyOutput(0, 64))));
    }
}
