//! Path tracing camera

use glam::{Mat4, Vec3};

/// Perspective camera with thin-lens parameters.
#[derive(Debug, Clone)]
pub struct Camera {
    pub position: Vec3,
    pub target: Vec3,
    pub up: Vec3,
    pub fov_y: f32,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
    /// Thin-lens aperture radius; 0 disables depth of field.
    pub aperture: f32,
    /// Focus distance along the view direction.
    pub focal_length: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 2.0, 5.0),
            target: Vec3::ZERO,
            up: Vec3::Y,
            fov_y: std::f32::consts::FRAC_PI_4,
            aspect: 16.0 / 9.0,
            near: 0.1,
            far: 1000.0,
            aperture: 0.0,
            focal_length: 10.0,
        }
    }
}

impl Camera {
    pub fn new(position: Vec3, target: Vec3) -> Self {
        Self {
            position,
            target,
            ..Default::default()
        }
    }

    pub fn look_at(&mut self, target: Vec3) {
        self.target = target;
    }

    pub fn set_position(&mut self, position: Vec3) {
        self.position = position;
    }

    pub fn set_aspect(&mut self, width: f32, height: f32) {
        self.aspect = width / height;
    }

    /// Get the view matrix
    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_at_rh(self.position, self.target, self.up)
    }

    /// Get the projection matrix
    pub fn projection_matrix(&self) -> Mat4 {
        Mat4::perspective_rh(self.fov_y, self.aspect, self.near, self.far)
    }

    /// Snapshot of everything the trace kernel derives rays from.
    ///
    /// The renderer compares consecutive snapshots to decide when to restart
    /// accumulation, so this must capture every ray-generating parameter.
    pub fn trace_params(&self) -> TraceCameraParams {
        TraceCameraParams {
            cam_to_world: self.view_matrix().inverse(),
            cam_inverse_projection: self.projection_matrix().inverse(),
            aperture: self.aperture,
            focal_length: self.focal_length,
        }
    }
}

/// Ray-generation parameters consumed by the trace kernel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TraceCameraParams {
    pub cam_to_world: Mat4,
    pub cam_inverse_projection: Mat4,
    pub aperture: f32,
    pub focal_length: f32,
}
