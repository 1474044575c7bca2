use nalgebra::{Matrix4, Perspective3};

// nalgebra builds OpenGL style clip space (z in -1..1); wgpu wants 0..1.
#[rustfmt::skip]
fn opengl_to_wgpu() -> Matrix4<f32> {
    Matrix4::new(
        1.0, 0.0, 0.0, 0.0,
        0.0, 1.0, 0.0, 0.0,
        0.0, 0.0, 0.5, 0.5,
        0.0, 0.0, 0.0, 1.0,
    )
}

/// A camera at the origin looking down -Z.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerspectiveCamera {
    pub fov_degrees: f32,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
}

impl PerspectiveCamera {
    pub fn new(fov_degrees: f32, aspect: f32, near: f32, far: f32) -> Self {
        Self {
            fov_degrees,
            aspect,
            near,
            far,
        }
    }

    pub fn projection_matrix(&self) -> Matrix4<f32> {
        let perspective = Perspective3::new(self.aspect, self.fov_degrees.to_radians(), self.near, self.far);
        opengl_to_wgpu() * perspective.into_inner()
    }

    /// Height of the view frustum at `depth` units in front of the camera.
    pub fn visible_height_at(&self, depth: f32) -> f32 {
        2. * depth * (self.fov_degrees.to_radians() / 2.).tan()
    }

    pub fn visible_width_at(&self, depth: f32) -> f32 {
        self.visible_height_at(depth) * self.aspect
    }
}
