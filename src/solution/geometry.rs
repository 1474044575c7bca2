use super::procrustes::ProcrustesAnalyzer;
use super::{FaceGeometry, Mesh, PoseTransform};
use crate::assets::load_obj;
use anyhow::{Error, Result};
use nalgebra::{Matrix4, Vector3};
use std::path::Path;
use tracing::{Level, span, trace};

/// Camera the pose is expressed against. Matches the renderer's camera so
/// the model lines up with the background plane.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerspectiveParams {
    pub fov_degrees: f32,
    pub near: f32,
}

impl Default for PerspectiveParams {
    fn default() -> Self {
        Self {
            fov_degrees: 63.,
            near: 1.,
        }
    }
}

/// Estimates a face pose from image-space landmarks by fitting them to a
/// canonical face model.
pub struct GeometryEstimator {
    analyzer: ProcrustesAnalyzer,
    camera: PerspectiveParams,
}

impl GeometryEstimator {
    /// Loads the canonical model. Its vertices must follow landmark order.
    pub fn from_obj(path: &Path, camera: PerspectiveParams) -> Result<Self> {
        let model = load_obj(path)?;
        let estimator = Self::new(model.positions.into_iter(), camera);
        if estimator.analyzer.is_empty() {
            return Err(Error::msg(format!("Canonical face model {path:?} has no vertices")));
        }
        Ok(estimator)
    }

    pub fn new(reference: impl Iterator<Item = [f32; 3]>, camera: PerspectiveParams) -> Self {
        Self {
            analyzer: ProcrustesAnalyzer::new(reference),
            camera,
        }
    }

    pub fn estimate(&mut self, landmarks: &[[f32; 3]], width: u32, height: u32) -> Option<FaceGeometry> {
        let span = span!(Level::DEBUG, "estimate_geometry");
        let _guard = span.enter();

        let n = self.analyzer.len();
        if landmarks.len() < n || width == 0 || height == 0 {
            return None;
        }

        let screen = self.lift(&landmarks[..n], width, height);
        let fit = self.analyzer.analyze(screen.iter().copied())?;
        if fit.scale <= 0. || !fit.scale.is_finite() {
            return None;
        }

        // A unit at depth d spans near/d on the near plane.
        let depth = self.camera.near / fit.scale;
        let t = fit.translation * (depth / self.camera.near);
        let translation = Vector3::new(t.x, t.y, -depth);

        let mut pose = Matrix4::identity();
        pose.fixed_view_mut::<3, 3>(0, 0).copy_from(&fit.rotation);
        pose.fixed_view_mut::<3, 1>(0, 3).copy_from(&translation);
        trace!("Pose: {pose}");

        // Landmarks expressed in canonical face space.
        let inverse = fit.rotation.transpose() / fit.scale;
        let vertices = screen
            .iter()
            .map(|p| -> [f32; 3] { (inverse * (Vector3::from(*p) - fit.translation)).into() })
            .collect();

        Some(FaceGeometry {
            pose_transform: PoseTransform::from_matrix(&pose),
            mesh: Mesh { vertices },
        })
    }

    /// Moves pixel landmarks onto the camera's near plane (y up, z toward
    /// the viewer).
    fn lift(&self, landmarks: &[[f32; 3]], width: u32, height: u32) -> Vec<[f32; 3]> {
        let (w, h) = (width as f32, height as f32);
        let near_h = 2. * self.camera.near * (self.camera.fov_degrees.to_radians() / 2.).tan();
        let near_w = near_h * w / h;

        landmarks
            .iter()
            .map(|[x, y, z]| {
                [
                    (x / w - 0.5) * near_w,
                    (0.5 - y / h) * near_h,
                    -z / w * near_w,
                ]
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{Point3, Rotation3};

    // A rough head: forehead, eyes, nose tip, mouth corners, chin (cm).
    const FACE: &[[f32; 3]] = &[
        [0., 6., 1.],
        [-3., 3., 0.],
        [3., 3., 0.],
        [0., 0., 3.],
        [-2.5, -3., 0.5],
        [2.5, -3., 0.5],
        [0., -7., 0.],
        [-6., 0., -4.],
        [6., 0., -4.],
    ];

    const W: u32 = 640;
    const H: u32 = 480;

    /// Renders `FACE` under `pose` into pixel landmarks the way the
    /// landmark model reports them.
    fn project(pose: &Matrix4<f32>, camera: PerspectiveParams) -> Vec<[f32; 3]> {
        let near_h = 2. * camera.near * (camera.fov_degrees.to_radians() / 2.).tan();
        let near_w = near_h * W as f32 / H as f32;
        let depth = -pose[(2, 3)];

        FACE.iter()
            .map(|p| {
                let c = pose.transform_point(&Point3::from(*p));
                let xs = c.x * camera.near / -c.z;
                let ys = c.y * camera.near / -c.z;
                let zs = (c.z + depth) * camera.near / depth;
                [
                    (xs / near_w + 0.5) * W as f32,
                    (0.5 - ys / near_h) * H as f32,
                    -zs / near_w * W as f32,
                ]
            })
            .collect()
    }

    #[test]
    fn test_frontal_face_recovers_depth() {
        let camera = PerspectiveParams::default();
        let pose = Matrix4::new_translation(&Vector3::new(0., 0., -50.));

        let mut est = GeometryEstimator::new(FACE.iter().copied(), camera);
        let geometry = est.estimate(&project(&pose, camera), W, H).unwrap();
        let m = geometry.pose_transform.to_matrix();

        assert_relative_eq!(m[(2, 3)], -50., epsilon = 1.5);
        assert_relative_eq!(m[(0, 3)], 0., epsilon = 0.3);
        assert_relative_eq!(m[(1, 3)], 0., epsilon = 0.3);
        assert_relative_eq!(
            m.fixed_view::<3, 3>(0, 0).into_owned(),
            nalgebra::Matrix3::identity(),
            epsilon = 0.05
        );
        assert_eq!(geometry.mesh.vertices.len(), FACE.len());
    }

    #[test]
    fn test_turned_face_recovers_rotation() {
        let camera = PerspectiveParams::default();
        let rotation = Rotation3::from_euler_angles(0.1, 0.4, -0.2);
        let pose = Matrix4::new_translation(&Vector3::new(4., -2., -60.)) * rotation.to_homogeneous();

        let mut est = GeometryEstimator::new(FACE.iter().copied(), camera);
        let m = est
            .estimate(&project(&pose, camera), W, H)
            .unwrap()
            .pose_transform
            .to_matrix();

        assert_relative_eq!(
            m.fixed_view::<3, 3>(0, 0).into_owned(),
            *rotation.matrix(),
            epsilon = 0.08
        );
        assert_relative_eq!(m[(0, 3)], 4., epsilon = 0.6);
        assert_relative_eq!(m[(1, 3)], -2., epsilon = 0.6);
        assert_relative_eq!(m[(2, 3)], -60., epsilon = 3.);
    }

    #[test]
    fn test_too_few_landmarks() {
        let mut est = GeometryEstimator::new(FACE.iter().copied(), PerspectiveParams::default());
        assert!(est.estimate(&FACE[..3], W, H).is_none());
        assert!(est.estimate(FACE, 0, H).is_none());
    }

    fn write_temp(name: &str, contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("facemask-{}-{name}", std::process::id()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_canonical_model_errors() {
        let camera = PerspectiveParams::default();

        let empty = write_temp("empty.obj", "# no vertices\n");
        assert!(GeometryEstimator::from_obj(&empty, camera).is_err());

        let broken = write_temp("broken.obj", "v 0 0 0\nv 1 0 0\nf 1 2 9\n");
        let err = GeometryEstimator::from_obj(&broken, camera).err().unwrap();
        assert!(format!("{err:#}").contains("missing vertex 9"));

        let _ = std::fs::remove_file(empty);
        let _ = std::fs::remove_file(broken);
    }
}
