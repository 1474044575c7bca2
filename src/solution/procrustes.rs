//! [Procrustes analysis] between a fixed reference shape and observed points.
//!
//! [Procrustes analysis]: https://en.wikipedia.org/wiki/Procrustes_analysis

use nalgebra::{Matrix3, Vector3};
use tracing::trace;

/// Similarity transform `p -> scale * rotation * p + translation`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity {
    pub rotation: Matrix3<f32>,
    pub scale: f32,
    pub translation: Vector3<f32>,
}

#[cfg(test)]
impl Similarity {
    pub fn to_homogeneous(&self) -> nalgebra::Matrix4<f32> {
        let mut m = nalgebra::Matrix4::identity();
        m.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&(self.rotation * self.scale));
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        m
    }
}

/// Fits observed points onto a reference shape.
///
/// Created once with the reference points; [`ProcrustesAnalyzer::analyze`]
/// then finds the transform taking the reference onto each new point set.
pub struct ProcrustesAnalyzer {
    centroid: Vector3<f32>,
    scale: f32,
    /// Reference points with translation and scale removed.
    base: Vec<Vector3<f32>>,
    buf: Vec<Vector3<f32>>,
}

impl ProcrustesAnalyzer {
    pub fn new(reference: impl Iterator<Item = [f32; 3]>) -> Self {
        let mut base = reference.map(Vector3::from).collect::<Vec<_>>();
        let centroid = remove_translation(&mut base);
        let scale = remove_scale(&mut base);
        trace!("ref scale: {scale}, ref centroid: {centroid:?}");

        Self {
            centroid,
            scale,
            base,
            buf: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.base.len()
    }

    pub fn is_empty(&self) -> bool {
        self.base.is_empty()
    }

    /// Returns the transform that moves the reference onto `points`, or
    /// `None` if the point count does not match the reference.
    ///
    /// Reflections and non-uniform scaling are not recovered.
    pub fn analyze(&mut self, points: impl Iterator<Item = [f32; 3]>) -> Option<Similarity> {
        self.buf.clear();
        self.buf.extend(points.map(Vector3::from));
        if self.buf.len() != self.base.len() || self.base.is_empty() {
            return None;
        }

        let centroid = remove_translation(&mut self.buf);
        let scale = remove_scale(&mut self.buf);

        // Collapsed data carries no orientation.
        let rotation = if scale == 0. {
            Matrix3::identity()
        } else {
            self.compute_rotation()
        };

        let scale = scale / self.scale;
        let translation = centroid - rotation * self.centroid * scale;
        Some(Similarity {
            rotation,
            scale,
            translation,
        })
    }

    // Kabsch: rotation R minimizing |R * base - buf|.
    fn compute_rotation(&self) -> Matrix3<f32> {
        let mut covariance = Matrix3::zeros();
        for (p, q) in self.buf.iter().zip(&self.base) {
            covariance += p * q.transpose();
        }

        let svd = covariance.svd(true, true);
        let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
            return Matrix3::identity();
        };
        let d = (u * v_t).determinant().signum();
        let d_mat = Matrix3::from_diagonal(&Vector3::new(1., 1., d));

        u * d_mat * v_t
    }
}

fn remove_translation(points: &mut [Vector3<f32>]) -> Vector3<f32> {
    if points.is_empty() {
        return Vector3::zeros();
    }
    let centroid = points.iter().sum::<Vector3<f32>>() / points.len() as f32;
    for point in points.iter_mut() {
        *point -= centroid;
    }
    centroid
}

// RMS distance to the origin; assumes the centroid was removed.
fn remove_scale(points: &mut [Vector3<f32>]) -> f32 {
    if points.is_empty() {
        return 0.;
    }
    let scale = (points.iter().map(|p| p.norm_squared()).sum::<f32>() / points.len() as f32).sqrt();
    if scale > 0. {
        for point in points.iter_mut() {
            *point /= scale;
        }
    }
    scale
}
