use image::RgbaImage;
use nalgebra::{Point2, Vector2};
use ndarray::Array4;

/// A square, rotated region of interest in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Roi {
    pub center: Point2<f32>,
    pub size: f32,
    /// Clockwise angle (image coordinates, y down) of the region's x axis.
    pub rotation: f32,
}

// Padding applied around a face's tight bounds before landmarking.
const ROI_SCALE: f32 = 1.5;

impl Roi {
    /// Region around a detected face box, rotated so the eye line is level.
    pub fn from_bounds(center: Point2<f32>, w: f32, h: f32, l_eye: Point2<f32>, r_eye: Point2<f32>) -> Self {
        Self {
            center,
            size: w.max(h) * ROI_SCALE,
            rotation: eye_angle(l_eye, r_eye),
        }
    }

    /// Region enclosing a set of landmarks, used to track a face into the
    /// next frame without running detection.
    pub fn from_landmarks(points: &[[f32; 3]], l_eye: usize, r_eye: usize) -> Option<Self> {
        let first = points.first()?;
        let rotation = eye_angle(
            Point2::new(points[l_eye][0], points[l_eye][1]),
            Point2::new(points[r_eye][0], points[r_eye][1]),
        );

        // Bounds are taken in the region's rotated frame so the box stays
        // tight for tilted faces.
        let (sin, cos) = rotation.sin_cos();
        let unrotate = |p: &[f32; 3]| Vector2::new(p[0] * cos + p[1] * sin, -p[0] * sin + p[1] * cos);
        let seed = unrotate(first);
        let (mut min, mut max) = (seed, seed);
        for p in points {
            let r = unrotate(p);
            min = min.inf(&r);
            max = max.sup(&r);
        }

        let mid = (min + max) / 2.;
        let center = Point2::new(mid.x * cos - mid.y * sin, mid.x * sin + mid.y * cos);
        let extent = max - min;

        Some(Self {
            center,
            size: extent.x.max(extent.y) * ROI_SCALE,
            rotation,
        })
    }

    /// Maps a point in the `side`x`side` crop back into the source image.
    pub fn to_image(&self, x: f32, y: f32, side: u32) -> Point2<f32> {
        let lx = (x / side as f32 - 0.5) * self.size;
        let ly = (y / side as f32 - 0.5) * self.size;
        let (sin, cos) = self.rotation.sin_cos();
        Point2::new(
            self.center.x + lx * cos - ly * sin,
            self.center.y + lx * sin + ly * cos,
        )
    }

    /// Pixels per crop pixel.
    pub fn scale(&self, side: u32) -> f32 {
        self.size / side as f32
    }

    /// Samples the region into an NHWC tensor of `side`x`side`, mapping
    /// channel values from 0..=255 into `range`.
    pub fn crop_tensor(&self, img: &RgbaImage, side: u32, range: (f32, f32)) -> Array4<f32> {
        let (lo, hi) = range;
        Array4::from_shape_fn((1, side as usize, side as usize, 3), |(_, y, x, c)| {
            let p = self.to_image(x as f32 + 0.5, y as f32 + 0.5, side);
            let v = sample_bilinear(img, p.x - 0.5, p.y - 0.5, c);
            lo + v / 255. * (hi - lo)
        })
    }
}

fn eye_angle(l_eye: Point2<f32>, r_eye: Point2<f32>) -> f32 {
    let d = r_eye - l_eye;
    d.y.atan2(d.x)
}

// Out of bounds samples read as black, like zero padding.
fn sample_bilinear(img: &RgbaImage, x: f32, y: f32, c: usize) -> f32 {
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;

    let px = |xi: f32, yi: f32| -> f32 {
        if xi < 0. || yi < 0. || xi >= img.width() as f32 || yi >= img.height() as f32 {
            0.
        } else {
            img.get_pixel(xi as u32, yi as u32)[c] as f32
        }
    };

    let top = px(x0, y0) * (1. - fx) + px(x0 + 1., y0) * fx;
    let bottom = px(x0, y0 + 1.) * (1. - fx) + px(x0 + 1., y0 + 1.) * fx;
    top * (1. - fy) + bottom * fy
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use image::Rgba;
    use std::f32::consts::FRAC_PI_2;

    #[test]
    fn test_level_eyes_have_no_rotation() {
        let roi = Roi::from_bounds(
            Point2::new(50., 50.),
            20.,
            10.,
            Point2::new(40., 45.),
            Point2::new(60., 45.),
        );
        assert_relative_eq!(roi.rotation, 0.);
        assert_relative_eq!(roi.size, 30.);
    }

    #[test]
    fn test_to_image_corners() {
        let roi = Roi {
            center: Point2::new(100., 50.),
            size: 40.,
            rotation: 0.,
        };
        assert_relative_eq!(roi.to_image(0., 0., 192), Point2::new(80., 30.));
        assert_relative_eq!(roi.to_image(96., 96., 192), Point2::new(100., 50.));

        let turned = Roi {
            rotation: FRAC_PI_2,
            ..roi
        };
        // the crop's +x axis points down the source image
        let p = turned.to_image(192., 96., 192);
        assert_relative_eq!(p, Point2::new(100., 70.), epsilon = 1e-4);
    }

    #[test]
    fn test_from_landmarks_encloses_points() {
        let points = [[10., 10., 0.], [30., 10., 0.], [20., 30., 0.]];
        let roi = Roi::from_landmarks(&points, 0, 1).unwrap();
        assert_relative_eq!(roi.rotation, 0.);
        assert_relative_eq!(roi.center, Point2::new(20., 20.));
        assert_relative_eq!(roi.size, 30.);
        assert!(Roi::from_landmarks(&[], 0, 1).is_none());
    }

    #[test]
    fn test_crop_tensor_range() {
        let img = RgbaImage::from_pixel(8, 8, Rgba([255, 0, 255, 255]));
        let roi = Roi {
            center: Point2::new(4., 4.),
            size: 4.,
            rotation: 0.,
        };
        let t = roi.crop_tensor(&img, 4, (-1., 1.));
        assert_eq!(t.shape(), &[1, 4, 4, 3]);
        assert_relative_eq!(t[[0, 1, 1, 0]], 1.);
        assert_relative_eq!(t[[0, 1, 1, 1]], -1.);
    }
}
