use super::model::{Session, initialize_model};
use super::roi::Roi;
use anchors::{Anchor, gen_anchors};
use anyhow::{Error, Result};
use image::RgbaImage;
use nalgebra::Point2;
use ort::session::SessionOutputs;
use ort::value::Tensor;
use std::path::Path;
use tracing::{Level, span, trace};

mod anchors;

const SIZE: u32 = 128;
const MODEL_FILE: &str = "mediapipe_face_detection_short_range.onnx";
// Detections overlapping a better one by more than this are dropped.
const MAX_OVERLAP: f32 = 0.3;
const SCORE_CLIP: f32 = 100.;

/*
BlazeFace short range, run with ort.

Model Input: 1x128x128x3 f32 image, -1..1
Model Output:
- classificators: 896 raw scores, one per anchor
- regressors: 896x16; box center offset, box size, then six (x, y)
  keypoints. Keypoint 0 is the eye on the image's left, 1 the one on
  its right.
All offsets are in model input pixels relative to the anchor center.
*/
pub struct FaceDetector {
    model: Session,
    anchors: Vec<Anchor>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Face {
    pub center: Point2<f32>,
    pub w: f32,
    pub h: f32,
    pub l_eye: Point2<f32>,
    pub r_eye: Point2<f32>,
    pub confidence: f32,
}

impl Face {
    pub fn left(&self) -> f32 {
        self.center.x - self.w / 2.
    }

    pub fn right(&self) -> f32 {
        self.center.x + self.w / 2.
    }

    pub fn top(&self) -> f32 {
        self.center.y - self.h / 2.
    }

    pub fn bottom(&self) -> f32 {
        self.center.y + self.h / 2.
    }

    pub fn area(&self) -> f32 {
        self.w * self.h
    }

    /// Intersection over union, 0..1.
    pub fn overlap(&self, other: &Face) -> f32 {
        let x_min = self.left().max(other.left());
        let x_max = self.right().min(other.right());
        let y_min = self.top().max(other.top());
        let y_max = self.bottom().min(other.bottom());

        let overlap_area = if x_min < x_max && y_min < y_max {
            (x_max - x_min) * (y_max - y_min)
        } else {
            0.
        };

        let union = self.area() + other.area() - overlap_area;
        if union > 0. { overlap_area / union } else { 0. }
    }

    pub fn roi(&self) -> Roi {
        Roi::from_bounds(self.center, self.w, self.h, self.l_eye, self.r_eye)
    }
}

impl FaceDetector {
    pub fn new(model_dir: &Path, threads: usize) -> Result<FaceDetector> {
        Ok(FaceDetector {
            model: initialize_model(model_dir, MODEL_FILE, threads)?,
            anchors: gen_anchors(SIZE),
        })
    }

    pub fn run(&self, img: &RgbaImage, min_confidence: f32, max_faces: usize) -> Result<Vec<Face>> {
        let span = span!(Level::DEBUG, "face_detector");
        let _guard = span.enter();

        // Letterbox the whole frame into the model input.
        let frame = Roi {
            center: Point2::new(img.width() as f32 / 2., img.height() as f32 / 2.),
            size: img.width().max(img.height()) as f32,
            rotation: 0.,
        };
        let input = Tensor::from_array(frame.crop_tensor(img, SIZE, (-1., 1.)))?;
        let outputs = self.model.run(ort::inputs!["input" => input]?)?;

        let (scores, regressors) = extract_outputs(&outputs)?;
        let candidates = decode(&self.anchors, &scores, &regressors, min_confidence, &frame);
        let faces = suppress(candidates, max_faces);
        trace!("Detected {} faces", faces.len());

        Ok(faces)
    }
}

fn extract_outputs(outputs: &SessionOutputs) -> Result<(Vec<f32>, Vec<f32>)> {
    let regressors = outputs["regressors"].try_extract_tensor::<f32>()?;
    let classificators = outputs["classificators"].try_extract_tensor::<f32>()?;

    let scores = classificators.iter().copied().collect::<Vec<_>>();
    let regressors = regressors.iter().copied().collect::<Vec<_>>();

    if scores.len() * 16 != regressors.len() {
        return Err(Error::msg(format!(
            "Unexpected detector output sizes: {} scores, {} regressor values",
            scores.len(),
            regressors.len()
        )));
    }

    Ok((scores, regressors))
}

fn decode(anchors: &[Anchor], scores: &[f32], regressors: &[f32], min_confidence: f32, frame: &Roi) -> Vec<Face> {
    let size = SIZE as f32;
    let to_image = |x: f32, y: f32| frame.to_image(x * size, y * size, SIZE);

    anchors
        .iter()
        .zip(scores)
        .zip(regressors.chunks_exact(16))
        .filter_map(|((anchor, &raw), res)| {
            let score = sigmoid_stable(raw.clamp(-SCORE_CLIP, SCORE_CLIP));
            if score < min_confidence {
                return None;
            }

            let scale = frame.scale(SIZE);
            Some(Face {
                center: to_image(anchor.x + res[0] / size, anchor.y + res[1] / size),
                w: res[2] * scale,
                h: res[3] * scale,
                l_eye: to_image(anchor.x + res[4] / size, anchor.y + res[5] / size),
                r_eye: to_image(anchor.x + res[6] / size, anchor.y + res[7] / size),
                confidence: score,
            })
        })
        .collect()
}

fn suppress(mut candidates: Vec<Face>, max_faces: usize) -> Vec<Face> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut results: Vec<Face> = Vec::new();
    for face in candidates {
        if results.len() >= max_faces {
            break;
        }
        if results.iter().all(|kept| kept.overlap(&face) <= MAX_OVERLAP) {
            results.push(face);
        }
    }

    results
}

fn sigmoid_stable(x: f32) -> f32 {
    if x >= 0. {
        1. / (1. + (-x).exp())
    } else {
        x.exp() / (1. + x.exp())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn face(x: f32, y: f32, size: f32, confidence: f32) -> Face {
        Face {
            center: Point2::new(x, y),
            w: size,
            h: size,
            l_eye: Point2::new(x - size / 4., y),
            r_eye: Point2::new(x + size / 4., y),
            confidence,
        }
    }

    #[test]
    fn test_overlap() {
        let a = face(10., 10., 10., 0.9);
        assert_relative_eq!(a.overlap(&a), 1.);
        assert_relative_eq!(a.overlap(&face(100., 100., 10., 0.9)), 0.);
        // half shifted: 50 / 150
        assert_relative_eq!(a.overlap(&face(15., 10., 10., 0.9)), 1. / 3.);
    }

    #[test]
    fn test_suppress_keeps_best_and_caps() {
        let faces = vec![
            face(10., 10., 10., 0.6),
            face(11., 10., 10., 0.9),
            face(100., 100., 10., 0.7),
            face(200., 200., 10., 0.8),
        ];

        let kept = suppress(faces.clone(), 4);
        assert_eq!(kept.len(), 3);
        assert_relative_eq!(kept[0].confidence, 0.9);
        assert_relative_eq!(kept[1].confidence, 0.8);

        let capped = suppress(faces, 1);
        assert_eq!(capped.len(), 1);
        assert_relative_eq!(capped[0].confidence, 0.9);
    }

    #[test]
    fn test_decode_maps_into_image() {
        let anchors = gen_anchors(SIZE);
        let mut scores = vec![-10.; anchors.len()];
        let mut regressors = vec![0.; anchors.len() * 16];

        // anchor 0 sits at (4, 4) in model pixels
        scores[0] = 10.;
        regressors[2] = 32.;
        regressors[3] = 32.;

        // 256x256 frame: model pixels are 2 image pixels
        let frame = Roi {
            center: Point2::new(128., 128.),
            size: 256.,
            rotation: 0.,
        };
        let faces = decode(&anchors, &scores, &regressors, 0.5, &frame);
        assert_eq!(faces.len(), 1);
        assert_relative_eq!(faces[0].center, Point2::new(8., 8.), epsilon = 1e-4);
        assert_relative_eq!(faces[0].w, 64.);
        assert!(faces[0].confidence > 0.99);
    }

    #[test]
    fn test_sigmoid() {
        assert_relative_eq!(sigmoid_stable(0.), 0.5);
        assert!(sigmoid_stable(-100.) >= 0.);
        assert!(sigmoid_stable(100.) <= 1.);
    }
}
