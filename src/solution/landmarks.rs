use super::model::{Session, initialize_model};
use super::roi::Roi;
use anyhow::{Error, Result};
use image::RgbaImage;
use ort::session::SessionOutputs;
use ort::value::Tensor;
use std::path::Path;
use tracing::{Level, span, trace};

const SIZE: u32 = 192;

pub const NUM_MESH_LANDMARKS: usize = 468;
pub const NUM_IRIS_LANDMARKS: usize = 5;

// Outer eye corners, on the image's left and right in an upright face.
pub const LEFT_EYE_OUTER: usize = 33;
pub const RIGHT_EYE_OUTER: usize = 263;
// Eye contour points averaged to give the iris points a depth.
const LEFT_EYE_RING: [usize; 4] = [33, 133, 159, 145];
const RIGHT_EYE_RING: [usize; 4] = [263, 362, 386, 374];

/// Which flavour of the face mesh network to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LandmarkModel {
    /// 468 points.
    Mesh,
    /// 468 points plus 5 per iris.
    Attention,
}

impl LandmarkModel {
    pub fn for_refinement(refine: bool) -> Self {
        if refine { Self::Attention } else { Self::Mesh }
    }

    fn file(&self) -> &'static str {
        match self {
            Self::Mesh => "mediapipe_face_landmark.onnx",
            Self::Attention => "mediapipe_face_landmark_with_attention.onnx",
        }
    }

    fn mesh_output(&self) -> &'static str {
        match self {
            Self::Mesh => "conv2d_21",
            Self::Attention => "output_mesh_identity",
        }
    }

    fn score_output(&self) -> &'static str {
        match self {
            Self::Mesh => "conv2d_31",
            Self::Attention => "conv_faceflag",
        }
    }

    pub fn num_landmarks(&self) -> usize {
        match self {
            Self::Mesh => NUM_MESH_LANDMARKS,
            Self::Attention => NUM_MESH_LANDMARKS + 2 * NUM_IRIS_LANDMARKS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FaceLandmarks {
    /// Image pixel coordinates; z shares the scale of x.
    pub points: Vec<[f32; 3]>,
    /// Probability the region still contains a face.
    pub presence: f32,
}

impl FaceLandmarks {
    /// Region for tracking this face into the next frame.
    pub fn roi(&self) -> Option<Roi> {
        Roi::from_landmarks(
            &self.points[..NUM_MESH_LANDMARKS.min(self.points.len())],
            LEFT_EYE_OUTER,
            RIGHT_EYE_OUTER,
        )
    }
}

pub struct FaceLandmarker {
    model: Session,
    variant: LandmarkModel,
}

impl FaceLandmarker {
    pub fn new(model_dir: &Path, variant: LandmarkModel, threads: usize) -> Result<FaceLandmarker> {
        Ok(FaceLandmarker {
            model: initialize_model(model_dir, variant.file(), threads)?,
            variant,
        })
    }

    pub fn variant(&self) -> LandmarkModel {
        self.variant
    }

    pub fn run(&self, img: &RgbaImage, roi: &Roi) -> Result<FaceLandmarks> {
        let span = span!(Level::DEBUG, "face_landmarker");
        let _guard = span.enter();

        let input = Tensor::from_array(roi.crop_tensor(img, SIZE, (0., 1.)))?;
        let outputs = self.model.run(ort::inputs!["input_1" => input]?)?;

        let landmarks = self.extract_results(&outputs, roi)?;
        trace!("Landmark presence {:.2}", landmarks.presence);
        Ok(landmarks)
    }

    fn extract_results(&self, outputs: &SessionOutputs, roi: &Roi) -> Result<FaceLandmarks> {
        let mesh = outputs[self.variant.mesh_output()].try_extract_tensor::<f32>()?;
        let mesh = mesh.iter().copied().collect::<Vec<_>>();
        if mesh.len() < NUM_MESH_LANDMARKS * 3 {
            return Err(Error::msg(format!(
                "Landmark output too short: {} values",
                mesh.len()
            )));
        }

        let flag = outputs[self.variant.score_output()].try_extract_tensor::<f32>()?;
        let presence = flag
            .iter()
            .next()
            .map(|f| sigmoid(*f))
            .ok_or_else(|| Error::msg("Empty face flag output"))?;

        let mut raw = Vec::with_capacity(self.variant.num_landmarks());
        raw.extend(
            mesh.chunks_exact(3)
                .take(NUM_MESH_LANDMARKS)
                .map(|c| [c[0], c[1], c[2]]),
        );

        if self.variant == LandmarkModel::Attention {
            let left = outputs["output_left_iris"].try_extract_tensor::<f32>()?;
            let right = outputs["output_right_iris"].try_extract_tensor::<f32>()?;
            let left = left.iter().copied().collect::<Vec<_>>();
            let right = right.iter().copied().collect::<Vec<_>>();
            let left_z = mean_depth(&raw, &LEFT_EYE_RING);
            let right_z = mean_depth(&raw, &RIGHT_EYE_RING);
            raw.extend(iris_points(&left, left_z)?);
            raw.extend(iris_points(&right, right_z)?);
        }

        Ok(FaceLandmarks {
            points: to_image_space(&raw, roi),
            presence,
        })
    }
}

fn iris_points(values: &[f32], z: f32) -> Result<Vec<[f32; 3]>> {
    if values.len() < NUM_IRIS_LANDMARKS * 2 {
        return Err(Error::msg(format!(
            "Iris output too short: {} values",
            values.len()
        )));
    }
    Ok(values
        .chunks_exact(2)
        .take(NUM_IRIS_LANDMARKS)
        .map(|c| [c[0], c[1], z])
        .collect())
}

fn mean_depth(points: &[[f32; 3]], idxs: &[usize]) -> f32 {
    idxs.iter().map(|&i| points[i][2]).sum::<f32>() / idxs.len() as f32
}

/// Maps crop-space landmarks back into the source image.
fn to_image_space(raw: &[[f32; 3]], roi: &Roi) -> Vec<[f32; 3]> {
    let scale = roi.scale(SIZE);
    raw.iter()
        .map(|[x, y, z]| {
            let p = roi.to_image(*x, *y, SIZE);
            [p.x, p.y, z * scale]
        })
        .collect()
}

fn sigmoid(x: f32) -> f32 {
    1. / (1. + (-x).exp())
}
