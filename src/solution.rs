use crate::options::SolutionOptions;
use anyhow::{Error, Result};
use image::RgbaImage;
use nalgebra::Matrix4;
use std::thread::{self, JoinHandle};
use tracing::{Level, debug, error, span};

pub mod detection;
pub mod geometry;
pub mod landmarks;
pub mod mediapipe;
mod model;
pub mod procrustes;
pub mod roi;

pub use mediapipe::MediapipeSolution;

/// Turns frames into face geometry.
///
/// `send` processes exactly one frame and returns its result; callers must
/// not request another frame before it returns.
pub trait FaceSolution {
    fn set_options(&mut self, options: &SolutionOptions);
    fn send(&mut self, image: RgbaImage) -> Result<DetectionResult>;
}

impl<S: FaceSolution + ?Sized> FaceSolution for Box<S> {
    fn set_options(&mut self, options: &SolutionOptions) {
        (**self).set_options(options)
    }

    fn send(&mut self, image: RgbaImage) -> Result<DetectionResult> {
        (**self).send(image)
    }
}

#[derive(Debug, Clone)]
pub struct DetectionResult {
    /// The processed frame, mirrored when selfie mode is on.
    pub image: RgbaImage,
    pub multi_face_geometry: Vec<FaceGeometry>,
}

#[derive(Debug, Clone)]
pub struct FaceGeometry {
    pub pose_transform: PoseTransform,
    pub mesh: Mesh,
}

/// A 4x4 transform from canonical face space to camera space, packed
/// column-major.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseTransform {
    packed: [f32; 16],
}

impl PoseTransform {
    pub fn from_packed(packed: [f32; 16]) -> Self {
        Self { packed }
    }

    pub fn from_matrix(m: &Matrix4<f32>) -> Self {
        let mut packed = [0.; 16];
        packed.copy_from_slice(m.as_slice());
        Self::from_packed(packed)
    }

    pub fn to_matrix(&self) -> Matrix4<f32> {
        Matrix4::from_column_slice(&self.packed)
    }
}

/// Landmark vertices in canonical face space.
#[derive(Debug, Clone, Default)]
pub struct Mesh {
    pub vertices: Vec<[f32; 3]>,
}

enum Request {
    Options(SolutionOptions),
    Frame(RgbaImage),
}

/// Runs a [`FaceSolution`] on its own thread.
///
/// Frames go over one channel and results come back over another; `send`
/// blocks until the single result for its frame arrives.
pub struct SolutionWorker {
    requests: Option<flume::Sender<Request>>,
    results: flume::Receiver<Result<DetectionResult>>,
    handle: Option<JoinHandle<()>>,
}

impl SolutionWorker {
    pub fn spawn<S: FaceSolution + Send + 'static>(mut solution: S) -> Result<Self> {
        let (req_tx, req_rx) = flume::unbounded::<Request>();
        let (res_tx, res_rx) = flume::bounded(1);

        let handle = thread::Builder::new()
            .name("face-solution".to_string())
            .spawn(move || {
                for req in req_rx.iter() {
                    match req {
                        Request::Options(opts) => solution.set_options(&opts),
                        Request::Frame(img) => {
                            let span = span!(Level::DEBUG, "solution_frame");
                            let _guard = span.enter();
                            if res_tx.send(solution.send(img)).is_err() {
                                break;
                            }
                        }
                    }
                }
                debug!("Solution worker exiting");
            })?;

        Ok(Self {
            requests: Some(req_tx),
            results: res_rx,
            handle: Some(handle),
        })
    }

    fn request(&self, req: Request) -> Result<()> {
        match &self.requests {
            Some(tx) => tx
                .send(req)
                .map_err(|_| Error::msg("Face solution worker has stopped")),
            None => Err(Error::msg("Face solution worker has been shut down")),
        }
    }
}

impl FaceSolution for SolutionWorker {
    fn set_options(&mut self, options: &SolutionOptions) {
        if let Err(e) = self.request(Request::Options(*options)) {
            error!("Failed to forward options: {e:?}");
        }
    }

    fn send(&mut self, image: RgbaImage) -> Result<DetectionResult> {
        self.request(Request::Frame(image))?;
        self.results
            .recv()
            .map_err(|_| Error::msg("Face solution worker dropped the frame"))?
    }
}

impl Drop for SolutionWorker {
    fn drop(&mut self) {
        drop(self.requests.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Face solution worker panicked");
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedSolution;
    use super::*;

    #[test]
    fn test_pose_transform_is_column_major() {
        let m = Matrix4::new_translation(&nalgebra::Vector3::new(1., 2., 3.));
        let pose = PoseTransform::from_matrix(&m);
        assert_eq!(&pose.packed[12..15], &[1., 2., 3.]);
        assert_eq!(pose.to_matrix(), m);
    }

    #[test]
    fn test_worker_round_trips_frames_in_order() {
        let solution = ScriptedSolution {
            poses: vec![[1.; 16]],
            ..Default::default()
        };
        let log = solution.options_log.clone();
        let mut worker = SolutionWorker::spawn(solution).unwrap();

        let opts = SolutionOptions {
            max_num_faces: 2,
            ..Default::default()
        };
        worker.set_options(&opts);

        for w in 1..4 {
            let result = worker.send(RgbaImage::new(w, 1)).unwrap();
            assert_eq!(result.image.width(), w);
            assert_eq!(result.multi_face_geometry.len(), 1);
        }

        drop(worker);
        assert_eq!(log.lock().unwrap().as_slice(), &[opts]);
    }
}
