use super::detection::FaceDetector;
use super::geometry::{GeometryEstimator, PerspectiveParams};
use super::landmarks::{FaceLandmarker, LandmarkModel};
use super::roi::Roi;
use super::{DetectionResult, FaceSolution};
use crate::options::SolutionOptions;
use anyhow::Result;
use image::{RgbaImage, imageops};
use std::path::PathBuf;
use tracing::{Level, debug, error, info, span, trace};

pub struct SolutionConfig {
    /// Directory holding the onnx models.
    pub model_dir: PathBuf,
    /// Canonical face OBJ, vertices in landmark order.
    pub canonical_model: PathBuf,
    pub threads: usize,
}

/// Face detection, landmark tracking and pose estimation in one place.
pub struct MediapipeSolution {
    config: SolutionConfig,
    options: SolutionOptions,
    detector: FaceDetector,
    landmarker: FaceLandmarker,
    geometry: GeometryEstimator,
    /// Regions carried over from the previous frame's landmarks.
    tracked: Vec<Roi>,
}

impl MediapipeSolution {
    pub fn new(config: SolutionConfig, options: SolutionOptions) -> Result<Self> {
        let span = span!(Level::INFO, "MediapipeSolution#new");
        let _guard = span.enter();

        let options = options.sanitized();
        let detector = FaceDetector::new(&config.model_dir, config.threads)?;
        let landmarker = FaceLandmarker::new(
            &config.model_dir,
            LandmarkModel::for_refinement(options.refine_landmarks),
            config.threads,
        )?;
        let geometry = GeometryEstimator::from_obj(&config.canonical_model, PerspectiveParams::default())?;
        info!("Face solution ready");

        Ok(Self {
            config,
            options,
            detector,
            landmarker,
            geometry,
            tracked: Vec::new(),
        })
    }

    fn swap_landmarker(&mut self, variant: LandmarkModel) {
        match FaceLandmarker::new(&self.config.model_dir, variant, self.config.threads) {
            Ok(landmarker) => {
                debug!("Switched landmark model to {variant:?}");
                self.landmarker = landmarker;
            }
            Err(e) => error!("Failed to load {variant:?} landmark model, keeping current: {e:?}"),
        }
    }

    fn regions(&self, img: &RgbaImage) -> Result<Vec<Roi>> {
        let max = self.options.max_num_faces as usize;
        let detected = if needs_detection(self.tracked.len(), max) {
            self.detector
                .run(img, self.options.min_detection_confidence, max)?
                .iter()
                .map(|f| f.roi())
                .collect::<Vec<_>>()
        } else {
            Vec::new()
        };
        Ok(merge_regions(&self.tracked, &detected, max))
    }
}

impl FaceSolution for MediapipeSolution {
    fn set_options(&mut self, options: &SolutionOptions) {
        let options = options.sanitized();
        let variant = LandmarkModel::for_refinement(options.refine_landmarks);
        if variant != self.landmarker.variant() {
            self.swap_landmarker(variant);
        }
        retain_tracked(&mut self.tracked, &self.options, &options);
        self.options = options;
    }

    fn send(&mut self, image: RgbaImage) -> Result<DetectionResult> {
        let span = span!(Level::DEBUG, "mediapipe_solution");
        let _guard = span.enter();

        let image = if self.options.selfie_mode {
            imageops::flip_horizontal(&image)
        } else {
            image
        };

        let regions = self.regions(&image)?;
        let mut tracked = Vec::with_capacity(regions.len());
        let mut multi_face_geometry = Vec::new();

        for roi in regions {
            let landmarks = self.landmarker.run(&image, &roi)?;
            if landmarks.presence < self.options.min_tracking_confidence {
                trace!("Lost face, presence {:.2}", landmarks.presence);
                continue;
            }

            if let Some(next) = landmarks.roi() {
                if is_duplicate(&tracked, &next) {
                    trace!("Two regions converged on one face, dropping {next:?}");
                    continue;
                }
                tracked.push(next);
            }

            if self.options.enable_face_geometry {
                if let Some(geometry) =
                    self.geometry
                        .estimate(&landmarks.points, image.width(), image.height())
                {
                    multi_face_geometry.push(geometry);
                }
            }
        }

        self.tracked = tracked;

        Ok(DetectionResult {
            image,
            multi_face_geometry,
        })
    }
}

/// Detection only runs while there is room for more faces.
fn needs_detection(tracked: usize, max: usize) -> bool {
    tracked < max
}

/// Drops tracking state an options change invalidates. Mirroring moves
/// every face and a different landmark model has its own regions.
fn retain_tracked(tracked: &mut Vec<Roi>, old: &SolutionOptions, new: &SolutionOptions) {
    if old.selfie_mode != new.selfie_mode || old.refine_landmarks != new.refine_landmarks {
        tracked.clear();
    }
    tracked.truncate(new.max_num_faces as usize);
}

fn is_duplicate(regions: &[Roi], roi: &Roi) -> bool {
    regions
        .iter()
        .any(|r| (r.center - roi.center).norm() < r.size.max(roi.size) / 2.)
}

/// Tracked regions first, then detections, skipping any that overlap a
/// region already taken.
fn merge_regions(tracked: &[Roi], detected: &[Roi], max: usize) -> Vec<Roi> {
    let mut regions = Vec::with_capacity(max);
    for roi in tracked.iter().chain(detected) {
        if regions.len() >= max {
            break;
        }
        if !is_duplicate(&regions, roi) {
            regions.push(*roi);
        }
    }
    regions
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Point2;

    fn roi(x: f32, y: f32) -> Roi {
        Roi {
            center: Point2::new(x, y),
            size: 40.,
            rotation: 0.,
        }
    }

    #[test]
    fn test_merge_prefers_tracked() {
        let tracked = [roi(50., 50.)];
        let detected = [roi(55., 52.), roi(200., 50.)];

        let merged = merge_regions(&tracked, &detected, 4);
        assert_eq!(merged, vec![roi(50., 50.), roi(200., 50.)]);
    }

    #[test]
    fn test_merge_respects_max() {
        let detected = [roi(0., 0.), roi(100., 0.), roi(200., 0.)];
        assert_eq!(merge_regions(&[], &detected, 2).len(), 2);
        assert_eq!(merge_regions(&detected, &[], 1), vec![roi(0., 0.)]);
    }

    #[test]
    fn test_converged_tracks_collapse() {
        let tracked = [roi(50., 50.), roi(52., 49.), roi(300., 50.)];
        assert_eq!(
            merge_regions(&tracked, &[], 4),
            vec![roi(50., 50.), roi(300., 50.)]
        );
    }

    #[test]
    fn test_detection_only_with_room() {
        assert!(needs_detection(0, 1));
        assert!(needs_detection(1, 2));
        assert!(!needs_detection(1, 1));
        assert!(!needs_detection(3, 2));
    }

    #[test]
    fn test_full_tracking_skips_detector_output() {
        let tracked = [roi(0., 0.), roi(100., 0.)];
        let max = 2;
        assert!(!needs_detection(tracked.len(), max));
        assert_eq!(merge_regions(&tracked, &[], max), tracked.to_vec());
    }

    #[test]
    fn test_mirroring_clears_tracking() {
        let old = SolutionOptions::default();
        let new = SolutionOptions {
            selfie_mode: !old.selfie_mode,
            ..old
        };
        let mut tracked = vec![roi(0., 0.)];
        retain_tracked(&mut tracked, &old, &new);
        assert!(tracked.is_empty());
    }

    #[test]
    fn test_refinement_clears_tracking() {
        let old = SolutionOptions::default();
        let new = SolutionOptions {
            refine_landmarks: !old.refine_landmarks,
            ..old
        };
        let mut tracked = vec![roi(0., 0.)];
        retain_tracked(&mut tracked, &old, &new);
        assert!(tracked.is_empty());
    }

    #[test]
    fn test_other_changes_keep_tracking() {
        let old = SolutionOptions {
            max_num_faces: 3,
            ..Default::default()
        };
        let mut tracked = vec![roi(0., 0.), roi(100., 0.), roi(200., 0.)];

        let looser = SolutionOptions {
            min_detection_confidence: 0.2,
            ..old
        };
        retain_tracked(&mut tracked, &old, &looser);
        assert_eq!(tracked.len(), 3);

        let fewer = SolutionOptions {
            max_num_faces: 1,
            ..looser
        };
        retain_tracked(&mut tracked, &looser, &fewer);
        assert_eq!(tracked, vec![roi(0., 0.)]);
    }
}
