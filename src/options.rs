/// Runtime settings for the face solution.
///
/// Mutated by the control panel and pushed to the solution as a whole on
/// every change.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolutionOptions {
    pub selfie_mode: bool,
    pub enable_face_geometry: bool,
    pub max_num_faces: u32,
    pub refine_landmarks: bool,
    pub min_detection_confidence: f32,
    pub min_tracking_confidence: f32,
}

pub const MAX_NUM_FACES_RANGE: (u32, u32) = (1, 4);
pub const CONFIDENCE_STEP: f32 = 1. / CONFIDENCE_STEPS;
const CONFIDENCE_STEPS: f32 = 100.;

impl Default for SolutionOptions {
    fn default() -> Self {
        Self {
            selfie_mode: true,
            enable_face_geometry: true,
            max_num_faces: 1,
            refine_landmarks: false,
            min_detection_confidence: 0.5,
            min_tracking_confidence: 0.5,
        }
    }
}

impl SolutionOptions {
    pub fn set_max_num_faces(&mut self, n: u32) {
        self.max_num_faces = n.clamp(MAX_NUM_FACES_RANGE.0, MAX_NUM_FACES_RANGE.1);
    }

    pub fn set_min_detection_confidence(&mut self, c: f32) {
        self.min_detection_confidence = snap_confidence(c);
    }

    pub fn set_min_tracking_confidence(&mut self, c: f32) {
        self.min_tracking_confidence = snap_confidence(c);
    }

    /// Copy with every field forced into its valid range.
    pub fn sanitized(mut self) -> Self {
        self.set_max_num_faces(self.max_num_faces);
        self.set_min_detection_confidence(self.min_detection_confidence);
        self.set_min_tracking_confidence(self.min_tracking_confidence);
        self
    }
}

// Sliders move in hundredths; rounding keeps repeated steps from drifting.
fn snap_confidence(c: f32) -> f32 {
    if c.is_nan() {
        return 0.;
    }
    (c.clamp(0., 1.) * CONFIDENCE_STEPS).round() / CONFIDENCE_STEPS
}
