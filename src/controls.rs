use crate::options::{CONFIDENCE_STEP, MAX_NUM_FACES_RANGE, SolutionOptions};
use crate::solution::FaceSolution;
use tracing::{debug, info};

pub const TITLE: &str = "MediaPipe + wgpu";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleField {
    SelfieMode,
    FaceGeometry,
    RefineLandmarks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliderField {
    MaxNumFaces,
    MinDetectionConfidence,
    MinTrackingConfidence,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Control {
    StaticText(&'static str),
    Fps,
    Source,
    Toggle {
        title: &'static str,
        field: ToggleField,
    },
    Slider {
        title: &'static str,
        field: SliderField,
        range: (f32, f32),
        step: f32,
    },
}

impl Control {
    pub fn title(&self) -> &'static str {
        match self {
            Self::StaticText(text) => *text,
            Self::Fps => "FPS",
            Self::Source => "Source",
            Self::Toggle { title, .. } | Self::Slider { title, .. } => *title,
        }
    }

    pub fn is_adjustable(&self) -> bool {
        matches!(self, Self::Source | Self::Toggle { .. } | Self::Slider { .. })
    }
}

fn default_controls() -> Vec<Control> {
    vec![
        Control::StaticText(TITLE),
        Control::Fps,
        Control::Toggle {
            title: "Selfie Mode",
            field: ToggleField::SelfieMode,
        },
        Control::Toggle {
            title: "Face Transform",
            field: ToggleField::FaceGeometry,
        },
        Control::Source,
        Control::Slider {
            title: "Max Number of Faces",
            field: SliderField::MaxNumFaces,
            range: (MAX_NUM_FACES_RANGE.0 as f32, MAX_NUM_FACES_RANGE.1 as f32),
            step: 1.,
        },
        Control::Toggle {
            title: "Refine Landmarks",
            field: ToggleField::RefineLandmarks,
        },
        Control::Slider {
            title: "Min Detection Confidence",
            field: SliderField::MinDetectionConfidence,
            range: (0., 1.),
            step: CONFIDENCE_STEP,
        },
        Control::Slider {
            title: "Min Tracking Confidence",
            field: SliderField::MinTrackingConfidence,
            range: (0., 1.),
            step: CONFIDENCE_STEP,
        },
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanelInput {
    Up,
    Down,
    Decrease,
    Increase,
    Toggle,
    Quit,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PanelEvent {
    Changed(SolutionOptions),
    /// Index into the panel's source list.
    SourceChanged(usize),
    Quit,
}

/// The control panel's state: the option values plus which row has focus.
pub struct ControlPanel {
    controls: Vec<Control>,
    options: SolutionOptions,
    selected: usize,
    sources: Vec<String>,
    active_source: usize,
}

impl ControlPanel {
    /// `sources` are the labels of the frame sources to pick from,
    /// `active_source` the one currently feeding frames.
    pub fn new(options: SolutionOptions, sources: Vec<String>, active_source: usize) -> Self {
        let controls = default_controls();
        let selected = controls
            .iter()
            .position(Control::is_adjustable)
            .unwrap_or(0);
        Self {
            controls,
            options: options.sanitized(),
            selected,
            sources,
            active_source,
        }
    }

    pub fn controls(&self) -> &[Control] {
        &self.controls
    }

    pub fn options(&self) -> &SolutionOptions {
        &self.options
    }

    pub fn selected(&self) -> usize {
        self.selected
    }

    pub fn active_source(&self) -> usize {
        self.active_source
    }

    /// Points the picker back at `idx`, e.g. after a switch failed.
    pub fn set_active_source(&mut self, idx: usize) {
        if idx < self.sources.len() {
            self.active_source = idx;
        }
    }

    pub fn handle(&mut self, input: PanelInput) -> Option<PanelEvent> {
        match input {
            PanelInput::Quit => return Some(PanelEvent::Quit),
            PanelInput::Up => self.move_selection(-1),
            PanelInput::Down => self.move_selection(1),
            PanelInput::Decrease => return self.adjust(-1.),
            PanelInput::Increase => return self.adjust(1.),
            PanelInput::Toggle => {
                if matches!(self.controls[self.selected], Control::Toggle { .. }) {
                    return self.adjust(1.);
                }
            }
        }
        None
    }

    fn move_selection(&mut self, dir: isize) {
        let len = self.controls.len() as isize;
        let mut idx = self.selected as isize;
        for _ in 0..len {
            idx = (idx + dir).rem_euclid(len);
            if self.controls[idx as usize].is_adjustable() {
                self.selected = idx as usize;
                return;
            }
        }
    }

    /// Applies one step to the focused control. Returns the full options
    /// when a value actually changed.
    fn adjust(&mut self, dir: f32) -> Option<PanelEvent> {
        if matches!(self.controls[self.selected], Control::Source) {
            return self.cycle_source(dir);
        }

        let before = self.options;
        match &self.controls[self.selected] {
            Control::Toggle { field, .. } => match field {
                ToggleField::SelfieMode => self.options.selfie_mode = !self.options.selfie_mode,
                ToggleField::FaceGeometry => {
                    self.options.enable_face_geometry = !self.options.enable_face_geometry
                }
                ToggleField::RefineLandmarks => {
                    self.options.refine_landmarks = !self.options.refine_landmarks
                }
            },
            Control::Slider { field, step, .. } => {
                let delta = dir * step;
                match field {
                    SliderField::MaxNumFaces => {
                        let n = if dir < 0. {
                            self.options.max_num_faces.saturating_sub(1)
                        } else {
                            self.options.max_num_faces + 1
                        };
                        self.options.set_max_num_faces(n);
                    }
                    SliderField::MinDetectionConfidence => self
                        .options
                        .set_min_detection_confidence(self.options.min_detection_confidence + delta),
                    SliderField::MinTrackingConfidence => self
                        .options
                        .set_min_tracking_confidence(self.options.min_tracking_confidence + delta),
                }
            }
            _ => {}
        }

        if self.options == before {
            return None;
        }
        debug!("{} -> {}", self.controls[self.selected].title(), self.value(self.selected, 0.));
        Some(PanelEvent::Changed(self.options))
    }

    fn cycle_source(&mut self, dir: f32) -> Option<PanelEvent> {
        let len = self.sources.len() as isize;
        if len < 2 {
            return None;
        }
        let step = if dir < 0. { -1 } else { 1 };
        self.active_source = (self.active_source as isize + step).rem_euclid(len) as usize;
        debug!("Source -> {}", self.sources[self.active_source]);
        Some(PanelEvent::SourceChanged(self.active_source))
    }

    /// Display value for the control at `idx`.
    pub fn value(&self, idx: usize, fps: f32) -> String {
        let opts = &self.options;
        match &self.controls[idx] {
            Control::StaticText(_) => String::new(),
            Control::Fps => format!("{fps:.1}"),
            Control::Source => self
                .sources
                .get(self.active_source)
                .cloned()
                .unwrap_or_default(),
            Control::Toggle { field, .. } => {
                let on = match field {
                    ToggleField::SelfieMode => opts.selfie_mode,
                    ToggleField::FaceGeometry => opts.enable_face_geometry,
                    ToggleField::RefineLandmarks => opts.refine_landmarks,
                };
                if on { "on" } else { "off" }.to_string()
            }
            Control::Slider { field, .. } => match field {
                SliderField::MaxNumFaces => opts.max_num_faces.to_string(),
                SliderField::MinDetectionConfidence => {
                    format!("{:.2}", opts.min_detection_confidence)
                }
                SliderField::MinTrackingConfidence => format!("{:.2}", opts.min_tracking_confidence),
            },
        }
    }
}

/// How the raw input is presented next to the rendered output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InputView {
    pub mirrored: bool,
}

/// Pushes a complete options record to the solution and mirrors the input
/// view to match selfie mode.
pub fn apply_options<S: FaceSolution + ?Sized>(
    options: &SolutionOptions,
    solution: &mut S,
    view: &mut InputView,
) {
    info!("Options changed: {options:?}");
    view.mirrored = options.selfie_mode;
    solution.set_options(options);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solution::testing::ScriptedSolution;

    fn panel() -> ControlPanel {
        ControlPanel::new(SolutionOptions::default(), vec!["Image: test.png".to_string()], 0)
    }

    fn select(panel: &mut ControlPanel, title: &str) {
        while panel.controls()[panel.selected()].title() != title {
            panel.handle(PanelInput::Down);
        }
    }

    fn changed(event: Option<PanelEvent>) -> SolutionOptions {
        match event {
            Some(PanelEvent::Changed(opts)) => opts,
            other => panic!("expected change, got {other:?}"),
        }
    }

    #[test]
    fn test_controls_in_order() {
        let titles = panel()
            .controls()
            .iter()
            .map(Control::title)
            .collect::<Vec<_>>();
        assert_eq!(
            titles,
            vec![
                TITLE,
                "FPS",
                "Selfie Mode",
                "Face Transform",
                "Source",
                "Max Number of Faces",
                "Refine Landmarks",
                "Min Detection Confidence",
                "Min Tracking Confidence",
            ]
        );
    }

    #[test]
    fn test_selection_skips_static_rows() {
        let mut panel = panel();
        assert_eq!(panel.controls()[panel.selected()].title(), "Selfie Mode");

        panel.handle(PanelInput::Up);
        assert_eq!(panel.controls()[panel.selected()].title(), "Min Tracking Confidence");

        panel.handle(PanelInput::Down);
        panel.handle(PanelInput::Down);
        panel.handle(PanelInput::Down);
        assert_eq!(panel.controls()[panel.selected()].title(), "Source");
        panel.handle(PanelInput::Down);
        assert_eq!(panel.controls()[panel.selected()].title(), "Max Number of Faces");
    }

    #[test]
    fn test_toggle_selfie_mode() {
        let mut panel = panel();
        let opts = changed(panel.handle(PanelInput::Toggle));
        assert!(!opts.selfie_mode);
        assert_eq!(panel.value(panel.selected(), 0.), "off");
    }

    #[test]
    fn test_max_faces_clamped() {
        let mut panel = panel();
        select(&mut panel, "Max Number of Faces");

        assert_eq!(panel.handle(PanelInput::Decrease), None);
        for expected in 2..=4 {
            assert_eq!(changed(panel.handle(PanelInput::Increase)).max_num_faces, expected);
        }
        assert_eq!(panel.handle(PanelInput::Increase), None);
        // space only flips toggles
        assert_eq!(panel.handle(PanelInput::Toggle), None);
    }

    #[test]
    fn test_confidence_steps_by_hundredths() {
        let mut panel = panel();
        select(&mut panel, "Min Detection Confidence");

        for _ in 0..3 {
            panel.handle(PanelInput::Increase);
        }
        assert_eq!(panel.options().min_detection_confidence, 0.53);
        assert_eq!(panel.value(panel.selected(), 0.), "0.53");

        for _ in 0..100 {
            panel.handle(PanelInput::Decrease);
        }
        assert_eq!(panel.options().min_detection_confidence, 0.);
    }

    fn cameras_and_image() -> ControlPanel {
        let sources = ["Camera: front", "Camera: usb", "Image: test.png"]
            .map(String::from)
            .to_vec();
        let mut panel = ControlPanel::new(SolutionOptions::default(), sources, 0);
        select(&mut panel, "Source");
        panel
    }

    #[test]
    fn test_source_picker_cycles() {
        let mut panel = cameras_and_image();
        assert_eq!(panel.value(panel.selected(), 0.), "Camera: front");

        assert_eq!(panel.handle(PanelInput::Increase), Some(PanelEvent::SourceChanged(1)));
        assert_eq!(panel.handle(PanelInput::Increase), Some(PanelEvent::SourceChanged(2)));
        assert_eq!(panel.value(panel.selected(), 0.), "Image: test.png");
        // wraps around both ways
        assert_eq!(panel.handle(PanelInput::Increase), Some(PanelEvent::SourceChanged(0)));
        assert_eq!(panel.handle(PanelInput::Decrease), Some(PanelEvent::SourceChanged(2)));
        assert_eq!(panel.active_source(), 2);
        assert_eq!(*panel.options(), SolutionOptions::default());
    }

    #[test]
    fn test_single_source_does_not_cycle() {
        let mut panel = panel();
        select(&mut panel, "Source");
        assert_eq!(panel.handle(PanelInput::Increase), None);
        assert_eq!(panel.handle(PanelInput::Decrease), None);
        assert_eq!(panel.value(panel.selected(), 0.), "Image: test.png");
    }

    #[test]
    fn test_failed_switch_reverts() {
        let mut panel = cameras_and_image();
        panel.handle(PanelInput::Increase);
        panel.set_active_source(0);
        assert_eq!(panel.value(panel.selected(), 0.), "Camera: front");
        // out of range is ignored
        panel.set_active_source(7);
        assert_eq!(panel.active_source(), 0);
    }

    #[test]
    fn test_quit() {
        assert_eq!(panel().handle(PanelInput::Quit), Some(PanelEvent::Quit));
    }

    #[test]
    fn test_selfie_toggle_updates_solution_and_view_together() {
        let mut solution = ScriptedSolution::default();
        let log = solution.options_log.clone();
        let mut view = InputView { mirrored: true };
        let mut panel = panel();

        let opts = changed(panel.handle(PanelInput::Toggle));
        apply_options(&opts, &mut solution, &mut view);

        assert!(!view.mirrored);
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0], opts);
        assert!(!log[0].selfie_mode);
    }

    #[test]
    fn test_every_change_sends_full_options() {
        let mut solution = ScriptedSolution::default();
        let log = solution.options_log.clone();
        let mut view = InputView::default();
        let mut panel = panel();

        select(&mut panel, "Refine Landmarks");
        let opts = changed(panel.handle(PanelInput::Increase));
        apply_options(&opts, &mut solution, &mut view);

        let sent = log.lock().unwrap()[0];
        assert!(sent.refine_landmarks);
        assert!(sent.selfie_mode);
        assert_eq!(sent.max_num_faces, 1);
        assert!(view.mirrored);
    }
}
